/*
 * Copyright (C) 2024 The Subprovisioner Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use sha2::{Digest, Sha256};

/// Domain prefixing every label, annotation, and finalizer owned by the driver.
pub const DOMAIN: &str = "subprovisioner.gitlab.io";

pub const VERSION: &str = "0.0.0";

/// Mount point of the backing volume inside image jobs and staging workers.
pub const BACKING_MOUNT: &str = "/var/backing";

pub fn uid_label() -> String {
    format!("{}/uid", DOMAIN)
}

pub fn cleanup_finalizer() -> String {
    format!("{}/cleanup", DOMAIN)
}

pub fn annotation(name: &str) -> String {
    format!("{}/{}", DOMAIN, name)
}

/// Path of a volume's qcow2 image as seen from inside a job or worker pod.
pub fn volume_image_path(pvc_uid: &str) -> String {
    format!("{}/pvc-{}.qcow2", BACKING_MOUNT, pvc_uid)
}

/// Name of a volume's qcow2 image relative to the backing mount.
pub fn volume_image_name(pvc_uid: &str) -> String {
    format!("pvc-{}.qcow2", pvc_uid)
}

pub fn snapshot_image_name(snapshot_uid: &str) -> String {
    format!("snapshot-{}.qcow2", snapshot_uid)
}

/// Name of the shared read-only ancestor created when cloning a volume.
pub fn clone_ancestor_image_name(source_pvc_uid: &str, dest_pvc_uid: &str) -> String {
    format!("cloned-{}-to-{}.qcow2", source_pvc_uid, dest_pvc_uid)
}

pub fn creation_job_name(pvc_uid: &str) -> String {
    format!("subprovisioner-create-{}", pvc_uid)
}

pub fn deletion_job_name(pvc_uid: &str) -> String {
    format!("subprovisioner-delete-{}", pvc_uid)
}

pub fn expansion_job_name(pvc_uid: &str) -> String {
    format!("subprovisioner-expand-{}", pvc_uid)
}

pub fn snapshotting_job_name(snapshot_uid: &str) -> String {
    format!("subprovisioner-snapshot-{}", snapshot_uid)
}

/// Name of the staging worker ReplicaSet for a (volume, node) pair.
///
/// Node object names can be up to 253 characters long and so cannot be
/// embedded in the worker name directly. The node name is hashed with SHA-256
/// instead, which also rules out collisions under adversarial node naming.
pub fn staging_worker_name(pvc_uid: &str, node_name: &str) -> String {
    let hashed = Sha256::digest(node_name.as_bytes());
    let mut hex = String::with_capacity(64);
    for byte in hashed {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("subprovisioner-stage-{}-on-{}", pvc_uid, hex)
}
