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

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};

use crate::subprovisioner::config;
use crate::subprovisioner::csi::types::*;
use crate::subprovisioner::dispatch::job::{
    create_job, delete_job_synchronously, wait_for_job_to_succeed, JobConfig,
};
use crate::subprovisioner::k8s::client::ApiClient;
use crate::subprovisioner::k8s::pvc::PersistentVolumeClaim;
use crate::subprovisioner::logger::log_info;
use crate::subprovisioner::util::error::{invalid_argument, unknown};
use crate::subprovisioner::volume::claims::{
    find_pvc_by_uid, find_snapshot_by_uid, set_state_to, set_state_to_idle,
};
use crate::subprovisioner::volume::VolumeState;

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "controller";

/// Shell run by the cloning job. Both the source and the destination end up
/// as overlays over a common immutable ancestor; the source's path never
/// changes, and its image is replaced atomically as the last step so a
/// cancelled job cannot leave it corrupted.
const CLONING_SCRIPT: &str = r#"
set -o errexit -o pipefail -o nounset -o xtrace

source="$1"
dest="$2"
common_ancestor_relative="$3"
capacity="$4"

ln -f "${source}" "/var/backing/${common_ancestor_relative}"

qemu-img create -f qcow2 -b "${common_ancestor_relative}" -F qcow2 "${dest}" "${capacity}"

qemu-img create -f qcow2 -b "${common_ancestor_relative}" -F qcow2 "${source}.new"
mv -f "${source}.new" "${source}"

chmod a-w "/var/backing/${common_ancestor_relative}"  # should never modify this image
"#;

/// Shell run by the snapshotting job. Same atomic-replace dance as cloning.
const SNAPSHOTTING_SCRIPT: &str = r#"
set -o errexit -o pipefail -o nounset -o xtrace

pvc="$1"
snapshot="$2"

ln -f "/var/backing/${pvc}" "/var/backing/${snapshot}"

qemu-img create -f qcow2 -b "${snapshot}" -F qcow2 "/var/backing/${pvc}.new"
mv -f "/var/backing/${pvc}.new" "/var/backing/${pvc}"

chmod a-w "/var/backing/${snapshot}"  # should never modify this image
"#;

/// Shell run by the expansion job. Resizes only when the current virtual size
/// is smaller, which guards against this RPC being retried with a target the
/// image has already outgrown.
const EXPANSION_SCRIPT: &str = r#"
set -o errexit -o pipefail -o nounset -o xtrace
size="$( qemu-img info -f qcow2 --output=json "$1" | jq '.["virtual-size"]' )"
if [ "${size}" -lt "$2" ]; then
    qemu-img resize -f qcow2 "$1" "$2"
fi
"#;

/// Serves the CSI controller RPCs.
pub struct ControllerService {
    client: Arc<ApiClient>,
    image: String,
}

impl ControllerService {
    pub fn new(client: Arc<ApiClient>, image: String) -> Self {
        Self { client, image }
    }

    pub async fn create_volume(
        &self,
        req: CreateVolumeRequest,
    ) -> Result<CreateVolumeResponse, DynError> {
        let get_parameter = |key: &str| -> Result<String, DynError> {
            match req.parameters.get(key) {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => Err(invalid_argument(format!(
                    "missing/empty parameter \"{}\"",
                    key
                ))),
            }
        };

        let pvc_name = get_parameter("csi.storage.k8s.io/pvc/name")?;
        let pvc_namespace = get_parameter("csi.storage.k8s.io/pvc/namespace")?;
        let backing_pvc_name = get_parameter("backingClaimName")?;
        let backing_pvc_namespace = get_parameter("backingClaimNamespace")?;
        let backing_pvc_base_path = req
            .parameters
            .get("basePath")
            .cloned()
            .unwrap_or_default();

        let pvc = self.client.get_pvc(&pvc_namespace, &pvc_name).await?;
        let pvc_uid = pvc
            .metadata
            .uid
            .clone()
            .ok_or_else(|| unknown("claim has no uid"))?;

        let (capacity, _, max_capacity) = validate_capacity(req.capacity_range.as_ref())?;

        for capability in &req.volume_capabilities {
            if !capability.is_block() {
                return Err(invalid_argument("only block volumes are supported"));
            }
            let supported = capability
                .access_mode
                .map(AccessMode::is_supported)
                .unwrap_or(false);
            if !supported {
                return Err(invalid_argument(
                    "only access modes ReadWriteOnce, ReadWriteOncePod, and ReadOnlyMany \
                     are supported",
                ));
            }
        }

        // The cleanup finalizer goes on before any image work starts, and
        // only the deletion reaper ever takes it off. Volumes whose creation
        // fails and is abandoned are therefore still reclaimed on claim
        // deletion, even though the orchestrator never learned a volume id
        // for them.
        let patch = serde_json::json!({
            "metadata": {
                "labels": { (config::uid_label()): &pvc_uid },
                "annotations": {
                    (config::annotation("backing-pvc-name")): &backing_pvc_name,
                    (config::annotation("backing-pvc-namespace")): &backing_pvc_namespace,
                    (config::annotation("backing-pvc-base-path")): &backing_pvc_base_path,
                    (config::annotation("capacity")): capacity.to_string(),
                    (config::annotation("state")): VolumeState::Idle.as_str(),
                },
                "finalizers": [ config::cleanup_finalizer() ],
            }
        });
        self.client
            .strategic_merge_patch_pvc(&pvc_namespace, &pvc_name, &patch)
            .await?;

        log_info(
            COMPONENT,
            "creating volume",
            &[
                ("pvc", &format!("{}/{}", pvc_namespace, pvc_name)),
                ("uid", &pvc_uid),
                ("capacity", &capacity.to_string()),
            ],
        );

        let backing = BackingRef {
            pvc_name: backing_pvc_name.clone(),
            pvc_namespace: backing_pvc_namespace.clone(),
            base_path: backing_pvc_base_path.clone(),
        };

        match &req.volume_content_source {
            None => {
                self.create_volume_from_nothing(&backing, &pvc_uid, capacity)
                    .await?
            }
            Some(source) => {
                if let Some(volume) = &source.volume {
                    self.create_volume_from_volume(
                        &backing,
                        &pvc_uid,
                        capacity,
                        max_capacity,
                        &volume.volume_id,
                    )
                    .await?
                } else if let Some(snapshot) = &source.snapshot {
                    self.create_volume_from_snapshot(
                        &backing,
                        &pvc_uid,
                        capacity,
                        max_capacity,
                        &snapshot.snapshot_id,
                    )
                    .await?
                } else {
                    return Err(invalid_argument("unsupported volume content source"));
                }
            }
        }

        Ok(CreateVolumeResponse {
            volume: Volume {
                volume_id: pvc_uid,
                capacity_bytes: capacity,
                volume_context: HashMap::from([
                    ("pvcName".to_string(), pvc_name),
                    ("pvcNamespace".to_string(), pvc_namespace),
                    ("backingPvcName".to_string(), backing.pvc_name),
                    ("backingPvcNamespace".to_string(), backing.pvc_namespace),
                    ("backingPvcBasePath".to_string(), backing.base_path),
                ]),
                content_source: req.volume_content_source.clone(),
            },
        })
    }

    async fn create_volume_from_nothing(
        &self,
        backing: &BackingRef,
        pvc_uid: &str,
        capacity: i64,
    ) -> Result<(), DynError> {
        let creation_job_name = config::creation_job_name(pvc_uid);

        create_job(
            &self.client,
            &JobConfig {
                name: creation_job_name.clone(),
                namespace: backing.pvc_namespace.clone(),
                labels: creation_labels(pvc_uid),
                image: self.image.clone(),
                command: vec![
                    "qemu-img".to_string(),
                    "create".to_string(),
                    "-f".to_string(),
                    "qcow2".to_string(),
                    config::volume_image_path(pvc_uid),
                    capacity.to_string(),
                ],
                backing_pvc_name: backing.pvc_name.clone(),
                backing_pvc_base_path: backing.base_path.clone(),
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &creation_job_name, &backing.pvc_namespace).await

        // The creation Job stays around until the volume is deleted; retried
        // RPCs then re-attach to it instead of re-running the work.
    }

    async fn create_volume_from_volume(
        &self,
        backing: &BackingRef,
        dest_pvc_uid: &str,
        capacity: i64,
        max_capacity: i64,
        source_pvc_uid: &str,
    ) -> Result<(), DynError> {
        let source_pvc = find_pvc_by_uid(&self.client, source_pvc_uid).await?;
        let source_name = source_pvc.metadata.name.clone().unwrap_or_default();
        let source_namespace = source_pvc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        set_state_to(
            &self.client,
            &source_name,
            &source_namespace,
            VolumeState::Cloning,
        )
        .await?;

        let source_capacity = annotation_as_i64(&source_pvc, "capacity")
            .ok_or_else(|| unknown("failed to determine source volume capacity"))?;
        if max_capacity != 0 && source_capacity > max_capacity {
            return Err(invalid_argument(format!(
                "source volume capacity ({}) exceeds maximum capacity ({})",
                source_capacity, max_capacity
            )));
        }
        let capacity = capacity.max(source_capacity);

        let creation_job_name = config::creation_job_name(dest_pvc_uid);

        create_job(
            &self.client,
            &JobConfig {
                name: creation_job_name.clone(),
                namespace: backing.pvc_namespace.clone(),
                labels: creation_labels(dest_pvc_uid),
                image: self.image.clone(),
                command: vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    CLONING_SCRIPT.to_string(),
                    "bash".to_string(),
                    config::volume_image_path(source_pvc_uid),
                    config::volume_image_path(dest_pvc_uid),
                    config::clone_ancestor_image_name(source_pvc_uid, dest_pvc_uid),
                    capacity.to_string(),
                ],
                backing_pvc_name: backing.pvc_name.clone(),
                backing_pvc_base_path: backing.base_path.clone(),
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &creation_job_name, &backing.pvc_namespace).await?;

        set_state_to_idle(&self.client, &source_name, &source_namespace).await
    }

    async fn create_volume_from_snapshot(
        &self,
        backing: &BackingRef,
        dest_pvc_uid: &str,
        capacity: i64,
        max_capacity: i64,
        snapshot_uid: &str,
    ) -> Result<(), DynError> {
        let snapshot = find_snapshot_by_uid(&self.client, snapshot_uid).await?;

        let snapshot_size = snapshot
            .metadata
            .annotation(&config::annotation("size"))
            .and_then(|value| value.parse::<i64>().ok())
            .ok_or_else(|| unknown("failed to determine source snapshot size"))?;
        if max_capacity != 0 && snapshot_size > max_capacity {
            return Err(invalid_argument(format!(
                "source snapshot size ({}) exceeds maximum capacity ({})",
                snapshot_size, max_capacity
            )));
        }
        let capacity = capacity.max(snapshot_size);

        let creation_job_name = config::creation_job_name(dest_pvc_uid);

        create_job(
            &self.client,
            &JobConfig {
                name: creation_job_name.clone(),
                namespace: backing.pvc_namespace.clone(),
                labels: creation_labels(dest_pvc_uid),
                image: self.image.clone(),
                command: vec![
                    "qemu-img".to_string(),
                    "create".to_string(),
                    "-f".to_string(),
                    "qcow2".to_string(),
                    "-b".to_string(),
                    config::snapshot_image_name(snapshot_uid),
                    "-F".to_string(),
                    "qcow2".to_string(),
                    config::volume_image_path(dest_pvc_uid),
                    capacity.to_string(),
                ],
                backing_pvc_name: backing.pvc_name.clone(),
                backing_pvc_base_path: backing.base_path.clone(),
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &creation_job_name, &backing.pvc_namespace).await
    }

    /// Only called after the reaper removed the cleanup finalizer, at which
    /// point the image is already gone.
    pub async fn delete_volume(&self, req: DeleteVolumeRequest) -> Result<(), DynError> {
        if req.volume_id.is_empty() {
            return Err(invalid_argument("must specify volume id"));
        }
        Ok(())
    }

    pub async fn create_snapshot(
        &self,
        req: CreateSnapshotRequest,
    ) -> Result<CreateSnapshotResponse, DynError> {
        let get_parameter = |key: &str| -> Result<String, DynError> {
            match req.parameters.get(key) {
                Some(value) if !value.is_empty() => Ok(value.clone()),
                _ => Err(invalid_argument(format!(
                    "missing/empty parameter \"{}\"",
                    key
                ))),
            }
        };

        let snapshot_name = get_parameter("csi.storage.k8s.io/volumesnapshot/name")?;
        let snapshot_namespace = get_parameter("csi.storage.k8s.io/volumesnapshot/namespace")?;

        let volume_snapshot = self
            .client
            .get_volume_snapshot(&snapshot_namespace, &snapshot_name)
            .await?;
        let snapshot_uid = volume_snapshot
            .metadata
            .uid
            .clone()
            .ok_or_else(|| unknown("snapshot has no uid"))?;

        let source_pvc = find_pvc_by_uid(&self.client, &req.source_volume_id).await?;
        let source_name = source_pvc.metadata.name.clone().unwrap_or_default();
        let source_namespace = source_pvc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        set_state_to(
            &self.client,
            &source_name,
            &source_namespace,
            VolumeState::Snapshotting,
        )
        .await?;

        let backing_pvc_name = source_annotation(&source_pvc, "backing-pvc-name");
        let backing_pvc_namespace = source_annotation(&source_pvc, "backing-pvc-namespace");
        let backing_pvc_base_path = source_annotation(&source_pvc, "backing-pvc-base-path");

        let size = annotation_as_i64(&source_pvc, "capacity")
            .ok_or_else(|| unknown("failed to determine snapshot size"))?;

        let patch = serde_json::json!({
            "metadata": {
                "labels": { (config::uid_label()): &snapshot_uid },
                "annotations": {
                    (config::annotation("backing-pvc-name")): &backing_pvc_name,
                    (config::annotation("backing-pvc-namespace")): &backing_pvc_namespace,
                    (config::annotation("backing-pvc-base-path")): &backing_pvc_base_path,
                    (config::annotation("size")): size.to_string(),
                },
            }
        });
        self.client
            .merge_patch_volume_snapshot(&snapshot_namespace, &snapshot_name, &patch)
            .await?;

        log_info(
            COMPONENT,
            "snapshotting volume",
            &[
                ("pvc", &format!("{}/{}", source_namespace, source_name)),
                ("snapshot", &snapshot_uid),
            ],
        );

        let snapshotting_job_name = config::snapshotting_job_name(&snapshot_uid);
        let source_pvc_uid = source_pvc.metadata.uid.clone().unwrap_or_default();

        create_job(
            &self.client,
            &JobConfig {
                name: snapshotting_job_name.clone(),
                namespace: backing_pvc_namespace.clone(),
                labels: HashMap::from([
                    (
                        config::annotation("component"),
                        "volume-snapshotting".to_string(),
                    ),
                    (config::annotation("pvc-uid"), source_pvc_uid),
                ]),
                image: self.image.clone(),
                command: vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    SNAPSHOTTING_SCRIPT.to_string(),
                    "bash".to_string(),
                    config::volume_image_name(source_pvc.metadata.uid.as_deref().unwrap_or("")),
                    config::snapshot_image_name(&snapshot_uid),
                ],
                backing_pvc_name: backing_pvc_name.clone(),
                backing_pvc_base_path: backing_pvc_base_path.clone(),
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &snapshotting_job_name, &backing_pvc_namespace)
            .await?;

        delete_job_synchronously(&self.client, &snapshotting_job_name, &backing_pvc_namespace)
            .await?;

        set_state_to_idle(&self.client, &source_name, &source_namespace).await?;

        Ok(CreateSnapshotResponse {
            snapshot: Snapshot {
                snapshot_id: snapshot_uid,
                source_volume_id: req.source_volume_id,
                size_bytes: size,
                ready_to_use: true,
                creation_time: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            },
        })
    }

    /// Ancestor reclamation on snapshot deletion is deliberately deferred.
    pub async fn delete_snapshot(&self, req: DeleteSnapshotRequest) -> Result<(), DynError> {
        if req.snapshot_id.is_empty() {
            return Err(invalid_argument("must specify snapshot id"));
        }
        Ok(())
    }

    pub async fn expand_volume(
        &self,
        req: ControllerExpandVolumeRequest,
    ) -> Result<ControllerExpandVolumeResponse, DynError> {
        if req.volume_id.is_empty() {
            return Err(invalid_argument("must specify volume id"));
        }

        let (capacity, _, max_capacity) = validate_capacity(req.capacity_range.as_ref())?;

        let pvc = find_pvc_by_uid(&self.client, &req.volume_id).await?;
        let pvc_name = pvc.metadata.name.clone().unwrap_or_default();
        let pvc_namespace = pvc
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());

        let backing_pvc_name = source_annotation(&pvc, "backing-pvc-name");
        let backing_pvc_namespace = source_annotation(&pvc, "backing-pvc-namespace");
        let backing_pvc_base_path = source_annotation(&pvc, "backing-pvc-base-path");

        let current_capacity = annotation_as_i64(&pvc, "capacity")
            .ok_or_else(|| unknown("failed to determine current volume capacity"))?;
        if max_capacity != 0 && current_capacity > max_capacity {
            return Err(invalid_argument(format!(
                "current volume capacity ({}) exceeds maximum capacity ({})",
                current_capacity, max_capacity
            )));
        }

        if current_capacity >= capacity {
            // A retry of an expansion that already succeeded: the sidecar may
            // have failed to record the result because our two state-
            // annotation writes changed the claim's resource version under
            // it. Answer success with the current capacity.
            return Ok(ControllerExpandVolumeResponse {
                capacity_bytes: current_capacity,
                node_expansion_required: false,
            });
        }

        set_state_to(&self.client, &pvc_name, &pvc_namespace, VolumeState::Expanding).await?;

        log_info(
            COMPONENT,
            "expanding volume",
            &[
                ("pvc", &format!("{}/{}", pvc_namespace, pvc_name)),
                ("capacity", &capacity.to_string()),
            ],
        );

        let pvc_uid = pvc.metadata.uid.clone().unwrap_or_default();
        let expansion_job_name = config::expansion_job_name(&pvc_uid);

        create_job(
            &self.client,
            &JobConfig {
                name: expansion_job_name.clone(),
                namespace: backing_pvc_namespace.clone(),
                labels: HashMap::from([
                    (
                        config::annotation("component"),
                        "volume-expansion".to_string(),
                    ),
                    (config::annotation("pvc-uid"), pvc_uid.clone()),
                ]),
                image: self.image.clone(),
                command: vec![
                    "bash".to_string(),
                    "-c".to_string(),
                    EXPANSION_SCRIPT.to_string(),
                    "bash".to_string(),
                    config::volume_image_path(&pvc_uid),
                    capacity.to_string(),
                ],
                backing_pvc_name: backing_pvc_name.clone(),
                backing_pvc_base_path: backing_pvc_base_path.clone(),
            },
        )
        .await?;

        wait_for_job_to_succeed(&self.client, &expansion_job_name, &backing_pvc_namespace).await?;

        delete_job_synchronously(&self.client, &expansion_job_name, &backing_pvc_namespace)
            .await?;

        // Capacity and state go back in a single patch so observers never see
        // an expanded capacity on a non-idle volume.
        let patch = serde_json::json!({
            "metadata": {
                "annotations": {
                    (config::annotation("capacity")): capacity.to_string(),
                    (config::annotation("state")): VolumeState::Idle.as_str(),
                }
            }
        });
        self.client
            .strategic_merge_patch_pvc(&pvc_namespace, &pvc_name, &patch)
            .await?;

        Ok(ControllerExpandVolumeResponse {
            capacity_bytes: capacity,
            node_expansion_required: false,
        })
    }

    pub fn get_capabilities(&self) -> ControllerGetCapabilitiesResponse {
        ControllerGetCapabilitiesResponse {
            capabilities: vec![
                "CREATE_DELETE_VOLUME".to_string(),
                "CREATE_DELETE_SNAPSHOT".to_string(),
                "CLONE_VOLUME".to_string(),
                "EXPAND_VOLUME".to_string(),
                "SINGLE_NODE_MULTI_WRITER".to_string(),
            ],
        }
    }
}

struct BackingRef {
    pvc_name: String,
    pvc_namespace: String,
    base_path: String,
}

fn creation_labels(pvc_uid: &str) -> HashMap<String, String> {
    HashMap::from([
        (
            config::annotation("component"),
            "volume-creation".to_string(),
        ),
        (config::annotation("pvc-uid"), pvc_uid.to_string()),
    ])
}

fn source_annotation(pvc: &PersistentVolumeClaim, name: &str) -> String {
    pvc.metadata
        .annotation(&config::annotation(name))
        .unwrap_or_default()
        .to_string()
}

fn annotation_as_i64(pvc: &PersistentVolumeClaim, name: &str) -> Option<i64> {
    pvc.metadata
        .annotation(&config::annotation(name))
        .and_then(|value| value.parse::<i64>().ok())
}

/// Validates a capacity range and rounds the minimum up to the 512-byte
/// multiple qcow2 requires. Returns (capacity, min, max); max is 0 when the
/// caller did not bound the request.
pub fn validate_capacity(range: Option<&CapacityRange>) -> Result<(i64, i64, i64), DynError> {
    let range = range.ok_or_else(|| invalid_argument("must specify capacity"))?;

    let min_capacity = range.required_bytes.unwrap_or(0);
    let max_capacity = range.limit_bytes.unwrap_or(0);

    if min_capacity == 0 {
        return Err(invalid_argument("must specify minimum capacity"));
    }
    if min_capacity < 0 || max_capacity < 0 {
        return Err(invalid_argument("capacity must not be negative"));
    }
    if max_capacity != 0 && max_capacity < min_capacity {
        return Err(invalid_argument(
            "minimum capacity must not exceed maximum capacity",
        ));
    }

    let capacity = min_capacity
        .checked_add(511)
        .ok_or_else(|| invalid_argument("capacity overflows"))?
        / 512
        * 512;

    if max_capacity != 0 && max_capacity < capacity {
        return Err(invalid_argument(
            "minimum capacity rounded to a 512-byte multiple exceeds maximum capacity",
        ));
    }

    Ok((capacity, min_capacity, max_capacity))
}
