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

//! Long-lived staging workers.
//!
//! A staging worker is a single-replica ReplicaSet pinned to one node. The
//! ReplicaSet anchors the worker's lifetime outside the node driver process,
//! so a driver restart does not tear down staged volumes.

use std::collections::HashMap;
use std::error::Error;
use std::time::Duration;

use tokio::time::sleep;

use crate::subprovisioner::config;
use crate::subprovisioner::k8s::client::{
    is_already_exists_error, is_not_found_error, ApiClient,
};
use crate::subprovisioner::k8s::meta::{LabelSelector, ObjectMeta};
use crate::subprovisioner::k8s::pod::{
    Container, HostPathVolumeSource, PersistentVolumeClaimVolumeSource, PodSpec, PodTemplateSpec,
    SecurityContext, Volume, VolumeMount,
};
use crate::subprovisioner::k8s::replicaset::{ReplicaSet, ReplicaSetSpec};
use crate::subprovisioner::util::error::new_error;

type DynError = Box<dyn Error + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct WorkerConfig {
    pub name: String,
    pub namespace: String,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,

    pub node_name: String,
    pub image: String,
    pub command: Vec<String>,

    pub backing_pvc_name: String,
    pub backing_pvc_base_path: String,
}

/// Builds the worker ReplicaSet: privileged, pinned to the node, with the
/// backing volume and the kubelet plugin/pod directories mounted.
pub fn build_worker(cfg: &WorkerConfig) -> ReplicaSet {
    let pod_spec = PodSpec {
        restart_policy: None,
        node_name: Some(cfg.node_name.clone()),
        containers: vec![Container {
            name: "container".to_string(),
            image: Some(cfg.image.clone()),
            command: cfg.command.clone(),
            security_context: Some(SecurityContext {
                privileged: Some(true),
            }),
            volume_mounts: vec![
                VolumeMount {
                    name: "backing".to_string(),
                    mount_path: config::BACKING_MOUNT.to_string(),
                    sub_path: Some(cfg.backing_pvc_base_path.clone())
                        .filter(|path| !path.is_empty()),
                },
                VolumeMount {
                    name: "plugins-dir".to_string(),
                    mount_path: "/var/lib/kubelet/plugins".to_string(),
                    sub_path: None,
                },
                VolumeMount {
                    name: "pods-dir".to_string(),
                    mount_path: "/var/lib/kubelet/pods".to_string(),
                    sub_path: None,
                },
            ],
            ..Default::default()
        }],
        volumes: vec![
            Volume {
                name: "backing".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: cfg.backing_pvc_name.clone(),
                }),
                host_path: None,
            },
            Volume {
                name: "plugins-dir".to_string(),
                persistent_volume_claim: None,
                host_path: Some(HostPathVolumeSource {
                    path: "/var/lib/kubelet/plugins".to_string(),
                    host_path_type: Some("Directory".to_string()),
                }),
            },
            Volume {
                name: "pods-dir".to_string(),
                persistent_volume_claim: None,
                host_path: Some(HostPathVolumeSource {
                    path: "/var/lib/kubelet/pods".to_string(),
                    host_path_type: Some("Directory".to_string()),
                }),
            },
        ],
    };

    ReplicaSet::new(
        ObjectMeta {
            name: Some(cfg.name.clone()),
            namespace: Some(cfg.namespace.clone()),
            labels: cfg.labels.clone(),
            annotations: cfg.annotations.clone(),
            ..Default::default()
        },
        ReplicaSetSpec {
            replicas: 1,
            selector: LabelSelector {
                match_labels: cfg.labels.clone(),
            },
            template: PodTemplateSpec {
                metadata: ObjectMeta {
                    labels: cfg.labels.clone(),
                    ..Default::default()
                },
                spec: pod_spec,
            },
        },
    )
}

/// Idempotent: re-staging the same (volume, node) pair re-attaches to the
/// worker dispatched before.
pub async fn create_worker(client: &ApiClient, cfg: &WorkerConfig) -> Result<(), DynError> {
    let replica_set = build_worker(cfg);
    match client.create_replica_set(&replica_set).await {
        Ok(_) => Ok(()),
        Err(err) if is_already_exists_error(err.as_ref()) => Ok(()),
        Err(err) => Err(err),
    }
}

/// Looks up the worker matching a label selector. `Ok(None)` when no worker
/// exists; an error when the selector matches more than one.
pub async fn find_worker(
    client: &ApiClient,
    label_selector: &str,
) -> Result<Option<ReplicaSet>, DynError> {
    let list = client.list_replica_sets(label_selector).await?;
    match list.items.len() {
        0 => Ok(None),
        1 => Ok(list.items.into_iter().next()),
        _ => Err(new_error(format!(
            "more than one staging worker matches {}",
            label_selector
        ))),
    }
}

/// Idempotent. Succeeds immediately if the object no longer exists, otherwise
/// requests foreground deletion and waits until the ReplicaSet is gone.
pub async fn delete_worker_synchronously(
    client: &ApiClient,
    name: &str,
    namespace: &str,
) -> Result<(), DynError> {
    match client.delete_replica_set(namespace, name).await {
        Ok(()) => {}
        Err(err) if is_not_found_error(err.as_ref()) => return Ok(()),
        Err(err) => return Err(err),
    }

    loop {
        sleep(POLL_INTERVAL).await;
        match client.get_replica_set(namespace, name).await {
            Ok(_) => {}
            Err(err) if is_not_found_error(err.as_ref()) => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}
