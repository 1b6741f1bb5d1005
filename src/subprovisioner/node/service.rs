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
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, FileTypeExt, PermissionsExt};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use crate::subprovisioner::config;
use crate::subprovisioner::csi::types::*;
use crate::subprovisioner::dispatch::worker::{
    create_worker, delete_worker_synchronously, find_worker, WorkerConfig,
};
use crate::subprovisioner::k8s::client::ApiClient;
use crate::subprovisioner::logger::log_info;
use crate::subprovisioner::util::error::{invalid_argument, with_context};
use crate::subprovisioner::volume::claims::{find_pvc_by_uid, stage_on_node, unstage_from_node};

type DynError = Box<dyn Error + Send + Sync>;

const COMPONENT: &str = "node";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Serves the CSI node RPCs on one cluster node.
pub struct NodeService {
    client: Arc<ApiClient>,
    node_name: String,
    image: String,
}

impl NodeService {
    pub fn new(client: Arc<ApiClient>, node_name: String, image: String) -> Self {
        Self {
            client,
            node_name,
            image,
        }
    }

    pub async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), DynError> {
        let capability = req
            .volume_capability
            .as_ref()
            .ok_or_else(|| invalid_argument("expected a block volume"))?;
        if !capability.is_block() {
            return Err(invalid_argument("expected a block volume"));
        }
        let readonly = capability
            .access_mode
            .map(AccessMode::is_read_only)
            .unwrap_or(false);

        let pvc_uid = req.volume_id.as_str();
        let context = |key: &str| req.volume_context.get(key).cloned().unwrap_or_default();
        let pvc_name = context("pvcName");
        let pvc_namespace = context("pvcNamespace");
        let backing_pvc_name = context("backingPvcName");
        let backing_pvc_namespace = context("backingPvcNamespace");
        let backing_pvc_base_path = context("backingPvcBasePath");

        stage_on_node(
            &self.client,
            &pvc_name,
            &pvc_namespace,
            &self.node_name,
        )
        .await?;

        log_info(
            COMPONENT,
            "staging volume",
            &[
                ("pvc", &format!("{}/{}", pvc_namespace, pvc_name)),
                ("node", &self.node_name),
                ("readonly", if readonly { "true" } else { "false" }),
            ],
        );

        let worker_name = config::staging_worker_name(pvc_uid, &self.node_name);
        let labels = staging_labels(pvc_uid, &self.node_name);

        create_worker(
            &self.client,
            &WorkerConfig {
                name: worker_name,
                namespace: backing_pvc_namespace.clone(),
                labels,
                annotations: HashMap::from([
                    (config::annotation("pvc-name"), pvc_name),
                    (config::annotation("pvc-namespace"), pvc_namespace),
                    (config::annotation("backing-pvc-name"), backing_pvc_name.clone()),
                    (
                        config::annotation("backing-pvc-namespace"),
                        backing_pvc_namespace,
                    ),
                ]),
                node_name: self.node_name.clone(),
                image: self.image.clone(),
                command: vec![
                    "subprovisioner".to_string(),
                    "stage-worker".to_string(),
                    config::volume_image_path(pvc_uid),
                    req.staging_target_path.clone(),
                    readonly.to_string(),
                ],
                backing_pvc_name,
                backing_pvc_base_path,
            },
        )
        .await?;

        wait_until_file_is_block_device(&req.staging_target_path).await
    }

    pub async fn unstage_volume(&self, req: NodeUnstageVolumeRequest) -> Result<(), DynError> {
        let pvc_uid = req.volume_id.as_str();

        let selector = staging_labels(pvc_uid, &self.node_name)
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(",");

        if let Some(worker) = find_worker(&self.client, &selector).await? {
            let name = worker.metadata.name.as_deref().unwrap_or_default();
            let namespace = worker.metadata.namespace.as_deref().unwrap_or("default");
            delete_worker_synchronously(&self.client, name, namespace).await?;
        }

        remove_if_exists(&req.staging_target_path)?;

        let pvc = find_pvc_by_uid(&self.client, pvc_uid).await?;
        unstage_from_node(
            &self.client,
            pvc.metadata.name.as_deref().unwrap_or_default(),
            pvc.metadata.namespace.as_deref().unwrap_or("default"),
            &self.node_name,
        )
        .await?;

        log_info(
            COMPONENT,
            "unstaged volume",
            &[("uid", pvc_uid), ("node", &self.node_name)],
        );

        Ok(())
    }

    /// The pod-visible block node is a symlink to the staging path.
    pub async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), DynError> {
        // The kubelet sometimes pre-creates a directory where the block node
        // should go.
        remove_if_exists(&req.target_path)?;

        symlink(&req.staging_target_path, &req.target_path).map_err(|e| {
            with_context(
                e,
                format!(
                    "Failed to link {} to {}",
                    req.target_path, req.staging_target_path
                ),
            )
        })?;

        if req.readonly {
            let metadata = fs::metadata(&req.target_path)
                .map_err(|e| with_context(e, format!("Failed to stat {}", req.target_path)))?;
            let mut permissions = metadata.permissions();
            permissions.set_mode(permissions.mode() & !0o222); // clear write bits
            fs::set_permissions(&req.target_path, permissions).map_err(|e| {
                with_context(e, format!("Failed to change mode of {}", req.target_path))
            })?;
        }

        Ok(())
    }

    pub async fn unpublish_volume(&self, req: NodeUnpublishVolumeRequest) -> Result<(), DynError> {
        remove_if_exists(&req.target_path)
    }

    pub fn get_capabilities(&self) -> NodeGetCapabilitiesResponse {
        NodeGetCapabilitiesResponse {
            capabilities: vec![
                "STAGE_UNSTAGE_VOLUME".to_string(),
                "SINGLE_NODE_MULTI_WRITER".to_string(),
            ],
        }
    }

    pub fn get_info(&self) -> NodeGetInfoResponse {
        NodeGetInfoResponse {
            node_id: self.node_name.clone(),
        }
    }
}

fn staging_labels(pvc_uid: &str, node_name: &str) -> HashMap<String, String> {
    HashMap::from([
        (
            config::annotation("component"),
            "volume-staging".to_string(),
        ),
        (config::annotation("node-name"), node_name.to_string()),
        (config::annotation("pvc-uid"), pvc_uid.to_string()),
    ])
}

fn remove_if_exists(path: &str) -> Result<(), DynError> {
    let result = match fs::symlink_metadata(path) {
        Ok(metadata) if metadata.is_dir() => fs::remove_dir(path),
        Ok(_) => fs::remove_file(path),
        Err(err) => {
            if err.kind() == ErrorKind::NotFound {
                return Ok(());
            }
            return Err(with_context(err, format!("Failed to inspect {}", path)));
        }
    };
    match result {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(with_context(err, format!("Failed to remove {}", path))),
    }
}

/// Waits for the staging worker to materialize the block special file.
/// Cancelled by dropping the future when the RPC is abandoned.
pub async fn wait_until_file_is_block_device(path: &str) -> Result<(), DynError> {
    loop {
        match fs::metadata(path) {
            Ok(metadata) if metadata.file_type().is_block_device() => return Ok(()),
            Ok(_) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(with_context(err, format!("Failed to inspect {}", path)));
            }
        }
        sleep(POLL_INTERVAL).await;
    }
}
