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

//! Claim-mutation helpers implementing the volume state machine.
//!
//! Transitions are optimistic read-modify-write cycles against the PVC
//! object; the API server's resource-version check provides the
//! compare-and-set, and conflicts are retried with bounded backoff.

use std::error::Error;

use crate::subprovisioner::config;
use crate::subprovisioner::k8s::client::{retry_on_conflict, ApiClient};
use crate::subprovisioner::k8s::pvc::PersistentVolumeClaim;
use crate::subprovisioner::k8s::volumesnapshot::VolumeSnapshot;
use crate::subprovisioner::util::error::{failed_precondition, not_found};
use crate::subprovisioner::volume::state::{node_list_to_set, node_set_to_list, VolumeState};

type DynError = Box<dyn Error + Send + Sync>;

/// Finds the unique PVC carrying the driver's uid label with the given value.
pub async fn find_pvc_by_uid(
    client: &ApiClient,
    uid: &str,
) -> Result<PersistentVolumeClaim, DynError> {
    let selector = format!("{}={}", config::uid_label(), uid);
    let list = client.list_pvcs(&selector).await?;
    match list.items.len() {
        0 => Err(not_found(format!("no volume found for id {}", uid))),
        1 => Ok(list.items.into_iter().next().unwrap()),
        _ => Err(not_found(format!(
            "more than one volume found for id {}",
            uid
        ))),
    }
}

/// Finds the unique VolumeSnapshot carrying the driver's uid label.
pub async fn find_snapshot_by_uid(
    client: &ApiClient,
    uid: &str,
) -> Result<VolumeSnapshot, DynError> {
    let selector = format!("{}={}", config::uid_label(), uid);
    let list = client.list_volume_snapshots(&selector).await?;
    match list.items.len() {
        0 => Err(not_found(format!("no snapshot found for id {}", uid))),
        1 => Ok(list.items.into_iter().next().unwrap()),
        _ => Err(not_found(format!(
            "more than one snapshot found for id {}",
            uid
        ))),
    }
}

/// Attempts the transition `idle -> new_state`.
///
/// Idempotent: succeeds if the volume is already in `new_state`. Any other
/// non-idle state, or a claim marked for deletion, answers
/// failed-precondition so the caller's sidecar retries the RPC later.
pub async fn set_state_to(
    client: &ApiClient,
    pvc_name: &str,
    pvc_namespace: &str,
    new_state: VolumeState,
) -> Result<(), DynError> {
    retry_on_conflict(|| async move {
        let state_key = config::annotation("state");
        let mut pvc = client.get_pvc(pvc_namespace, pvc_name).await?;

        if pvc.metadata.is_being_deleted() {
            return Err(failed_precondition("volume is being deleted"));
        }

        let current = pvc.metadata.annotation(&state_key).unwrap_or_default();
        if current == new_state.as_str() {
            return Ok(());
        }
        match VolumeState::parse(current) {
            Some(VolumeState::Idle) => {
                pvc.metadata
                    .annotations
                    .insert(state_key, new_state.as_str().to_string());
                client.update_pvc(&pvc).await?;
                Ok(())
            }
            Some(busy) => Err(failed_precondition(busy.busy_message())),
            None => Err(failed_precondition("volume is in an unknown state")),
        }
    })
    .await
}

/// Patches the volume back to `idle` unconditionally.
pub async fn set_state_to_idle(
    client: &ApiClient,
    pvc_name: &str,
    pvc_namespace: &str,
) -> Result<(), DynError> {
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { (config::annotation("state")): "idle" }
        }
    });
    client
        .strategic_merge_patch_pvc(pvc_namespace, pvc_name, &patch)
        .await?;
    Ok(())
}

/// Transition into `staged`, adding the node to the staged-on set.
///
/// Accepts `idle` or `staged` as starting states so that staging the same
/// volume on additional nodes, or retrying a stage, is permitted.
pub async fn stage_on_node(
    client: &ApiClient,
    pvc_name: &str,
    pvc_namespace: &str,
    node_name: &str,
) -> Result<(), DynError> {
    retry_on_conflict(|| async move {
        let state_key = config::annotation("state");
        let staged_key = config::annotation("staged-on-nodes");
        let mut pvc = client.get_pvc(pvc_namespace, pvc_name).await?;

        if pvc.metadata.is_being_deleted() {
            return Err(failed_precondition("volume is being deleted"));
        }

        let current = pvc.metadata.annotation(&state_key).unwrap_or_default();
        match VolumeState::parse(current) {
            Some(VolumeState::Idle) | Some(VolumeState::Staged) => {}
            Some(busy) => return Err(failed_precondition(busy.busy_message())),
            None => return Err(failed_precondition("volume is in an unknown state")),
        }

        pvc.metadata
            .annotations
            .insert(state_key, VolumeState::Staged.as_str().to_string());

        let mut staged_on =
            node_list_to_set(pvc.metadata.annotation(&staged_key).unwrap_or_default());
        staged_on.insert(node_name.to_string());
        pvc.metadata
            .annotations
            .insert(staged_key, node_set_to_list(&staged_on));

        client.update_pvc(&pvc).await?;
        Ok(())
    })
    .await
}

/// Removes the node from the staged-on set, reverting to `idle` when the set
/// becomes empty.
///
/// Succeeds whatever the current state; unstaging must stay available while
/// the volume is being deleted.
pub async fn unstage_from_node(
    client: &ApiClient,
    pvc_name: &str,
    pvc_namespace: &str,
    node_name: &str,
) -> Result<(), DynError> {
    retry_on_conflict(|| async move {
        let state_key = config::annotation("state");
        let staged_key = config::annotation("staged-on-nodes");
        let mut pvc = client.get_pvc(pvc_namespace, pvc_name).await?;

        if pvc.metadata.annotation(&state_key) == Some(VolumeState::Staged.as_str()) {
            let mut staged_on =
                node_list_to_set(pvc.metadata.annotation(&staged_key).unwrap_or_default());
            staged_on.remove(node_name);

            if staged_on.is_empty() {
                pvc.metadata.annotations.remove(&staged_key);
                pvc.metadata
                    .annotations
                    .insert(state_key, VolumeState::Idle.as_str().to_string());
            } else {
                pvc.metadata
                    .annotations
                    .insert(staged_key, node_set_to_list(&staged_on));
            }
        }

        client.update_pvc(&pvc).await?;
        Ok(())
    })
    .await
}
