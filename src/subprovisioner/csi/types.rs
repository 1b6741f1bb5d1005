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

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CapacityRange {
    #[serde(rename = "requiredBytes", skip_serializing_if = "Option::is_none")]
    pub required_bytes: Option<i64>,
    #[serde(rename = "limitBytes", skip_serializing_if = "Option::is_none")]
    pub limit_bytes: Option<i64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum AccessMode {
    #[serde(rename = "SINGLE_NODE_WRITER")]
    #[default]
    SingleNodeWriter,
    #[serde(rename = "SINGLE_NODE_READER_ONLY")]
    SingleNodeReaderOnly,
    #[serde(rename = "MULTI_NODE_READER_ONLY")]
    MultiNodeReaderOnly,
    #[serde(rename = "SINGLE_NODE_SINGLE_WRITER")]
    SingleNodeSingleWriter,
    #[serde(rename = "SINGLE_NODE_MULTI_WRITER")]
    SingleNodeMultiWriter,
    #[serde(other)]
    Unsupported,
}

impl AccessMode {
    pub fn is_supported(self) -> bool {
        !matches!(self, AccessMode::Unsupported)
    }

    /// Whether staging for this mode exposes the device read-only.
    pub fn is_read_only(self) -> bool {
        matches!(
            self,
            AccessMode::SingleNodeReaderOnly | AccessMode::MultiNodeReaderOnly
        )
    }
}

/// Marker for raw block access; carries no options.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BlockVolumeCapability {}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountVolumeCapability {
    #[serde(rename = "fsType", skip_serializing_if = "Option::is_none")]
    pub fs_type: Option<String>,
    #[serde(rename = "mountFlags", default, skip_serializing_if = "Vec::is_empty")]
    pub mount_flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeCapability {
    #[serde(rename = "accessMode", skip_serializing_if = "Option::is_none")]
    pub access_mode: Option<AccessMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<BlockVolumeCapability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mount: Option<MountVolumeCapability>,
}

impl VolumeCapability {
    pub fn is_block(&self) -> bool {
        self.block.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeContentSourceVolume {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeContentSourceSnapshot {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeContentSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumeContentSourceVolume>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<VolumeContentSourceSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Volume {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
    #[serde(rename = "contentSource", skip_serializing_if = "Option::is_none")]
    pub content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
    #[serde(rename = "sourceVolumeId")]
    pub source_volume_id: String,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: i64,
    #[serde(rename = "readyToUse")]
    pub ready_to_use: bool,
    #[serde(rename = "creationTime")]
    pub creation_time: String,
}

// Controller service

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateVolumeRequest {
    pub name: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
    #[serde(
        rename = "volumeCapabilities",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub volume_capabilities: Vec<VolumeCapability>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
    #[serde(rename = "volumeContentSource", skip_serializing_if = "Option::is_none")]
    pub volume_content_source: Option<VolumeContentSource>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeResponse {
    pub volume: Volume,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreateSnapshotRequest {
    pub name: String,
    #[serde(rename = "sourceVolumeId")]
    pub source_volume_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parameters: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSnapshotResponse {
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeleteSnapshotRequest {
    #[serde(rename = "snapshotId")]
    pub snapshot_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ControllerExpandVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "capacityRange", skip_serializing_if = "Option::is_none")]
    pub capacity_range: Option<CapacityRange>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerExpandVolumeResponse {
    #[serde(rename = "capacityBytes")]
    pub capacity_bytes: i64,
    #[serde(rename = "nodeExpansionRequired")]
    pub node_expansion_required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerGetCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

// Node service

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeStageVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath")]
    pub staging_target_path: String,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
    #[serde(
        rename = "volumeContext",
        default,
        skip_serializing_if = "HashMap::is_empty"
    )]
    pub volume_context: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnstageVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath")]
    pub staging_target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodePublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "stagingTargetPath")]
    pub staging_target_path: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
    #[serde(default)]
    pub readonly: bool,
    #[serde(rename = "volumeCapability", skip_serializing_if = "Option::is_none")]
    pub volume_capability: Option<VolumeCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeUnpublishVolumeRequest {
    #[serde(rename = "volumeId")]
    pub volume_id: String,
    #[serde(rename = "targetPath")]
    pub target_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeGetInfoResponse {
    #[serde(rename = "nodeId")]
    pub node_id: String,
}

// Identity service

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPluginInfoResponse {
    pub name: String,
    #[serde(rename = "vendorVersion")]
    pub vendor_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetPluginCapabilitiesResponse {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub ready: bool,
}
