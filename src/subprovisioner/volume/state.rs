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

use std::collections::BTreeSet;

/// The single mutable field serializing mutually-exclusive volume operations.
///
/// Stored as the value of the state annotation on the volume's PVC. Legal
/// transitions are `idle <-> expanding | cloning | snapshotting` and
/// `idle | staged -> staged -> idle`, the latter tracked per node through the
/// staged-on-nodes annotation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VolumeState {
    Idle,
    Expanding,
    Cloning,
    Snapshotting,
    Staged,
}

impl VolumeState {
    pub fn as_str(self) -> &'static str {
        match self {
            VolumeState::Idle => "idle",
            VolumeState::Expanding => "expanding",
            VolumeState::Cloning => "cloning",
            VolumeState::Snapshotting => "snapshotting",
            VolumeState::Staged => "staged",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(VolumeState::Idle),
            "expanding" => Some(VolumeState::Expanding),
            "cloning" => Some(VolumeState::Cloning),
            "snapshotting" => Some(VolumeState::Snapshotting),
            "staged" => Some(VolumeState::Staged),
            _ => None,
        }
    }

    /// Message surfaced to callers that hit a busy volume.
    pub fn busy_message(self) -> &'static str {
        match self {
            VolumeState::Idle => "volume is idle",
            VolumeState::Expanding => "volume is being expanded",
            VolumeState::Cloning => "volume is being cloned",
            VolumeState::Snapshotting => "volume is being snapshotted",
            VolumeState::Staged => "volume is staged",
        }
    }
}

/// Parses the comma-joined staged-on-nodes annotation value.
pub fn node_list_to_set(list: &str) -> BTreeSet<String> {
    let mut set = BTreeSet::new();
    if !list.is_empty() {
        for item in list.split(',') {
            set.insert(item.to_string());
        }
    }
    set
}

pub fn node_set_to_list(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(",")
}
