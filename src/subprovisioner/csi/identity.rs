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

use crate::subprovisioner::config;
use crate::subprovisioner::csi::types::{
    GetPluginCapabilitiesResponse, GetPluginInfoResponse, ProbeResponse,
};

pub fn get_plugin_info() -> GetPluginInfoResponse {
    GetPluginInfoResponse {
        name: config::DOMAIN.to_string(),
        vendor_version: config::VERSION.to_string(),
    }
}

pub fn get_plugin_capabilities() -> GetPluginCapabilitiesResponse {
    GetPluginCapabilitiesResponse {
        capabilities: vec![
            "CONTROLLER_SERVICE".to_string(),
            "VOLUME_EXPANSION_OFFLINE".to_string(),
        ],
    }
}

pub fn probe() -> ProbeResponse {
    ProbeResponse { ready: true }
}
