/*
 * Copyright (C) 2024 The Quarry Authors
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

use crate::quarry::api::types::ObjectMeta;

pub const NODE_CONDITION_READY: &str = "Ready";
pub const NODE_CONDITION_OUT_OF_DISK: &str = "OutOfDisk";
pub const NODE_CONDITION_DISK_PRESSURE: &str = "DiskPressure";
pub const NODE_CONDITION_PID_PRESSURE: &str = "PIDPressure";
pub const NODE_CONDITION_MEMORY_PRESSURE: &str = "MemoryPressure";
pub const NODE_CONDITION_NETWORK_UNAVAILABLE: &str = "NetworkUnavailable";

pub const CONDITION_STATUS_TRUE: &str = "True";

const TOPOLOGY_REGION_LABEL: &str = "topology.kubernetes.io/region";
const TOPOLOGY_ZONE_LABEL: &str = "topology.kubernetes.io/zone";
const LEGACY_REGION_LABEL: &str = "failure-domain.beta.kubernetes.io/region";
const LEGACY_ZONE_LABEL: &str = "failure-domain.beta.kubernetes.io/zone";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubernetesNodeSpec {
    #[serde(default)]
    pub unschedulable: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubernetesNodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubernetesNodeStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<KubernetesNodeCondition>,
}

/// Minimal representation of a Kubernetes node object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct KubernetesNode {
    pub metadata: ObjectMeta,
    pub spec: KubernetesNodeSpec,
    #[serde(default)]
    pub status: KubernetesNodeStatus,
}

/// Extracts the node's region and zone from its topology labels, preferring
/// the stable label family when the server is new enough to populate it.
pub fn get_region_and_zone(
    labels: &HashMap<String, String>,
    using_topology_labels: bool,
) -> (String, String) {
    let (region_label, zone_label) = if using_topology_labels {
        (TOPOLOGY_REGION_LABEL, TOPOLOGY_ZONE_LABEL)
    } else {
        (LEGACY_REGION_LABEL, LEGACY_ZONE_LABEL)
    };
    let region = labels.get(region_label).cloned().unwrap_or_default();
    let zone = labels.get(zone_label).cloned().unwrap_or_default();
    (region, zone)
}
