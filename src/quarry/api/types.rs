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
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// API group of the quarry control plane; doubles as the finalizer key.
pub const API_GROUP: &str = "quarry.io";

/// Container name identifying a quarry manager pod.
pub const MANAGER_CONTAINER_NAME: &str = "quarry-manager";
/// Volume mount whose propagation mode gates CSI deployability.
pub const SYSTEM_MOUNT_NAME: &str = "quarry-system";

/// Minimum server version carrying the stable topology label family.
pub const KUBERNETES_TOPOLOGY_LABELS_VERSION: &str = "v1.17.0";

pub const LABEL_NODE: &str = "node";
pub const LABEL_INSTANCE_MANAGER_IMAGE: &str = "instance-manager-image";
pub const LABEL_INSTANCE_MANAGER_TYPE: &str = "instance-manager-type";

const INSTANCE_MANAGER_NAME_FINGERPRINT_LENGTH: usize = 8;

/// Produces the fully qualified form of a quarry label key.
pub fn label_key(name: &str) -> String {
    format!("{}/{}", API_GROUP, name)
}

/// Minimal object metadata shared by every quarry API object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(
        rename = "resourceVersion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
    #[serde(
        rename = "deletionTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub deletion_timestamp: Option<String>,
    #[serde(
        rename = "ownerReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OwnerReference {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    #[serde(
        rename = "blockOwnerDeletion",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub block_owner_deletion: Option<bool>,
}

/// Tri-valued condition status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl Default for ConditionStatus {
    fn default() -> Self {
        ConditionStatus::Unknown
    }
}

/// A named health facet of an object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    #[serde(rename = "type")]
    pub condition_type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "lastTransitionTime", default)]
    pub last_transition_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeConditionType {
    Ready,
    Schedulable,
    MountPropagation,
}

impl NodeConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeConditionType::Ready => "Ready",
            NodeConditionType::Schedulable => "Schedulable",
            NodeConditionType::MountPropagation => "MountPropagation",
        }
    }
}

impl Display for NodeConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons attached to node condition transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeConditionReason {
    ManagerPodDown,
    ManagerPodMissing,
    KubernetesNodeGone,
    KubernetesNodeNotReady,
    KubernetesNodePressure,
    KubernetesNodeCordoned,
    UnknownNodeConditionTrue,
    NoMountPropagationSupport,
}

impl NodeConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            NodeConditionReason::ManagerPodDown => "ManagerPodDown",
            NodeConditionReason::ManagerPodMissing => "ManagerPodMissing",
            NodeConditionReason::KubernetesNodeGone => "KubernetesNodeGone",
            NodeConditionReason::KubernetesNodeNotReady => "KubernetesNodeNotReady",
            NodeConditionReason::KubernetesNodePressure => "KubernetesNodePressure",
            NodeConditionReason::KubernetesNodeCordoned => "KubernetesNodeCordoned",
            NodeConditionReason::UnknownNodeConditionTrue => "UnknownNodeConditionTrue",
            NodeConditionReason::NoMountPropagationSupport => "NoMountPropagationSupport",
        }
    }
}

impl Display for NodeConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskConditionType {
    Ready,
    Schedulable,
}

impl DiskConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            DiskConditionType::Ready => "Ready",
            DiskConditionType::Schedulable => "Schedulable",
        }
    }
}

impl Display for DiskConditionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reasons attached to disk condition transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiskConditionReason {
    NoDiskInfo,
    DiskFilesystemChanged,
    DiskPressure,
}

impl DiskConditionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DiskConditionReason::NoDiskInfo => "NoDiskInfo",
            DiskConditionReason::DiskFilesystemChanged => "DiskFilesystemChanged",
            DiskConditionReason::DiskPressure => "DiskPressure",
        }
    }
}

impl Display for DiskConditionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event reasons that are not condition reasons.
pub const EVENT_REASON_DELETE: &str = "Delete";
pub const EVENT_REASON_FAILED_NODE_SYNC: &str = "FailedNodeSync";

/// Declared disk configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskSpec {
    pub path: String,
    #[serde(rename = "storageReserved", default)]
    pub storage_reserved: i64,
    #[serde(rename = "allowScheduling", default)]
    pub allow_scheduling: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// Observed disk state, recomputed on every reconcile.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DiskStatus {
    #[serde(default)]
    pub conditions: HashMap<String, Condition>,
    #[serde(rename = "diskUUID", default)]
    pub disk_uuid: String,
    #[serde(rename = "storageMaximum", default)]
    pub storage_maximum: i64,
    #[serde(rename = "storageAvailable", default)]
    pub storage_available: i64,
    #[serde(rename = "storageScheduled", default)]
    pub storage_scheduled: i64,
    #[serde(rename = "scheduledReplica", default)]
    pub scheduled_replica: HashMap<String, i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub disks: HashMap<String, DiskSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "allowScheduling", default)]
    pub allow_scheduling: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: HashMap<String, Condition>,
    #[serde(rename = "diskStatus", default)]
    pub disk_status: HashMap<String, DiskStatus>,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub zone: String,
}

/// A storage node: declared disks and policy plus controller-owned status.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub metadata: ObjectMeta,
    pub spec: NodeSpec,
    #[serde(default)]
    pub status: NodeStatus,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReplicaSpec {
    #[serde(rename = "nodeID", default)]
    pub node_id: String,
    #[serde(rename = "diskID", default)]
    pub disk_id: String,
    #[serde(rename = "volumeSize", default)]
    pub volume_size: i64,
}

/// A volume replica record. The node controller only reads these.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Replica {
    pub metadata: ObjectMeta,
    pub spec: ReplicaSpec,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstanceManagerType {
    #[serde(rename = "engine")]
    Engine,
    #[serde(rename = "replica")]
    Replica,
}

impl InstanceManagerType {
    pub const fn as_str(self) -> &'static str {
        match self {
            InstanceManagerType::Engine => "engine",
            InstanceManagerType::Replica => "replica",
        }
    }

    const fn name_infix(self) -> &'static str {
        match self {
            InstanceManagerType::Engine => "e",
            InstanceManagerType::Replica => "r",
        }
    }
}

impl Display for InstanceManagerType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceManagerState {
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "unknown")]
    Unknown,
}

impl Default for InstanceManagerState {
    fn default() -> Self {
        InstanceManagerState::Unknown
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstanceState {
    #[serde(rename = "starting")]
    Starting,
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "stopped")]
    Stopped,
    #[serde(rename = "error")]
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceManagerSpec {
    pub image: String,
    #[serde(rename = "nodeID")]
    pub node_id: String,
    #[serde(rename = "type")]
    pub im_type: InstanceManagerType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct InstanceManagerStatus {
    #[serde(rename = "currentState", default)]
    pub current_state: InstanceManagerState,
    #[serde(default)]
    pub instances: HashMap<String, InstanceState>,
}

/// A node-local supervisor for engine or replica processes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceManager {
    pub metadata: ObjectMeta,
    pub spec: InstanceManagerSpec,
    #[serde(default)]
    pub status: InstanceManagerStatus,
}

/// Derives the deterministic instance manager name for a (node, image, type)
/// triple. Two nodes never collide because the node name is part of the
/// fingerprint preimage.
pub fn instance_manager_name(
    im_type: InstanceManagerType,
    node_name: &str,
    image: &str,
) -> String {
    let digest = Sha1::digest(format!("{}/{}", node_name, image).as_bytes());
    let fingerprint = format!("{:x}", digest);
    format!(
        "instance-manager-{}-{}",
        im_type.name_infix(),
        &fingerprint[..INSTANCE_MANAGER_NAME_FINGERPRINT_LENGTH]
    )
}

/// Label values may not contain image separators; squash them to dashes.
fn sanitize_label_value(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Labels stamped on every instance manager this controller creates.
pub fn instance_manager_labels(
    node_name: &str,
    image: &str,
    im_type: InstanceManagerType,
) -> HashMap<String, String> {
    HashMap::from([
        (label_key(LABEL_NODE), node_name.to_string()),
        (
            label_key(LABEL_INSTANCE_MANAGER_IMAGE),
            sanitize_label_value(image),
        ),
        (
            label_key(LABEL_INSTANCE_MANAGER_TYPE),
            im_type.as_str().to_string(),
        ),
    ])
}

/// A single global typed key/value entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Setting {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SettingName {
    StorageMinimalAvailablePercentage,
    DisableSchedulingOnCordonedNode,
    DefaultInstanceManagerImage,
    CreateDefaultDiskLabeledNodes,
    DefaultDataPath,
}

impl SettingName {
    pub const fn as_str(self) -> &'static str {
        match self {
            SettingName::StorageMinimalAvailablePercentage => {
                "storage-minimal-available-percentage"
            }
            SettingName::DisableSchedulingOnCordonedNode => "disable-scheduling-on-cordoned-node",
            SettingName::DefaultInstanceManagerImage => "default-instance-manager-image",
            SettingName::CreateDefaultDiskLabeledNodes => "create-default-disk-labeled-nodes",
            SettingName::DefaultDataPath => "default-data-path",
        }
    }

    pub fn from_str(name: &str) -> Option<Self> {
        SETTING_NAME_LIST
            .iter()
            .copied()
            .find(|candidate| candidate.as_str() == name)
    }
}

impl Display for SettingName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// All settings the node controller knows about, in definition order.
pub const SETTING_NAME_LIST: &[SettingName] = &[
    SettingName::StorageMinimalAvailablePercentage,
    SettingName::DisableSchedulingOnCordonedNode,
    SettingName::DefaultInstanceManagerImage,
    SettingName::CreateDefaultDiskLabeledNodes,
    SettingName::DefaultDataPath,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingType {
    Bool,
    Int,
    String,
}

#[derive(Debug, Clone, Copy)]
pub struct SettingDefinition {
    pub display_name: &'static str,
    pub description: &'static str,
    pub setting_type: SettingType,
    pub default: &'static str,
}

/// Returns the compiled-in definition for a setting.
pub const fn setting_definition(name: SettingName) -> SettingDefinition {
    match name {
        SettingName::StorageMinimalAvailablePercentage => SettingDefinition {
            display_name: "Storage Minimal Available Percentage",
            description: "A disk stops accepting new replicas once its available \
                          space drops below this percentage of its capacity.",
            setting_type: SettingType::Int,
            default: "25",
        },
        SettingName::DisableSchedulingOnCordonedNode => SettingDefinition {
            display_name: "Disable Scheduling On Cordoned Node",
            description: "Mark a node unschedulable while its Kubernetes node is cordoned.",
            setting_type: SettingType::Bool,
            default: "true",
        },
        SettingName::DefaultInstanceManagerImage => SettingDefinition {
            display_name: "Default Instance Manager Image",
            description: "Image every node-local instance manager is converged onto.",
            setting_type: SettingType::String,
            default: "",
        },
        SettingName::CreateDefaultDiskLabeledNodes => SettingDefinition {
            display_name: "Create Default Disk Only On Labeled Nodes",
            description: "When enabled, newly registered nodes get no default disk \
                          unless they carry the opt-in label.",
            setting_type: SettingType::Bool,
            default: "false",
        },
        SettingName::DefaultDataPath => SettingDefinition {
            display_name: "Default Data Path",
            description: "Filesystem path used for the default disk of newly \
                          registered nodes.",
            setting_type: SettingType::String,
            default: "/var/lib/quarry/",
        },
    }
}
