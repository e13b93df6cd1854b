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

pub mod registry;

use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use crate::quarry::api::conditions::get_condition;
use crate::quarry::api::types::{
    setting_definition, DiskSpec, InstanceManager, Node, NodeConditionReason, NodeConditionType,
    NodeSpec, ObjectMeta, OwnerReference, Replica, Setting, SettingName, SettingType,
    API_GROUP, LABEL_NODE, MANAGER_CONTAINER_NAME, SETTING_NAME_LIST,
};
use crate::quarry::api::types::{label_key, ConditionStatus};
use crate::quarry::datastore::registry::{ApiObject, ClusterRegistry, RegistryError};
use crate::quarry::k8s::node::KubernetesNode;
use crate::quarry::k8s::pod::Pod;
use crate::quarry::logger::log_error;

const DATASTORE_COMPONENT: &str = "datastore";

const VERIFICATION_RETRY_INTERVAL: Duration = Duration::from_millis(100);
const VERIFICATION_RETRY_COUNTS: usize = 20;

const DEFAULT_DISK_PREFIX: &str = "default-disk-";
const DEFAULT_DISK_FINGERPRINT_LENGTH: usize = 8;

#[derive(Debug)]
pub enum DataStoreError {
    NotFound {
        kind: &'static str,
        name: String,
    },
    AlreadyExists {
        kind: &'static str,
        name: String,
    },
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },
    Setting(String),
    Invalid(String),
}

impl Display for DataStoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DataStoreError::NotFound { kind, name } => write!(f, "{} {:?} not found", kind, name),
            DataStoreError::AlreadyExists { kind, name } => {
                write!(f, "{} {:?} already exists", kind, name)
            }
            DataStoreError::Conflict { kind, name, message } => {
                write!(f, "conflict updating {} {:?}: {}", kind, name, message)
            }
            DataStoreError::Setting(message) => write!(f, "setting error: {}", message),
            DataStoreError::Invalid(message) => write!(f, "{}", message),
        }
    }
}

impl Error for DataStoreError {}

impl From<RegistryError> for DataStoreError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { kind, name } => DataStoreError::NotFound { kind, name },
            RegistryError::AlreadyExists { kind, name } => {
                DataStoreError::AlreadyExists { kind, name }
            }
            RegistryError::Conflict { kind, name, message } => {
                DataStoreError::Conflict { kind, name, message }
            }
            RegistryError::Invalid(message) => DataStoreError::Invalid(message),
        }
    }
}

pub fn error_is_not_found(err: &DataStoreError) -> bool {
    matches!(err, DataStoreError::NotFound { .. })
}

pub fn error_is_conflict(err: &DataStoreError) -> bool {
    matches!(err, DataStoreError::Conflict { .. })
}

/// Owner references that make a node the cascading owner of an object.
pub fn get_owner_references_for_node(node: &Node) -> Vec<OwnerReference> {
    vec![OwnerReference {
        api_version: format!("{}/v1", API_GROUP),
        kind: "Node".to_string(),
        name: node.metadata.name.clone(),
        uid: node.metadata.uid.clone(),
        block_owner_deletion: Some(true),
    }]
}

fn resource_version_at_least(current: &str, minimum: &str) -> bool {
    // Empty versions only occur in hand-built fixtures; treat them as caught up.
    if current.is_empty() || minimum.is_empty() {
        return true;
    }
    match (current.parse::<i64>(), minimum.parse::<i64>()) {
        (Ok(current), Ok(minimum)) => current >= minimum,
        _ => {
            log_error(
                DATASTORE_COMPONENT,
                "failed to parse resource versions for comparison",
                &[("current", current), ("minimum", minimum)],
            );
            false
        }
    }
}

/// The reconciler's cached view of the control plane. Reads never leave the
/// process; every returned object is owned by the caller.
pub struct DataStore {
    registry: Arc<ClusterRegistry>,
}

impl DataStore {
    pub fn new(registry: Arc<ClusterRegistry>) -> Arc<Self> {
        Arc::new(Self { registry })
    }

    pub fn namespace(&self) -> &str {
        self.registry.namespace()
    }

    /// Version string of the backing Kubernetes API server.
    pub fn kubernetes_version(&self) -> &str {
        self.registry.server_version()
    }

    // The immediate read after a write can lag behind in an eventually
    // consistent control plane; poll until the cache serves an object at
    // least as new as the one the write returned.
    async fn verify_update<T, F>(&self, name: &str, minimal_version: &str, get: F)
    where
        T: ApiObject,
        F: Fn() -> Option<T>,
    {
        for _ in 0..VERIFICATION_RETRY_COUNTS {
            match get() {
                Some(current) => {
                    let current_version = current
                        .metadata()
                        .resource_version
                        .clone()
                        .unwrap_or_default();
                    if resource_version_at_least(&current_version, minimal_version) {
                        return;
                    }
                }
                None => {
                    log_error(
                        DATASTORE_COMPONENT,
                        "failed to get updated object back from the cache",
                        &[("kind", T::KIND), ("name", name)],
                    );
                    return;
                }
            }
            sleep(VERIFICATION_RETRY_INTERVAL).await;
        }
        log_error(
            DATASTORE_COMPONENT,
            "unable to verify the update of object",
            &[("kind", T::KIND), ("name", name)],
        );
    }

    async fn verify_creation<T, F>(&self, name: &str, get: F) -> Result<T, DataStoreError>
    where
        T: ApiObject,
        F: Fn() -> Option<T>,
    {
        for _ in 0..VERIFICATION_RETRY_COUNTS {
            if let Some(object) = get() {
                return Ok(object);
            }
            sleep(VERIFICATION_RETRY_INTERVAL).await;
        }
        Err(DataStoreError::Invalid(format!(
            "unable to verify the existence of newly created {} {:?}",
            T::KIND,
            name
        )))
    }

    // Nodes

    pub fn get_node(&self, name: &str) -> Result<Node, DataStoreError> {
        self.registry
            .nodes()
            .get(name)
            .ok_or_else(|| DataStoreError::NotFound {
                kind: "Node",
                name: name.to_string(),
            })
    }

    pub fn list_nodes(&self) -> Result<HashMap<String, Node>, DataStoreError> {
        Ok(self
            .registry
            .nodes()
            .list()
            .into_iter()
            .map(|node| (node.metadata.name.clone(), node))
            .collect())
    }

    pub async fn create_node(&self, mut node: Node) -> Result<Node, DataStoreError> {
        if !node
            .metadata
            .finalizers
            .iter()
            .any(|finalizer| finalizer == API_GROUP)
        {
            node.metadata.finalizers.push(API_GROUP.to_string());
        }
        if node.metadata.namespace.is_none() {
            node.metadata.namespace = Some(self.namespace().to_string());
        }
        let created = self.registry.nodes().create(node)?;
        let name = created.metadata.name.clone();
        self.verify_creation(&name, || self.registry.nodes().get(&name))
            .await
    }

    /// Registers a node with the default disk at the default data path, unless
    /// default disks are restricted to labeled nodes.
    pub async fn create_default_node(&self, name: &str) -> Result<Node, DataStoreError> {
        let require_label =
            self.get_setting_as_bool(SettingName::CreateDefaultDiskLabeledNodes)?;
        let mut node = Node {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..ObjectMeta::default()
            },
            spec: NodeSpec {
                name: name.to_string(),
                allow_scheduling: true,
                tags: Vec::new(),
                ..NodeSpec::default()
            },
            ..Node::default()
        };

        // The default disk is applied exactly once at registration; wiping
        // the disks later does not recreate it.
        if !require_label {
            let data_path = self.get_setting_value_existed(SettingName::DefaultDataPath)?;
            node.spec.disks = create_default_disk(&data_path)?;
        }

        self.create_node(node).await
    }

    pub async fn update_node(&self, node: Node) -> Result<Node, DataStoreError> {
        let updated = self.registry.nodes().update(node)?;
        let name = updated.metadata.name.clone();
        let version = updated
            .metadata
            .resource_version
            .clone()
            .unwrap_or_default();
        self.verify_update(&name, &version, || self.registry.nodes().get(&name))
            .await;
        Ok(updated)
    }

    pub async fn update_node_status(&self, node: Node) -> Result<Node, DataStoreError> {
        self.update_node(node).await
    }

    /// Removing the finalizer results in deletion if the deletion timestamp
    /// was already set.
    pub async fn remove_finalizer_for_node(&self, node: &Node) -> Result<(), DataStoreError> {
        if !node
            .metadata
            .finalizers
            .iter()
            .any(|finalizer| finalizer == API_GROUP)
        {
            // finalizer already removed
            return Ok(());
        }
        let mut updated = node.clone();
        updated
            .metadata
            .finalizers
            .retain(|finalizer| finalizer != API_GROUP);
        match self.registry.nodes().update(updated) {
            Ok(_) => Ok(()),
            Err(err) => {
                // The object can already be gone by the time we get here.
                if node.metadata.deletion_timestamp.is_some() {
                    return Ok(());
                }
                // Conflicts stay structurally detectable for the caller.
                if let RegistryError::Conflict { .. } = err {
                    return Err(err.into());
                }
                Err(DataStoreError::Invalid(format!(
                    "unable to remove finalizer for node {}: {}",
                    node.metadata.name, err
                )))
            }
        }
    }

    pub fn is_node_down_or_deleted(&self, name: &str) -> Result<bool, DataStoreError> {
        if name.is_empty() {
            return Err(DataStoreError::Invalid(
                "no node name provided to check node down or deleted".to_string(),
            ));
        }
        let node = match self.registry.nodes().get(name) {
            Some(node) => node,
            None => return Ok(true),
        };
        let condition = get_condition(&node.status.conditions, NodeConditionType::Ready.as_str());
        Ok(condition.status == ConditionStatus::False
            && (condition.reason == NodeConditionReason::KubernetesNodeGone.as_str()
                || condition.reason == NodeConditionReason::KubernetesNodeNotReady.as_str()))
    }

    // Kubernetes objects

    pub fn get_kubernetes_node(&self, name: &str) -> Result<KubernetesNode, DataStoreError> {
        self.registry
            .kube_nodes()
            .get(name)
            .ok_or_else(|| DataStoreError::NotFound {
                kind: "KubernetesNode",
                name: name.to_string(),
            })
    }

    /// Pods running the control-plane manager container.
    pub fn list_manager_pods(&self) -> Result<Vec<Pod>, DataStoreError> {
        Ok(self
            .registry
            .pods()
            .list()
            .into_iter()
            .filter(|pod| pod.has_container(MANAGER_CONTAINER_NAME))
            .collect())
    }

    // Replicas

    pub fn list_replicas_by_node(
        &self,
        name: &str,
    ) -> Result<HashMap<String, Vec<Replica>>, DataStoreError> {
        let mut replica_disk_map: HashMap<String, Vec<Replica>> = HashMap::new();
        for replica in self.registry.replicas().list() {
            if replica.spec.node_id != name {
                continue;
            }
            replica_disk_map
                .entry(replica.spec.disk_id.clone())
                .or_default()
                .push(replica);
        }
        Ok(replica_disk_map)
    }

    // Settings

    /// Returns the stored setting, or one synthesized from the compiled-in
    /// default when the record does not exist yet.
    pub fn get_setting(&self, name: SettingName) -> Result<Setting, DataStoreError> {
        if let Some(setting) = self.registry.settings().get(name.as_str()) {
            return Ok(setting);
        }
        let definition = setting_definition(name);
        Ok(Setting {
            metadata: ObjectMeta {
                name: name.as_str().to_string(),
                ..ObjectMeta::default()
            },
            value: definition.default.to_string(),
        })
    }

    pub fn get_setting_value_existed(&self, name: SettingName) -> Result<String, DataStoreError> {
        let setting = self.get_setting(name)?;
        if setting.value.is_empty() {
            return Err(DataStoreError::Setting(format!(
                "setting {} is empty",
                name
            )));
        }
        Ok(setting.value)
    }

    pub fn get_setting_as_int(&self, name: SettingName) -> Result<i64, DataStoreError> {
        let definition = setting_definition(name);
        let setting = self.get_setting(name)?;
        if definition.setting_type != SettingType::Int {
            return Err(DataStoreError::Setting(format!(
                "setting {} is not an integer setting, value is {:?}",
                name, setting.value
            )));
        }
        setting.value.parse::<i64>().map_err(|err| {
            DataStoreError::Setting(format!(
                "setting {} value {:?} is not an integer: {}",
                name, setting.value, err
            ))
        })
    }

    pub fn get_setting_as_bool(&self, name: SettingName) -> Result<bool, DataStoreError> {
        let definition = setting_definition(name);
        let setting = self.get_setting(name)?;
        if definition.setting_type != SettingType::Bool {
            return Err(DataStoreError::Setting(format!(
                "setting {} is not a boolean setting, value is {:?}",
                name, setting.value
            )));
        }
        setting.value.parse::<bool>().map_err(|err| {
            DataStoreError::Setting(format!(
                "setting {} value {:?} is not a boolean: {}",
                name, setting.value, err
            ))
        })
    }

    /// Seeds every known setting that has no stored record yet.
    pub fn init_settings(&self) -> Result<(), DataStoreError> {
        for name in SETTING_NAME_LIST {
            if self.registry.settings().get(name.as_str()).is_some() {
                continue;
            }
            let definition = setting_definition(*name);
            self.registry.settings().create(Setting {
                metadata: ObjectMeta {
                    name: name.as_str().to_string(),
                    ..ObjectMeta::default()
                },
                value: definition.default.to_string(),
            })?;
        }
        Ok(())
    }

    pub fn update_setting(&self, setting: Setting) -> Result<Setting, DataStoreError> {
        Ok(self.registry.settings().update(setting)?)
    }

    // Instance managers

    pub fn list_instance_managers_by_node(
        &self,
        node: &str,
        im_type: crate::quarry::api::types::InstanceManagerType,
    ) -> Result<HashMap<String, InstanceManager>, DataStoreError> {
        Ok(self
            .registry
            .instance_managers()
            .list()
            .into_iter()
            .filter(|im| im.spec.node_id == node && im.spec.im_type == im_type)
            .map(|im| (im.metadata.name.clone(), im))
            .collect())
    }

    pub async fn create_instance_manager(
        &self,
        mut im: InstanceManager,
    ) -> Result<InstanceManager, DataStoreError> {
        // Keep the node label consistent with the spec no matter what the
        // caller stamped; downstream selectors rely on it.
        im.metadata
            .labels
            .insert(label_key(LABEL_NODE), im.spec.node_id.clone());
        if im.metadata.namespace.is_none() {
            im.metadata.namespace = Some(self.namespace().to_string());
        }
        let created = self.registry.instance_managers().create(im)?;
        let name = created.metadata.name.clone();
        self.verify_creation(&name, || self.registry.instance_managers().get(&name))
            .await
    }

    pub fn delete_instance_manager(&self, name: &str) -> Result<(), DataStoreError> {
        Ok(self.registry.instance_managers().delete(name)?)
    }
}

/// Builds the default disk map for a freshly registered node.
fn create_default_disk(data_path: &str) -> Result<HashMap<String, DiskSpec>, DataStoreError> {
    fs::create_dir_all(data_path).map_err(|err| {
        DataStoreError::Invalid(format!(
            "unable to create default disk directory {:?}: {}",
            data_path, err
        ))
    })?;
    let digest = Sha1::digest(data_path.as_bytes());
    let fingerprint = format!("{:x}", digest);
    let disk_id = format!(
        "{}{}",
        DEFAULT_DISK_PREFIX,
        &fingerprint[..DEFAULT_DISK_FINGERPRINT_LENGTH]
    );
    Ok(HashMap::from([(
        disk_id,
        DiskSpec {
            path: data_path.to_string(),
            allow_scheduling: true,
            storage_reserved: 0,
            tags: Vec::new(),
        },
    )]))
}
