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

use chrono::{SecondsFormat, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use tokio::sync::broadcast;

use crate::quarry::api::types::{InstanceManager, Node, ObjectMeta, Replica, Setting};
use crate::quarry::k8s::node::KubernetesNode;
use crate::quarry::k8s::pod::Pod;

const WATCH_BUFFER_SIZE: usize = 64;

/// Objects a registry collection can hold.
pub trait ApiObject: Clone + Send + Sync + 'static {
    const KIND: &'static str;
    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_api_object {
    ($ty:ty, $kind:literal) => {
        impl ApiObject for $ty {
            const KIND: &'static str = $kind;
            fn metadata(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn metadata_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_api_object!(Node, "Node");
impl_api_object!(Setting, "Setting");
impl_api_object!(Replica, "Replica");
impl_api_object!(InstanceManager, "InstanceManager");
impl_api_object!(Pod, "Pod");
impl_api_object!(KubernetesNode, "KubernetesNode");

#[derive(Debug)]
pub enum RegistryError {
    NotFound { kind: &'static str, name: String },
    AlreadyExists { kind: &'static str, name: String },
    Conflict { kind: &'static str, name: String, message: String },
    Invalid(String),
}

impl Display for RegistryError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::NotFound { kind, name } => {
                write!(f, "{} {:?} not found", kind, name)
            }
            RegistryError::AlreadyExists { kind, name } => {
                write!(f, "{} {:?} already exists", kind, name)
            }
            RegistryError::Conflict { kind, name, message } => {
                write!(f, "conflict updating {} {:?}: {}", kind, name, message)
            }
            RegistryError::Invalid(message) => write!(f, "invalid object: {}", message),
        }
    }
}

impl Error for RegistryError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent<T> {
    pub event_type: WatchEventType,
    pub object: T,
}

/// One typed collection of the in-memory control plane. Reads hand out deep
/// copies; writes check the caller's resource version against the stored one.
pub struct Collection<T: ApiObject> {
    objects: RwLock<HashMap<String, T>>,
    watchers: broadcast::Sender<WatchEvent<T>>,
    version: Arc<AtomicU64>,
}

impl<T: ApiObject> Collection<T> {
    fn new(version: Arc<AtomicU64>) -> Self {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Self {
            objects: RwLock::new(HashMap::new()),
            watchers,
            version,
        }
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, event_type: WatchEventType, object: T) {
        let _ = self.watchers.send(WatchEvent { event_type, object });
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watchers.subscribe()
    }

    pub fn get(&self, name: &str) -> Option<T> {
        let objects = self.objects.read().expect("registry lock poisoned");
        objects.get(name).cloned()
    }

    pub fn list(&self) -> Vec<T> {
        let objects = self.objects.read().expect("registry lock poisoned");
        objects.values().cloned().collect()
    }

    pub fn create(&self, mut object: T) -> Result<T, RegistryError> {
        let name = object.metadata().name.clone();
        if name.is_empty() {
            return Err(RegistryError::Invalid(format!(
                "{} must carry a name",
                T::KIND
            )));
        }
        let mut objects = self.objects.write().expect("registry lock poisoned");
        if objects.contains_key(&name) {
            return Err(RegistryError::AlreadyExists { kind: T::KIND, name });
        }
        let version = self.next_version();
        let meta = object.metadata_mut();
        meta.resource_version = Some(version.clone());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
        }
        objects.insert(name, object.clone());
        drop(objects);
        self.notify(WatchEventType::Added, object.clone());
        Ok(object)
    }

    pub fn update(&self, mut object: T) -> Result<T, RegistryError> {
        let name = object.metadata().name.clone();
        let mut objects = self.objects.write().expect("registry lock poisoned");
        let current = objects
            .get(&name)
            .ok_or_else(|| RegistryError::NotFound {
                kind: T::KIND,
                name: name.clone(),
            })?;

        let current_version = current.metadata().resource_version.clone();
        if object.metadata().resource_version != current_version {
            return Err(RegistryError::Conflict {
                kind: T::KIND,
                name,
                message: format!(
                    "object resource version {:?} does not match stored {:?}",
                    object.metadata().resource_version,
                    current_version
                ),
            });
        }

        // A deleting object whose finalizers have all been removed goes away
        // for good instead of being stored again.
        if current.metadata().deletion_timestamp.is_some()
            && object.metadata().finalizers.is_empty()
        {
            objects.remove(&name);
            drop(objects);
            self.notify(WatchEventType::Deleted, object.clone());
            return Ok(object);
        }

        let version = self.next_version();
        object.metadata_mut().resource_version = Some(version);
        objects.insert(name, object.clone());
        drop(objects);
        self.notify(WatchEventType::Modified, object.clone());
        Ok(object)
    }

    pub fn delete(&self, name: &str) -> Result<(), RegistryError> {
        let mut objects = self.objects.write().expect("registry lock poisoned");
        let current = objects.get_mut(name).ok_or_else(|| RegistryError::NotFound {
            kind: T::KIND,
            name: name.to_string(),
        })?;

        if current.metadata().finalizers.is_empty() {
            let removed = objects.remove(name).expect("object present");
            drop(objects);
            self.notify(WatchEventType::Deleted, removed);
            return Ok(());
        }

        // Finalizers pending: mark for deletion and let their owners unwind.
        if current.metadata().deletion_timestamp.is_none() {
            current.metadata_mut().deletion_timestamp =
                Some(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
            let version = self.next_version();
            current.metadata_mut().resource_version = Some(version);
            let updated = current.clone();
            drop(objects);
            self.notify(WatchEventType::Modified, updated);
        }
        Ok(())
    }
}

/// The node-local view of the cluster control plane: every collection the
/// node controller observes or writes, sharing one resource version counter.
pub struct ClusterRegistry {
    namespace: String,
    server_version: String,
    nodes: Collection<Node>,
    settings: Collection<Setting>,
    replicas: Collection<Replica>,
    pods: Collection<Pod>,
    kube_nodes: Collection<KubernetesNode>,
    instance_managers: Collection<InstanceManager>,
}

impl ClusterRegistry {
    pub fn new(namespace: &str, server_version: &str) -> Arc<Self> {
        let version = Arc::new(AtomicU64::new(0));
        Arc::new(Self {
            namespace: namespace.to_string(),
            server_version: server_version.to_string(),
            nodes: Collection::new(version.clone()),
            settings: Collection::new(version.clone()),
            replicas: Collection::new(version.clone()),
            pods: Collection::new(version.clone()),
            kube_nodes: Collection::new(version.clone()),
            instance_managers: Collection::new(version),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Version string reported by the backing Kubernetes API server.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn nodes(&self) -> &Collection<Node> {
        &self.nodes
    }

    pub fn settings(&self) -> &Collection<Setting> {
        &self.settings
    }

    pub fn replicas(&self) -> &Collection<Replica> {
        &self.replicas
    }

    pub fn pods(&self) -> &Collection<Pod> {
        &self.pods
    }

    pub fn kube_nodes(&self) -> &Collection<KubernetesNode> {
        &self.kube_nodes
    }

    pub fn instance_managers(&self) -> &Collection<InstanceManager> {
        &self.instance_managers
    }
}
