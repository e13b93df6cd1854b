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

use futures_util::future::join_all;
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tokio::task::spawn_blocking;
use tokio_util::sync::CancellationToken;

use crate::quarry::api::conditions::{set_condition, set_condition_and_record};
use crate::quarry::api::types::{
    instance_manager_labels, instance_manager_name, label_key, ConditionStatus,
    DiskConditionReason, DiskConditionType, DiskStatus, InstanceManager, InstanceManagerSpec,
    InstanceManagerState, InstanceManagerType, InstanceState, Node, NodeConditionReason,
    NodeConditionType, ObjectMeta, Replica, Setting, SettingName, API_GROUP, EVENT_REASON_DELETE,
    EVENT_REASON_FAILED_NODE_SYNC, KUBERNETES_TOPOLOGY_LABELS_VERSION, LABEL_NODE,
    SYSTEM_MOUNT_NAME,
};
use crate::quarry::datastore::registry::ClusterRegistry;
use crate::quarry::datastore::{
    error_is_conflict, error_is_not_found, get_owner_references_for_node, DataStore,
    DataStoreError,
};
use crate::quarry::disk::{DiskError, DiskHandler, DiskInfo, LocalDiskHandler};
use crate::quarry::k8s::event::{EventRegistry, EventType, ObjectReference, Recorder};
use crate::quarry::k8s::node::{
    get_region_and_zone, CONDITION_STATUS_TRUE, NODE_CONDITION_DISK_PRESSURE,
    NODE_CONDITION_MEMORY_PRESSURE, NODE_CONDITION_NETWORK_UNAVAILABLE,
    NODE_CONDITION_OUT_OF_DISK, NODE_CONDITION_PID_PRESSURE, NODE_CONDITION_READY,
};
use crate::quarry::k8s::pod::{
    Pod, MOUNT_PROPAGATION_BIDIRECTIONAL, POD_CONDITION_READY, POD_PHASE_RUNNING,
};
use crate::quarry::logger::{log_debug, log_error, log_info, log_warn};
use crate::quarry::scheduler::ReplicaScheduler;
use crate::quarry::util::{is_version_at_least, split_meta_namespace_key};

use super::queue::RateLimitingQueue;
use super::watch::{spawn_watchers, wait_for_cache_sync, CacheSyncGate};

const COMPONENT: &str = "node-controller";
const RECORDER_COMPONENT: &str = "quarry-node-controller";

/// Persistent sync errors stop being retried after this many attempts.
pub const MAX_RETRIES: u32 = 3;

#[derive(Debug)]
pub enum NodeControllerError {
    DataStore(DataStoreError),
    Invariant(String),
    Invalid(String),
    Sync {
        key: String,
        source: Box<NodeControllerError>,
    },
}

impl NodeControllerError {
    pub fn is_conflict(&self) -> bool {
        match self {
            NodeControllerError::DataStore(err) => error_is_conflict(err),
            NodeControllerError::Sync { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

impl Display for NodeControllerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeControllerError::DataStore(err) => write!(f, "{}", err),
            NodeControllerError::Invariant(message) => write!(f, "BUG: {}", message),
            NodeControllerError::Invalid(message) => write!(f, "{}", message),
            NodeControllerError::Sync { key, source } => {
                write!(f, "fail to sync node for {}: {}", key, source)
            }
        }
    }
}

impl Error for NodeControllerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NodeControllerError::DataStore(err) => Some(err),
            NodeControllerError::Sync { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<DataStoreError> for NodeControllerError {
    fn from(err: DataStoreError) -> Self {
        NodeControllerError::DataStore(err)
    }
}

fn node_reference(node: &Node) -> ObjectReference {
    ObjectReference {
        api_version: Some(format!("{}/v1", API_GROUP)),
        kind: Some("Node".to_string()),
        name: Some(node.metadata.name.clone()),
        namespace: node.metadata.namespace.clone(),
        uid: node.metadata.uid.clone(),
    }
}

/// The per-node reconciliation worker. One instance runs on every storage
/// node; each converges the node object it owns and observes the rest.
pub struct NodeController {
    namespace: String,
    controller_id: String,
    ds: Arc<DataStore>,
    registry: Arc<ClusterRegistry>,
    recorder: Recorder,
    scheduler: ReplicaScheduler,
    disks: Arc<dyn DiskHandler>,
    queue: RateLimitingQueue,
}

impl NodeController {
    pub fn new(
        registry: Arc<ClusterRegistry>,
        events: Arc<EventRegistry>,
        namespace: &str,
        controller_id: &str,
    ) -> Arc<Self> {
        Self::with_disk_handler(
            registry,
            events,
            namespace,
            controller_id,
            Arc::new(LocalDiskHandler),
        )
    }

    /// Construction seam for substituting the disk probe and tag-file access.
    pub fn with_disk_handler(
        registry: Arc<ClusterRegistry>,
        events: Arc<EventRegistry>,
        namespace: &str,
        controller_id: &str,
        disks: Arc<dyn DiskHandler>,
    ) -> Arc<Self> {
        let ds = DataStore::new(registry.clone());
        let recorder = Recorder::new(events, RECORDER_COMPONENT, controller_id);
        let scheduler = ReplicaScheduler::new(ds.clone());
        Arc::new(Self {
            namespace: namespace.to_string(),
            controller_id: controller_id.to_string(),
            ds,
            registry,
            recorder,
            scheduler,
            disks,
            queue: RateLimitingQueue::new("quarry-node"),
        })
    }

    pub fn controller_id(&self) -> &str {
        &self.controller_id
    }

    pub fn datastore(&self) -> &Arc<DataStore> {
        &self.ds
    }

    pub(crate) fn registry(&self) -> &Arc<ClusterRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &RateLimitingQueue {
        &self.queue
    }

    // Event fan-in: filters and enqueue targets.

    /// Only the minimal-available-percentage setting can flip a disk's
    /// schedulable verdict.
    pub(crate) fn filter_setting(&self, setting: &Setting) -> bool {
        setting.metadata.name == SettingName::StorageMinimalAvailablePercentage.as_str()
    }

    /// Only replicas placed on the current node are of interest.
    pub(crate) fn filter_replica(&self, replica: &Replica) -> bool {
        replica.spec.node_id == self.controller_id
    }

    pub fn enqueue_node(&self, node: &Node) {
        let namespace = node
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| self.namespace.clone());
        let key = format!("{}/{}", namespace, node.metadata.name);
        self.queue.add_rate_limited(&key);
    }

    pub(crate) fn enqueue_all_nodes(&self) {
        match self.ds.list_nodes() {
            Ok(nodes) => {
                for node in nodes.values() {
                    self.enqueue_node(node);
                }
            }
            Err(err) => {
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "couldn't list nodes for enqueue",
                    &[("error", &message)],
                );
            }
        }
    }

    pub(crate) fn enqueue_replica(&self, replica: &Replica) {
        match self.ds.get_node(&replica.spec.node_id) {
            Ok(node) => self.enqueue_node(&node),
            Err(err) => {
                // No replica is scheduled to an unregistered node; if the
                // node went away first, the replica is about to follow.
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "couldn't get node for replica",
                    &[
                        ("node", &replica.spec.node_id),
                        ("replica", &replica.metadata.name),
                        ("error", &message),
                    ],
                );
            }
        }
    }

    pub(crate) fn enqueue_kubernetes_node(&self, name: &str) {
        match self.ds.get_node(name) {
            Ok(node) => self.enqueue_node(&node),
            Err(err) if error_is_not_found(&err) => {
                // No storage node exists for this Kubernetes node (e.g. a
                // control-plane-only node). Skip it.
            }
            Err(err) => {
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "couldn't get node",
                    &[("node", name), ("error", &message)],
                );
            }
        }
    }

    // Runtime

    /// Runs worker loops until the token is cancelled. Watchers are started
    /// first and the workers only begin after every cache has synced.
    pub async fn run(self: Arc<Self>, workers: usize, cancel: CancellationToken) {
        log_info(COMPONENT, "starting quarry node controller", &[]);

        let gate = Arc::new(CacheSyncGate::new());
        let watcher_handles = spawn_watchers(self.clone(), gate.clone(), cancel.clone());

        if !wait_for_cache_sync("quarry-node", &gate, &cancel).await {
            self.queue.shut_down();
            for handle in watcher_handles {
                let _ = handle.await;
            }
            return;
        }

        let mut worker_handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let controller = self.clone();
            worker_handles.push(tokio::spawn(async move {
                controller.worker().await;
            }));
        }

        cancel.cancelled().await;
        self.queue.shut_down();
        for handle in worker_handles {
            let _ = handle.await;
        }
        for handle in watcher_handles {
            let _ = handle.await;
        }
        log_info(COMPONENT, "shutting down quarry node controller", &[]);
    }

    async fn worker(&self) {
        while let Some(key) = self.queue.get().await {
            let result = self.sync_node(&key).await;
            self.handle_err(result, &key);
            self.queue.done(&key);
        }
    }

    fn handle_err(&self, result: Result<(), NodeControllerError>, key: &str) {
        let err = match result {
            Ok(()) => {
                self.queue.forget(key);
                return;
            }
            Err(err) => err,
        };

        let message = err.to_string();
        if self.queue.num_requeues(key) < MAX_RETRIES {
            log_warn(
                COMPONENT,
                "error syncing node",
                &[("node", key), ("error", &message)],
            );
            self.queue.add_rate_limited(key);
            return;
        }

        log_warn(
            COMPONENT,
            "dropping node out of the queue",
            &[("node", key), ("error", &message)],
        );
        let (namespace, name) = match split_meta_namespace_key(key) {
            Ok(parts) => parts,
            Err(_) => ("", key),
        };
        self.recorder.event(
            ObjectReference {
                api_version: Some(format!("{}/v1", API_GROUP)),
                kind: Some("Node".to_string()),
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                uid: None,
            },
            EventType::Warning,
            EVENT_REASON_FAILED_NODE_SYNC,
            format!("Dropping node {} out of the queue: {}", key, message),
        );
        self.queue.forget(key);
    }

    /// Reconciles one node key end to end. Status is written back once, at
    /// the end, and only when it changed and no step failed.
    pub async fn sync_node(&self, key: &str) -> Result<(), NodeControllerError> {
        let (namespace, name) = split_meta_namespace_key(key)
            .map_err(|err| NodeControllerError::Invalid(err.to_string()))?;
        if namespace != self.namespace {
            // Not ours, don't do anything
            return Ok(());
        }

        let mut node = match self.ds.get_node(name) {
            Ok(node) => node,
            Err(err) if error_is_not_found(&err) => {
                log_error(COMPONENT, "node has been deleted", &[("node", key)]);
                return Ok(());
            }
            Err(err) => {
                return Err(self.wrap(key, err.into()));
            }
        };

        if node.metadata.deletion_timestamp.is_some() {
            self.recorder.event(
                node_reference(&node),
                EventType::Warning,
                EVENT_REASON_DELETE,
                format!("Deleting node {}", node.metadata.name),
            );
            return self
                .ds
                .remove_finalizer_for_node(&node)
                .await
                .map_err(|err| self.wrap(key, err.into()));
        }

        let existing_status = node.status.clone();
        let mut result = self.sync_node_states(&mut node).await;

        // Deferred writeback: only when the sync succeeded and the status
        // actually moved.
        if result.is_ok() && existing_status != node.status {
            if let Err(err) = self.ds.update_node_status(node.clone()).await {
                result = Err(err.into());
            }
        }

        if let Err(err) = &result {
            // Another actor beat us; the only correct response is re-enqueue.
            if err.is_conflict() {
                let message = err.to_string();
                log_debug(
                    COMPONENT,
                    "requeue node due to conflict",
                    &[("node", key), ("error", &message)],
                );
                self.enqueue_node(&node);
                return Ok(());
            }
        }

        result.map_err(|err| self.wrap(key, err))
    }

    fn wrap(&self, key: &str, err: NodeControllerError) -> NodeControllerError {
        NodeControllerError::Sync {
            key: key.to_string(),
            source: Box::new(err),
        }
    }

    async fn sync_node_states(&self, node: &mut Node) -> Result<(), NodeControllerError> {
        // Object identity never changes during a sync; compute the event
        // reference once up front.
        let involved = node_reference(node);

        // sync node state by manager pod
        let manager_pods = self.ds.list_manager_pods()?;
        let mut node_manager_found = false;
        for pod in &manager_pods {
            if pod.spec.node_name != node.metadata.name {
                continue;
            }
            node_manager_found = true;
            for pod_condition in &pod.status.conditions {
                if pod_condition.condition_type != POD_CONDITION_READY {
                    continue;
                }
                if pod_condition.status == CONDITION_STATUS_TRUE
                    && pod.status.phase == POD_PHASE_RUNNING
                {
                    set_condition_and_record(
                        &mut node.status.conditions,
                        NodeConditionType::Ready.as_str(),
                        ConditionStatus::True,
                        "",
                        &format!("Node {} is ready", node.metadata.name),
                        &self.recorder,
                        involved.clone(),
                        EventType::Normal,
                    );
                } else {
                    set_condition_and_record(
                        &mut node.status.conditions,
                        NodeConditionType::Ready.as_str(),
                        ConditionStatus::False,
                        NodeConditionReason::ManagerPodDown.as_str(),
                        &format!(
                            "Node {} is down: the manager pod {} is not running",
                            node.metadata.name, pod.metadata.name
                        ),
                        &self.recorder,
                        involved.clone(),
                        EventType::Warning,
                    );
                }
                break;
            }
            break;
        }

        if !node_manager_found {
            set_condition_and_record(
                &mut node.status.conditions,
                NodeConditionType::Ready.as_str(),
                ConditionStatus::False,
                NodeConditionReason::ManagerPodMissing.as_str(),
                &format!(
                    "manager pod missing: node {} has no manager pod running on it",
                    node.metadata.name
                ),
                &self.recorder,
                involved.clone(),
                EventType::Warning,
            );
        }

        // sync node state with the kubernetes node status
        match self.ds.get_kubernetes_node(&node.metadata.name) {
            Err(err) if error_is_not_found(&err) => {
                // the kubernetes node has been removed from the cluster
                set_condition_and_record(
                    &mut node.status.conditions,
                    NodeConditionType::Ready.as_str(),
                    ConditionStatus::False,
                    NodeConditionReason::KubernetesNodeGone.as_str(),
                    &format!(
                        "Kubernetes node missing: node {} has been removed from the cluster \
                         and there is no manager pod running on it",
                        node.metadata.name
                    ),
                    &self.recorder,
                    involved.clone(),
                    EventType::Warning,
                );
            }
            Err(err) => return Err(err.into()),
            Ok(kube_node) => {
                for condition in &kube_node.status.conditions {
                    match condition.condition_type.as_str() {
                        NODE_CONDITION_READY => {
                            if condition.status != CONDITION_STATUS_TRUE {
                                set_condition_and_record(
                                    &mut node.status.conditions,
                                    NodeConditionType::Ready.as_str(),
                                    ConditionStatus::False,
                                    NodeConditionReason::KubernetesNodeNotReady.as_str(),
                                    &format!(
                                        "Kubernetes node {} not ready: {}",
                                        node.metadata.name, condition.reason
                                    ),
                                    &self.recorder,
                                    involved.clone(),
                                    EventType::Warning,
                                );
                            }
                        }
                        NODE_CONDITION_OUT_OF_DISK
                        | NODE_CONDITION_DISK_PRESSURE
                        | NODE_CONDITION_PID_PRESSURE
                        | NODE_CONDITION_MEMORY_PRESSURE
                        | NODE_CONDITION_NETWORK_UNAVAILABLE => {
                            if condition.status == CONDITION_STATUS_TRUE {
                                set_condition_and_record(
                                    &mut node.status.conditions,
                                    NodeConditionType::Ready.as_str(),
                                    ConditionStatus::False,
                                    NodeConditionReason::KubernetesNodePressure.as_str(),
                                    &format!(
                                        "Kubernetes node {} has pressure: {}, {}",
                                        node.metadata.name, condition.reason, condition.message
                                    ),
                                    &self.recorder,
                                    involved.clone(),
                                    EventType::Warning,
                                );
                            }
                        }
                        _ => {
                            if condition.status == CONDITION_STATUS_TRUE {
                                self.recorder.event(
                                    involved.clone(),
                                    EventType::Warning,
                                    NodeConditionReason::UnknownNodeConditionTrue.as_str(),
                                    format!(
                                        "Unknown condition true of kubernetes node {}: \
                                         condition type is {}, reason is {}, message is {}",
                                        node.metadata.name,
                                        condition.condition_type,
                                        condition.reason,
                                        condition.message
                                    ),
                                );
                            }
                        }
                    }
                }

                let disable_scheduling_on_cordoned_node = self
                    .ds
                    .get_setting_as_bool(SettingName::DisableSchedulingOnCordonedNode)
                    .map_err(|err| {
                        let message = err.to_string();
                        log_error(
                            COMPONENT,
                            "error getting disable scheduling on cordoned node setting",
                            &[("error", &message)],
                        );
                        NodeControllerError::from(err)
                    })?;

                if disable_scheduling_on_cordoned_node && kube_node.spec.unschedulable {
                    set_condition_and_record(
                        &mut node.status.conditions,
                        NodeConditionType::Schedulable.as_str(),
                        ConditionStatus::False,
                        NodeConditionReason::KubernetesNodeCordoned.as_str(),
                        &format!("Node {} is cordoned", node.metadata.name),
                        &self.recorder,
                        involved.clone(),
                        EventType::Normal,
                    );
                } else {
                    set_condition_and_record(
                        &mut node.status.conditions,
                        NodeConditionType::Schedulable.as_str(),
                        ConditionStatus::True,
                        "",
                        "",
                        &self.recorder,
                        involved.clone(),
                        EventType::Normal,
                    );
                }

                let using_topology_labels = is_version_at_least(
                    self.ds.kubernetes_version(),
                    KUBERNETES_TOPOLOGY_LABELS_VERSION,
                );
                let (region, zone) =
                    get_region_and_zone(&kube_node.metadata.labels, using_topology_labels);
                node.status.region = region;
                node.status.zone = zone;
            }
        }

        if self.controller_id != node.metadata.name {
            // the remaining work is owner-restricted
            return Ok(());
        }

        // sync disks status on the current node
        self.sync_disk_status(node).await?;

        // sync mount propagation status on the current node
        for pod in &manager_pods {
            if pod.spec.node_name == node.metadata.name {
                self.sync_mount_propagation(pod, node);
            }
        }

        self.sync_instance_managers(node).await?;

        Ok(())
    }

    async fn get_disk_info_map(&self, node: &Node) -> HashMap<String, Result<DiskInfo, DiskError>> {
        let probes: Vec<_> = node
            .spec
            .disks
            .iter()
            .map(|(id, disk)| {
                let handler = self.disks.clone();
                let id = id.clone();
                let path = disk.path.clone();
                async move {
                    let result = match spawn_blocking(move || handler.get_disk_info(&path)).await {
                        Ok(result) => result,
                        Err(join_err) => Err(DiskError::Io {
                            path: String::new(),
                            source: std::io::Error::new(std::io::ErrorKind::Other, join_err),
                        }),
                    };
                    (id, result)
                }
            })
            .collect();
        join_all(probes).await.into_iter().collect()
    }

    async fn get_disk_config(&self, path: &str) -> Result<crate::quarry::disk::DiskConfig, DiskError> {
        let handler = self.disks.clone();
        let path = path.to_string();
        match spawn_blocking(move || handler.get_disk_config(&path)).await {
            Ok(result) => result,
            Err(join_err) => Err(DiskError::Io {
                path: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, join_err),
            }),
        }
    }

    async fn generate_disk_config(
        &self,
        path: &str,
    ) -> Result<crate::quarry::disk::DiskConfig, DiskError> {
        let handler = self.disks.clone();
        let path = path.to_string();
        match spawn_blocking(move || handler.generate_disk_config(&path)).await {
            Ok(result) => result,
            Err(join_err) => Err(DiskError::Io {
                path: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::Other, join_err),
            }),
        }
    }

    /// Check whether another disk sharing the filesystem id is already ready.
    fn is_fsid_duplicated_with_existing_ready_disk(
        name: &str,
        disks: &[String],
        disk_status_map: &HashMap<String, DiskStatus>,
    ) -> bool {
        if disks.len() <= 1 {
            return false;
        }
        for other_name in disks {
            if other_name == name {
                continue;
            }
            let Some(other_status) = disk_status_map.get(other_name) else {
                continue;
            };
            let ready = crate::quarry::api::conditions::get_condition(
                &other_status.conditions,
                DiskConditionType::Ready.as_str(),
            );
            if ready.status == ConditionStatus::True {
                return true;
            }
        }
        false
    }

    async fn sync_disk_status(&self, node: &mut Node) -> Result<(), NodeControllerError> {
        // sync the disks between node.spec.disks and node.status.disk_status
        for id in node.spec.disks.keys() {
            let disk_status = node.status.disk_status.entry(id.clone()).or_default();
            // when conditions are not ready, the old storage data should be cleaned
            disk_status.storage_maximum = 0;
            disk_status.storage_available = 0;
        }
        node.status
            .disk_status
            .retain(|id, _| node.spec.disks.contains_key(id));

        let disk_info_map = self.get_disk_info_map(node).await;

        // update the Ready condition
        let mut fsid_to_disks: HashMap<String, Vec<String>> = HashMap::new();
        for (id, info) in &disk_info_map {
            match info {
                Err(err) => {
                    let path = node
                        .spec
                        .disks
                        .get(id)
                        .map(|disk| disk.path.clone())
                        .unwrap_or_default();
                    let message = format!(
                        "Disk {}({}) on node {} is not ready: Get disk information error: {}",
                        id, path, node.metadata.name, err
                    );
                    self.set_disk_condition(
                        node,
                        id,
                        DiskConditionType::Ready,
                        ConditionStatus::False,
                        DiskConditionReason::NoDiskInfo.as_str(),
                        &message,
                        EventType::Warning,
                    );
                }
                Ok(entry) => {
                    fsid_to_disks
                        .entry(entry.fsid.clone())
                        .or_default()
                        .push(id.clone());
                }
            }
        }

        for (fsid, disks) in &fsid_to_disks {
            for id in disks {
                let Some(disk) = node.spec.disks.get(id).cloned() else {
                    continue;
                };
                let mut disk_uuid = String::new();
                match self.get_disk_config(&disk.path).await {
                    Ok(config) => disk_uuid = config.disk_uuid,
                    Err(err) if err.is_not_found() => {
                        // permissible: a fresh disk has no tag file yet
                    }
                    Err(err) => {
                        let message = format!(
                            "Disk {}({}) on node {} is not ready: failed to get disk config: \
                             error: {}",
                            id, disk.path, node.metadata.name, err
                        );
                        self.set_disk_condition(
                            node,
                            id,
                            DiskConditionType::Ready,
                            ConditionStatus::False,
                            DiskConditionReason::NoDiskInfo.as_str(),
                            &message,
                            EventType::Warning,
                        );
                        continue;
                    }
                }

                let recorded_uuid = node
                    .status
                    .disk_status
                    .get(id)
                    .map(|status| status.disk_uuid.clone())
                    .unwrap_or_default();

                if recorded_uuid.is_empty() {
                    // Check disks in the same filesystem
                    if Self::is_fsid_duplicated_with_existing_ready_disk(
                        id,
                        disks,
                        &node.status.disk_status,
                    ) {
                        // Found multiple disks in the same filesystem
                        let message = format!(
                            "Disk {}({}) on node {} is not ready: disk has same file system \
                             ID {} as other disks {:?}",
                            id, disk.path, node.metadata.name, fsid, disks
                        );
                        self.set_disk_condition(
                            node,
                            id,
                            DiskConditionType::Ready,
                            ConditionStatus::False,
                            DiskConditionReason::DiskFilesystemChanged.as_str(),
                            &message,
                            EventType::Warning,
                        );
                        continue;
                    }

                    if disk_uuid.is_empty() {
                        match self.generate_disk_config(&disk.path).await {
                            Ok(config) => disk_uuid = config.disk_uuid,
                            Err(err) => {
                                let message = format!(
                                    "Disk {}({}) on node {} is not ready: failed to generate \
                                     disk config: error: {}",
                                    id, disk.path, node.metadata.name, err
                                );
                                self.set_disk_condition(
                                    node,
                                    id,
                                    DiskConditionType::Ready,
                                    ConditionStatus::False,
                                    DiskConditionReason::NoDiskInfo.as_str(),
                                    &message,
                                    EventType::Warning,
                                );
                                continue;
                            }
                        }
                    }
                    if let Some(status) = node.status.disk_status.get_mut(id) {
                        status.disk_uuid = disk_uuid.clone();
                    }
                } else {
                    if disk_uuid.is_empty() {
                        let message = format!(
                            "Disk {}({}) on node {} is not ready: cannot find disk config \
                             file, maybe due to a mount error",
                            id, disk.path, node.metadata.name
                        );
                        self.set_disk_condition(
                            node,
                            id,
                            DiskConditionType::Ready,
                            ConditionStatus::False,
                            DiskConditionReason::DiskFilesystemChanged.as_str(),
                            &message,
                            EventType::Warning,
                        );
                    } else if recorded_uuid != disk_uuid {
                        let message = format!(
                            "Disk {}({}) on node {} is not ready: record diskUUID doesn't \
                             match the one on the disk",
                            id, disk.path, node.metadata.name
                        );
                        self.set_disk_condition(
                            node,
                            id,
                            DiskConditionType::Ready,
                            ConditionStatus::False,
                            DiskConditionReason::DiskFilesystemChanged.as_str(),
                            &message,
                            EventType::Warning,
                        );
                    }
                }

                let current_uuid = node
                    .status
                    .disk_status
                    .get(id)
                    .map(|status| status.disk_uuid.clone())
                    .unwrap_or_default();
                if !current_uuid.is_empty() && current_uuid == disk_uuid {
                    if let (Some(Ok(info)), Some(status)) =
                        (disk_info_map.get(id), node.status.disk_status.get_mut(id))
                    {
                        status.storage_maximum = info.storage_maximum;
                        status.storage_available = info.storage_available;
                    }
                    let message = format!(
                        "Disk {}({}) on node {} is ready",
                        id, disk.path, node.metadata.name
                    );
                    self.set_disk_condition(
                        node,
                        id,
                        DiskConditionType::Ready,
                        ConditionStatus::True,
                        "",
                        &message,
                        EventType::Normal,
                    );
                }
            }
        }

        // update the Schedulable condition
        let mut replica_disk_map = self.ds.list_replicas_by_node(&node.metadata.name)?;
        let minimal_available_percentage = self
            .ds
            .get_setting_as_int(SettingName::StorageMinimalAvailablePercentage)?;

        let disk_ids: Vec<String> = node.spec.disks.keys().cloned().collect();
        for id in disk_ids {
            let Some(disk) = node.spec.disks.get(&id).cloned() else {
                continue;
            };

            // calculate storage scheduled
            let mut scheduled_replica = HashMap::new();
            let mut storage_scheduled: i64 = 0;
            for replica in replica_disk_map.remove(&id).unwrap_or_default() {
                storage_scheduled += replica.spec.volume_size;
                scheduled_replica.insert(replica.metadata.name.clone(), replica.spec.volume_size);
            }
            let Some(disk_status) = node.status.disk_status.get_mut(&id) else {
                continue;
            };
            disk_status.storage_scheduled = storage_scheduled;
            disk_status.scheduled_replica = scheduled_replica;

            // check disk pressure
            let info = self
                .scheduler
                .get_disk_scheduling_info(&disk, disk_status)?;
            if !self.scheduler.is_schedulable_to_disk(0, 0, &info) {
                let message = format!(
                    "the disk {}({}) on the node {} has {} available, but requires reserved \
                     {}, minimal {}% to schedule more replicas",
                    id,
                    disk.path,
                    node.metadata.name,
                    info.storage_available,
                    disk.storage_reserved,
                    minimal_available_percentage
                );
                self.set_disk_condition(
                    node,
                    &id,
                    DiskConditionType::Schedulable,
                    ConditionStatus::False,
                    DiskConditionReason::DiskPressure.as_str(),
                    &message,
                    EventType::Warning,
                );
            } else {
                let message = format!(
                    "Disk {}({}) on node {} is schedulable",
                    id, disk.path, node.metadata.name
                );
                self.set_disk_condition(
                    node,
                    &id,
                    DiskConditionType::Schedulable,
                    ConditionStatus::True,
                    "",
                    &message,
                    EventType::Normal,
                );
            }
        }

        // replicas pointing at disks that are gone from the spec get logged
        // for the operator; reconciling them is another controller's policy
        if !replica_disk_map.is_empty() {
            let orphaned: Vec<String> = replica_disk_map
                .values()
                .flatten()
                .map(|replica| replica.metadata.name.clone())
                .collect();
            let joined = orphaned.join(", ");
            log_error(
                COMPONENT,
                "these replicas have been assigned to a disk that no longer exists",
                &[("node", &node.metadata.name), ("replicas", &joined)],
            );
        }

        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn set_disk_condition(
        &self,
        node: &mut Node,
        disk_id: &str,
        condition_type: DiskConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        event_type: EventType,
    ) {
        let involved = node_reference(node);
        let Some(disk_status) = node.status.disk_status.get_mut(disk_id) else {
            return;
        };
        set_condition_and_record(
            &mut disk_status.conditions,
            condition_type.as_str(),
            status,
            reason,
            message,
            &self.recorder,
            involved,
            event_type,
        );
    }

    /// The bidirectional mount propagation of the system volume decides
    /// whether the CSI driver can be deployed on the node. Descriptive only;
    /// no event is emitted on transition.
    fn sync_mount_propagation(&self, pod: &Pod, node: &mut Node) {
        let Some(container) = pod.spec.containers.first() else {
            return;
        };
        for mount in &container.volume_mounts {
            if mount.name != SYSTEM_MOUNT_NAME {
                continue;
            }
            let propagation = mount.mount_propagation.as_deref();
            if propagation != Some(MOUNT_PROPAGATION_BIDIRECTIONAL) {
                let propagation_str = propagation.unwrap_or("nil");
                set_condition(
                    &mut node.status.conditions,
                    NodeConditionType::MountPropagation.as_str(),
                    ConditionStatus::False,
                    NodeConditionReason::NoMountPropagationSupport.as_str(),
                    &format!(
                        "The MountPropagation value {} is not detected from pod {}, node {}",
                        propagation_str, pod.metadata.name, pod.spec.node_name
                    ),
                );
            } else {
                set_condition(
                    &mut node.status.conditions,
                    NodeConditionType::MountPropagation.as_str(),
                    ConditionStatus::True,
                    "",
                    "",
                );
            }
            break;
        }
    }

    async fn sync_instance_managers(&self, node: &Node) -> Result<(), NodeControllerError> {
        let default_instance_manager_image = self
            .ds
            .get_setting_value_existed(SettingName::DefaultInstanceManagerImage)?;

        let mut im_types = vec![InstanceManagerType::Engine];

        // Clean up all replica managers if there is no disk on the node
        if node.spec.disks.is_empty() {
            let replica_managers = self
                .ds
                .list_instance_managers_by_node(&node.metadata.name, InstanceManagerType::Replica)?;
            for rm in replica_managers.values() {
                log_debug(
                    COMPONENT,
                    "cleaning up the replica manager since there is no available disk on the node",
                    &[
                        ("instance_manager", &rm.metadata.name),
                        ("node", &node.metadata.name),
                    ],
                );
                self.ds.delete_instance_manager(&rm.metadata.name)?;
            }
        } else {
            im_types.push(InstanceManagerType::Replica);
        }

        for im_type in im_types {
            let mut default_instance_manager_created = false;
            let im_map = self
                .ds
                .list_instance_managers_by_node(&node.metadata.name, im_type)?;
            for im in im_map.values() {
                let node_label = im
                    .metadata
                    .labels
                    .get(&label_key(LABEL_NODE))
                    .cloned()
                    .unwrap_or_default();
                if node_label != im.spec.node_id {
                    return Err(NodeControllerError::Invariant(format!(
                        "instance manager {} NodeID {} is not consistent with the label {}={}",
                        im.metadata.name,
                        im.spec.node_id,
                        label_key(LABEL_NODE),
                        node_label
                    )));
                }

                let mut cleanup_required = true;
                if im.spec.image == default_instance_manager_image {
                    // Create default instance manager if needed.
                    default_instance_manager_created = true;
                    cleanup_required = false;
                } else {
                    // Clean up old instance managers only when they hold no
                    // running or starting instance.
                    if im.status.current_state == InstanceManagerState::Running
                        && im.metadata.deletion_timestamp.is_none()
                    {
                        for state in im.status.instances.values() {
                            if matches!(state, InstanceState::Running | InstanceState::Starting) {
                                cleanup_required = false;
                                break;
                            }
                        }
                    }
                }
                if cleanup_required {
                    log_debug(
                        COMPONENT,
                        "cleaning up the redundant instance manager with no running or \
                         starting instance",
                        &[("instance_manager", &im.metadata.name)],
                    );
                    self.ds.delete_instance_manager(&im.metadata.name)?;
                }
            }

            if !default_instance_manager_created {
                let im_name = instance_manager_name(
                    im_type,
                    &node.metadata.name,
                    &default_instance_manager_image,
                );
                log_debug(
                    COMPONENT,
                    "creating the default instance manager",
                    &[
                        ("instance_manager", &im_name),
                        ("node", &node.metadata.name),
                        ("image", &default_instance_manager_image),
                        ("type", im_type.as_str()),
                    ],
                );
                self.create_instance_manager(
                    node,
                    &im_name,
                    &default_instance_manager_image,
                    im_type,
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn create_instance_manager(
        &self,
        node: &Node,
        im_name: &str,
        image: &str,
        im_type: InstanceManagerType,
    ) -> Result<InstanceManager, NodeControllerError> {
        let instance_manager = InstanceManager {
            metadata: ObjectMeta {
                name: im_name.to_string(),
                labels: instance_manager_labels(&node.metadata.name, image, im_type),
                owner_references: get_owner_references_for_node(node),
                ..ObjectMeta::default()
            },
            spec: InstanceManagerSpec {
                image: image.to_string(),
                node_id: node.metadata.name.clone(),
                im_type,
            },
            status: Default::default(),
        };

        Ok(self.ds.create_instance_manager(instance_manager).await?)
    }
}
