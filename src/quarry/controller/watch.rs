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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::quarry::api::types::MANAGER_CONTAINER_NAME;
use crate::quarry::datastore::registry::WatchEventType;
use crate::quarry::logger::{log_info, log_warn};

use super::node::NodeController;

const COMPONENT: &str = "node-watch";
const CACHE_SYNC_POLL_INTERVAL: Duration = Duration::from_millis(50);

const SOURCE_COUNT: usize = 5;

/// The five object kinds feeding the per-node work queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSource {
    Node = 0,
    Setting = 1,
    Replica = 2,
    ManagerPod = 3,
    KubernetesNode = 4,
}

/// Tracks which informer caches have completed their initial list. Workers
/// must not start before every source has synced.
pub struct CacheSyncGate {
    synced: [AtomicBool; SOURCE_COUNT],
}

impl CacheSyncGate {
    pub fn new() -> Self {
        Self {
            synced: Default::default(),
        }
    }

    pub fn mark_synced(&self, source: WatchSource) {
        self.synced[source as usize].store(true, Ordering::SeqCst);
    }

    pub fn has_synced(&self) -> bool {
        self.synced.iter().all(|flag| flag.load(Ordering::SeqCst))
    }
}

impl Default for CacheSyncGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Blocks until every watcher has completed its initial list, or the stop
/// token fires first.
pub async fn wait_for_cache_sync(
    name: &str,
    gate: &CacheSyncGate,
    cancel: &CancellationToken,
) -> bool {
    log_info(
        COMPONENT,
        "waiting for informer caches to sync",
        &[("controller", name)],
    );
    loop {
        if gate.has_synced() {
            log_info(
                COMPONENT,
                "informer caches synced",
                &[("controller", name)],
            );
            return true;
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                log_warn(
                    COMPONENT,
                    "cache sync interrupted by shutdown",
                    &[("controller", name)],
                );
                return false;
            }
            _ = sleep(CACHE_SYNC_POLL_INTERVAL) => {}
        }
    }
}

/// Starts the five watch loops translating cluster events into node keys.
pub fn spawn_watchers(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_node_watcher(controller.clone(), gate.clone(), cancel.clone()),
        spawn_setting_watcher(controller.clone(), gate.clone(), cancel.clone()),
        spawn_replica_watcher(controller.clone(), gate.clone(), cancel.clone()),
        spawn_manager_pod_watcher(controller.clone(), gate.clone(), cancel.clone()),
        spawn_kubernetes_node_watcher(controller, gate, cancel),
    ]
}

fn spawn_node_watcher(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = controller.registry().nodes().watch();
        for node in controller.registry().nodes().list() {
            controller.enqueue_node(&node);
        }
        gate.mark_synced(WatchSource::Node);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => controller.enqueue_node(&event.object),
                    Err(RecvError::Lagged(missed)) => {
                        let missed = missed.to_string();
                        log_warn(
                            COMPONENT,
                            "node watch lagged, resyncing every node",
                            &[("missed", &missed)],
                        );
                        controller.enqueue_all_nodes();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

fn spawn_setting_watcher(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = controller.registry().settings().watch();
        gate.mark_synced(WatchSource::Setting);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        // A deleted setting snaps back to its default and is
                        // recreated; only add/update are actionable.
                        if event.event_type == WatchEventType::Deleted {
                            continue;
                        }
                        if controller.filter_setting(&event.object) {
                            controller.enqueue_all_nodes();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let missed = missed.to_string();
                        log_warn(
                            COMPONENT,
                            "setting watch lagged, resyncing every node",
                            &[("missed", &missed)],
                        );
                        controller.enqueue_all_nodes();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

fn spawn_replica_watcher(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = controller.registry().replicas().watch();
        gate.mark_synced(WatchSource::Replica);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        if controller.filter_replica(&event.object) {
                            controller.enqueue_replica(&event.object);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let missed = missed.to_string();
                        log_warn(
                            COMPONENT,
                            "replica watch lagged, resyncing every node",
                            &[("missed", &missed)],
                        );
                        controller.enqueue_all_nodes();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

fn spawn_manager_pod_watcher(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = controller.registry().pods().watch();
        gate.mark_synced(WatchSource::ManagerPod);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        // A manager pod can be unscheduled to any node, so
                        // every node's readiness may have changed.
                        if event.object.has_container(MANAGER_CONTAINER_NAME) {
                            controller.enqueue_all_nodes();
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let missed = missed.to_string();
                        log_warn(
                            COMPONENT,
                            "pod watch lagged, resyncing every node",
                            &[("missed", &missed)],
                        );
                        controller.enqueue_all_nodes();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}

fn spawn_kubernetes_node_watcher(
    controller: Arc<NodeController>,
    gate: Arc<CacheSyncGate>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = controller.registry().kube_nodes().watch();
        gate.mark_synced(WatchSource::KubernetesNode);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => {
                        // Creation is handled by the node bootstrapper; only
                        // changes and removals feed back into node status.
                        if event.event_type == WatchEventType::Added {
                            continue;
                        }
                        controller.enqueue_kubernetes_node(&event.object.metadata.name);
                    }
                    Err(RecvError::Lagged(missed)) => {
                        let missed = missed.to_string();
                        log_warn(
                            COMPONENT,
                            "kubernetes node watch lagged, resyncing every node",
                            &[("missed", &missed)],
                        );
                        controller.enqueue_all_nodes();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    })
}
