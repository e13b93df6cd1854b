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

use std::collections::HashSet;
use std::time::Duration;
use tokio::time::timeout;

use quarry::quarry::api::types::{
    ConditionStatus, DiskConditionReason, DiskConditionType, InstanceManagerType,
    NodeConditionReason, NodeConditionType, SettingName, EVENT_REASON_DELETE,
};
use quarry::quarry::controller::node::NodeController;
use quarry::quarry::datastore::error_is_not_found;
use quarry::quarry::datastore::registry::ClusterRegistry;
use quarry::quarry::disk::{DiskHandler, LocalDiskHandler};
use quarry::quarry::k8s::event::EventRegistry;
use quarry::quarry::k8s::node::KubernetesNodeCondition;
use quarry::quarry::test_support::test_output_dir;

use crate::support::{
    disk_condition, disk_spec, harness, kube_node_ready, node_condition, ready_manager_pod,
    replica, set_setting, test_node, DEFAULT_IMAGE, GIB, NAMESPACE,
};

#[tokio::test]
async fn cold_boot_brings_a_fresh_disk_online() {
    let registry = ClusterRegistry::new(NAMESPACE, "v1.17.2");
    let events = EventRegistry::new();
    let controller = NodeController::new(registry.clone(), events.clone(), NAMESPACE, "node-1");
    let ds = controller.datastore();
    ds.init_settings().unwrap();
    set_setting(ds, SettingName::DefaultInstanceManagerImage, DEFAULT_IMAGE);
    // The test filesystem may be arbitrarily full; only the probe wiring is
    // under test here, not the capacity policy.
    set_setting(ds, SettingName::StorageMinimalAvailablePercentage, "0");

    let dir = test_output_dir("cold-boot");
    let path = dir.to_string_lossy().to_string();
    registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec(&path, 0))]))
        .unwrap();
    registry.pods().create(ready_manager_pod("node-1")).unwrap();
    registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    controller.sync_node("quarry-system/node-1").await.unwrap();

    let node = ds.get_node("node-1").unwrap();
    assert_eq!(
        node_condition(&node, NodeConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    assert_eq!(
        node_condition(&node, NodeConditionType::Schedulable.as_str()).status,
        ConditionStatus::True
    );
    assert_eq!(
        node_condition(&node, NodeConditionType::MountPropagation.as_str()).status,
        ConditionStatus::True
    );
    assert_eq!(node.status.region, "region-1");
    assert_eq!(node.status.zone, "zone-1");

    // The tag file was written and its UUID recorded.
    let written = LocalDiskHandler.get_disk_config(&path).unwrap();
    let disk_status = node.status.disk_status.get("disk-1").unwrap();
    assert_eq!(disk_status.disk_uuid, written.disk_uuid);
    assert!(disk_status.storage_maximum > 0);
    assert_eq!(
        disk_condition(&node, "disk-1", DiskConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    assert_eq!(
        disk_condition(&node, "disk-1", DiskConditionType::Schedulable.as_str()).status,
        ConditionStatus::True
    );

    // One default-image manager per type.
    let engines = ds
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines.values().next().unwrap().spec.image, DEFAULT_IMAGE);
    let replicas = ds
        .list_instance_managers_by_node("node-1", InstanceManagerType::Replica)
        .unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas.values().next().unwrap().spec.image, DEFAULT_IMAGE);

    // A second pass keeps every verdict and emits no further events. The
    // storage counters may move with the live filesystem; the conditions and
    // the recorded identity may not.
    let events_after_first = events.list().len();
    controller.sync_node("quarry-system/node-1").await.unwrap();
    let resynced = ds.get_node("node-1").unwrap();
    assert_eq!(
        resynced.status.disk_status["disk-1"].disk_uuid,
        written.disk_uuid
    );
    assert_eq!(
        disk_condition(&resynced, "disk-1", DiskConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    assert_eq!(events.list().len(), events_after_first);
}

#[tokio::test]
async fn disk_status_map_tracks_spec_disks() {
    let h = harness("node-1");
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 80 * GIB);
    h.disks.set_info("/mnt/d2", "fs-2", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node(
            "node-1",
            vec![
                ("disk-1", disk_spec("/mnt/d1", 0)),
                ("disk-2", disk_spec("/mnt/d2", 0)),
            ],
        ))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let status_keys: HashSet<_> = node.status.disk_status.keys().cloned().collect();
    let spec_keys: HashSet<_> = node.spec.disks.keys().cloned().collect();
    assert_eq!(status_keys, spec_keys);

    // Dropping a disk from the spec drops its status entry on the next pass.
    let mut updated = node.clone();
    updated.spec.disks.remove("disk-2");
    h.ds().update_node(updated).await.unwrap();
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    assert_eq!(node.status.disk_status.len(), 1);
    assert!(node.status.disk_status.contains_key("disk-1"));
}

#[tokio::test]
async fn filesystem_swap_marks_the_disk_not_ready_and_keeps_the_uuid() {
    let h = harness("node-1");
    h.disks.set_info("/mnt/d1", "fs-old", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let recorded = node.status.disk_status["disk-1"].disk_uuid.clone();
    assert!(!recorded.is_empty());
    assert_eq!(
        disk_condition(&node, "disk-1", DiskConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );

    // A different, empty filesystem is mounted in place of the old one.
    h.disks.remove_config("/mnt/d1");
    h.disks.set_info("/mnt/d1", "fs-new", 50 * GIB, 50 * GIB);
    // The fake regenerates a tag only on request; a swapped filesystem must
    // never get that far because the recorded UUID wins.
    h.sync("node-1").await.unwrap();

    let node = h.node("node-1");
    let ready = disk_condition(&node, "disk-1", DiskConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, DiskConditionReason::DiskFilesystemChanged.as_str());
    let disk_status = &node.status.disk_status["disk-1"];
    assert_eq!(disk_status.disk_uuid, recorded);
    assert_eq!(disk_status.storage_maximum, 0);
    assert_eq!(disk_status.storage_available, 0);
}

#[tokio::test]
async fn duplicate_fsid_keeps_exactly_one_disk_ready() {
    let h = harness("node-1");
    // Both paths resolve into the same underlying filesystem.
    h.disks.set_info("/mnt/d1", "fs-shared", 100 * GIB, 80 * GIB);
    h.disks.set_info("/mnt/d2", "fs-shared", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node(
            "node-1",
            vec![
                ("disk-1", disk_spec("/mnt/d1", 0)),
                ("disk-2", disk_spec("/mnt/d2", 0)),
            ],
        ))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    let assert_exactly_one_ready = |node: &quarry::quarry::api::types::Node| {
        let ready: Vec<_> = ["disk-1", "disk-2"]
            .iter()
            .filter(|id| {
                disk_condition(node, id, DiskConditionType::Ready.as_str()).status
                    == ConditionStatus::True
            })
            .copied()
            .collect();
        assert_eq!(ready.len(), 1, "exactly one disk may win the filesystem");
        let loser = if ready[0] == "disk-1" { "disk-2" } else { "disk-1" };
        let condition = disk_condition(node, loser, DiskConditionType::Ready.as_str());
        assert_eq!(condition.status, ConditionStatus::False);
        assert_eq!(
            condition.reason,
            DiskConditionReason::DiskFilesystemChanged.as_str()
        );
        ready[0].to_string()
    };

    h.sync("node-1").await.unwrap();
    let winner_first = assert_exactly_one_ready(&h.node("node-1"));

    // The verdict must not flap between reconciles.
    h.sync("node-1").await.unwrap();
    let winner_second = assert_exactly_one_ready(&h.node("node-1"));
    assert_eq!(winner_first, winner_second);
}

#[tokio::test]
async fn probe_failure_marks_the_disk_not_ready() {
    let h = harness("node-1");
    h.disks.set_info_error("/mnt/d1", "input/output error");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let ready = disk_condition(&node, "disk-1", DiskConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, DiskConditionReason::NoDiskInfo.as_str());
}

#[tokio::test]
async fn cordoned_kubernetes_node_disables_scheduling() {
    let h = harness("node-1");
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    let mut kube_node = kube_node_ready("node-1");
    kube_node.spec.unschedulable = true;
    h.registry.kube_nodes().create(kube_node).unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let schedulable = node_condition(&node, NodeConditionType::Schedulable.as_str());
    assert_eq!(schedulable.status, ConditionStatus::False);
    assert_eq!(
        schedulable.reason,
        NodeConditionReason::KubernetesNodeCordoned.as_str()
    );
    // The disk's own verdict stays independent of the cordon.
    assert_eq!(
        disk_condition(&node, "disk-1", DiskConditionType::Schedulable.as_str()).status,
        ConditionStatus::True
    );

    // With the policy disabled, the cordon stops mattering.
    set_setting(
        h.ds(),
        SettingName::DisableSchedulingOnCordonedNode,
        "false",
    );
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    assert_eq!(
        node_condition(&node, NodeConditionType::Schedulable.as_str()).status,
        ConditionStatus::True
    );
}

#[tokio::test]
async fn disk_pressure_blocks_scheduling() {
    let h = harness("node-1");
    set_setting(
        h.ds(),
        SettingName::StorageMinimalAvailablePercentage,
        "20",
    );
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 5 * GIB);
    h.disks.set_config("/mnt/d1", "uuid-d1");
    h.registry
        .nodes()
        .create(test_node(
            "node-1",
            vec![("disk-1", disk_spec("/mnt/d1", 10 * GIB))],
        ))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    // The disk itself is healthy but has no schedulable headroom:
    // 5 GiB < max(10 GiB reserved, 20% of 100 GiB).
    assert_eq!(
        disk_condition(&node, "disk-1", DiskConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    let schedulable = disk_condition(&node, "disk-1", DiskConditionType::Schedulable.as_str());
    assert_eq!(schedulable.status, ConditionStatus::False);
    assert_eq!(schedulable.reason, DiskConditionReason::DiskPressure.as_str());
}

#[tokio::test]
async fn scheduled_storage_sums_replicas_per_disk() {
    let h = harness("node-1");
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 80 * GIB);
    h.disks.set_config("/mnt/d1", "uuid-d1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();
    h.registry
        .replicas()
        .create(replica("r1", "node-1", "disk-1", 2 * GIB))
        .unwrap();
    h.registry
        .replicas()
        .create(replica("r2", "node-1", "disk-1", 3 * GIB))
        .unwrap();
    // Points at a disk that is not in the spec: logged, never reconciled.
    h.registry
        .replicas()
        .create(replica("r3", "node-1", "disk-gone", 1 * GIB))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let disk_status = &node.status.disk_status["disk-1"];
    assert_eq!(disk_status.storage_scheduled, 5 * GIB);
    assert_eq!(disk_status.scheduled_replica.len(), 2);
    assert_eq!(disk_status.scheduled_replica["r1"], 2 * GIB);
    assert_eq!(disk_status.scheduled_replica["r2"], 3 * GIB);
    let status_keys: HashSet<_> = node.status.disk_status.keys().cloned().collect();
    let spec_keys: HashSet<_> = node.spec.disks.keys().cloned().collect();
    assert_eq!(status_keys, spec_keys);
}

#[tokio::test]
async fn manager_pod_state_drives_node_readiness() {
    let h = harness("node-1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![]))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    // No manager pod at all.
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let ready = node_condition(&node, NodeConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, NodeConditionReason::ManagerPodMissing.as_str());

    // A manager pod that is present but not ready.
    let mut pod = ready_manager_pod("node-1");
    pod.status.conditions[0].status = "False".to_string();
    h.registry.pods().create(pod).unwrap();
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let ready = node_condition(&node, NodeConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(ready.reason, NodeConditionReason::ManagerPodDown.as_str());
}

#[tokio::test]
async fn kubernetes_node_problems_override_pod_health() {
    let h = harness("node-1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();

    // Gone entirely.
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let ready = node_condition(&node, NodeConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(
        ready.reason,
        NodeConditionReason::KubernetesNodeGone.as_str()
    );

    // Present but under memory pressure: the worst signal wins the write.
    let mut kube_node = kube_node_ready("node-1");
    kube_node.status.conditions.push(KubernetesNodeCondition {
        condition_type: "MemoryPressure".to_string(),
        status: "True".to_string(),
        reason: "KubeletHasInsufficientMemory".to_string(),
        message: "kubelet has insufficient memory available".to_string(),
    });
    h.registry.kube_nodes().create(kube_node).unwrap();
    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let ready = node_condition(&node, NodeConditionType::Ready.as_str());
    assert_eq!(ready.status, ConditionStatus::False);
    assert_eq!(
        ready.reason,
        NodeConditionReason::KubernetesNodePressure.as_str()
    );
}

#[tokio::test]
async fn unknown_kubernetes_condition_emits_a_warning_without_status_change() {
    let h = harness("node-1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    let mut kube_node = kube_node_ready("node-1");
    kube_node.status.conditions.push(KubernetesNodeCondition {
        condition_type: "CustomVendorCheck".to_string(),
        status: "True".to_string(),
        reason: "VendorSaysSo".to_string(),
        message: "vendor diagnostic fired".to_string(),
    });
    h.registry.kube_nodes().create(kube_node).unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    assert_eq!(
        node_condition(&node, NodeConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    let warning = h
        .events
        .list()
        .into_iter()
        .find(|event| event.reason == NodeConditionReason::UnknownNodeConditionTrue.as_str())
        .expect("unknown-condition warning recorded");
    assert_eq!(warning.event_type, "Warning");
}

#[tokio::test]
async fn mount_propagation_condition_reflects_the_system_mount() {
    let h = harness("node-1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![]))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();
    let mut pod = ready_manager_pod("node-1");
    pod.spec.containers[0].volume_mounts[0].mount_propagation = None;
    h.registry.pods().create(pod).unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    let propagation = node_condition(&node, NodeConditionType::MountPropagation.as_str());
    assert_eq!(propagation.status, ConditionStatus::False);
    assert_eq!(
        propagation.reason,
        NodeConditionReason::NoMountPropagationSupport.as_str()
    );
}

#[tokio::test]
async fn deletion_removes_the_finalizer_and_emits_a_warning() {
    let h = harness("node-1");
    let node = test_node("node-1", vec![]);
    h.ds().create_node(node).await.unwrap();
    h.registry.nodes().delete("node-1").unwrap();

    h.sync("node-1").await.unwrap();
    assert!(matches!(
        h.ds().get_node("node-1"),
        Err(ref err) if error_is_not_found(err)
    ));
    let deletion_event = h
        .events
        .list()
        .into_iter()
        .find(|event| event.reason == EVENT_REASON_DELETE)
        .expect("deletion warning recorded");
    assert_eq!(deletion_event.event_type, "Warning");
}

#[tokio::test]
async fn foreign_namespace_and_missing_nodes_are_clean_no_ops() {
    let h = harness("node-1");
    h.sync("node-1").await.unwrap();
    h.controller
        .sync_node("other-namespace/node-1")
        .await
        .unwrap();
}

#[tokio::test]
async fn non_owned_nodes_only_get_observed_state() {
    // This controller runs on node-2 but processes node-1's key.
    let h = harness("node-2");
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let node = h.node("node-1");
    // Observed conditions are written, owner-restricted work is not done.
    assert_eq!(
        node_condition(&node, NodeConditionType::Ready.as_str()).status,
        ConditionStatus::True
    );
    assert!(node.status.disk_status.is_empty());
    assert!(h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn conflicting_writeback_requeues_instead_of_failing() {
    let h = harness("node-1");
    h.disks.set_info("/mnt/d1", "fs-1", 100 * GIB, 80 * GIB);
    h.registry
        .nodes()
        .create(test_node("node-1", vec![("disk-1", disk_spec("/mnt/d1", 0))]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    // Another actor bumps the node mid-reconcile, right at the probe.
    let registry = h.registry.clone();
    h.disks.set_probe_hook(move || {
        if let Some(mut node) = registry.nodes().get("node-1") {
            node.spec.tags.push("bumped".to_string());
            let _ = registry.nodes().update(node);
        }
    });

    // The conflict is swallowed and the key re-enqueued.
    h.sync("node-1").await.unwrap();
    let key = timeout(Duration::from_secs(5), h.controller.queue().get())
        .await
        .expect("requeued key")
        .unwrap();
    assert_eq!(key, "quarry-system/node-1");

    // The stale status never landed.
    let node = h.node("node-1");
    assert!(node.status.disk_status.is_empty());
}
