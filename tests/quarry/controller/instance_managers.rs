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

use std::collections::HashMap;

use quarry::quarry::api::types::{
    instance_manager_labels, label_key, InstanceManager, InstanceManagerSpec,
    InstanceManagerState, InstanceManagerType, InstanceState, ObjectMeta, LABEL_NODE,
};

use crate::support::{
    disk_spec, harness, kube_node_ready, ready_manager_pod, test_node, DEFAULT_IMAGE, GIB,
    NAMESPACE,
};

fn manager(
    name: &str,
    node: &str,
    image: &str,
    im_type: InstanceManagerType,
    state: InstanceManagerState,
    instances: HashMap<String, InstanceState>,
) -> InstanceManager {
    InstanceManager {
        metadata: ObjectMeta {
            name: name.to_string(),
            namespace: Some(NAMESPACE.to_string()),
            labels: instance_manager_labels(node, image, im_type),
            ..ObjectMeta::default()
        },
        spec: InstanceManagerSpec {
            image: image.to_string(),
            node_id: node.to_string(),
            im_type,
        },
        status: quarry::quarry::api::types::InstanceManagerStatus {
            current_state: state,
            instances,
        },
    }
}

#[tokio::test]
async fn image_rollout_waits_for_live_instances_to_drain() {
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

    // An engine manager on the previous image, still hosting live instances.
    h.registry
        .instance_managers()
        .create(manager(
            "im-old",
            "node-1",
            "quarry/instance-manager:v0",
            InstanceManagerType::Engine,
            InstanceManagerState::Running,
            HashMap::from([
                ("volume-a-e-0".to_string(), InstanceState::Running),
                ("volume-b-e-0".to_string(), InstanceState::Running),
            ]),
        ))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let engines = h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap();
    // Both the drained-image manager and the new default-image one coexist.
    assert_eq!(engines.len(), 2);
    assert!(engines.contains_key("im-old"));
    assert!(engines
        .values()
        .any(|im| im.spec.image == DEFAULT_IMAGE));

    // Once the instances drain, the stale manager goes away.
    let mut drained = h
        .registry
        .instance_managers()
        .get("im-old")
        .unwrap();
    drained.status.instances.clear();
    h.registry.instance_managers().update(drained).unwrap();

    h.sync("node-1").await.unwrap();
    let engines = h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap();
    assert_eq!(engines.len(), 1);
    assert_eq!(engines.values().next().unwrap().spec.image, DEFAULT_IMAGE);
}

#[tokio::test]
async fn stopped_stale_managers_are_cleaned_up_immediately() {
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

    // Not running: live instances in the map no longer protect it.
    h.registry
        .instance_managers()
        .create(manager(
            "im-stopped",
            "node-1",
            "quarry/instance-manager:v0",
            InstanceManagerType::Engine,
            InstanceManagerState::Stopped,
            HashMap::from([("volume-a-e-0".to_string(), InstanceState::Stopped)]),
        ))
        .unwrap();

    h.sync("node-1").await.unwrap();
    let engines = h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap();
    assert_eq!(engines.len(), 1);
    assert!(!engines.contains_key("im-stopped"));
    assert_eq!(engines.values().next().unwrap().spec.image, DEFAULT_IMAGE);
}

#[tokio::test]
async fn nodes_without_disks_get_no_replica_managers() {
    let h = harness("node-1");
    h.registry
        .nodes()
        .create(test_node("node-1", vec![]))
        .unwrap();
    h.registry
        .pods()
        .create(ready_manager_pod("node-1"))
        .unwrap();
    h.registry
        .kube_nodes()
        .create(kube_node_ready("node-1"))
        .unwrap();

    // Even a busy replica manager is torn down when the node has no disk.
    h.registry
        .instance_managers()
        .create(manager(
            "im-replica",
            "node-1",
            DEFAULT_IMAGE,
            InstanceManagerType::Replica,
            InstanceManagerState::Running,
            HashMap::from([("volume-a-r-0".to_string(), InstanceState::Running)]),
        ))
        .unwrap();

    h.sync("node-1").await.unwrap();
    assert!(h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Replica)
        .unwrap()
        .is_empty());
    // The engine manager is still required.
    let engines = h
        .ds()
        .list_instance_managers_by_node("node-1", InstanceManagerType::Engine)
        .unwrap();
    assert_eq!(engines.len(), 1);
}

#[tokio::test]
async fn repeated_syncs_keep_a_single_default_manager_per_type() {
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

    h.sync("node-1").await.unwrap();
    h.sync("node-1").await.unwrap();

    for im_type in [InstanceManagerType::Engine, InstanceManagerType::Replica] {
        let managers = h
            .ds()
            .list_instance_managers_by_node("node-1", im_type)
            .unwrap();
        assert_eq!(managers.len(), 1);
        let im = managers.values().next().unwrap();
        assert_eq!(im.spec.image, DEFAULT_IMAGE);
        assert_eq!(
            im.metadata.labels.get(&label_key(LABEL_NODE)).unwrap(),
            "node-1"
        );
        assert!(!im.metadata.owner_references.is_empty());
        assert_eq!(im.metadata.owner_references[0].name, "node-1");
    }
}

#[tokio::test]
async fn inconsistent_node_labels_are_reported_as_bugs() {
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

    let mut broken = manager(
        "im-broken",
        "node-1",
        DEFAULT_IMAGE,
        InstanceManagerType::Engine,
        InstanceManagerState::Running,
        HashMap::new(),
    );
    broken
        .metadata
        .labels
        .insert(label_key(LABEL_NODE), "some-other-node".to_string());
    h.registry.instance_managers().create(broken).unwrap();

    let err = h.sync("node-1").await.expect_err("label mismatch is a bug");
    assert!(err.to_string().contains("BUG"), "got: {}", err);
}
