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
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};
use tokio::sync::broadcast;

use crate::quarry::api::types::ObjectMeta;

const DEFAULT_EVENT_RETENTION: usize = 1024;
const WATCH_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    pub const fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ObjectReference {
    #[serde(rename = "apiVersion", default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EventSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Minimal representation of Kubernetes core/v1 Event.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub metadata: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(rename = "type", default)]
    pub event_type: String,
    #[serde(
        rename = "firstTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub first_timestamp: Option<String>,
    #[serde(
        rename = "lastTimestamp",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

struct EventStore {
    records: VecDeque<Event>,
    capacity: usize,
}

impl EventStore {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: Event) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
    }
}

/// Bounded in-memory event sink with broadcast watchers. Recording is
/// synchronous so condition helpers can emit without a suspension point.
pub struct EventRegistry {
    store: RwLock<EventStore>,
    watchers: broadcast::Sender<Event>,
    resource_counter: AtomicU64,
}

impl EventRegistry {
    pub fn new() -> Arc<Self> {
        let (watchers, _) = broadcast::channel(WATCH_BUFFER_SIZE);
        Arc::new(Self {
            store: RwLock::new(EventStore::new(DEFAULT_EVENT_RETENTION)),
            watchers,
            resource_counter: AtomicU64::new(1),
        })
    }

    pub fn record(&self, mut event: Event) -> Event {
        let resource_version = self.resource_counter.fetch_add(1, Ordering::SeqCst);
        event.metadata.resource_version = Some(resource_version.to_string());
        if event.metadata.name.is_empty() {
            event.metadata.name = format!("event-{}", resource_version);
        }
        if event.metadata.namespace.is_none() {
            event.metadata.namespace = event.involved_object.namespace.clone();
        }
        if event.count.is_none() {
            event.count = Some(1);
        }

        let cloned = event.clone();
        {
            let mut store = self.store.write().expect("event store lock poisoned");
            store.push(event);
        }
        let _ = self.watchers.send(cloned.clone());
        cloned
    }

    pub fn list(&self) -> Vec<Event> {
        let store = self.store.read().expect("event store lock poisoned");
        store.records.iter().cloned().collect()
    }

    pub fn list_since(&self, resource_version: u64) -> Vec<Event> {
        let store = self.store.read().expect("event store lock poisoned");
        store
            .records
            .iter()
            .filter(|event| {
                event
                    .metadata
                    .resource_version
                    .as_deref()
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0)
                    > resource_version
            })
            .cloned()
            .collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.watchers.subscribe()
    }
}

/// Records events against an involved object with a fixed source identity.
#[derive(Clone)]
pub struct Recorder {
    registry: Arc<EventRegistry>,
    source: EventSource,
}

impl Recorder {
    pub fn new(registry: Arc<EventRegistry>, component: &str, host: &str) -> Self {
        Self {
            registry,
            source: EventSource {
                component: Some(component.to_string()),
                host: Some(host.to_string()),
            },
        }
    }

    pub fn event(
        &self,
        involved: ObjectReference,
        event_type: EventType,
        reason: &str,
        message: impl Into<String>,
    ) {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        self.registry.record(Event {
            metadata: ObjectMeta::default(),
            involved_object: involved,
            reason: reason.to_string(),
            message: message.into(),
            event_type: event_type.as_str().to_string(),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            source: Some(self.source.clone()),
        });
    }
}
