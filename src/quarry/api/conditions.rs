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

use crate::quarry::api::types::{Condition, ConditionStatus};
use crate::quarry::k8s::event::{EventType, ObjectReference, Recorder};

/// Returns the stored condition of the given type, or an empty one with
/// status `Unknown` when the object has never reported it.
pub fn get_condition(conditions: &HashMap<String, Condition>, condition_type: &str) -> Condition {
    conditions
        .get(condition_type)
        .cloned()
        .unwrap_or_else(|| Condition {
            condition_type: condition_type.to_string(),
            ..Condition::default()
        })
}

/// Updates a condition in place. The transition timestamp only moves when the
/// status actually changes; reason and message are always refreshed.
pub fn set_condition(
    conditions: &mut HashMap<String, Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let mut condition = get_condition(conditions, condition_type);
    if condition.status != status {
        condition.last_transition_time = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    }
    condition.status = status;
    condition.reason = reason.to_string();
    condition.message = message.to_string();
    conditions.insert(condition_type.to_string(), condition);
}

/// Like `set_condition`, but also emits one event per transition. No event is
/// recorded when neither the status nor the message changed.
#[allow(clippy::too_many_arguments)]
pub fn set_condition_and_record(
    conditions: &mut HashMap<String, Condition>,
    condition_type: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    recorder: &Recorder,
    involved: ObjectReference,
    event_type: EventType,
) {
    let existing = get_condition(conditions, condition_type);
    if existing.status != status || existing.message != message {
        recorder.event(involved, event_type, reason, message);
    }
    set_condition(conditions, condition_type, status, reason, message);
}
