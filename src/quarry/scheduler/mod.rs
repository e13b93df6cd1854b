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

use std::sync::Arc;

use crate::quarry::api::types::{DiskSpec, DiskStatus, SettingName};
use crate::quarry::datastore::{DataStore, DataStoreError};

/// Projection of a disk used by the admission predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSchedulingInfo {
    pub storage_maximum: i64,
    pub storage_available: i64,
    pub storage_reserved: i64,
    pub storage_scheduled: i64,
    pub minimal_available_percentage: i64,
}

/// Decides whether replicas fit on a disk. The cluster-wide placement logic
/// lives elsewhere; this predicate only answers per-disk admission.
pub struct ReplicaScheduler {
    ds: Arc<DataStore>,
}

impl ReplicaScheduler {
    pub fn new(ds: Arc<DataStore>) -> Self {
        Self { ds }
    }

    pub fn get_disk_scheduling_info(
        &self,
        disk: &DiskSpec,
        status: &DiskStatus,
    ) -> Result<DiskSchedulingInfo, DataStoreError> {
        let minimal_available_percentage = self
            .ds
            .get_setting_as_int(SettingName::StorageMinimalAvailablePercentage)?;
        Ok(DiskSchedulingInfo {
            storage_maximum: status.storage_maximum,
            storage_available: status.storage_available,
            storage_reserved: disk.storage_reserved,
            storage_scheduled: status.storage_scheduled,
            minimal_available_percentage,
        })
    }

    /// A replica of `required_size` fits iff the space left after placing it
    /// stays above both the operator reservation and the minimal-available
    /// floor. Called with zeros to classify the disk itself.
    pub fn is_schedulable_to_disk(
        &self,
        required_size: i64,
        _required_reserved: i64,
        info: &DiskSchedulingInfo,
    ) -> bool {
        let percentage_floor = (info.storage_maximum as i128
            * info.minimal_available_percentage as i128
            / 100) as i64;
        let floor = info.storage_reserved.max(percentage_floor);
        info.storage_available - required_size >= floor
    }
}
