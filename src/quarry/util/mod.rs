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

pub mod error;

use crate::quarry::util::error::{op_error, BoxError};

/// Splits a `namespace/name` work-queue key into its parts. A key without a
/// separator addresses a cluster-scoped object and yields an empty namespace.
pub fn split_meta_namespace_key(key: &str) -> Result<(&str, &str), BoxError> {
    match key.split_once('/') {
        Some((namespace, name)) if !name.is_empty() && !name.contains('/') => {
            Ok((namespace, name))
        }
        None if !key.is_empty() => Ok(("", key)),
        _ => Err(op_error(format!("unexpected key format: {:?}", key))),
    }
}

fn parse_version(version: &str) -> Option<(u64, u64, u64)> {
    let trimmed = version.trim().trim_start_matches('v');
    // Tolerate vendor suffixes such as "1.17.2+k3s1".
    let core = trimmed
        .split(|c: char| c == '+' || c == '-')
        .next()
        .unwrap_or(trimmed);
    let mut parts = core.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    let patch = parts.next().map_or(Some(0), |p| p.parse().ok())?;
    Some((major, minor, patch))
}

/// Compares two `vMAJOR.MINOR.PATCH` strings. Unparseable versions compare
/// as "not at least" so callers fall back to the older behavior.
pub fn is_version_at_least(version: &str, minimum: &str) -> bool {
    match (parse_version(version), parse_version(minimum)) {
        (Some(current), Some(min)) => current >= min,
        _ => false,
    }
}
