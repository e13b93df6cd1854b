#![allow(dead_code)]

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

use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Creates and returns a directory unique to the calling test, under
/// `<target>/test-output/<component>/`. Tests use these as disk roots, so
/// every caller gets a fresh one even when run in the same process.
pub fn test_output_dir(component: &str) -> PathBuf {
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let target = env::var_os("CARGO_TARGET_DIR")
        .or_else(|| env::var_os("QUARRY_TEST_TARGET_DIR"))
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("target"));
    let dir = target.join("test-output").join(component).join(format!(
        "{}-{}",
        std::process::id(),
        SEQUENCE.fetch_add(1, Ordering::Relaxed)
    ));
    fs::create_dir_all(&dir).expect("create test output directory");
    dir
}
