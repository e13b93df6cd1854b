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
use std::path::{Component, PathBuf};

use crate::quarry::util::error::{op_error, BoxError};

/// Enum for supported configuration parameters
#[derive(Debug)]
pub enum Config {
    NodeName,
    Namespace,
    DataDir,
}

impl Config {
    /// Returns the associated environment variable for the config parameter.
    pub fn env_var(&self) -> &'static str {
        match self {
            Config::NodeName => "QUARRY_NODE_NAME",
            Config::Namespace => "QUARRY_NAMESPACE",
            Config::DataDir => "QUARRY_DATA_DIR",
        }
    }

    /// Returns the default value used when the environment variable is unset.
    pub fn default_value(&self) -> &'static str {
        match self {
            Config::NodeName => "",
            Config::Namespace => "quarry-system",
            Config::DataDir => {
                #[cfg(test)]
                {
                    "/tmp/quarry-test/data"
                }
                #[cfg(not(test))]
                {
                    "/var/lib/quarry/data"
                }
            }
        }
    }

    /// Reads the parameter from the environment, falling back to the default.
    pub fn get(&self) -> String {
        env::var(self.env_var()).unwrap_or_else(|_| self.default_value().to_string())
    }

    /// Reads a path-valued parameter and validates it: the path must be
    /// absolute and must not contain parent-directory components.
    pub fn get_path(&self) -> Result<PathBuf, BoxError> {
        let raw = self.get();
        let path = PathBuf::from(&raw);
        if !path.is_absolute() {
            return Err(op_error(format!(
                "{} must be an absolute path, got {:?}",
                self.env_var(),
                raw
            )));
        }
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(op_error(format!(
                "{} must not contain '..' components, got {:?}",
                self.env_var(),
                raw
            )));
        }
        Ok(path)
    }
}
