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

use std::error::Error;
use std::fmt;

/// Boxed error used at seams that do not warrant a dedicated enum, such as
/// key parsing, configuration validation, and daemon bootstrap.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// One failed operation, optionally chaining the cause that sank it. The
/// dedicated enums (`DataStoreError`, `DiskError`, `NodeControllerError`)
/// cover the controller's hot paths; this covers everything around them.
#[derive(Debug)]
pub struct OpError {
    operation: String,
    cause: Option<BoxError>,
}

impl fmt::Display for OpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.operation, cause),
            None => f.write_str(&self.operation),
        }
    }
}

impl Error for OpError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|cause| cause as &(dyn Error + 'static))
    }
}

/// Builds a causeless operation error.
pub fn op_error(operation: impl Into<String>) -> BoxError {
    Box::new(OpError {
        operation: operation.into(),
        cause: None,
    })
}

/// Attaches an operation description to the error of a result.
pub trait ResultContext<T> {
    fn context(self, operation: impl Into<String>) -> Result<T, BoxError>;
}

impl<T, E> ResultContext<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn context(self, operation: impl Into<String>) -> Result<T, BoxError> {
        self.map_err(|err| {
            Box::new(OpError {
                operation: operation.into(),
                cause: Some(err.into()),
            }) as BoxError
        })
    }
}
