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

use nix::sys::stat::stat;
use nix::sys::statvfs::statvfs;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Name of the tag file written into every disk root.
pub const DISK_CONFIG_FILE_NAME: &str = "quarry-disk.cfg";

/// Capacity and identity of a mounted filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskInfo {
    pub path: String,
    pub fsid: String,
    pub storage_maximum: i64,
    pub storage_available: i64,
}

/// The persisted disk tag. Unknown fields written by newer versions are
/// preserved by readers ignoring them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiskConfig {
    #[serde(rename = "diskUUID")]
    pub disk_uuid: String,
}

#[derive(Debug)]
pub enum DiskError {
    NotFound {
        path: String,
    },
    Io {
        path: String,
        source: std::io::Error,
    },
    Sys {
        path: String,
        source: nix::Error,
    },
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

impl DiskError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiskError::NotFound { .. })
    }
}

impl Display for DiskError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DiskError::NotFound { path } => write!(f, "disk config not found at {:?}", path),
            DiskError::Io { path, source } => write!(f, "disk io error at {:?}: {}", path, source),
            DiskError::Sys { path, source } => {
                write!(f, "failed to stat filesystem at {:?}: {}", path, source)
            }
            DiskError::Parse { path, source } => {
                write!(f, "failed to parse disk config at {:?}: {}", path, source)
            }
        }
    }
}

impl Error for DiskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            DiskError::NotFound { .. } => None,
            DiskError::Io { source, .. } => Some(source),
            DiskError::Sys { source, .. } => Some(source),
            DiskError::Parse { source, .. } => Some(source),
        }
    }
}

/// Seam between the reconciler and the node's filesystems. Tests substitute
/// a recording implementation; production uses `LocalDiskHandler`.
pub trait DiskHandler: Send + Sync {
    fn get_disk_info(&self, path: &str) -> Result<DiskInfo, DiskError>;
    fn get_disk_config(&self, path: &str) -> Result<DiskConfig, DiskError>;
    fn generate_disk_config(&self, path: &str) -> Result<DiskConfig, DiskError>;
}

/// Probes mounted filesystems and manages tag files on the local node.
pub struct LocalDiskHandler;

impl LocalDiskHandler {
    fn config_path(disk_path: &str) -> PathBuf {
        Path::new(disk_path).join(DISK_CONFIG_FILE_NAME)
    }
}

impl DiskHandler for LocalDiskHandler {
    fn get_disk_info(&self, path: &str) -> Result<DiskInfo, DiskError> {
        let vfs = statvfs(path).map_err(|source| DiskError::Sys {
            path: path.to_string(),
            source,
        })?;
        let file_stat = stat(path).map_err(|source| DiskError::Sys {
            path: path.to_string(),
            source,
        })?;

        // The device id changes whenever a different filesystem is mounted at
        // this path, which is exactly the identity the reconciler tracks.
        let fsid = format!("{:x}", file_stat.st_dev);
        let fragment_size = vfs.fragment_size() as u64;
        let storage_maximum = (vfs.blocks() as u64).saturating_mul(fragment_size) as i64;
        let storage_available =
            (vfs.blocks_available() as u64).saturating_mul(fragment_size) as i64;

        Ok(DiskInfo {
            path: path.to_string(),
            fsid,
            storage_maximum,
            storage_available,
        })
    }

    fn get_disk_config(&self, path: &str) -> Result<DiskConfig, DiskError> {
        let config_path = Self::config_path(path);
        let raw = match fs::read_to_string(&config_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(DiskError::NotFound {
                    path: config_path.to_string_lossy().to_string(),
                })
            }
            Err(err) => {
                return Err(DiskError::Io {
                    path: config_path.to_string_lossy().to_string(),
                    source: err,
                })
            }
        };
        serde_json::from_str(&raw).map_err(|source| DiskError::Parse {
            path: config_path.to_string_lossy().to_string(),
            source,
        })
    }

    fn generate_disk_config(&self, path: &str) -> Result<DiskConfig, DiskError> {
        // The per-node work queue serializes reconciles, but a crashed write
        // may have left a valid tag behind; minting a second UUID for the
        // same disk would break identity tracking.
        match self.get_disk_config(path) {
            Ok(existing) => return Ok(existing),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }

        let config = DiskConfig {
            disk_uuid: Uuid::new_v4().to_string(),
        };
        let encoded = serde_json::to_vec(&config).map_err(|source| DiskError::Parse {
            path: path.to_string(),
            source,
        })?;
        persist_atomically(&Self::config_path(path), &encoded)?;
        Ok(config)
    }
}

fn persist_atomically(target: &Path, data: &[u8]) -> Result<(), DiskError> {
    let io_err = |source: std::io::Error, path: &Path| DiskError::Io {
        path: path.to_string_lossy().to_string(),
        source,
    };

    let tmpfile_path = target.with_extension("tmp");
    let mut tmp_guard = TempFileGuard::new(tmpfile_path.clone());
    let mut tmpfile = File::create(&tmpfile_path).map_err(|e| io_err(e, &tmpfile_path))?;
    tmpfile
        .write_all(data)
        .map_err(|e| io_err(e, &tmpfile_path))?;
    tmpfile.sync_all().map_err(|e| io_err(e, &tmpfile_path))?;
    drop(tmpfile);

    fs::rename(&tmpfile_path, target).map_err(|e| io_err(e, target))?;
    tmp_guard.keep();

    sync_parent(target)?;
    Ok(())
}

fn sync_parent(path: &Path) -> Result<(), DiskError> {
    if let Some(dir) = path.parent() {
        let dir_file = File::open(dir).map_err(|source| DiskError::Io {
            path: dir.to_string_lossy().to_string(),
            source,
        })?;
        dir_file.sync_all().map_err(|source| DiskError::Io {
            path: dir.to_string_lossy().to_string(),
            source,
        })?;
    }
    Ok(())
}

struct TempFileGuard {
    path: PathBuf,
    keep: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}
