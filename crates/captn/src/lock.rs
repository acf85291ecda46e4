//! Single-instance file lock (C11): refuse to run a second coordinator
//! pass against the same state directory unless the held lock is stale.
//! Directly grounded on the reference stack's `lock.rs`, adapted to
//! return [`CaptnError`] instead of a boxed error at the boundary.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CaptnError;

pub const LOCK_FILE: &str = "captn.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Lock file handle that releases on `Drop`.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
}

impl LockFile {
    /// Acquire the lock in `state_dir`. Fails with `LockHeld` if a lock is
    /// already present and not stale.
    pub fn acquire(state_dir: &Path) -> Result<Self, CaptnError> {
        let lock_path = state_dir.join(LOCK_FILE);

        fs::create_dir_all(state_dir)
            .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", state_dir.display())))?;

        if lock_path.exists() {
            let existing = read_lock_info_from_path(&lock_path)?;
            return Err(CaptnError::LockHeld {
                pid: existing.pid,
                since: existing.acquired_at.to_rfc3339(),
            });
        }

        write_lock_file(&lock_path)?;
        Ok(LockFile { path: lock_path })
    }

    /// Acquire the lock, removing a stale lock (older than `timeout` or
    /// unreadable) before trying again. `force` skips the age check
    /// entirely and always clears an existing lock (§S.3 `force_run`).
    pub fn acquire_with_timeout(
        state_dir: &Path,
        timeout: Duration,
        force: bool,
    ) -> Result<Self, CaptnError> {
        let lock_path = state_dir.join(LOCK_FILE);

        if lock_path.exists() {
            match read_lock_info_from_path(&lock_path) {
                Ok(info) => {
                    let age = Utc::now().signed_duration_since(info.acquired_at);
                    let stale = age.to_std().map(|a| a > timeout).unwrap_or(true);
                    if force || stale {
                        let _ = fs::remove_file(&lock_path);
                    } else {
                        return Err(CaptnError::LockHeld {
                            pid: info.pid,
                            since: info.acquired_at.to_rfc3339(),
                        });
                    }
                }
                Err(_) => {
                    let _ = fs::remove_file(&lock_path);
                }
            }
        }

        Self::acquire(state_dir)
    }

    pub fn release(&mut self) -> Result<(), CaptnError> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", self.path.display())))?;
        }
        Ok(())
    }

    pub fn is_locked(state_dir: &Path) -> bool {
        state_dir.join(LOCK_FILE).exists()
    }

    pub fn read_lock_info(state_dir: &Path) -> Result<LockInfo, CaptnError> {
        read_lock_info_from_path(&state_dir.join(LOCK_FILE))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

fn write_lock_file(lock_path: &Path) -> Result<(), CaptnError> {
    let info = LockInfo {
        pid: std::process::id(),
        hostname: gethostname::gethostname().to_string_lossy().to_string(),
        acquired_at: Utc::now(),
    };

    let json = serde_json::to_string_pretty(&info)
        .map_err(|e| CaptnError::HostAccessDenied(e.to_string()))?;

    let tmp_path = lock_path.with_extension("tmp");
    {
        let mut file = File::create(&tmp_path)
            .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", tmp_path.display())))?;
        file.write_all(json.as_bytes())
            .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", tmp_path.display())))?;
        file.sync_all()
            .map_err(|e| CaptnError::HostAccessDenied(e.to_string()))?;
    }

    fs::rename(&tmp_path, lock_path)
        .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", lock_path.display())))?;

    Ok(())
}

fn read_lock_info_from_path(path: &Path) -> Result<LockInfo, CaptnError> {
    let content = fs::read_to_string(path)
        .map_err(|e| CaptnError::HostAccessDenied(format!("{}: {e}", path.display())))?;
    serde_json::from_str(&content)
        .map_err(|e| CaptnError::HostAccessDenied(format!("corrupt lock file {}: {e}", path.display())))
}

pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join(LOCK_FILE)
}
