//! Advisory lock files around shared-document read-modify-write cycles
//!
//! A lock is a file created with `create_new`; whoever creates it holds the
//! lock until the guard is dropped. Locks older than the configured stale
//! age are broken, and a lock that cannot be taken in time never blocks the
//! caller: `acquire_or_proceed` falls back to an unlocked update.

use crate::config::LockSettings;
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, Instant, SystemTime};

const RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// A named advisory lock over one shared document
#[derive(Debug, Clone)]
pub struct SharedLock {
    path: PathBuf,
    settings: LockSettings,
}

/// Held lock; the lock file is removed on drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                tracing::warn!("Failed to release lock {}: {}", self.path.display(), e);
            }
        }
    }
}

impl SharedLock {
    /// Lock named `name` inside `locks_dir`
    pub fn new(locks_dir: PathBuf, name: &str, settings: LockSettings) -> Self {
        Self {
            path: locks_dir.join(format!("{}.lock", name)),
            settings,
        }
    }

    /// Take the lock, waiting up to the configured timeout.
    pub async fn acquire(&self) -> Result<LockGuard> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }

        let timeout = Duration::from_millis(self.settings.timeout_ms);
        let start = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&self.path)
                .await
            {
                Ok(_) => {
                    return Ok(LockGuard {
                        path: self.path.clone(),
                    })
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if self.is_stale().await {
                        tracing::warn!("Breaking stale lock {}", self.path.display());
                        match tokio::fs::remove_file(&self.path).await {
                            Ok(()) => continue,
                            // Another process broke it first
                            Err(e) if e.kind() == ErrorKind::NotFound => continue,
                            // Fall through to the timeout check so this cannot spin
                            Err(e) => tracing::warn!(
                                "Failed to break stale lock {}: {}",
                                self.path.display(),
                                e
                            ),
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }

            if start.elapsed() >= timeout {
                return Err(Error::Lock(format!(
                    "timed out after {}ms waiting for {}",
                    self.settings.timeout_ms,
                    self.path.display()
                )));
            }
            tokio::time::sleep(RETRY_INTERVAL).await;
        }
    }

    /// Take the lock if possible; otherwise log and let the caller proceed
    /// unlocked (last writer wins).
    pub async fn acquire_or_proceed(&self) -> Option<LockGuard> {
        if !self.settings.enabled {
            return None;
        }
        match self.acquire().await {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::warn!("Proceeding without lock: {}", e);
                None
            }
        }
    }

    async fn is_stale(&self) -> bool {
        let modified = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.modified(),
            Err(_) => return false,
        };
        match modified.map(|m| SystemTime::now().duration_since(m)) {
            Ok(Ok(age)) => age > Duration::from_millis(self.settings.stale_after_ms),
            _ => false,
        }
    }
}
