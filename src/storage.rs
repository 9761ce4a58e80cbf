//! Storage policy enforcement for recordings
//!
//! ## Responsibilities
//! - Free-space preflight before any recording starts
//! - Oldest-first reclamation when the policy allows recycling
//!
//! Free space comes from an injectable [`StorageInspector`] so the
//! reclamation logic is testable without a constrained filesystem.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::process::Command;
use tracing::{info, warn};

const GIB: u64 = 1024 * 1024 * 1024;

/// Disk policy for the recording directory
#[derive(Debug, Clone)]
pub struct StoragePolicy {
    pub primary_path: PathBuf,
    /// Floor below which recordings are refused
    pub min_free_space_gb: u64,
    /// Delete oldest recordings to get back above the floor
    pub recycle_oldest: bool,
    /// Optional hard cap on total recording bytes
    pub max_storage_gb: Option<u64>,
}

/// Source of free-space readings
#[async_trait]
pub trait StorageInspector: Send + Sync {
    async fn free_space(&self, path: &Path) -> Result<u64>;
}

/// Reads free space via `df`, the same figure an operator sees
pub struct SystemStorageInspector;

#[async_trait]
impl StorageInspector for SystemStorageInspector {
    async fn free_space(&self, path: &Path) -> Result<u64> {
        let output = Command::new("df")
            .args(["--output=avail", "-B1"])
            .arg(path)
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::Internal(format!(
                "df failed for {}",
                path.display()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        // Header line, then the byte count
        stdout
            .lines()
            .nth(1)
            .and_then(|l| l.trim().parse::<u64>().ok())
            .ok_or_else(|| Error::Parse(format!("Unexpected df output: {}", stdout)))
    }
}

pub struct StorageManager {
    policy: StoragePolicy,
    inspector: Box<dyn StorageInspector>,
}

impl StorageManager {
    pub fn new(policy: StoragePolicy, inspector: Box<dyn StorageInspector>) -> Self {
        Self { policy, inspector }
    }

    pub fn policy(&self) -> &StoragePolicy {
        &self.policy
    }

    pub async fn free_space(&self) -> Result<u64> {
        self.inspector.free_space(&self.policy.primary_path).await
    }

    /// Ensure free space is above the floor before a recording starts.
    ///
    /// With recycling enabled, the oldest recordings are deleted one at a
    /// time until the floor is met; otherwise the shortfall is an
    /// [`Error::InsufficientStorage`].
    pub async fn preflight(&self) -> Result<()> {
        let floor = self.policy.min_free_space_gb * GIB;
        let mut free = self.free_space().await?;
        if free >= floor {
            return Ok(());
        }

        if !self.policy.recycle_oldest {
            return Err(Error::InsufficientStorage(format!(
                "Free space {:.1} GiB below floor {} GiB",
                free as f64 / GIB as f64,
                self.policy.min_free_space_gb
            )));
        }

        let mut candidates = self.recordings_oldest_first().await?;
        while free < floor {
            let Some((path, size)) = candidates.pop() else {
                return Err(Error::InsufficientStorage(format!(
                    "Free space {:.1} GiB below floor {} GiB and nothing left to recycle",
                    free as f64 / GIB as f64,
                    self.policy.min_free_space_gb
                )));
            };
            info!(path = %path.display(), size = size, "Recycling oldest recording");
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "Failed to recycle recording");
                continue;
            }
            free = free.saturating_add(size);
        }

        Ok(())
    }

    /// Recording files sorted oldest-last (so `pop` yields the oldest)
    async fn recordings_oldest_first(&self) -> Result<Vec<(PathBuf, u64)>> {
        let mut entries: Vec<(PathBuf, u64, SystemTime)> = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.policy.primary_path).await {
            Ok(d) => d,
            Err(_) => return Ok(Vec::new()),
        };

        while let Ok(Some(entry)) = dir.next_entry().await {
            let meta = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            entries.push((entry.path(), meta.len(), mtime));
        }

        // Newest first so pop() removes the oldest
        entries.sort_by(|a, b| b.2.cmp(&a.2));
        Ok(entries.into_iter().map(|(p, s, _)| (p, s)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Inspector returning a fixed reading
    struct FixedInspector {
        free: AtomicU64,
    }

    #[async_trait]
    impl StorageInspector for FixedInspector {
        async fn free_space(&self, _path: &Path) -> Result<u64> {
            Ok(self.free.load(Ordering::SeqCst))
        }
    }

    fn manager(dir: &Path, free_gb: u64, recycle: bool) -> StorageManager {
        StorageManager::new(
            StoragePolicy {
                primary_path: dir.to_path_buf(),
                min_free_space_gb: 5,
                recycle_oldest: recycle,
                max_storage_gb: None,
            },
            Box::new(FixedInspector {
                free: AtomicU64::new(free_gb * GIB),
            }),
        )
    }

    #[tokio::test]
    async fn test_oldest_first_pops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("cam_a.mp4");
        let second = dir.path().join("cam_b.mp4");
        tokio::fs::write(&first, vec![0u8; 10]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::fs::write(&second, vec![0u8; 20]).await.unwrap();

        let manager = manager(dir.path(), 10, true);
        let mut candidates = manager.recordings_oldest_first().await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates.pop().unwrap(), (first, 10));
        assert_eq!(candidates.pop().unwrap(), (second, 20));
    }

    #[tokio::test]
    async fn test_preflight_passes_above_floor() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 10, false);
        assert!(manager.preflight().await.is_ok());
    }

    #[tokio::test]
    async fn test_preflight_refuses_without_recycling() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(dir.path(), 3, false);
        let err = manager.preflight().await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage(_)));
    }

    #[tokio::test]
    async fn test_preflight_recycles_oldest_first() {
        let dir = tempfile::tempdir().unwrap();
        // An "old" and a "new" recording; sizes reported by FixedInspector
        // are small, so reclamation depends on file byte counts. Use a
        // manager whose shortfall is covered by deleting the older file.
        let old = dir.path().join("cam_2026-01-01T00-00-00.mp4");
        let new = dir.path().join("cam_2026-01-02T00-00-00.mp4");
        tokio::fs::write(&old, vec![0u8; 1024]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::fs::write(&new, vec![0u8; 1024]).await.unwrap();

        // Free space floor shortfall is 2 GiB; each deleted file "returns"
        // its size, so both get recycled, oldest first, then we still fail.
        let manager = manager(dir.path(), 3, true);
        let err = manager.preflight().await.unwrap_err();
        assert!(matches!(err, Error::InsufficientStorage(_)));

        // Both recordings were consumed in oldest-first order
        assert!(!old.exists());
        assert!(!new.exists());
    }

    #[tokio::test]
    async fn test_recycling_stops_once_floor_met() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("cam_old.mp4");
        let new = dir.path().join("cam_new.mp4");
        // The old file alone covers the shortfall
        tokio::fs::write(&old, vec![0u8; 4096]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        tokio::fs::write(&new, vec![0u8; 16]).await.unwrap();

        let manager = StorageManager::new(
            StoragePolicy {
                primary_path: dir.path().to_path_buf(),
                min_free_space_gb: 5,
                recycle_oldest: true,
                max_storage_gb: None,
            },
            Box::new(FixedInspector {
                free: AtomicU64::new(5 * GIB - 1000),
            }),
        );

        manager.preflight().await.unwrap();
        assert!(!old.exists());
        assert!(new.exists());
    }
}
