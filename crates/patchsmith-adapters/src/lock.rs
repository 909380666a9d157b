//! Exclusive access to working trees and shared output files.

use crate::util::sanitize_component;
use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

const LOCK_RETRY_MS: u64 = 50;
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// An exclusive advisory lock on a file, released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: fs::File,
    path: PathBuf,
}

impl FileLock {
    /// Poll for the lock until `timeout` runs out.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create lock directory '{}'", parent.display())
            })?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file '{}'", path.display()))?;

        let start = Instant::now();
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) => {
                    if err.kind() != ErrorKind::WouldBlock {
                        return Err(err.into());
                    }
                    if start.elapsed() >= timeout {
                        return Err(anyhow::anyhow!(
                            "Timed out waiting for lock '{}' ({}s)",
                            path.display(),
                            timeout.as_secs()
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(LOCK_RETRY_MS));
                }
            }
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

type Slots = Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>;

/// Hands out one lease per working tree at a time, across tasks in this
/// process (async mutex) and across processes (lock file). A worktree's slot
/// lives only while someone holds or waits for it.
#[derive(Debug, Clone)]
pub struct WorktreeLocks {
    lock_dir: PathBuf,
    timeout: Duration,
    held: Slots,
}

#[derive(Debug)]
pub struct WorktreeLease {
    worktree: PathBuf,
    file: Option<FileLock>,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl WorktreeLease {
    pub fn worktree(&self) -> &Path {
        &self.worktree
    }
}

impl Drop for WorktreeLease {
    fn drop(&mut self) {
        self.file.take();
        let mut held = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        self.guard.take();
        let idle = held
            .get(&self.worktree)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            held.remove(&self.worktree);
        }
    }
}

impl WorktreeLocks {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            timeout: DEFAULT_LOCK_TIMEOUT,
            held: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn slot(&self, key: &Path) -> Arc<AsyncMutex<()>> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.entry(key.to_path_buf())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Wait for exclusive use of `worktree`.
    pub async fn acquire(&self, worktree: &Path) -> Result<WorktreeLease> {
        let key = worktree
            .canonicalize()
            .with_context(|| format!("Repository path not found: {}", worktree.display()))?;

        let guard = self.slot(&key).lock_owned().await;
        let mut lease = WorktreeLease {
            worktree: key,
            file: None,
            guard: Some(guard),
            slots: self.held.clone(),
        };

        let lock_path = self
            .lock_dir
            .join(format!("{}.lock", sanitize_component(&lease.worktree.to_string_lossy())));
        let timeout = self.timeout;
        let file = tokio::task::spawn_blocking(move || FileLock::acquire(&lock_path, timeout))
            .await
            .context("Lock task panicked")??;

        tracing::debug!(
            worktree = %lease.worktree.display(),
            lock = %file.path().display(),
            "worktree leased"
        );
        lease.file = Some(file);
        Ok(lease)
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.held.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_file_lock_times_out_while_held() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("locks").join("x.lock");
        let first = FileLock::acquire(&path, Duration::from_secs(1)).unwrap();
        let second = FileLock::acquire(&path, Duration::from_millis(120));
        assert!(second.is_err());
        drop(first);
        assert!(FileLock::acquire(&path, Duration::from_secs(1)).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_leases_serialize_same_worktree() {
        let locks_dir = tempdir().unwrap();
        let worktree = tempdir().unwrap();
        let locks = WorktreeLocks::new(locks_dir.path());
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let locks = locks.clone();
            let path = worktree.path().to_path_buf();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _lease = locks.acquire(&path).await.unwrap();
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_released_worktrees_are_forgotten() {
        let locks_dir = tempdir().unwrap();
        let locks = WorktreeLocks::new(locks_dir.path());
        let trees: Vec<_> = (0..5).map(|_| tempdir().unwrap()).collect();

        for tree in &trees {
            let lease = locks.acquire(tree.path()).await.unwrap();
            assert_eq!(locks.tracked(), 1);
            drop(lease);
            assert_eq!(locks.tracked(), 0);
        }

        let first = locks.acquire(trees[0].path()).await.unwrap();
        let second = locks.acquire(trees[1].path()).await.unwrap();
        assert_eq!(locks.tracked(), 2);
        drop(first);
        assert_eq!(locks.tracked(), 1);
        drop(second);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_failed_file_lock_releases_slot() {
        let locks_dir = tempdir().unwrap();
        let worktree = tempdir().unwrap();
        let locks = WorktreeLocks::new(locks_dir.path()).with_timeout(Duration::from_millis(100));
        let key = worktree.path().canonicalize().unwrap();
        let lock_path = locks_dir
            .path()
            .join(format!("{}.lock", sanitize_component(&key.to_string_lossy())));
        let outside = FileLock::acquire(&lock_path, Duration::from_secs(1)).unwrap();

        assert!(locks.acquire(worktree.path()).await.is_err());
        assert_eq!(locks.tracked(), 0);
        drop(outside);
        assert!(locks.acquire(worktree.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_distinct_worktrees_do_not_block() {
        let locks_dir = tempdir().unwrap();
        let a = tempdir().unwrap();
        let b = tempdir().unwrap();
        let locks = WorktreeLocks::new(locks_dir.path()).with_timeout(Duration::from_millis(200));
        let lease_a = locks.acquire(a.path()).await.unwrap();
        let lease_b = locks.acquire(b.path()).await.unwrap();
        assert_ne!(lease_a.worktree(), lease_b.worktree());
    }

    #[tokio::test]
    async fn test_missing_worktree_is_an_error() {
        let locks_dir = tempdir().unwrap();
        let locks = WorktreeLocks::new(locks_dir.path());
        let err = locks
            .acquire(&locks_dir.path().join("does-not-exist"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Repository path not found"));
    }
}
