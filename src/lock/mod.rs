//! Cross-process advisory locks, one lock file per resource.
//!
//! Locks are `flock`-style exclusive locks taken non-blocking and retried on a
//! fixed interval. They only exclude concurrent holders: a holder that dies
//! and is swept as stale cannot be fenced off afterwards.

use crate::config::LockPolicy;
use crate::core::{ResourceClass, Result, StoreError};
use crate::storage::StoreLayout;
use crate::storage::layout::LOCK_SUFFIX;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::future::Future;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SNAPSHOT_INDEX_SCOPE: &str = "snapshot-index";

/// What a lock protects: `locks/<scope>/<id>.lock`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockTarget {
    scope: String,
    id: String,
}

impl LockTarget {
    pub fn new(class: ResourceClass, id: impl Into<String>) -> Self {
        Self {
            scope: class.as_str().to_string(),
            id: id.into(),
        }
    }

    /// The per-volume snapshot index file shared by all of a volume's snapshots.
    pub fn snapshot_index(volume_id: impl Into<String>) -> Self {
        Self {
            scope: SNAPSHOT_INDEX_SCOPE.to_string(),
            id: volume_id.into(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for LockTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.scope, self.id)
    }
}

/// Per-process, strictly increasing identifier of one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LeaseToken(pub u64);

#[derive(Debug, Serialize, Deserialize)]
struct LockHolder {
    pid: u32,
    token: u64,
    acquired_at: DateTime<Utc>,
}

/// A held resource lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct ResourceLock {
    target: LockTarget,
    path: PathBuf,
    token: LeaseToken,
    file: Option<File>,
}

impl ResourceLock {
    pub fn target(&self) -> &LockTarget {
        &self.target
    }

    pub fn token(&self) -> LeaseToken {
        self.token
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Unlocks and closes the descriptor. Calling it again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        let unlocked = file.unlock();
        drop(file);
        unlocked.map_err(|e| StoreError::io(format!("unlock {}", self.target), e))?;
        debug!(lock = %self.target, token = self.token.0, "lock released");
        Ok(())
    }
}

impl Drop for ResourceLock {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(lock = %self.target, error = %err, "failed to release lock on drop");
        }
    }
}

pub struct LockManager {
    layout: StoreLayout,
    policy: LockPolicy,
    next_token: AtomicU64,
}

impl LockManager {
    pub fn new(layout: StoreLayout, policy: LockPolicy) -> Self {
        Self {
            layout,
            policy,
            next_token: AtomicU64::new(1),
        }
    }

    pub fn policy(&self) -> &LockPolicy {
        &self.policy
    }

    fn next_token(&self) -> LeaseToken {
        LeaseToken(self.next_token.fetch_add(1, Ordering::SeqCst))
    }

    /// Exactly one non-blocking attempt, on the calling thread.
    pub fn try_acquire(&self, target: &LockTarget) -> Result<ResourceLock> {
        let path = self.layout.lock_file(target.scope(), target.id())?;
        let token = self.next_token();
        let file = lock_at(&path, target, token)?;
        Ok(held(target.clone(), path, token, file))
    }

    /// Like [`try_acquire`](Self::try_acquire), with the file I/O moved to the
    /// blocking pool.
    async fn try_acquire_blocking(&self, target: &LockTarget) -> Result<ResourceLock> {
        let path = self.layout.lock_file(target.scope(), target.id())?;
        let token = self.next_token();
        let (lock_path, lock_target) = (path.clone(), target.clone());
        let file = tokio::task::spawn_blocking(move || lock_at(&lock_path, &lock_target, token))
            .await
            .map_err(|e| StoreError::Internal(format!("lock task for {} failed: {}", target, e)))??;
        Ok(held(target.clone(), path, token, file))
    }

    /// Retries `try_acquire` every `retry_interval` until `timeout` elapses or
    /// `cancel` fires.
    pub async fn acquire(
        &self,
        target: &LockTarget,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ResourceLock> {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            match self.try_acquire_blocking(target).await {
                Ok(lock) => return Ok(lock),
                Err(StoreError::LockBusy { .. }) => {}
                Err(err) => return Err(err),
            }

            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return Err(StoreError::LockTimeout {
                    target: target.to_string(),
                    waited_ms: elapsed.as_millis() as u64,
                });
            }
            let wait = self.policy.retry_interval().min(timeout - elapsed);
            tokio::select! {
                _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                _ = sleep(wait) => {}
            }
        }
    }

    /// Runs `f` while holding the lock; the lock is released on every exit path.
    pub async fn with_lock<T, F, Fut>(
        &self,
        target: &LockTarget,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self
            .acquire(target, self.policy.acquire_timeout(), cancel)
            .await?;
        run_locked(lock, f).await
    }

    /// Like [`with_lock`](Self::with_lock) but retries contended acquisitions,
    /// sleeping `attempt * retry_backoff` between attempts.
    pub async fn with_lock_retry<T, F, Fut>(
        &self,
        target: &LockTarget,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.policy.retry_attempts.max(1);
        let mut attempt = 1;
        let lock = loop {
            match self
                .acquire(target, self.policy.acquire_timeout(), cancel)
                .await
            {
                Ok(lock) => break lock,
                Err(err) if err.is_lock_contention() && attempt < attempts => {
                    let backoff = self.policy.retry_backoff(attempt);
                    warn!(
                        lock = %target,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        "lock contended, retrying"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        };
        run_locked(lock, f).await
    }

    /// Deletes lock files older than `stale_after` that nobody currently holds.
    pub fn sweep_stale(&self) -> Result<usize> {
        let root = self.layout.locks_dir();
        let scopes = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(StoreError::io(
                    format!("read lock directory '{}'", root.display()),
                    e,
                ));
            }
        };

        let stale_after = self.policy.stale_after();
        let mut removed = 0;
        for scope in scopes.flatten() {
            if !scope.path().is_dir() {
                continue;
            }
            let Ok(entries) = fs::read_dir(scope.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.to_string_lossy().ends_with(LOCK_SUFFIX) {
                    continue;
                }
                match remove_if_stale(&path, stale_after) {
                    Ok(true) => {
                        info!(path = %path.display(), "removed stale lock file");
                        removed += 1;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(path = %path.display(), error = %e, "stale lock check failed"),
                }
            }
        }
        Ok(removed)
    }
}

async fn run_locked<T, F, Fut>(mut lock: ResourceLock, f: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let result = f().await;
    let released = lock.release();
    let value = result?;
    released?;
    Ok(value)
}

/// Opens and locks the file at `path`, then records the holder in it.
fn lock_at(path: &Path, target: &LockTarget, token: LeaseToken) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            StoreError::io(format!("create lock directory '{}'", parent.display()), e)
        })?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| StoreError::io(format!("open lock file '{}'", path.display()), e))?;

    if let Err(e) = file.try_lock_exclusive() {
        if is_contended(&e) {
            return Err(StoreError::LockBusy {
                target: target.to_string(),
            });
        }
        return Err(StoreError::io(format!("lock '{}'", path.display()), e));
    }

    if let Err(e) = write_holder(&mut file, token) {
        // Holder info is diagnostic only; the lock itself is taken.
        warn!(lock = %target, error = %e, "failed to record lock holder");
    }
    Ok(file)
}

fn held(target: LockTarget, path: PathBuf, token: LeaseToken, file: File) -> ResourceLock {
    debug!(lock = %target, token = token.0, "lock acquired");
    ResourceLock {
        target,
        path,
        token,
        file: Some(file),
    }
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_holder(file: &mut File, token: LeaseToken) -> io::Result<()> {
    let holder = LockHolder {
        pid: std::process::id(),
        token: token.0,
        acquired_at: Utc::now(),
    };
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    serde_json::to_writer(&mut *file, &holder)?;
    file.flush()
}

fn remove_if_stale(path: &Path, stale_after: Duration) -> io::Result<bool> {
    let age = fs::metadata(path)?
        .modified()?
        .elapsed()
        .unwrap_or(Duration::ZERO);
    if age < stale_after {
        return Ok(false);
    }

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    match file.try_lock_exclusive() {
        Ok(()) => {
            fs::remove_file(path)?;
            let _ = file.unlock();
            Ok(true)
        }
        Err(e) if is_contended(&e) => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn manager(temp_dir: &TempDir, policy: LockPolicy) -> LockManager {
        LockManager::new(StoreLayout::new(temp_dir.path()), policy)
    }

    fn fast_policy() -> LockPolicy {
        LockPolicy {
            acquire_timeout_ms: 200,
            retry_interval_ms: 10,
            stale_after_ms: 300_000,
            retry_attempts: 3,
            retry_backoff_ms: 20,
        }
    }

    #[tokio::test]
    async fn test_try_acquire_reports_busy() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::new(ResourceClass::Volume, "vol-1");

        let held = locks.try_acquire(&target).unwrap();
        assert!(held.is_held());
        assert!(held.path().ends_with("locks/volume/vol-1.lock"));
        let err = locks.try_acquire(&target).unwrap_err();
        assert!(matches!(err, StoreError::LockBusy { .. }));

        let other = LockTarget::new(ResourceClass::Volume, "vol-2");
        assert!(locks.try_acquire(&other).is_ok());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_acquire_on_single_threaded_runtime() {
        let temp_dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&temp_dir, fast_policy()));
        let target = LockTarget::new(ResourceClass::Instance, "Windows 10");
        let cancel = CancellationToken::new();

        let held = locks.acquire(&target, Duration::from_millis(50), &cancel).await.unwrap();
        assert!(held.path().ends_with("locks/instance/_57696e646f7773203130.lock"));
        let holder: serde_json::Value =
            serde_json::from_slice(&std::fs::read(held.path()).unwrap()).unwrap();
        assert_eq!(holder["token"], held.token().0);

        // The holder is released by another task while this one waits.
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            drop(held);
        });
        let next = locks.acquire(&target, Duration::from_secs(2), &cancel).await.unwrap();
        assert!(next.is_held());
    }

    #[tokio::test]
    async fn test_release_then_acquire_immediately() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::new(ResourceClass::Image, "img-1");
        let cancel = CancellationToken::new();

        let mut first = locks.acquire(&target, Duration::from_millis(50), &cancel).await.unwrap();
        first.release().unwrap();
        first.release().unwrap();
        assert!(!first.is_held());

        let second = locks.try_acquire(&target).unwrap();
        assert!(second.token() > first.token());
    }

    #[tokio::test]
    async fn test_acquire_times_out_while_held() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::new(ResourceClass::Volume, "vol-1");
        let cancel = CancellationToken::new();

        let _held = locks.try_acquire(&target).unwrap();
        let started = Instant::now();
        let err = locks
            .acquire(&target, Duration::from_millis(100), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::new(ResourceClass::Volume, "vol-1");
        let cancel = CancellationToken::new();

        let _held = locks.try_acquire(&target).unwrap();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let err = locks
            .acquire(&target, Duration::from_secs(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_winner() {
        let temp_dir = TempDir::new().unwrap();
        let locks = Arc::new(manager(&temp_dir, fast_policy()));
        let target = LockTarget::new(ResourceClass::Snapshot, "snap-1");

        let mut handles = Vec::new();
        for _ in 0..2 {
            let locks = Arc::clone(&locks);
            let target = target.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                match locks.acquire(&target, Duration::from_millis(150), &cancel).await {
                    Ok(lock) => {
                        sleep(Duration::from_millis(400)).await;
                        drop(lock);
                        true
                    }
                    Err(err) => {
                        assert!(matches!(err, StoreError::LockTimeout { .. }));
                        false
                    }
                }
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::new(ResourceClass::KeyPair, "kp-1");
        let cancel = CancellationToken::new();

        let result: Result<()> = locks
            .with_lock(&target, &cancel, || async {
                Err(StoreError::InvalidArgument("boom".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::InvalidArgument(_))));
        assert!(locks.try_acquire(&target).is_ok());
    }

    #[tokio::test]
    async fn test_with_lock_retry_waits_out_holder() {
        let temp_dir = TempDir::new().unwrap();
        let policy = LockPolicy {
            acquire_timeout_ms: 50,
            retry_backoff_ms: 100,
            ..fast_policy()
        };
        let locks = Arc::new(manager(&temp_dir, policy));
        let target = LockTarget::new(ResourceClass::Volume, "vol-1");
        let cancel = CancellationToken::new();

        let held = locks.try_acquire(&target).unwrap();
        tokio::spawn(async move {
            sleep(Duration::from_millis(80)).await;
            drop(held);
        });
        let value = locks
            .with_lock_retry(&target, &cancel, || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_with_lock_retry_gives_up() {
        let temp_dir = TempDir::new().unwrap();
        let policy = LockPolicy {
            acquire_timeout_ms: 20,
            retry_attempts: 2,
            retry_backoff_ms: 10,
            ..fast_policy()
        };
        let locks = manager(&temp_dir, policy);
        let target = LockTarget::new(ResourceClass::Volume, "vol-1");
        let cancel = CancellationToken::new();

        let _held = locks.try_acquire(&target).unwrap();
        let err = locks
            .with_lock_retry(&target, &cancel, || async { Ok(()) })
            .await
            .unwrap_err();
        assert!(err.is_lock_contention());
    }

    #[tokio::test]
    async fn test_sweep_skips_held_locks() {
        let temp_dir = TempDir::new().unwrap();
        let policy = LockPolicy {
            stale_after_ms: 0,
            ..fast_policy()
        };
        let locks = manager(&temp_dir, policy);
        let held_target = LockTarget::new(ResourceClass::Volume, "held");
        let abandoned = LockTarget::new(ResourceClass::Volume, "abandoned");

        let held = locks.try_acquire(&held_target).unwrap();
        let mut old = locks.try_acquire(&abandoned).unwrap();
        old.release().unwrap();
        let abandoned_path = old.path().to_path_buf();

        assert_eq!(locks.sweep_stale().unwrap(), 1);
        assert!(!abandoned_path.exists());
        assert!(held.path().exists());
    }

    #[tokio::test]
    async fn test_sweep_keeps_fresh_locks() {
        let temp_dir = TempDir::new().unwrap();
        let locks = manager(&temp_dir, fast_policy());
        let target = LockTarget::snapshot_index("vol-1");
        let mut lock = locks.try_acquire(&target).unwrap();
        lock.release().unwrap();
        assert!(lock.path().ends_with("locks/snapshot-index/vol-1.lock"));
        assert_eq!(locks.sweep_stale().unwrap(), 0);
        assert!(lock.path().exists());
    }
}
