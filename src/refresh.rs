use crate::core::{Result, StoreError};
use crate::index::IndexStats;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error};

/// Something that can rebuild its index from the backing stores.
#[async_trait]
pub trait Refresh: Send + Sync {
    async fn refresh(&self) -> Result<IndexStats>;
}

/// Background worker for periodic index rebuilds.
pub struct RefreshWorker {
    stop_tx: Option<oneshot::Sender<()>>,
    join_handle: Option<JoinHandle<()>>,
}

impl RefreshWorker {
    /// Signals the worker to stop and waits for it to finish.
    pub async fn stop(mut self) -> Result<()> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }

        if let Some(join_handle) = self.join_handle.take() {
            join_handle
                .await
                .map_err(|err| StoreError::Internal(format!("refresh worker join: {}", err)))?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.join_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for RefreshWorker {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}

/// Spawns a worker that calls `target.refresh()` every `interval`. A failed
/// refresh is logged and the previous index stays in place.
pub fn spawn_refresh_worker<R>(target: Arc<R>, interval: Duration) -> RefreshWorker
where
    R: Refresh + ?Sized + 'static,
{
    let interval = interval.max(Duration::from_millis(10));
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    let join_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = &mut stop_rx => {
                    break;
                }
                _ = sleep(interval) => {
                    match target.refresh().await {
                        Ok(stats) => debug!(generation = stats.generation, "index refreshed"),
                        Err(err) => error!(error = %err, "index refresh failed"),
                    }
                }
            }
        }
    });

    RefreshWorker {
        stop_tx: Some(stop_tx),
        join_handle: Some(join_handle),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Refresh for Counting {
        async fn refresh(&self) -> Result<IndexStats> {
            let generation = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if generation % 2 == 0 {
                return Err(StoreError::Unavailable("flaky".to_string()));
            }
            Ok(IndexStats {
                generation,
                built_at: None,
                counts: BTreeMap::new(),
            })
        }
    }

    #[tokio::test]
    async fn test_worker_runs_until_stopped() {
        let target = Arc::new(Counting::default());
        let worker = spawn_refresh_worker(target.clone(), Duration::from_millis(10));
        assert!(worker.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        worker.stop().await.unwrap();
        let calls = target.calls.load(Ordering::SeqCst);
        // Failures do not end the loop.
        assert!(calls >= 3, "only {calls} refreshes ran");

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(target.calls.load(Ordering::SeqCst), calls);
    }
}
