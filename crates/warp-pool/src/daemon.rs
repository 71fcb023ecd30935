//! Background scheduler - periodic promotion, compression, prefetch,
//! reclamation and telemetry

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::engine::{MemoryPool, PoolInner};
use crate::metrics::{BackgroundTask, PoolMetrics};

/// Handles to the running background loops
pub(crate) struct BackgroundScheduler {
    token: CancellationToken,
    metrics: Arc<PoolMetrics>,
    handles: Vec<(BackgroundTask, JoinHandle<()>)>,
}

impl BackgroundScheduler {
    /// Spawn one loop per enabled task; loops hold only a weak reference
    /// so a dropped pool ends them
    pub(crate) fn start(inner: &Arc<PoolInner>, token: CancellationToken) -> Self {
        let config = &inner.config;
        let mut handles = Vec::with_capacity(BackgroundTask::ALL.len());

        for task in BackgroundTask::ALL {
            let period = match task {
                BackgroundTask::Promotion => config.tiering.promotion_interval(),
                BackgroundTask::IdleCompression => config.tiering.idle_interval(),
                BackgroundTask::Prefetch => config.prefetch.interval(),
                BackgroundTask::Reclaim => config.reclaim.interval(),
                BackgroundTask::Telemetry => {
                    if !config.telemetry.enabled {
                        continue;
                    }
                    config.telemetry.interval()
                }
            };
            let handle = tokio::spawn(run_loop(
                task,
                period,
                Arc::downgrade(inner),
                token.clone(),
            ));
            handles.push((task, handle));
        }

        inner.metrics.record_start();
        info!(tasks = handles.len(), "background scheduler started");
        Self {
            token,
            metrics: inner.metrics.clone(),
            handles,
        }
    }

    /// Cancel every loop and wait for it to finish its current tick
    pub(crate) async fn shutdown(self) {
        self.token.cancel();
        for (task, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(%task, error = %e, "background task ended abnormally");
            }
        }
        self.metrics.record_stop();
        info!("background scheduler stopped");
    }
}

async fn run_loop(task: BackgroundTask, period: Duration, pool: Weak<PoolInner>, token: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = pool.upgrade() else {
                    break;
                };
                let pool = MemoryPool::from_inner(inner);
                match pool.run_task(task).await {
                    Ok(0) => {}
                    Ok(n) => debug!(%task, n, "background tick"),
                    Err(e) => {
                        error!(%task, error = %e, "background tick failed");
                        pool.metrics().record_task_error(task);
                    }
                }
            }
            _ = token.cancelled() => break,
        }
    }

    debug!(%task, "background loop exited");
}

#[cfg(test)]
mod tests {
    use crate::engine::MemoryPool;
    use crate::types::AllocationHint;
    use std::time::Duration;
    use warp_config::PoolConfig;

    fn config() -> PoolConfig {
        let mut config = PoolConfig::default();
        config.node.id = "gpu-daemon".into();
        config.memory.budget_bytes = 1 << 20;
        config.chunk.chunk_size = 1024;
        config.reclaim.interval_secs = 1;
        config
    }

    #[tokio::test]
    async fn test_reclaim_loop_runs() {
        let pool = MemoryPool::new(config()).unwrap();
        let id = pool
            .allocate(64, AllocationHint::default().with_ttl(Duration::from_millis(100)))
            .await
            .unwrap();
        pool.start();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(pool.describe(id).await.is_err());
        assert_eq!(pool.metrics().performance(1.0).reclaimed, 1);

        pool.stop().await;
        assert!(!pool.is_running());
    }

    #[tokio::test]
    async fn test_telemetry_disabled_skips_loop() {
        let mut config = config();
        config.telemetry.enabled = false;
        let pool = MemoryPool::new(config).unwrap();
        pool.start();
        assert!(pool.is_running());
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.shutdown().await;
        assert!(!pool.is_running());
        assert_eq!(pool.metrics().errors().telemetry_task, 0);
    }
}
