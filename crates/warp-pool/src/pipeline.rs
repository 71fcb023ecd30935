//! Sequential access optimizer
//!
//! Streams tensors in a known order (layers of a model, batches of a
//! dataset). While step `i` is consumed, step `i + lookahead` is pulled
//! local and step `i - 2` is pushed to a peer. Step `i + lookahead + 1` is
//! handed to the background prefetcher so it can start moving early.

use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::MemoryPool;
use crate::error::{PoolError, PoolResult};
use crate::events::PoolEvent;
use crate::placement::PatternEvent;
use crate::prefetch::PrefetchItem;
use crate::types::{Tier, TensorId};

/// Distance behind the current step at which tensors are evicted
pub const EVICT_DISTANCE: usize = 2;

/// Outcome of a sequential run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    /// Steps consumed
    pub steps: usize,
    /// Tensors pulled local ahead of use
    pub prefetched: usize,
    /// Tensors pushed off the node behind the cursor
    pub evicted: usize,
    /// Tensors handed to the background prefetcher
    pub queued: usize,
    /// Steps whose tensor was not fully local when reached
    pub stalls: usize,
    /// Bytes handed to the consumer
    pub bytes_read: u64,
    /// Wall time
    #[serde(with = "duration_ms")]
    pub elapsed: Duration,
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

/// Drives one sequential run over a pool
pub struct PipelineOptimizer<'a> {
    pool: &'a MemoryPool,
    lookahead: usize,
}

impl<'a> PipelineOptimizer<'a> {
    /// Optimizer prefetching `lookahead` steps ahead
    pub fn new(pool: &'a MemoryPool, lookahead: usize) -> Self {
        Self { pool, lookahead }
    }

    /// Consume `steps` in order
    ///
    /// A prefetch or eviction failure is logged and does not stop the run;
    /// a read or consumer failure does.
    pub async fn run<F>(
        &self,
        steps: &[TensorId],
        mut consumer: F,
        token: &CancellationToken,
    ) -> PoolResult<PipelineReport>
    where
        F: FnMut(usize, Bytes) -> PoolResult<()>,
    {
        let started = Instant::now();
        let inner = self.pool.inner();
        let evict_enabled = !inner.transport.peers().is_empty();
        let mut report = PipelineReport::default();

        info!(steps = steps.len(), lookahead = self.lookahead, "starting sequential run");

        for (i, &current) in steps.iter().enumerate() {
            if token.is_cancelled() {
                return Err(PoolError::Cancelled);
            }

            if self.tier_of(current).await? != Tier::L1Local {
                report.stalls += 1;
            }

            let ahead = steps.get(i + self.lookahead).copied();
            let behind = i
                .checked_sub(EVICT_DISTANCE)
                .and_then(|j| steps.get(j).copied())
                .filter(|id| evict_enabled && !steps[i..].contains(id));

            if let Some(&next) = steps.get(i + self.lookahead + 1) {
                if self.queue_ahead(next, i + self.lookahead + 1) {
                    report.queued += 1;
                }
            }

            let (read, prefetched, evicted) = tokio::join!(
                self.pool.read_with_token(current, token),
                self.prefetch(ahead, token),
                self.evict(behind, token),
            );

            let data = read?;
            report.bytes_read += data.len() as u64;
            consumer(i, data)?;

            if prefetched {
                report.prefetched += 1;
            }
            if evicted {
                report.evicted += 1;
            }
            if i > 0 {
                inner.predictor.record_pattern(PatternEvent::Sequential {
                    from: steps[i - 1],
                    to: current,
                });
            }
            inner.metrics.record_pipeline_step();
            report.steps += 1;
        }

        report.elapsed = started.elapsed();
        info!(
            steps = report.steps,
            prefetched = report.prefetched,
            evicted = report.evicted,
            stalls = report.stalls,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "sequential run complete"
        );
        Ok(report)
    }

    async fn tier_of(&self, id: TensorId) -> PoolResult<Tier> {
        let entry = self
            .pool
            .inner()
            .registry
            .get(id)
            .ok_or_else(|| PoolError::not_found(id))?;
        let tier = entry.state().read().await.tier;
        Ok(tier)
    }

    fn queue_ahead(&self, id: TensorId, step: usize) -> bool {
        let inner = self.pool.inner();
        let item = PrefetchItem::sequential(id, step);
        let queued = inner.prefetcher.enqueue(item);
        if queued {
            inner.events.publish(PoolEvent::PrefetchQueued {
                tensor: id,
                reason: item.reason,
            });
        }
        queued
    }

    async fn prefetch(&self, target: Option<TensorId>, token: &CancellationToken) -> bool {
        let Some(id) = target else {
            return false;
        };
        let inner = self.pool.inner();
        let Some(entry) = inner.registry.get(id) else {
            return false;
        };
        match inner.tier.promote(&entry, token).await {
            Ok(moved) => {
                debug!(tensor = %id, moved, "pipeline prefetch");
                if moved > 0 {
                    inner.metrics.record_prefetch();
                }
                moved > 0
            }
            Err(e) => {
                warn!(tensor = %id, error = %e, "pipeline prefetch failed");
                false
            }
        }
    }

    async fn evict(&self, target: Option<TensorId>, token: &CancellationToken) -> bool {
        let Some(id) = target else {
            return false;
        };
        let inner = self.pool.inner();
        let Some(entry) = inner.registry.get(id) else {
            return false;
        };
        match inner.tier.demote(&entry, token).await {
            Ok(outcome) => {
                debug!(tensor = %id, chunks = outcome.chunks, "pipeline eviction");
                outcome.chunks > 0
            }
            Err(e) => {
                warn!(tensor = %id, error = %e, "pipeline eviction failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefetch::PrefetchReason;
    use crate::types::AllocationHint;
    use warp_config::PoolConfig;

    fn pool() -> MemoryPool {
        let mut config = PoolConfig::default();
        config.node.id = "gpu-pipe".into();
        config.memory.budget_bytes = 1 << 20;
        config.chunk.chunk_size = 256;
        MemoryPool::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_run_in_order() {
        let pool = pool();
        let mut steps = Vec::new();
        for i in 0..5u8 {
            let id = pool.allocate(300, AllocationHint::default()).await.unwrap();
            pool.write(id, vec![i; 300]).await.unwrap();
            steps.push(id);
        }

        let mut seen = Vec::new();
        let report = pool
            .run_sequential(&steps, |i, data| {
                seen.push((i, data[0]));
                Ok(())
            })
            .await
            .unwrap();

        assert_eq!(seen, vec![(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]);
        assert_eq!(report.steps, 5);
        assert_eq!(report.stalls, 0);
        assert_eq!(report.evicted, 0);
        assert_eq!(report.bytes_read, 1500);
    }

    #[tokio::test]
    async fn test_far_steps_queued_for_prefetch() {
        let pool = pool();
        let mut events = pool.subscribe();
        let mut steps = Vec::new();
        for _ in 0..6 {
            steps.push(pool.allocate(64, AllocationHint::default()).await.unwrap());
        }

        let report = pool.run_sequential(&steps, |_, _| Ok(())).await.unwrap();

        // Default lookahead is 2, so steps 3.. are queued ahead of time.
        assert_eq!(report.queued, 3);
        let mut sequential = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let PoolEvent::PrefetchQueued {
                tensor,
                reason: PrefetchReason::Sequential { step },
            } = event
            {
                sequential.push((step, tensor));
            }
        }
        assert_eq!(sequential, vec![(3, steps[3]), (4, steps[4]), (5, steps[5])]);
    }

    #[tokio::test]
    async fn test_consumer_error_stops_run() {
        let pool = pool();
        let a = pool.allocate(10, AllocationHint::default()).await.unwrap();
        let b = pool.allocate(10, AllocationHint::default()).await.unwrap();

        let mut calls = 0;
        let err = pool
            .run_sequential(&[a, b], |_, _| {
                calls += 1;
                Err(PoolError::Protocol("consumer gave up".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Protocol(_)));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let pool = pool();
        let a = pool.allocate(10, AllocationHint::default()).await.unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = pool
            .run_sequential_with_token(&[a], |_, _| Ok(()), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::Cancelled));
    }

    #[test]
    fn test_report_json() {
        let report = PipelineReport {
            steps: 3,
            elapsed: Duration::from_millis(1500),
            ..Default::default()
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["elapsed"], 1500);
    }
}
