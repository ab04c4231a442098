//! Background Reconciler (C7): periodically re-pulls the set of unlabeled
//! task IDs from the upstream store and folds it into the in-process
//! [`AssignmentQueue`], then republishes [`crate::models::CachedCounters`].
//!
//! Modeled as a cancellable task spawned at startup and joined at shutdown
//! (see `main.rs`), the same shape teacher uses for its long-running
//! orchestrator loop: no process-global singleton beyond the handle the
//! caller holds.

use crate::lease::LeaseStore;
use crate::queue::AssignmentQueue;
use crate::upstream::UpstreamClient;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, warn};

pub struct Reconciler {
    upstream: Arc<dyn UpstreamClient>,
    leases: Arc<dyn LeaseStore>,
    queue: Arc<AssignmentQueue>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        upstream: Arc<dyn UpstreamClient>,
        leases: Arc<dyn LeaseStore>,
        queue: Arc<AssignmentQueue>,
        interval: Duration,
    ) -> Self {
        Self {
            upstream,
            leases,
            queue,
            interval,
        }
    }

    /// Runs one reconciliation tick: pull, fold into the queue, republish
    /// counters. On upstream failure the previous queue and counters are
    /// left untouched and the error is logged, never propagated — a single
    /// failed tick must not take the server down.
    pub async fn tick(&self) {
        match self.upstream.list_unlabeled_task_ids().await {
            Ok(ids) => {
                let set: HashSet<_> = ids.into_iter().collect();
                let (added, removed) = self.queue.reconcile(&set).await;
                if added > 0 || removed > 0 {
                    info!(added, removed, "reconciled assignment queue");
                }
                if let Err(e) = self.queue.refresh_counters(self.leases.as_ref()).await {
                    warn!(error = %e, "failed to refresh cached counters after reconcile");
                }
            }
            Err(e) => {
                warn!(error = %e, "reconcile tick skipped: upstream unavailable");
            }
        }
    }

    /// Runs the loop of periodic ticks on `interval` until `shutdown` fires.
    /// Does not run an initial tick itself — the caller is responsible for
    /// awaiting one synchronously first (see `run`) so the API never starts
    /// accepting traffic against an empty queue.
    pub async fn run_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.interval);
        ticker.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    info!("reconciler shutting down");
                    break;
                }
            }
        }
    }

    /// Runs the first tick synchronously (so `/api/stats` has real numbers
    /// before the first `SyncInterval` elapses), then loops on `interval`
    /// until `shutdown` fires. Callers that need to guarantee the first tick
    /// completes before accepting requests (see `main.rs`) should instead
    /// await `tick()` directly and spawn `run_loop` for the remainder.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) {
        self.tick().await;
        self.run_loop(shutdown).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseStore as _;
    use crate::models::{AcquireOutcome, Lease, ReleaseOutcome, TaskId};
    use crate::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeUpstream {
        ids: Vec<TaskId>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn list_unlabeled_task_ids(&self) -> Result<Vec<TaskId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.ids.clone())
        }
        async fn get_task(&self, _task_id: TaskId) -> Result<Option<crate::models::TaskMeta>> {
            Ok(None)
        }
        async fn create_annotation(
            &self,
            _task_id: TaskId,
            _text: &str,
            _agent_id: crate::models::AgentId,
        ) -> Result<i64> {
            unimplemented!()
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    struct NoopLeaseStore;

    #[async_trait]
    impl LeaseStore for NoopLeaseStore {
        async fn acquire_lease(
            &self,
            _task_id: TaskId,
            _agent_id: crate::models::AgentId,
        ) -> Result<AcquireOutcome> {
            Ok(AcquireOutcome::Granted)
        }
        async fn inspect_lease(&self, _task_id: TaskId) -> Result<Option<Lease>> {
            Ok(None)
        }
        async fn release_lease(
            &self,
            _task_id: TaskId,
            _agent_id: crate::models::AgentId,
        ) -> Result<ReleaseOutcome> {
            Ok(ReleaseOutcome::Absent)
        }
        async fn set_cooldown(&self, _task_id: TaskId, _agent_id: crate::models::AgentId) -> Result<()> {
            Ok(())
        }
        async fn in_cooldown(&self, _task_id: TaskId, _agent_id: crate::models::AgentId) -> Result<bool> {
            Ok(false)
        }
        async fn count_locked(&self, _task_ids: &[TaskId]) -> Result<usize> {
            Ok(0)
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn tick_populates_queue_from_upstream() {
        let upstream = Arc::new(FakeUpstream {
            ids: vec![3, 1, 2],
            calls: AtomicUsize::new(0),
        });
        let leases: Arc<dyn LeaseStore> = Arc::new(NoopLeaseStore);
        let queue = Arc::new(AssignmentQueue::new());
        let reconciler = Reconciler::new(upstream, leases, queue.clone(), Duration::from_secs(30));

        reconciler.tick().await;

        assert_eq!(queue.snapshot_size().await, 3);
        let counters = queue.counters().await;
        assert_eq!(counters.total_unlabeled, 3);
        assert_eq!(counters.available, 3);
    }
}
