//! Dispatcher (C5): top-level operations (request, submit, skip) that
//! orchestrate the Lease Store, Upstream Client, Stats Store, and Assignment
//! Queue under the step ordering required for correctness.

use crate::constants::RATE_PER_SECOND;
use crate::lease::LeaseStore;
use crate::models::{AcquireOutcome, AgentId, AgentStats, Assignment, CachedCounters, ReleaseOutcome, TaskId};
use crate::queue::AssignmentQueue;
use crate::stats::StatsStore;
use crate::upstream::UpstreamClient;
use crate::{DispatchError, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Dispatcher<S: StatsStore> {
    leases: Arc<dyn LeaseStore>,
    upstream: Arc<dyn UpstreamClient>,
    stats: Arc<S>,
    queue: Arc<AssignmentQueue>,
    rate_per_second: f64,
    audio_url_base: String,
}

pub struct Health {
    pub upstream_ok: bool,
    pub kv_ok: bool,
    pub db_ok: bool,
}

impl<S: StatsStore> Dispatcher<S> {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        upstream: Arc<dyn UpstreamClient>,
        stats: Arc<S>,
        queue: Arc<AssignmentQueue>,
        audio_url_base: String,
    ) -> Self {
        Self {
            leases,
            upstream,
            stats,
            queue,
            rate_per_second: RATE_PER_SECOND,
            audio_url_base,
        }
    }

    pub fn with_rate(mut self, rate_per_second: f64) -> Self {
        self.rate_per_second = rate_per_second;
        self
    }

    fn audio_url_for(&self, task_id: TaskId, agent_id: AgentId) -> String {
        format!("{}/api/audio/stream/{}/{}", self.audio_url_base, task_id, agent_id)
    }

    /// Evaluates the combined cooldown + acquisition predicate used by
    /// `pop_candidate_skipping`. Acquisition is an unavoidable side effect of
    /// evaluating this predicate: a granted lease on a task this call doesn't
    /// end up returning (because a later step fails) must be released by the
    /// caller.
    async fn try_claim(&self, task_id: TaskId, agent_id: AgentId) -> Result<bool> {
        if self.leases.in_cooldown(task_id, agent_id).await? {
            return Ok(false);
        }
        Ok(self.leases.acquire_lease(task_id, agent_id).await? == AcquireOutcome::Granted)
    }

    pub async fn request_task(&self, agent_id: AgentId) -> Result<Option<Assignment>> {
        let candidate = self
            .queue
            .pop_candidate_skipping(|task_id| self.try_claim(task_id, agent_id))
            .await?;
        let task_id = match candidate {
            Some(task_id) => task_id,
            None => return Ok(None),
        };

        let meta = match self.upstream.get_task(task_id).await {
            Ok(Some(meta)) => meta,
            Ok(None) => {
                // Upstream no longer has this task; evict it and let the
                // caller retry against a fresher queue.
                let _ = self.leases.release_lease(task_id, agent_id).await;
                self.queue.mark_completed(task_id).await;
                return Ok(None);
            }
            Err(e) => {
                let _ = self.leases.release_lease(task_id, agent_id).await;
                self.queue.push_front(task_id).await;
                return Err(e);
            }
        };

        let now = Utc::now();
        self.stats.open_session(agent_id, task_id, now).await?;

        Ok(Some(Assignment {
            task_id,
            audio_url: self.audio_url_for(task_id, agent_id),
            duration: meta.duration_seconds,
            file_name: meta.file_name,
        }))
    }

    pub async fn submit_transcription(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        text: &str,
    ) -> Result<i64> {
        if text.trim().is_empty() {
            return Err(DispatchError::InvalidArgument(
                "transcription must be non-empty".into(),
            ));
        }

        let lease = self
            .leases
            .inspect_lease(task_id)
            .await?
            .filter(|l| l.agent_id == agent_id)
            .ok_or(DispatchError::Forbidden)?;

        let annotation_id = match self.upstream.create_annotation(task_id, text, agent_id).await {
            Ok(id) => id,
            Err(DispatchError::NotFound(reason)) => {
                // Permanent failure: release and let the reconciler evict.
                let _ = self.leases.release_lease(task_id, agent_id).await;
                return Err(DispatchError::NotFound(reason));
            }
            Err(transient) => return Err(transient),
        };

        let now = Utc::now();
        let duration = (now - lease.acquired_at)
            .to_std()
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
            .max(0.0);

        let task_duration = self.upstream.get_task(task_id).await.ok().flatten();
        let earnings = match task_duration {
            Some(meta) => meta.duration_seconds * self.rate_per_second,
            None => {
                warn!(task_id, "task metadata unavailable at submit time, earnings recorded as 0");
                0.0
            }
        };

        if let Some(session_id) = self.stats.find_open_session(agent_id, task_id).await? {
            self.stats
                .close_session_completed(session_id, now, duration, text.len() as i32)
                .await?;
        }
        self.stats
            .bump_agent_on_complete(agent_id, duration, earnings, now)
            .await?;

        self.leases.release_lease(task_id, agent_id).await?;
        self.queue.mark_completed(task_id).await;

        Ok(annotation_id)
    }

    pub async fn skip_task(&self, task_id: TaskId, agent_id: AgentId, reason: &str) -> Result<()> {
        let lease = self
            .leases
            .inspect_lease(task_id)
            .await?
            .filter(|l| l.agent_id == agent_id)
            .ok_or(DispatchError::Forbidden)?;
        let _ = lease;

        let outcome = self.leases.release_lease(task_id, agent_id).await?;
        if outcome == ReleaseOutcome::NotOwner {
            return Err(DispatchError::Forbidden);
        }
        self.leases.set_cooldown(task_id, agent_id).await?;

        let now = Utc::now();
        if let Some(session_id) = self.stats.find_open_session(agent_id, task_id).await? {
            self.stats
                .close_session_skipped(session_id, now, reason)
                .await?;
        }
        self.stats.bump_agent_on_skip(agent_id, now).await?;

        debug!(task_id, agent_id, reason, "task skipped, cooldown set");
        Ok(())
    }

    pub async fn stats_for(&self, agent_id: AgentId) -> Result<AgentStats> {
        self.stats.get_agent_stats(agent_id).await
    }

    pub async fn counters(&self) -> CachedCounters {
        self.queue.counters().await
    }

    /// Counts queued tasks that are neither currently leased nor in cooldown
    /// for `agent_id` — a refinement of `counters().available` to "available
    /// to this specific agent right now".
    pub async fn available_for_agent(&self, agent_id: AgentId) -> Result<usize> {
        let snapshot = self.queue.snapshot_ids().await;
        let mut count = 0;
        for task_id in snapshot {
            if self.leases.inspect_lease(task_id).await?.is_some() {
                continue;
            }
            if !self.leases.in_cooldown(task_id, agent_id).await? {
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn health(&self) -> Health {
        Health {
            upstream_ok: self.upstream.ping().await.is_ok(),
            kv_ok: self.leases.ping().await.is_ok(),
            db_ok: self.stats.ping().await.is_ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskMeta;
    use crate::stats::InMemoryStatsStore;
    use crate::upstream::UpstreamClient;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;
    use tokio::sync::Mutex as AsyncMutex;

    /// A lease store whose state lives entirely in memory, mirroring the
    /// subset of Redis semantics the Dispatcher relies on.
    #[derive(Default)]
    struct FakeLeaseStore {
        leases: AsyncMutex<HashMap<TaskId, (AgentId, chrono::DateTime<Utc>)>>,
        cooldowns: AsyncMutex<HashSet<(TaskId, AgentId)>>,
    }

    #[async_trait]
    impl LeaseStore for FakeLeaseStore {
        async fn acquire_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<AcquireOutcome> {
            let mut leases = self.leases.lock().await;
            if leases.contains_key(&task_id) {
                return Ok(AcquireOutcome::Contended);
            }
            leases.insert(task_id, (agent_id, Utc::now()));
            Ok(AcquireOutcome::Granted)
        }

        async fn inspect_lease(&self, task_id: TaskId) -> Result<Option<crate::models::Lease>> {
            let leases = self.leases.lock().await;
            Ok(leases
                .get(&task_id)
                .map(|&(agent_id, acquired_at)| crate::models::Lease { agent_id, acquired_at }))
        }

        async fn release_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<ReleaseOutcome> {
            let mut leases = self.leases.lock().await;
            match leases.get(&task_id) {
                Some(&(owner, _)) if owner == agent_id => {
                    leases.remove(&task_id);
                    Ok(ReleaseOutcome::Released)
                }
                Some(_) => Ok(ReleaseOutcome::NotOwner),
                None => Ok(ReleaseOutcome::Absent),
            }
        }

        async fn set_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<()> {
            self.cooldowns.lock().await.insert((task_id, agent_id));
            Ok(())
        }

        async fn in_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<bool> {
            Ok(self.cooldowns.lock().await.contains(&(task_id, agent_id)))
        }

        async fn count_locked(&self, task_ids: &[TaskId]) -> Result<usize> {
            let leases = self.leases.lock().await;
            Ok(task_ids.iter().filter(|id| leases.contains_key(id)).count())
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    /// An upstream double backed by a fixed in-memory task table.
    struct FakeUpstream {
        tasks: StdMutex<HashMap<TaskId, TaskMeta>>,
    }

    impl FakeUpstream {
        fn with_tasks(tasks: Vec<(TaskId, TaskMeta)>) -> Self {
            Self {
                tasks: StdMutex::new(tasks.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl UpstreamClient for FakeUpstream {
        async fn list_unlabeled_task_ids(&self) -> Result<Vec<TaskId>> {
            Ok(self.tasks.lock().unwrap().keys().copied().collect())
        }

        async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskMeta>> {
            Ok(self.tasks.lock().unwrap().get(&task_id).cloned())
        }

        async fn create_annotation(&self, _task_id: TaskId, _text: &str, _agent_id: AgentId) -> Result<i64> {
            Ok(1)
        }

        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn sample_meta() -> TaskMeta {
        TaskMeta {
            file_name: "clip.wav".to_string(),
            duration_seconds: 12.0,
        }
    }

    async fn dispatcher_with_one_task() -> Dispatcher<InMemoryStatsStore> {
        let leases: Arc<dyn LeaseStore> = Arc::new(FakeLeaseStore::default());
        let upstream: Arc<dyn UpstreamClient> =
            Arc::new(FakeUpstream::with_tasks(vec![(1, sample_meta())]));
        let stats = Arc::new(InMemoryStatsStore::new());
        let queue = Arc::new(AssignmentQueue::new());
        queue.reconcile(&[1].into_iter().collect()).await;
        Dispatcher::new(leases, upstream, stats, queue, "http://localhost:8010".to_string())
    }

    #[tokio::test]
    async fn second_agent_is_contended_out_of_an_already_leased_task() {
        let dispatcher = dispatcher_with_one_task().await;

        let first = dispatcher.request_task(100).await.unwrap();
        assert!(first.is_some());

        let second = dispatcher.request_task(200).await.unwrap();
        assert!(second.is_none(), "a leased task must not be handed to a second agent");
    }

    #[tokio::test]
    async fn skipped_task_is_unavailable_to_the_skipper_during_cooldown() {
        let dispatcher = dispatcher_with_one_task().await;

        let assignment = dispatcher.request_task(100).await.unwrap().unwrap();
        assert_eq!(assignment.task_id, 1);

        dispatcher.skip_task(1, 100, "too noisy").await.unwrap();

        // The skipping agent is in cooldown for this task ...
        let retry = dispatcher.request_task(100).await.unwrap();
        assert!(retry.is_none());

        // ... but a different agent may still claim it.
        let other = dispatcher.request_task(200).await.unwrap();
        assert_eq!(other.unwrap().task_id, 1);
    }

    #[tokio::test]
    async fn submit_releases_lease_and_marks_task_completed() {
        let dispatcher = dispatcher_with_one_task().await;
        dispatcher.request_task(100).await.unwrap();

        dispatcher.submit_transcription(1, 100, "hello world").await.unwrap();

        let stats = dispatcher.stats_for(100).await.unwrap();
        assert_eq!(stats.total_tasks_completed, 1);

        // Completed tasks never resurface even if the queue is refreshed.
        let retry = dispatcher.request_task(200).await.unwrap();
        assert!(retry.is_none());
    }

    #[tokio::test]
    async fn submit_by_non_owner_is_forbidden() {
        let dispatcher = dispatcher_with_one_task().await;
        dispatcher.request_task(100).await.unwrap();

        let err = dispatcher
            .submit_transcription(1, 999, "not mine")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Forbidden));
    }

    #[tokio::test]
    async fn submit_rejects_blank_transcription() {
        let dispatcher = dispatcher_with_one_task().await;
        dispatcher.request_task(100).await.unwrap();

        let err = dispatcher
            .submit_transcription(1, 100, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument(_)));
    }
}
