//! Assignment Queue (C4): the reconciled ordered list of assignable task IDs,
//! a disjoint completed-set, and cached availability counters.
//!
//! The whole compound read-modify-write surface (pop-with-rotation,
//! reconcile, remove, mark_completed) is serialized behind a single
//! in-process async mutex guarding the ordered queue plus the completed set;
//! `CachedCounters` is published through a separate `RwLock` so readers never
//! block on the mutex.

use crate::lease::LeaseStore;
use crate::models::{CachedCounters, TaskId};
use crate::Result;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

struct QueueState {
    order: VecDeque<TaskId>,
    completed: HashSet<TaskId>,
}

pub struct AssignmentQueue {
    state: Mutex<QueueState>,
    counters: RwLock<CachedCounters>,
}

impl Default for AssignmentQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AssignmentQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                order: VecDeque::new(),
                completed: HashSet::new(),
            }),
            counters: RwLock::new(CachedCounters::empty(Utc::now())),
        }
    }

    pub async fn snapshot_size(&self) -> usize {
        self.state.lock().await.order.len()
    }

    pub async fn snapshot_ids(&self) -> Vec<TaskId> {
        self.state.lock().await.order.iter().copied().collect()
    }

    /// Atomically removes and returns the first task_id for which `predicate`
    /// resolves to `Ok(true)`. Tasks the predicate rejects are rotated to the
    /// back, preserving fairness for other callers under contention. A
    /// predicate error (e.g. lease store unavailable) aborts the scan and is
    /// propagated to the caller; the candidate that raised it is rotated to
    /// the back so it isn't lost.
    pub async fn pop_candidate_skipping<F, Fut>(&self, mut predicate: F) -> Result<Option<TaskId>>
    where
        F: FnMut(TaskId) -> Fut,
        Fut: std::future::Future<Output = Result<bool>>,
    {
        let mut guard = self.state.lock().await;
        let len = guard.order.len();
        for _ in 0..len {
            let candidate = match guard.order.pop_front() {
                Some(c) => c,
                None => return Ok(None),
            };
            match predicate(candidate).await {
                Ok(true) => return Ok(Some(candidate)),
                Ok(false) => guard.order.push_back(candidate),
                Err(e) => {
                    guard.order.push_back(candidate);
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// Idempotent removal; used on successful completion and on permanent
    /// upstream failure of a task.
    pub async fn remove(&self, task_id: TaskId) {
        let mut guard = self.state.lock().await;
        guard.order.retain(|&t| t != task_id);
    }

    /// Reinserts a task at the front of the queue; used to roll back a failed
    /// `request_task` attempt so the winner isn't lost to other agents.
    pub async fn push_front(&self, task_id: TaskId) {
        let mut guard = self.state.lock().await;
        if !guard.order.contains(&task_id) {
            guard.order.push_front(task_id);
        }
    }

    /// Inserts into the completed set (idempotent) and removes from the
    /// queue. Once completed, a task_id never re-enters the queue even if a
    /// later reconcile still observes it in `unlabeled_ids` (upstream lag).
    pub async fn mark_completed(&self, task_id: TaskId) {
        let mut guard = self.state.lock().await;
        guard.completed.insert(task_id);
        guard.order.retain(|&t| t != task_id);
    }

    /// Computes `to_add = unlabeled_ids - currentQueue - CompletedSet` and
    /// `to_remove = currentQueue - unlabeled_ids`, applies both, and returns
    /// the counts touched. Task IDs are added in sorted order for a
    /// deterministic fairness ordering across repeated reconciles.
    pub async fn reconcile(&self, unlabeled_ids: &HashSet<TaskId>) -> (usize, usize) {
        let mut guard = self.state.lock().await;

        let current: HashSet<TaskId> = guard.order.iter().copied().collect();
        let mut to_add: Vec<TaskId> = unlabeled_ids
            .iter()
            .filter(|id| !current.contains(id) && !guard.completed.contains(id))
            .copied()
            .collect();
        to_add.sort_unstable();

        let to_remove: Vec<TaskId> = current
            .iter()
            .filter(|id| !unlabeled_ids.contains(id))
            .copied()
            .collect();

        for id in &to_remove {
            guard.order.retain(|t| t != id);
        }
        for id in &to_add {
            guard.order.push_back(*id);
        }

        (to_add.len(), to_remove.len())
    }

    /// Recomputes and publishes `CachedCounters` against the given lease
    /// store (a bulk probe of which queue members are currently leased).
    pub async fn refresh_counters(&self, leases: &dyn LeaseStore) -> Result<()> {
        let snapshot: Vec<TaskId> = self.state.lock().await.order.iter().copied().collect();
        let total_unlabeled = snapshot.len();
        let total_locked = leases.count_locked(&snapshot).await?;
        let available = total_unlabeled.saturating_sub(total_locked);

        let mut counters = self.counters.write().await;
        *counters = CachedCounters {
            total_unlabeled,
            total_locked,
            available,
            last_updated: Utc::now(),
        };
        Ok(())
    }

    pub async fn counters(&self) -> CachedCounters {
        *self.counters.read().await
    }
}

pub type SharedAssignmentQueue = Arc<AssignmentQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reconcile_adds_and_removes() {
        let queue = AssignmentQueue::new();
        let ids: HashSet<TaskId> = [1, 2, 3].into_iter().collect();
        let (added, removed) = queue.reconcile(&ids).await;
        assert_eq!(added, 3);
        assert_eq!(removed, 0);
        assert_eq!(queue.snapshot_size().await, 3);

        let ids2: HashSet<TaskId> = [2, 3, 4].into_iter().collect();
        let (added, removed) = queue.reconcile(&ids2).await;
        assert_eq!(added, 1);
        assert_eq!(removed, 1);
        assert_eq!(queue.snapshot_size().await, 3);
    }

    #[tokio::test]
    async fn reconcile_never_readds_completed_task() {
        let queue = AssignmentQueue::new();
        let ids: HashSet<TaskId> = [1, 2].into_iter().collect();
        queue.reconcile(&ids).await;
        queue.mark_completed(1).await;

        let (added, _) = queue.reconcile(&ids).await;
        assert_eq!(added, 0);
        assert_eq!(queue.snapshot_size().await, 1);
    }

    #[tokio::test]
    async fn pop_candidate_skipping_rotates_rejected_tasks() {
        let queue = AssignmentQueue::new();
        let ids: HashSet<TaskId> = [1, 2, 3].into_iter().collect();
        queue.reconcile(&ids).await;

        let winner = queue
            .pop_candidate_skipping(|t| async move { Ok(t == 2) })
            .await
            .unwrap();
        assert_eq!(winner, Some(2));
        assert_eq!(queue.snapshot_size().await, 2);
    }

    #[tokio::test]
    async fn pop_candidate_skipping_returns_none_when_nothing_matches() {
        let queue = AssignmentQueue::new();
        let ids: HashSet<TaskId> = [1, 2].into_iter().collect();
        queue.reconcile(&ids).await;

        let winner = queue
            .pop_candidate_skipping(|_| async move { Ok(false) })
            .await
            .unwrap();
        assert_eq!(winner, None);
        assert_eq!(queue.snapshot_size().await, 2);
    }

    #[tokio::test]
    async fn repeated_reconcile_with_identical_set_is_a_no_op() {
        let queue = AssignmentQueue::new();
        let ids: HashSet<TaskId> = [5, 6].into_iter().collect();
        queue.reconcile(&ids).await;
        let (added, removed) = queue.reconcile(&ids).await;
        assert_eq!((added, removed), (0, 0));
        assert_eq!(queue.snapshot_size().await, 2);
    }
}
