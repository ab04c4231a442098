use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier for a task in the upstream annotation store. Opaque to the
/// middleware beyond its use as a lookup key.
pub type TaskId = i64;

/// Identifier for a remote transcription agent, supplied by the caller.
pub type AgentId = i64;

/// Metadata about a task as reported by the upstream annotation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub file_name: String,
    pub duration_seconds: f64,
}

/// A live exclusive claim on a task, held in the lease store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Lease {
    pub agent_id: AgentId,
    pub acquired_at: DateTime<Utc>,
}

/// Outcome of `LeaseStore::acquire_lease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Contended,
}

/// Outcome of `LeaseStore::release_lease`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    NotOwner,
    Absent,
}

/// Lifecycle state of an audit session row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum SessionStatus {
    Assigned,
    Completed,
    Skipped,
}

/// Append-only audit record of one assignment attempt.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Session {
    pub id: uuid::Uuid,
    pub agent_id: AgentId,
    pub task_id: TaskId,
    pub assigned_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub transcription_length: Option<i32>,
    pub skip_reason: Option<String>,
}

/// Durable per-agent counters.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentStats {
    pub agent_id: AgentId,
    pub total_tasks_completed: i64,
    pub total_tasks_skipped: i64,
    pub total_duration_seconds: f64,
    pub total_earnings: f64,
    pub last_active: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AgentStats {
    /// Zero-valued row for an agent never seen by the stats store. `get_agent_stats`
    /// returns this instead of failing with not-found.
    pub fn zeroed(agent_id: AgentId, now: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            total_tasks_completed: 0,
            total_tasks_skipped: 0,
            total_duration_seconds: 0.0,
            total_earnings: 0.0,
            last_active: now,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Queue/lock snapshot, refreshed once per reconciliation tick.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CachedCounters {
    pub total_unlabeled: usize,
    pub total_locked: usize,
    pub available: usize,
    pub last_updated: DateTime<Utc>,
}

impl CachedCounters {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            total_unlabeled: 0,
            total_locked: 0,
            available: 0,
            last_updated: now,
        }
    }
}

/// Result of a successful `request_task` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub audio_url: String,
    pub duration: f64,
    pub file_name: String,
}
