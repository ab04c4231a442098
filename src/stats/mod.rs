//! Stats Store (C3): durable per-agent counters and per-session audit
//! records. Defined behind a trait so the Postgres-backed implementation and
//! an in-memory test double share one contract; the Dispatcher is generic
//! over the trait, never over a concrete store.

use crate::models::{AgentId, AgentStats, Session, SessionStatus, TaskId};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

#[async_trait]
pub trait StatsStore: Send + Sync {
    async fn open_session(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        assigned_at: DateTime<Utc>,
    ) -> Result<Uuid>;

    async fn close_session_completed(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        transcription_length: i32,
    ) -> Result<()>;

    async fn close_session_skipped(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        skip_reason: &str,
    ) -> Result<()>;

    async fn bump_agent_on_complete(
        &self,
        agent_id: AgentId,
        duration_seconds: f64,
        earnings_delta: f64,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn bump_agent_on_skip(&self, agent_id: AgentId, now: DateTime<Utc>) -> Result<()>;

    async fn get_agent_stats(&self, agent_id: AgentId) -> Result<AgentStats>;

    async fn find_open_session(&self, agent_id: AgentId, task_id: TaskId) -> Result<Option<Uuid>>;

    async fn ping(&self) -> Result<()>;
}

pub struct PostgresStatsStore {
    pool: PgPool,
    sql_timeout: std::time::Duration,
}

impl PostgresStatsStore {
    pub async fn connect(url: &str, sql_timeout: std::time::Duration) -> Result<Self> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| DispatchError::DbUnavailable(e.to_string()))?;
        let store = Self { pool, sql_timeout };
        store.run_migration().await?;
        Ok(store)
    }

    /// Idempotent startup migration; no external migration tool for two tables.
    async fn run_migration(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS transcription_sessions (
                id UUID PRIMARY KEY,
                agent_id BIGINT NOT NULL,
                task_id BIGINT NOT NULL,
                assigned_at TIMESTAMPTZ NOT NULL,
                status TEXT NOT NULL,
                completed_at TIMESTAMPTZ,
                duration_seconds DOUBLE PRECISION,
                transcription_length INTEGER,
                skip_reason TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DispatchError::from)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS agent_stats (
                agent_id BIGINT PRIMARY KEY,
                total_tasks_completed BIGINT NOT NULL DEFAULT 0,
                total_tasks_skipped BIGINT NOT NULL DEFAULT 0,
                total_duration_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
                total_earnings DOUBLE PRECISION NOT NULL DEFAULT 0,
                last_active TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DispatchError::from)?;

        Ok(())
    }
}

#[async_trait]
impl StatsStore for PostgresStatsStore {
    async fn open_session(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        assigned_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        timeout(
            self.sql_timeout,
            sqlx::query(
                r#"
                INSERT INTO transcription_sessions (id, agent_id, task_id, assigned_at, status)
                VALUES ($1, $2, $3, $4, 'assigned')
                "#,
            )
            .bind(id)
            .bind(agent_id)
            .bind(task_id)
            .bind(assigned_at)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("open_session timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(id)
    }

    async fn close_session_completed(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        transcription_length: i32,
    ) -> Result<()> {
        timeout(
            self.sql_timeout,
            sqlx::query(
                r#"
                UPDATE transcription_sessions
                SET status = 'completed', completed_at = $2, duration_seconds = $3,
                    transcription_length = $4
                WHERE id = $1
                "#,
            )
            .bind(session_id)
            .bind(completed_at)
            .bind(duration_seconds)
            .bind(transcription_length)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("close_session_completed timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(())
    }

    async fn close_session_skipped(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        skip_reason: &str,
    ) -> Result<()> {
        timeout(
            self.sql_timeout,
            sqlx::query(
                r#"
                UPDATE transcription_sessions
                SET status = 'skipped', completed_at = $2, skip_reason = $3
                WHERE id = $1
                "#,
            )
            .bind(session_id)
            .bind(completed_at)
            .bind(skip_reason)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("close_session_skipped timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(())
    }

    async fn bump_agent_on_complete(
        &self,
        agent_id: AgentId,
        duration_seconds: f64,
        earnings_delta: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        timeout(
            self.sql_timeout,
            sqlx::query(
                r#"
                INSERT INTO agent_stats
                    (agent_id, total_tasks_completed, total_duration_seconds, total_earnings,
                     last_active, created_at, updated_at)
                VALUES ($1, 1, $2, $3, $4, $4, $4)
                ON CONFLICT (agent_id) DO UPDATE SET
                    total_tasks_completed = agent_stats.total_tasks_completed + 1,
                    total_duration_seconds = agent_stats.total_duration_seconds + $2,
                    total_earnings = agent_stats.total_earnings + $3,
                    last_active = $4,
                    updated_at = $4
                "#,
            )
            .bind(agent_id)
            .bind(duration_seconds)
            .bind(earnings_delta)
            .bind(now)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("bump_agent_on_complete timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(())
    }

    async fn bump_agent_on_skip(&self, agent_id: AgentId, now: DateTime<Utc>) -> Result<()> {
        timeout(
            self.sql_timeout,
            sqlx::query(
                r#"
                INSERT INTO agent_stats
                    (agent_id, total_tasks_skipped, last_active, created_at, updated_at)
                VALUES ($1, 1, $2, $2, $2)
                ON CONFLICT (agent_id) DO UPDATE SET
                    total_tasks_skipped = agent_stats.total_tasks_skipped + 1,
                    last_active = $2,
                    updated_at = $2
                "#,
            )
            .bind(agent_id)
            .bind(now)
            .execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("bump_agent_on_skip timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(())
    }

    async fn get_agent_stats(&self, agent_id: AgentId) -> Result<AgentStats> {
        let row = timeout(
            self.sql_timeout,
            sqlx::query_as::<_, AgentStats>(
                "SELECT * FROM agent_stats WHERE agent_id = $1",
            )
            .bind(agent_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("get_agent_stats timed out".into()))?
        .map_err(DispatchError::from)?;

        Ok(row.unwrap_or_else(|| AgentStats::zeroed(agent_id, Utc::now())))
    }

    async fn find_open_session(&self, agent_id: AgentId, task_id: TaskId) -> Result<Option<Uuid>> {
        let row: Option<(Uuid,)> = timeout(
            self.sql_timeout,
            sqlx::query_as(
                r#"
                SELECT id FROM transcription_sessions
                WHERE agent_id = $1 AND task_id = $2 AND status = 'assigned'
                ORDER BY assigned_at DESC
                LIMIT 1
                "#,
            )
            .bind(agent_id)
            .bind(task_id)
            .fetch_optional(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("find_open_session timed out".into()))?
        .map_err(DispatchError::from)?;

        Ok(row.map(|(id,)| id))
    }

    async fn ping(&self) -> Result<()> {
        timeout(
            self.sql_timeout,
            sqlx::query("SELECT 1").execute(&self.pool),
        )
        .await
        .map_err(|_| DispatchError::DbUnavailable("ping timed out".into()))?
        .map_err(DispatchError::from)?;
        Ok(())
    }
}

/// In-memory test double sharing `StatsStore`'s contract, used in unit and
/// contention tests so they don't require a live Postgres instance.
#[derive(Default)]
pub struct InMemoryStatsStore {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
    stats: Arc<RwLock<HashMap<AgentId, AgentStats>>>,
}

impl InMemoryStatsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatsStore for InMemoryStatsStore {
    async fn open_session(
        &self,
        agent_id: AgentId,
        task_id: TaskId,
        assigned_at: DateTime<Utc>,
    ) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let session = Session {
            id,
            agent_id,
            task_id,
            assigned_at,
            status: SessionStatus::Assigned,
            completed_at: None,
            duration_seconds: None,
            transcription_length: None,
            skip_reason: None,
        };
        self.sessions.write().await.insert(id, session);
        Ok(id)
    }

    async fn close_session_completed(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        duration_seconds: f64,
        transcription_length: i32,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
        session.status = SessionStatus::Completed;
        session.completed_at = Some(completed_at);
        session.duration_seconds = Some(duration_seconds);
        session.transcription_length = Some(transcription_length);
        Ok(())
    }

    async fn close_session_skipped(
        &self,
        session_id: Uuid,
        completed_at: DateTime<Utc>,
        skip_reason: &str,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(&session_id)
            .ok_or_else(|| DispatchError::NotFound(format!("session {session_id}")))?;
        session.status = SessionStatus::Skipped;
        session.completed_at = Some(completed_at);
        session.skip_reason = Some(skip_reason.to_string());
        Ok(())
    }

    async fn bump_agent_on_complete(
        &self,
        agent_id: AgentId,
        duration_seconds: f64,
        earnings_delta: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut stats = self.stats.write().await;
        let entry = stats
            .entry(agent_id)
            .or_insert_with(|| AgentStats::zeroed(agent_id, now));
        entry.total_tasks_completed += 1;
        entry.total_duration_seconds += duration_seconds;
        entry.total_earnings += earnings_delta;
        entry.last_active = now;
        entry.updated_at = now;
        Ok(())
    }

    async fn bump_agent_on_skip(&self, agent_id: AgentId, now: DateTime<Utc>) -> Result<()> {
        let mut stats = self.stats.write().await;
        let entry = stats
            .entry(agent_id)
            .or_insert_with(|| AgentStats::zeroed(agent_id, now));
        entry.total_tasks_skipped += 1;
        entry.last_active = now;
        entry.updated_at = now;
        Ok(())
    }

    async fn get_agent_stats(&self, agent_id: AgentId) -> Result<AgentStats> {
        let stats = self.stats.read().await;
        Ok(stats
            .get(&agent_id)
            .cloned()
            .unwrap_or_else(|| AgentStats::zeroed(agent_id, Utc::now())))
    }

    async fn find_open_session(&self, agent_id: AgentId, task_id: TaskId) -> Result<Option<Uuid>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .values()
            .filter(|s| {
                s.agent_id == agent_id && s.task_id == task_id && s.status == SessionStatus::Assigned
            })
            .max_by_key(|s| s.assigned_at)
            .map(|s| s.id))
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zeroed_stats_for_unseen_agent() {
        let store = InMemoryStatsStore::new();
        let stats = store.get_agent_stats(99).await.unwrap();
        assert_eq!(stats.total_tasks_completed, 0);
        assert_eq!(stats.total_tasks_skipped, 0);
    }

    #[tokio::test]
    async fn complete_then_skip_accumulates_independently() {
        let store = InMemoryStatsStore::new();
        let now = Utc::now();
        store
            .bump_agent_on_complete(1, 10.0, 0.5, now)
            .await
            .unwrap();
        store.bump_agent_on_skip(1, now).await.unwrap();

        let stats = store.get_agent_stats(1).await.unwrap();
        assert_eq!(stats.total_tasks_completed, 1);
        assert_eq!(stats.total_tasks_skipped, 1);
        assert_eq!(stats.total_duration_seconds, 10.0);
        assert_eq!(stats.total_earnings, 0.5);
    }

    #[tokio::test]
    async fn open_session_is_found_until_closed() {
        let store = InMemoryStatsStore::new();
        let now = Utc::now();
        let session_id = store.open_session(1, 42, now).await.unwrap();
        assert_eq!(store.find_open_session(1, 42).await.unwrap(), Some(session_id));

        store
            .close_session_completed(session_id, now, 5.0, 20)
            .await
            .unwrap();
        assert_eq!(store.find_open_session(1, 42).await.unwrap(), None);
    }
}
