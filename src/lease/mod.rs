//! Lease Store (C1): TTL'd single-writer locks and per-(task, agent) skip
//! cooldowns on Redis. Acquisition and owner-checked release are single
//! round-trip Lua scripts so the check-then-act is atomic on the server,
//! never a client-side read-then-write.

use crate::constants::{COOLDOWN_TTL_SECS, KV_TIMEOUT_MS, LEASE_TTL_SECS};
use crate::models::{AcquireOutcome, AgentId, Lease, ReleaseOutcome, TaskId};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tokio::time::timeout;

fn lease_key(task_id: TaskId) -> String {
    format!("task:locked:{task_id}")
}

fn cooldown_key(task_id: TaskId, agent_id: AgentId) -> String {
    format!("task:skip:{task_id}:{agent_id}")
}

/// Acquires a lease only if absent; returns 1 if granted, 0 if contended.
const ACQUIRE_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    return 0
end
redis.call("SET", KEYS[1], ARGV[1], "EX", ARGV[2])
return 1
"#;

/// Releases a lease only if owned by the given agent_id (the owner value is
/// "agent_id:unix_ts"; only the agent_id prefix is compared). Returns 1 if
/// released, 0 if owned by someone else, -1 if absent.
const RELEASE_SCRIPT: &str = r#"
local current = redis.call("GET", KEYS[1])
if current == false then
    return -1
end
local sep = string.find(current, ":")
local owner = sep and string.sub(current, 1, sep - 1) or current
if owner ~= ARGV[1] then
    return 0
end
redis.call("DEL", KEYS[1])
return 1
"#;

#[async_trait]
pub trait LeaseStore: Send + Sync {
    async fn acquire_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<AcquireOutcome>;
    async fn inspect_lease(&self, task_id: TaskId) -> Result<Option<Lease>>;
    async fn release_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<ReleaseOutcome>;
    async fn set_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<()>;
    async fn in_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<bool>;
    /// Returns how many of the given task_ids currently have a live lease.
    async fn count_locked(&self, task_ids: &[TaskId]) -> Result<usize>;
    async fn ping(&self) -> Result<()>;
}

pub struct RedisLeaseStore {
    conn: ConnectionManager,
    lease_ttl: u64,
    cooldown_ttl: u64,
    kv_timeout: Duration,
}

impl RedisLeaseStore {
    pub async fn connect(url: &str, kv_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| DispatchError::KvUnavailable(e.to_string()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| DispatchError::KvUnavailable(e.to_string()))?;
        Ok(Self {
            conn,
            lease_ttl: LEASE_TTL_SECS,
            cooldown_ttl: COOLDOWN_TTL_SECS,
            kv_timeout,
        })
    }

    pub fn with_ttls(mut self, lease_ttl: u64, cooldown_ttl: u64) -> Self {
        self.lease_ttl = lease_ttl;
        self.cooldown_ttl = cooldown_ttl;
        self
    }

    fn encode_owner(agent_id: AgentId, now: DateTime<Utc>) -> String {
        format!("{agent_id}:{}", now.timestamp())
    }

    fn decode_owner(raw: &str) -> Option<Lease> {
        let (agent_str, ts_str) = raw.split_once(':')?;
        let agent_id = agent_str.parse().ok()?;
        let ts = ts_str.parse::<i64>().ok()?;
        let acquired_at = Utc.timestamp_opt(ts, 0).single()?;
        Some(Lease {
            agent_id,
            acquired_at,
        })
    }
}

#[async_trait]
impl LeaseStore for RedisLeaseStore {
    async fn acquire_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<AcquireOutcome> {
        let mut conn = self.conn.clone();
        let now = Utc::now();
        let owner = Self::encode_owner(agent_id, now);
        let script = Script::new(ACQUIRE_SCRIPT);
        let granted: i32 = timeout(
            self.kv_timeout,
            script
                .key(lease_key(task_id))
                .arg(owner)
                .arg(self.lease_ttl)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("acquire_lease timed out".into()))??;
        Ok(if granted == 1 {
            AcquireOutcome::Granted
        } else {
            AcquireOutcome::Contended
        })
    }

    async fn inspect_lease(&self, task_id: TaskId) -> Result<Option<Lease>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = timeout(
            self.kv_timeout,
            redis::cmd("GET").arg(lease_key(task_id)).query_async(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("inspect_lease timed out".into()))??;
        Ok(raw.and_then(|r| Self::decode_owner(&r)))
    }

    async fn release_lease(&self, task_id: TaskId, agent_id: AgentId) -> Result<ReleaseOutcome> {
        let mut conn = self.conn.clone();
        let script = Script::new(RELEASE_SCRIPT);
        let result: i32 = timeout(
            self.kv_timeout,
            script
                .key(lease_key(task_id))
                .arg(agent_id)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("release_lease timed out".into()))??;
        Ok(match result {
            1 => ReleaseOutcome::Released,
            0 => ReleaseOutcome::NotOwner,
            _ => ReleaseOutcome::Absent,
        })
    }

    async fn set_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<()> {
        let mut conn = self.conn.clone();
        timeout(
            self.kv_timeout,
            redis::cmd("SET")
                .arg(cooldown_key(task_id, agent_id))
                .arg(1)
                .arg("EX")
                .arg(self.cooldown_ttl)
                .query_async::<_, ()>(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("set_cooldown timed out".into()))??;
        Ok(())
    }

    async fn in_cooldown(&self, task_id: TaskId, agent_id: AgentId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = timeout(
            self.kv_timeout,
            redis::cmd("EXISTS")
                .arg(cooldown_key(task_id, agent_id))
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("in_cooldown timed out".into()))??;
        Ok(exists)
    }

    async fn count_locked(&self, task_ids: &[TaskId]) -> Result<usize> {
        let mut count = 0;
        for &task_id in task_ids {
            if self.inspect_lease(task_id).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        timeout(
            self.kv_timeout,
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await
        .map_err(|_| DispatchError::KvUnavailable("ping timed out".into()))??;
        Ok(())
    }
}
