//! System-wide default values. All are overridable via environment variables
//! in `Config::load` (see `config/mod.rs`); these are the fallbacks.

/// Maximum lifetime of a task lease before it is treated as expired.
pub const LEASE_TTL_SECS: u64 = 3600;

/// How long a task is hidden from an agent after that agent skips it.
pub const COOLDOWN_TTL_SECS: u64 = 1800;

/// Interval between background reconciliation ticks.
pub const SYNC_INTERVAL_SECS: u64 = 30;

/// Earnings per second of task audio duration.
pub const RATE_PER_SECOND: f64 = 0.05;

/// Default HTTP listen port.
pub const LISTEN_PORT: u16 = 8010;

/// Per-call deadline for the lease store.
pub const KV_TIMEOUT_MS: u64 = 1000;

/// Per-call deadline for the durable SQL store.
pub const SQL_TIMEOUT_MS: u64 = 2000;

/// Per-call deadline for the upstream annotation store.
pub const UPSTREAM_TIMEOUT_MS: u64 = 10_000;

/// Chunk size used when streaming audio files from disk.
pub const AUDIO_CHUNK_BYTES: usize = 64 * 1024;
