//! System configuration, assembled once at startup by [`Config::load`].
//!
//! Required secrets (`UPSTREAM_API_KEY`, `API_KEY`, `SQL_URL`, `KV_URL`) fail
//! fast here, before the server binds a port, rather than surfacing as a 5xx
//! on the first request that happens to touch the missing backend. Numeric
//! overrides fall back to their documented default on a parse failure
//! instead of panicking — only the secrets are load-bearing enough to
//! refuse to start.


use crate::constants::{
    COOLDOWN_TTL_SECS, KV_TIMEOUT_MS, LEASE_TTL_SECS, LISTEN_PORT, RATE_PER_SECOND,
    SQL_TIMEOUT_MS, SYNC_INTERVAL_SECS, UPSTREAM_TIMEOUT_MS,
};
use crate::{DispatchError, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub backends: BackendsConfig,
    pub api: ApiConfig,
    pub media_root: String,
}

/// Access to the upstream annotation store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub project_id: i64,
    #[serde(skip)]
    pub timeout: Duration,
}

/// Lease/queue KV service and durable SQL store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendsConfig {
    pub kv_url: String,
    pub sql_url: String,
    #[serde(skip)]
    pub kv_timeout: Duration,
    #[serde(skip)]
    pub sql_timeout: Duration,
    pub lease_ttl_secs: u64,
    pub cooldown_ttl_secs: u64,
    pub sync_interval_secs: u64,
    pub rate_per_second: f64,
}

/// HTTP surface: listen address, the shared API key, and CORS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub allowed_origins: Vec<String>,
}

fn require_env(name: &str) -> Result<String> {
    let value = env::var(name)
        .map_err(|_| DispatchError::Internal(format!("{name} environment variable is required")))?;
    if value.trim().is_empty() {
        return Err(DispatchError::Internal(format!("{name} cannot be empty")));
    }
    Ok(value)
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let upstream_api_key = require_env("UPSTREAM_API_KEY")?;
        let api_key = require_env("API_KEY")?;
        if api_key.len() < 32 {
            return Err(DispatchError::Internal(
                "API_KEY must be at least 32 characters".to_string(),
            ));
        }
        let sql_url = require_env("SQL_URL")?;
        let kv_url = require_env("KV_URL")?;

        let upstream = UpstreamConfig {
            base_url: env::var("UPSTREAM_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            api_key: upstream_api_key,
            project_id: parse_env_or("PROJECT_ID", 1),
            timeout: Duration::from_millis(parse_env_or("UPSTREAM_TIMEOUT_MS", UPSTREAM_TIMEOUT_MS)),
        };

        let backends = BackendsConfig {
            kv_url,
            sql_url,
            kv_timeout: Duration::from_millis(parse_env_or("KV_TIMEOUT_MS", KV_TIMEOUT_MS)),
            sql_timeout: Duration::from_millis(parse_env_or("SQL_TIMEOUT_MS", SQL_TIMEOUT_MS)),
            lease_ttl_secs: parse_env_or("LEASE_TTL_SECS", LEASE_TTL_SECS),
            cooldown_ttl_secs: parse_env_or("COOLDOWN_TTL_SECS", COOLDOWN_TTL_SECS),
            sync_interval_secs: parse_env_or("SYNC_INTERVAL_SECS", SYNC_INTERVAL_SECS),
            rate_per_second: parse_env_or("RATE_PER_SECOND", RATE_PER_SECOND),
        };

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let api = ApiConfig {
            host: env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env_or("LISTEN_PORT", LISTEN_PORT),
            api_key,
            allowed_origins,
        };

        let media_root = env::var("MEDIA_ROOT").unwrap_or_else(|_| "./media".to_string());

        Ok(Config {
            upstream,
            backends,
            api,
            media_root,
        })
    }
}
