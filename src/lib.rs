//! # Transcribe Dispatch
//!
//! Task-dispatch middleware that sits between an upstream annotation
//! platform (the authoritative store of audio transcription tasks and
//! annotations) and a fleet of remote transcription agents. It hands out
//! unlabeled audio tasks one at a time, streams the associated audio bytes
//! on demand, collects the resulting transcription, and pushes it upstream
//! as an annotation.
//!
//! ## Architecture
//!
//! - [`lease`] — TTL'd single-writer locks and skip cooldowns on Redis (C1)
//! - [`upstream`] — typed calls to the annotation store (C2)
//! - [`stats`] — durable per-agent counters and session audit records (C3)
//! - [`queue`] — the reconciled, in-process assignment queue (C4)
//! - [`dispatcher`] — request/submit/skip orchestration (C5)
//! - [`audio`] — authorization-gated byte-range audio streaming (C6)
//! - [`reconciler`] — periodic re-pull from upstream (C7)
//! - [`api`] — the HTTP surface binding all of the above together

/// Byte-range audio streaming, authorization-gated against the active lease
pub mod audio;
/// HTTP API server and request handlers
pub mod api;
/// `X-API-Key` authentication middleware
pub mod auth;
/// System configuration, loaded from the environment
pub mod config;
/// System-wide default values and tunables
pub mod constants;
/// Top-level request/submit/skip orchestration
pub mod dispatcher;
/// Unified error type and HTTP mapping
pub mod error;
/// TTL'd leases and skip cooldowns backed by Redis
pub mod lease;
/// Core data models shared across the dispatch core
pub mod models;
/// The in-process assignment queue, completed-set, and cached counters
pub mod queue;
/// Periodic reconciliation of the queue against the upstream store
pub mod reconciler;
/// Durable per-agent counters and session audit records
pub mod stats;
/// Typed client for the upstream annotation store
pub mod upstream;

pub use error::{DispatchError, Result};
