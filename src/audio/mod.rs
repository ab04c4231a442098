//! Audio Streamer (C6): authorization-checked, range-capable file streaming.
//!
//! Authorization is re-evaluated on every call against the live lease in
//! [`crate::lease::LeaseStore`] — never cached, so a lease that expires or
//! changes owner mid-session is reflected on the very next request. Path
//! derivation guards against traversal: `file_name` is normalized and
//! rejected outright if it would resolve outside `MediaRoot`.

use crate::constants::AUDIO_CHUNK_BYTES;
use crate::lease::LeaseStore;
use crate::models::{AgentId, TaskId};
use crate::upstream::UpstreamClient;
use crate::{DispatchError, Result};
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;

pub struct AudioStreamer {
    leases: Arc<dyn LeaseStore>,
    upstream: Arc<dyn UpstreamClient>,
    media_root: PathBuf,
}

impl AudioStreamer {
    pub fn new(
        leases: Arc<dyn LeaseStore>,
        upstream: Arc<dyn UpstreamClient>,
        media_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            leases,
            upstream,
            media_root: media_root.into(),
        }
    }

    pub async fn stream(
        &self,
        task_id: TaskId,
        agent_id: AgentId,
        headers: &HeaderMap,
    ) -> Result<Response> {
        let owner = self
            .leases
            .inspect_lease(task_id)
            .await?
            .filter(|l| l.agent_id == agent_id)
            .ok_or(DispatchError::Forbidden)?;
        let _ = owner;

        let meta = self
            .upstream
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::NotFound(format!("task {task_id}")))?;

        let path = resolve_under_root(&self.media_root, &meta.file_name)
            .ok_or(DispatchError::Forbidden)?;

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| DispatchError::NotFound("audio file".to_string()))?;
        let file_size = file
            .metadata()
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?
            .len();

        let mime = mime_for(&path);
        let range_header = headers.get(header::RANGE).and_then(|v| v.to_str().ok());

        match parse_range(range_header, file_size)? {
            None => full_body_response(file, file_size, mime).await,
            Some((start, end)) => {
                partial_body_response(file, start, end, file_size, mime).await
            }
        }
    }
}

/// Joins `file_name` to `root`, rejecting absolute paths and any `..`
/// component that would escape it. Does not require the file to exist.
fn resolve_under_root(root: &Path, file_name: &str) -> Option<PathBuf> {
    let candidate = Path::new(file_name);
    let mut normalized = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if normalized.as_os_str().is_empty() {
        return None;
    }
    Some(root.join(normalized))
}

fn mime_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "wav" => "audio/wav",
        Some(ext) if ext == "mp3" => "audio/mpeg",
        Some(ext) if ext == "ogg" => "audio/ogg",
        Some(ext) if ext == "flac" => "audio/flac",
        _ => "application/octet-stream",
    }
}

/// Parses a single-range `Range: bytes=a-b` header against `file_size`.
/// Returns `Ok(None)` for "no range requested", `Ok(Some((start, end)))`
/// inclusive for a satisfiable single range, or an error for an
/// unsatisfiable or multi-range request (multi-range is not supported).
fn parse_range(header: Option<&str>, file_size: u64) -> Result<Option<(u64, u64)>> {
    let Some(header) = header else {
        return Ok(None);
    };
    let Some(spec) = header.strip_prefix("bytes=") else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Err(DispatchError::RangeNotSatisfiable { file_size });
    }

    let (start_str, end_str) = spec
        .split_once('-')
        .ok_or(DispatchError::RangeNotSatisfiable { file_size })?;

    let start: u64 = if start_str.is_empty() {
        // "bytes=-N" (suffix range) is not produced by any client this
        // service needs to serve; treat as malformed.
        return Err(DispatchError::RangeNotSatisfiable { file_size });
    } else {
        start_str
            .parse()
            .map_err(|_| DispatchError::RangeNotSatisfiable { file_size })?
    };

    let end: u64 = if end_str.is_empty() {
        file_size.saturating_sub(1)
    } else {
        end_str
            .parse()
            .map_err(|_| DispatchError::RangeNotSatisfiable { file_size })?
    };

    if start >= file_size || start > end {
        return Err(DispatchError::RangeNotSatisfiable { file_size });
    }

    Ok(Some((start, end.min(file_size.saturating_sub(1)))))
}

async fn full_body_response(
    file: tokio::fs::File,
    file_size: u64,
    mime: &'static str,
) -> Result<Response> {
    let stream = ReaderStream::with_capacity(file, AUDIO_CHUNK_BYTES);
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&file_size.to_string()).unwrap(),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    Ok(response)
}

async fn partial_body_response(
    mut file: tokio::fs::File,
    start: u64,
    end: u64,
    file_size: u64,
    mime: &'static str,
) -> Result<Response> {
    file.seek(std::io::SeekFrom::Start(start))
        .await
        .map_err(|e| DispatchError::Internal(e.to_string()))?;
    let len = end - start + 1;
    let limited = file.take(len);
    let stream = ReaderStream::with_capacity(limited, AUDIO_CHUNK_BYTES);

    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::PARTIAL_CONTENT;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(mime));
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&len.to_string()).unwrap(),
    );
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    headers.insert(
        header::CONTENT_RANGE,
        HeaderValue::from_str(&format!("bytes {start}-{end}/{file_size}")).unwrap(),
    );
    Ok(response)
}
