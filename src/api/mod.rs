//! HTTP API surface. Binds the Dispatcher (C5) and Audio Streamer (C6) to
//! axum routes; all `DispatchError` → HTTP status mapping happens once, via
//! `DispatchError`'s `IntoResponse` impl, never inline in a handler.

use crate::audio::AudioStreamer;
use crate::auth::{auth_middleware, create_auth_state};
use crate::config::{ApiConfig, Config};
use crate::dispatcher::Dispatcher;
use crate::models::{AgentId, AgentStats, TaskId};
use crate::stats::StatsStore;
use crate::upstream::UpstreamClient;
use crate::{DispatchError, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Method},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::{
    cors::{AllowHeaders, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;

const ROUTE_HEALTH: &str = "/api/health";
const ROUTE_REQUEST_TASK: &str = "/api/tasks/request";
const ROUTE_STREAM_AUDIO: &str = "/api/audio/stream/{task_id}/{agent_id}";
const ROUTE_SUBMIT: &str = "/api/tasks/{task_id}/submit";
const ROUTE_SKIP: &str = "/api/tasks/{task_id}/skip";
const ROUTE_AVAILABLE_COUNT: &str = "/api/tasks/available/count";
const ROUTE_AGENT_STATS: &str = "/api/agents/{agent_id}/stats";
const ROUTE_STATS: &str = "/api/stats";

pub struct ApiServer<S: StatsStore> {
    api_config: ApiConfig,
    project_id: i64,
    dispatcher: Arc<Dispatcher<S>>,
    streamer: Arc<AudioStreamer>,
}

impl<S: StatsStore> Clone for ApiServer<S> {
    fn clone(&self) -> Self {
        Self {
            api_config: self.api_config.clone(),
            project_id: self.project_id,
            dispatcher: self.dispatcher.clone(),
            streamer: self.streamer.clone(),
        }
    }
}

impl<S: StatsStore + 'static> ApiServer<S> {
    pub fn new(
        config: &Config,
        dispatcher: Arc<Dispatcher<S>>,
        upstream: Arc<dyn UpstreamClient>,
        leases: Arc<dyn crate::lease::LeaseStore>,
    ) -> Self {
        let streamer = Arc::new(AudioStreamer::new(leases, upstream, config.media_root.clone()));
        Self {
            api_config: config.api.clone(),
            project_id: config.upstream.project_id,
            dispatcher,
            streamer,
        }
    }

    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.api_config.host, self.api_config.port);
        let router = self.build_router();
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        info!(addr, "API server listening");
        axum::serve(listener, router)
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?;
        Ok(())
    }

    pub fn build_router(self) -> Router {
        let auth_state = create_auth_state(&self.api_config);
        let cors = build_cors(&self.api_config.allowed_origins);

        Router::new()
            .route(ROUTE_HEALTH, get(health::<S>))
            .route(ROUTE_REQUEST_TASK, post(request_task::<S>))
            .route(ROUTE_STREAM_AUDIO, get(stream_audio::<S>))
            .route(ROUTE_SUBMIT, post(submit::<S>))
            .route(ROUTE_SKIP, post(skip::<S>))
            .route(ROUTE_AVAILABLE_COUNT, get(available_count::<S>))
            .route(ROUTE_AGENT_STATS, get(agent_stats::<S>))
            .route(ROUTE_STATS, get(system_stats::<S>))
            .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self)
    }
}

/// Builds the CORS layer from `config.api.allowed_origins`. Spec §6 asks for
/// "all origins, all methods, all headers, credentials allowed", but
/// `tower-http` refuses to pair `Any` with `allow_credentials(true)` (a
/// wildcard origin cannot legally carry credentials per the CORS spec) — so
/// an `ALLOWED_ORIGINS` of `*` mirrors the request's `Origin` header back
/// instead, the practical equivalent of "any origin" that is actually
/// compatible with credentialed requests. An explicit origin list is used
/// verbatim when configured. Methods and headers are similarly made
/// credential-safe: methods as an explicit list covering every verb this
/// API uses, headers mirrored from the request the same way origin is.
fn build_cors(allowed_origins: &[String]) -> CorsLayer {
    let allow_origin = if allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|o| HeaderValue::from_str(o).ok())
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
}

#[derive(Debug, Deserialize)]
struct RequestTaskBody {
    agent_id: AgentId,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum RequestTaskResponse {
    Assigned {
        task_id: TaskId,
        audio_url: String,
        duration: f64,
        file_name: String,
    },
    None {
        task_id: Option<TaskId>,
        message: &'static str,
    },
}

async fn request_task<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Json(body): Json<RequestTaskBody>,
) -> Result<Json<RequestTaskResponse>> {
    match api.dispatcher.request_task(body.agent_id).await? {
        Some(assignment) => Ok(Json(RequestTaskResponse::Assigned {
            task_id: assignment.task_id,
            audio_url: assignment.audio_url,
            duration: assignment.duration,
            file_name: assignment.file_name,
        })),
        None => Ok(Json(RequestTaskResponse::None {
            task_id: None,
            message: "No tasks available",
        })),
    }
}

async fn stream_audio<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Path((task_id, agent_id)): Path<(TaskId, AgentId)>,
    headers: HeaderMap,
) -> Result<Response> {
    api.streamer.stream(task_id, agent_id, &headers).await
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    agent_id: AgentId,
    transcription: String,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    status: &'static str,
    annotation_id: i64,
}

async fn submit<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Path(task_id): Path<TaskId>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SubmitResponse>> {
    let annotation_id = api
        .dispatcher
        .submit_transcription(task_id, body.agent_id, &body.transcription)
        .await?;
    Ok(Json(SubmitResponse {
        status: "success",
        annotation_id,
    }))
}

#[derive(Debug, Deserialize)]
struct SkipBody {
    agent_id: AgentId,
    reason: String,
}

#[derive(Debug, Serialize)]
struct SkipResponse {
    status: &'static str,
    message: &'static str,
}

async fn skip<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Path(task_id): Path<TaskId>,
    Json(body): Json<SkipBody>,
) -> Result<Json<SkipResponse>> {
    api.dispatcher
        .skip_task(task_id, body.agent_id, &body.reason)
        .await?;
    Ok(Json(SkipResponse {
        status: "success",
        message: "Task skipped and released",
    }))
}

#[derive(Debug, Deserialize)]
struct AvailableCountParams {
    agent_id: Option<AgentId>,
}

#[derive(Debug, Serialize)]
struct AvailableCountResponse {
    available: usize,
    total_unlabeled: usize,
    total_locked: usize,
}

async fn available_count<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Query(params): Query<AvailableCountParams>,
) -> Result<Json<AvailableCountResponse>> {
    let counters = api.dispatcher.counters().await;
    let available = match params.agent_id {
        Some(agent_id) => api.dispatcher.available_for_agent(agent_id).await?,
        None => counters.available,
    };
    Ok(Json(AvailableCountResponse {
        available,
        total_unlabeled: counters.total_unlabeled,
        total_locked: counters.total_locked,
    }))
}

async fn agent_stats<S: StatsStore + 'static>(
    State(api): State<ApiServer<S>>,
    Path(agent_id): Path<AgentId>,
) -> Result<Json<AgentStats>> {
    Ok(Json(api.dispatcher.stats_for(agent_id).await?))
}

#[derive(Debug, Serialize)]
struct SystemStatsResponse {
    total_unlabeled: usize,
    total_locked: usize,
    available: usize,
    last_updated: chrono::DateTime<chrono::Utc>,
}

async fn system_stats<S: StatsStore + 'static>(State(api): State<ApiServer<S>>) -> Json<SystemStatsResponse> {
    let counters = api.dispatcher.counters().await;
    Json(SystemStatsResponse {
        total_unlabeled: counters.total_unlabeled,
        total_locked: counters.total_locked,
        available: counters.available,
        last_updated: counters.last_updated,
    })
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    label_studio: &'static str,
    redis: &'static str,
    postgres: &'static str,
    project_id: i64,
}

async fn health<S: StatsStore + 'static>(State(api): State<ApiServer<S>>) -> Response {
    let health = api.dispatcher.health().await;
    let status = if health.upstream_ok && health.kv_ok && health.db_ok {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::INTERNAL_SERVER_ERROR
    };
    let body = HealthResponse {
        status: if status == axum::http::StatusCode::OK {
            "ok"
        } else {
            "error"
        },
        label_studio: if health.upstream_ok { "ok" } else { "error" },
        redis: if health.kv_ok { "ok" } else { "error" },
        postgres: if health.db_ok { "ok" } else { "error" },
        project_id: api.project_id,
    };
    (status, Json(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseStore;
    use crate::models::{AcquireOutcome, Lease, ReleaseOutcome, TaskMeta};
    use crate::queue::AssignmentQueue;
    use crate::stats::InMemoryStatsStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    struct AlwaysUp;

    #[async_trait]
    impl LeaseStore for AlwaysUp {
        async fn acquire_lease(&self, _: TaskId, _: AgentId) -> Result<AcquireOutcome> {
            Ok(AcquireOutcome::Granted)
        }
        async fn inspect_lease(&self, _: TaskId) -> Result<Option<Lease>> {
            Ok(None)
        }
        async fn release_lease(&self, _: TaskId, _: AgentId) -> Result<ReleaseOutcome> {
            Ok(ReleaseOutcome::Absent)
        }
        async fn set_cooldown(&self, _: TaskId, _: AgentId) -> Result<()> {
            Ok(())
        }
        async fn in_cooldown(&self, _: TaskId, _: AgentId) -> Result<bool> {
            Ok(false)
        }
        async fn count_locked(&self, _: &[TaskId]) -> Result<usize> {
            Ok(0)
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl UpstreamClient for AlwaysUp {
        async fn list_unlabeled_task_ids(&self) -> Result<Vec<TaskId>> {
            Ok(vec![])
        }
        async fn get_task(&self, _: TaskId) -> Result<Option<TaskMeta>> {
            Ok(None)
        }
        async fn create_annotation(&self, _: TaskId, _: &str, _: AgentId) -> Result<i64> {
            Ok(1)
        }
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Config {
        Config {
            upstream: crate::config::UpstreamConfig {
                base_url: "http://localhost:8080".to_string(),
                api_key: "upstream-key".to_string(),
                project_id: 7,
                timeout: std::time::Duration::from_secs(1),
            },
            backends: crate::config::BackendsConfig {
                kv_url: "redis://localhost".to_string(),
                sql_url: "postgres://localhost".to_string(),
                kv_timeout: std::time::Duration::from_secs(1),
                sql_timeout: std::time::Duration::from_secs(1),
                lease_ttl_secs: 3600,
                cooldown_ttl_secs: 1800,
                sync_interval_secs: 30,
                rate_per_second: 0.05,
            },
            api: ApiConfig {
                host: "0.0.0.0".to_string(),
                port: 8010,
                api_key: "a-very-secret-test-api-key-padded-to-length".to_string(),
                allowed_origins: vec!["*".to_string()],
            },
            media_root: "./media".to_string(),
        }
    }

    fn router_for(config: Config) -> Router {
        let backend: Arc<AlwaysUp> = Arc::new(AlwaysUp);
        let leases: Arc<dyn crate::lease::LeaseStore> = backend.clone();
        let upstream: Arc<dyn UpstreamClient> = backend.clone();
        let stats = Arc::new(InMemoryStatsStore::new());
        let queue = Arc::new(AssignmentQueue::new());
        let dispatcher = Arc::new(Dispatcher::new(
            leases.clone(),
            upstream.clone(),
            stats,
            queue,
            "http://localhost:8010".to_string(),
        ));
        ApiServer::new(&config, dispatcher, upstream, leases).build_router()
    }

    fn test_router() -> Router {
        router_for(test_config())
    }

    #[tokio::test]
    async fn health_requires_api_key() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri(ROUTE_HEALTH)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_with_api_key_reports_backend_status() {
        let config = test_config();
        let response = test_router()
            .oneshot(
                Request::builder()
                    .uri(ROUTE_HEALTH)
                    .header("x-api-key", config.api.api_key)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn request_task_without_api_key_is_rejected() {
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(ROUTE_REQUEST_TASK)
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"agent_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn request_task_with_api_key_returns_no_tasks_available() {
        let config = test_config();
        let response = test_router()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(ROUTE_REQUEST_TASK)
                    .header("content-type", "application/json")
                    .header("x-api-key", config.api.api_key)
                    .body(Body::from(r#"{"agent_id": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cors_mirrors_origin_and_allows_credentials_when_wildcard_configured() {
        let config = test_config();
        let api_key = config.api.api_key.clone();
        let response = router_for(config)
            .oneshot(
                Request::builder()
                    .uri(ROUTE_HEALTH)
                    .header("x-api-key", api_key)
                    .header("origin", "https://example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-origin")
                .unwrap(),
            "https://example.com"
        );
        assert_eq!(
            response
                .headers()
                .get("access-control-allow-credentials")
                .unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn cors_rejects_origin_outside_the_configured_allow_list() {
        let mut config = test_config();
        config.api.allowed_origins = vec!["https://allowed.example".to_string()];
        let api_key = config.api.api_key.clone();
        let response = router_for(config)
            .oneshot(
                Request::builder()
                    .uri(ROUTE_HEALTH)
                    .header("x-api-key", api_key)
                    .header("origin", "https://not-allowed.example")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response
            .headers()
            .get("access-control-allow-origin")
            .is_none());
    }
}
