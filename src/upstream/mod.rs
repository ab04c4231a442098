//! Upstream Client (C2): typed calls to the annotation store that owns task
//! metadata and annotations. The middleware never writes to the store's
//! underlying database directly, only through this HTTP surface.

use crate::models::{TaskId, TaskMeta};
use crate::{DispatchError, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::timeout;

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn list_unlabeled_task_ids(&self) -> Result<Vec<TaskId>>;
    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskMeta>>;
    async fn create_annotation(
        &self,
        task_id: TaskId,
        text: &str,
        agent_id: crate::models::AgentId,
    ) -> Result<i64>;
    async fn ping(&self) -> Result<()>;
}

pub struct HttpUpstreamClient {
    client: Client,
    base_url: String,
    api_key: String,
    project_id: i64,
    timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(base_url: String, api_key: String, project_id: i64, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
            project_id,
            timeout,
        }
    }

    fn auth_header(&self) -> String {
        format!("Token {}", self.api_key)
    }
}

#[derive(Debug, Deserialize)]
struct TaskListPage {
    results: Vec<TaskEnvelope>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskEnvelope {
    id: TaskId,
}

#[derive(Debug, Deserialize)]
struct TaskDetail {
    data: TaskData,
}

#[derive(Debug, Deserialize)]
struct TaskData {
    file_name: String,
    duration_seconds: f64,
}

#[derive(Debug, Deserialize)]
struct AnnotationResponse {
    id: i64,
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn list_unlabeled_task_ids(&self) -> Result<Vec<TaskId>> {
        let mut ids = Vec::new();
        let mut url = Some(format!(
            "{}/api/projects/{}/tasks?filter=unlabeled",
            self.base_url, self.project_id
        ));

        while let Some(next_url) = url {
            let resp = timeout(
                self.timeout,
                self.client
                    .get(&next_url)
                    .header("Authorization", self.auth_header())
                    .send(),
            )
            .await
            .map_err(|_| DispatchError::UpstreamUnavailable("list tasks timed out".into()))??;

            if !resp.status().is_success() {
                return Err(classify_status(resp.status(), "list_unlabeled_task_ids"));
            }

            let page: TaskListPage = resp.json().await?;
            ids.extend(page.results.into_iter().map(|t| t.id));
            url = page.next;
        }

        Ok(ids)
    }

    async fn get_task(&self, task_id: TaskId) -> Result<Option<TaskMeta>> {
        let resp = timeout(
            self.timeout,
            self.client
                .get(format!("{}/api/tasks/{}", self.base_url, task_id))
                .header("Authorization", self.auth_header())
                .send(),
        )
        .await
        .map_err(|_| DispatchError::UpstreamUnavailable("get_task timed out".into()))??;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "get_task"));
        }

        let detail: TaskDetail = resp.json().await?;
        Ok(Some(TaskMeta {
            file_name: detail.data.file_name,
            duration_seconds: detail.data.duration_seconds,
        }))
    }

    async fn create_annotation(
        &self,
        task_id: TaskId,
        text: &str,
        agent_id: crate::models::AgentId,
    ) -> Result<i64> {
        let body = serde_json::json!({
            "result": [{ "value": { "text": [text] } }],
            "completed_by": agent_id,
        });

        let resp = timeout(
            self.timeout,
            self.client
                .post(format!(
                    "{}/api/tasks/{}/annotations",
                    self.base_url, task_id
                ))
                .header("Authorization", self.auth_header())
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| DispatchError::UpstreamUnavailable("create_annotation timed out".into()))??;

        if !resp.status().is_success() {
            return Err(classify_status(resp.status(), "create_annotation"));
        }

        let created: AnnotationResponse = resp.json().await?;
        Ok(created.id)
    }

    async fn ping(&self) -> Result<()> {
        let resp = timeout(
            self.timeout,
            self.client
                .get(format!("{}/api/projects/{}", self.base_url, self.project_id))
                .header("Authorization", self.auth_header())
                .send(),
        )
        .await
        .map_err(|_| DispatchError::UpstreamUnavailable("ping timed out".into()))??;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(classify_status(resp.status(), "ping"))
        }
    }
}

/// 4xx (other than timeouts) are permanent; 5xx and network failures are
/// transient. The Dispatcher relies on this distinction to decide whether to
/// retry or release the lease and give up on a task.
fn classify_status(status: StatusCode, op: &str) -> DispatchError {
    if status.is_client_error() {
        DispatchError::NotFound(format!("upstream rejected {op}: {status}"))
    } else {
        DispatchError::UpstreamUnavailable(format!("{op} failed: {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_classify_as_permanent() {
        let err = classify_status(StatusCode::NOT_FOUND, "get_task");
        assert!(matches!(err, DispatchError::NotFound(_)));
    }

    #[test]
    fn server_errors_classify_as_transient() {
        let err = classify_status(StatusCode::BAD_GATEWAY, "get_task");
        assert!(matches!(err, DispatchError::UpstreamUnavailable(_)));
    }
}
