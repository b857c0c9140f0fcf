//! Best-effort clients for the streaming and document collaborators.
//!
//! Both speak to the GraphRAG service base URL. Every call is fire-and-
//! observe: errors are reported to the caller for logging and never retried
//! here, because losing an event or an archive copy must not affect task
//! state.

use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

use maestro_core::hooks::{DocumentStore, EventSink};
use maestro_core::models::Task;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct GraphRagClient {
    base_url: String,
    client: reqwest::Client,
}

impl GraphRagClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self { base_url, client })
    }

    fn emit_url(&self) -> String {
        format!("{}/websocket/emit", self.base_url)
    }

    fn documents_url(&self) -> String {
        format!("{}/documents", self.base_url)
    }
}

#[async_trait]
impl EventSink for GraphRagClient {
    async fn emit(&self, room: &str, event: &str, data: &serde_json::Value) -> Result<(), String> {
        let payload = serde_json::json!({
            "room": room,
            "event": event,
            "data": data,
        });

        let response = self
            .client
            .post(self.emit_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("emit request failed: {e}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("emit rejected with status {}", response.status()))
        }
    }
}

#[async_trait]
impl DocumentStore for GraphRagClient {
    async fn archive_task(&self, task: &Task) -> Result<(), String> {
        let payload = serde_json::json!({
            "id": task.id,
            "type": "task_result",
            "content": task,
        });

        let response = self
            .client
            .post(self.documents_url())
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("archive request failed: {e}"))?;

        if response.status().is_success() {
            tracing::debug!(task_id = %task.id, "Task archived to document store");
            Ok(())
        } else {
            Err(format!("archive rejected with status {}", response.status()))
        }
    }

    async fn fetch_task(&self, task_id: Uuid) -> Result<Option<Task>, String> {
        let url = format!("{}/{}", self.documents_url(), task_id);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| format!("document fetch failed: {e}"))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(format!(
                "document fetch rejected with status {}",
                response.status()
            ));
        }

        #[derive(serde::Deserialize)]
        struct Document {
            content: Task,
        }

        let document: Document = response
            .json()
            .await
            .map_err(|e| format!("document decode failed: {e}"))?;
        Ok(Some(document.content))
    }
}
