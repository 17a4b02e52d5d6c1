//! HTTP publisher forwarding telemetry events to the server: one endpoint
//! per event kind, plus run-started/run-finished/heartbeat. `run_log`
//! events are never forwarded (DB only).

use serde_json::{json, Value};

use crate::events::Event;

pub struct WebhookClient {
    client: reqwest::Client,
    base_url: String,
    token: String,
    run_id: String,
}

impl WebhookClient {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            run_id: run_id.into(),
        }
    }

    async fn post(&self, path: &str, payload: Value) {
        let url = format!("{}{path}", self.base_url);
        let result = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(5))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                tracing::warn!(url, status = %resp.status(), "telemetry webhook returned non-success status");
            }
            Err(e) => tracing::warn!(url, error = %e, "failed to publish telemetry webhook"),
            Ok(_) => {}
        }
    }

    fn event_path(kind: &str) -> Option<&'static str> {
        match kind {
            "run_stage_progress" => Some("/stage-progress"),
            "experiment_node_completed" => Some("/experiment-node-completed"),
            _ => None,
        }
    }

    pub async fn publish(&self, event: &Event) {
        if matches!(event, Event::RunLog(_)) {
            return;
        }
        let Some(path) = Self::event_path(event.kind()) else {
            tracing::debug!(kind = event.kind(), "no webhook endpoint configured for this event kind");
            return;
        };
        let payload = json!({ "run_id": self.run_id, "event": event });
        self.post(path, payload).await;
    }

    pub async fn publish_run_started(&self) {
        self.post("/run-started", json!({ "run_id": self.run_id })).await;
    }

    pub async fn publish_run_finished(&self, success: bool, message: Option<&str>) {
        let mut payload = json!({ "run_id": self.run_id, "success": success });
        if let Some(message) = message {
            payload["message"] = json!(message);
        }
        self.post("/run-finished", payload).await;
    }

    pub async fn publish_heartbeat(&self) {
        self.post("/heartbeat", json!({ "run_id": self.run_id })).await;
    }
}
