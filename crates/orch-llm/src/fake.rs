//! Scriptable oracle for tests: returns queued responses in order, recording
//! every call it saw so assertions can check what was asked.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::oracle::{Oracle, OracleError, OracleResult};

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub system_prompt: String,
    pub user_prompt: Option<String>,
    pub model: String,
    pub structured: bool,
}

pub struct FakeOracle {
    text_responses: Mutex<Vec<String>>,
    structured_responses: Mutex<Vec<serde_json::Value>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeOracle {
    pub fn new() -> Self {
        Self {
            text_responses: Mutex::new(Vec::new()),
            structured_responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_text_responses(responses: Vec<String>) -> Self {
        Self {
            text_responses: Mutex::new(responses),
            structured_responses: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_structured_responses(responses: Vec<serde_json::Value>) -> Self {
        Self {
            text_responses: Mutex::new(Vec::new()),
            structured_responses: Mutex::new(responses),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn push_text(&self, response: impl Into<String>) {
        self.text_responses.lock().unwrap().push(response.into());
    }

    pub fn push_structured(&self, response: serde_json::Value) {
        self.structured_responses.lock().unwrap().push(response);
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }
}

impl Default for FakeOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        _temperature: f64,
    ) -> OracleResult<String> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.map(str::to_string),
            model: model.to_string(),
            structured: false,
        });
        let mut queue = self.text_responses.lock().unwrap();
        if queue.is_empty() {
            return Err(OracleError::RequestFailed(
                "fake oracle has no queued text response".to_string(),
            ));
        }
        Ok(queue.remove(0))
    }

    async fn query_structured(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        _temperature: f64,
        _schema_name: &str,
        _schema: &serde_json::Value,
    ) -> OracleResult<serde_json::Value> {
        self.calls.lock().unwrap().push(RecordedCall {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.map(str::to_string),
            model: model.to_string(),
            structured: true,
        });
        let mut queue = self.structured_responses.lock().unwrap();
        if queue.is_empty() {
            return Err(OracleError::RequestFailed(
                "fake oracle has no queued structured response".to_string(),
            ));
        }
        Ok(queue.remove(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_queued_responses_in_order() {
        let oracle = FakeOracle::with_text_responses(vec!["first".into(), "second".into()]);
        assert_eq!(oracle.query("sys", None, "m", 0.0).await.unwrap(), "first");
        assert_eq!(oracle.query("sys", None, "m", 0.0).await.unwrap(), "second");
        assert_eq!(oracle.calls().len(), 2);
    }

    #[tokio::test]
    async fn errors_when_queue_exhausted() {
        let oracle = FakeOracle::new();
        assert!(oracle.query("sys", None, "m", 0.0).await.is_err());
    }

    #[tokio::test]
    async fn structured_queries_return_parsed_json() {
        let oracle = FakeOracle::with_structured_responses(vec![serde_json::json!({"ok": true})]);
        let schema = serde_json::json!({"type": "object"});
        let result = oracle
            .query_structured("sys", Some("u"), "m", 0.2, "verdict", &schema)
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));
        assert!(oracle.calls()[0].structured);
    }
}
