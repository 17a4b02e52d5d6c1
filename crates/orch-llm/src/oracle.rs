//! The LLM oracle: a pure request/response collaborator used throughout the
//! orchestrator for plan+code generation, structured review, and the
//! various completion/selection judgments. Implementations pick their own
//! wire format; callers only see `query` (free text) and `query_structured`
//! (schema-constrained JSON).

use async_trait::async_trait;

pub type OracleResult<T> = Result<T, OracleError>;

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("response did not match the requested schema: {0}")]
    SchemaMismatch(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[async_trait]
pub trait Oracle: Send + Sync {
    /// Free-form completion: used for plan+code prompts and anything else
    /// where the caller parses the response itself.
    async fn query(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        temperature: f64,
    ) -> OracleResult<String>;

    /// Schema-constrained completion: the provider is asked to produce a
    /// single JSON object matching `schema`, returned already parsed.
    async fn query_structured(
        &self,
        system_prompt: &str,
        user_prompt: Option<&str>,
        model: &str,
        temperature: f64,
        schema_name: &str,
        schema: &serde_json::Value,
    ) -> OracleResult<serde_json::Value>;
}
