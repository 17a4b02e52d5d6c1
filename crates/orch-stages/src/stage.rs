//! The `Stage` trait: per-main-stage completion policy. Each main stage
//! (baseline, tuning, creative exploration, ablation) decides independently
//! when its current sub-stage is done and when the whole main stage is done;
//! the Agent Manager only drives the loop and performs the transitions.

use std::sync::Arc;

use orch_core::{Journal, Result, StageMeta};
use orch_llm::Oracle;

/// Shared evidence every stage's completion check is handed. Stages read
/// whatever subset of this they need; none of them mutate it.
pub struct CompletionCheck<'a> {
    pub meta: &'a StageMeta,
    pub journal: &'a Journal,
    pub oracle: &'a Arc<dyn Oracle>,
    pub feedback_model: &'a str,
    pub feedback_temp: f64,
}

#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn main_stage_slug(&self) -> &'static str;
    fn default_goals(&self) -> &'static str;

    /// Is the current sub-stage done, and why.
    async fn evaluate_substage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)>;

    /// Is the whole main stage done, and why.
    async fn evaluate_stage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)>;

    /// Record any stage-specific bookkeeping this result node implies
    /// (e.g. which hyperparameter or ablation name it exercised).
    fn update_state(&self, _result_node: &orch_core::Node) {}
}

/// Shared `{is_complete, reasoning, missing_criteria}` oracle call used by
/// every stage's completion evaluation, mirroring the identical
/// `FunctionSpec`/schema the original repeats in each `stages/stageN.py`.
pub(crate) async fn ask_is_complete(
    oracle: &Arc<dyn Oracle>,
    model: &str,
    temp: f64,
    prompt: &str,
) -> Result<(bool, String)> {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {
            "is_complete": {"type": "boolean"},
            "reasoning": {"type": "string"},
            "missing_criteria": {"type": "array", "items": {"type": "string"}}
        },
        "required": ["is_complete", "reasoning", "missing_criteria"]
    });
    let response = oracle
        .query_structured(prompt, None, model, temp, "evaluate_stage_completion", &schema)
        .await
        .map_err(|e| orch_core::Error::LlmParseFailure { attempts: 1, reason: e.to_string() })?;

    if response["is_complete"].as_bool().unwrap_or(false) {
        let reasoning = response["reasoning"].as_str().unwrap_or("sub-stage complete").to_string();
        return Ok((true, reasoning));
    }
    let missing: Vec<String> = response["missing_criteria"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default();
    if missing.is_empty() {
        Ok((false, "Sub-stage not complete".to_string()))
    } else {
        Ok((false, format!("Missing criteria: {}", missing.join(", "))))
    }
}
