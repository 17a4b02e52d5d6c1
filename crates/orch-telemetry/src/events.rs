//! The three structured event kinds emitted during a run: stage progress,
//! free-form log lines, and per-node completion summaries.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunStageProgressEvent {
    pub stage: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub progress: f64,
    pub total_nodes: u32,
    pub buggy_nodes: u32,
    pub good_nodes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub best_metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_s: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_iteration_time_s: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunLogEvent {
    pub message: String,
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExperimentNodeCompletedEvent {
    pub stage: String,
    pub node_id: Option<String>,
    pub summary: Value,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    RunStageProgress(RunStageProgressEvent),
    RunLog(RunLogEvent),
    ExperimentNodeCompleted(ExperimentNodeCompletedEvent),
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RunStageProgress(_) => "run_stage_progress",
            Event::RunLog(_) => "run_log",
            Event::ExperimentNodeCompleted(_) => "experiment_node_completed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        let e = Event::RunLog(RunLogEvent {
            message: "hello".to_string(),
            level: "info".to_string(),
        });
        assert_eq!(e.kind(), "run_log");
    }
}
