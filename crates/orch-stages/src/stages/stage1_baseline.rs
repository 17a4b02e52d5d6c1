//! Stage 1: initial baseline implementation. Complete as soon as the
//! journal has a single good (working) node; the sub-stage completion
//! check additionally asks the oracle whether the stated goals are met.

use orch_core::Result;

use crate::stage::{ask_is_complete, CompletionCheck, Stage};

pub struct Stage1Baseline;

#[async_trait::async_trait]
impl Stage for Stage1Baseline {
    fn main_stage_slug(&self) -> &'static str {
        "initial_implementation"
    }

    fn default_goals(&self) -> &'static str {
        "- Focus on getting basic working implementation\n\
         - Use a dataset appropriate to the experiment\n\
         - Aim for basic functional correctness\n\
         - If you are given \"Code To Use\", you can directly use it as a starting point."
    }

    async fn evaluate_substage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)> {
        let Some(best) = check.journal.best_node_by_metric(true) else {
            return Ok((false, "No best node found".to_string()));
        };
        let metric_str = best
            .metric
            .as_ref()
            .and_then(|m| m.comparison_key())
            .map(|v| v.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let prompt = format!(
            "Evaluate if the current sub-stage is complete.\n\n\
             Evidence:\n\
             - Best metric: {metric_str}\n\
             - Is buggy: {}\n\n\
             Requirements for completion:\n\
             - {}",
            best.is_buggy, check.meta.goals
        );
        ask_is_complete(check.oracle, check.feedback_model, check.feedback_temp, &prompt).await
    }

    async fn evaluate_stage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)> {
        if check.journal.good_nodes().next().is_some() {
            Ok((true, "Found working implementation".to_string()))
        } else {
            Ok((false, "Working implementation not found yet".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orch_core::{Journal, Metric, StageMeta};
    use orch_llm::FakeOracle;

    use super::*;

    fn meta() -> StageMeta {
        StageMeta::new(1, "initial_implementation", 1, "first_attempt", "find a baseline", 20, 5)
    }

    #[tokio::test]
    async fn stage_completes_once_a_good_node_exists() {
        let mut journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        let mut good = Node::new_draft("p", "c");
        good.metric = Some(Metric::scalar(0.5, true));
        journal.append(good);

        let meta = meta();
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(FakeOracle::new());
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, _) = Stage1Baseline.evaluate_stage_completion(check).await.unwrap();
        assert!(complete);
    }

    #[tokio::test]
    async fn stage_not_complete_with_only_buggy_nodes() {
        let mut journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        journal.append(buggy);

        let meta = meta();
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(FakeOracle::new());
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, _) = Stage1Baseline.evaluate_stage_completion(check).await.unwrap();
        assert!(!complete);
    }

    #[tokio::test]
    async fn substage_completion_defers_to_the_oracle_verdict() {
        let mut journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        let mut good = Node::new_draft("p", "c");
        good.metric = Some(Metric::scalar(0.9, true));
        journal.append(good);

        let meta = meta();
        let fake = FakeOracle::new();
        fake.push_structured(serde_json::json!({
            "is_complete": true,
            "reasoning": "metric is strong",
            "missing_criteria": []
        }));
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(fake);
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, reasoning) = Stage1Baseline.evaluate_substage_completion(check).await.unwrap();
        assert!(complete);
        assert_eq!(reasoning, "metric is strong");
    }
}
