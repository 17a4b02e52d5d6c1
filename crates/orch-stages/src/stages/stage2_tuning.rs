//! Stage 2: hyperparameter tuning over the stage-1 baseline. Tracks which
//! hyperparameters have been tried via `update_state`, matching
//! `update_hyperparam_state`; main-stage completion additionally requires
//! having moved past the carried-over baseline node.

use std::sync::Mutex;

use orch_core::{Node, Result};

use crate::stage::{ask_is_complete, CompletionCheck, Stage};

#[derive(Default)]
pub struct Stage2Tuning {
    tried: Mutex<Vec<String>>,
}

impl Stage2Tuning {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tried_hyperparams(&self) -> Vec<String> {
        self.tried.lock().expect("tuning state lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Stage for Stage2Tuning {
    fn main_stage_slug(&self) -> &'static str {
        "baseline_tuning"
    }

    fn default_goals(&self) -> &'static str {
        "- Change hyperparameters such as learning rate, number of epochs, batch size, etc. to improve the performance\n\
         - DO NOT change the model architecture from the previous stage\n\
         - Introduce additional datasets from HuggingFace to test the model. Use dataset sizes appropriate to the experiment."
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
            "Evaluate if Stage 2 (baseline tuning) sub-stage is complete.\n\n\
             Evidence:\n\
             - Datasets tested: {:?}\n\
             - Best metric: {metric_str}\n\n\
             Requirements for completion:\n\
             - {}",
            best.datasets_successfully_tested, check.meta.goals
        );
        ask_is_complete(check.oracle, check.feedback_model, check.feedback_temp, &prompt).await
    }

    async fn evaluate_stage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)> {
        let Some(best) = check.journal.best_node_by_metric(true) else {
            return Ok((false, "No best node found".to_string()));
        };
        if check.journal.nodes().first().is_some_and(|first| first.id == best.id) {
            return Ok((false, "No improvement from base node".to_string()));
        }
        let prompt = format!(
            "Evaluate if Stage 2 (baseline tuning) is complete based on the following evidence:\n\n\
             1. Datasets Tested: {:?}\n\n\
             Requirements for completion:\n\
             1. Training curves should show stable convergence\n\
             2. Results should be tested on at least two datasets\n\
             3. No major instabilities or issues in the plots\n\n\
             Provide a detailed evaluation of completion status.",
            best.datasets_successfully_tested
        );
        ask_is_complete(check.oracle, check.feedback_model, check.feedback_temp, &prompt).await
    }

    fn update_state(&self, result_node: &Node) {
        if result_node.is_buggy {
            return;
        }
        if let Some(name) = &result_node.hyperparam_name {
            self.tried.lock().expect("tuning state lock poisoned").push(name.clone());
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
        StageMeta::new(2, "baseline_tuning", 1, "first_attempt", "tune hyperparameters", 20, 0)
    }

    #[tokio::test]
    async fn stage_not_complete_when_best_is_still_the_carried_over_baseline() {
        let mut journal = Journal::new("run", "stage_2_baseline_tuning_1_first_attempt");
        let mut baseline = Node::new_draft("p", "c");
        baseline.metric = Some(Metric::scalar(0.5, true));
        journal.append(baseline);

        let meta = meta();
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(FakeOracle::new());
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, reason) = Stage2Tuning::new().evaluate_stage_completion(check).await.unwrap();
        assert!(!complete);
        assert_eq!(reason, "No improvement from base node");
    }

    #[test]
    fn update_state_records_non_buggy_hyperparam_runs() {
        let stage = Stage2Tuning::new();
        let mut n = Node::new_draft("p", "c");
        n.hyperparam_name = Some("lr-0.01".to_string());
        stage.update_state(&n);

        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        buggy.hyperparam_name = Some("lr-0.1".to_string());
        stage.update_state(&buggy);

        assert_eq!(stage.tried_hyperparams(), vec!["lr-0.01".to_string()]);
    }
}
