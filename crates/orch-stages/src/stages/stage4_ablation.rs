//! Stage 4: ablation studies over the stage-3 winner. Sub-stage completion
//! results are memoized per `(best node, metric, goals)` so that repeated
//! checks against an unchanged best node skip the oracle call, mirroring
//! the original's `_substage_completion_cache`. The main stage never
//! self-declares complete; it only ends via `max_iterations`.

use std::collections::HashMap;
use std::sync::Mutex;

use orch_core::{Node, Result};

use crate::stage::{ask_is_complete, CompletionCheck, Stage};

#[derive(Default)]
pub struct Stage4Ablation {
    tried: Mutex<Vec<String>>,
    substage_completion_cache: Mutex<HashMap<String, (bool, String)>>,
}

impl Stage4Ablation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tried_ablations(&self) -> Vec<String> {
        self.tried.lock().expect("ablation state lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl Stage for Stage4Ablation {
    fn main_stage_slug(&self) -> &'static str {
        "ablation_studies"
    }

    fn default_goals(&self) -> &'static str {
        "- Conduct systematic component analysis that reveals the contribution of each part\n\
         - Use the same datasets you used from the previous stage"
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
        let cache_key = format!("stage=4_substage|id={}|metric={metric_str}|goals={}", best.id, check.meta.goals);
        if let Some(cached) = self.substage_completion_cache.lock().expect("cache lock poisoned").get(&cache_key) {
            tracing::debug!(node = %best.id, "stage 4 substage-completion cache hit");
            return Ok(cached.clone());
        }

        let prompt = format!(
            "Evaluate if the ablation sub-stage is complete given the goals:\n\
             - {}\n\n\
             Consider whether the ablation variations produce consistent and interpretable differences.",
            check.meta.goals
        );
        let result = ask_is_complete(check.oracle, check.feedback_model, check.feedback_temp, &prompt).await?;
        self.substage_completion_cache
            .lock()
            .expect("cache lock poisoned")
            .insert(cache_key, result.clone());
        Ok(result)
    }

    async fn evaluate_stage_completion(&self, _check: CompletionCheck<'_>) -> Result<(bool, String)> {
        Ok((false, "stage not completed".to_string()))
    }

    fn update_state(&self, result_node: &Node) {
        if result_node.is_buggy {
            return;
        }
        if let Some(name) = &result_node.ablation_name {
            self.tried.lock().expect("ablation state lock poisoned").push(name.clone());
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
        StageMeta::new(4, "ablation_studies", 1, "first_attempt", "run ablations", 20, 0)
    }

    #[tokio::test]
    async fn stage_never_self_declares_complete() {
        let journal = Journal::new("run", "stage_4_ablation_studies_1_first_attempt");
        let meta = meta();
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(FakeOracle::new());
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, reason) = Stage4Ablation::new().evaluate_stage_completion(check).await.unwrap();
        assert!(!complete);
        assert_eq!(reason, "stage not completed");
    }

    #[test]
    fn update_state_records_non_buggy_ablation_runs() {
        let stage = Stage4Ablation::new();
        let mut n = Node::new_draft("p", "c");
        n.ablation_name = Some("no-dropout".to_string());
        stage.update_state(&n);

        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        buggy.ablation_name = Some("no-norm".to_string());
        stage.update_state(&buggy);

        assert_eq!(stage.tried_ablations(), vec!["no-dropout".to_string()]);
    }

    #[tokio::test]
    async fn substage_completion_is_memoized_per_best_node() {
        let mut journal = Journal::new("run", "stage_4_ablation_studies_1_first_attempt");
        let mut good = Node::new_draft("p", "c");
        good.metric = Some(Metric::scalar(0.7, true));
        journal.append(good);

        let meta = meta();
        let fake = FakeOracle::new();
        fake.push_structured(serde_json::json!({
            "is_complete": true,
            "reasoning": "consistent ablation deltas",
            "missing_criteria": []
        }));
        let oracle: Arc<dyn orch_llm::Oracle> = Arc::new(fake);
        let stage = Stage4Ablation::new();

        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, reasoning) = stage.evaluate_substage_completion(check).await.unwrap();
        assert!(complete);
        assert_eq!(reasoning, "consistent ablation deltas");

        // Second call with the same best node/metric/goals must hit the cache
        // rather than exhaust the oracle's (now-empty) response queue.
        let check = CompletionCheck {
            meta: &meta,
            journal: &journal,
            oracle: &oracle,
            feedback_model: "feedback-model",
            feedback_temp: 0.5,
        };
        let (complete, reasoning) = stage.evaluate_substage_completion(check).await.unwrap();
        assert!(complete);
        assert_eq!(reasoning, "consistent ablation deltas");
    }
}
