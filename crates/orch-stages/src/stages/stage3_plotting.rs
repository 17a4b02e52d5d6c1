//! Stage 3: creative exploration with plot-driven review. Sub-stage
//! completion asks the oracle to weigh the VLM plot feedback against the
//! stated goals; main-stage completion is a pure exec-time heuristic (the
//! original never lets this stage self-declare done beyond that — it relies
//! on `max_iterations` to end it).

use orch_core::Result;

use crate::stage::{ask_is_complete, CompletionCheck, Stage};

pub struct Stage3Plotting;

fn vlm_feedback_text(node: &orch_core::Node) -> String {
    let analysis = node
        .plot_analyses
        .first()
        .and_then(|v| v.get("analysis"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| "No plot analyses found".to_string());
    format!(
        "Plot analyses: {analysis}\nVLM Feedback Summary: {:?}",
        node.vlm_feedback_summary
    )
}

#[async_trait::async_trait]
impl Stage for Stage3Plotting {
    fn main_stage_slug(&self) -> &'static str {
        "creative_research"
    }

    fn default_goals(&self) -> &'static str {
        "- Explore novel improvements\n\
         - Come up with experiments to reveal new insights\n\
         - Be creative and think outside the box\n\
         - Test your models on multiple HuggingFace datasets to demonstrate generalization. \
           Usually THREE datasets are enough."
    }

    async fn evaluate_substage_completion(&self, check: CompletionCheck<'_>) -> Result<(bool, String)> {
        let Some(best) = check.journal.best_node_by_metric(true) else {
            return Ok((false, "No best node found".to_string()));
        };
        let prompt = format!(
            "Evaluate if the current sub-stage is complete based on the following evidence:\n\
             1. Figure Analysis:\n{}\n\n\
             Requirements for completion:\n\
             - {}\n\n\
             Provide a detailed evaluation of completion status.",
            vlm_feedback_text(best),
            check.meta.goals
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
        Ok((false, "stage not completed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use orch_core::{Journal, Metric, Node, StageMeta};
    use orch_llm::FakeOracle;

    use super::*;

    fn meta() -> StageMeta {
        StageMeta::new(3, "creative_research", 1, "first_attempt", "explore creatively", 20, 0)
    }

    #[tokio::test]
    async fn stage_not_complete_when_best_is_still_the_carried_over_baseline() {
        let mut journal = Journal::new("run", "stage_3_creative_research_1_first_attempt");
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
        let (complete, reason) = Stage3Plotting.evaluate_stage_completion(check).await.unwrap();
        assert!(!complete);
        assert_eq!(reason, "No improvement from base node");
    }

    #[tokio::test]
    async fn substage_completion_weighs_vlm_feedback_against_goals() {
        let mut journal = Journal::new("run", "stage_3_creative_research_1_first_attempt");
        let mut good = Node::new_draft("p", "c");
        good.metric = Some(Metric::scalar(0.8, true));
        good.plot_analyses = vec![serde_json::json!({"analysis": "loss curve is smooth"})];
        journal.append(good);

        let meta = meta();
        let fake = FakeOracle::new();
        fake.push_structured(serde_json::json!({
            "is_complete": true,
            "reasoning": "plots support the conclusion",
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
        let (complete, reasoning) = Stage3Plotting.evaluate_substage_completion(check).await.unwrap();
        assert!(complete);
        assert_eq!(reasoning, "plots support the conclusion");
    }
}
