//! The Agent Manager: the stage/substage state machine that drives a run
//! from stage 1 (baseline) through stage 4 (ablation), creating substages,
//! evaluating completion, carrying the best node forward between stages,
//! and running the post-stage multi-seed evaluation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use orch_agent::{ParallelAgent, ParallelAgentConfig, SelectionConfig};
use orch_core::{Config, Error, Journal, Node, Result, StageMeta};
use orch_exec::GpuAllocator;
use orch_llm::Oracle;
use orch_telemetry::{Event, EventEmitter, RunLogEvent, RunStageProgressEvent};

use crate::stage::{CompletionCheck, Stage};
use crate::stages::{Stage1Baseline, Stage2Tuning, Stage3Plotting, Stage4Ablation};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageTransition {
    pub from_stage: String,
    pub to_stage: String,
    pub reason: String,
}

/// Outcome of a main-stage completion check. `FailedTerminate` is stage 1's
/// special case: reaching `max_iterations` with no good node ends the whole
/// run rather than advancing.
enum StageOutcome {
    NotYet,
    Done(String),
    FailedTerminate(String),
}

#[derive(Deserialize)]
struct SubstageGoalResponse {
    goals: String,
    sub_stage_name: String,
}

pub struct AgentManager {
    pub cfg: Config,
    pub workspace_dir: PathBuf,
    pub oracle: Arc<dyn Oracle>,
    pub gpu: Arc<GpuAllocator>,
    pub agent_file_name: String,
    pub run_id: String,
    pub task_description: String,
    pub emitter: EventEmitter,

    stage1: Stage1Baseline,
    stage2: Stage2Tuning,
    stage3: Stage3Plotting,
    stage4: Stage4Ablation,

    stages: Vec<StageMeta>,
    current_stage: Option<StageMeta>,
    journals: HashMap<String, Journal>,
    stage_history: Vec<StageTransition>,
}

impl AgentManager {
    pub fn new(
        cfg: Config,
        workspace_dir: PathBuf,
        oracle: Arc<dyn Oracle>,
        gpu: Arc<GpuAllocator>,
        run_id: impl Into<String>,
        task_description: impl Into<String>,
        emitter: EventEmitter,
    ) -> Self {
        let agent_file_name = cfg.exec.agent_file_name.clone();
        let mut manager = Self {
            cfg,
            workspace_dir,
            oracle,
            gpu,
            agent_file_name,
            run_id: run_id.into(),
            task_description: task_description.into(),
            emitter,
            stage1: Stage1Baseline,
            stage2: Stage2Tuning::new(),
            stage3: Stage3Plotting,
            stage4: Stage4Ablation::new(),
            stages: Vec::new(),
            current_stage: None,
            journals: HashMap::new(),
            stage_history: Vec::new(),
        };
        manager.create_initial_stage();
        manager
    }

    fn stage_for(&self, number: u8) -> &dyn Stage {
        match number {
            1 => &self.stage1,
            2 => &self.stage2,
            3 => &self.stage3,
            4 => &self.stage4,
            other => panic!("invalid stage number {other}"),
        }
    }

    fn new_journal(&self, stage_name: &str) -> Journal {
        let mut j = Journal::new(self.run_id.clone(), stage_name);
        j.code_model = self.cfg.agent.code.model.clone();
        j.code_temp = self.cfg.agent.code.temp;
        j.feedback_model = self.cfg.agent.feedback.model.clone();
        j.feedback_temp = self.cfg.agent.feedback.temp;
        j
    }

    fn create_initial_stage(&mut self) {
        let stage1 = Stage1Baseline;
        let meta = StageMeta::new(
            1,
            stage1.main_stage_slug(),
            1,
            "preliminary",
            stage1.default_goals(),
            self.cfg.max_iterations_for_stage(1),
            self.cfg.agent.search.num_drafts,
        );
        self.journals.insert(meta.name(), self.new_journal(&meta.name()));
        self.stages.push(meta.clone());
        self.current_stage = Some(meta);
    }

    fn curate_task_desc(&self, stage: &StageMeta) -> String {
        format!(
            "{}\n\nCurrent Main Stage: {}\nSub-stage: {} - {}\nSub-stage goals: {}",
            self.task_description, stage.slug, stage.substage_number, stage.substage_name, stage.goals
        )
    }

    fn get_best_implementation(&self, stage_name: &str) -> Option<Node> {
        let journal = self.journals.get(stage_name)?;
        journal.best_node_by_metric(true).map(Node::deep_copy_for_carryover)
    }

    fn carryover_for_stage(&self, stage: &StageMeta) -> Option<Node> {
        let source_number = match stage.number {
            2 => 1,
            3 => 2,
            4 => 3,
            _ => return None,
        };
        self.stages
            .iter()
            .rev()
            .find(|s| s.number == source_number)
            .and_then(|s| self.get_best_implementation(&s.name()))
    }

    fn create_agent_for_stage(&self, stage: &StageMeta) -> ParallelAgent {
        ParallelAgent {
            oracle: self.oracle.clone(),
            gpu: self.gpu.clone(),
            cfg: ParallelAgentConfig {
                num_workers: self.cfg.agent.num_workers,
                selection: SelectionConfig {
                    num_drafts: self.cfg.agent.search.num_drafts,
                    debug_prob: self.cfg.agent.search.debug_prob,
                    max_debug_depth: self.cfg.agent.search.max_debug_depth,
                },
                timeout_secs: self.cfg.exec.timeout,
                num_seeds: self.cfg.agent.multi_seed_eval.num_seeds,
            },
            workspace_root: self.workspace_dir.join(stage.name()),
            agent_file_name: self.agent_file_name.clone(),
            code_model: self.cfg.agent.code.model.clone(),
            code_temp: self.cfg.agent.code.temp,
            feedback_model: self.cfg.agent.feedback.model.clone(),
            feedback_temp: self.cfg.agent.feedback.temp,
            task_description: self.curate_task_desc(stage),
            emitter: self.emitter.clone(),
        }
    }

    fn emit_log(&self, message: impl Into<String>) {
        self.emitter.emit(Event::RunLog(RunLogEvent {
            message: message.into(),
            level: "info".to_string(),
        }));
    }

    fn emit_progress(&self, stage: &StageMeta, journal: &Journal) {
        let total = journal.len() as u32;
        let buggy = journal.buggy_nodes().count() as u32;
        let good = journal.good_nodes().count() as u32;
        let best_metric = journal
            .best_node_by_metric(true)
            .and_then(|n| n.metric.as_ref())
            .and_then(|m| m.comparison_key())
            .map(|v| v.to_string());
        self.emitter.emit(Event::RunStageProgress(RunStageProgressEvent {
            stage: stage.name(),
            iteration: total,
            max_iterations: stage.max_iterations,
            progress: if stage.max_iterations == 0 {
                0.0
            } else {
                total as f64 / stage.max_iterations as f64
            },
            total_nodes: total,
            buggy_nodes: buggy,
            good_nodes: good,
            best_metric,
            eta_s: None,
            latest_iteration_time_s: None,
        }));
    }

    /// Seed a new sub-stage's journal with the prior sub-stage's best node,
    /// matching `_prepare_substage`. Returns `false` if a previous best was
    /// expected (we are not the very first sub-stage) but not found.
    fn prepare_substage(&mut self, stage: &StageMeta) -> bool {
        let Some(prev) = self.stage_history.last().map(|t| t.from_stage.clone()) else {
            return true;
        };
        match self.get_best_implementation(&prev) {
            Some(best) => {
                self.journals.get_mut(&stage.name()).expect("journal exists").append(best);
                true
            }
            None => {
                tracing::error!(substage = %stage.name(), "no previous best implementation found, ending run");
                false
            }
        }
    }

    async fn check_substage_completion(&self, stage: &StageMeta) -> Result<(bool, String)> {
        let journal = self.journals.get(&stage.name()).expect("journal exists");
        if journal.len() as u32 >= stage.max_iterations {
            return Ok((true, "Reached max iterations".to_string()));
        }
        let check = CompletionCheck {
            meta: stage,
            journal,
            oracle: &self.oracle,
            feedback_model: &self.cfg.agent.feedback.model,
            feedback_temp: self.cfg.agent.feedback.temp,
        };
        self.stage_for(stage.number).evaluate_substage_completion(check).await
    }

    async fn check_stage_completion(&mut self, stage: &StageMeta) -> Result<StageOutcome> {
        let journal = self.journals.get(&stage.name()).expect("journal exists");
        if journal.len() as u32 >= stage.max_iterations {
            if stage.number == 1 {
                tracing::error!(
                    max_iterations = stage.max_iterations,
                    "initial stage did not find a working implementation"
                );
                return Ok(StageOutcome::FailedTerminate("Failed to find working implementation".to_string()));
            }
            return Ok(StageOutcome::Done("Reached max iterations".to_string()));
        }

        let check = CompletionCheck {
            meta: stage,
            journal,
            oracle: &self.oracle,
            feedback_model: &self.cfg.agent.feedback.model,
            feedback_temp: self.cfg.agent.feedback.temp,
        };
        let (complete, reason) = self.stage_for(stage.number).evaluate_stage_completion(check).await?;
        if complete {
            Ok(StageOutcome::Done(reason))
        } else {
            Ok(StageOutcome::NotYet)
        }
    }

    async fn generate_substage_goal(&self, stage: &dyn Stage) -> (String, String) {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "goals": {"type": "string"},
                "sub_stage_name": {"type": "string"}
            },
            "required": ["goals", "sub_stage_name"]
        });
        let prompt = format!(
            "Based on the current experimental progress, generate focused goals for the next sub-stage.\n\n\
             Main Stage Goals:\n{}\n\n\
             Generate specific, actionable sub-stage goals that address current issues, build on recent \
             progress, and move towards the main stage goals.",
            stage.default_goals()
        );
        let response = self
            .oracle
            .query_structured(&prompt, None, &self.cfg.agent.feedback.model, self.cfg.agent.feedback.temp, "substage_goal", &schema)
            .await
            .ok()
            .and_then(|v| serde_json::from_value::<SubstageGoalResponse>(v).ok());

        match response {
            Some(r) => (r.goals, r.sub_stage_name),
            None => (
                "Continue progress on main stage objectives while addressing current issues.".to_string(),
                "first_attempt".to_string(),
            ),
        }
    }

    async fn create_next_substage(&self, current: &StageMeta) -> Option<StageMeta> {
        let stage_impl = self.stage_for(current.number);
        let (sub_goal, sub_name) = self.generate_substage_goal(stage_impl).await;

        Some(StageMeta::new(
            current.number,
            stage_impl.main_stage_slug(),
            current.substage_number + 1,
            sub_name,
            format!("Main stage goals:\n{}\n\nSub-stage goals:\n{}", stage_impl.default_goals(), sub_goal),
            self.cfg.max_iterations_for_stage(current.number),
            0,
        ))
    }

    fn create_next_main_stage(&self, current: &StageMeta) -> Option<StageMeta> {
        let next_number = current.number + 1;
        if next_number > 4 {
            return None;
        }
        let stage_impl = self.stage_for(next_number);
        Some(StageMeta::new(
            next_number,
            stage_impl.main_stage_slug(),
            1,
            "first_attempt",
            stage_impl.default_goals(),
            self.cfg.max_iterations_for_stage(next_number),
            0,
        ))
    }

    fn save_checkpoint(&self, stage_name: &str) -> Result<()> {
        let dir = self.workspace_dir.join("checkpoints");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{stage_name}.json"));
        let checkpoint = serde_json::json!({
            "journals": self.journals,
            "stage_history": self.stage_history,
            "stages": self.stages,
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&checkpoint)?)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    async fn perform_multi_seed_eval_if_needed(&mut self, agent: &ParallelAgent, stage: &StageMeta) -> Result<bool> {
        if self.cfg.agent.multi_seed_eval.num_seeds == 0 {
            return Ok(false);
        }
        let Some(best) = self.get_best_implementation(&stage.name()) else {
            tracing::error!(stage = %stage.name(), "no best node found during multi-seed eval");
            return Ok(false);
        };
        let journal = self.journals.get_mut(&stage.name()).expect("journal exists");
        agent.run_multi_seed_evaluation(journal, &best).await?;
        tracing::info!(stage = %stage.name(), "multi-seed evaluation done");
        Ok(true)
    }

    /// Run a single main stage starting from `initial`, advancing through
    /// sub-stages until the main stage completes (or the run is terminated).
    async fn run_stage(&mut self, initial: StageMeta) -> Result<()> {
        let mut current = Some(initial);
        while let Some(stage) = current.take() {
            tracing::info!(substage = %stage.name(), max_iterations = stage.max_iterations, "starting sub-stage");
            let agent = self.create_agent_for_stage(&stage);
            let carryover = self.carryover_for_stage(&stage);

            if !self.prepare_substage(&stage) {
                self.current_stage = None;
                return Err(Error::RunTerminated(format!(
                    "no previous best implementation found for {}",
                    stage.name()
                )));
            }

            loop {
                let iter = self.journals.get(&stage.name()).expect("journal exists").len() + 1;
                tracing::debug!(substage = %stage.name(), iteration = iter, max = stage.max_iterations, "stepping");

                let stage_name = stage.name();
                let journal = self.journals.get_mut(&stage_name).expect("journal exists");
                agent.step(journal, &stage_name, carryover.as_ref(), stage.number >= 3).await?;

                for node in journal.nodes().to_vec() {
                    self.stage_for(stage.number).update_state(&node);
                }

                self.emit_progress(&stage, self.journals.get(&stage_name).expect("journal exists"));
                self.save_checkpoint(&stage.name())?;

                match self.check_stage_completion(&stage).await? {
                    StageOutcome::FailedTerminate(reason) => {
                        tracing::error!(reason, "experiment ended without a working implementation");
                        self.emit_log(format!("Run terminated: {reason}"));
                        self.current_stage = None;
                        return Err(Error::RunTerminated(reason));
                    }
                    StageOutcome::Done(reason) => {
                        tracing::info!(reason, substage = %stage.name(), "main stage complete");
                        self.emit_log(format!("Main stage {} complete: {reason}", stage.slug));
                        self.perform_multi_seed_eval_if_needed(&agent, &stage).await?;
                        current = None;
                        break;
                    }
                    StageOutcome::NotYet => {}
                }

                let (substage_complete, reason) = self.check_substage_completion(&stage).await?;
                if substage_complete {
                    tracing::info!(reason, substage = %stage.name(), "sub-stage complete");
                    self.emit_log(format!("Sub-stage {} complete: {reason}", stage.name()));
                    match self.create_next_substage(&stage).await {
                        Some(next) => {
                            self.stage_history.push(StageTransition {
                                from_stage: stage.name(),
                                to_stage: next.name(),
                                reason,
                            });
                            self.journals.insert(next.name(), self.new_journal(&next.name()));
                            self.stages.push(next.clone());
                            current = Some(next);
                        }
                        None => current = None,
                    }
                    break;
                }
            }
        }
        if self.current_stage.is_some() {
            self.save_checkpoint("latest")?;
        }
        Ok(())
    }

    fn advance_to_next_main_stage(&mut self) {
        let Some(last) = self.stages.last().cloned() else { return };
        match self.create_next_main_stage(&last) {
            Some(next) => {
                self.stage_history.push(StageTransition {
                    from_stage: last.name(),
                    to_stage: next.name(),
                    reason: format!("Moving to {}", next.name()),
                });
                self.journals.insert(next.name(), self.new_journal(&next.name()));
                self.stages.push(next.clone());
                self.current_stage = Some(next);
            }
            None => {
                tracing::info!(stage = %last.name(), "no more stages to run, experiment complete");
                self.current_stage = None;
            }
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        while let Some(stage) = self.current_stage.clone() {
            tracing::info!(stage = %stage.slug, goals = %stage.goals, "starting main stage");
            self.run_stage(stage).await?;
            self.advance_to_next_main_stage();
        }
        Ok(())
    }

    pub fn journal(&self, stage_name: &str) -> Option<&Journal> {
        self.journals.get(stage_name)
    }
}

#[cfg(test)]
mod tests {
    use orch_core::config::{AgentConfig, ExecConfig, ExperimentConfig, MultiSeedEvalConfig, SearchConfig, StageIterConfig, StageModelConfig, TelemetryConfig};
    use orch_exec::GpuAllocator;
    use orch_llm::FakeOracle;
    use orch_telemetry::EventEmitter;

    use super::*;

    fn test_config() -> Config {
        Config {
            data_dir: "data".into(),
            desc_file: "desc.json".into(),
            log_dir: "logs".into(),
            workspace_dir: "ws".into(),
            exp_name: "run".into(),
            log_level: "info".into(),
            exec: ExecConfig::default(),
            agent: AgentConfig {
                num_workers: 0,
                search: SearchConfig::default(),
                stages: StageIterConfig {
                    stage1_max_iters: 1,
                    stage2_max_iters: 20,
                    stage3_max_iters: 20,
                    stage4_max_iters: 20,
                },
                multi_seed_eval: MultiSeedEvalConfig { num_seeds: 0 },
                code: StageModelConfig {
                    model: "code-model".into(),
                    temp: 1.0,
                },
                feedback: StageModelConfig {
                    model: "feedback-model".into(),
                    temp: 0.5,
                },
                vlm_feedback: StageModelConfig {
                    model: "vlm-model".into(),
                    temp: 0.5,
                },
                k_fold_validation: 0,
            },
            experiment: ExperimentConfig::default(),
            report: None,
            telemetry: TelemetryConfig::default(),
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orch-stages-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    // num_workers: 0 keeps `agent.step()` a true no-op (select_parallel_nodes
    // never fills its selection buffer), so this exercises the stage-1
    // termination path without ever dispatching a worker.
    #[tokio::test]
    async fn stage_one_failure_terminates_the_run_instead_of_advancing() {
        let cfg = test_config();
        let oracle: Arc<dyn Oracle> = Arc::new(FakeOracle::new());
        let gpu = Arc::new(GpuAllocator::new(0));
        let mut mgr = AgentManager::new(cfg, tempdir(), oracle, gpu, "run", "fit a model", EventEmitter::disabled());

        let stage_name = mgr.current_stage.clone().expect("initial stage set").name();
        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        mgr.journals.get_mut(&stage_name).expect("journal exists").append(buggy);

        let result = mgr.run().await;
        assert!(matches!(result, Err(Error::RunTerminated(_))));
        assert!(mgr.current_stage.is_none());
    }
}
