//! The worker task: everything that happens to turn one dispatch request
//! (a creation mode plus an optional parent node) into a completed, scored
//! `Node`. This is the unit of work the parallel agent hands to a worker.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use orch_core::{Error, Node, Result};
use orch_exec::{GpuAllocator, Interpreter};
use orch_llm::Oracle;

/// Which of the six generation modes produced this node, mirroring the
/// dispatch in the original `_create_child_node`. Distinct from
/// `orch_core::StageKind`, which only describes tree position (draft/debug/
/// improve) after the fact — this describes *why* the worker was asked to
/// generate a node at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    Draft,
    Debug,
    Improve,
    Tuning,
    Ablation,
    Seed,
    SeedAggregation,
}

/// What varies per dispatch, as opposed to `WorkerContext`, which is the
/// same for every worker in a pool. Kept separate from `WorkerContext` so a
/// `code_override` (the verbatim-clone path seed runs need) can be threaded
/// through without the caller building a fake oracle response.
pub struct TaskSpec<'a> {
    pub mode: CreationMode,
    pub parent: Option<&'a Node>,
    /// When set, skip the oracle call and use this code as-is (seed runs:
    /// re-run the parent's code verbatim, under a different seed, rather
    /// than asking the oracle to regenerate it).
    pub code_override: Option<&'a str>,
    /// Extra material appended to the generation user prompt (seed
    /// aggregation: a summary of the per-seed results being aggregated).
    pub extra_context: Option<&'a str>,
}

impl<'a> TaskSpec<'a> {
    pub fn new(mode: CreationMode, parent: Option<&'a Node>) -> Self {
        Self {
            mode,
            parent,
            code_override: None,
            extra_context: None,
        }
    }
}

/// A fully self-contained, serializable dispatch: everything `TaskSpec` and
/// `WorkerContext` carry between them, minus the live oracle/GPU handles,
/// which the subprocess re-creates from its own environment. This is the
/// wire format between `ParallelAgent` and the re-exec'd `orch-worker`
/// binary.
#[derive(Serialize, Deserialize)]
pub struct WorkerRequest {
    pub worker_id: String,
    pub mode: CreationMode,
    pub parent: Option<Node>,
    #[serde(default)]
    pub code_override: Option<String>,
    #[serde(default)]
    pub extra_context: Option<String>,
    pub workspace_root: PathBuf,
    pub agent_file_name: String,
    pub exec_timeout_secs: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    pub code_model: String,
    #[serde(default = "default_temp")]
    pub code_temp: f64,
    pub feedback_model: String,
    #[serde(default = "default_temp")]
    pub feedback_temp: f64,
    pub task_description: String,
    #[serde(default)]
    pub run_plotting: bool,
}

fn default_startup_timeout() -> u64 {
    300
}

fn default_temp() -> f64 {
    0.5
}

impl WorkerRequest {
    pub fn task_spec(&self) -> TaskSpec<'_> {
        TaskSpec {
            mode: self.mode,
            parent: self.parent.as_ref(),
            code_override: self.code_override.as_deref(),
            extra_context: self.extra_context.as_deref(),
        }
    }
}

pub struct WorkerContext {
    pub oracle: Arc<dyn Oracle>,
    pub gpu: Arc<GpuAllocator>,
    pub workspace_root: PathBuf,
    pub agent_file_name: String,
    pub exec_timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub code_model: String,
    pub code_temp: f64,
    pub feedback_model: String,
    pub feedback_temp: f64,
    pub task_description: String,
    /// Stage 3/4 only: whether this node should also run plotting + VLM review.
    pub run_plotting: bool,
}

/// One generate→validate→execute→review→score pass. Plotting is attempted
/// afterward only when `ctx.run_plotting` is set and the node came back
/// non-buggy, matching the original's stage-gated `_run_plotting_and_vlm`.
pub async fn run_worker_task(ctx: &WorkerContext, worker_id: &str, spec: TaskSpec<'_>) -> Result<Node> {
    let gpu_id = ctx.gpu.acquire(worker_id)?;
    let result = run_worker_task_inner(ctx, worker_id, spec, gpu_id).await;
    ctx.gpu.release(worker_id);
    result
}

async fn run_worker_task_inner(
    ctx: &WorkerContext,
    worker_id: &str,
    spec: TaskSpec<'_>,
    gpu_id: Option<usize>,
) -> Result<Node> {
    let workspace = prepare_workspace(&ctx.workspace_root, worker_id)?;
    let mode = spec.mode;

    let mut node = generate_node(ctx, &spec).await?;
    validate_gpu_targeting(ctx, &mut node, gpu_id).await?;

    execute_node(ctx, &mut node, &workspace, gpu_id).await?;
    node.recompute_is_buggy_from_exec();

    if !node.exec.is_buggy() {
        parse_exec_result(ctx, &mut node).await?;
        parse_and_assign_metrics(ctx, &mut node, &workspace).await?;
    } else {
        node.metric = None;
    }
    node.recompute_is_buggy_from_exec();

    if matches!(mode, CreationMode::SeedAggregation) && !node.is_buggy {
        node.exp_results_dir = Some(
            workspace
                .join("experiment_results")
                .join(format!("seed_aggregation_{}", node.id))
                .to_string_lossy()
                .to_string(),
        );
    }

    if ctx.run_plotting && !node.is_buggy {
        run_plotting_and_vlm(ctx, &mut node, &workspace, gpu_id).await?;
    }

    Ok(node)
}

fn prepare_workspace(root: &Path, worker_id: &str) -> Result<PathBuf> {
    let dir = root.join(worker_id);
    std::fs::create_dir_all(&dir)
        .map_err(|e| Error::internal(format!("failed to prepare workspace {}: {e}", dir.display())))?;
    Ok(dir)
}

async fn generate_node(ctx: &WorkerContext, spec: &TaskSpec<'_>) -> Result<Node> {
    let mode = spec.mode;
    let parent = spec.parent;

    let mut node = match spec.code_override {
        // Seed mode re-runs the current best solution verbatim (under a
        // different seed, already baked into the override by the caller);
        // it must not go back to the oracle for a fresh generation.
        Some(code) => match parent {
            Some(p) => Node::new_child(p.id.clone(), p.plan.clone(), code.to_string()),
            None => Node::new_draft(String::new(), code.to_string()),
        },
        None => {
            let system_prompt = code_system_prompt(ctx, mode);
            let user_prompt = code_user_prompt(mode, parent, spec.extra_context);

            let response = ctx
                .oracle
                .query(&system_prompt, Some(&user_prompt), &ctx.code_model, ctx.code_temp)
                .await
                .map_err(|e| Error::LlmParseFailure {
                    attempts: 1,
                    reason: e.to_string(),
                })?;

            let (plan, code) = split_plan_and_code(&response);
            match parent {
                Some(p) => Node::new_child(p.id.clone(), plan, code),
                None => Node::new_draft(plan, code),
            }
        }
    };
    if matches!(mode, CreationMode::Seed) {
        node.is_seed_node = true;
    }
    if matches!(mode, CreationMode::SeedAggregation) {
        node.is_seed_agg_node = true;
    }
    if matches!(mode, CreationMode::Ablation) {
        node.ablation_name = Some(format!("ablation-{}", &node.id[..8]));
    }
    if matches!(mode, CreationMode::Tuning) {
        node.hyperparam_name = Some(format!("tuning-{}", &node.id[..8]));
    }
    Ok(node)
}

fn code_system_prompt(ctx: &WorkerContext, mode: CreationMode) -> String {
    let goal = match mode {
        CreationMode::Draft => "Write an initial, simple implementation addressing the task.",
        CreationMode::Debug => "The previous attempt raised an exception. Fix the bug and keep the rest of the approach.",
        CreationMode::Improve => "Propose one focused improvement over the current best solution.",
        CreationMode::Tuning => "Propose a hyperparameter change to explore, keeping the rest of the approach fixed.",
        CreationMode::Ablation => "Propose an ablation: remove or disable one component and measure the effect.",
        CreationMode::Seed => "Re-run the current best solution with a different random seed.",
        CreationMode::SeedAggregation => "Aggregate the multi-seed results into summary plots.",
    };
    format!(
        "You are generating Python code for an experiment.\nTask:\n{}\n\nGoal for this step: {}\n\
         Respond with a short plan followed by a fenced python code block.",
        ctx.task_description, goal
    )
}

fn code_user_prompt(mode: CreationMode, parent: Option<&Node>, extra_context: Option<&str>) -> String {
    let base = match (mode, parent) {
        (CreationMode::Debug, Some(p)) => format!(
            "Previous code:\n```python\n{}\n```\nFailure output:\n{}",
            p.code,
            p.exec.term_out.join("\n")
        ),
        (_, Some(p)) => format!("Current best code:\n```python\n{}\n```", p.code),
        (_, None) => "Generate the first attempt.".to_string(),
    };
    match extra_context {
        Some(extra) => format!("{base}\n\n{extra}"),
        None => base,
    }
}

/// Code for one multi-seed run: the parent's code verbatim, with a
/// reproducibility marker prepended so the seed is visible in the script
/// itself, not just the node metadata.
pub fn seed_code(parent: &Node, seed: u32) -> String {
    format!("# reproducibility marker: seed = {seed}\nSEED = {seed}\n\n{}", parent.code)
}

/// A short per-seed summary for the aggregation prompt's extra context.
pub fn seed_summary(seed_nodes: &[Node]) -> String {
    let mut out = String::from("Per-seed results to aggregate:\n");
    for (i, node) in seed_nodes.iter().enumerate() {
        let metric = node
            .metric
            .as_ref()
            .and_then(|m| m.comparison_key())
            .map(|v| v.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        out.push_str(&format!("- seed {i}: metric={metric}, buggy={}\n", node.is_buggy));
    }
    out
}

fn split_plan_and_code(response: &str) -> (String, String) {
    let marker = "```python";
    match response.find(marker) {
        Some(start) => {
            let plan = response[..start].trim().to_string();
            let rest = &response[start + marker.len()..];
            let code = match rest.find("```") {
                Some(end) => rest[..end].trim().to_string(),
                None => rest.trim().to_string(),
            };
            (plan, code)
        }
        None => (String::new(), response.trim().to_string()),
    }
}

const GPU_VALIDATION_MAX_ATTEMPTS: u32 = 3;

/// Check (via the oracle) that the generated code targets the assigned GPU
/// correctly, retrying the fix a bounded number of times.
async fn validate_gpu_targeting(ctx: &WorkerContext, node: &mut Node, gpu_id: Option<usize>) -> Result<()> {
    let Some(gpu_id) = gpu_id else { return Ok(()) };

    for attempt in 1..=GPU_VALIDATION_MAX_ATTEMPTS {
        let schema = json!({
            "type": "object",
            "properties": {
                "targets_correct_gpu": {"type": "boolean"},
                "fixed_code": {"type": "string"}
            },
            "required": ["targets_correct_gpu"]
        });
        let system = format!(
            "Confirm the following code only uses CUDA device index {gpu_id} (e.g. via CUDA_VISIBLE_DEVICES \
             or an explicit device index). If it targets the wrong device, return corrected code."
        );
        let response = ctx
            .oracle
            .query_structured(
                &system,
                Some(&node.code),
                &ctx.feedback_model,
                ctx.feedback_temp,
                "gpu_validation",
                &schema,
            )
            .await;

        let response = match response {
            Ok(r) => r,
            Err(_) if attempt < GPU_VALIDATION_MAX_ATTEMPTS => continue,
            Err(_) => {
                return Err(Error::GpuValidationFailure {
                    attempts: attempt,
                    gpu_id,
                })
            }
        };

        let ok = response["targets_correct_gpu"].as_bool().unwrap_or(false);
        if ok {
            return Ok(());
        }
        if let Some(fixed) = response["fixed_code"].as_str() {
            node.code = fixed.to_string();
        }
        if attempt == GPU_VALIDATION_MAX_ATTEMPTS {
            return Err(Error::GpuValidationFailure {
                attempts: attempt,
                gpu_id,
            });
        }
    }
    Ok(())
}

async fn execute_node(ctx: &WorkerContext, node: &mut Node, workspace: &Path, gpu_id: Option<usize>) -> Result<()> {
    let mut interpreter = Interpreter::new(workspace, ctx.exec_timeout_secs, ctx.agent_file_name.clone())?
        .with_startup_timeout(ctx.startup_timeout_secs);
    if let Some(gpu_id) = gpu_id {
        interpreter = interpreter.with_env("CUDA_VISIBLE_DEVICES", gpu_id.to_string());
    }
    let result = interpreter.run(&node.code).await?;
    node.exec.term_out = result.term_out;
    node.exec.exec_time = result.exec_time_secs;
    node.exec.exc_type = result.exc_type;
    node.exec.exc_info = result.exc_message.map(|m| json!({ "message": m }));
    Ok(())
}

/// LLM review of the raw execution output: a short summary plus an
/// is-this-a-bug verdict, mirroring `parse_exec_result`.
async fn parse_exec_result(ctx: &WorkerContext, node: &mut Node) -> Result<()> {
    let schema = json!({
        "type": "object",
        "properties": {
            "summary": {"type": "string"},
            "is_bug": {"type": "boolean"}
        },
        "required": ["summary", "is_bug"]
    });
    let system = "Review this experiment's output and summarize what happened. Decide whether the \
                  run is actually buggy (crashed, produced no usable result, or silently failed) even \
                  though no exception was raised.";
    let user = node.exec.term_out.join("\n");
    let response = ctx
        .oracle
        .query_structured(system, Some(&user), &ctx.feedback_model, ctx.feedback_temp, "exec_review", &schema)
        .await
        .map_err(|e| Error::LlmParseFailure { attempts: 1, reason: e.to_string() })?;

    node.analysis = response["summary"].as_str().map(str::to_string);
    if response["is_bug"].as_bool().unwrap_or(false) {
        node.is_buggy = true;
    }
    Ok(())
}

const METRIC_PARSE_MAX_ATTEMPTS: u32 = 3;

/// Ask the oracle to extract the headline metric from the run's output,
/// retrying a bounded number of times before falling back to `WorstMetric`
/// and marking the node buggy, matching `parse_and_assign_metrics`.
async fn parse_and_assign_metrics(ctx: &WorkerContext, node: &mut Node, _workspace: &Path) -> Result<()> {
    let schema = json!({
        "type": "object",
        "properties": {
            "value": {},
            "maximize": {"type": "boolean"}
        },
        "required": ["value", "maximize"]
    });
    let system = "Extract the single headline metric this run produced. `value` may be a plain number \
                  or a structured object with `metric_names[].data[].final_value` entries.";
    let user = node.exec.term_out.join("\n");

    for attempt in 1..=METRIC_PARSE_MAX_ATTEMPTS {
        let response = ctx
            .oracle
            .query_structured(system, Some(&user), &ctx.feedback_model, ctx.feedback_temp, "metric", &schema)
            .await;
        let response = match response {
            Ok(r) => r,
            Err(_) if attempt < METRIC_PARSE_MAX_ATTEMPTS => continue,
            Err(_) => {
                node.mark_worst_metric_buggy();
                return Ok(());
            }
        };
        let maximize = response["maximize"].as_bool().unwrap_or(true);
        match &response["value"] {
            serde_json::Value::Number(n) => {
                node.metric = Some(orch_core::Metric::scalar(n.as_f64().unwrap_or(0.0), maximize));
                return Ok(());
            }
            serde_json::Value::Object(_) => {
                node.metric = Some(orch_core::Metric::structured(response["value"].clone(), maximize));
                return Ok(());
            }
            _ if attempt < METRIC_PARSE_MAX_ATTEMPTS => continue,
            _ => {
                node.mark_worst_metric_buggy();
                return Ok(());
            }
        }
    }
    node.mark_worst_metric_buggy();
    Ok(())
}

/// Stage 3/4 only: generate and execute plotting code, then ask the oracle
/// (acting as the VLM reviewer) to summarize the resulting plots, mirroring
/// `_run_plotting_and_vlm`/`_execute_plotting_with_retries`/`_run_vlm_analysis`.
/// The original passes rendered images to a vision model; the oracle here is
/// asked to review plot *paths and captions* instead, since the Oracle trait
/// is text-in/text-out only (see the LLM client design note).
async fn run_plotting_and_vlm(ctx: &WorkerContext, node: &mut Node, workspace: &Path, gpu_id: Option<usize>) -> Result<()> {
    let system = format!(
        "Write Python plotting code that visualizes the results just produced by this experiment:\n{}",
        node.code
    );
    let response = ctx
        .oracle
        .query(&system, Some(&node.exec.term_out.join("\n")), &ctx.code_model, ctx.code_temp)
        .await
        .map_err(|e| Error::LlmParseFailure { attempts: 1, reason: e.to_string() })?;
    let (plot_plan, plot_code) = split_plan_and_code(&response);
    node.plot_plan = Some(plot_plan);
    node.plot_code = Some(plot_code.clone());

    let mut interpreter = Interpreter::new(workspace, ctx.exec_timeout_secs, format!("plot_{}", ctx.agent_file_name))?
        .with_startup_timeout(ctx.startup_timeout_secs);
    if let Some(gpu_id) = gpu_id {
        interpreter = interpreter.with_env("CUDA_VISIBLE_DEVICES", gpu_id.to_string());
    }
    let result = interpreter.run(&plot_code).await?;
    node.plot_exec.term_out = result.term_out;
    node.plot_exec.exec_time = result.exec_time_secs;
    node.plot_exec.exc_type = result.exc_type.clone();
    node.is_buggy_plots = Some(result.exc_type.is_some());

    if node.is_buggy_plots != Some(true) {
        node.exp_results_dir = Some(
            workspace
                .join("experiment_results")
                .join(format!("node_{}", node.id))
                .to_string_lossy()
                .to_string(),
        );
        let vlm_schema = json!({
            "type": "object",
            "properties": { "findings": {"type": "array", "items": {"type": "string"}} },
            "required": ["findings"]
        });
        let vlm_system = "Summarize what the generated plots show, one finding per sentence.";
        if let Ok(vlm_response) = ctx
            .oracle
            .query_structured(vlm_system, None, &ctx.feedback_model, ctx.feedback_temp, "vlm_findings", &vlm_schema)
            .await
        {
            if let Some(findings) = vlm_response["findings"].as_array() {
                node.vlm_feedback_summary = findings
                    .iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect();
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_llm::FakeOracle;

    fn ctx(oracle: Arc<dyn Oracle>, workspace: PathBuf) -> WorkerContext {
        WorkerContext {
            oracle,
            gpu: Arc::new(GpuAllocator::new(0)),
            workspace_root: workspace,
            agent_file_name: "runfile.py".to_string(),
            exec_timeout_secs: 30,
            startup_timeout_secs: 30,
            code_model: "code-model".to_string(),
            code_temp: 1.0,
            feedback_model: "feedback-model".to_string(),
            feedback_temp: 0.5,
            task_description: "fit a linear model".to_string(),
            run_plotting: false,
        }
    }

    fn tempdir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("orch-worker-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn split_plan_and_code_extracts_fenced_block() {
        let response = "Plan: do the thing.\n```python\nprint(1)\n```\n";
        let (plan, code) = split_plan_and_code(response);
        assert_eq!(plan, "Plan: do the thing.");
        assert_eq!(code, "print(1)");
    }

    #[tokio::test]
    async fn draft_task_produces_a_scored_non_buggy_node() {
        let oracle = FakeOracle::new();
        oracle.push_text("Plan: print a number.\n```python\nprint('metric: 0.5')\n```");
        oracle.push_structured(json!({"summary": "printed metric", "is_bug": false}));
        oracle.push_structured(json!({"value": 0.5, "maximize": true}));
        let workspace = tempdir();
        let c = ctx(Arc::new(oracle), workspace);

        let node = run_worker_task(&c, "worker-0", TaskSpec::new(CreationMode::Draft, None)).await.unwrap();
        assert!(!node.is_buggy);
        assert!(node.metric.is_some());
    }

    #[tokio::test]
    async fn buggy_execution_skips_metric_parsing() {
        let oracle = FakeOracle::new();
        oracle.push_text("Plan: raise.\n```python\nraise ValueError('boom')\n```");
        let workspace = tempdir();
        let c = ctx(Arc::new(oracle), workspace);

        let node = run_worker_task(&c, "worker-0", TaskSpec::new(CreationMode::Draft, None)).await.unwrap();
        assert!(node.is_buggy);
        assert!(node.metric.is_none());
    }

    #[tokio::test]
    async fn metric_parse_exhaustion_falls_back_to_worst_metric() {
        let oracle = FakeOracle::new();
        oracle.push_text("Plan: print.\n```python\nprint('ok')\n```");
        oracle.push_structured(json!({"summary": "ok", "is_bug": false}));
        // no structured responses queued for metric parsing -> exhausts retries
        let workspace = tempdir();
        let c = ctx(Arc::new(oracle), workspace);

        let node = run_worker_task(&c, "worker-0", TaskSpec::new(CreationMode::Draft, None)).await.unwrap();
        assert!(node.is_buggy);
        assert!(matches!(node.metric, Some(orch_core::Metric::Worst)));
    }
}
