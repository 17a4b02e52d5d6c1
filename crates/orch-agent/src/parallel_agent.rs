//! Drives one breadth-first iteration: select nodes, dispatch each to a
//! worker subprocess, collect results with a per-task timeout, and append
//! whatever came back to the journal. Also runs the post-stage multi-seed
//! evaluation. Every dispatch is a re-exec of the current binary into the
//! `orch-worker` subcommand, not an in-process call: GPU assignment is
//! resolved here (the only place that holds the `GpuAllocator`) and handed
//! down purely via an inherited `CUDA_VISIBLE_DEVICES`, matching the
//! cancellable-subprocess idiom the interpreter itself uses.

use std::sync::Arc;

use orch_core::{Error, Journal, Metric, Node, Result};
use orch_exec::GpuAllocator;
use orch_llm::Oracle;
use orch_telemetry::{Event, EventEmitter, ExperimentNodeCompletedEvent};
use orch_worker::{seed_code, seed_summary, CreationMode, WorkerRequest};
use tokio::process::Command;

use crate::selection::{select_parallel_nodes, Selection, SelectionConfig};

pub struct ParallelAgentConfig {
    pub num_workers: u32,
    pub selection: SelectionConfig,
    pub timeout_secs: u64,
    pub num_seeds: u32,
}

pub struct ParallelAgent {
    pub oracle: Arc<dyn Oracle>,
    pub gpu: Arc<GpuAllocator>,
    pub cfg: ParallelAgentConfig,
    pub workspace_root: std::path::PathBuf,
    pub agent_file_name: String,
    pub code_model: String,
    pub code_temp: f64,
    pub feedback_model: String,
    pub feedback_temp: f64,
    pub task_description: String,
    pub emitter: EventEmitter,
}

impl ParallelAgent {
    fn worker_request(
        &self,
        worker_id: &str,
        mode: CreationMode,
        parent: Option<&Node>,
        code_override: Option<String>,
        extra_context: Option<String>,
        run_plotting: bool,
    ) -> WorkerRequest {
        WorkerRequest {
            worker_id: worker_id.to_string(),
            mode,
            parent: parent.cloned(),
            code_override,
            extra_context,
            workspace_root: self.workspace_root.join(worker_id),
            agent_file_name: self.agent_file_name.clone(),
            exec_timeout_secs: self.cfg.timeout_secs,
            startup_timeout_secs: 300,
            code_model: self.code_model.clone(),
            code_temp: self.code_temp,
            feedback_model: self.feedback_model.clone(),
            feedback_temp: self.feedback_temp,
            task_description: self.task_description.clone(),
            run_plotting,
        }
    }

    /// Run one request in the re-exec'd `orch-worker` subcommand: acquire a
    /// GPU here (the pool is the only place holding the allocator), write
    /// the request to the worker's own workspace, spawn, and wait with a
    /// bounded timeout. `.output()` is appropriate here (rather than the
    /// interpreter's manual pipe-draining) because the subprocess's own
    /// stdout is a single bounded JSON blob printed once at exit, not a
    /// long-running cancellable child.
    async fn dispatch_worker(&self, worker_id: &str, req: WorkerRequest) -> Result<Node> {
        let gpu_id = self.gpu.acquire(worker_id)?;
        let result = self.run_subprocess(worker_id, req, gpu_id).await;
        self.gpu.release(worker_id);
        result
    }

    async fn run_subprocess(&self, worker_id: &str, req: WorkerRequest, gpu_id: Option<usize>) -> Result<Node> {
        std::fs::create_dir_all(&req.workspace_root)?;
        let request_path = req.workspace_root.join("request.json");
        std::fs::write(&request_path, serde_json::to_vec(&req)?)?;

        let mut command = Command::new(worker_binary_path()?);
        command.arg(&request_path).kill_on_drop(true);
        if let Some(gpu_id) = gpu_id {
            command.env("CUDA_VISIBLE_DEVICES", gpu_id.to_string());
        }

        let timeout = std::time::Duration::from_secs(self.cfg.timeout_secs + 60);
        let output = match tokio::time::timeout(timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::WorkerFailed {
                    worker_id: worker_id.to_string(),
                    reason: format!("failed to spawn orch-worker: {e}"),
                })
            }
            Err(_) => return Err(Error::WorkerTimeout { worker_id: worker_id.to_string() }),
        };

        if !output.status.success() {
            return Err(Error::WorkerFailed {
                worker_id: worker_id.to_string(),
                reason: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(Error::from)
    }

    /// Run one iteration: select, dispatch, collect, append. Returns the
    /// number of nodes successfully appended (workers that timed out or
    /// otherwise failed are skipped, matching the original's per-future
    /// timeout handling).
    pub async fn step(
        &self,
        journal: &mut Journal,
        stage_slug: &str,
        carryover_primary: Option<&Node>,
        run_plotting: bool,
    ) -> Result<usize> {
        let selections = select_parallel_nodes(
            journal,
            &self.cfg.selection,
            stage_slug,
            self.cfg.num_workers,
            carryover_primary,
        );

        let mut dispatches = Vec::with_capacity(selections.len());
        for (idx, selection) in selections.into_iter().enumerate() {
            let worker_id = format!("worker_{idx}");
            let (mode, parent) = match selection {
                Selection::Draft => (CreationMode::Draft, None),
                Selection::FromParent(n) => {
                    let mode = if n.is_buggy { CreationMode::Debug } else { CreationMode::Improve };
                    (mode, Some(n))
                }
            };
            let req = self.worker_request(&worker_id, mode, parent, None, None, run_plotting);
            dispatches.push(async move { self.dispatch_worker(&worker_id, req).await });
        }

        let mut appended = 0;
        for result in futures::future::join_all(dispatches).await {
            match result {
                Ok(node) => {
                    self.emit_node_completed(stage_slug, &node);
                    journal.append(node);
                    appended += 1;
                }
                Err(e) => tracing::warn!("worker task failed: {e}"),
            }
        }
        Ok(appended)
    }

    /// Re-run the best node under `num_seeds` different seeds, appending
    /// each result as a seed node, then dispatch a real aggregation pass
    /// over all of them. Seed nodes and the aggregation node are both wired
    /// as children of `best` directly (not of a carryover copy), so the
    /// journal's parent/child links actually reach them.
    pub async fn run_multi_seed_evaluation(&self, journal: &mut Journal, best: &Node) -> Result<Node> {
        let mut dispatches = Vec::with_capacity(self.cfg.num_seeds as usize);
        for seed in 0..self.cfg.num_seeds {
            let worker_id = format!("seed_{seed}_worker");
            let code = seed_code(best, seed);
            let req = self.worker_request(&worker_id, CreationMode::Seed, Some(best), Some(code), None, false);
            dispatches.push(async move { self.dispatch_worker(&worker_id, req).await });
        }

        let mut seed_nodes = Vec::new();
        for result in futures::future::join_all(dispatches).await {
            match result {
                Ok(mut node) => {
                    node.is_seed_node = true;
                    self.emit_node_completed(&journal.stage_name, &node);
                    journal.append(node.clone());
                    seed_nodes.push(node);
                }
                Err(e) => tracing::warn!("seed evaluation task failed or timed out: {e}"),
            }
        }

        let worker_id = "seed_aggregation_worker".to_string();
        let summary = seed_summary(&seed_nodes);
        let req = self.worker_request(&worker_id, CreationMode::SeedAggregation, Some(best), None, Some(summary), false);
        let mut agg = self.dispatch_worker(&worker_id, req).await?;
        agg.is_seed_agg_node = true;
        agg.metric = agg.metric.or_else(|| aggregate_metric(&seed_nodes));
        self.emit_node_completed(&journal.stage_name, &agg);
        journal.append(agg.clone());
        Ok(agg)
    }

    fn emit_node_completed(&self, stage: &str, node: &Node) {
        let summary = serde_json::json!({
            "is_buggy": node.is_buggy,
            "metric": node.metric.as_ref().and_then(|m| m.comparison_key()),
            "is_seed_node": node.is_seed_node,
            "is_seed_agg_node": node.is_seed_agg_node,
        });
        self.emitter.emit(Event::ExperimentNodeCompleted(ExperimentNodeCompletedEvent {
            stage: stage.to_string(),
            node_id: Some(node.id.clone()),
            summary,
        }));
    }
}

/// Locate the `orch-worker` binary next to the currently running executable,
/// the re-exec target for every worker dispatch.
fn worker_binary_path() -> Result<std::path::PathBuf> {
    let current = std::env::current_exe().map_err(Error::from)?;
    Ok(current.with_file_name("orch-worker"))
}

fn aggregate_metric(seed_nodes: &[Node]) -> Option<Metric> {
    let values: Vec<f64> = seed_nodes
        .iter()
        .filter_map(|n| n.metric.as_ref())
        .filter_map(|m| m.comparison_key())
        .collect();
    if values.is_empty() {
        return None;
    }
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    Some(Metric::scalar(mean, true))
}
