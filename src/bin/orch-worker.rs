//! orch-worker — the re-exec target every pool dispatch spawns into. Also
//! runnable by hand to reproduce or debug one node in isolation.
//!
//! Usage: orch-worker <request.json>
//!
//! The request file describes one dispatch: creation mode, optional parent
//! node, workspace root, and model/timeout settings, written by the Parallel
//! Agent before spawning. The resulting node is printed to stdout as JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orch_exec::GpuAllocator;
use orch_llm::{AnthropicOracle, Oracle};
use orch_worker::{run_worker_task, WorkerContext, WorkerRequest};

#[derive(Parser)]
#[command(name = "orch-worker", about = "Run one worker task in isolation", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Path to a JSON request describing the dispatch
    request: PathBuf,
}

/// Runs as the re-exec target for every pool dispatch, so GPU assignment is
/// never redone here: it arrives purely via an inherited `CUDA_VISIBLE_DEVICES`
/// set by the parent before spawning, and the allocator below stays disabled.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let text = std::fs::read_to_string(&cli.request)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", cli.request.display()))?;
    let req: WorkerRequest = serde_json::from_str(&text)
        .map_err(|e| anyhow::anyhow!("failed to parse {}: {e}", cli.request.display()))?;

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
    let oracle: Arc<dyn Oracle> = Arc::new(AnthropicOracle::new(api_key));
    let gpu = Arc::new(GpuAllocator::new(0));

    std::fs::create_dir_all(&req.workspace_root)?;
    let ctx = WorkerContext {
        oracle,
        gpu,
        workspace_root: req.workspace_root.clone(),
        agent_file_name: req.agent_file_name.clone(),
        exec_timeout_secs: req.exec_timeout_secs,
        startup_timeout_secs: req.startup_timeout_secs,
        code_model: req.code_model.clone(),
        code_temp: req.code_temp,
        feedback_model: req.feedback_model.clone(),
        feedback_temp: req.feedback_temp,
        task_description: req.task_description.clone(),
        run_plotting: req.run_plotting,
    };

    let node = run_worker_task(&ctx, &req.worker_id, req.task_spec()).await?;
    println!("{}", serde_json::to_string_pretty(&node)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "orch_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
