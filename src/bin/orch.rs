//! orch — tree-search experiment orchestrator.
//!
//! Usage:
//!   orch <config.yaml>
//!   orch <config.yaml> --resume <run_name_or_number>

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orch_core::Config;
use orch_exec::GpuAllocator;
use orch_llm::{AnthropicOracle, Oracle};
use orch_stages::AgentManager;
use orch_telemetry::{bounded, Event, EventStore, RunLogEvent, TelemetryWriter, WebhookClient};

#[derive(Parser)]
#[command(
    name = "orch",
    about = "Tree-search experiment orchestrator",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Path to the run's YAML configuration file
    config: PathBuf,

    /// Resume an existing run by name or index instead of starting fresh
    #[arg(long)]
    resume: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;

    let (run_dir, run_id) = resolve_run_dir(&cfg, cli.resume.as_deref())?;
    let _log_guard = init_tracing(&cfg.log_dir, &cfg.log_level, &run_id)?;

    if let Err(e) = run(cfg, run_dir, run_id).await {
        tracing::error!(error = ?e, "run failed");
        return Err(e);
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
    serde_yaml::from_str(&text)
        .map_err(|e| anyhow::anyhow!("failed to parse config {}: {e}", path.display()))
}

fn init_tracing(log_dir: &Path, log_level: &str, run_id: &str) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::never(log_dir, format!("{run_id}.log"));
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("orch={log_level},orch_agent={log_level},orch_stages={log_level},orch_worker={log_level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
        .init();
    Ok(guard)
}

/// `<workspace_dir>/<n>-<exp_name>`, the next free integer index unless
/// `resume` names an existing run (by exact directory name or bare index).
fn resolve_run_dir(cfg: &Config, resume: Option<&str>) -> anyhow::Result<(PathBuf, String)> {
    std::fs::create_dir_all(&cfg.workspace_dir)?;
    if let Some(resume) = resume {
        let dir = find_existing_run(&cfg.workspace_dir, resume)?;
        let run_id = dir
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("malformed run directory {}", dir.display()))?
            .to_string_lossy()
            .to_string();
        return Ok((dir, run_id));
    }
    let next_index = next_run_index(&cfg.workspace_dir)?;
    let run_id = format!("{next_index}-{}", cfg.exp_name);
    let dir = cfg.workspace_dir.join(&run_id);
    std::fs::create_dir_all(&dir)?;
    Ok((dir, run_id))
}

fn next_run_index(workspace_dir: &Path) -> anyhow::Result<u32> {
    let mut max_index = 0u32;
    for entry in std::fs::read_dir(workspace_dir)? {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            if let Some((idx, _)) = name.split_once('-') {
                if let Ok(idx) = idx.parse::<u32>() {
                    max_index = max_index.max(idx);
                }
            }
        }
    }
    Ok(max_index + 1)
}

fn find_existing_run(workspace_dir: &Path, resume: &str) -> anyhow::Result<PathBuf> {
    let direct = workspace_dir.join(resume);
    if direct.is_dir() {
        return Ok(direct);
    }
    for entry in std::fs::read_dir(workspace_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name == resume || name.starts_with(&format!("{resume}-")) {
            return Ok(entry.path());
        }
    }
    anyhow::bail!("no existing run matching '{resume}' found under {}", workspace_dir.display())
}

async fn run(cfg: Config, run_dir: PathBuf, run_id: String) -> anyhow::Result<()> {
    let task_description = std::fs::read_to_string(&cfg.desc_file)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", cfg.desc_file.display()))?;
    std::fs::write(run_dir.join("research_idea.md"), &task_description)?;

    let api_key = std::env::var("ANTHROPIC_API_KEY")
        .map_err(|_| anyhow::anyhow!("ANTHROPIC_API_KEY not set"))?;
    let oracle: Arc<dyn Oracle> = Arc::new(AnthropicOracle::new(api_key));
    let gpu = Arc::new(GpuAllocator::probe(cfg.agent.num_workers as usize));

    let (emitter, rx) = bounded(orch_telemetry::DEFAULT_QUEUE_MAXSIZE);
    let store = cfg.telemetry.database_url.as_ref().map(|url| EventStore::new(url.clone(), run_id.clone()));
    let webhook = match (&cfg.telemetry.webhook_url, &cfg.telemetry.webhook_token) {
        (Some(url), Some(token)) => Some(Arc::new(WebhookClient::new(url.clone(), token.clone(), run_id.clone()))),
        (Some(url), None) => Some(Arc::new(WebhookClient::new(url.clone(), "", run_id.clone()))),
        (None, _) => None,
    };
    let writer = TelemetryWriter::spawn(rx, store, webhook.clone());

    if let Some(webhook) = &webhook {
        webhook.publish_run_started().await;
    }

    let mut manager = AgentManager::new(cfg, run_dir, oracle, gpu, run_id, task_description, emitter.clone());

    let outcome = tokio::select! {
        result = manager.run() => result.map_err(anyhow::Error::from),
        _ = tokio::signal::ctrl_c() => {
            emitter.emit(Event::RunLog(RunLogEvent {
                message: "received SIGINT, shutting down".to_string(),
                level: "warn".to_string(),
            }));
            Ok(())
        }
    };

    if let Some(webhook) = &webhook {
        let (success, message) = match &outcome {
            Ok(()) => (true, None),
            Err(e) => (false, Some(e.to_string())),
        };
        webhook.publish_run_finished(success, message.as_deref()).await;
    }

    drop(emitter);
    drop(manager);
    writer.shutdown().await;
    outcome
}
