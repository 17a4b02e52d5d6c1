//! Error taxonomy for the orchestration core.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no GPUs available for worker {worker_id}")]
    NoGpusAvailable { worker_id: String },

    #[error("interpreter child for {workspace} did not signal ready within {timeout_s}s")]
    ChildDidNotStart { workspace: String, timeout_s: u64 },

    #[error("interpreter run exceeded timeout")]
    InterpreterTimeout,

    #[error("llm parsing failure after {attempts} attempts: {reason}")]
    LlmParseFailure { attempts: u32, reason: String },

    #[error("gpu-targeting validation failed after {attempts} attempts for gpu {gpu_id}")]
    GpuValidationFailure { attempts: u32, gpu_id: usize },

    #[error("metric parse failure: {reason}")]
    MetricParseFailure { reason: String },

    #[error("worker pool task {worker_id} timed out")]
    WorkerTimeout { worker_id: String },

    #[error("worker pool task {worker_id} failed: {reason}")]
    WorkerFailed { worker_id: String, reason: String },

    #[error("telemetry sink error: {0}")]
    Telemetry(String),

    #[error("stage configuration error: {0}")]
    StageConfig(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("node {0} not found in journal")]
    NodeNotFound(String),

    #[error("run terminated: {0}")]
    RunTerminated(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn no_gpus_available(worker_id: impl Into<String>) -> Self {
        Error::NoGpusAvailable {
            worker_id: worker_id.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }
}
