//! The worker task: generate, validate, execute, review, and score one
//! node. Invoked either in-process by the parallel agent (tests, small
//! runs) or from the `orch-worker` re-exec'd subcommand binary.

pub mod task;

pub use task::{run_worker_task, seed_code, seed_summary, CreationMode, TaskSpec, WorkerContext, WorkerRequest};
