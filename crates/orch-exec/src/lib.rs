//! GPU mutual exclusion and sandboxed code execution for the worker pool.

pub mod gpu;
pub mod interpreter;

pub use gpu::GpuAllocator;
pub use interpreter::{ExecutionResult, Interpreter};
