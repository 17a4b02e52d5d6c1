//! The parallel agent: node selection policy plus the dispatch/collection
//! loop that drives one breadth-first tree-search iteration, and the
//! post-stage multi-seed evaluation.

pub mod parallel_agent;
pub mod selection;

pub use parallel_agent::{ParallelAgent, ParallelAgentConfig};
pub use selection::{Selection, SelectionConfig};
