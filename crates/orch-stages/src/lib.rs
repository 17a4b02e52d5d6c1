//! Stage orchestration: the four fixed main stages of a tree-search
//! experiment run (baseline, hyperparameter tuning, creative exploration,
//! ablation) and the Agent Manager that drives a run through them.

pub mod agent_manager;
pub mod stage;
pub mod stages;

pub use agent_manager::{AgentManager, StageTransition};
pub use stage::{CompletionCheck, Stage};
pub use stages::{Stage1Baseline, Stage2Tuning, Stage3Plotting, Stage4Ablation};
