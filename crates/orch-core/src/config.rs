//! Run configuration, mirroring the recognized option table. Loaded from
//! YAML by the binary (see `orch` crate) and passed explicitly from there —
//! no module holds an implicit global copy.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageModelConfig {
    pub model: String,
    #[serde(default = "default_temp")]
    pub temp: f64,
}

fn default_temp() -> f64 {
    0.5
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_max_debug_depth")]
    pub max_debug_depth: u32,
    #[serde(default = "default_debug_prob")]
    pub debug_prob: f64,
    #[serde(default = "default_num_drafts")]
    pub num_drafts: u32,
}

fn default_max_debug_depth() -> u32 {
    3
}
fn default_debug_prob() -> f64 {
    0.5
}
fn default_num_drafts() -> u32 {
    5
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            max_debug_depth: default_max_debug_depth(),
            debug_prob: default_debug_prob(),
            num_drafts: default_num_drafts(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StageIterConfig {
    #[serde(default = "default_stage_max_iters")]
    pub stage1_max_iters: u32,
    #[serde(default = "default_stage_max_iters")]
    pub stage2_max_iters: u32,
    #[serde(default = "default_stage_max_iters")]
    pub stage3_max_iters: u32,
    #[serde(default = "default_stage_max_iters")]
    pub stage4_max_iters: u32,
}

fn default_stage_max_iters() -> u32 {
    20
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MultiSeedEvalConfig {
    #[serde(default = "default_num_seeds")]
    pub num_seeds: u32,
}

fn default_num_seeds() -> u32 {
    3
}

impl Default for MultiSeedEvalConfig {
    fn default() -> Self {
        Self {
            num_seeds: default_num_seeds(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_num_workers")]
    pub num_workers: u32,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub stages: StageIterConfig,
    #[serde(default)]
    pub multi_seed_eval: MultiSeedEvalConfig,
    pub code: StageModelConfig,
    pub feedback: StageModelConfig,
    pub vlm_feedback: StageModelConfig,
    #[serde(default)]
    pub k_fold_validation: u32,
}

fn default_num_workers() -> u32 {
    4
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_agent_file_name")]
    pub agent_file_name: String,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout: u64,
}

fn default_timeout() -> u64 {
    3600
}
fn default_agent_file_name() -> String {
    "runfile.py".to_string()
}
fn default_startup_timeout() -> u64 {
    300
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            agent_file_name: default_agent_file_name(),
            startup_timeout: default_startup_timeout(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub num_syn_datasets: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct TelemetryConfig {
    pub database_url: Option<String>,
    pub webhook_url: Option<String>,
    pub webhook_token: Option<String>,
    pub run_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub data_dir: PathBuf,
    pub desc_file: PathBuf,
    pub log_dir: PathBuf,
    pub workspace_dir: PathBuf,
    pub exp_name: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub exec: ExecConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub report: Option<StageModelConfig>,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn max_iterations_for_stage(&self, stage_number: u8) -> u32 {
        match stage_number {
            1 => self.agent.stages.stage1_max_iters,
            2 => self.agent.stages.stage2_max_iters,
            3 => self.agent.stages.stage3_max_iters,
            4 => self.agent.stages.stage4_max_iters,
            other => panic!("invalid stage number {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_iterations_for_stage_dispatches_by_number() {
        let cfg = Config {
            data_dir: "data".into(),
            desc_file: "desc.json".into(),
            log_dir: "logs".into(),
            workspace_dir: "ws".into(),
            exp_name: "run".into(),
            log_level: "info".into(),
            exec: ExecConfig::default(),
            agent: AgentConfig {
                num_workers: 2,
                search: SearchConfig::default(),
                stages: StageIterConfig {
                    stage1_max_iters: 10,
                    stage2_max_iters: 20,
                    stage3_max_iters: 30,
                    stage4_max_iters: 40,
                },
                multi_seed_eval: MultiSeedEvalConfig::default(),
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
        };
        assert_eq!(cfg.max_iterations_for_stage(3), 30);
    }
}
