//! The solution-tree Node. Parent/child links are string id references, not
//! object pointers — Nodes live in a flat arena owned by the Journal, which
//! keeps serialization and the deep-copy-for-carryover operation simple.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metric::Metric;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
    pub text: String,
}

/// stdout/stderr/exception capture shared by the experiment run, the
/// plotting run, and the metric-parsing run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExecArtifacts {
    #[serde(default)]
    pub term_out: Vec<String>,
    #[serde(default)]
    pub exec_time: f64,
    #[serde(default)]
    pub exc_type: Option<String>,
    #[serde(default)]
    pub exc_info: Option<serde_json::Value>,
    #[serde(default)]
    pub exc_stack: Vec<StackFrame>,
}

impl ExecArtifacts {
    pub fn is_buggy(&self) -> bool {
        self.exc_type.is_some()
    }
}

/// The six creation modes a Node may be produced under, distinguished by
/// the prompt used to generate it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Draft,
    Debug,
    Improve,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub parent_id: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    pub step: Option<usize>,
    pub created_at: DateTime<Utc>,

    pub plan: String,
    pub code: String,
    #[serde(default)]
    pub plot_code: Option<String>,
    #[serde(default)]
    pub plot_plan: Option<String>,
    #[serde(default)]
    pub overall_plan: Option<String>,

    #[serde(default)]
    pub exec: ExecArtifacts,
    #[serde(default)]
    pub plot_exec: ExecArtifacts,

    #[serde(default)]
    pub parse_metrics_plan: Option<String>,
    #[serde(default)]
    pub parse_metrics_code: Option<String>,
    #[serde(default)]
    pub parse_exec: ExecArtifacts,

    #[serde(default)]
    pub analysis: Option<String>,
    #[serde(default)]
    pub metric: Option<Metric>,
    #[serde(default)]
    pub is_buggy: bool,
    #[serde(default)]
    pub is_buggy_plots: Option<bool>,
    #[serde(default)]
    pub vlm_feedback_summary: Vec<String>,
    #[serde(default)]
    pub plot_analyses: Vec<serde_json::Value>,
    #[serde(default)]
    pub datasets_successfully_tested: Vec<String>,
    #[serde(default)]
    pub exec_time_feedback: Option<String>,
    #[serde(default)]
    pub exp_results_dir: Option<String>,
    #[serde(default)]
    pub plots: Vec<String>,
    #[serde(default)]
    pub plot_paths: Vec<String>,

    #[serde(default)]
    pub ablation_name: Option<String>,
    #[serde(default)]
    pub hyperparam_name: Option<String>,
    #[serde(default)]
    pub is_seed_node: bool,
    #[serde(default)]
    pub is_seed_agg_node: bool,
}

impl Node {
    /// A fresh node with a new id and no parent (a draft).
    pub fn new_draft(plan: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            parent_id: None,
            children: Vec::new(),
            step: None,
            created_at: Utc::now(),
            plan: plan.into(),
            code: code.into(),
            plot_code: None,
            plot_plan: None,
            overall_plan: None,
            exec: ExecArtifacts::default(),
            plot_exec: ExecArtifacts::default(),
            parse_metrics_plan: None,
            parse_metrics_code: None,
            parse_exec: ExecArtifacts::default(),
            analysis: None,
            metric: None,
            is_buggy: false,
            is_buggy_plots: None,
            vlm_feedback_summary: Vec::new(),
            plot_analyses: Vec::new(),
            datasets_successfully_tested: Vec::new(),
            exec_time_feedback: None,
            exp_results_dir: None,
            plots: Vec::new(),
            plot_paths: Vec::new(),
            ablation_name: None,
            hyperparam_name: None,
            is_seed_node: false,
            is_seed_agg_node: false,
        }
    }

    /// A node generated as a child of `parent_id`.
    pub fn new_child(parent_id: impl Into<String>, plan: impl Into<String>, code: impl Into<String>) -> Self {
        let mut n = Self::new_draft(plan, code);
        n.parent_id = Some(parent_id.into());
        n
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Recompute `is_buggy` from the execution result and the metric,
    /// matching the invariant: buggy whenever an exception occurred or the
    /// metric is absent/worst.
    pub fn recompute_is_buggy_from_exec(&mut self) {
        if self.exec.is_buggy() {
            self.is_buggy = true;
        }
    }

    pub fn mark_worst_metric_buggy(&mut self) {
        self.metric = Some(Metric::worst());
        self.is_buggy = true;
    }

    /// Reset for carryover into a new stage: keep every field except the
    /// structural links, which would otherwise re-wire this node into the
    /// wrong tree.
    pub fn deep_copy_for_carryover(&self) -> Self {
        let mut copy = self.clone();
        copy.id = Uuid::new_v4().to_string();
        copy.parent_id = None;
        copy.children.clear();
        copy.step = None;
        copy.created_at = Utc::now();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_draft_has_no_parent() {
        let n = Node::new_draft("plan", "code");
        assert!(n.parent_id.is_none());
        assert!(n.is_leaf());
    }

    #[test]
    fn deep_copy_resets_links_but_keeps_fields() {
        let mut n = Node::new_draft("plan", "print(1)");
        n.children.push("child-1".into());
        n.parent_id = Some("parent-1".into());
        n.metric = Some(Metric::scalar(0.9, true));
        let copy = n.deep_copy_for_carryover();
        assert!(copy.parent_id.is_none());
        assert!(copy.children.is_empty());
        assert_ne!(copy.id, n.id);
        assert_eq!(copy.code, n.code);
        assert!(matches!(copy.metric, Some(Metric::Value { .. })));
    }

    #[test]
    fn is_buggy_follows_exception() {
        let mut n = Node::new_draft("p", "c");
        n.exec.exc_type = Some("RuntimeError".into());
        n.recompute_is_buggy_from_exec();
        assert!(n.is_buggy);
    }
}
