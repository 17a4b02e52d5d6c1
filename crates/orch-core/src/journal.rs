//! Journal: the append-only solution tree for one substage, plus the
//! metric-only best-node path. LLM-oracle-based best-node selection lives
//! one layer up (it needs a live oracle client), so it is not implemented
//! here — see `orch_stages::best_node`.

use serde::{Deserialize, Serialize};

use crate::node::{Node, StageKind};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Journal {
    pub run_id: String,
    pub stage_name: String,
    pub code_model: String,
    pub code_temp: f64,
    pub feedback_model: String,
    pub feedback_temp: f64,
    nodes: Vec<Node>,
}

impl Journal {
    pub fn new(run_id: impl Into<String>, stage_name: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage_name: stage_name.into(),
            code_model: String::new(),
            code_temp: 1.0,
            feedback_model: String::new(),
            feedback_temp: 0.5,
            nodes: Vec::new(),
        }
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append a node, wiring up its `step` index and its parent's children
    /// set. The node must not already be present (by id).
    pub fn append(&mut self, mut node: Node) -> &Node {
        let step = self.nodes.len();
        node.step = Some(step);
        if let Some(parent_id) = node.parent_id.clone() {
            if let Some(parent) = self.nodes.iter_mut().find(|n| n.id == parent_id) {
                parent.children.push(node.id.clone());
            }
        }
        self.nodes.push(node);
        self.nodes.last().expect("just pushed")
    }

    pub fn get_node_by_id(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn get_node_by_id_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    pub fn draft_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.parent_id.is_none())
    }

    pub fn buggy_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().filter(|n| n.is_buggy)
    }

    pub fn good_nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes
            .iter()
            .filter(|n| !n.is_buggy && n.is_buggy_plots != Some(true))
    }

    /// draft if no parent; debug if the parent is buggy; improve otherwise.
    pub fn stage_kind(&self, node: &Node) -> StageKind {
        match &node.parent_id {
            None => StageKind::Draft,
            Some(parent_id) => match self.get_node_by_id(parent_id) {
                Some(parent) if parent.is_buggy => StageKind::Debug,
                _ => StageKind::Improve,
            },
        }
    }

    /// Length of the run of consecutive buggy ancestors ending at this node
    /// (inclusive of the node's own buggy status).
    pub fn debug_depth(&self, node: &Node) -> u32 {
        if !node.is_buggy {
            return 0;
        }
        let mut depth = 1;
        let mut current = node.parent_id.clone();
        while let Some(id) = current {
            match self.get_node_by_id(&id) {
                Some(parent) if parent.is_buggy => {
                    depth += 1;
                    current = parent.parent_id.clone();
                }
                _ => break,
            }
        }
        depth
    }

    /// Walk parent links to the tree root.
    pub fn root_of<'a>(&'a self, node: &'a Node) -> &'a Node {
        let mut current = node;
        while let Some(parent_id) = &current.parent_id {
            match self.get_node_by_id(parent_id) {
                Some(parent) => current = parent,
                None => break,
            }
        }
        current
    }

    pub fn leaves_of<'a>(&'a self, root: &'a Node) -> Vec<&'a Node> {
        let mut out = Vec::new();
        self.collect_leaves(root, &mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, node: &'a Node, out: &mut Vec<&'a Node>) {
        if node.is_leaf() {
            out.push(node);
            return;
        }
        for child_id in &node.children {
            if let Some(child) = self.get_node_by_id(child_id) {
                self.collect_leaves(child, out);
            }
        }
    }

    /// Root nodes whose leaf set is not entirely buggy.
    pub fn viable_trees(&self) -> Vec<&Node> {
        self.draft_nodes()
            .filter(|root| {
                let leaves = self.leaves_of(root);
                leaves.iter().any(|l| !l.is_buggy)
            })
            .collect()
    }

    /// Metric-only best node: the highest-ranked candidate by `Metric::better_than`,
    /// optionally restricted to good nodes, excluding seed nodes unless doing
    /// so would empty the candidate set.
    pub fn best_node_by_metric(&self, only_good: bool) -> Option<&Node> {
        let candidates: Vec<&Node> = self.metric_candidates(only_good);
        candidates
            .into_iter()
            .filter(|n| n.metric.is_some())
            .max_by(|a, b| {
                let ma = a.metric.as_ref().unwrap();
                let mb = b.metric.as_ref().unwrap();
                if ma.better_than(mb) {
                    std::cmp::Ordering::Greater
                } else if mb.better_than(ma) {
                    std::cmp::Ordering::Less
                } else {
                    std::cmp::Ordering::Equal
                }
            })
    }

    /// Candidate set for best-node selection: optionally good-only, with
    /// seed nodes excluded unless that would leave nothing.
    pub fn metric_candidates(&self, only_good: bool) -> Vec<&Node> {
        let base: Vec<&Node> = if only_good {
            self.good_nodes().collect()
        } else {
            self.nodes.iter().collect()
        };
        let without_seeds: Vec<&Node> = base.iter().copied().filter(|n| !n.is_seed_node).collect();
        if without_seeds.is_empty() {
            base
        } else {
            without_seeds
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Metric;
    use crate::node::Node;

    fn journal() -> Journal {
        Journal::new("run-1", "stage_1_initial_implementation_1_first_attempt")
    }

    #[test]
    fn append_assigns_step_and_wires_children() {
        let mut j = journal();
        let root = Node::new_draft("plan", "code");
        let root_id = root.id.clone();
        j.append(root);
        let child = Node::new_child(root_id.clone(), "plan2", "code2");
        j.append(child.clone());
        assert_eq!(j.get_node_by_id(&root_id).unwrap().children, vec![child.id.clone()]);
        assert_eq!(j.get_node_by_id(&child.id).unwrap().step, Some(1));
    }

    #[test]
    fn good_and_buggy_are_disjoint() {
        let mut j = journal();
        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        let mut good = Node::new_draft("p", "c");
        good.metric = Some(Metric::scalar(1.0, true));
        j.append(buggy);
        j.append(good);
        let good_ids: Vec<&str> = j.good_nodes().map(|n| n.id.as_str()).collect();
        let buggy_ids: Vec<&str> = j.buggy_nodes().map(|n| n.id.as_str()).collect();
        assert!(good_ids.iter().all(|id| !buggy_ids.contains(id)));
    }

    #[test]
    fn debug_depth_counts_consecutive_buggy_ancestors() {
        let mut j = journal();
        let mut root = Node::new_draft("p", "c");
        root.is_buggy = true;
        let root_id = root.id.clone();
        j.append(root);
        let mut mid = Node::new_child(root_id.clone(), "p", "c");
        mid.is_buggy = true;
        let mid_id = mid.id.clone();
        j.append(mid);
        let leaf = Node::new_child(mid_id.clone(), "p", "c");
        let leaf_id = leaf.id.clone();
        j.append(leaf);

        let leaf_ref = j.get_node_by_id(&leaf_id).unwrap().clone();
        assert_eq!(j.debug_depth(&leaf_ref), 0);
        let mid_ref = j.get_node_by_id(&mid_id).unwrap().clone();
        assert_eq!(j.debug_depth(&mid_ref), 2);
    }

    #[test]
    fn best_node_by_metric_prefers_better_metric() {
        let mut j = journal();
        let mut a = Node::new_draft("p", "c");
        a.metric = Some(Metric::scalar(0.5, true));
        let mut b = Node::new_draft("p", "c");
        b.metric = Some(Metric::scalar(0.9, true));
        let b_id = b.id.clone();
        j.append(a);
        j.append(b);
        assert_eq!(j.best_node_by_metric(false).unwrap().id, b_id);
    }

    #[test]
    fn best_node_with_all_buggy_returns_none_only_good() {
        let mut j = journal();
        let mut a = Node::new_draft("p", "c");
        a.is_buggy = true;
        j.append(a);
        assert!(j.best_node_by_metric(true).is_none());
    }

    #[test]
    fn root_of_walks_to_tree_root() {
        let mut j = journal();
        let root = Node::new_draft("p", "c");
        let root_id = root.id.clone();
        j.append(root);
        let child = Node::new_child(root_id.clone(), "p", "c");
        let child_id = child.id.clone();
        j.append(child);
        let child_ref = j.get_node_by_id(&child_id).unwrap().clone();
        assert_eq!(j.root_of(&child_ref).id, root_id);
    }
}
