//! Node selection policy: which nodes get handed to the worker pool this
//! iteration. Draft/debug/improve for the general case, with stage-specific
//! fast paths for hyperparameter tuning (stage 2) and ablation (stage 4).

use std::collections::HashSet;

use orch_core::{Journal, Node};
use rand::Rng;

/// What to hand a worker: a fresh draft, or a parent to branch from. The
/// worker itself decides draft/debug/improve from this plus the parent's
/// buggy status, the same way `Journal::stage_kind` does.
pub enum Selection {
    Draft,
    FromParent(Node),
}

pub struct SelectionConfig {
    pub num_drafts: u32,
    pub debug_prob: f64,
    pub max_debug_depth: u32,
}

/// Select up to `num_workers` nodes to process this iteration.
///
/// `stage_slug` drives two stage-specific fast paths: `"stage_2_*"` always
/// proposes from `carryover_primary` (the stage 1 winner); `"stage_4_*"`
/// always proposes from `carryover_primary` (the stage 3 winner). Any other
/// stage runs the general draft/debug/improve policy.
pub fn select_parallel_nodes(
    journal: &Journal,
    cfg: &SelectionConfig,
    stage_slug: &str,
    num_workers: u32,
    carryover_primary: Option<&Node>,
) -> Vec<Selection> {
    let mut selected = Vec::new();
    let mut processed_trees: HashSet<String> = HashSet::new();
    let viable_trees = journal.viable_trees();

    while selected.len() < num_workers as usize {
        let draft_count = journal.draft_nodes().count() as u32;
        if draft_count < cfg.num_drafts {
            selected.push(Selection::Draft);
            continue;
        }

        if stage_slug.starts_with("stage_4") {
            match carryover_primary {
                Some(n) => selected.push(Selection::FromParent(n.clone())),
                None => selected.push(Selection::Draft),
            }
            continue;
        }
        if stage_slug.starts_with("stage_2") {
            match carryover_primary {
                Some(n) => selected.push(Selection::FromParent(n.clone())),
                None => selected.push(Selection::Draft),
            }
            continue;
        }

        if rand::thread_rng().gen_bool(cfg.debug_prob.clamp(0.0, 1.0)) {
            let debuggable: Vec<&Node> = journal
                .buggy_nodes()
                .filter(|n| n.is_leaf() && journal.debug_depth(n) <= cfg.max_debug_depth)
                .collect();
            if !debuggable.is_empty() {
                let idx = rand::thread_rng().gen_range(0..debuggable.len());
                let node = debuggable[idx];
                let root_id = journal.root_of(node).id.clone();
                if processed_trees.len() >= viable_trees.len() || !processed_trees.contains(&root_id) {
                    processed_trees.insert(root_id);
                    selected.push(Selection::FromParent(node.clone()));
                    continue;
                }
            }
        }

        let good_nodes: Vec<&Node> = journal.good_nodes().collect();
        if good_nodes.is_empty() {
            selected.push(Selection::Draft);
            continue;
        }
        match journal.best_node_by_metric(true) {
            None => selected.push(Selection::Draft),
            Some(best) => {
                let root_id = journal.root_of(best).id.clone();
                if processed_trees.len() >= viable_trees.len() || !processed_trees.contains(&root_id) {
                    processed_trees.insert(root_id);
                    selected.push(Selection::FromParent(best.clone()));
                    continue;
                }
                // best node's tree already processed this round: fall through to the
                // next-best candidate from an unprocessed tree.
                let mut ranked: Vec<&Node> = good_nodes.clone();
                ranked.sort_by(|a, b| {
                    let ma = a.metric.as_ref();
                    let mb = b.metric.as_ref();
                    match (ma, mb) {
                        (Some(ma), Some(mb)) if ma.better_than(mb) => std::cmp::Ordering::Less,
                        (Some(ma), Some(mb)) if mb.better_than(ma) => std::cmp::Ordering::Greater,
                        _ => std::cmp::Ordering::Equal,
                    }
                });
                let mut picked = false;
                for node in ranked {
                    let root_id = journal.root_of(node).id.clone();
                    if processed_trees.len() >= viable_trees.len() || !processed_trees.contains(&root_id) {
                        processed_trees.insert(root_id);
                        selected.push(Selection::FromParent(node.clone()));
                        picked = true;
                        break;
                    }
                }
                if !picked {
                    selected.push(Selection::Draft);
                }
            }
        }
    }

    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use orch_core::Metric;

    fn cfg() -> SelectionConfig {
        SelectionConfig {
            num_drafts: 2,
            debug_prob: 0.0,
            max_debug_depth: 3,
        }
    }

    #[test]
    fn drafts_until_num_drafts_reached() {
        let journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        let selection = select_parallel_nodes(&journal, &cfg(), "stage_1", 2, None);
        assert_eq!(selection.len(), 2);
        assert!(selection.iter().all(|s| matches!(s, Selection::Draft)));
    }

    #[test]
    fn stage_2_always_proposes_from_carryover() {
        let mut journal = Journal::new("run", "stage_2_hyperparam_tuning_1_first_attempt");
        journal.append(Node::new_draft("p", "c"));
        journal.append(Node::new_draft("p", "c"));
        let carryover = Node::new_draft("carryover-plan", "carryover-code");
        let selection = select_parallel_nodes(&journal, &cfg(), "stage_2_hyperparam_tuning", 1, Some(&carryover));
        match &selection[0] {
            Selection::FromParent(n) => assert_eq!(n.code, "carryover-code"),
            Selection::Draft => panic!("expected carryover selection"),
        }
    }

    #[test]
    fn falls_back_to_draft_when_no_good_nodes() {
        let mut journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        journal.append(Node::new_draft("p", "c"));
        let mut buggy = Node::new_draft("p", "c");
        buggy.is_buggy = true;
        journal.append(buggy);
        let selection = select_parallel_nodes(&journal, &cfg(), "stage_1", 1, None);
        assert!(matches!(selection[0], Selection::Draft));
    }

    #[test]
    fn improve_phase_picks_best_node() {
        let mut journal = Journal::new("run", "stage_1_initial_implementation_1_first_attempt");
        journal.append(Node::new_draft("p", "c"));
        journal.append(Node::new_draft("p", "c"));
        let mut best = Node::new_draft("p", "c");
        best.metric = Some(Metric::scalar(0.9, true));
        let best_id = best.id.clone();
        journal.append(best);
        let selection = select_parallel_nodes(&journal, &cfg(), "stage_1", 1, None);
        match &selection[0] {
            Selection::FromParent(n) => assert_eq!(n.id, best_id),
            Selection::Draft => panic!("expected best-node selection"),
        }
    }
}
