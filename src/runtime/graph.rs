/// Incremental Kahn-style dependency resolution
///
/// A `DependencyGraph` is built once per run from the definition snapshot and
/// then only mutated by completion events. Callers must serialize mutations
/// per run (the coordinator holds the run lock around every read-modify-write).

use crate::workflow::types::Workflow;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyGraph {
    /// Node ids in definition order
    pub node_order: Vec<String>,
    /// node -> predecessors
    pub incoming_edges: HashMap<String, Vec<String>>,
    /// node -> successors
    pub outgoing_edges: HashMap<String, Vec<String>>,
    /// Predecessors not yet released by a completion
    pub in_degree: HashMap<String, usize>,
    pub completed_nodes: HashSet<String>,
    pub failed_nodes: HashSet<String>,
    /// Never released: descendants of a failed node, and nodes outside the
    /// entry scope of a run started mid-graph
    pub blocked_nodes: HashSet<String>,
    /// Outside the entry scope; always part of `blocked_nodes`
    #[serde(default)]
    pub out_of_scope_nodes: HashSet<String>,
    /// Nodes already handed to the dispatch channel
    pub dispatched_nodes: HashSet<String>,
}

impl DependencyGraph {
    /// Build adjacency and in-degrees in one pass over nodes and edges
    pub fn build(workflow: &Workflow) -> Self {
        let mut node_order = Vec::with_capacity(workflow.nodes.len());
        let mut incoming_edges = HashMap::new();
        let mut outgoing_edges = HashMap::new();
        let mut in_degree = HashMap::new();

        for node in &workflow.nodes {
            node_order.push(node.id.clone());
            incoming_edges.insert(node.id.clone(), Vec::new());
            outgoing_edges.insert(node.id.clone(), Vec::new());
            in_degree.insert(node.id.clone(), 0usize);
        }

        for edge in &workflow.edges {
            if !in_degree.contains_key(&edge.source) || !in_degree.contains_key(&edge.target) {
                tracing::warn!(
                    "⚠️ Ignoring edge '{}' with unknown endpoint: {} -> {}",
                    edge.id,
                    edge.source,
                    edge.target
                );
                continue;
            }
            if let Some(successors) = outgoing_edges.get_mut(&edge.source) {
                successors.push(edge.target.clone());
            }
            if let Some(predecessors) = incoming_edges.get_mut(&edge.target) {
                predecessors.push(edge.source.clone());
            }
            if let Some(degree) = in_degree.get_mut(&edge.target) {
                *degree += 1;
            }
        }

        Self {
            node_order,
            incoming_edges,
            outgoing_edges,
            in_degree,
            completed_nodes: HashSet::new(),
            failed_nodes: HashSet::new(),
            blocked_nodes: HashSet::new(),
            out_of_scope_nodes: HashSet::new(),
            dispatched_nodes: HashSet::new(),
        }
    }

    pub fn total_nodes(&self) -> usize {
        self.node_order.len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.in_degree.contains_key(node_id)
    }

    /// All unblocked nodes with in-degree zero, in definition order
    ///
    /// Empty for a non-empty graph means every node waits on another: the
    /// definition is cyclic and the run must fail instead of idling forever.
    pub fn initial_ready(&self) -> Vec<String> {
        self.node_order
            .iter()
            .filter(|id| self.in_degree.get(*id) == Some(&0))
            .filter(|id| !self.blocked_nodes.contains(*id) && !self.is_terminal(id))
            .cloned()
            .collect()
    }

    pub fn predecessors(&self, node_id: &str) -> &[String] {
        self.incoming_edges
            .get(node_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn mark_dispatched<I, S>(&mut self, node_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dispatched_nodes
            .extend(node_ids.into_iter().map(Into::into));
    }

    /// Whether a completion for this node has already been applied
    pub fn is_terminal(&self, node_id: &str) -> bool {
        self.completed_nodes.contains(node_id) || self.failed_nodes.contains(node_id)
    }

    /// Record a successful completion and release its successors
    ///
    /// Returns the successors whose in-degree reached zero with this call and
    /// that were never dispatched, blocked, or finished. Re-applying the same
    /// completion returns nothing and leaves the graph untouched.
    pub fn on_completed(&mut self, node_id: &str) -> Vec<String> {
        if !self.contains(node_id) || self.is_terminal(node_id) {
            return Vec::new();
        }

        self.blocked_nodes.remove(node_id);
        self.completed_nodes.insert(node_id.to_string());

        let successors = self
            .outgoing_edges
            .get(node_id)
            .cloned()
            .unwrap_or_default();

        let mut newly_ready = Vec::new();
        for successor in successors {
            let Some(degree) = self.in_degree.get_mut(&successor) else {
                continue;
            };
            let before = *degree;
            *degree = before.saturating_sub(1);

            if before == 1
                && !self.dispatched_nodes.contains(&successor)
                && !self.blocked_nodes.contains(&successor)
                && !self.is_terminal(&successor)
            {
                newly_ready.push(successor);
            }
        }

        newly_ready
    }

    /// Record a failure and block every not-yet-terminal descendant
    ///
    /// Returns false when the node was already terminal (duplicate delivery).
    /// Sibling branches that do not depend on the node are unaffected.
    pub fn on_failed(&mut self, node_id: &str) -> bool {
        if !self.contains(node_id) || self.is_terminal(node_id) {
            return false;
        }

        self.blocked_nodes.remove(node_id);
        self.failed_nodes.insert(node_id.to_string());

        self.block_descendants(node_id);
        true
    }

    fn block_descendants(&mut self, node_id: &str) {
        let mut queue: VecDeque<String> = self
            .outgoing_edges
            .get(node_id)
            .cloned()
            .unwrap_or_default()
            .into();

        while let Some(current) = queue.pop_front() {
            if self.is_terminal(&current) || !self.blocked_nodes.insert(current.clone()) {
                continue;
            }
            if let Some(next) = self.outgoing_edges.get(&current) {
                queue.extend(next.iter().cloned());
            }
        }
    }

    /// Forget any terminal mark on a node so it can run again
    ///
    /// Used by resume-at-node, which deliberately ignores the node's own
    /// predecessors. Its successors still wait for all of theirs: a completed
    /// node takes back the in-degree it released, and a failed node lifts the
    /// blocks that only it imposed.
    pub fn reopen(&mut self, node_id: &str) {
        if !self.contains(node_id) {
            return;
        }

        if self.completed_nodes.remove(node_id) {
            let successors = self
                .outgoing_edges
                .get(node_id)
                .cloned()
                .unwrap_or_default();
            for successor in successors {
                if let Some(degree) = self.in_degree.get_mut(&successor) {
                    *degree += 1;
                }
            }
        }

        let was_failed = self.failed_nodes.remove(node_id);
        self.out_of_scope_nodes.remove(node_id);
        self.blocked_nodes.remove(node_id);
        self.dispatched_nodes.insert(node_id.to_string());

        if was_failed {
            self.rebuild_blocked();
        }
    }

    /// Blocked set from scratch: out-of-scope nodes plus the non-terminal
    /// descendants of every node still failed
    fn rebuild_blocked(&mut self) {
        self.blocked_nodes = self.out_of_scope_nodes.clone();
        let failed: Vec<String> = self.failed_nodes.iter().cloned().collect();
        for node_id in failed {
            self.block_descendants(&node_id);
        }
    }

    /// Restrict a fresh graph to what is reachable from `entry_id`
    ///
    /// Nodes that cannot be reached from the entry are blocked, and reachable
    /// nodes only wait on reachable predecessors, so a run started mid-graph
    /// still resolves to completion. The entry becomes the only ready node.
    pub fn scope_to_entry(&mut self, entry_id: &str) {
        if !self.contains(entry_id) {
            return;
        }

        let mut reachable = HashSet::from([entry_id.to_string()]);
        let mut queue = VecDeque::from([entry_id.to_string()]);
        while let Some(current) = queue.pop_front() {
            for next in self.outgoing_edges.get(&current).into_iter().flatten() {
                if reachable.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }

        for node_id in &self.node_order {
            if node_id == entry_id {
                self.in_degree.insert(node_id.clone(), 0);
            } else if reachable.contains(node_id) {
                let waiting = self
                    .predecessors(node_id)
                    .iter()
                    .filter(|p| reachable.contains(*p))
                    .count();
                self.in_degree.insert(node_id.clone(), waiting);
            } else {
                self.blocked_nodes.insert(node_id.clone());
                self.out_of_scope_nodes.insert(node_id.clone());
            }
        }
    }

    /// Every node is completed, failed, or permanently blocked
    pub fn is_complete(&self) -> bool {
        self.completed_nodes.len() + self.failed_nodes.len() + self.blocked_nodes.len()
            == self.total_nodes()
    }

    pub fn has_failures(&self) -> bool {
        !self.failed_nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::{Edge, Node};

    fn workflow(nodes: &[&str], edges: &[(&str, &str)]) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: "graph".into(),
            owner_id: None,
            nodes: nodes.iter().map(|id| Node::new(*id, "noop")).collect(),
            edges: edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
        }
    }

    #[test]
    fn build_counts_in_degree_and_adjacency() {
        let graph = DependencyGraph::build(&workflow(
            &["a", "b", "c"],
            &[("a", "c"), ("b", "c")],
        ));

        assert_eq!(graph.in_degree["c"], 2);
        assert_eq!(graph.in_degree["a"], 0);
        assert_eq!(graph.predecessors("c"), &["a".to_string(), "b".to_string()]);
        assert_eq!(graph.outgoing_edges["a"], vec!["c".to_string()]);
        assert_eq!(graph.initial_ready(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn linear_chain_releases_one_node_at_a_time() {
        let mut graph = DependencyGraph::build(&workflow(
            &["start", "calc", "end"],
            &[("start", "calc"), ("calc", "end")],
        ));
        assert_eq!(graph.initial_ready(), vec!["start".to_string()]);

        assert_eq!(graph.on_completed("start"), vec!["calc".to_string()]);
        assert!(!graph.is_complete());
        assert_eq!(graph.on_completed("calc"), vec!["end".to_string()]);
        assert!(graph.on_completed("end").is_empty());
        assert!(graph.is_complete());
        assert!(!graph.has_failures());
    }

    #[test]
    fn fan_out_releases_both_branches_together() {
        let mut graph =
            DependencyGraph::build(&workflow(&["r", "a", "b"], &[("r", "a"), ("r", "b")]));

        assert_eq!(
            graph.on_completed("r"),
            vec!["a".to_string(), "b".to_string()]
        );
        graph.on_completed("a");
        assert!(!graph.is_complete());
        graph.on_completed("b");
        assert!(graph.is_complete());
    }

    #[test]
    fn join_waits_for_every_predecessor() {
        let mut graph = DependencyGraph::build(&workflow(
            &["a", "b", "join"],
            &[("a", "join"), ("b", "join")],
        ));

        assert!(graph.on_completed("a").is_empty());
        assert_eq!(graph.in_degree["join"], 1);
        assert_eq!(graph.on_completed("b"), vec!["join".to_string()]);
    }

    #[test]
    fn failure_blocks_subtree_but_not_siblings() {
        // root -> a -> c, root -> b
        let mut graph = DependencyGraph::build(&workflow(
            &["root", "a", "b", "c"],
            &[("root", "a"), ("root", "b"), ("a", "c")],
        ));
        graph.on_completed("root");

        assert!(graph.on_failed("a"));
        assert!(graph.blocked_nodes.contains("c"));
        assert!(!graph.is_complete());

        assert!(graph.on_completed("b").is_empty());
        assert!(graph.is_complete());
        assert!(graph.has_failures());
        assert!(!graph.completed_nodes.contains("c"));
    }

    #[test]
    fn blocked_join_is_never_released() {
        // a fails, b completes; join depends on both
        let mut graph = DependencyGraph::build(&workflow(
            &["a", "b", "join"],
            &[("a", "join"), ("b", "join")],
        ));
        graph.on_failed("a");
        let ready = graph.on_completed("b");

        assert!(ready.is_empty());
        assert!(graph.is_complete());
    }

    #[test]
    fn reapplying_a_completion_is_a_no_op() {
        let mut once = DependencyGraph::build(&workflow(
            &["a", "b", "c"],
            &[("a", "b"), ("a", "c")],
        ));
        once.on_completed("a");

        let mut twice = once.clone();
        assert!(twice.on_completed("a").is_empty());
        assert_eq!(once, twice);

        assert!(twice.on_failed("b"));
        let snapshot = twice.clone();
        assert!(!twice.on_failed("b"));
        assert!(twice.on_completed("b").is_empty());
        assert_eq!(snapshot, twice);
    }

    #[test]
    fn dispatched_nodes_are_not_released_again() {
        let mut graph = DependencyGraph::build(&workflow(&["a", "b"], &[("a", "b")]));
        graph.reopen("b");

        assert!(graph.on_completed("a").is_empty());
        assert_eq!(graph.in_degree["b"], 0);
    }

    #[test]
    fn reopen_lets_a_completed_node_complete_again() {
        let mut graph = DependencyGraph::build(&workflow(&["a", "b"], &[("a", "b")]));
        graph.on_completed("a");
        graph.mark_dispatched(["b"]);
        graph.on_completed("b");
        assert!(graph.is_complete());

        graph.reopen("a");
        assert!(!graph.is_complete());
        assert!(graph.on_completed("a").is_empty());
        assert!(graph.is_complete());
        assert_eq!(graph.in_degree["b"], 0);
    }

    #[test]
    fn rerun_of_completed_node_keeps_join_waiting_for_siblings() {
        let mut graph = DependencyGraph::build(&workflow(
            &["a", "b", "join"],
            &[("a", "join"), ("b", "join")],
        ));
        assert!(graph.on_completed("a").is_empty());

        graph.reopen("a");
        assert_eq!(graph.in_degree["join"], 2);
        assert!(graph.on_completed("a").is_empty());
        assert_eq!(graph.in_degree["join"], 1);

        assert_eq!(graph.on_completed("b"), vec!["join".to_string()]);
    }

    #[test]
    fn rerun_of_failed_node_unblocks_its_subtree() {
        let mut graph = DependencyGraph::build(&workflow(&["a", "c", "z"], &[("a", "c")]));
        graph.on_failed("a");
        assert!(graph.blocked_nodes.contains("c"));

        graph.reopen("a");
        assert!(graph.blocked_nodes.is_empty());
        assert!(!graph.has_failures());

        assert_eq!(graph.on_completed("a"), vec!["c".to_string()]);
        graph.on_completed("z");
        assert!(!graph.is_complete());
        graph.on_completed("c");
        assert!(graph.is_complete());
        assert!(!graph.has_failures());
    }

    #[test]
    fn rerun_keeps_blocks_imposed_by_other_failures() {
        let mut graph = DependencyGraph::build(&workflow(
            &["a", "b", "c"],
            &[("a", "c"), ("b", "c")],
        ));
        graph.on_failed("a");
        graph.on_failed("b");

        graph.reopen("a");
        assert!(graph.blocked_nodes.contains("c"));
        assert!(graph.on_completed("a").is_empty());
        assert!(graph.is_complete());
        assert!(graph.has_failures());
    }

    #[test]
    fn rerun_inside_entry_scope_keeps_outside_nodes_blocked() {
        let mut graph = DependencyGraph::build(&workflow(
            &["start", "hook", "merge"],
            &[("start", "hook"), ("hook", "merge")],
        ));
        graph.scope_to_entry("hook");
        graph.on_failed("hook");
        assert!(graph.blocked_nodes.contains("merge"));

        graph.reopen("hook");
        assert_eq!(
            graph.blocked_nodes,
            HashSet::from(["start".to_string()])
        );
        assert_eq!(graph.on_completed("hook"), vec!["merge".to_string()]);
    }

    #[test]
    fn entry_scope_releases_only_reachable_nodes() {
        // start -> hook -> merge, start -> other -> merge
        let mut graph = DependencyGraph::build(&workflow(
            &["start", "hook", "other", "merge"],
            &[
                ("start", "hook"),
                ("start", "other"),
                ("hook", "merge"),
                ("other", "merge"),
            ],
        ));
        graph.scope_to_entry("hook");

        assert_eq!(graph.initial_ready(), vec!["hook".to_string()]);
        assert!(graph.blocked_nodes.contains("start"));
        assert!(graph.blocked_nodes.contains("other"));

        assert_eq!(graph.on_completed("hook"), vec!["merge".to_string()]);
        graph.on_completed("merge");
        assert!(graph.is_complete());
        assert!(!graph.has_failures());
    }

    #[test]
    fn cyclic_graph_has_no_initial_ready_nodes() {
        let graph = DependencyGraph::build(&workflow(
            &["a", "b", "c"],
            &[("a", "b"), ("b", "c"), ("c", "a")],
        ));
        assert!(graph.initial_ready().is_empty());
    }

    #[test]
    fn unknown_nodes_are_ignored() {
        let mut graph = DependencyGraph::build(&workflow(&["a"], &[]));
        assert!(graph.on_completed("ghost").is_empty());
        assert!(!graph.on_failed("ghost"));
        assert!(!graph.is_complete());
    }

    /// Small deterministic generator so the DAG sweep needs no extra crates
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    #[test]
    fn any_acyclic_graph_completes_in_any_release_order() {
        let mut rng = Lcg(7);

        for round in 0..50 {
            let size = 2 + (rng.next() % 12) as usize;
            let names: Vec<String> = (0..size).map(|i| format!("n{}", i)).collect();
            let mut edges = Vec::new();
            for target in 1..size {
                for source in 0..target {
                    if rng.next() % 3 == 0 {
                        edges.push(Edge::new(names[source].clone(), names[target].clone()));
                    }
                }
            }
            let wf = Workflow {
                id: format!("wf-{}", round),
                name: "random".into(),
                owner_id: None,
                nodes: names.iter().map(|n| Node::new(n.clone(), "noop")).collect(),
                edges,
            };

            let mut graph = DependencyGraph::build(&wf);
            let mut ready = graph.initial_ready();
            assert!(!ready.is_empty(), "round {} had no roots", round);
            graph.mark_dispatched(ready.clone());

            while !ready.is_empty() {
                let pick = (rng.next() as usize) % ready.len();
                let node = ready.swap_remove(pick);
                let released = if rng.next() % 5 == 0 {
                    graph.on_failed(&node);
                    Vec::new()
                } else {
                    graph.on_completed(&node)
                };
                graph.mark_dispatched(released.clone());
                ready.extend(released);
            }

            assert!(graph.is_complete(), "round {} did not complete", round);
        }
    }
}
