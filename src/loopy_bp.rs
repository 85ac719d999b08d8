use std::collections::VecDeque;

use hashbrown::HashMap;

use crate::assignment::NodeAssignment;
use crate::model::GraphModel;
use crate::{LabelId, NO_LABEL};

/// Candidates seeded per type around each node's starting label.
const LOOPY_BP_BEAM: usize = 32;

#[derive(Clone, Copy)]
struct IncomingMessage {
    label: LabelId,
    score: f64,
}

impl Default for IncomingMessage {
    fn default() -> Self {
        Self {
            label: NO_LABEL,
            score: 0.0,
        }
    }
}

#[derive(Clone, Default)]
struct BpScore {
    total: f64,
    incoming: HashMap<usize, IncomingMessage>,
}

/// A sparse max-product belief propagation pass.
///
/// The table holds one entry per candidate `(node, label)` pair of the
/// inferred nodes, seeded from the current labels and the top candidates of
/// each adjacent relation type. Messages are pulled in place for a fixed
/// number of rounds, then the labeling is read off by walking best-incoming
/// links outward from the highest-scoring anchors.
pub(crate) struct LoopyBpPass {
    scores: HashMap<(usize, LabelId), BpScore>,
    labels_at_node: Vec<Vec<LabelId>>,
}

impl LoopyBpPass {
    pub(crate) fn run(model: &GraphModel, assignment: &mut NodeAssignment, steps: usize) {
        let mut bp = Self {
            scores: HashMap::new(),
            labels_at_node: vec![vec![]; assignment.len()],
        };
        bp.init_possible_labels(model, assignment);
        for _ in 0..steps {
            bp.pull_messages(model, assignment);
        }
        bp.trace_back(assignment);
    }

    fn init_possible_labels(&mut self, model: &GraphModel, a: &NodeAssignment) {
        for node in 0..a.len() {
            if a.nodes[node].must_infer {
                self.put_possible_label(a, node, a.nodes[node].label);
                self.put_possible_labels_at_adjacent(model, a, node, a.nodes[node].label);
            }
        }
    }

    fn put_possible_label(&mut self, a: &NodeAssignment, node: usize, label: LabelId) {
        if self.scores.contains_key(&(node, label)) {
            return;
        }
        self.labels_at_node[node].push(label);
        let mut score = BpScore::default();
        if label == a.penalties[node].label {
            score.total = -a.penalties[node].penalty;
        }
        for arc in &a.query.arcs_adjacent[node] {
            if arc.node_a == node {
                score.incoming.insert(arc.node_b, IncomingMessage::default());
            }
            if arc.node_b == node {
                score.incoming.insert(arc.node_a, IncomingMessage::default());
            }
        }
        self.scores.insert((node, label), score);
    }

    fn put_possible_labels_at_adjacent(
        &mut self,
        model: &GraphModel,
        a: &NodeAssignment,
        node: usize,
        label: LabelId,
    ) {
        for arc in &a.query.arcs_adjacent[node] {
            if arc.node_a == node && a.nodes[arc.node_b].must_infer {
                if let Some(v) = model.best_for_a_rel.get(&(label, arc.rel)) {
                    for &(_, candidate) in v.iter().take(LOOPY_BP_BEAM) {
                        self.put_possible_label(a, arc.node_b, candidate);
                    }
                }
            }
            if arc.node_b == node && a.nodes[arc.node_a].must_infer {
                if let Some(v) = model.best_for_b_rel.get(&(label, arc.rel)) {
                    for &(_, candidate) in v.iter().take(LOOPY_BP_BEAM) {
                        self.put_possible_label(a, arc.node_a, candidate);
                    }
                }
            }
        }
    }

    /// The best message from one node to a labeled neighbor. Given nodes
    /// send their fixed label; inferred nodes maximize over their own
    /// entries, net of the message previously received back.
    fn best_message(
        &self,
        model: &GraphModel,
        a: &NodeAssignment,
        from_node: usize,
        to_node: usize,
        to_label: LabelId,
    ) -> IncomingMessage {
        if !a.nodes[from_node].must_infer {
            let from_label = a.nodes[from_node].label;
            return IncomingMessage {
                label: from_label,
                score: a.node_pair_score(model, from_node, to_node, from_label, to_label),
            };
        }
        let mut best = IncomingMessage::default();
        for &from_label in &self.labels_at_node[from_node] {
            let Some(entry) = self.scores.get(&(from_node, from_label)) else {
                continue;
            };
            let node_score = entry.total
                - entry
                    .incoming
                    .get(&to_node)
                    .copied()
                    .unwrap_or_default()
                    .score;
            let score = node_score
                + a.node_pair_score(model, from_node, to_node, from_label, to_label);
            if score > best.score {
                best.score = score;
                best.label = from_label;
            }
        }
        best
    }

    fn pull_messages(&mut self, model: &GraphModel, a: &NodeAssignment) {
        for node in 0..a.len() {
            for li in 0..self.labels_at_node[node].len() {
                let label = self.labels_at_node[node][li];
                let Some(entry) = self.scores.get(&(node, label)) else {
                    continue;
                };
                let mut froms: Vec<usize> = entry.incoming.keys().copied().collect();
                froms.sort_unstable();
                for from in froms {
                    let new_msg = self.best_message(model, a, from, node, label);
                    let entry = self.scores.get_mut(&(node, label)).unwrap();
                    let old_msg = entry.incoming.insert(from, new_msg).unwrap_or_default();
                    entry.total += new_msg.score - old_msg.score;
                }
            }
        }
    }

    /// Anchors the traversal at the highest-scoring entries and propagates
    /// each anchor's best-incoming labels outward breadth-first, labeling
    /// every inferred node on first visit.
    fn trace_back(&self, a: &mut NodeAssignment) {
        let mut entries: Vec<(f64, (usize, LabelId))> = self
            .scores
            .iter()
            .map(|(&key, score)| (score.total, key))
            .collect();
        entries.sort_by(|x, y| y.partial_cmp(x).unwrap());

        let mut visited = vec![false; a.len()];
        let mut queue = VecDeque::new();
        for &(_, anchor) in &entries {
            queue.push_back(anchor);
            while let Some((node, label)) = queue.pop_front() {
                if visited[node] {
                    continue;
                }
                visited[node] = true;
                if a.nodes[node].must_infer {
                    a.nodes[node].label = label;
                }
                if let Some(entry) = self.scores.get(&(node, label)) {
                    let mut froms: Vec<(usize, IncomingMessage)> = entry
                        .incoming
                        .iter()
                        .map(|(&from, &msg)| (from, msg))
                        .collect();
                    froms.sort_unstable_by_key(|&(from, _)| from);
                    for (from, msg) in froms {
                        queue.push_back((from, msg.label));
                    }
                }
            }
        }
    }
}
