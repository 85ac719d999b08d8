use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashMap;
use rand::seq::SliceRandom;

use crate::factor::Factor;
use crate::label_set::LabelSet;
use crate::math;
use crate::model::{ArcFeature, GraphModel};
use crate::query::{GraphQuery, NodeInit};
use crate::trainer::{LabelErrorStats, PrecisionCounts, PrecisionStats};
use crate::{LabelId, NO_LABEL};

/// Labels are truncated to this many bytes when read from a request.
const MAX_NAME_LEN: usize = 1024;

/// Candidate beam used when producing n-best distributions.
const NBEST_BEAM: usize = 64;

#[derive(Clone, Copy, Debug)]
pub(crate) struct NodeState {
    pub(crate) label: LabelId,
    pub(crate) must_infer: bool,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            label: NO_LABEL,
            must_infer: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct LabelPenalty {
    pub(crate) label: LabelId,
    pub(crate) penalty: f64,
}

impl Default for LabelPenalty {
    fn default() -> Self {
        Self {
            // Distinct from the absent label so unassigned nodes are never
            // penalized.
            label: -2,
            penalty: 0.0,
        }
    }
}

/// The label of one node in a completed assignment.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeLabel {
    /// Node index.
    pub node: usize,
    /// Label name.
    pub label: String,
    /// Whether the label was given by the caller.
    pub given: bool,
}

/// A scored label candidate of one node.
#[derive(Clone, Debug)]
pub struct NBestCandidate {
    /// Label name.
    pub label: String,
    /// Score of the node under this label.
    pub score: f64,
}

/// The n-best candidate distribution of one inferred node.
#[derive(Clone, Debug)]
pub struct NBestDistribution {
    /// Node index.
    pub node: usize,
    /// Candidates ordered by descending score.
    pub candidates: Vec<NBestCandidate>,
}

/// A mutable labeling of one query's nodes.
///
/// Nodes flagged as given keep their caller-supplied label through every
/// optimization move; inferred nodes are relabeled freely. Per-node label
/// penalties implement loss-augmented decoding during max-margin training.
#[derive(Clone)]
pub struct NodeAssignment<'a> {
    pub(crate) query: &'a GraphQuery,
    pub(crate) label_set: LabelSet<'a>,
    pub(crate) nodes: Vec<NodeState>,
    pub(crate) penalties: Vec<LabelPenalty>,
    unknown_label: LabelId,
}

impl<'a> NodeAssignment<'a> {
    pub(crate) fn new(
        query: &'a GraphQuery,
        mut label_set: LabelSet<'a>,
        inits: &[NodeInit],
        unknown_label: LabelId,
    ) -> Self {
        let mut nodes = vec![NodeState::default(); query.node_count()];
        for init in inits {
            if init.node >= nodes.len() {
                continue;
            }
            let mut name = init.label.as_str();
            if name.len() > MAX_NAME_LEN {
                let mut end = MAX_NAME_LEN;
                while !name.is_char_boundary(end) {
                    end -= 1;
                }
                name = &name[..end];
            }
            nodes[init.node] = NodeState {
                label: label_set.add_label(name),
                must_infer: !init.given,
            };
        }
        let penalties = vec![LabelPenalty::default(); nodes.len()];
        Self {
            query,
            label_set,
            nodes,
            penalties,
            unknown_label,
        }
    }

    /// Returns the number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns whether the assignment has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns whether a node's label is to be inferred.
    #[must_use]
    pub fn is_inferred(&self, node: usize) -> bool {
        self.nodes[node].must_infer
    }

    /// Returns the name of a node's current label, or `None` if the node is
    /// unlabeled.
    #[must_use]
    pub fn label_name(&self, node: usize) -> Option<&str> {
        let label = self.nodes[node].label;
        (label >= 0).then(|| self.label_set.name(label))
    }

    /// Returns the labeled nodes of the assignment.
    #[must_use]
    pub fn node_labels(&self) -> Vec<NodeLabel> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, state)| state.label >= 0)
            .map(|(node, state)| NodeLabel {
                node,
                label: self.label_set.name(state.label).to_string(),
                given: !state.must_infer,
            })
            .collect()
    }

    /// Penalizes every inferred node for keeping its current label. Used for
    /// loss-augmented decoding during max-margin training.
    pub fn set_equality_penalty(&mut self, penalty: f64) {
        self.clear_penalty();
        for (state, p) in self.nodes.iter().zip(&mut self.penalties) {
            if state.must_infer {
                p.label = state.label;
                p.penalty = penalty;
            }
        }
    }

    /// Removes all penalties.
    pub fn clear_penalty(&mut self) {
        self.penalties = vec![LabelPenalty::default(); self.nodes.len()];
    }

    /// Unlabels every inferred node; given labels are untouched.
    pub fn clear_inferred(&mut self) {
        for state in &mut self.nodes {
            if state.must_infer {
                state.label = NO_LABEL;
            }
        }
    }

    /// Compares the inferred labels against a reference assignment over the
    /// same query and adds the outcome to `stats`. A prediction equal to the
    /// unknown label counts as incorrect and is excluded from the number of
    /// known predictions.
    pub fn compare(&self, reference: &NodeAssignment, stats: &PrecisionStats) {
        let mut counts = PrecisionCounts::default();
        for (i, state) in self.nodes.iter().enumerate() {
            if !state.must_infer {
                continue;
            }
            if state.label != self.unknown_label {
                counts.num_known_predictions += 1;
            }
            if state.label == reference.nodes[i].label && state.label != self.unknown_label {
                counts.correct_labels += 1;
            } else {
                counts.incorrect_labels += 1;
            }
        }
        stats.record(counts);
    }

    /// Records every disagreement with a reference assignment over the same
    /// query as a `"reference -> predicted"` entry.
    pub fn compare_errors(&self, reference: &NodeAssignment, stats: &LabelErrorStats) {
        for (i, state) in self.nodes.iter().enumerate() {
            if !state.must_infer || state.label == reference.nodes[i].label {
                continue;
            }
            let expected = if reference.nodes[i].label < 0 {
                "[none]".to_string()
            } else {
                reference.label_set.name(reference.nodes[i].label).to_string()
            };
            let predicted = if state.label < 0 {
                "[keep-original]".to_string()
            } else {
                self.label_set.name(state.label).to_string()
            };
            stats.record(format!("{expected} -> {predicted}"));
        }
    }

    pub(crate) fn label(&self, node: usize) -> LabelId {
        self.nodes[node].label
    }

    pub(crate) fn node_penalty(&self, node: usize) -> f64 {
        if self.nodes[node].label == self.penalties[node].label {
            self.penalties[node].penalty
        } else {
            0.0
        }
    }

    /// Score contributed by everything incident to a node: adjacent arcs,
    /// containing factors, minus the node's penalty.
    pub(crate) fn node_score(&self, model: &GraphModel, node: usize) -> f64 {
        let mut sum = -self.node_penalty(node);
        for arc in &self.query.arcs_adjacent[node] {
            let feature = ArcFeature {
                a: self.nodes[arc.node_a].label,
                b: self.nodes[arc.node_b].label,
                rel: arc.rel,
            };
            if let Some(w) = model.features.get(&feature) {
                sum += w.value();
            }
        }
        for &fi in &self.query.factors_of_node[node] {
            let hash = math::factor_hash(
                self.query.factors[fi].iter().map(|&v| self.nodes[v].label),
            );
            if let Some(w) = model.factor_weights.get(&hash) {
                sum += w.value();
            }
        }
        sum
    }

    /// Like [`node_score`](Self::node_score), but with `label` substituted
    /// at `node_assigned` everywhere that node appears.
    pub(crate) fn node_score_with(
        &self,
        model: &GraphModel,
        node: usize,
        node_assigned: usize,
        label: LabelId,
    ) -> f64 {
        let mut sum = -self.node_penalty(node);
        for arc in &self.query.arcs_adjacent[node] {
            let a = if arc.node_a == node_assigned {
                label
            } else {
                self.nodes[arc.node_a].label
            };
            let b = if arc.node_b == node_assigned {
                label
            } else {
                self.nodes[arc.node_b].label
            };
            let feature = ArcFeature { a, b, rel: arc.rel };
            if let Some(w) = model.features.get(&feature) {
                sum += w.value();
            }
        }
        let node_label = if node == node_assigned {
            label
        } else {
            self.nodes[node].label
        };
        for &fi in &self.query.factors_of_node[node] {
            let mut hash = math::label_hash(node_label);
            for &v in &self.query.factors[fi] {
                if v != node {
                    hash = hash.wrapping_add(math::label_hash(self.nodes[v].label));
                }
            }
            if let Some(w) = model.factor_weights.get(&hash) {
                sum += w.value();
            }
        }
        sum
    }

    /// Score of a node restricted to arcs whose other endpoint is flagged
    /// assigned. Used by the greedy seeding pass.
    fn node_score_on_assigned(&self, model: &GraphModel, node: usize, assigned: &[bool]) -> f64 {
        let mut sum = -self.node_penalty(node);
        for arc in &self.query.arcs_adjacent[node] {
            if arc.node_a != node && !assigned[arc.node_a] {
                continue;
            }
            if arc.node_b != node && !assigned[arc.node_b] {
                continue;
            }
            let feature = ArcFeature {
                a: self.nodes[arc.node_a].label,
                b: self.nodes[arc.node_b].label,
                rel: arc.rel,
            };
            if let Some(w) = model.features.get(&feature) {
                sum += w.value();
            }
        }
        sum
    }

    /// Score of the arcs between a pair of nodes under explicit labels.
    pub(crate) fn node_pair_score(
        &self,
        model: &GraphModel,
        node1: usize,
        node2: usize,
        label1: LabelId,
        label2: LabelId,
    ) -> f64 {
        let mut sum = 0.0;
        for arc in self.query.arcs_between(node1, node2) {
            let feature = if arc.node_a == node1 {
                ArcFeature {
                    a: label1,
                    b: label2,
                    rel: arc.rel,
                }
            } else {
                ArcFeature {
                    a: label2,
                    b: label1,
                    rel: arc.rel,
                }
            };
            if let Some(w) = model.features.get(&feature) {
                sum += w.value();
            }
        }
        sum
    }

    /// Sum of all arc and factor weights under the current labeling, minus
    /// all penalties.
    pub(crate) fn total_score(&self, model: &GraphModel) -> f64 {
        let mut sum = 0.0;
        for arc in &self.query.arcs {
            let feature = ArcFeature {
                a: self.nodes[arc.node_a].label,
                b: self.nodes[arc.node_b].label,
                rel: arc.rel,
            };
            if let Some(w) = model.features.get(&feature) {
                sum += w.value();
            }
        }
        for factor in &self.query.factors {
            let hash = math::factor_hash(factor.iter().map(|&v| self.nodes[v].label));
            if let Some(w) = model.factor_weights.get(&hash) {
                sum += w.value();
            }
        }
        for node in 0..self.nodes.len() {
            sum -= self.node_penalty(node);
        }
        sum
    }

    /// Returns whether another node in one of this node's scopes carries the
    /// same label. The unknown label never conflicts.
    pub(crate) fn has_conflict(&self, node: usize) -> bool {
        let node_label = self.nodes[node].label;
        if node_label == self.unknown_label {
            return false;
        }
        for &scope in &self.query.scopes_of_node[node] {
            for &other in &self.query.scopes[scope] {
                if other != node && self.nodes[other].label == node_label {
                    return true;
                }
            }
        }
        false
    }

    /// Returns the single node this node conflicts with, or `None` if there
    /// is no conflict or more than one.
    fn conflict_node(&self, node: usize) -> Option<usize> {
        let node_label = self.nodes[node].label;
        let mut found = None;
        for &scope in &self.query.scopes_of_node[node] {
            for &other in &self.query.scopes[scope] {
                if other != node && self.nodes[other].label == node_label {
                    match found {
                        None => found = Some(other),
                        Some(prev) if prev == other => {}
                        Some(_) => return None,
                    }
                }
            }
        }
        found
    }

    /// Collects candidate labels for a node from the pre-indexed feature
    /// tables, deduplicated and sorted ascending.
    pub(crate) fn label_candidates(
        &self,
        model: &GraphModel,
        node: usize,
        candidates: &mut Vec<LabelId>,
        beam: usize,
    ) {
        for arc in &self.query.arcs_adjacent[node] {
            if arc.node_a == node {
                if let Some(v) = model
                    .best_for_b_rel
                    .get(&(self.nodes[arc.node_b].label, arc.rel))
                {
                    candidates.extend(v.iter().take(beam).map(|&(_, label)| label));
                }
            }
            if arc.node_b == node {
                if let Some(v) = model
                    .best_for_a_rel
                    .get(&(self.nodes[arc.node_a].label, arc.rel))
                {
                    candidates.extend(v.iter().take(beam).map(|&(_, label)| label));
                }
            }
        }
        candidates.sort_unstable();
        candidates.dedup();
    }

    /// Replaces every label the model no longer knows with the unknown
    /// label. Runs on each incoming query when rare-label mode is on.
    pub(crate) fn replace_rare_labels(&mut self, model: &GraphModel) {
        for state in &mut self.nodes {
            if !model.label_freq.contains_key(&state.label) {
                state.label = self.unknown_label;
            }
        }
    }

    /// Adds `gradient_weight` for every arc feature under the current
    /// labeling.
    pub(crate) fn affected_features(
        &self,
        affected: &mut HashMap<ArcFeature, f64>,
        gradient_weight: f64,
    ) {
        for arc in &self.query.arcs {
            let feature = ArcFeature {
                a: self.nodes[arc.node_a].label,
                b: self.nodes[arc.node_b].label,
                rel: arc.rel,
            };
            *affected.entry(feature).or_default() += gradient_weight;
        }
    }

    /// Adds `gradient_weight` for every factor feature under the current
    /// labeling.
    pub(crate) fn affected_factor_features(
        &self,
        affected: &mut HashMap<u64, f64>,
        gradient_weight: f64,
    ) {
        for factor in &self.query.factors {
            let hash = math::factor_hash(factor.iter().map(|&v| self.nodes[v].label));
            *affected.entry(hash).or_default() += gradient_weight;
        }
    }

    /// Adds `gradient_weight` for the arc features a node would touch if it
    /// carried `label`.
    pub(crate) fn neighboring_affected_features(
        &self,
        affected: &mut HashMap<ArcFeature, f64>,
        node: usize,
        label: LabelId,
        gradient_weight: f64,
    ) {
        for arc in &self.query.arcs_adjacent[node] {
            let a = if arc.node_a == node {
                label
            } else {
                self.nodes[arc.node_a].label
            };
            let b = if arc.node_b == node {
                label
            } else {
                self.nodes[arc.node_b].label
            };
            *affected
                .entry(ArcFeature { a, b, rel: arc.rel })
                .or_default() += gradient_weight;
        }
    }

    /// Adds `gradient_weight` for the factor features a node would touch if
    /// it carried `label`.
    pub(crate) fn factor_affected_features_of_node(
        &self,
        affected: &mut HashMap<u64, f64>,
        node: usize,
        label: LabelId,
        gradient_weight: f64,
    ) {
        for &fi in &self.query.factors_of_node[node] {
            let mut hash = math::label_hash(label);
            for &v in &self.query.factors[fi] {
                if v != node {
                    hash = hash.wrapping_add(math::label_hash(self.nodes[v].label));
                }
            }
            *affected.entry(hash).or_default() += gradient_weight;
        }
    }

    /// Seeds inferred nodes in order of most-assigned-neighbors, picking the
    /// best scope-legal candidate scored against already-assigned neighbors.
    pub(crate) fn initial_greedy_pass(&mut self, model: &GraphModel, beam: usize) {
        let query = self.query;
        let mut assigned: Vec<bool> = self.nodes.iter().map(|s| !s.must_infer).collect();

        let mut queue = UpdatableQueue::default();
        for node in 0..self.nodes.len() {
            if self.nodes[node].must_infer {
                let mut score = 0i64;
                for arc in &query.arcs_adjacent[node] {
                    if assigned[arc.node_a] || assigned[arc.node_b] {
                        score += 1;
                    }
                }
                queue.set_value(node, -score);
            }
        }

        let mut candidates = vec![];
        while !queue.is_empty() {
            let node = queue.min_key();
            queue.remove_permanently(node);
            for arc in &query.arcs_adjacent[node] {
                if arc.node_a == node {
                    queue.set_value(arc.node_b, queue.value(arc.node_b) - 1);
                } else if arc.node_b == node {
                    queue.set_value(arc.node_a, queue.value(arc.node_a) - 1);
                }
            }

            if !self.nodes[node].must_infer {
                continue;
            }
            candidates.clear();
            self.label_candidates(model, node, &mut candidates, beam);
            if candidates.is_empty() {
                continue;
            }
            let mut best_score = self.node_score_on_assigned(model, node, &assigned);
            let mut best_label = self.nodes[node].label;
            for i in 0..candidates.len() {
                let candidate = candidates[i];
                self.nodes[node].label = candidate;
                if !self.label_set.is_valid(candidate) {
                    continue;
                }
                if self.has_conflict(node) {
                    continue;
                }
                let score = self.node_score_on_assigned(model, node, &assigned);
                if score > best_score {
                    best_label = candidate;
                    best_score = score;
                }
            }
            self.nodes[node].label = best_label;
            assigned[node] = true;
        }
    }

    /// One sweep of single-node moves: each inferred node takes the best
    /// valid, scope-legal candidate.
    pub(crate) fn per_node_pass(&mut self, model: &GraphModel, beam: usize) {
        let mut candidates = vec![];
        for node in 0..self.nodes.len() {
            if !self.nodes[node].must_infer {
                continue;
            }
            candidates.clear();
            self.label_candidates(model, node, &mut candidates, beam);
            if candidates.is_empty() {
                continue;
            }
            let mut best_score = self.node_score(model, node);
            let mut best_label = self.nodes[node].label;
            for i in 0..candidates.len() {
                let candidate = candidates[i];
                self.nodes[node].label = candidate;
                if !self.label_set.is_valid(candidate) {
                    continue;
                }
                if self.has_conflict(node) {
                    continue;
                }
                let score = self.node_score(model, node);
                if score > best_score {
                    best_label = candidate;
                    best_score = score;
                }
            }
            self.nodes[node].label = best_label;
        }
    }

    /// The per-node sweep with duplicate-label resolution: a candidate that
    /// conflicts with exactly one other inferred node is considered as a
    /// swap-like move giving that node this node's original label.
    pub(crate) fn per_node_pass_with_dup_resolution(&mut self, model: &GraphModel, beam: usize) {
        let mut candidates = vec![];
        for node in 0..self.nodes.len() {
            if !self.nodes[node].must_infer {
                continue;
            }
            candidates.clear();
            self.label_candidates(model, node, &mut candidates, beam);
            if candidates.is_empty() {
                continue;
            }
            let mut best_score = self.node_score(model, node);
            let initial_label = self.nodes[node].label;
            let mut best_label = initial_label;
            let mut best_node2 = None;
            for i in 0..candidates.len() {
                let candidate = candidates[i];
                self.nodes[node].label = candidate;
                if !self.label_set.is_valid(candidate) {
                    continue;
                }
                if self.has_conflict(node) {
                    let Some(node2) = self.conflict_node(node) else {
                        continue;
                    };
                    if !self.nodes[node2].must_infer {
                        continue;
                    }
                    self.nodes[node2].label = initial_label;
                    let mut score = self.node_score(model, node) + self.node_score(model, node2);
                    let legal = !self.has_conflict(node2) && !self.has_conflict(node);
                    self.nodes[node2].label = candidate;
                    if legal {
                        // The score on node2 is its gain over keeping the
                        // conflicting label.
                        score -= self.node_score(model, node2);
                        if score > best_score {
                            best_label = candidate;
                            best_score = score;
                            best_node2 = Some(node2);
                        }
                    }
                } else {
                    let score = self.node_score(model, node);
                    if score > best_score {
                        best_label = candidate;
                        best_score = score;
                        best_node2 = None;
                    }
                }
            }
            self.nodes[node].label = best_label;
            if let Some(node2) = best_node2 {
                self.nodes[node2].label = initial_label;
            }
        }
    }

    /// One sweep of simultaneous two-node moves along arcs, proposing the
    /// top label pairs of each arc's relation type.
    pub(crate) fn per_arc_pass(&mut self, model: &GraphModel, beam: usize) {
        let query = self.query;
        let degree_limit = model.config.skip_per_arc_optimization_above_degree;
        for arc in &query.arcs {
            if arc.node_a == arc.node_b {
                continue;
            }
            if !self.nodes[arc.node_a].must_infer || !self.nodes[arc.node_b].must_infer {
                continue;
            }
            if query.arcs_adjacent[arc.node_a].len() > degree_limit
                || query.arcs_adjacent[arc.node_b].len() > degree_limit
            {
                continue;
            }
            let Some(candidates) = model.best_for_rel.get(&arc.rel) else {
                continue;
            };
            if candidates.is_empty() {
                continue;
            }

            let mut best_a = self.nodes[arc.node_a].label;
            let mut best_b = self.nodes[arc.node_b].label;
            let mut best_score =
                self.node_score(model, arc.node_a) + self.node_score(model, arc.node_b);
            for &(_, feature) in candidates.iter().take(beam) {
                self.nodes[arc.node_a].label = feature.a;
                self.nodes[arc.node_b].label = feature.b;
                if self.has_conflict(arc.node_a) || self.has_conflict(arc.node_b) {
                    continue;
                }
                if !self.label_set.is_valid(feature.a) || !self.label_set.is_valid(feature.b) {
                    continue;
                }
                let score =
                    self.node_score(model, arc.node_a) + self.node_score(model, arc.node_b);
                if score > best_score {
                    best_a = feature.a;
                    best_b = feature.b;
                    best_score = score;
                }
            }
            self.nodes[arc.node_a].label = best_a;
            self.nodes[arc.node_b].label = best_b;
        }
    }

    /// One sweep over factors: for each factor, candidate label multisets
    /// matching the given members are enumerated and their free labels are
    /// permuted onto the inferred members.
    pub(crate) fn per_factor_pass(&mut self, model: &GraphModel, factors_limit: usize) {
        let query = self.query;
        let permutations_beam = model.config.permutations_beam_size;
        let mut rng = rand::thread_rng();
        for factor in &query.factors {
            let mut inf_nodes = vec![];
            let mut giv_labels = Factor::new();
            for &node in factor {
                if self.nodes[node].must_infer {
                    inf_nodes.push(node);
                } else {
                    giv_labels.insert(self.nodes[node].label);
                }
            }

            let mut candidates = vec![];
            model.factor_candidates(factor.len(), &giv_labels, &mut candidates, factors_limit);

            let mut best_score = 0.0;
            let mut best_assignments = Vec::with_capacity(inf_nodes.len());
            for &node in &inf_nodes {
                best_score += self.node_score(model, node);
                best_assignments.push(self.nodes[node].label);
            }

            for candidate in &candidates {
                if !candidate.contains_all(&giv_labels) {
                    continue;
                }
                let mut free_labels = candidate.minus(&giv_labels);
                if free_labels.len() != inf_nodes.len() {
                    continue;
                }
                if free_labels.iter().any(|&l| !self.label_set.is_valid(l)) {
                    continue;
                }
                match math::checked_factorial(free_labels.len()) {
                    Some(n) if n <= permutations_beam => {
                        free_labels.sort_unstable();
                        loop {
                            self.try_permutation(
                                model,
                                &inf_nodes,
                                &free_labels,
                                &mut best_assignments,
                                &mut best_score,
                            );
                            if !next_permutation(&mut free_labels) {
                                break;
                            }
                        }
                    }
                    // Too many permutations (or factorial overflow): sample.
                    _ => {
                        for _ in 0..permutations_beam {
                            self.try_permutation(
                                model,
                                &inf_nodes,
                                &free_labels,
                                &mut best_assignments,
                                &mut best_score,
                            );
                            free_labels.shuffle(&mut rng);
                        }
                    }
                }
            }
            for (&node, &label) in inf_nodes.iter().zip(&best_assignments) {
                self.nodes[node].label = label;
            }
        }
    }

    fn try_permutation(
        &mut self,
        model: &GraphModel,
        inf_nodes: &[usize],
        labels: &[LabelId],
        best_assignments: &mut [LabelId],
        best_score: &mut f64,
    ) {
        for (&node, &label) in inf_nodes.iter().zip(labels) {
            self.nodes[node].label = label;
        }
        for &node in inf_nodes {
            if self.has_conflict(node) {
                return;
            }
        }
        let score: f64 = inf_nodes
            .iter()
            .map(|&node| self.node_score(model, node))
            .sum();
        if score > *best_score {
            best_assignments.copy_from_slice(labels);
            *best_score = score;
        }
    }

    /// Produces the per-node candidate distributions, each truncated to `n`.
    pub(crate) fn nbest(&self, model: &GraphModel, n: usize) -> Vec<NBestDistribution> {
        let mut distributions = vec![];
        let mut candidates = vec![];
        for node in 0..self.nodes.len() {
            if !self.nodes[node].must_infer {
                continue;
            }
            candidates.clear();
            self.label_candidates(model, node, &mut candidates, NBEST_BEAM);
            let mut scored: Vec<(LabelId, f64)> = candidates
                .iter()
                .filter(|&&label| self.label_set.is_valid(label))
                .map(|&label| (label, self.node_score_with(model, node, node, label)))
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap().then_with(|| a.0.cmp(&b.0)));
            distributions.push(NBestDistribution {
                node,
                candidates: scored
                    .into_iter()
                    .take(n)
                    .map(|(label, score)| NBestCandidate {
                        label: self.label_set.name(label).to_string(),
                        score,
                    })
                    .collect(),
            });
        }
        distributions
    }

    pub(crate) fn label_display_name(&self, label: LabelId) -> String {
        if label < 0 {
            format!("{label}")
        } else {
            self.label_set.name(label).to_string()
        }
    }
}

/// A priority queue whose entries' priorities can be updated in place.
/// Pops the key with the minimum value, breaking ties on the smallest key.
#[derive(Default)]
struct UpdatableQueue {
    value_for_key: BTreeMap<usize, i64>,
    removed: BTreeSet<usize>,
    sorted: BTreeSet<(i64, usize)>,
}

impl UpdatableQueue {
    fn set_value(&mut self, key: usize, value: i64) {
        if !self.removed.contains(&key) {
            let old = self.value(key);
            self.sorted.remove(&(old, key));
            self.sorted.insert((value, key));
        }
        self.value_for_key.insert(key, value);
    }

    fn value(&self, key: usize) -> i64 {
        self.value_for_key.get(&key).copied().unwrap_or(0)
    }

    fn remove_permanently(&mut self, key: usize) {
        let old = self.value(key);
        self.sorted.remove(&(old, key));
        self.removed.insert(key);
    }

    fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    fn min_key(&self) -> usize {
        self.sorted.iter().next().unwrap().1
    }
}

/// Rearranges the slice into the lexicographically next permutation,
/// returning `false` once the slice is in descending order.
fn next_permutation(v: &mut [LabelId]) -> bool {
    if v.len() < 2 {
        return false;
    }
    let mut i = v.len() - 1;
    while i > 0 && v[i - 1] >= v[i] {
        i -= 1;
    }
    if i == 0 {
        return false;
    }
    let mut j = v.len() - 1;
    while v[j] <= v[i - 1] {
        j -= 1;
    }
    v.swap(i - 1, j);
    v[i..].reverse();
    true
}
