use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::sync::Arc;

use hashbrown::HashMap;
use tracing::{debug, info, trace};

use crate::assignment::{NBestDistribution, NodeAssignment, NodeLabel};
use crate::config::Config;
use crate::dictionary::StringDictionary;
use crate::errors::{Result, RumrfError};
use crate::factor::{Factor, FactorLevel};
use crate::label_checker::LabelChecker;
use crate::label_set::LabelSet;
use crate::loopy_bp::LoopyBpPass;
use crate::query::{FeatureRecord, GraphQuery, NodeInit, TrainingQuery};
use crate::trainer::PrecisionStats;
use crate::weight::LockFreeWeight;
use crate::{LabelId, RelId, NO_LABEL};

const INITIAL_ASSIGNMENT_BEAM: usize = 4;

const START_PER_NODE_BEAM: usize = 4;
const MAX_PER_NODE_BEAM: usize = 64;
const START_PER_ARC_BEAM: usize = 4;
const MAX_PER_ARC_BEAM: usize = 64;

/// A level of the factor index only branches once it holds more factors
/// than this.
const FACTOR_BRANCH_THRESHOLD: usize = 16;

/// Gradients smaller than this are not applied.
const GRADIENT_EPSILON: f64 = 1e-9;

const INFERRED_NODE_COLOR: &str = "#6c9ba4";
const GIVEN_NODE_COLOR: &str = "#96816a";

/// A typed ordered pair of label ids, the key of a pairwise feature.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ArcFeature {
    /// Label of the arc's left node.
    pub a: LabelId,
    /// Label of the arc's right node.
    pub b: LabelId,
    /// Relation type.
    pub rel: RelId,
}

/// One node of a visualization graph.
#[derive(Clone, Debug)]
pub struct GraphViewNode {
    /// Node index.
    pub id: usize,
    /// Current label name, or the raw id for unlabeled nodes.
    pub label: String,
    /// Display color, keyed on whether the node was inferred.
    pub color: &'static str,
}

/// One undirected edge of a visualization graph.
#[derive(Clone, Debug)]
pub struct GraphViewEdge {
    /// Edge index.
    pub id: usize,
    /// The joined descriptions of the arcs between the two nodes.
    pub label: String,
    /// Smaller endpoint index.
    pub source: usize,
    /// Larger endpoint index.
    pub target: usize,
}

/// A visualization graph for one query and assignment.
#[derive(Clone, Debug, Default)]
pub struct GraphView {
    /// Nodes that are inferred or touch at least one arc.
    pub nodes: Vec<GraphViewNode>,
    /// Deduplicated undirected edges.
    pub edges: Vec<GraphViewEdge>,
}

pub(crate) struct WeightSnapshot {
    features: Vec<(ArcFeature, f64)>,
    factors: Vec<(u64, f64)>,
}

/// The model: weights for pairwise and factor features, the interning
/// dictionary, the label validator, and the candidate indexes inference
/// reads.
///
/// Lifecycle: create, [`add_query`](Self::add_query) every training record,
/// [`prepare`](Self::prepare), then train and/or infer, then
/// [`save`](Self::save). Weight updates during training are atomic, so
/// learning on `&self` may run from several threads at once; everything else
/// requires external synchronization.
pub struct GraphModel {
    pub(crate) config: Config,
    pub(crate) features: HashMap<ArcFeature, LockFreeWeight>,
    pub(crate) factor_set: BTreeSet<Factor>,
    pub(crate) factor_weights: HashMap<u64, LockFreeWeight>,
    pub(crate) label_freq: HashMap<LabelId, u32>,
    pub(crate) dictionary: StringDictionary,
    pub(crate) checker: LabelChecker,
    pub(crate) best_for_rel: HashMap<RelId, Vec<(f64, ArcFeature)>>,
    pub(crate) best_for_a_rel: HashMap<(LabelId, RelId), Vec<(f64, LabelId)>>,
    pub(crate) best_for_b_rel: HashMap<(LabelId, RelId), Vec<(f64, LabelId)>>,
    factor_index: HashMap<usize, FactorLevel>,
    unknown_label: LabelId,
    regularizer: f64,
    svm_margin: f64,
    pl_beam: usize,
}

impl GraphModel {
    /// Creates an empty model with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates an empty model with the given configuration.
    #[must_use]
    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            features: HashMap::new(),
            factor_set: BTreeSet::new(),
            factor_weights: HashMap::new(),
            label_freq: HashMap::new(),
            dictionary: StringDictionary::new(),
            checker: LabelChecker::new(),
            best_for_rel: HashMap::new(),
            best_for_a_rel: HashMap::new(),
            best_for_b_rel: HashMap::new(),
            factor_index: HashMap::new(),
            unknown_label: NO_LABEL,
            regularizer: 1.0,
            svm_margin: 1e-9,
            pl_beam: 0,
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the interning dictionary.
    #[must_use]
    pub fn dictionary(&self) -> &StringDictionary {
        &self.dictionary
    }

    /// Returns the number of pairwise features.
    #[must_use]
    pub fn num_arc_features(&self) -> usize {
        self.features.len()
    }

    /// Returns the number of factor features.
    #[must_use]
    pub fn num_factor_features(&self) -> usize {
        self.factor_set.len()
    }

    /// Returns the weight of a pairwise feature by label and relation names.
    #[must_use]
    pub fn arc_weight(&self, a: &str, b: &str, rel: &str) -> Option<f64> {
        let feature = ArcFeature {
            a: self.dictionary.find(a)?,
            b: self.dictionary.find(b)?,
            rel: self.dictionary.find(rel)?,
        };
        self.features.get(&feature).map(LockFreeWeight::value)
    }

    /// Accumulates one training record into the model: labels are interned,
    /// label frequencies counted, and every observed pairwise and factor
    /// feature gets its co-occurrence count added to its weight.
    pub fn add_query(&mut self, query: &TrainingQuery) {
        let mut values: HashMap<usize, LabelId> = HashMap::new();
        let mut unique_values = BTreeSet::new();
        for init in &query.assignments {
            let label = self.dictionary.add(&init.label);
            values.insert(init.node, label);
            unique_values.insert(label);
        }
        for label in unique_values {
            *self.label_freq.entry(label).or_insert(0) += 1;
        }

        for record in &query.features {
            match record {
                FeatureRecord::Relation { a, b, rel } => {
                    let a = values.get(a).copied().unwrap_or(NO_LABEL);
                    let b = values.get(b).copied().unwrap_or(NO_LABEL);
                    let rel = self.dictionary.add(rel);
                    if a != NO_LABEL && b != NO_LABEL {
                        self.features
                            .entry(ArcFeature { a, b, rel })
                            .or_default()
                            .add(1.0);
                    }
                }
                FeatureRecord::Group { nodes } if self.config.use_factors => {
                    let mut factor = Factor::new();
                    let mut complete = true;
                    for node in nodes {
                        match values.get(node) {
                            Some(&label) => factor.insert(label),
                            None => {
                                complete = false;
                                break;
                            }
                        }
                    }
                    if !complete || factor.is_empty() {
                        continue;
                    }
                    self.factor_weights
                        .entry(factor.feature_hash())
                        .or_default()
                        .add(1.0);
                    self.factor_set.insert(factor);
                }
                _ => {}
            }
        }
    }

    /// Builds the candidate indexes and loads the label validator. Must be
    /// called after the last [`add_query`](Self::add_query) and before any
    /// inference or learning; training calls it again between epochs.
    ///
    /// When an unknown label and a frequency floor are configured, labels
    /// below the floor are dropped and every feature mentioning one is
    /// folded into the unknown label.
    pub fn prepare(&mut self) -> Result<()> {
        if let Some(name) = &self.config.unknown_label {
            self.unknown_label = self.dictionary.add(name);
        }
        if !self.checker.is_loaded() {
            if let Some(path) = self.config.valid_labels.clone() {
                info!(path = %path.display(), "loading label rules");
                self.checker.load(&path, &self.dictionary)?;
            }
        }
        if self.unknown_label >= 0 && self.config.min_freq_known_label > 0 {
            self.replace_rare_features();
        }

        self.best_for_rel.clear();
        self.best_for_a_rel.clear();
        self.best_for_b_rel.clear();
        self.factor_index.clear();

        for (&feature, weight) in &self.features {
            let weight = weight.value();
            self.best_for_rel
                .entry(feature.rel)
                .or_default()
                .push((weight, feature));
            self.best_for_a_rel
                .entry((feature.a, feature.rel))
                .or_default()
                .push((weight, feature.b));
            self.best_for_b_rel
                .entry((feature.b, feature.rel))
                .or_default()
                .push((weight, feature.a));
        }
        for factor in &self.factor_set {
            let weight = self
                .factor_weights
                .get(&factor.feature_hash())
                .map_or(0.0, LockFreeWeight::value);
            let entry = Arc::new((weight, factor.clone()));
            self.factor_index.entry(factor.len()).or_default().insert(
                &entry,
                0,
                self.config.maximum_depth,
                None,
                Factor::new(),
                FACTOR_BRANCH_THRESHOLD,
            );
        }

        for v in self.best_for_rel.values_mut() {
            v.sort_unstable_by(|x, y| y.partial_cmp(x).unwrap());
        }
        for v in self.best_for_a_rel.values_mut() {
            v.sort_unstable_by(|x, y| y.partial_cmp(x).unwrap());
        }
        for v in self.best_for_b_rel.values_mut() {
            v.sort_unstable_by(|x, y| y.partial_cmp(x).unwrap());
        }
        for level in self.factor_index.values_mut() {
            level.sort();
        }
        info!(
            num_arc_features = self.features.len(),
            num_factor_features = self.factor_set.len(),
            "prepared for inference"
        );
        Ok(())
    }

    fn replace_rare_features(&mut self) {
        let min_freq = self.config.min_freq_known_label;
        let updated_freq: HashMap<LabelId, u32> = self
            .label_freq
            .iter()
            .filter(|&(_, &count)| count >= min_freq)
            .map(|(&label, &count)| (label, count))
            .collect();
        info!(
            removed = self.label_freq.len() - updated_freq.len(),
            total = self.label_freq.len(),
            "dropped low-frequency labels"
        );
        self.label_freq = updated_freq;

        let mut updated: HashMap<ArcFeature, LockFreeWeight> =
            HashMap::with_capacity(self.features.len());
        for (&feature, weight) in &self.features {
            let mut feature = feature;
            if !self.label_freq.contains_key(&feature.a) {
                feature.a = self.unknown_label;
            }
            if !self.label_freq.contains_key(&feature.b) {
                feature.b = self.unknown_label;
            }
            updated.entry(feature).or_default().add(weight.value());
        }
        info!(
            removed = self.features.len() - updated.len(),
            total = self.features.len(),
            "folded features of rare labels"
        );
        self.features = updated;
    }

    /// Builds the per-request graph for a feature sequence.
    #[must_use]
    pub fn create_query(&self, records: &[FeatureRecord]) -> GraphQuery {
        GraphQuery::build(records, &self.dictionary, self.config.use_factors)
    }

    /// Builds an assignment over a query from initial node labels.
    #[must_use]
    pub fn create_assignment<'m>(
        &'m self,
        query: &'m GraphQuery,
        inits: &[NodeInit],
    ) -> NodeAssignment<'m> {
        NodeAssignment::new(
            query,
            LabelSet::new(&self.dictionary, &self.checker),
            inits,
            self.unknown_label,
        )
    }

    /// Replaces the labels of the inferred nodes with the highest-scoring
    /// labeling the beam search finds. Given labels are never modified.
    pub fn map_inference(&self, assignment: &mut NodeAssignment) {
        if self.unknown_label >= 0 {
            assignment.replace_rare_labels(self);
        }
        let mut score = assignment.total_score(self);
        trace!(score, "start score");
        if self.config.initial_greedy_assignment_pass {
            assignment.initial_greedy_pass(self, INITIAL_ASSIGNMENT_BEAM);
            score = assignment.total_score(self);
            trace!(score, "greedy pass score");
        }

        let passes = self
            .config
            .per_node_passes
            .max(self.config.loopy_bp_passes)
            .max(self.config.per_arc_passes);
        let mut per_node_beam = START_PER_NODE_BEAM;
        let mut per_arc_beam = START_PER_ARC_BEAM;
        for pass in 0..passes {
            if pass < self.config.loopy_bp_passes {
                LoopyBpPass::run(
                    self,
                    assignment,
                    self.config.loopy_bp_steps_per_pass as usize,
                );
                trace!(score = assignment.total_score(self), "bp pass score");
            }
            if pass < self.config.per_node_passes {
                if self.config.duplicate_name_resolution {
                    assignment.per_node_pass_with_dup_resolution(self, per_node_beam);
                } else {
                    assignment.per_node_pass(self, per_node_beam);
                }
                per_node_beam = (per_node_beam * 2).min(MAX_PER_NODE_BEAM);
            }
            if pass < self.config.per_arc_passes {
                assignment.per_arc_pass(self, per_arc_beam);
                per_arc_beam = (per_arc_beam * 2).min(MAX_PER_ARC_BEAM);
            }
            if pass < self.config.per_factor_passes {
                assignment.per_factor_pass(self, self.config.factors_limit);
            }

            let updated_score = assignment.total_score(self);
            if updated_score == score {
                break;
            }
            score = updated_score;
        }
        debug!(score, "end score");
    }

    /// Builds an assignment, runs inference, and returns the labeled nodes.
    #[must_use]
    pub fn infer(&self, records: &[FeatureRecord], inits: &[NodeInit]) -> Vec<NodeLabel> {
        let query = self.create_query(records);
        let mut assignment = self.create_assignment(&query, inits);
        self.map_inference(&mut assignment);
        assignment.node_labels()
    }

    /// Returns the total score of an assignment.
    #[must_use]
    pub fn assignment_score(&self, assignment: &NodeAssignment) -> f64 {
        assignment.total_score(self)
    }

    /// Per inferred node, the candidate labels ordered by descending score,
    /// truncated to `n`. Runs inference first if `should_infer` is set.
    pub fn nbest(
        &self,
        assignment: &mut NodeAssignment,
        n: usize,
        should_infer: bool,
    ) -> Vec<NBestDistribution> {
        if should_infer {
            self.map_inference(assignment);
        }
        assignment.nbest(self, n)
    }

    /// Produces a visualization graph of the query under the assignment.
    /// Runs inference first if `should_infer` is set.
    pub fn graph_view(&self, assignment: &mut NodeAssignment, should_infer: bool) -> GraphView {
        if should_infer {
            self.map_inference(assignment);
        }

        let mut view = GraphView::default();
        for node in 0..assignment.len() {
            let inferred = assignment.nodes[node].must_infer;
            if inferred || !assignment.query.arcs_adjacent[node].is_empty() {
                view.nodes.push(GraphViewNode {
                    id: node,
                    label: assignment.label_display_name(assignment.nodes[node].label),
                    color: if inferred {
                        INFERRED_NODE_COLOR
                    } else {
                        GIVEN_NODE_COLOR
                    },
                });
            }
        }

        let mut dedup: BTreeMap<(usize, usize), String> = BTreeMap::new();
        for arc in &assignment.query.arcs {
            let key = (
                arc.node_a.min(arc.node_b),
                arc.node_a.max(arc.node_b),
            );
            let score = assignment.node_pair_score(
                self,
                arc.node_a,
                arc.node_b,
                assignment.nodes[arc.node_a].label,
                assignment.nodes[arc.node_b].label,
            );
            let s = dedup.entry(key).or_default();
            if !s.is_empty() {
                s.push_str(", ");
            }
            s.push_str(&format!("{} - {:.2}", self.dictionary.get(arc.rel), score));
        }
        for (id, ((source, target), label)) in dedup.into_iter().enumerate() {
            view.edges.push(GraphViewEdge {
                id,
                label,
                source,
                target,
            });
        }
        view
    }

    /// Sets every feature weight to `0.5 / regularization` and fixes the
    /// weight box to `[0, 1 / regularization]`.
    pub fn initialize_feature_weights(&mut self, regularization: f64) {
        self.regularizer = 1.0 / regularization;
        for weight in self.features.values() {
            weight.set(self.regularizer * 0.5);
        }
        for weight in self.factor_weights.values() {
            weight.set(self.regularizer * 0.5);
        }
    }

    /// Sets the equality penalty used by loss-augmented decoding.
    pub fn ssvm_init(&mut self, margin: f64) {
        self.svm_margin = margin;
    }

    /// Sets the candidate beam of the pseudolikelihood normalizer.
    pub fn pl_init(&mut self, beam: usize) {
        self.pl_beam = beam;
    }

    /// One max-margin training step on one reference assignment.
    ///
    /// Runs loss-augmented inference against the reference labeling, records
    /// precision of the decoded labeling, and applies the margin gradient
    /// into the weight table with atomic clamped adds. Safe to call from
    /// several threads at once.
    pub fn ssvm_learn(
        &self,
        reference: &NodeAssignment,
        learning_rate: f64,
        stats: &PrecisionStats,
    ) {
        let mut decoded = reference.clone();
        decoded.set_equality_penalty(self.svm_margin);
        self.map_inference(&mut decoded);

        decoded.compare(reference, stats);

        let mut affected: HashMap<ArcFeature, f64> = HashMap::new();
        let mut factor_affected: HashMap<u64, f64> = HashMap::new();
        reference.affected_features(&mut affected, learning_rate);
        reference.affected_factor_features(&mut factor_affected, learning_rate);
        decoded.affected_features(&mut affected, -learning_rate);
        decoded.affected_factor_features(&mut factor_affected, -learning_rate);
        self.apply_gradients(&affected, &factor_affected);
    }

    /// One pseudolikelihood training step on one reference assignment.
    ///
    /// For every inferred node, the conditional distribution over the node's
    /// candidate labels is estimated with a beam normalizer and each
    /// candidate contributes its negative expected count; the reference
    /// labeling contributes its counts scaled by the beam size. Safe to call
    /// from several threads at once.
    pub fn pl_learn(&self, reference: &NodeAssignment, learning_rate: f64) {
        let mut affected: HashMap<ArcFeature, f64> = HashMap::new();
        let mut factor_affected: HashMap<u64, f64> = HashMap::new();

        let mut candidates = vec![];
        for node in 0..reference.len() {
            if !reference.is_inferred(node) {
                continue;
            }
            candidates.clear();
            reference.label_candidates(self, node, &mut candidates, self.pl_beam);
            candidates.push(reference.label(node));

            let mut normalization = -reference.node_penalty(node);
            for &label in &candidates {
                normalization += reference.node_score_with(self, node, node, label).exp();
            }
            for &label in &candidates {
                let probability =
                    reference.node_score_with(self, node, node, label).exp() / normalization;
                reference.neighboring_affected_features(
                    &mut affected,
                    node,
                    label,
                    -learning_rate * probability,
                );
                reference.factor_affected_features_of_node(
                    &mut factor_affected,
                    node,
                    label,
                    -learning_rate * probability,
                );
            }
        }

        reference.affected_features(&mut affected, self.pl_beam as f64 * learning_rate);
        reference
            .affected_factor_features(&mut factor_affected, self.pl_beam as f64 * learning_rate);
        self.apply_gradients(&affected, &factor_affected);
    }

    fn apply_gradients(
        &self,
        affected: &HashMap<ArcFeature, f64>,
        factor_affected: &HashMap<u64, f64>,
    ) {
        for (feature, &gradient) in affected {
            if gradient.abs() > GRADIENT_EPSILON {
                if let Some(weight) = self.features.get(feature) {
                    weight.atomic_add_clamped(gradient, 0.0, self.regularizer);
                }
            }
        }
        for (hash, &gradient) in factor_affected {
            if gradient.abs() > GRADIENT_EPSILON {
                if let Some(weight) = self.factor_weights.get(hash) {
                    weight.atomic_add_clamped(gradient, 0.0, self.regularizer);
                }
            }
        }
    }

    pub(crate) fn factor_candidates(
        &self,
        factor_size: usize,
        giv_labels: &Factor,
        candidates: &mut Vec<Factor>,
        beam: usize,
    ) {
        if let Some(level) = self.factor_index.get(&factor_size) {
            let giv: Vec<LabelId> = giv_labels.iter().collect();
            level.get_factors(&giv, candidates, beam);
        }
    }

    pub(crate) fn snapshot_weights(&self) -> WeightSnapshot {
        WeightSnapshot {
            features: self
                .features
                .iter()
                .map(|(&f, w)| (f, w.value()))
                .collect(),
            factors: self
                .factor_weights
                .iter()
                .map(|(&h, w)| (h, w.value()))
                .collect(),
        }
    }

    pub(crate) fn restore_weights(&self, snapshot: &WeightSnapshot) {
        for &(feature, value) in &snapshot.features {
            if let Some(weight) = self.features.get(&feature) {
                weight.set(value);
            }
        }
        for &(hash, value) in &snapshot.factors {
            if let Some(weight) = self.factor_weights.get(&hash) {
                weight.set(value);
            }
        }
    }

    /// Writes the model to `<prefix>_features`, `<prefix>_strings` and, when
    /// an unknown label is configured, `<prefix>_lfreq`.
    pub fn save(&self, prefix: &str) -> Result<()> {
        info!(prefix, "saving model");
        let mut wtr = BufWriter::new(File::create(format!("{prefix}_features"))?);
        write_i32(&mut wtr, self.features.len() as i32)?;
        let mut features: Vec<(ArcFeature, f64)> = self
            .features
            .iter()
            .map(|(&f, w)| (f, w.value()))
            .collect();
        features.sort_unstable_by(|x, y| x.0.cmp(&y.0));
        for (feature, weight) in features {
            write_i32(&mut wtr, feature.a)?;
            write_i32(&mut wtr, feature.b)?;
            write_i32(&mut wtr, feature.rel)?;
            write_f64(&mut wtr, weight)?;
        }
        write_i32(&mut wtr, self.factor_set.len() as i32)?;
        for factor in &self.factor_set {
            write_i32(&mut wtr, factor.len() as i32)?;
            for label in factor.iter() {
                write_i32(&mut wtr, label)?;
            }
            let weight = self
                .factor_weights
                .get(&factor.feature_hash())
                .map_or(0.0, LockFreeWeight::value);
            write_f64(&mut wtr, weight)?;
        }
        wtr.flush()?;

        let mut wtr = BufWriter::new(File::create(format!("{prefix}_strings"))?);
        self.dictionary.save(&mut wtr)?;
        wtr.flush()?;

        if self.config.unknown_label.is_some() {
            let mut wtr = BufWriter::new(File::create(format!("{prefix}_lfreq"))?);
            write_i32(&mut wtr, self.label_freq.len() as i32)?;
            let mut freqs: Vec<(LabelId, u32)> =
                self.label_freq.iter().map(|(&l, &c)| (l, c)).collect();
            freqs.sort_unstable();
            for (label, count) in freqs {
                write_i32(&mut wtr, label)?;
                write_i32(&mut wtr, count as i32)?;
            }
            wtr.flush()?;
        }
        info!(prefix, "saving model done");
        Ok(())
    }

    /// Reads a model previously written with [`save`](Self::save) and
    /// prepares it for inference.
    pub fn load(prefix: &str, config: Config) -> Result<Self> {
        info!(prefix, "loading model");
        let mut model = Self::with_config(config);

        let mut rdr = BufReader::new(File::open(format!("{prefix}_features"))?);
        let num_features = read_len(&mut rdr)?;
        for _ in 0..num_features {
            let a = read_i32(&mut rdr)?;
            let b = read_i32(&mut rdr)?;
            let rel = read_i32(&mut rdr)?;
            let weight = read_f64(&mut rdr)?;
            model
                .features
                .insert(ArcFeature { a, b, rel }, LockFreeWeight::new(weight));
        }
        // The factor section is absent from models of the pairwise-only era.
        if let Some(num_factors) = read_i32_opt(&mut rdr)? {
            let num_factors = usize::try_from(num_factors)
                .map_err(|_| RumrfError::model_format("negative factor count"))?;
            for _ in 0..num_factors {
                let size = read_len(&mut rdr)?;
                let mut factor = Factor::new();
                for _ in 0..size {
                    factor.insert(read_i32(&mut rdr)?);
                }
                let weight = read_f64(&mut rdr)?;
                model
                    .factor_weights
                    .insert(factor.feature_hash(), LockFreeWeight::new(weight));
                model.factor_set.insert(factor);
            }
        }

        let mut rdr = BufReader::new(File::open(format!("{prefix}_strings"))?);
        model.dictionary = StringDictionary::load(&mut rdr)?;

        if model.config.unknown_label.is_some() {
            let mut rdr = BufReader::new(File::open(format!("{prefix}_lfreq"))?);
            let n = read_len(&mut rdr)?;
            for _ in 0..n {
                let label = read_i32(&mut rdr)?;
                let count = read_i32(&mut rdr)?;
                let count = u32::try_from(count)
                    .map_err(|_| RumrfError::model_format("negative label frequency"))?;
                model.label_freq.insert(label, count);
            }
        }
        info!(prefix, "loading model done");

        model.prepare()?;
        Ok(model)
    }
}

impl Default for GraphModel {
    fn default() -> Self {
        Self::new()
    }
}

fn write_i32<W: Write>(wtr: &mut W, v: i32) -> std::io::Result<()> {
    wtr.write_all(&v.to_le_bytes())
}

fn write_f64<W: Write>(wtr: &mut W, v: f64) -> std::io::Result<()> {
    wtr.write_all(&v.to_le_bytes())
}

fn read_i32<R: Read>(rdr: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    rdr.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

fn read_i32_opt<R: Read>(rdr: &mut R) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    match rdr.read_exact(&mut buf) {
        Ok(()) => Ok(Some(i32::from_le_bytes(buf))),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn read_f64<R: Read>(rdr: &mut R) -> Result<f64> {
    let mut buf = [0u8; 8];
    rdr.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn read_len<R: Read>(rdr: &mut R) -> Result<usize> {
    usize::try_from(read_i32(rdr)?).map_err(|_| RumrfError::model_format("negative length"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{
        group, init, prepared_model, relation, scope, standard_assignment, standard_infer_inits,
    };

    fn unique_prefix(tag: &str) -> String {
        let dir = std::env::temp_dir().join(format!("rumrf_{}_{}", tag, std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("model").to_str().unwrap().to_string()
    }

    #[test]
    fn test_pairwise_feature_picks_trained_labeling() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(&query, &standard_infer_inits());
        model.map_inference(&mut assignment);

        assert_eq!(assignment.label_name(0), Some("base"));
        // Given labels are untouched.
        assert_eq!(assignment.label_name(1), Some("AST_Node"));
        assert_eq!(assignment.label_name(3), Some("split"));
        // A node with no incident features keeps its starting label.
        assert_eq!(assignment.label_name(2), Some("b"));
    }

    #[test]
    fn test_group_factor_with_given_members() {
        let dataset = vec![TrainingQuery {
            features: vec![group(&[1, 2, 3])],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(&query, &standard_infer_inits());
        model.map_inference(&mut assignment);

        // The given labels at nodes 1 and 3 and the learned factor leave a
        // single free label for node 2.
        assert_eq!(assignment.label_name(2), Some("props"));
        assert_eq!(assignment.label_name(1), Some("AST_Node"));
        assert_eq!(assignment.label_name(3), Some("split"));
    }

    #[test]
    fn test_group_factor_all_inferred_permutation() {
        let dataset = vec![TrainingQuery {
            features: vec![group(&[0, 2])],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(&query, &standard_infer_inits());
        model.map_inference(&mut assignment);

        let mut labels = vec![
            assignment.label_name(0).unwrap().to_string(),
            assignment.label_name(2).unwrap().to_string(),
        ];
        labels.sort();
        assert_eq!(labels, vec!["base", "props"]);
    }

    #[test]
    fn test_inference_is_deterministic() {
        let dataset = vec![TrainingQuery {
            features: vec![group(&[0, 2]), relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);
        let query = model.create_query(&dataset[0].features);

        let mut first = model.create_assignment(&query, &standard_infer_inits());
        model.map_inference(&mut first);
        for _ in 0..3 {
            let mut again = model.create_assignment(&query, &standard_infer_inits());
            model.map_inference(&mut again);
            assert_eq!(first.node_labels(), again.node_labels());
        }
    }

    #[test]
    fn test_duplicate_labels_inside_group() {
        let dataset = vec![TrainingQuery {
            features: vec![group(&[0, 1, 2, 3])],
            assignments: vec![
                init(0, "split", false),
                init(1, "split", true),
                init(2, "split", false),
                init(3, "split", true),
            ],
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(
            &query,
            &[
                init(0, "a", false),
                init(1, "split", true),
                init(2, "b", false),
                init(3, "split", true),
            ],
        );
        model.map_inference(&mut assignment);

        assert_eq!(assignment.label_name(0), Some("split"));
        assert_eq!(assignment.label_name(2), Some("split"));
    }

    #[test]
    fn test_scope_keeps_labels_distinct() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 1, "r"), relation(2, 1, "r")],
            assignments: vec![
                init(0, "x", false),
                init(1, "anchor", true),
                init(2, "y", false),
            ],
        }];
        let model = prepared_model(Config::default(), &dataset);

        let records = vec![
            relation(0, 1, "r"),
            relation(2, 1, "r"),
            scope(&[0, 2]),
        ];
        let query = model.create_query(&records);
        let mut assignment = model.create_assignment(
            &query,
            &[
                init(0, "a", false),
                init(1, "anchor", true),
                init(2, "b", false),
            ],
        );
        model.map_inference(&mut assignment);

        let l0 = assignment.label_name(0).unwrap().to_string();
        let l2 = assignment.label_name(2).unwrap().to_string();
        assert_ne!(l0, l2);
        assert!(["x", "y"].contains(&l0.as_str()));
        assert!(["x", "y"].contains(&l2.as_str()));
        assert!(!assignment.has_conflict(0));
        assert!(!assignment.has_conflict(2));
    }

    #[test]
    fn test_duplicate_name_resolution_swaps_crossed_labels() {
        // good0 fits node 0's relation and good2 fits node 2's, but the
        // starting labels are crossed and guarded by a scope.
        let strong = TrainingQuery {
            features: vec![relation(0, 1, "ra"), relation(2, 1, "rb")],
            assignments: vec![
                init(0, "good0", false),
                init(1, "anchor", true),
                init(2, "good2", false),
            ],
        };
        let weak = TrainingQuery {
            features: vec![relation(0, 1, "ra"), relation(2, 1, "rb")],
            assignments: vec![
                init(0, "good2", false),
                init(1, "anchor", true),
                init(2, "good0", false),
            ],
        };
        let dataset = vec![strong.clone(), strong, weak];
        let model = prepared_model(Config::default(), &dataset);

        let records = vec![
            relation(0, 1, "ra"),
            relation(2, 1, "rb"),
            scope(&[0, 2]),
        ];
        let query = model.create_query(&records);
        let mut assignment = model.create_assignment(
            &query,
            &[
                init(0, "good2", false),
                init(1, "anchor", true),
                init(2, "good0", false),
            ],
        );
        model.map_inference(&mut assignment);

        assert_eq!(assignment.label_name(0), Some("good0"));
        assert_eq!(assignment.label_name(2), Some("good2"));
    }

    #[test]
    fn test_validator_excludes_labels_from_candidates() {
        let dataset = vec![
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "x", false), init(1, "anchor", true)],
            },
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "x", false), init(1, "anchor", true)],
            },
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "y", false), init(1, "anchor", true)],
            },
        ];
        let mut model = GraphModel::new();
        for query in &dataset {
            model.add_query(query);
        }
        model
            .checker
            .load_str("-x\n+y\n+anchor\n", &model.dictionary)
            .unwrap();
        model.prepare().unwrap();

        // x has twice y's weight but is forbidden.
        assert_eq!(model.arc_weight("x", "anchor", "r"), Some(2.0));
        let labels = model.infer(
            &dataset[0].features,
            &[init(0, "a", false), init(1, "anchor", true)],
        );
        assert_eq!(labels.iter().find(|l| l.node == 0).unwrap().label, "y");
    }

    #[test]
    fn test_weight_box_after_oversized_gradients() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }];
        let mut model = prepared_model(Config::default(), &dataset);
        model.initialize_feature_weights(2.0);
        for weight in model.features.values() {
            assert_eq!(weight.value(), 0.25);
        }

        let feature = *model.features.keys().next().unwrap();
        let mut affected = HashMap::new();
        affected.insert(feature, 10.0);
        model.apply_gradients(&affected, &HashMap::new());
        assert_eq!(model.features[&feature].value(), 0.5);

        affected.insert(feature, -10.0);
        model.apply_gradients(&affected, &HashMap::new());
        assert_eq!(model.features[&feature].value(), 0.0);
    }

    #[test]
    fn test_save_load_round_trip() {
        let dataset = vec![
            TrainingQuery {
                features: vec![relation(0, 3, "mock"), group(&[1, 2, 3])],
                assignments: standard_assignment(),
            },
            TrainingQuery {
                features: vec![relation(0, 1, "other")],
                assignments: vec![init(0, "base", false), init(1, "step", true)],
            },
        ];
        let mut model = prepared_model(Config::default(), &dataset);
        model.initialize_feature_weights(4.0);

        let prefix = unique_prefix("round_trip");
        model.save(&prefix).unwrap();
        let restored = GraphModel::load(&prefix, Config::default()).unwrap();

        assert_eq!(restored.num_arc_features(), model.num_arc_features());
        assert_eq!(restored.num_factor_features(), model.num_factor_features());
        for (feature, weight) in &model.features {
            assert_eq!(
                restored.features[feature].value().to_bits(),
                weight.value().to_bits()
            );
        }
        assert_eq!(restored.factor_set, model.factor_set);
        for factor in &model.factor_set {
            let hash = factor.feature_hash();
            assert_eq!(
                restored.factor_weights[&hash].value().to_bits(),
                model.factor_weights[&hash].value().to_bits()
            );
        }
        let original: Vec<_> = model.dictionary.iter().collect();
        let reloaded: Vec<_> = restored.dictionary.iter().collect();
        assert_eq!(original, reloaded);

        // The restored model infers like the original.
        let labels = restored.infer(&dataset[0].features, &standard_infer_inits());
        assert_eq!(labels.iter().find(|l| l.node == 2).unwrap().label, "props");
    }

    #[test]
    fn test_load_truncated_model_fails() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);
        let prefix = unique_prefix("truncated");
        model.save(&prefix).unwrap();

        let path = format!("{prefix}_features");
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 6]).unwrap();
        assert!(GraphModel::load(&prefix, Config::default()).is_err());
    }

    #[test]
    fn test_rare_labels_are_replaced_with_unknown() {
        let config = Config {
            unknown_label: Some("<unk>".to_string()),
            min_freq_known_label: 2,
            ..Config::default()
        };
        let dataset = vec![
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "common", true), init(1, "rare", false)],
            },
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "common", true), init(1, "common", false)],
            },
        ];
        let model = prepared_model(config.clone(), &dataset);

        // "rare" appeared in one query only: its features fold into <unk>.
        assert_eq!(model.arc_weight("common", "rare", "r"), None);
        assert_eq!(model.arc_weight("common", "<unk>", "r"), Some(1.0));

        let prefix = unique_prefix("rare_labels");
        model.save(&prefix).unwrap();
        let restored = GraphModel::load(&prefix, config).unwrap();

        let records = vec![relation(0, 1, "r")];
        let query = restored.create_query(&records);
        let inits = vec![init(0, "common", true), init(1, "rare", false)];
        let mut assignment = restored.create_assignment(&query, &inits);
        let reference = restored.create_assignment(&query, &inits);
        restored.map_inference(&mut assignment);

        assert_eq!(assignment.label_name(1), Some("<unk>"));

        // Unknown predictions count as incorrect and are excluded from the
        // known predictions.
        let stats = crate::trainer::PrecisionStats::new();
        assignment.compare(&reference, &stats);
        let counts = stats.counts();
        assert_eq!(counts.correct_labels, 0);
        assert_eq!(counts.incorrect_labels, 1);
        assert_eq!(counts.num_known_predictions, 0);
    }

    #[test]
    fn test_nbest_orders_candidates_by_score() {
        let dataset = vec![
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "x", false), init(1, "anchor", true)],
            },
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "x", false), init(1, "anchor", true)],
            },
            TrainingQuery {
                features: vec![relation(0, 1, "r")],
                assignments: vec![init(0, "y", false), init(1, "anchor", true)],
            },
        ];
        let model = prepared_model(Config::default(), &dataset);

        let records = vec![relation(0, 1, "r")];
        let query = model.create_query(&records);
        let mut assignment = model
            .create_assignment(&query, &[init(0, "a", false), init(1, "anchor", true)]);
        let distributions = model.nbest(&mut assignment, 2, false);

        assert_eq!(distributions.len(), 1);
        let dist = &distributions[0];
        assert_eq!(dist.node, 0);
        assert_eq!(dist.candidates.len(), 2);
        assert_eq!(dist.candidates[0].label, "x");
        assert!((dist.candidates[0].score - 2.0).abs() < f64::EPSILON);
        assert_eq!(dist.candidates[1].label, "y");
        assert!((dist.candidates[1].score - 1.0).abs() < f64::EPSILON);

        let truncated = model.nbest(&mut assignment, 1, false);
        assert_eq!(truncated[0].candidates.len(), 1);
    }

    #[test]
    fn test_graph_view_nodes_and_deduped_edges() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 1, "r"), relation(1, 0, "s")],
            assignments: vec![init(0, "x", false), init(1, "anchor", true)],
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model
            .create_assignment(&query, &[init(0, "x", false), init(1, "anchor", true)]);
        let view = model.graph_view(&mut assignment, false);

        assert_eq!(view.nodes.len(), 2);
        let node0 = view.nodes.iter().find(|n| n.id == 0).unwrap();
        assert_eq!(node0.color, INFERRED_NODE_COLOR);
        assert_eq!(node0.label, "x");
        let node1 = view.nodes.iter().find(|n| n.id == 1).unwrap();
        assert_eq!(node1.color, GIVEN_NODE_COLOR);

        // Both directed arcs collapse into one undirected edge.
        assert_eq!(view.edges.len(), 1);
        let edge = &view.edges[0];
        assert_eq!((edge.source, edge.target), (0, 1));
        assert!(edge.label.contains("r - "));
        assert!(edge.label.contains(", "));
        assert!(edge.label.contains("s - "));
    }

    #[test]
    fn test_unknown_relation_keeps_labels() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 1, "r")],
            assignments: vec![init(0, "x", false), init(1, "anchor", true)],
        }];
        let model = prepared_model(Config::default(), &dataset);

        let labels = model.infer(
            &[relation(0, 1, "never_trained")],
            &[init(0, "a", false), init(1, "anchor", true)],
        );
        assert_eq!(labels.iter().find(|l| l.node == 0).unwrap().label, "a");
    }

    #[test]
    fn test_compare_errors_reports_disagreements() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(&query, &standard_assignment());
        let reference = model.create_assignment(&query, &standard_assignment());
        assignment.clear_inferred();
        // Node 0 is recoverable; node 2 has no features and stays unlabeled.
        model.map_inference(&mut assignment);

        let stats = crate::trainer::LabelErrorStats::new();
        assignment.compare_errors(&reference, &stats);
        let errors = stats.errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors.get("props -> [keep-original]"), Some(&1));
    }

    #[test]
    fn test_assignment_score_matches_weights() {
        let dataset = vec![TrainingQuery {
            features: vec![relation(0, 3, "mock"), group(&[1, 2, 3])],
            assignments: standard_assignment(),
        }];
        let model = prepared_model(Config::default(), &dataset);

        let query = model.create_query(&dataset[0].features);
        let mut assignment = model.create_assignment(&query, &standard_assignment());
        // One arc feature and one factor, each with co-occurrence weight 1.
        assert!((model.assignment_score(&assignment) - 2.0).abs() < f64::EPSILON);

        assignment.set_equality_penalty(0.25);
        // Two inferred nodes keep their penalized labels.
        assert!((model.assignment_score(&assignment) - 1.5).abs() < f64::EPSILON);
        assignment.clear_penalty();
        assert!((model.assignment_score(&assignment) - 2.0).abs() < f64::EPSILON);
    }
}
