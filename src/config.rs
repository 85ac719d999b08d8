use std::path::PathBuf;

/// Training objective selection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrainingMethod {
    /// Structured SVM (max-margin with loss-augmented decoding).
    Ssvm,

    /// Pseudolikelihood gradient descent.
    Pl,

    /// Pseudolikelihood for the first epochs, then structured SVM without
    /// re-initializing the weights.
    PlSsvm,
}

/// Learning-rate schedule for pseudolikelihood training.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PlSchedule {
    /// Keep the learning rate fixed.
    Fixed,

    /// Divide the learning rate by `sqrt(pass + 1)` each pass.
    PropSqrtPass,

    /// Divide the learning rate by `pass + 1` each pass.
    PropPass,

    /// Set the rate to `initial / (1 + lambda * (pass + 1))` each pass.
    PropPassAndInitialRate,
}

/// Inference-side configuration of a [`GraphModel`](crate::GraphModel).
///
/// The defaults reproduce the engine's standard behavior; construct with
/// `Config::default()` and override individual fields.
#[derive(Clone, Debug)]
pub struct Config {
    /// Run the greedy seeding pass before local search.
    pub initial_greedy_assignment_pass: bool,

    /// Resolve duplicate-label conflicts with swap-like moves in the
    /// per-node pass.
    pub duplicate_name_resolution: bool,

    /// Number of per-node optimization passes.
    pub per_node_passes: u32,

    /// Number of per-arc optimization passes.
    pub per_arc_passes: u32,

    /// Number of per-factor optimization passes.
    pub per_factor_passes: u32,

    /// Number of loopy belief propagation passes.
    pub loopy_bp_passes: u32,

    /// Message-update rounds inside each belief propagation pass.
    pub loopy_bp_steps_per_pass: u32,

    /// Skip the per-arc pass for arcs whose endpoint degree exceeds this.
    pub skip_per_arc_optimization_above_degree: usize,

    /// Use factor features at all.
    pub use_factors: bool,

    /// Maximum depth of the factor candidate index.
    pub maximum_depth: usize,

    /// Maximum number of factor candidates considered per factor.
    pub factors_limit: usize,

    /// Maximum number of label permutations evaluated per candidate factor.
    pub permutations_beam_size: u64,

    /// Path of the label rules file, if labels are restricted.
    pub valid_labels: Option<PathBuf>,

    /// The label absorbing rare training labels, if configured.
    pub unknown_label: Option<String>,

    /// Minimum number of training queries a label must appear in to stay
    /// known. Zero disables rare-label replacement.
    pub min_freq_known_label: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_greedy_assignment_pass: true,
            duplicate_name_resolution: true,
            per_node_passes: 8,
            per_arc_passes: 5,
            per_factor_passes: 1,
            loopy_bp_passes: 0,
            loopy_bp_steps_per_pass: 3,
            skip_per_arc_optimization_above_degree: 32,
            use_factors: true,
            maximum_depth: 2,
            factors_limit: 128,
            permutations_beam_size: 64,
            valid_labels: None,
            unknown_label: None,
            min_freq_known_label: 0,
        }
    }
}
