//! # rumrf
//!
//! MAP inference and structured learning over labeled multigraphs,
//! implemented in pure Rust.
//!
//! A model scores a labeling of a query graph with typed pairwise features
//! over label pairs and unordered factor features over label multisets.
//! Inference is an approximate beam search (greedy seeding, loopy belief
//! propagation, per-node, per-arc and per-factor passes) under all-different
//! scope constraints and a label validator. Models are trained from labeled
//! graphs by max-margin (structured SVM) or pseudolikelihood gradient
//! descent, with lock-free parallel weight updates.
//!
//! ## Examples
//!
//! ```
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use rumrf::{FeatureRecord, GraphModel, NodeInit, Trainer, TrainingQuery};
//!
//! // One training record: node 0 relates to node 1, and the reference
//! // labeling names them width and height.
//! let record = TrainingQuery {
//!     features: vec![FeatureRecord::Relation {
//!         a: 0,
//!         b: 1,
//!         rel: "left_of".into(),
//!     }],
//!     assignments: vec![
//!         NodeInit { node: 0, label: "width".into(), given: false },
//!         NodeInit { node: 1, label: "height".into(), given: true },
//!     ],
//! };
//!
//! let mut model = GraphModel::new();
//! model.add_query(&record);
//! model.prepare()?;
//!
//! let trainer = Trainer::new().num_passes(4)?.n_threads(1)?;
//! trainer.train(&mut model, std::slice::from_ref(&record))?;
//!
//! // At serving time node 0 is unknown; the learned pairwise feature
//! // recovers its label from the given neighbor.
//! let labels = model.infer(
//!     &record.features,
//!     &[
//!         NodeInit { node: 0, label: "tmp".into(), given: false },
//!         NodeInit { node: 1, label: "height".into(), given: true },
//!     ],
//! );
//! assert_eq!(labels.iter().find(|l| l.node == 0).unwrap().label, "width");
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]

mod assignment;
mod config;
mod dictionary;
mod errors;
mod factor;
mod label_checker;
mod label_set;
mod loopy_bp;
mod math;
mod model;
mod query;
mod trainer;
mod weight;

#[cfg(test)]
mod test_utils;

/// A label id: a non-negative integer naming an interned label, or a
/// request-local id past the dictionary's end. Negative values mean absent.
pub type LabelId = i32;

/// A relation type id, interned in the same dictionary as labels.
pub type RelId = i32;

pub(crate) const NO_LABEL: LabelId = -1;

pub use assignment::{NBestCandidate, NBestDistribution, NodeAssignment, NodeLabel};
pub use config::{Config, PlSchedule, TrainingMethod};
pub use dictionary::StringDictionary;
pub use errors::{
    InvalidArgumentError, ModelFormatError, Result, RuleSyntaxError, RumrfError,
};
pub use factor::Factor;
pub use label_checker::LabelChecker;
pub use model::{ArcFeature, GraphModel, GraphView, GraphViewEdge, GraphViewNode};
pub use query::{FeatureRecord, GraphQuery, NodeInit, TrainingQuery};
pub use trainer::{LabelErrorStats, PrecisionCounts, PrecisionStats, Trainer};
pub use weight::LockFreeWeight;
