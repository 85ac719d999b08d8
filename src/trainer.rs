use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;

use rand::seq::SliceRandom;
use tracing::info;

use crate::config::{PlSchedule, TrainingMethod};
use crate::errors::{Result, RumrfError};
use crate::model::GraphModel;
use crate::query::TrainingQuery;

/// Precision counters of one comparison or one epoch.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PrecisionCounts {
    /// Correctly predicted labels. An unknown prediction is never correct.
    pub correct_labels: u64,
    /// Incorrectly predicted labels.
    pub incorrect_labels: u64,
    /// Predictions that were not the unknown label.
    pub num_known_predictions: u64,
}

impl PrecisionCounts {
    /// Adds another set of counters into this one.
    pub fn add(&mut self, other: &PrecisionCounts) {
        self.correct_labels += other.correct_labels;
        self.incorrect_labels += other.incorrect_labels;
        self.num_known_predictions += other.num_known_predictions;
    }

    /// Fraction of predictions that were incorrect; zero when empty.
    #[must_use]
    pub fn error_rate(&self) -> f64 {
        let total = self.correct_labels + self.incorrect_labels;
        if total == 0 {
            return 0.0;
        }
        self.incorrect_labels as f64 / total as f64
    }
}

/// Shared precision counters, updated under a short lock per query.
#[derive(Debug, Default)]
pub struct PrecisionStats {
    counts: Mutex<PrecisionCounts>,
}

impl PrecisionStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one query's counters.
    pub fn record(&self, counts: PrecisionCounts) {
        self.counts.lock().unwrap().add(&counts);
    }

    /// Returns a copy of the accumulated counters.
    #[must_use]
    pub fn counts(&self) -> PrecisionCounts {
        *self.counts.lock().unwrap()
    }
}

/// Counts of observed label errors, keyed by `"reference -> predicted"`.
#[derive(Debug, Default)]
pub struct LabelErrorStats {
    errors: Mutex<BTreeMap<String, u64>>,
}

impl LabelErrorStats {
    /// Creates an empty error table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one observed error.
    pub fn record(&self, error: String) {
        *self.errors.lock().unwrap().entry(error).or_insert(0) += 1;
    }

    /// Returns a copy of the accumulated error counts.
    #[must_use]
    pub fn errors(&self) -> BTreeMap<String, u64> {
        self.errors.lock().unwrap().clone()
    }
}

/// Structured trainer over a prepared [`GraphModel`].
///
/// The model must have seen every training record through
/// [`GraphModel::add_query`] and been prepared before training starts, so
/// that all feature weights exist. Epochs run the per-query learning steps
/// on a pool of worker threads that update the shared weight table with
/// atomic clamped adds.
pub struct Trainer {
    method: TrainingMethod,
    num_passes: u32,
    num_pass_change_training: u32,
    n_threads: usize,
    regularization: f64,
    margin: f64,
    max_labels_z: usize,
    start_learning_rate: f64,
    stop_learning_rate: f64,
    initial_learning_rate_ssvm: f64,
    pl_schedule: PlSchedule,
    pl_lambda: f64,
}

impl Trainer {
    /// Creates a trainer with the default settings.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            method: TrainingMethod::Ssvm,
            num_passes: 24,
            num_pass_change_training: 10,
            n_threads: 8,
            regularization: 2.0,
            margin: 0.1,
            max_labels_z: 16,
            start_learning_rate: 0.1,
            stop_learning_rate: 1e-4,
            initial_learning_rate_ssvm: 0.1,
            pl_schedule: PlSchedule::PropPass,
            pl_lambda: 1.0,
        }
    }

    /// Sets the training method.
    #[must_use]
    pub const fn method(mut self, method: TrainingMethod) -> Self {
        self.method = method;
        self
    }

    /// Sets the number of training passes.
    ///
    /// # Errors
    ///
    /// `num_passes` must be >= 1.
    pub const fn num_passes(mut self, num_passes: u32) -> Result<Self> {
        if num_passes == 0 {
            return Err(RumrfError::invalid_argument("num_passes must be >= 1"));
        }
        self.num_passes = num_passes;
        Ok(self)
    }

    /// Sets after how many passes combined training switches from
    /// pseudolikelihood to max-margin.
    #[must_use]
    pub const fn num_pass_change_training(mut self, num_passes: u32) -> Self {
        self.num_pass_change_training = num_passes;
        self
    }

    /// Sets the number of worker threads.
    ///
    /// # Errors
    ///
    /// `n_threads` must be >= 1.
    pub const fn n_threads(mut self, n_threads: usize) -> Result<Self> {
        if n_threads == 0 {
            return Err(RumrfError::invalid_argument("n_threads must be >= 1"));
        }
        self.n_threads = n_threads;
        Ok(self)
    }

    /// Sets the regularization constant; weights stay in
    /// `[0, 1 / regularization]`.
    ///
    /// # Errors
    ///
    /// `regularization` must be > 0.
    pub fn regularization(mut self, regularization: f64) -> Result<Self> {
        if regularization <= 0.0 {
            return Err(RumrfError::invalid_argument("regularization must be > 0"));
        }
        self.regularization = regularization;
        Ok(self)
    }

    /// Sets the margin penalty for keeping a reference label during
    /// loss-augmented decoding.
    ///
    /// # Errors
    ///
    /// `margin` must be >= 0.
    pub fn margin(mut self, margin: f64) -> Result<Self> {
        if margin < 0.0 {
            return Err(RumrfError::invalid_argument("margin must be >= 0"));
        }
        self.margin = margin;
        Ok(self)
    }

    /// Sets the candidate beam of the pseudolikelihood normalizer.
    ///
    /// # Errors
    ///
    /// `max_labels_z` must be >= 1.
    pub const fn max_labels_z(mut self, max_labels_z: usize) -> Result<Self> {
        if max_labels_z == 0 {
            return Err(RumrfError::invalid_argument("max_labels_z must be >= 1"));
        }
        self.max_labels_z = max_labels_z;
        Ok(self)
    }

    /// Sets the initial learning rate.
    ///
    /// # Errors
    ///
    /// `rate` must be > 0.
    pub fn start_learning_rate(mut self, rate: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(RumrfError::invalid_argument(
                "start_learning_rate must be > 0",
            ));
        }
        self.start_learning_rate = rate;
        Ok(self)
    }

    /// Sets the learning rate below which training stops.
    ///
    /// # Errors
    ///
    /// `rate` must be > 0.
    pub fn stop_learning_rate(mut self, rate: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(RumrfError::invalid_argument(
                "stop_learning_rate must be > 0",
            ));
        }
        self.stop_learning_rate = rate;
        Ok(self)
    }

    /// Sets the learning rate the max-margin phase of combined training
    /// starts from.
    ///
    /// # Errors
    ///
    /// `rate` must be > 0.
    pub fn initial_learning_rate_ssvm(mut self, rate: f64) -> Result<Self> {
        if rate <= 0.0 {
            return Err(RumrfError::invalid_argument(
                "initial_learning_rate_ssvm must be > 0",
            ));
        }
        self.initial_learning_rate_ssvm = rate;
        Ok(self)
    }

    /// Sets the pseudolikelihood learning-rate schedule.
    #[must_use]
    pub const fn pl_schedule(mut self, schedule: PlSchedule) -> Self {
        self.pl_schedule = schedule;
        self
    }

    /// Sets the lambda of the
    /// [`PropPassAndInitialRate`](PlSchedule::PropPassAndInitialRate)
    /// schedule.
    ///
    /// # Errors
    ///
    /// `lambda` must be >= 0.
    pub fn pl_lambda(mut self, lambda: f64) -> Result<Self> {
        if lambda < 0.0 {
            return Err(RumrfError::invalid_argument("pl_lambda must be >= 0"));
        }
        self.pl_lambda = lambda;
        Ok(self)
    }

    /// Trains the model on a dataset with the configured method.
    ///
    /// The model must already hold every record's features (via
    /// [`GraphModel::add_query`]) and be prepared.
    ///
    /// # Errors
    ///
    /// Fails if re-preparing the model between epochs fails.
    pub fn train(&self, model: &mut GraphModel, dataset: &[TrainingQuery]) -> Result<()> {
        match self.method {
            TrainingMethod::Ssvm => {
                model.initialize_feature_weights(self.regularization);
                model.ssvm_init(self.margin);
                self.ssvm_epochs(model, dataset, self.start_learning_rate, self.num_passes)
            }
            TrainingMethod::Pl => {
                model.initialize_feature_weights(self.regularization);
                model.pl_init(self.max_labels_z);
                self.pl_epochs(model, dataset, self.start_learning_rate, self.num_passes)
            }
            TrainingMethod::PlSsvm => {
                model.initialize_feature_weights(self.regularization);
                model.pl_init(self.max_labels_z);
                self.pl_epochs(
                    model,
                    dataset,
                    self.start_learning_rate,
                    self.num_pass_change_training,
                )?;
                // The max-margin phase continues on the weights the
                // pseudolikelihood phase produced.
                model.ssvm_init(self.margin);
                self.ssvm_epochs(
                    model,
                    dataset,
                    self.initial_learning_rate_ssvm,
                    self.num_passes,
                )
            }
        }
    }

    /// Runs inference over a dataset and measures precision against the
    /// reference labelings. Inferred labels are cleared before decoding, so
    /// the model predicts from the given labels alone.
    #[must_use]
    pub fn evaluate(&self, model: &GraphModel, dataset: &[TrainingQuery]) -> PrecisionCounts {
        let stats = PrecisionStats::new();
        let order: Vec<usize> = (0..dataset.len()).collect();
        self.for_each_parallel(dataset, &order, |record| {
            let query = model.create_query(&record.features);
            let mut assignment = model.create_assignment(&query, &record.assignments);
            let reference = model.create_assignment(&query, &record.assignments);
            assignment.clear_inferred();
            model.map_inference(&mut assignment);
            assignment.compare(&reference, &stats);
        });
        let counts = stats.counts();
        info!(
            correct = counts.correct_labels,
            incorrect = counts.incorrect_labels,
            known = counts.num_known_predictions,
            error_rate = counts.error_rate(),
            "evaluation done"
        );
        counts
    }

    fn ssvm_epochs(
        &self,
        model: &mut GraphModel,
        dataset: &[TrainingQuery],
        start_learning_rate: f64,
        num_passes: u32,
    ) -> Result<()> {
        info!(
            start_learning_rate,
            regularization = self.regularization,
            margin = self.margin,
            "starting max-margin training"
        );
        let mut learning_rate = start_learning_rate;
        let mut last_error_rate = 1.0;
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = rand::thread_rng();

        for pass in 0..num_passes {
            let backup = model.snapshot_weights();
            order.shuffle(&mut rng);
            let stats = PrecisionStats::new();
            {
                let model = &*model;
                self.for_each_parallel(dataset, &order, |record| {
                    let query = model.create_query(&record.features);
                    let assignment = model.create_assignment(&query, &record.assignments);
                    model.ssvm_learn(&assignment, learning_rate, &stats);
                });
            }
            let counts = stats.counts();
            let error_rate = counts.error_rate();
            info!(
                pass,
                learning_rate,
                error_rate,
                correct = counts.correct_labels,
                incorrect = counts.incorrect_labels,
                "finished max-margin pass"
            );
            if error_rate > last_error_rate {
                info!(pass, "error rate rose, reverting pass");
                learning_rate *= 0.5;
                model.restore_weights(&backup);
                if learning_rate < self.stop_learning_rate {
                    break;
                }
            } else {
                last_error_rate = error_rate;
            }
            model.prepare()?;
        }
        Ok(())
    }

    fn pl_epochs(
        &self,
        model: &mut GraphModel,
        dataset: &[TrainingQuery],
        start_learning_rate: f64,
        num_passes: u32,
    ) -> Result<()> {
        info!(
            start_learning_rate,
            regularization = self.regularization,
            max_labels_z = self.max_labels_z,
            "starting pseudolikelihood training"
        );
        let mut learning_rate = start_learning_rate;
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        let mut rng = rand::thread_rng();

        for pass in 0..num_passes {
            match self.pl_schedule {
                PlSchedule::Fixed => {}
                PlSchedule::PropSqrtPass => learning_rate /= f64::from(pass + 1).sqrt(),
                PlSchedule::PropPass => learning_rate /= f64::from(pass + 1),
                PlSchedule::PropPassAndInitialRate => {
                    learning_rate =
                        start_learning_rate / (1.0 + self.pl_lambda * f64::from(pass + 1));
                }
            }
            order.shuffle(&mut rng);
            {
                let model = &*model;
                self.for_each_parallel(dataset, &order, |record| {
                    let query = model.create_query(&record.features);
                    let assignment = model.create_assignment(&query, &record.assignments);
                    model.pl_learn(&assignment, learning_rate);
                });
            }
            info!(pass, learning_rate, "finished pseudolikelihood pass");
            if learning_rate < self.stop_learning_rate {
                break;
            }
            model.prepare()?;
        }
        Ok(())
    }

    fn for_each_parallel<F>(&self, dataset: &[TrainingQuery], order: &[usize], f: F)
    where
        F: Fn(&TrainingQuery) + Send + Sync,
    {
        let (s, r) = crossbeam_channel::unbounded();
        for &i in order {
            s.send(&dataset[i]).unwrap();
        }
        thread::scope(|scope| {
            for _ in 0..self.n_threads {
                scope.spawn(|| {
                    while let Ok(record) = r.try_recv() {
                        f(record);
                    }
                });
            }
        });
    }
}

impl Default for Trainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils::{init, prepared_model, relation, standard_assignment};
    use crate::Config;

    fn pairwise_dataset() -> Vec<TrainingQuery> {
        vec![TrainingQuery {
            features: vec![relation(0, 3, "mock")],
            assignments: standard_assignment(),
        }]
    }

    #[test]
    fn test_builder_rejects_bad_arguments() {
        assert!(Trainer::new().num_passes(0).is_err());
        assert!(Trainer::new().n_threads(0).is_err());
        assert!(Trainer::new().regularization(0.0).is_err());
        assert!(Trainer::new().margin(-0.1).is_err());
        assert!(Trainer::new().max_labels_z(0).is_err());
        assert!(Trainer::new().start_learning_rate(0.0).is_err());
        assert!(Trainer::new().stop_learning_rate(-1.0).is_err());
        assert!(Trainer::new().pl_lambda(-1.0).is_err());
    }

    #[test]
    fn test_precision_counts() {
        let stats = PrecisionStats::new();
        stats.record(PrecisionCounts {
            correct_labels: 3,
            incorrect_labels: 1,
            num_known_predictions: 4,
        });
        stats.record(PrecisionCounts {
            correct_labels: 1,
            incorrect_labels: 3,
            num_known_predictions: 2,
        });
        let counts = stats.counts();
        assert_eq!(counts.correct_labels, 4);
        assert_eq!(counts.incorrect_labels, 4);
        assert_eq!(counts.num_known_predictions, 6);
        assert!((counts.error_rate() - 0.5).abs() < f64::EPSILON);
        assert_eq!(PrecisionCounts::default().error_rate(), 0.0);
    }

    #[test]
    fn test_ssvm_training_keeps_weights_in_box() {
        let dataset = pairwise_dataset();
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new()
            .num_passes(4)
            .unwrap()
            .n_threads(1)
            .unwrap()
            .regularization(2.0)
            .unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        for weight in model.features.values() {
            let v = weight.value();
            assert!((0.0..=0.5).contains(&v), "weight {v} escaped the box");
        }
    }

    #[test]
    fn test_ssvm_training_predicts_training_labels() {
        let dataset = pairwise_dataset();
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new().num_passes(2).unwrap().n_threads(1).unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        let labels = model.infer(
            &dataset[0].features,
            &[
                init(0, "a", false),
                init(1, "AST_Node", true),
                init(2, "b", false),
                init(3, "split", true),
            ],
        );
        let node0 = labels.iter().find(|l| l.node == 0).unwrap();
        assert_eq!(node0.label, "base");
        assert!(!node0.given);
    }

    #[test]
    fn test_pl_training_smoke() {
        let dataset = pairwise_dataset();
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new()
            .method(TrainingMethod::Pl)
            .num_passes(3)
            .unwrap()
            .n_threads(1)
            .unwrap();
        trainer.train(&mut model, &dataset).unwrap();
        for weight in model.features.values() {
            let v = weight.value();
            assert!((0.0..=0.5).contains(&v));
        }
    }

    #[test]
    fn test_combined_training_smoke() {
        let dataset = pairwise_dataset();
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new()
            .method(TrainingMethod::PlSsvm)
            .num_passes(3)
            .unwrap()
            .num_pass_change_training(2)
            .n_threads(1)
            .unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        let labels = model.infer(
            &dataset[0].features,
            &[init(0, "a", false), init(3, "split", true)],
        );
        assert_eq!(
            labels.iter().find(|l| l.node == 0).unwrap().label,
            "base"
        );
    }

    #[test]
    fn test_evaluate_after_training() {
        let dataset = pairwise_dataset();
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new().num_passes(2).unwrap().n_threads(1).unwrap();
        trainer.train(&mut model, &dataset).unwrap();

        let counts = trainer.evaluate(&model, &dataset);
        // Node 0 is recovered from the given neighbor; node 2 has no
        // incident features and stays unlabeled.
        assert_eq!(counts.correct_labels, 1);
        assert_eq!(counts.incorrect_labels, 1);
        assert_eq!(counts.num_known_predictions, 1);
    }

    #[test]
    fn test_parallel_training_runs() {
        // Several copies of the record and several workers exercising the
        // atomic weight updates.
        let mut dataset = vec![];
        for _ in 0..16 {
            dataset.push(pairwise_dataset().pop().unwrap());
        }
        let mut model = prepared_model(Config::default(), &dataset);
        let trainer = Trainer::new().num_passes(2).unwrap().n_threads(4).unwrap();
        trainer.train(&mut model, &dataset).unwrap();
        for weight in model.features.values() {
            let v = weight.value();
            assert!((0.0..=0.5).contains(&v));
        }
    }
}
