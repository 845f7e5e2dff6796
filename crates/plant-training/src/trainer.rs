//! Training orchestrator.
//!
//! Per epoch:
//! 1. one pass over the training loader, one optimizer step per batch
//! 2. a gradient-free pass over the validation loader, if any
//! 3. the plateau scheduler sees the validation accuracy
//! 4. a strictly better validation accuracy resets the early-stop counter
//!    and writes the `best` checkpoint, anything else increments it
//!
//! The run ends when the counter reaches the patience, when the epoch budget
//! is used up, or when the stop flag is raised between epochs. The `latest`
//! checkpoint is written whichever way it ends. A failed step aborts the
//! run before any state for that epoch is recorded.

use crate::checkpoint::{CheckpointStore, CheckpointTag};
use crate::lr_schedule::{PlateauScheduler, SchedulerState};
use crate::model::{StepOutput, TrainableModel};
use plant_core::{
    EpochMetrics, Error, EvaluationMetrics, MetricAccumulator, PlateauConfig, Result,
    TrainingConfig, TrainingHistory,
};
use plant_dataset::{Batch, BatchSource};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Configuration for the trainer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub num_epochs: usize,
    pub learning_rate: f64,
    /// Stagnant epochs tolerated before stopping
    pub early_stopping_patience: usize,
    pub scheduler: PlateauConfig,
    pub save_dir: PathBuf,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            learning_rate: 0.001,
            early_stopping_patience: 5,
            scheduler: PlateauConfig::default(),
            save_dir: PathBuf::from("models"),
        }
    }
}

impl From<&TrainingConfig> for TrainerConfig {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            num_epochs: config.training.num_epochs,
            learning_rate: config.training.learning_rate,
            early_stopping_patience: config.training.early_stopping_patience,
            scheduler: config.scheduler,
            save_dir: config.output.save_dir.clone(),
        }
    }
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::InvalidArgument("Number of epochs must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "Learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.early_stopping_patience == 0 {
            return Err(Error::InvalidArgument(
                "Early stopping patience must be at least 1".into(),
            ));
        }
        self.scheduler.validate()
    }
}

/// Training state for checkpointing and resumption
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Completed epochs
    pub epoch: usize,
    pub history: TrainingHistory,
    /// Best validation accuracy so far, `None` before the first validated epoch
    pub best_valid_acc: Option<f64>,
    /// Consecutive epochs without a new best
    pub patience_counter: usize,
    pub scheduler_state: SchedulerState,
    /// Serialized optimizer, stored as its own checkpoint section
    #[serde(skip)]
    pub optimizer_state: Vec<u8>,
}

impl TrainingState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            epoch: 0,
            history: TrainingHistory::new(),
            best_valid_acc: None,
            patience_counter: 0,
            scheduler_state: SchedulerState::new(learning_rate),
            optimizer_state: Vec::new(),
        }
    }
}

/// Where an epoch or a run ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EpochOutcome {
    /// Epoch done, no validation to judge it by
    Running,
    ImprovedBestScore,
    StagnantEpoch,
    EarlyStopped,
    Completed,
    /// Stop flag raised between epochs
    Interrupted,
}

/// Summary of one finished epoch
#[derive(Debug, Clone)]
pub struct EpochReport {
    /// 1-based epoch number
    pub epoch: usize,
    pub outcome: EpochOutcome,
    /// Rate used for every step of this epoch
    pub learning_rate: f64,
    pub train: EpochMetrics,
    pub valid: Option<EpochMetrics>,
    /// Training samples that went through a step
    pub samples: usize,
    /// Samples skipped because they failed to decode, both passes
    pub skipped: usize,
}

/// Summary of a `fit` call
#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// `EarlyStopped`, `Completed` or `Interrupted`
    pub outcome: EpochOutcome,
    pub epochs: Vec<EpochReport>,
    /// Epochs that wrote the `best` checkpoint
    pub best_epochs: Vec<usize>,
    pub best_valid_acc: Option<f64>,
}

impl TrainingReport {
    pub fn skipped_samples(&self) -> usize {
        self.epochs.iter().map(|e| e.skipped).sum()
    }
}

struct PassSummary {
    metrics: Option<EpochMetrics>,
    samples: usize,
    skipped: usize,
}

fn step_failure(context: &str, err: Error) -> Error {
    match err {
        Error::TrainingFailed(_) => err,
        other => Error::TrainingFailed(format!("{context}: {other}")),
    }
}

/// Multi-epoch trainer around a [`TrainableModel`]
pub struct Trainer<M> {
    model: M,
    config: TrainerConfig,
    state: TrainingState,
    scheduler: PlateauScheduler,
    store: CheckpointStore,
    stop: Arc<AtomicBool>,
}

impl<M: TrainableModel> Trainer<M> {
    /// Fresh run.
    pub fn new(model: M, config: TrainerConfig) -> Result<Self> {
        config.validate()?;
        let state = TrainingState::new(config.learning_rate);
        let scheduler = PlateauScheduler::new(config.scheduler, config.learning_rate);
        let store = CheckpointStore::new(&config.save_dir);

        Ok(Self {
            model,
            config,
            state,
            scheduler,
            store,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Continues the run stored in the `tag` checkpoint of the save dir.
    ///
    /// Parameters, optimizer state, scheduler state, history, best score,
    /// patience counter and epoch are all restored; the next `fit` starts
    /// at the following epoch.
    pub fn resume(mut model: M, config: TrainerConfig, tag: CheckpointTag) -> Result<Self> {
        config.validate()?;
        let store = CheckpointStore::new(&config.save_dir);
        let (state, parameters) = store.load(tag)?;

        model.load_parameters(&parameters)?;
        if !state.optimizer_state.is_empty() {
            model.load_optimizer_state(&state.optimizer_state)?;
        }
        let scheduler = PlateauScheduler::from_state(config.scheduler, state.scheduler_state.clone());

        info!(
            "Resuming from {} checkpoint: {} epochs done, best valid acc {}",
            tag,
            state.epoch,
            state
                .best_valid_acc
                .map_or_else(|| "n/a".to_string(), |acc| format!("{acc:.4}"))
        );

        Ok(Self {
            model,
            config,
            state,
            scheduler,
            store,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Shares an externally owned stop flag.
    pub fn with_stop_flag(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Raising this flag ends the run at the next epoch boundary.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Learning rate the next epoch will use
    pub fn learning_rate(&self) -> f64 {
        self.scheduler.get_lr()
    }

    /// Swaps the model's parameters for those stored under `tag`. The
    /// training state is left alone.
    pub fn restore_parameters(&mut self, tag: CheckpointTag) -> Result<()> {
        let (_, parameters) = self.store.load(tag)?;
        self.model.load_parameters(&parameters)
    }

    pub fn fit(
        &mut self,
        train: &dyn BatchSource,
        valid: Option<&dyn BatchSource>,
    ) -> Result<TrainingReport> {
        self.fit_with(train, valid, |_| {})
    }

    /// Like [`Trainer::fit`], calling `on_epoch` after every finished epoch.
    pub fn fit_with<F>(
        &mut self,
        train: &dyn BatchSource,
        valid: Option<&dyn BatchSource>,
        mut on_epoch: F,
    ) -> Result<TrainingReport>
    where
        F: FnMut(&EpochReport),
    {
        if valid.is_none() {
            warn!("No validation split: no best checkpoint and no early stopping");
        }
        info!(
            "Training epochs {}..={} ({} training samples, {} batches per epoch)",
            self.state.epoch + 1,
            self.config.num_epochs,
            train.num_samples(),
            train.num_batches()
        );

        let mut epochs = Vec::new();
        let mut best_epochs = Vec::new();

        let outcome = loop {
            if valid.is_some() && self.state.patience_counter >= self.config.early_stopping_patience {
                info!(
                    "Early stopping: no improvement for {} epochs",
                    self.state.patience_counter
                );
                break EpochOutcome::EarlyStopped;
            }
            if self.state.epoch >= self.config.num_epochs {
                break EpochOutcome::Completed;
            }
            if self.stop.load(Ordering::SeqCst) {
                warn!("Stop requested, ending after epoch {}", self.state.epoch);
                break EpochOutcome::Interrupted;
            }

            let report = self.run_epoch(train, valid)?;
            if report.outcome == EpochOutcome::ImprovedBestScore {
                best_epochs.push(report.epoch);
            }
            on_epoch(&report);
            epochs.push(report);
        };

        self.save_checkpoint(CheckpointTag::Latest)?;
        info!(
            "Training ended ({:?}) after epoch {}",
            outcome, self.state.epoch
        );

        Ok(TrainingReport {
            outcome,
            epochs,
            best_epochs,
            best_valid_acc: self.state.best_valid_acc,
        })
    }

    /// Runs exactly one epoch and records it.
    ///
    /// Writes the `best` checkpoint on improvement and refreshes the history
    /// file. Nothing is recorded if either pass fails.
    pub fn run_epoch(
        &mut self,
        train: &dyn BatchSource,
        valid: Option<&dyn BatchSource>,
    ) -> Result<EpochReport> {
        let index = self.state.epoch;
        let epoch = index + 1;
        let learning_rate = self.scheduler.get_lr();
        info!(
            "Epoch {}/{} (lr {:.2e})",
            epoch, self.config.num_epochs, learning_rate
        );

        let train_pass = self.train_pass(train, index, learning_rate)?;
        let train_metrics = train_pass.metrics.ok_or_else(|| {
            Error::TrainingFailed(format!("Epoch {epoch}: training split produced no batches"))
        })?;

        let valid_pass = match valid {
            Some(loader) => {
                let pass = self.eval_pass(loader, index, &format!("Epoch {epoch} validation"))?;
                let metrics = pass.metrics.ok_or_else(|| {
                    Error::TrainingFailed(format!(
                        "Epoch {epoch}: validation split produced no batches"
                    ))
                })?;
                Some((metrics, pass.skipped))
            }
            None => None,
        };

        self.state.epoch = epoch;
        self.state.history.push_train(train_metrics);

        let outcome = match valid_pass {
            None => EpochOutcome::Running,
            Some((metrics, _)) => {
                self.state.history.push_valid(metrics);
                self.scheduler.step(metrics.accuracy);
                self.state.scheduler_state = self.scheduler.state().clone();

                let improved = self
                    .state
                    .best_valid_acc
                    .map_or(true, |best| metrics.accuracy > best);
                if improved {
                    info!(
                        "Validation accuracy improved to {:.4}",
                        metrics.accuracy
                    );
                    self.state.best_valid_acc = Some(metrics.accuracy);
                    self.state.patience_counter = 0;
                    EpochOutcome::ImprovedBestScore
                } else {
                    self.state.patience_counter += 1;
                    warn!(
                        "No improvement. Patience: {}/{}",
                        self.state.patience_counter, self.config.early_stopping_patience
                    );
                    EpochOutcome::StagnantEpoch
                }
            }
        };

        if outcome == EpochOutcome::ImprovedBestScore {
            self.save_checkpoint(CheckpointTag::Best)?;
        }
        self.store.save_history(&self.state.history)?;

        let valid_metrics = valid_pass.map(|(m, _)| m);
        match valid_metrics {
            Some(v) => info!(
                "Epoch {}: train_loss={:.4}, train_acc={:.4}, valid_loss={:.4}, valid_acc={:.4}",
                epoch, train_metrics.loss, train_metrics.accuracy, v.loss, v.accuracy
            ),
            None => info!(
                "Epoch {}: train_loss={:.4}, train_acc={:.4}",
                epoch, train_metrics.loss, train_metrics.accuracy
            ),
        }

        let skipped = train_pass.skipped + valid_pass.map_or(0, |(_, s)| s);
        if skipped > 0 {
            warn!("Epoch {epoch}: skipped {skipped} unreadable samples");
        }

        Ok(EpochReport {
            epoch,
            outcome,
            learning_rate,
            train: train_metrics,
            valid: valid_metrics,
            samples: train_pass.samples,
            skipped,
        })
    }

    /// Gradient-free pass over any split, e.g. the test split after training.
    pub fn evaluate(
        &mut self,
        loader: &dyn BatchSource,
        num_classes: usize,
    ) -> Result<EvaluationMetrics> {
        let mut metrics = EvaluationMetrics::new(num_classes);
        let mut losses = MetricAccumulator::new();

        for batch in loader.batches(0) {
            if batch.is_empty() {
                continue;
            }
            let output = self.eval_batch(&batch, "Evaluation")?;
            for (&label, &predicted) in batch.labels.iter().zip(&output.predictions) {
                metrics.record(label, predicted);
            }
            losses.add_batch(output.loss, output.accuracy(&batch.labels), batch.len());
        }

        metrics.finalize();
        metrics.loss = losses.finish().map_or(0.0, |m| m.loss);
        info!(
            "Evaluated {} samples: accuracy={:.4}, loss={:.4}",
            metrics.num_samples, metrics.accuracy, metrics.loss
        );
        Ok(metrics)
    }

    fn train_pass(
        &mut self,
        loader: &dyn BatchSource,
        index: usize,
        learning_rate: f64,
    ) -> Result<PassSummary> {
        let epoch = index + 1;
        let mut metrics = MetricAccumulator::new();
        let mut skipped = 0;

        for (batch_idx, batch) in loader.batches(index).enumerate() {
            skipped += batch.skipped;
            if batch.is_empty() {
                continue;
            }

            let output = self
                .model
                .train_step(&batch, learning_rate)
                .map_err(|e| step_failure(&format!("Epoch {epoch}, batch {}", batch_idx + 1), e))?;
            if !output.loss.is_finite() {
                return Err(Error::TrainingFailed(format!(
                    "Epoch {epoch}, batch {}: loss is {}",
                    batch_idx + 1,
                    output.loss
                )));
            }

            let accuracy = output.accuracy(&batch.labels);
            metrics.add_batch(output.loss, accuracy, batch.len());
            debug!(
                "  Batch {}: loss = {:.4}, acc = {:.2}%",
                batch_idx + 1,
                output.loss,
                100.0 * accuracy
            );
        }

        Ok(PassSummary {
            metrics: metrics.finish(),
            samples: metrics.samples(),
            skipped,
        })
    }

    fn eval_pass(
        &mut self,
        loader: &dyn BatchSource,
        index: usize,
        context: &str,
    ) -> Result<PassSummary> {
        let mut metrics = MetricAccumulator::new();
        let mut skipped = 0;

        for batch in loader.batches(index) {
            skipped += batch.skipped;
            if batch.is_empty() {
                continue;
            }
            let output = self.eval_batch(&batch, context)?;
            metrics.add_batch(output.loss, output.accuracy(&batch.labels), batch.len());
        }

        Ok(PassSummary {
            metrics: metrics.finish(),
            samples: metrics.samples(),
            skipped,
        })
    }

    fn eval_batch(&mut self, batch: &Batch, context: &str) -> Result<StepOutput> {
        let output = self
            .model
            .eval_step(batch)
            .map_err(|e| step_failure(context, e))?;
        if !output.loss.is_finite() {
            return Err(Error::TrainingFailed(format!(
                "{context}: loss is {}",
                output.loss
            )));
        }
        Ok(output)
    }

    fn save_checkpoint(&mut self, tag: CheckpointTag) -> Result<PathBuf> {
        self.state.optimizer_state = self.model.optimizer_state()?;
        let parameters = self.model.parameters()?;
        self.store.save(tag, &self.state, &parameters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelParameters;
    use plant_core::{DatasetSplit, ImageDimensions, SampleRecord, SplitKind};
    use plant_dataset::{ImageTensor, LazyImageLoader, LoaderConfig};
    use std::fs;
    use tempfile::TempDir;

    /// Predicts perfectly on training batches and hits a scripted accuracy
    /// on each validation pass.
    #[derive(Default)]
    struct ScriptedModel {
        valid_acc: Vec<f64>,
        eval_calls: usize,
        steps: usize,
        nan_at_step: Option<usize>,
        fail_at_step: Option<usize>,
        fail_eval: bool,
        learning_rates: Vec<f64>,
        batch_sizes: Vec<usize>,
        optimizer: Vec<u8>,
    }

    impl ScriptedModel {
        fn with_valid_acc(valid_acc: &[f64]) -> Self {
            Self {
                valid_acc: valid_acc.to_vec(),
                ..Self::default()
            }
        }
    }

    impl TrainableModel for ScriptedModel {
        fn train_step(&mut self, batch: &Batch, learning_rate: f64) -> Result<StepOutput> {
            self.steps += 1;
            if self.fail_at_step == Some(self.steps) {
                return Err(Error::Model("shape mismatch in layer fc2".into()));
            }
            self.learning_rates.push(learning_rate);
            self.batch_sizes.push(batch.len());
            let loss = if self.nan_at_step == Some(self.steps) {
                f64::NAN
            } else {
                1.0 / self.steps as f64
            };
            Ok(StepOutput {
                loss,
                predictions: batch.labels.clone(),
            })
        }

        fn eval_step(&mut self, batch: &Batch) -> Result<StepOutput> {
            if self.fail_eval {
                return Err(Error::Model("backend out of memory".into()));
            }
            let acc = self.valid_acc[self.eval_calls.min(self.valid_acc.len() - 1)];
            self.eval_calls += 1;
            let correct = (acc * batch.len() as f64).round() as usize;
            let predictions = batch
                .labels
                .iter()
                .enumerate()
                .map(|(i, &l)| if i < correct { l } else { l + 1 })
                .collect();
            Ok(StepOutput {
                loss: 1.0 - acc,
                predictions,
            })
        }

        fn parameters(&self) -> Result<ModelParameters> {
            Ok(ModelParameters((self.steps as u64).to_le_bytes().to_vec()))
        }

        fn load_parameters(&mut self, parameters: &ModelParameters) -> Result<()> {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(parameters.as_bytes());
            self.steps = u64::from_le_bytes(buf) as usize;
            Ok(())
        }

        fn optimizer_state(&self) -> Result<Vec<u8>> {
            Ok(vec![self.steps as u8; 3])
        }

        fn load_optimizer_state(&mut self, state: &[u8]) -> Result<()> {
            self.optimizer = state.to_vec();
            Ok(())
        }
    }

    /// Fixed in-memory batches, identical every epoch
    struct MemorySource {
        batches: Vec<Batch>,
        batch_size: usize,
    }

    impl MemorySource {
        fn new(num_samples: usize, batch_size: usize) -> Self {
            let labels: Vec<usize> = (0..num_samples).map(|i| i % 2).collect();
            let batches = labels
                .chunks(batch_size)
                .map(|chunk| Batch {
                    images: chunk
                        .iter()
                        .map(|_| ImageTensor {
                            height: 1,
                            width: 1,
                            data: vec![0.5; 3],
                        })
                        .collect(),
                    labels: chunk.to_vec(),
                    skipped: 0,
                })
                .collect();
            Self {
                batches,
                batch_size,
            }
        }
    }

    impl BatchSource for MemorySource {
        fn batches(&self, _epoch: usize) -> Box<dyn Iterator<Item = Batch> + '_> {
            Box::new(self.batches.iter().cloned())
        }

        fn num_samples(&self) -> usize {
            self.batches.iter().map(Batch::len).sum()
        }

        fn batch_size(&self) -> usize {
            self.batch_size
        }
    }

    fn config(dir: &TempDir, num_epochs: usize, patience: usize) -> TrainerConfig {
        TrainerConfig {
            num_epochs,
            early_stopping_patience: patience,
            save_dir: dir.path().to_path_buf(),
            ..TrainerConfig::default()
        }
    }

    fn sources() -> (MemorySource, MemorySource) {
        (MemorySource::new(10, 5), MemorySource::new(20, 20))
    }

    #[test]
    fn test_early_stopping_after_patience() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.5, 0.4, 0.3, 0.2, 0.1, 0.05]);
        let mut trainer = Trainer::new(model, config(&dir, 10, 3)).unwrap();

        let report = trainer.fit(&train, Some(&valid)).unwrap();

        assert_eq!(report.outcome, EpochOutcome::EarlyStopped);
        assert_eq!(trainer.state().epoch, 4);
        assert_eq!(trainer.state().history.valid_acc, vec![0.5, 0.4, 0.3, 0.2]);
        assert_eq!(trainer.state().patience_counter, 3);
        assert_eq!(report.best_epochs, vec![1]);
        let outcomes: Vec<_> = report.epochs.iter().map(|e| e.outcome).collect();
        assert_eq!(
            outcomes,
            vec![
                EpochOutcome::ImprovedBestScore,
                EpochOutcome::StagnantEpoch,
                EpochOutcome::StagnantEpoch,
                EpochOutcome::StagnantEpoch,
            ]
        );
        assert!(trainer.store().exists(CheckpointTag::Latest));
    }

    #[test]
    fn test_best_written_only_on_strict_improvement() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.7, 0.65, 0.8, 0.75]);
        let mut trainer = Trainer::new(model, config(&dir, 4, 5)).unwrap();

        let report = trainer.fit(&train, Some(&valid)).unwrap();

        assert_eq!(report.outcome, EpochOutcome::Completed);
        assert_eq!(report.best_epochs, vec![1, 3]);
        assert_eq!(report.best_valid_acc, Some(0.8));

        let (best, params) = trainer.store().load(CheckpointTag::Best).unwrap();
        assert_eq!(best.epoch, 3);
        // two training steps per epoch
        assert_eq!(params, ModelParameters(6u64.to_le_bytes().to_vec()));

        let (latest, _) = trainer.store().load(CheckpointTag::Latest).unwrap();
        assert_eq!(&latest, trainer.state());
        assert_eq!(trainer.store().load_history().unwrap(), latest.history);
    }

    #[test]
    fn test_equal_accuracy_is_not_an_improvement() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.6, 0.6, 0.6]);
        let mut trainer = Trainer::new(model, config(&dir, 3, 5)).unwrap();

        let report = trainer.fit(&train, Some(&valid)).unwrap();
        assert_eq!(report.best_epochs, vec![1]);
        assert_eq!(trainer.state().patience_counter, 2);
    }

    #[test]
    fn test_non_finite_loss_aborts_without_checkpoint() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let mut model = ScriptedModel::with_valid_acc(&[0.5, 0.6]);
        model.nan_at_step = Some(3);
        let mut trainer = Trainer::new(model, config(&dir, 5, 5)).unwrap();

        let err = trainer.fit(&train, Some(&valid)).unwrap_err();

        assert!(matches!(err, Error::TrainingFailed(_)));
        assert_eq!(trainer.state().epoch, 1);
        assert_eq!(trainer.state().history.epochs(), 1);
        assert!(!trainer.store().exists(CheckpointTag::Latest));
        let (best, _) = trainer.store().load(CheckpointTag::Best).unwrap();
        assert_eq!(best.epoch, 1);
    }

    #[test]
    fn test_step_error_aborts_as_training_failed() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let mut model = ScriptedModel::with_valid_acc(&[0.5, 0.6]);
        model.fail_at_step = Some(4);
        let mut trainer = Trainer::new(model, config(&dir, 5, 5)).unwrap();

        let err = trainer.fit(&train, Some(&valid)).unwrap_err();

        assert_eq!(err.kind(), "TrainingFailed");
        assert!(err.to_string().contains("Epoch 2, batch 2"));
        assert!(err.to_string().contains("shape mismatch"));
        assert_eq!(trainer.state().epoch, 1);
        assert!(!trainer.store().exists(CheckpointTag::Latest));
    }

    #[test]
    fn test_eval_error_aborts_as_training_failed() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel {
            fail_eval: true,
            ..ScriptedModel::with_valid_acc(&[0.5])
        };
        let mut trainer = Trainer::new(model, config(&dir, 3, 5)).unwrap();

        let err = trainer.fit(&train, Some(&valid)).unwrap_err();

        assert!(matches!(err, Error::TrainingFailed(_)));
        assert_eq!(trainer.state().epoch, 0);
        assert!(trainer.state().history.train_loss.is_empty());
        assert!(!trainer.store().exists(CheckpointTag::Latest));
        assert!(!trainer.store().exists(CheckpointTag::Best));
    }

    #[test]
    fn test_resume_restores_state() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.5, 0.7, 0.6]);
        let mut first = Trainer::new(model, config(&dir, 3, 5)).unwrap();
        first.fit(&train, Some(&valid)).unwrap();
        let saved = first.state().clone();

        let model = ScriptedModel::with_valid_acc(&[0.9]);
        let mut resumed = Trainer::resume(model, config(&dir, 5, 5), CheckpointTag::Latest).unwrap();

        assert_eq!(resumed.state(), &saved);
        assert_eq!(resumed.model().steps, 6);
        assert_eq!(resumed.model().optimizer, vec![6; 3]);
        assert_eq!(resumed.learning_rate(), first.learning_rate());

        let report = resumed.fit(&train, Some(&valid)).unwrap();
        assert_eq!(report.epochs.first().map(|e| e.epoch), Some(4));
        assert_eq!(resumed.state().epoch, 5);
        assert_eq!(resumed.state().history.valid_acc, vec![0.5, 0.7, 0.6, 0.9, 0.9]);
        assert_eq!(report.best_epochs, vec![4]);
    }

    #[test]
    fn test_resume_without_checkpoint_is_not_found() {
        let dir = TempDir::new().unwrap();
        let result = Trainer::resume(ScriptedModel::default(), config(&dir, 3, 5), CheckpointTag::Latest);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_without_validation() {
        let dir = TempDir::new().unwrap();
        let (train, _) = sources();
        let mut trainer = Trainer::new(ScriptedModel::default(), config(&dir, 3, 1)).unwrap();

        let report = trainer.fit(&train, None).unwrap();

        assert_eq!(report.outcome, EpochOutcome::Completed);
        assert!(report.epochs.iter().all(|e| e.outcome == EpochOutcome::Running));
        assert!(trainer.state().history.valid_acc.is_empty());
        assert_eq!(trainer.state().best_valid_acc, None);
        assert!(!trainer.store().exists(CheckpointTag::Best));
        assert!(trainer.store().exists(CheckpointTag::Latest));
    }

    #[test]
    fn test_empty_training_split_fails() {
        let dir = TempDir::new().unwrap();
        let train = MemorySource::new(0, 4);
        let mut trainer = Trainer::new(ScriptedModel::default(), config(&dir, 3, 1)).unwrap();

        let err = trainer.fit(&train, None).unwrap_err();
        assert_eq!(err.kind(), "TrainingFailed");
        assert!(!trainer.store().exists(CheckpointTag::Latest));
    }

    #[test]
    fn test_stop_flag_interrupts_between_epochs() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.1, 0.2, 0.3, 0.4]);
        let mut trainer = Trainer::new(model, config(&dir, 10, 5)).unwrap();
        let stop = trainer.stop_flag();

        let report = trainer
            .fit_with(&train, Some(&valid), |report| {
                if report.epoch == 2 {
                    stop.store(true, Ordering::SeqCst);
                }
            })
            .unwrap();

        assert_eq!(report.outcome, EpochOutcome::Interrupted);
        assert_eq!(trainer.state().epoch, 2);
        let (latest, _) = trainer.store().load(CheckpointTag::Latest).unwrap();
        assert_eq!(latest.epoch, 2);
    }

    #[test]
    fn test_scheduler_counter_is_independent() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.5]);
        let mut trainer = Trainer::new(model, config(&dir, 5, 10)).unwrap();

        let report = trainer.fit(&train, Some(&valid)).unwrap();
        let rates: Vec<f64> = report.epochs.iter().map(|e| e.learning_rate).collect();

        // bad epochs 2, 3, 4 exceed the plateau patience of 2
        assert_eq!(rates, vec![0.001, 0.001, 0.001, 0.001, 0.0005]);
        assert_eq!(trainer.state().patience_counter, 4);
        assert_eq!(report.outcome, EpochOutcome::Completed);
        assert_eq!(trainer.model().learning_rates[8], 0.0005);
    }

    #[test]
    fn test_corrupt_sample_is_skipped_not_fatal() {
        let dir = TempDir::new().unwrap();
        let images = TempDir::new().unwrap();
        let samples: Vec<SampleRecord> = (0..100)
            .map(|i| {
                let path = images.path().join(format!("{i:03}.png"));
                image::RgbImage::from_pixel(4, 4, image::Rgb([i as u8, 0, 0]))
                    .save(&path)
                    .unwrap();
                SampleRecord::new(path, i % 2)
            })
            .collect();
        fs::write(&samples[42].path, b"definitely not a png").unwrap();

        let loader = LazyImageLoader::new(
            DatasetSplit::new(SplitKind::Train, samples, 1.0),
            LoaderConfig::new(ImageDimensions::new(4, 4), 10),
        )
        .unwrap();
        let mut trainer = Trainer::new(ScriptedModel::default(), config(&dir, 1, 1)).unwrap();

        let report = trainer.fit(&loader, None).unwrap();

        assert_eq!(report.epochs[0].samples, 99);
        assert_eq!(report.epochs[0].skipped, 1);
        assert_eq!(trainer.model().batch_sizes.iter().sum::<usize>(), 99);
    }

    #[test]
    fn test_evaluate_builds_confusion_matrix() {
        let dir = TempDir::new().unwrap();
        let (_, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.75]);
        let mut trainer = Trainer::new(model, config(&dir, 1, 1)).unwrap();

        let metrics = trainer.evaluate(&valid, 3).unwrap();

        assert_eq!(metrics.num_samples, 20);
        assert_eq!(metrics.accuracy, 0.75);
        assert!((metrics.loss - 0.25).abs() < 1e-12);
        assert_eq!(trainer.state().epoch, 0);
    }

    #[test]
    fn test_restore_best_parameters() {
        let dir = TempDir::new().unwrap();
        let (train, valid) = sources();
        let model = ScriptedModel::with_valid_acc(&[0.5, 0.8, 0.6]);
        let mut trainer = Trainer::new(model, config(&dir, 3, 5)).unwrap();
        trainer.fit(&train, Some(&valid)).unwrap();
        assert_eq!(trainer.model().steps, 6);

        // best was written after epoch 2, i.e. 4 steps
        trainer.restore_parameters(CheckpointTag::Best).unwrap();
        assert_eq!(trainer.model().steps, 4);
        assert_eq!(trainer.state().epoch, 3);
    }

    #[test]
    fn test_invalid_config() {
        let dir = TempDir::new().unwrap();
        for bad in [config(&dir, 0, 1), config(&dir, 3, 0)] {
            assert!(matches!(
                Trainer::new(ScriptedModel::default(), bad),
                Err(Error::InvalidArgument(_))
            ));
        }
    }
}
