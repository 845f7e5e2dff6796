//! Training infrastructure for plant disease classification.
//!
//! This module provides:
//! - The trainable-model seam and a burn CNN implementing it
//! - The epoch loop with plateau scheduling and early stopping
//! - Checkpoint persistence with resume support
//! - Single-image inference from a save directory

pub mod checkpoint;
pub mod inference;
pub mod lr_schedule;
pub mod model;
pub mod trainer;

pub use checkpoint::{load_best_model, Checkpoint, CheckpointStore, CheckpointTag};
pub use inference::Predictor;
pub use lr_schedule::{PlateauScheduler, SchedulerState};
pub use model::{
    build_classifier, BurnClassifier, ClassifierConfig, InferenceBackend, ModelParameters,
    PlantClassifier, StepOutput, TrainBackend, TrainableModel, MIN_INPUT_SIZE,
};
pub use trainer::{
    EpochOutcome, EpochReport, Trainer, TrainerConfig, TrainingReport, TrainingState,
};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{CheckpointStore, CheckpointTag};
    pub use super::model::{TrainableModel, ModelParameters};
    pub use super::trainer::{EpochOutcome, Trainer, TrainerConfig, TrainingState};
}
