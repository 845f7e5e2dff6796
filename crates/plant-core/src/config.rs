//! Configuration structures for the training pipeline.
//!
//! Every struct has a `Default` matching the reference training recipe
//! (224x224 inputs, batch 32, AdamW at 1e-3, plateau factor 0.5, early-stop
//! patience 5) and can be loaded from TOML with [`crate::load_toml_config`].

use crate::types::{DeviceType, ImageDimensions};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration for a training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Data configuration
    pub data: DataConfig,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Plateau scheduler
    pub scheduler: PlateauConfig,
    /// Training-split augmentation
    pub augmentation: AugmentationConfig,
    /// Where artifacts go
    pub output: OutputConfig,
    /// Device selector, passed through to the model backend
    pub device: DeviceType,
    /// Random seed for splitting, shuffling and augmentation
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            training: TrainingParams::default(),
            scheduler: PlateauConfig::default(),
            augmentation: AugmentationConfig::default(),
            output: OutputConfig::default(),
            device: DeviceType::Cpu,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Checks every section; the first problem is reported as `InvalidArgument`.
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.training.validate()?;
        self.scheduler.validate()?;
        self.augmentation.validate()?;
        Ok(())
    }
}

/// Data configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Dataset root with one subdirectory per class
    pub data_dir: PathBuf,
    /// Model input size
    pub image_size: ImageDimensions,
    /// Test/validation ratios
    pub split: SplitRatios,
    /// Partition each class independently
    pub stratified: bool,
    /// Reshuffle the training split every epoch
    pub shuffle: bool,
    /// Decode threads used by the prefetching loader (0 = synchronous)
    pub num_workers: usize,
    /// Batches decoded ahead of the training loop
    pub prefetch_batches: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/plantvillage"),
            image_size: ImageDimensions::imagenet(),
            split: SplitRatios::default(),
            stratified: true,
            shuffle: true,
            num_workers: 4,
            prefetch_batches: 2,
        }
    }
}

impl DataConfig {
    pub fn validate(&self) -> Result<()> {
        self.split.validate()?;
        if self.image_size.width == 0 || self.image_size.height == 0 {
            return Err(Error::InvalidArgument(format!(
                "Image size must be non-zero, got {}x{}",
                self.image_size.width, self.image_size.height
            )));
        }
        Ok(())
    }
}

/// Test and validation ratios; the remainder is training data.
///
/// `valid` is a fraction of the whole dataset. The partitioner carves it
/// from what remains after the test split as `valid / (1 - test)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SplitRatios {
    /// Test data ratio
    pub test: f64,
    /// Validation data ratio
    pub valid: f64,
}

impl Default for SplitRatios {
    fn default() -> Self {
        Self {
            test: 0.15,
            valid: 0.15,
        }
    }
}

impl SplitRatios {
    pub fn new(test: f64, valid: f64) -> Self {
        Self { test, valid }
    }

    /// Requires `0 < test < 1`, `0 < valid < 1` and `test + valid < 1`.
    pub fn validate(&self) -> Result<()> {
        let in_open_unit = |r: f64| r > 0.0 && r < 1.0;

        if !in_open_unit(self.test) {
            return Err(Error::InvalidArgument(format!(
                "Test ratio must be in (0, 1), got {}",
                self.test
            )));
        }
        if !in_open_unit(self.valid) {
            return Err(Error::InvalidArgument(format!(
                "Validation ratio must be in (0, 1), got {}",
                self.valid
            )));
        }
        if self.test + self.valid >= 1.0 {
            return Err(Error::InvalidArgument(format!(
                "Test and validation ratios must sum to less than 1, got {} + {}",
                self.test, self.valid
            )));
        }
        Ok(())
    }

    /// Ratio of the training split.
    pub fn train(&self) -> f64 {
        1.0 - self.test - self.valid
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Maximum number of epochs
    pub num_epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// AdamW weight decay
    pub weight_decay: f64,
    /// Epochs without a new best validation accuracy before stopping
    pub early_stopping_patience: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 10,
            batch_size: 32,
            learning_rate: 0.001,
            weight_decay: 0.01,
            early_stopping_patience: 5,
        }
    }
}

impl TrainingParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::InvalidArgument("Number of epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(Error::InvalidArgument("Batch size must be at least 1".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(Error::InvalidArgument(format!(
                "Learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(Error::InvalidArgument(format!(
                "Weight decay must be non-negative, got {}",
                self.weight_decay
            )));
        }
        if self.early_stopping_patience == 0 {
            return Err(Error::InvalidArgument(
                "Early stopping patience must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// Reduce-on-plateau scheduler settings (monitors validation accuracy)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PlateauConfig {
    /// Multiplier applied to the learning rate on a plateau
    pub factor: f64,
    /// Bad epochs tolerated before reducing
    pub patience: usize,
    /// Relative improvement needed to count as better
    pub threshold: f64,
    /// Floor for the learning rate
    pub min_lr: f64,
}

impl Default for PlateauConfig {
    fn default() -> Self {
        Self {
            factor: 0.5,
            patience: 2,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

impl PlateauConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.factor > 0.0 && self.factor < 1.0) {
            return Err(Error::InvalidArgument(format!(
                "Plateau factor must be in (0, 1), got {}",
                self.factor
            )));
        }
        let non_negative = |v: f64| v.is_finite() && v >= 0.0;
        if !(non_negative(self.threshold) && non_negative(self.min_lr)) {
            return Err(Error::InvalidArgument(format!(
                "Plateau threshold and min_lr must be finite and non-negative, got {} and {}",
                self.threshold, self.min_lr
            )));
        }
        Ok(())
    }
}

/// Data augmentation configuration (training split only)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Master switch
    pub enabled: bool,
    /// Random horizontal flip with probability 0.5
    pub horizontal_flip: bool,
    /// Random rotation range in degrees (symmetric)
    pub rotation_range: f32,
    /// Brightness multiplier range
    pub brightness_range: (f32, f32),
    /// Contrast multiplier range
    pub contrast_range: (f32, f32),
    /// Saturation multiplier range
    pub saturation_range: (f32, f32),
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            horizontal_flip: true,
            rotation_range: 10.0,
            brightness_range: (0.8, 1.2),
            contrast_range: (0.8, 1.2),
            saturation_range: (0.8, 1.2),
        }
    }
}

impl AugmentationConfig {
    /// Identity transform
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            horizontal_flip: false,
            rotation_range: 0.0,
            brightness_range: (1.0, 1.0),
            contrast_range: (1.0, 1.0),
            saturation_range: (1.0, 1.0),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rotation_range.is_finite() && (0.0..=180.0).contains(&self.rotation_range)) {
            return Err(Error::InvalidArgument(format!(
                "Rotation range must be within [0, 180] degrees, got {}",
                self.rotation_range
            )));
        }
        for (name, (lo, hi)) in [
            ("brightness", self.brightness_range),
            ("contrast", self.contrast_range),
            ("saturation", self.saturation_range),
        ] {
            if !(lo.is_finite() && hi.is_finite() && 0.0 <= lo && lo <= hi) {
                return Err(Error::InvalidArgument(format!(
                    "Invalid {name} range ({lo}, {hi})"
                )));
            }
        }
        Ok(())
    }
}

/// Output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory receiving checkpoints, history and the class mapping
    pub save_dir: PathBuf,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("models"),
        }
    }
}
