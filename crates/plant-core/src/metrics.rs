//! Training history and evaluation metrics.

use serde::{Deserialize, Serialize};

/// Per-epoch metric history.
///
/// Serialized as-is to `training_history.json`, one entry per completed
/// epoch in each array. The validation arrays stay empty when a run has no
/// validation split.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_loss: Vec<f64>,
    pub train_acc: Vec<f64>,
    pub valid_loss: Vec<f64>,
    pub valid_acc: Vec<f64>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_train(&mut self, metrics: EpochMetrics) {
        self.train_loss.push(metrics.loss);
        self.train_acc.push(metrics.accuracy);
    }

    pub fn push_valid(&mut self, metrics: EpochMetrics) {
        self.valid_loss.push(metrics.loss);
        self.valid_acc.push(metrics.accuracy);
    }

    /// Number of completed epochs
    pub fn epochs(&self) -> usize {
        self.train_loss.len()
    }

    /// Highest validation accuracy seen so far
    pub fn best_valid_acc(&self) -> Option<f64> {
        self.valid_acc.iter().copied().max_by(f64::total_cmp)
    }

    /// 1-based epoch of the first occurrence of the best validation accuracy
    pub fn best_epoch(&self) -> Option<usize> {
        let best = self.best_valid_acc()?;
        self.valid_acc.iter().position(|&acc| acc == best).map(|i| i + 1)
    }
}

/// Averages for one pass over a split
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub loss: f64,
    pub accuracy: f64,
}

/// Running mean of per-batch loss and accuracy.
///
/// Each batch contributes equally regardless of its size, which matches how
/// the epoch averages were always reported.
#[derive(Debug, Clone, Default)]
pub struct MetricAccumulator {
    loss_sum: f64,
    accuracy_sum: f64,
    batches: usize,
    samples: usize,
}

impl MetricAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_batch(&mut self, loss: f64, accuracy: f64, batch_size: usize) {
        self.loss_sum += loss;
        self.accuracy_sum += accuracy;
        self.batches += 1;
        self.samples += batch_size;
    }

    pub fn batches(&self) -> usize {
        self.batches
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// `None` when no batch was recorded.
    pub fn finish(&self) -> Option<EpochMetrics> {
        if self.batches == 0 {
            return None;
        }
        let n = self.batches as f64;
        Some(EpochMetrics {
            loss: self.loss_sum / n,
            accuracy: self.accuracy_sum / n,
        })
    }
}

/// Confusion-matrix based evaluation of a split
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationMetrics {
    /// Overall accuracy
    pub accuracy: f64,
    /// Mean of per-batch losses
    pub loss: f64,
    /// Confusion matrix (actual x predicted)
    pub confusion_matrix: Vec<Vec<usize>>,
    /// Total number of samples evaluated
    pub num_samples: usize,
}

impl EvaluationMetrics {
    pub fn new(num_classes: usize) -> Self {
        Self {
            accuracy: 0.0,
            loss: 0.0,
            confusion_matrix: vec![vec![0; num_classes]; num_classes],
            num_samples: 0,
        }
    }

    /// Records one prediction; out-of-range classes are ignored.
    pub fn record(&mut self, actual: usize, predicted: usize) {
        let num_classes = self.confusion_matrix.len();
        if actual < num_classes && predicted < num_classes {
            self.confusion_matrix[actual][predicted] += 1;
        }
    }

    /// Recomputes `accuracy` and `num_samples` from the confusion matrix.
    pub fn finalize(&mut self) {
        self.num_samples = self.confusion_matrix.iter().flatten().sum();
        if self.num_samples == 0 {
            self.accuracy = 0.0;
            return;
        }
        let correct: usize = (0..self.confusion_matrix.len())
            .map(|i| self.confusion_matrix[i][i])
            .sum();
        self.accuracy = correct as f64 / self.num_samples as f64;
    }

    /// Recall per class, `None` for classes without samples.
    pub fn per_class_accuracy(&self) -> Vec<Option<f64>> {
        self.confusion_matrix
            .iter()
            .enumerate()
            .map(|(i, row)| {
                let total: usize = row.iter().sum();
                (total > 0).then(|| row[i] as f64 / total as f64)
            })
            .collect()
    }
}

/// Prediction for one image
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    /// Predicted class index
    pub class_id: usize,
    /// Predicted class name from the class mapping
    pub class_name: String,
    /// Softmax probability of the predicted class
    pub confidence: f64,
    /// Top-k `(class name, probability)` pairs, best first
    pub top_k: Vec<(String, f64)>,
}
