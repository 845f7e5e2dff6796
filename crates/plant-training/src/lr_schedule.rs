//! Reduce-on-plateau learning rate scheduling.
//!
//! The scheduler watches validation accuracy (higher is better). A value
//! counts as an improvement when it beats the best so far by the relative
//! `threshold`. Once more than `patience` consecutive epochs fail to improve,
//! the learning rate is multiplied by `factor` (never below `min_lr`) and the
//! bad-epoch counter starts over.
//!
//! This counter is independent from the early-stopping patience kept by the
//! trainer.

use plant_core::PlateauConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Reductions smaller than this are ignored
const MIN_LR_DELTA: f64 = 1e-8;

/// Everything needed to resume scheduling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Learning rate for the next epoch
    pub learning_rate: f64,
    /// Best metric seen, `None` before the first step
    pub best: Option<f64>,
    /// Consecutive epochs without improvement
    pub num_bad_epochs: usize,
    /// How many times the rate was reduced
    pub num_reductions: usize,
}

impl SchedulerState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            best: None,
            num_bad_epochs: 0,
            num_reductions: 0,
        }
    }
}

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct PlateauScheduler {
    config: PlateauConfig,
    state: SchedulerState,
}

impl PlateauScheduler {
    pub fn new(config: PlateauConfig, base_lr: f64) -> Self {
        Self::from_state(config, SchedulerState::new(base_lr))
    }

    /// Continues from a stored state
    pub fn from_state(config: PlateauConfig, state: SchedulerState) -> Self {
        Self { config, state }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.state.learning_rate
    }

    pub fn state(&self) -> &SchedulerState {
        &self.state
    }

    fn is_better(&self, metric: f64) -> bool {
        match self.state.best {
            None => true,
            Some(best) => metric > best * (1.0 + self.config.threshold),
        }
    }

    /// Feeds one epoch's validation metric. Returns `true` when the rate
    /// was reduced.
    pub fn step(&mut self, metric: f64) -> bool {
        if self.is_better(metric) {
            self.state.best = Some(metric);
            self.state.num_bad_epochs = 0;
            return false;
        }

        self.state.num_bad_epochs += 1;
        if self.state.num_bad_epochs <= self.config.patience {
            return false;
        }

        self.state.num_bad_epochs = 0;
        let old_lr = self.state.learning_rate;
        let new_lr = (old_lr * self.config.factor).max(self.config.min_lr);
        if old_lr - new_lr <= MIN_LR_DELTA {
            return false;
        }

        self.state.learning_rate = new_lr;
        self.state.num_reductions += 1;
        info!("Reducing learning rate from {:.2e} to {:.2e}", old_lr, new_lr);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PlateauConfig {
        PlateauConfig {
            factor: 0.5,
            patience: 2,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }

    #[test]
    fn test_improving_metric_keeps_lr() {
        let mut scheduler = PlateauScheduler::new(config(), 0.001);
        for metric in [0.5, 0.6, 0.7, 0.8] {
            assert!(!scheduler.step(metric));
        }
        assert_eq!(scheduler.get_lr(), 0.001);
        assert_eq!(scheduler.state().best, Some(0.8));
    }

    #[test]
    fn test_reduces_after_more_than_patience_bad_epochs() {
        let mut scheduler = PlateauScheduler::new(config(), 0.001);

        scheduler.step(0.8);
        assert!(!scheduler.step(0.7)); // bad 1
        assert!(!scheduler.step(0.8)); // bad 2, equal is not better
        assert!(scheduler.step(0.79)); // bad 3 > patience
        assert!((scheduler.get_lr() - 0.0005).abs() < 1e-12);
        assert_eq!(scheduler.state().num_bad_epochs, 0);

        for _ in 0..3 {
            scheduler.step(0.1);
        }
        assert!((scheduler.get_lr() - 0.00025).abs() < 1e-12);
        assert_eq!(scheduler.state().num_reductions, 2);
    }

    #[test]
    fn test_relative_threshold() {
        let mut scheduler = PlateauScheduler::new(config(), 0.001);
        scheduler.step(0.5);
        // 0.50001 < 0.5 * (1 + 1e-4)
        scheduler.step(0.50001);
        assert_eq!(scheduler.state().num_bad_epochs, 1);
        assert_eq!(scheduler.state().best, Some(0.5));
    }

    #[test]
    fn test_min_lr_floor() {
        let mut cfg = config();
        cfg.min_lr = 0.0004;
        cfg.patience = 0;
        let mut scheduler = PlateauScheduler::new(cfg, 0.001);

        scheduler.step(0.9);
        assert!(scheduler.step(0.1));
        assert!((scheduler.get_lr() - 0.0005).abs() < 1e-12);
        assert!(scheduler.step(0.1));
        assert!((scheduler.get_lr() - 0.0004).abs() < 1e-12);
        assert!(!scheduler.step(0.1));
        assert!((scheduler.get_lr() - 0.0004).abs() < 1e-12);
    }

    #[test]
    fn test_resume_from_state() {
        let mut scheduler = PlateauScheduler::new(config(), 0.001);
        scheduler.step(0.8);
        scheduler.step(0.7);

        let json = serde_json::to_string(scheduler.state()).unwrap();
        let state: SchedulerState = serde_json::from_str(&json).unwrap();
        let mut resumed = PlateauScheduler::from_state(config(), state);

        assert_eq!(resumed.state(), scheduler.state());
        assert_eq!(resumed.step(0.6), scheduler.step(0.6));
        assert_eq!(resumed.state(), scheduler.state());
    }
}
