use burn::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which loss terms drive the optimizer, resolved from the two boolean
/// switches during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Objective {
    /// Forward KL against the conformation dataset only.
    ExampleOnly,
    /// Reverse KL against the energy oracle only.
    EnergyOnly,
    /// Weighted sum of both terms.
    Both,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one of train_example / train_energy must be enabled")]
    NoObjective,
    #[error("validation_fraction must lie in (0, 1), got {0}")]
    InvalidValidationFraction(f64),
    #[error("energy thresholds must satisfy 0 < high < max, got high {high}, max {max}")]
    InvalidEnergyThresholds { high: f64, max: f64 },
    #[error("learning rates must satisfy 0 < final <= init, got init {init}, final {fin}")]
    InvalidLearningRate { init: f64, fin: f64 },
    #[error("{field} must be positive")]
    ZeroValue { field: &'static str },
    #[error("warmup_epochs ({warmup}) must not exceed epochs ({epochs})")]
    WarmupTooLong { warmup: usize, epochs: usize },
    #[error("dataset has {got} frames, need at least {needed} for the requested split")]
    DatasetTooSmall { needed: usize, got: usize },
}

/// Full training run description. Values mirror the optimizer, schedule and
/// loss switches of the run; everything is plain data so a config can be
/// serialized next to the artifacts it produced.
#[derive(Config, Debug)]
pub struct TrainingConfig {
    #[config(default = 1000)]
    pub epochs: usize,
    #[config(default = 1024)]
    pub batch_size: usize,
    #[config(default = 10)]
    pub warmup_epochs: usize,
    #[config(default = 1e-3)]
    pub init_lr: f64,
    #[config(default = 1e-5)]
    pub final_lr: f64,
    #[config(default = 1e-3)]
    pub weight_decay: f64,
    #[config(default = 1.0)]
    pub max_grad_norm: f32,
    /// Fraction of frames held out for validation.
    #[config(default = 0.1)]
    pub validation_fraction: f64,
    /// Train by maximum likelihood on the dataset.
    #[config(default = true)]
    pub train_example: bool,
    /// Train by energy of decoded samples.
    #[config(default = false)]
    pub train_energy: bool,
    #[config(default = 1.0)]
    pub example_weight: f64,
    #[config(default = 1.0)]
    pub energy_weight: f64,
    /// Oracle temperature in kelvin.
    #[config(default = 298.0)]
    pub temperature: f64,
    /// Start of logarithmic energy compression, reduced units.
    #[config(default = 1e10)]
    pub energy_high: f64,
    /// Energy at which the regularizer saturates, reduced units.
    #[config(default = 1e20)]
    pub energy_max: f64,
    /// Validation and diagnostic cadence in epochs.
    #[config(default = 10)]
    pub log_freq: usize,
    #[config(default = 0)]
    pub seed: u64,
}

impl TrainingConfig {
    /// Check internal consistency. Pure value checks only; filesystem
    /// concerns live in [`crate::workspace::RunWorkspace`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.objective()?;
        if self.epochs == 0 {
            return Err(ConfigError::ZeroValue { field: "epochs" });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroValue { field: "batch_size" });
        }
        if self.log_freq == 0 {
            return Err(ConfigError::ZeroValue { field: "log_freq" });
        }
        if self.warmup_epochs > self.epochs {
            return Err(ConfigError::WarmupTooLong {
                warmup: self.warmup_epochs,
                epochs: self.epochs,
            });
        }
        if !(self.validation_fraction > 0.0 && self.validation_fraction < 1.0) {
            return Err(ConfigError::InvalidValidationFraction(
                self.validation_fraction,
            ));
        }
        if !(self.init_lr > 0.0 && self.final_lr > 0.0 && self.final_lr <= self.init_lr) {
            return Err(ConfigError::InvalidLearningRate {
                init: self.init_lr,
                fin: self.final_lr,
            });
        }
        if !(self.energy_high > 0.0 && self.energy_high < self.energy_max) {
            return Err(ConfigError::InvalidEnergyThresholds {
                high: self.energy_high,
                max: self.energy_max,
            });
        }
        Ok(())
    }

    /// Resolve the loss switches into a single objective.
    pub fn objective(&self) -> Result<Objective, ConfigError> {
        match (self.train_example, self.train_energy) {
            (true, false) => Ok(Objective::ExampleOnly),
            (false, true) => Ok(Objective::EnergyOnly),
            (true, true) => Ok(Objective::Both),
            (false, false) => Err(ConfigError::NoObjective),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = TrainingConfig::new();
        config.validate().unwrap();
        assert_eq!(config.objective().unwrap(), Objective::ExampleOnly);
    }

    #[test]
    fn test_objective_resolution() {
        let both = TrainingConfig::new().with_train_energy(true);
        assert_eq!(both.objective().unwrap(), Objective::Both);

        let energy = TrainingConfig::new()
            .with_train_example(false)
            .with_train_energy(true);
        assert_eq!(energy.objective().unwrap(), Objective::EnergyOnly);

        let none = TrainingConfig::new().with_train_example(false);
        assert!(matches!(none.validate(), Err(ConfigError::NoObjective)));
    }

    #[test]
    fn test_bad_values_rejected() {
        let bad_split = TrainingConfig::new().with_validation_fraction(1.5);
        assert!(matches!(
            bad_split.validate(),
            Err(ConfigError::InvalidValidationFraction(_))
        ));

        let bad_thresholds = TrainingConfig::new()
            .with_energy_high(1e20)
            .with_energy_max(1e10);
        assert!(matches!(
            bad_thresholds.validate(),
            Err(ConfigError::InvalidEnergyThresholds { .. })
        ));

        let bad_lr = TrainingConfig::new().with_final_lr(1.0);
        assert!(matches!(
            bad_lr.validate(),
            Err(ConfigError::InvalidLearningRate { .. })
        ));

        let bad_warmup = TrainingConfig::new().with_epochs(5).with_warmup_epochs(6);
        assert!(matches!(
            bad_warmup.validate(),
            Err(ConfigError::WarmupTooLong { .. })
        ));
    }
}
