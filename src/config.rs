// src/config.rs
use crate::error::{LoraError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoraConfig {
    pub rank: usize,
    pub alpha: f32, // delta is scaled by alpha / rank
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self { rank: 1, alpha: 1.0 }
    }
}

impl LoraConfig {
    pub fn new(rank: usize, alpha: f32) -> Self {
        Self { rank, alpha }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(LoraError::InvalidRank { rank: self.rank });
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "alpha must be a positive finite number, got {}",
                self.alpha
            )));
        }
        Ok(())
    }

    pub fn scale(&self) -> f32 {
        self.alpha / self.rank as f32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub learning_rate: f32,
    pub epochs: usize,
    /// Stop after this many iterations in total, across epochs.
    pub iteration_limit: Option<usize>,
    pub batch_size: usize,
    pub log_every: usize, // 0 disables
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            epochs: 1,
            iteration_limit: None,
            batch_size: 10,
            log_every: 100,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "learning_rate must be a positive finite number, got {}",
                self.learning_rate
            )));
        }
        if self.epochs == 0 {
            return Err(LoraError::InvalidConfig("epochs must be at least 1".into()));
        }
        if self.iteration_limit == Some(0) {
            return Err(LoraError::InvalidConfig(
                "iteration_limit must be at least 1 when set".into(),
            ));
        }
        if self.batch_size == 0 {
            return Err(LoraError::InvalidConfig("batch_size must be at least 1".into()));
        }
        Ok(())
    }

    pub fn with_iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = Some(limit);
        self
    }
}
