// src/train/trainer.rs
use crate::config::TrainConfig;
use crate::data::Batch;
use crate::error::{LoraError, Result};
use crate::loss::CrossEntropyLoss;
use crate::module::Module;
use crate::optim::Optimizer;
use std::time::Instant;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainState {
    Idle,
    Running,
    Completed,
    Stopped, // iteration limit reached
    Failed,  // non-finite loss or malformed batch
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub epochs_run: usize,
    pub iterations: usize,
    pub mean_loss: f32,
    pub final_state: TrainState,
    pub elapsed_secs: f64,
}

pub struct Trainer {
    config: TrainConfig,
    state: TrainState,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: TrainState::Idle,
        })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    pub fn state(&self) -> TrainState {
        self.state
    }

    /// `batches` is called once per epoch and must restart from the first batch.
    pub fn train<M, O, B, I>(&mut self, model: &mut M, optimizer: &mut O, batches: B) -> Result<TrainReport>
    where
        M: Module + ?Sized,
        O: Optimizer + ?Sized,
        B: Fn() -> I,
        I: IntoIterator<Item = Batch>,
    {
        self.state = TrainState::Idle;
        let start = Instant::now();
        model.train_mode();

        self.state = TrainState::Running;
        let limit = self.config.iteration_limit;
        let log_every = self.config.log_every;
        info!(
            epochs = self.config.epochs,
            iteration_limit = ?limit,
            lr = optimizer.learning_rate(),
            params = optimizer.params().len(),
            "training started"
        );

        let mut iterations = 0usize;
        let mut epochs_run = 0usize;
        let mut loss_sum = 0.0f64;

        'epochs: for epoch in 0..self.config.epochs {
            epochs_run = epoch + 1;
            let mut epoch_loss = 0.0f64;
            let mut epoch_iters = 0usize;

            for batch in batches() {
                optimizer.zero_grad();

                let logits = model.forward(batch.inputs.clone());
                if let Err(e) = check_batch(&logits.shape(), &batch.labels) {
                    self.state = TrainState::Failed;
                    error!(epoch, iteration = iterations, error = %e, "malformed batch, aborting run");
                    return Err(e);
                }
                let loss = CrossEntropyLoss::apply(&logits, &batch.labels);
                let value = loss.item().unwrap_or(f32::NAN);
                if !value.is_finite() {
                    self.state = TrainState::Failed;
                    error!(epoch, iteration = iterations, loss = value, "non-finite loss, aborting run");
                    return Err(LoraError::NonFiniteLoss {
                        iteration: iterations,
                        value,
                    });
                }

                loss.backward();
                optimizer.step();

                iterations += 1;
                epoch_iters += 1;
                loss_sum += value as f64;
                epoch_loss += value as f64;

                if log_every > 0 && iterations % log_every == 0 {
                    info!(
                        epoch,
                        iteration = iterations,
                        loss = epoch_loss / epoch_iters as f64,
                        "running loss"
                    );
                }

                if limit.is_some_and(|l| iterations >= l) {
                    self.state = TrainState::Stopped;
                    break 'epochs;
                }
            }

            if epoch_iters > 0 {
                info!(epoch, loss = epoch_loss / epoch_iters as f64, "epoch finished");
            }
        }

        if self.state == TrainState::Running {
            self.state = TrainState::Completed;
        }

        let report = TrainReport {
            epochs_run,
            iterations,
            mean_loss: if iterations == 0 {
                0.0
            } else {
                (loss_sum / iterations as f64) as f32
            },
            final_state: self.state,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            iterations = report.iterations,
            mean_loss = report.mean_loss,
            state = ?report.final_state,
            "training finished"
        );
        Ok(report)
    }
}

// logits must be [labels.len(), classes] with every label below classes
fn check_batch(logits_shape: &[usize], labels: &[usize]) -> Result<()> {
    let &[rows, classes] = logits_shape else {
        return Err(LoraError::Dataset(format!(
            "expected [batch, classes] logits, got {logits_shape:?}"
        )));
    };
    if rows != labels.len() {
        return Err(LoraError::Dataset(format!(
            "batch has {rows} samples but {} labels",
            labels.len()
        )));
    }
    if let Some(&bad) = labels.iter().find(|&&l| l >= classes) {
        return Err(LoraError::Dataset(format!(
            "label {bad} out of range for {classes} classes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::layers::Linear;
    use crate::optim::{Adam, SGD};
    use ndarray::Array2;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    // two separable clusters in 2D
    fn clusters() -> Dataset {
        let images = Array2::from_shape_fn((8, 2), |(i, j)| {
            let sign = if i % 2 == 0 { 1.0 } else { -1.0 };
            sign * (1.0 + 0.1 * (i + j) as f32)
        });
        let labels = (0..8).map(|i| i % 2).collect();
        Dataset::new(images, labels).unwrap()
    }

    fn config() -> TrainConfig {
        TrainConfig {
            learning_rate: 0.1,
            epochs: 3,
            iteration_limit: None,
            batch_size: 4,
            log_every: 0,
        }
    }

    #[test]
    fn new_validates_config() {
        let bad = TrainConfig { epochs: 0, ..config() };
        assert!(Trainer::new(bad).is_err());
        assert_eq!(Trainer::new(config()).unwrap().state(), TrainState::Idle);
    }

    #[test]
    fn full_run_completes_and_reduces_loss() {
        let ds = clusters();
        let mut model = Linear::new_with_rng(2, 2, &mut StdRng::seed_from_u64(0));
        let mut opt = SGD::new(model.parameters(), 0.5);

        let mut trainer = Trainer::new(TrainConfig { epochs: 20, ..config() }).unwrap();
        let first = {
            let mut t = Trainer::new(TrainConfig { epochs: 1, ..config() }).unwrap();
            let mut untouched = Linear::new_with_rng(2, 2, &mut StdRng::seed_from_u64(0));
            let mut frozen_opt = SGD::new(untouched.parameters(), 0.0);
            t.train(&mut untouched, &mut frozen_opt, || ds.batches(4)).unwrap().mean_loss
        };
        let report = trainer.train(&mut model, &mut opt, || ds.batches(4)).unwrap();

        assert_eq!(report.final_state, TrainState::Completed);
        assert_eq!(trainer.state(), TrainState::Completed);
        assert_eq!(report.epochs_run, 20);
        assert_eq!(report.iterations, 40);
        assert!(report.mean_loss < first, "{} !< {}", report.mean_loss, first);
    }

    #[test]
    fn iteration_limit_stops_across_epochs() {
        let ds = clusters();
        let mut model = Linear::new(2, 2);
        let mut opt = Adam::new(model.parameters(), 0.01);
        let mut trainer = Trainer::new(config().with_iteration_limit(3)).unwrap();

        let report = trainer.train(&mut model, &mut opt, || ds.batches(4)).unwrap();
        assert_eq!(report.iterations, 3);
        assert_eq!(report.epochs_run, 2);
        assert_eq!(report.final_state, TrainState::Stopped);
    }

    #[test]
    fn non_finite_loss_is_fatal() {
        let ds = clusters();
        let mut model = Linear::new(2, 2);
        model.base_weight().data_mut().fill(f32::NAN);
        let mut opt = SGD::new(model.parameters(), 0.1);
        let mut trainer = Trainer::new(config()).unwrap();

        let err = trainer.train(&mut model, &mut opt, || ds.batches(4)).unwrap_err();
        assert!(matches!(err, LoraError::NonFiniteLoss { iteration: 0, .. }));
        assert_eq!(trainer.state(), TrainState::Failed);
    }

    #[test]
    fn out_of_range_label_is_an_error() {
        let ds = Dataset::new(Array2::zeros((2, 2)), vec![0, 7]).unwrap();
        let mut model = Linear::new(2, 3);
        let before = model.base_weight().data();
        let mut opt = SGD::new(model.parameters(), 0.1);
        let mut trainer = Trainer::new(config()).unwrap();

        let err = trainer.train(&mut model, &mut opt, || ds.batches(2)).unwrap_err();
        assert!(matches!(err, LoraError::Dataset(_)), "{err}");
        assert_eq!(trainer.state(), TrainState::Failed);
        assert_eq!(model.base_weight().data(), before);
    }

    #[test]
    fn label_count_must_match_rows() {
        let logits_shape = [3, 4];
        assert!(check_batch(&logits_shape, &[0, 1, 3]).is_ok());
        assert!(check_batch(&logits_shape, &[0, 1]).is_err());
        assert!(check_batch(&[3], &[0, 1, 2]).is_err());

        let batch = Batch {
            inputs: crate::autograd::Tensor::from_data_no_grad(ndarray::ArrayD::zeros(ndarray::IxDyn(&[3, 2]))),
            labels: vec![0, 1],
        };
        let mut model = Linear::new(2, 3);
        let mut opt = SGD::new(model.parameters(), 0.1);
        let mut trainer = Trainer::new(config()).unwrap();
        let err = trainer
            .train(&mut model, &mut opt, || std::iter::once(batch.clone()))
            .unwrap_err();
        assert!(matches!(err, LoraError::Dataset(_)));
    }

    #[test]
    fn only_listed_parameters_change() {
        let ds = clusters();
        let mut model = Linear::new(2, 2);
        let bias_before = model.bias.as_ref().unwrap().data();
        let weight_before = model.base_weight().data();

        // Optimizer only sees the weight; the bias still accumulates grads but is never stepped.
        let mut opt = SGD::new(vec![model.base_weight().clone()], 0.1);
        let mut trainer = Trainer::new(config()).unwrap();
        trainer.train(&mut model, &mut opt, || ds.batches(4)).unwrap();

        assert_eq!(model.bias.as_ref().unwrap().data(), bias_before);
        assert_ne!(model.base_weight().data(), weight_before);
    }
}
