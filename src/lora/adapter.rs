// src/lora/adapter.rs
// W_eff = W_base + (alpha / rank) * (B @ A); B: [rows, rank], A: [rank, cols]

use crate::autograd::{no_grad, Tensor};
use crate::error::{LoraError, Result};
use crate::init::{tensor_init_with, InitType};
use crate::layers::WeightProvider;
use crate::ops::matmul::mm;
use ndarray::ArrayD;
use ndarray_rand::rand::Rng;
use std::cell::Cell;
use std::rc::Rc;
use tracing::warn;

pub struct LowRankAdapter {
    lora_a: Tensor, // [rank, cols], N(0, 1)
    lora_b: Tensor, // [rows, rank], zeros
    rows: usize,
    cols: usize,
    rank: usize,
    alpha: f32,
    scale: f32,
    enabled: Cell<bool>,
}

impl LowRankAdapter {
    pub fn new(rows: usize, cols: usize, rank: usize, alpha: f32) -> Result<Self> {
        Self::new_with_rng(rows, cols, rank, alpha, &mut ndarray_rand::rand::thread_rng())
    }

    pub fn new_with_rng<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        rank: usize,
        alpha: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if rank == 0 {
            return Err(LoraError::InvalidRank { rank });
        }
        if !(alpha.is_finite() && alpha > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "alpha must be a positive finite number, got {alpha}"
            )));
        }
        if rank > rows.min(cols) {
            warn!(rank, rows, cols, "LoRA rank exceeds the smaller weight dimension; the update is no longer low-rank");
        }

        let lora_a = tensor_init_with(vec![rank, cols], InitType::StandardNormal, rng);
        let lora_b = tensor_init_with(vec![rows, rank], InitType::Zeros, rng);

        Ok(Self {
            lora_a,
            lora_b,
            rows,
            cols,
            rank,
            alpha,
            scale: alpha / rank as f32,
            enabled: Cell::new(true),
        })
    }

    pub fn for_weight<R: Rng + ?Sized>(base: &Tensor, rank: usize, alpha: f32, rng: &mut R) -> Result<Self> {
        match base.shape().as_slice() {
            &[rows, cols] => Self::new_with_rng(rows, cols, rank, alpha, rng),
            other => Err(LoraError::ShapeMismatch {
                expected: vec![other.first().copied().unwrap_or(0), other.last().copied().unwrap_or(0)],
                actual: other.to_vec(),
            }),
        }
    }

    pub fn output_shape(&self) -> Vec<usize> {
        vec![self.rows, self.cols]
    }

    pub fn check_base(&self, base: &Tensor) -> Result<()> {
        let b_shape = self.lora_b.shape();
        let a_shape = self.lora_a.shape();
        let product = vec![b_shape[0], a_shape[1]];
        let actual = base.shape();
        if b_shape[1] != a_shape[0] || product != actual {
            return Err(LoraError::ShapeMismatch {
                expected: product,
                actual,
            });
        }
        Ok(())
    }

    /// Disabled adapters hand back `base` itself, so the unadapted path is bit-exact.
    pub fn apply(&self, base: &Tensor) -> Tensor {
        if !self.enabled.get() {
            return base.clone();
        }
        debug_assert_eq!(base.shape(), self.output_shape());

        let delta = mm(&self.lora_b, &self.lora_a).scale(self.scale);
        base + &delta
    }

    pub fn delta(&self) -> ArrayD<f32> {
        no_grad(|| mm(&self.lora_b, &self.lora_a).scale(self.scale).data())
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(enabled);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.get()
    }

    pub fn lora_a(&self) -> &Tensor {
        &self.lora_a
    }

    pub fn lora_b(&self) -> &Tensor {
        &self.lora_b
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f32 {
        self.alpha
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn num_parameters(&self) -> usize {
        self.lora_a.len() + self.lora_b.len()
    }
}

impl std::fmt::Debug for LowRankAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LowRankAdapter")
            .field("shape", &(self.rows, self.cols))
            .field("rank", &self.rank)
            .field("alpha", &self.alpha)
            .field("enabled", &self.enabled.get())
            .finish()
    }
}

pub struct AdaptedWeight {
    base: Tensor,
    adapter: Rc<LowRankAdapter>,
}

impl AdaptedWeight {
    pub fn new(base: Tensor, adapter: Rc<LowRankAdapter>) -> Result<Self> {
        adapter.check_base(&base)?;
        Ok(Self { base, adapter })
    }

    pub fn adapter(&self) -> &Rc<LowRankAdapter> {
        &self.adapter
    }
}

impl WeightProvider for AdaptedWeight {
    fn base(&self) -> &Tensor {
        &self.base
    }

    fn weight(&self) -> Tensor {
        self.adapter.apply(&self.base)
    }

    fn is_adapted(&self) -> bool {
        true
    }
}
