// src/layers/basic/linear.rs
use crate::autograd::Tensor;
use crate::init::{tensor_init_with, InitType};
use crate::module::Module;
use crate::ops::matmul::matmul;
use ndarray_rand::rand::Rng;

/// Source of the weight a [`Linear`] multiplies by on each forward pass.
pub trait WeightProvider {
    fn base(&self) -> &Tensor; // [out, in], never modified

    fn weight(&self) -> Tensor;

    fn is_adapted(&self) -> bool {
        false
    }
}

pub struct DenseWeight(Tensor);

impl DenseWeight {
    pub fn new(weight: Tensor) -> Self {
        DenseWeight(weight)
    }
}

impl WeightProvider for DenseWeight {
    fn base(&self) -> &Tensor {
        &self.0
    }

    fn weight(&self) -> Tensor {
        self.0.clone()
    }
}

pub struct Linear {
    weight: Box<dyn WeightProvider>, // shape: [out_features, in_features]
    pub bias: Option<Tensor>,        // shape: [out_features]
    in_features: usize,
    out_features: usize,
}

impl Linear {
    pub fn new(in_features: usize, out_features: usize) -> Self {
        Self::new_with_rng(in_features, out_features, &mut ndarray_rand::rand::thread_rng())
    }

    pub fn new_with_rng<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        // 注意：为了对齐 PyTorch nn.Linear.weight 的布局，weight 存成 [out, in]
        let weight = tensor_init_with(vec![out_features, in_features], InitType::KaimingNormal, rng);
        let bias = tensor_init_with(vec![out_features], InitType::Zeros, rng);

        Linear {
            weight: Box::new(DenseWeight::new(weight)),
            bias: Some(bias),
            in_features,
            out_features,
        }
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.out_features
    }

    pub fn base_weight(&self) -> &Tensor {
        self.weight.base()
    }

    pub fn weight(&self) -> Tensor {
        self.weight.weight()
    }

    pub fn is_adapted(&self) -> bool {
        self.weight.is_adapted()
    }

    /// Swaps the weight provider, returning the previous one. The new provider
    /// must keep serving the same base tensor.
    pub fn replace_weight_provider(&mut self, provider: Box<dyn WeightProvider>) -> Box<dyn WeightProvider> {
        debug_assert_eq!(provider.base().id(), self.weight.base().id());
        std::mem::replace(&mut self.weight, provider)
    }
}

impl Module for Linear {
    fn forward(&self, input: Tensor) -> Tensor {
        let y = matmul(&input, &self.weight());

        if let Some(bias) = &self.bias {
            y + bias.clone() // bias: [out]
        } else {
            y
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.base_weight().clone()];
        if let Some(b) = &self.bias {
            params.push(b.clone());
        }
        params
    }
}
