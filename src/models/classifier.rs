// src/models/classifier.rs
use crate::autograd::Tensor;
use crate::layers::{Linear, ReLU};
use crate::module::Module;
use crate::ops::shape::reshape;
use ndarray_rand::rand::Rng;

/// Fully connected digit classifier: `in -> h1 -> h2 -> classes`, ReLU between layers.
pub struct DigitClassifier {
    pub linear1: Linear,
    pub linear2: Linear,
    pub linear3: Linear,
    relu: ReLU,
    input_dim: usize,
}

impl DigitClassifier {
    pub const INPUT_DIM: usize = 28 * 28;
    pub const NUM_CLASSES: usize = 10;

    /// `784 -> 1000 -> 2000 -> 10`
    pub fn new() -> Self {
        Self::with_sizes(Self::INPUT_DIM, 1000, 2000, Self::NUM_CLASSES)
    }

    pub fn with_sizes(input_dim: usize, hidden1: usize, hidden2: usize, classes: usize) -> Self {
        Self::with_sizes_rng(input_dim, hidden1, hidden2, classes, &mut ndarray_rand::rand::thread_rng())
    }

    pub fn with_sizes_rng<R: Rng + ?Sized>(
        input_dim: usize,
        hidden1: usize,
        hidden2: usize,
        classes: usize,
        rng: &mut R,
    ) -> Self {
        DigitClassifier {
            linear1: Linear::new_with_rng(input_dim, hidden1, rng),
            linear2: Linear::new_with_rng(hidden1, hidden2, rng),
            linear3: Linear::new_with_rng(hidden2, classes, rng),
            relu: ReLU::new(),
            input_dim,
        }
    }

    pub fn num_classes(&self) -> usize {
        self.linear3.out_features()
    }

    /// Linear layers with stable names, for attaching adapters.
    pub fn layers_mut(&mut self) -> [(&'static str, &mut Linear); 3] {
        [
            ("linear1", &mut self.linear1),
            ("linear2", &mut self.linear2),
            ("linear3", &mut self.linear3),
        ]
    }

    pub fn layers(&self) -> [(&'static str, &Linear); 3] {
        [
            ("linear1", &self.linear1),
            ("linear2", &self.linear2),
            ("linear3", &self.linear3),
        ]
    }
}

impl Default for DigitClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Module for DigitClassifier {
    fn forward(&self, input: Tensor) -> Tensor {
        let x = reshape(&input, vec![-1, self.input_dim as i32]);
        let x = self.relu.forward(self.linear1.forward(x));
        let x = self.relu.forward(self.linear2.forward(x));
        self.linear3.forward(x)
    }

    /// Base parameters only; adapter factors belong to the adaptation registry.
    fn parameters(&self) -> Vec<Tensor> {
        self.layers()
            .into_iter()
            .flat_map(|(_, l)| l.parameters())
            .collect()
    }
}
