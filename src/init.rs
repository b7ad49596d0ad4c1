// src/init.rs
use crate::autograd::Tensor;
use ndarray::{Array, ArrayD, IxDyn};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::Normal;
use ndarray_rand::RandomExt;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitType {
    KaimingNormal,  // For ReLU (He), fan_in = shape[1] of an [out, in] weight
    StandardNormal, // N(0, 1), LoRA factor A
    Zeros,          // For Bias, LoRA factor B
}

/// Fills an array of `shape` according to `init_type`, drawing from `rng`.
pub fn array_init_with<R: Rng + ?Sized>(shape: &[usize], init_type: InitType, rng: &mut R) -> ArrayD<f32> {
    let shape_dyn = IxDyn(shape);

    match init_type {
        InitType::Zeros => ArrayD::zeros(shape_dyn),

        InitType::KaimingNormal => {
            let fan_in = if shape.len() > 1 { shape[1] } else { shape[0] } as f32;
            let std = (2.0 / fan_in).sqrt();
            let dist = Normal::new(0.0, std).expect("kaiming std is non-negative");
            Array::random_using(shape_dyn, dist, rng)
        }

        InitType::StandardNormal => {
            let dist = Normal::new(0.0f32, 1.0).expect("unit variance is valid");
            Array::random_using(shape_dyn, dist, rng)
        }
    }
}

/// Trainable leaf initialized from `rng`.
pub fn tensor_init_with<R: Rng + ?Sized>(shape: Vec<usize>, init_type: InitType, rng: &mut R) -> Tensor {
    Tensor::parameter(array_init_with(&shape, init_type, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    #[test]
    fn same_seed_same_weights() {
        let a = array_init_with(&[4, 3], InitType::KaimingNormal, &mut StdRng::seed_from_u64(7));
        let b = array_init_with(&[4, 3], InitType::KaimingNormal, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
    }

    #[test]
    fn zeros_are_exact() {
        let z = tensor_init_with(vec![3, 2], InitType::Zeros, &mut StdRng::seed_from_u64(0));
        assert!(z.requires_grad());
        assert!(z.data_ref().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn standard_normal_has_unit_scale() {
        let mut rng = StdRng::seed_from_u64(0);
        let x = array_init_with(&[200, 50], InitType::StandardNormal, &mut rng);
        let n = x.len() as f32;
        let mean = x.sum() / n;
        let var = x.mapv(|v| (v - mean).powi(2)).sum() / n;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.1, "var {var}");
    }
}
