// src/data.rs
use crate::autograd::Tensor;
use crate::error::{LoraError, Result};
use ndarray::{Array2, Axis};
use ndarray_rand::rand::seq::SliceRandom;
use ndarray_rand::rand::Rng;

#[derive(Clone)]
pub struct Batch {
    pub inputs: Tensor, // [B, features]
    pub labels: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct Dataset {
    images: Array2<f32>,
    labels: Vec<usize>,
}

impl Dataset {
    pub fn new(images: Array2<f32>, labels: Vec<usize>) -> Result<Self> {
        if images.nrows() != labels.len() {
            return Err(LoraError::Dataset(format!(
                "{} samples but {} labels",
                images.nrows(),
                labels.len()
            )));
        }
        Ok(Self { images, labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn images(&self) -> &Array2<f32> {
        &self.images
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    fn select(&self, indices: &[usize]) -> Dataset {
        Dataset {
            images: self.images.select(Axis(0), indices),
            labels: indices.iter().map(|&i| self.labels[i]).collect(),
        }
    }

    pub fn filter_label(&self, label: usize) -> Dataset {
        let indices: Vec<usize> = (0..self.len()).filter(|&i| self.labels[i] == label).collect();
        self.select(&indices)
    }

    pub fn shuffled<R: Rng + ?Sized>(&self, rng: &mut R) -> Dataset {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(rng);
        self.select(&indices)
    }

    /// The last batch may be shorter. Each call restarts from the first sample.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch> + '_ {
        let batch_size = batch_size.max(1);
        self.images
            .axis_chunks_iter(Axis(0), batch_size)
            .zip(self.labels.chunks(batch_size))
            .map(|(images, labels)| Batch {
                inputs: Tensor::from_data_no_grad(images.to_owned().into_dyn()),
                labels: labels.to_vec(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray_rand::rand::rngs::StdRng;
    use ndarray_rand::rand::SeedableRng;

    fn toy() -> Dataset {
        let images = Array2::from_shape_fn((5, 2), |(i, j)| (i * 2 + j) as f32);
        Dataset::new(images, vec![0, 1, 0, 2, 0]).unwrap()
    }

    #[test]
    fn rejects_label_count_mismatch() {
        assert!(Dataset::new(Array2::zeros((3, 2)), vec![0, 1]).is_err());
    }

    #[test]
    fn batches_cover_all_samples_and_restart() {
        let ds = toy();
        let sizes: Vec<usize> = ds.batches(2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        let first = ds.batches(2).next().unwrap();
        assert_eq!(first.inputs.shape(), vec![2, 2]);
        assert_eq!(first.labels, vec![0, 1]);
        assert!(!first.inputs.requires_grad());
    }

    #[test]
    fn filter_label_keeps_matching_rows() {
        let zeros = toy().filter_label(0);
        assert_eq!(zeros.len(), 3);
        assert!(zeros.labels().iter().all(|&l| l == 0));
        assert_eq!(zeros.images().row(1).to_vec(), vec![4.0, 5.0]);
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let ds = toy();
        let shuffled = ds.shuffled(&mut StdRng::seed_from_u64(3));
        let mut labels = shuffled.labels().to_vec();
        labels.sort_unstable();
        assert_eq!(labels, vec![0, 0, 0, 1, 2]);
        assert_eq!(shuffled.images().sum(), ds.images().sum());
    }
}
