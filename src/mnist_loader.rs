// src/mnist_loader.rs
use crate::data::Dataset;
use crate::error::{LoraError, Result};
use mnist::{Mnist, MnistBuilder};
use ndarray::Array2;
use std::path::Path;
use tracing::info;

pub const TRAIN_SIZE: usize = 60_000;
pub const TEST_SIZE: usize = 10_000;
pub const IMAGE_DIM: usize = 28 * 28;

const MNIST_MEAN: f32 = 0.1307;
const MNIST_STD: f32 = 0.3081;

const FILES: [&str; 4] = [
    "train-images-idx3-ubyte",
    "train-labels-idx1-ubyte",
    "t10k-images-idx3-ubyte",
    "t10k-labels-idx1-ubyte",
];

#[derive(Debug)]
pub struct MnistData {
    pub train: Dataset,
    pub test: Dataset,
}

/// Loads the four uncompressed MNIST IDX files from `data_dir`.
pub fn load(data_dir: &Path) -> Result<MnistData> {
    // MnistBuilder panics on missing files, so check up front.
    if !data_dir.is_dir() {
        return Err(LoraError::Dataset(format!(
            "MNIST directory {} does not exist",
            data_dir.display()
        )));
    }
    if let Some(missing) = FILES.iter().find(|f| !data_dir.join(f).is_file()) {
        return Err(LoraError::Dataset(format!(
            "missing {} in {}; download and unpack the four MNIST files there",
            missing,
            data_dir.display()
        )));
    }
    let base_path = data_dir
        .to_str()
        .ok_or_else(|| LoraError::Dataset(format!("non UTF-8 path {}", data_dir.display())))?;

    info!(dir = %data_dir.display(), "loading MNIST");

    let Mnist {
        trn_img,
        trn_lbl,
        tst_img,
        tst_lbl,
        ..
    } = MnistBuilder::new()
        .label_format_digit()
        .training_set_length(TRAIN_SIZE as u32)
        .validation_set_length(0)
        .test_set_length(TEST_SIZE as u32)
        .base_path(base_path)
        .finalize();

    Ok(MnistData {
        train: to_dataset(trn_img, trn_lbl, TRAIN_SIZE)?,
        test: to_dataset(tst_img, tst_lbl, TEST_SIZE)?,
    })
}

fn to_dataset(images: Vec<u8>, labels: Vec<u8>, size: usize) -> Result<Dataset> {
    let images = process_images(images, size)?;
    let labels = labels.into_iter().map(usize::from).collect();
    Dataset::new(images, labels)
}

/// Scales pixels to `[0, 1]` then standardizes with the MNIST mean and std.
fn process_images(data: Vec<u8>, size: usize) -> Result<Array2<f32>> {
    let data_f32: Vec<f32> = data
        .into_iter()
        .map(|x| (x as f32 / 255.0 - MNIST_MEAN) / MNIST_STD)
        .collect();
    Array2::from_shape_vec((size, IMAGE_DIM), data_f32)
        .map_err(|e| LoraError::Dataset(format!("error reshaping images: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_directory_is_an_error() {
        let err = load(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, LoraError::Dataset(_)));
    }

    #[test]
    fn missing_files_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(FILES[0]), b"").unwrap();
        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains(FILES[1]));
    }

    #[test]
    fn pixels_are_standardized() {
        let images = process_images(vec![0, 255], 1).err();
        assert!(images.is_some(), "two pixels cannot fill a 28x28 image");

        let mut raw = vec![0u8; IMAGE_DIM];
        raw[0] = 255;
        let images = process_images(raw, 1).unwrap();
        assert!((images[[0, 0]] - (1.0 - MNIST_MEAN) / MNIST_STD).abs() < 1e-6);
        assert!((images[[0, 1]] + MNIST_MEAN / MNIST_STD).abs() < 1e-6);
    }
}
