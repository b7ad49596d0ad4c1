// src/module.rs
use crate::autograd::{set_inference_mode, Tensor};
use crate::error::{LoraError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

#[derive(Serialize, Deserialize)]
pub struct ModelCheckpoint {
    pub params: Vec<(Vec<usize>, Vec<f32>)>,
}

pub trait Module {
    fn forward(&self, input: Tensor) -> Tensor;

    /// Every parameter the module owns, in a stable order.
    fn parameters(&self) -> Vec<Tensor>;

    // 训练模式：允许构图
    fn train_mode(&mut self) {
        set_inference_mode(false);
    }

    // 推理模式：禁止构图（等价 no_grad）
    fn eval_mode(&mut self) {
        set_inference_mode(true);
    }

    fn save(&self, path: &Path) -> Result<()> {
        let params = self.parameters().iter().map(Tensor::get_raw_data).collect();
        let checkpoint = ModelCheckpoint { params };
        let writer = BufWriter::new(File::create(path)?);
        bincode::serialize_into(writer, &checkpoint)
            .map_err(|e| LoraError::Checkpoint(e.to_string()))?;
        info!(path = %path.display(), "model saved");
        Ok(())
    }

    fn load(&self, path: &Path) -> Result<()> {
        let reader = BufReader::new(File::open(path)?);
        let checkpoint: ModelCheckpoint = bincode::deserialize_from(reader)
            .map_err(|e| LoraError::Checkpoint(e.to_string()))?;

        let my_params = self.parameters();
        if checkpoint.params.len() != my_params.len() {
            return Err(LoraError::Checkpoint(format!(
                "parameter count mismatch: checkpoint has {}, model has {}",
                checkpoint.params.len(),
                my_params.len()
            )));
        }

        for (param, (shape, data)) in my_params.iter().zip(checkpoint.params) {
            if param.shape() != shape {
                return Err(LoraError::ShapeMismatch {
                    expected: param.shape(),
                    actual: shape,
                });
            }
            param
                .set_raw_data(shape, data)
                .map_err(|e| LoraError::Checkpoint(e.to_string()))?;
        }

        info!(path = %path.display(), "model loaded");
        Ok(())
    }
}
