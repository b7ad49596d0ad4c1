// src/lib.rs

pub mod autograd;
pub mod module;
pub mod optim;
pub mod loss;
pub mod ops;
pub mod init;
pub mod layers;
pub mod models;
pub mod lora;
pub mod train;
pub mod data;
pub mod mnist_loader;
pub mod config;
pub mod error;

pub use autograd::Tensor;
pub use config::{LoraConfig, TrainConfig};
pub use error::{LoraError, Result};
pub use module::Module;
