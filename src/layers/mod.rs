pub mod activation;
pub mod basic;

// 重新导出 (Re-export)：use lumen_lora::layers::{Linear, ReLU};
pub use activation::ReLU;
pub use basic::{DenseWeight, Linear, WeightProvider};
