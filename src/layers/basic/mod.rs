pub mod linear;

pub use linear::{DenseWeight, Linear, WeightProvider};
