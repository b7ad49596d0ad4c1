pub mod arithmetic;
pub mod matmul;
pub mod shape;

pub use arithmetic::{scale, sum};
pub use matmul::{matmul, mm};
pub use shape::reshape;
