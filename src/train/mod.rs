mod eval;
mod trainer;

pub use eval::{evaluate, EvalReport};
pub use trainer::{TrainReport, TrainState, Trainer};
