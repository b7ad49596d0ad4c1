mod adapter;
mod registry;

pub use adapter::{AdaptedWeight, LowRankAdapter};
pub use registry::{LayerAdaptationRegistry, ParamInfo, ParamRole, ParameterCount};
