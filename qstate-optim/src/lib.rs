mod clipping;
pub use clipping::*;
pub mod codec;
mod error;
pub use error::*;
mod optimizer;
pub use optimizer::*;
mod registry;
pub use registry::*;
pub mod rules;
mod serialize;
pub use serialize::*;
mod state;
pub use state::*;
mod tensor;
pub use tensor::*;

pub use qstate_structs::config::{
    OptimBits, OptimizerConfig, OptimizerKind, ParamOverride, DEFAULT_BLOCK_SIZE,
    DEFAULT_MIN_8BIT_SIZE,
};
pub use qstate_structs::core::{ClipperRecord, ParamStateRecord, StateBuffer, StateDict};
