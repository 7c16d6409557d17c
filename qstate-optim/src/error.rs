//! Error types for qstate-optim operations.

use crate::tensor::ParamId;
use qstate_structs::{config::OptimBits, core::DType};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, OptimError>;

#[derive(Debug, Error, PartialEq)]
pub enum OptimError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Invalid override '{key}' for parameter {param}: {reason}")]
    InvalidOverride {
        param: ParamId,
        key: String,
        reason: String,
    },

    #[error("Parameter {param} is already registered; overrides must be set before register_parameters")]
    RegistryFrozen { param: ParamId },

    #[error("Parameter {param} appears more than once")]
    DuplicateParameter { param: ParamId },

    #[error("Parameter {param} does not exist")]
    UnknownParameter { param: ParamId },

    #[error("Shape mismatch for {context}. Expected: '{expected:?}', Actual: '{actual:?}'")]
    ShapeMismatch {
        context: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("DType mismatch for {context}. Expected: '{expected}', Actual: '{actual}'")]
    DTypeMismatch {
        context: String,
        expected: DType,
        actual: DType,
    },

    #[error("Bit-width mismatch for parameter slot {slot}. Expected: '{expected}', Actual: '{actual}'")]
    BitWidthMismatch {
        slot: usize,
        expected: OptimBits,
        actual: OptimBits,
    },

    #[error("Invalid state dict: {reason}")]
    InvalidStateDict { reason: String },

    #[error("Invalid quantized buffer: {reason}")]
    InvalidQuantizedBuffer { reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

impl OptimError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        OptimError::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_state_dict(reason: impl Into<String>) -> Self {
        OptimError::InvalidStateDict {
            reason: reason.into(),
        }
    }
}
