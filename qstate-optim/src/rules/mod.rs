//! Update rules of the supported optimizer families.
//!
//! Every rule works on full precision working buffers. Dequantizing before and
//! requantizing after a rule runs is the caller's job.

use ndarray::ArrayView1;
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

mod adam;
mod lamb;
mod lars;
mod momentum;
mod rmsprop;

pub use adam::Adam;
pub use lamb::Lamb;
pub use lars::Lars;
pub use momentum::Momentum;
pub use rmsprop::Rmsprop;

/// Buffers of one parameter for one step. `state2` is empty for one-state
/// families.
pub struct StepBuffers<'a> {
    pub param: &'a mut [f32],
    pub grad: &'a [f32],
    pub state1: &'a mut [f32],
    pub state2: &'a mut [f32],
    /// Step being taken, starting at 1.
    pub step: u64,
    /// Elements with an exactly zero gradient are left untouched.
    pub skip_zeros: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StepOutcome {
    /// Norm of the update, for families that compute a trust ratio.
    pub unorm: Option<f32>,
}

pub trait UpdateRule: Send + Sync {
    fn kind(&self) -> OptimizerKind;

    /// Whether accumulator `index` can hold negative values. Non-negative
    /// accumulators are quantized with the unsigned map.
    fn signed_state(&self, index: usize) -> bool;

    fn apply(&self, config: &OptimizerConfig, buffers: StepBuffers<'_>) -> StepOutcome;
}

pub fn rule_for(kind: OptimizerKind) -> &'static dyn UpdateRule {
    match kind {
        OptimizerKind::Adam => &Adam,
        OptimizerKind::Momentum => &Momentum,
        OptimizerKind::Rmsprop => &Rmsprop,
        OptimizerKind::Lars => &Lars,
        OptimizerKind::Lamb => &Lamb,
    }
}

pub(crate) fn l2_norm(values: &[f32]) -> f32 {
    ArrayView1::from(values)
        .fold(0.0f64, |acc, v| acc + (*v as f64) * (*v as f64))
        .sqrt() as f32
}

/// `max_unorm * ||p|| / ||u||` when the update is larger than that bound,
/// otherwise 1. A zero `max_unorm` disables the bound.
pub(crate) fn trust_ratio(max_unorm: f32, pnorm: f32, unorm: f32) -> f32 {
    if max_unorm > 0.0 && unorm > max_unorm * pnorm {
        max_unorm * pnorm / unorm
    } else {
        1.0
    }
}
