use crate::config::{OptimBits, OptimizerConfig, OptimizerKind};
use crate::impl_base64_serde;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::F32 => write!(f, "float32"),
            DType::F16 => write!(f, "float16"),
        }
    }
}

/// Raw accumulator storage in its current precision.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum StateBuffer {
    F32(Vec<f32>),
    U8(Vec<u8>),
}

impl StateBuffer {
    pub fn len(&self) -> usize {
        match self {
            StateBuffer::F32(v) => v.len(),
            StateBuffer::U8(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn optim_bits(&self) -> OptimBits {
        match self {
            StateBuffer::F32(_) => OptimBits::ThirtyTwo,
            StateBuffer::U8(_) => OptimBits::Eight,
        }
    }
}

impl_base64_serde! {
    ParamStateRecord {
        shape: Vec<usize>,
        dtype: DType,
        step: u64,
        skip_zeros: bool,
        state1: StateBuffer,
        state2: Option<StateBuffer>,
        qmap1: Option<Vec<f32>>,
        qmap2: Option<Vec<f32>>,
        max1: Option<f32>,
        max2: Option<f32>,
        absmax1: Option<Vec<f32>>,
        absmax2: Option<Vec<f32>>,
        block_size: Option<usize>,
        unorm_vec: Option<f32>,
    }
}

impl ParamStateRecord {
    pub fn optim_bits(&self) -> OptimBits {
        self.state1.optim_bits()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }
}

impl_base64_serde! {
    ClipperRecord {
        percentile: u32,
        step: u64,
        history: Vec<f32>,
    }
}

/// Persisted optimizer state. `state` is keyed by the position of the
/// parameter in the list the optimizer was constructed with; slots that never
/// stepped are absent.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct StateDict {
    pub kind: OptimizerKind,
    pub config: OptimizerConfig,
    pub state: BTreeMap<usize, ParamStateRecord>,
    pub clipper: Option<ClipperRecord>,
}
