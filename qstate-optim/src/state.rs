use crate::codec::{self, Code, Quantized, ScaleMode};
use crate::error::Result;
use crate::rules::UpdateRule;
use crate::tensor::{DType, Tensor};
use qstate_structs::config::{OptimBits, OptimizerConfig};

/// One accumulator buffer, either full precision or 8-bit codes with the map
/// and scales needed to decode them.
#[derive(Clone, Debug, PartialEq)]
pub enum StateTensor {
    Full(Vec<f32>),
    Quantized {
        quantized: Quantized,
        code: Code,
        mode: ScaleMode,
    },
}

impl StateTensor {
    pub(crate) fn zeros(len: usize, bits: OptimBits, code: &Code, mode: ScaleMode) -> Self {
        match bits {
            OptimBits::ThirtyTwo => StateTensor::Full(vec![0.0; len]),
            OptimBits::Eight => StateTensor::Quantized {
                quantized: Quantized::zeros(len, code, mode),
                code: code.clone(),
                mode,
            },
        }
    }

    pub(crate) fn quantized(quantized: Quantized, code: Code, mode: ScaleMode) -> Result<Self> {
        codec::check_layout(quantized.codes.len(), quantized.scales.len(), mode)?;
        Ok(StateTensor::Quantized {
            quantized,
            code,
            mode,
        })
    }

    pub fn optim_bits(&self) -> OptimBits {
        match self {
            StateTensor::Full(_) => OptimBits::ThirtyTwo,
            StateTensor::Quantized { .. } => OptimBits::Eight,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            StateTensor::Full(values) => values.len(),
            StateTensor::Quantized { quantized, .. } => quantized.codes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current values in full precision.
    pub fn dequantized(&self) -> Vec<f32> {
        match self {
            StateTensor::Full(values) => values.clone(),
            StateTensor::Quantized {
                quantized,
                code,
                mode,
            } => {
                let mut out = vec![0.0; quantized.codes.len()];
                codec::decode_into(quantized, code, *mode, &mut out);
                out
            }
        }
    }

    pub fn codes(&self) -> Option<&[u8]> {
        match self {
            StateTensor::Full(_) => None,
            StateTensor::Quantized { quantized, .. } => Some(&quantized.codes),
        }
    }

    pub fn code(&self) -> Option<&Code> {
        match self {
            StateTensor::Full(_) => None,
            StateTensor::Quantized { code, .. } => Some(code),
        }
    }

    pub fn scale_mode(&self) -> Option<ScaleMode> {
        match self {
            StateTensor::Full(_) => None,
            StateTensor::Quantized { mode, .. } => Some(*mode),
        }
    }

    /// Tensor-wide scale of a globally quantized buffer.
    pub fn max(&self) -> Option<f32> {
        match self {
            StateTensor::Quantized {
                quantized,
                mode: ScaleMode::Global,
                ..
            } => quantized.scales.first().copied(),
            _ => None,
        }
    }

    /// Per-block scales of a blockwise quantized buffer.
    pub fn absmax(&self) -> Option<&[f32]> {
        match self {
            StateTensor::Quantized {
                quantized,
                mode: ScaleMode::Blockwise { .. },
                ..
            } => Some(&quantized.scales),
            _ => None,
        }
    }

    pub fn num_bytes(&self) -> usize {
        match self {
            StateTensor::Full(values) => values.len() * 4,
            StateTensor::Quantized { quantized, .. } => {
                quantized.codes.len() + quantized.scales.len() * 4
            }
        }
    }

    /// Moves the values out for an update. Full buffers are handed over
    /// without copying.
    pub(crate) fn take_working(&mut self) -> Vec<f32> {
        match self {
            StateTensor::Full(values) => std::mem::take(values),
            StateTensor::Quantized { .. } => self.dequantized(),
        }
    }

    /// Stores updated values, compressing them again when 8-bit.
    pub(crate) fn store_working(&mut self, values: Vec<f32>, frozen: Option<&[bool]>) {
        match self {
            StateTensor::Full(slot) => *slot = values,
            StateTensor::Quantized {
                quantized,
                code,
                mode,
            } => {
                *quantized = match frozen {
                    Some(frozen) => codec::requantize_frozen(&values, code, *mode, frozen, quantized),
                    None => codec::quantize(&values, code, *mode),
                };
            }
        }
    }
}

/// Bit-width a parameter with `numel` elements gets under `config`.
pub fn resolve_bits(config: &OptimizerConfig, numel: usize) -> OptimBits {
    if config.optim_bits == OptimBits::Eight && numel >= config.min_8bit_size {
        OptimBits::Eight
    } else {
        OptimBits::ThirtyTwo
    }
}

pub fn scale_mode(config: &OptimizerConfig) -> ScaleMode {
    if config.block_wise {
        ScaleMode::Blockwise {
            block_size: config.block_size,
        }
    } else {
        ScaleMode::Global
    }
}

/// Optimizer state of one parameter.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamState {
    pub(crate) step: u64,
    pub(crate) shape: Vec<usize>,
    pub(crate) dtype: DType,
    pub(crate) skip_zeros: bool,
    pub(crate) state1: StateTensor,
    pub(crate) state2: Option<StateTensor>,
    pub(crate) unorm_vec: Option<f32>,
}

impl ParamState {
    pub(crate) fn new(rule: &dyn UpdateRule, value: &Tensor, config: &OptimizerConfig) -> Self {
        let numel = value.numel();
        let bits = resolve_bits(config, numel);
        let mode = scale_mode(config);
        let buffer = |index: usize| {
            StateTensor::zeros(numel, bits, Code::dynamic(rule.signed_state(index)), mode)
        };
        Self {
            step: 0,
            shape: value.shape().to_vec(),
            dtype: value.dtype(),
            skip_zeros: config.skip_zeros,
            state1: buffer(0),
            state2: (rule.kind().num_states() == 2).then(|| buffer(1)),
            unorm_vec: rule.kind().uses_trust_ratio().then_some(0.0),
        }
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn numel(&self) -> usize {
        self.state1.len()
    }

    pub fn skip_zeros(&self) -> bool {
        self.skip_zeros
    }

    pub fn optim_bits(&self) -> OptimBits {
        self.state1.optim_bits()
    }

    pub fn state1(&self) -> &StateTensor {
        &self.state1
    }

    pub fn state2(&self) -> Option<&StateTensor> {
        self.state2.as_ref()
    }

    pub fn unorm_vec(&self) -> Option<f32> {
        self.unorm_vec
    }

    fn num_bytes(&self) -> usize {
        self.state1.num_bytes() + self.state2.as_ref().map_or(0, StateTensor::num_bytes)
    }

    fn num_buffers(&self) -> usize {
        1 + self.state2.is_some() as usize
    }
}

/// Memory usage of the optimizer state.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMemoryStats {
    /// Parameter elements with initialized state.
    pub total_params: usize,
    /// Bytes held by state buffers and their scales.
    pub state_bytes: usize,
    /// Bytes the same buffers would take in fp32.
    pub state_bytes_fp32: usize,
    /// Fraction of memory saved (0.0 - 1.0).
    pub memory_saved: f64,
}

impl StateMemoryStats {
    pub fn state_mb(&self) -> f64 {
        self.state_bytes as f64 / 1_000_000.0
    }

    pub fn state_mb_fp32(&self) -> f64 {
        self.state_bytes_fp32 as f64 / 1_000_000.0
    }
}

/// Per-parameter states indexed by the slot of the parameter in its
/// optimizer. A slot stays empty until the parameter first steps.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateStore {
    slots: Vec<Option<ParamState>>,
}

impl StateStore {
    pub fn with_slots(num_slots: usize) -> Self {
        Self {
            slots: vec![None; num_slots],
        }
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn num_initialized(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn get(&self, slot: usize) -> Option<&ParamState> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn get_or_insert_with<F>(&mut self, slot: usize, f: F) -> &mut ParamState
    where
        F: FnOnce() -> ParamState,
    {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        self.slots[slot].get_or_insert_with(f)
    }

    pub(crate) fn insert(&mut self, slot: usize, state: ParamState) {
        if slot >= self.slots.len() {
            self.slots.resize(slot + 1, None);
        }
        self.slots[slot] = Some(state);
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ParamState)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, state)| state.as_ref().map(|s| (slot, s)))
    }

    pub fn memory_usage(&self) -> StateMemoryStats {
        let mut total_params = 0usize;
        let mut state_bytes = 0usize;
        let mut state_bytes_fp32 = 0usize;
        for (_, state) in self.iter() {
            total_params += state.numel();
            state_bytes += state.num_bytes();
            state_bytes_fp32 += state.numel() * 4 * state.num_buffers();
        }
        StateMemoryStats {
            total_params,
            state_bytes,
            state_bytes_fp32,
            memory_saved: if state_bytes_fp32 > 0 {
                1.0 - (state_bytes as f64 / state_bytes_fp32 as f64)
            } else {
                0.0
            },
        }
    }
}
