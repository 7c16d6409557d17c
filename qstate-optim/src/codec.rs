//! 8-bit dynamic quantization of optimizer state.
//!
//! A value `x` in a block with scale `s` is stored as the index of the entry of
//! a 256-entry code closest to `x / s`, and decoded as `code[index] * s`. The
//! scale is the absolute maximum of the whole tensor ([`ScaleMode::Global`]) or
//! of each contiguous block ([`ScaleMode::Blockwise`]).

use crate::error::{OptimError, Result};
use once_cell::sync::Lazy;
use std::ops::Range;

pub const CODE_SIZE: usize = 256;

static SIGNED_DYNAMIC: Lazy<Code> = Lazy::new(|| Code(create_dynamic_map(true)));
static UNSIGNED_DYNAMIC: Lazy<Code> = Lazy::new(|| Code(create_dynamic_map(false)));

/// Builds the dynamic (exponent + linear fraction) map.
///
/// Seven decades `10^-6 .. 10^0` are each split into evenly spaced fractions of
/// `[0.1, 1]`; the midpoints of those intervals (mirrored to negative values in
/// the signed variant) plus `0` and `1` make up exactly 256 sorted entries.
pub fn create_dynamic_map(signed: bool) -> Vec<f32> {
    let mut data = Vec::with_capacity(CODE_SIZE);
    for i in 0..7i32 {
        let fraction_items: usize = if signed { (1 << i) + 1 } else { (1 << (i + 1)) + 1 };
        let magnitude = 10f64.powi(i - 6);
        let width = 0.9 / (fraction_items - 1) as f64;
        for k in 0..fraction_items - 1 {
            let lo = 0.1 + width * k as f64;
            let hi = 0.1 + width * (k + 1) as f64;
            let mean = (magnitude * (lo + hi) / 2.0) as f32;
            data.push(mean);
            if signed {
                data.push(-mean);
            }
        }
    }
    data.push(0.0);
    data.push(1.0);
    data.sort_by(f32::total_cmp);
    data
}

/// Sorted 256-entry quantization map containing `0.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct Code(Vec<f32>);

impl Code {
    /// Shared signed dynamic map, used for accumulators that can go negative.
    pub fn signed() -> &'static Code {
        &SIGNED_DYNAMIC
    }

    /// Shared unsigned dynamic map, used for non-negative accumulators.
    pub fn unsigned() -> &'static Code {
        &UNSIGNED_DYNAMIC
    }

    pub fn dynamic(signed: bool) -> &'static Code {
        if signed {
            Self::signed()
        } else {
            Self::unsigned()
        }
    }

    pub fn from_values(values: Vec<f32>) -> Result<Self> {
        if values.len() != CODE_SIZE {
            return Err(OptimError::InvalidQuantizedBuffer {
                reason: format!("code must have {} entries, got {}", CODE_SIZE, values.len()),
            });
        }
        if !values.windows(2).all(|w| w[0] < w[1]) {
            return Err(OptimError::InvalidQuantizedBuffer {
                reason: "code must be strictly increasing".to_string(),
            });
        }
        if !values.contains(&0.0) {
            return Err(OptimError::InvalidQuantizedBuffer {
                reason: "code must contain zero".to_string(),
            });
        }
        Ok(Self(values))
    }

    pub fn values(&self) -> &[f32] {
        &self.0
    }

    pub fn is_signed(&self) -> bool {
        self.0[0] < 0.0
    }

    pub fn zero_index(&self) -> u8 {
        self.0.iter().position(|c| *c == 0.0).unwrap_or(0) as u8
    }

    /// Index of the entry closest to `x`; ties go to the lower index.
    pub fn nearest(&self, x: f32) -> u8 {
        let code = &self.0;
        let i = code.partition_point(|c| *c < x);
        if i == 0 {
            return 0;
        }
        if i == code.len() {
            return (code.len() - 1) as u8;
        }
        if x - code[i - 1] <= code[i] - x {
            (i - 1) as u8
        } else {
            i as u8
        }
    }

    pub fn decode(&self, index: u8) -> f32 {
        self.0[index as usize]
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleMode {
    Global,
    Blockwise { block_size: usize },
}

impl ScaleMode {
    pub fn num_scales(&self, len: usize) -> usize {
        match self {
            ScaleMode::Global => 1,
            ScaleMode::Blockwise { block_size } => len.div_ceil((*block_size).max(1)),
        }
    }

    pub fn block_size(&self) -> Option<usize> {
        match self {
            ScaleMode::Global => None,
            ScaleMode::Blockwise { block_size } => Some(*block_size),
        }
    }

    /// Element ranges sharing one scale. `Global` always yields one range,
    /// even for an empty tensor.
    fn ranges(&self, len: usize) -> Vec<Range<usize>> {
        match self {
            ScaleMode::Global => vec![0..len],
            ScaleMode::Blockwise { block_size } => {
                let block_size = (*block_size).max(1);
                (0..len)
                    .step_by(block_size)
                    .map(|start| start..(start + block_size).min(len))
                    .collect()
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Quantized {
    pub codes: Vec<u8>,
    pub scales: Vec<f32>,
}

impl Quantized {
    /// Encoding of an all-zero tensor.
    pub fn zeros(len: usize, code: &Code, mode: ScaleMode) -> Self {
        Self {
            codes: vec![code.zero_index(); len],
            scales: vec![0.0; mode.num_scales(len)],
        }
    }
}

pub fn absmax(values: &[f32]) -> f32 {
    values.iter().fold(0.0f32, |m, v| m.max(v.abs()))
}

fn encode_block(values: &[f32], code: &Code, out: &mut Vec<u8>) -> f32 {
    let scale = absmax(values);
    if scale == 0.0 || !scale.is_finite() {
        out.extend(std::iter::repeat(code.zero_index()).take(values.len()));
    } else {
        out.extend(values.iter().map(|v| code.nearest(*v / scale)));
    }
    scale
}

pub fn quantize(values: &[f32], code: &Code, mode: ScaleMode) -> Quantized {
    let mut codes = Vec::with_capacity(values.len());
    let scales = mode
        .ranges(values.len())
        .into_iter()
        .map(|r| encode_block(&values[r], code, &mut codes))
        .collect();
    Quantized { codes, scales }
}

/// Requantizes `values`, leaving every block whose elements are all `frozen`
/// exactly as it was in `previous` (codes and scale).
pub fn requantize_frozen(
    values: &[f32],
    code: &Code,
    mode: ScaleMode,
    frozen: &[bool],
    previous: &Quantized,
) -> Quantized {
    let ranges = mode.ranges(values.len());
    if frozen.len() != values.len()
        || previous.codes.len() != values.len()
        || previous.scales.len() != ranges.len()
    {
        return quantize(values, code, mode);
    }
    let mut codes = Vec::with_capacity(values.len());
    let mut scales = Vec::with_capacity(ranges.len());
    for (b, r) in ranges.into_iter().enumerate() {
        if !r.is_empty() && frozen[r.clone()].iter().all(|f| *f) {
            codes.extend_from_slice(&previous.codes[r]);
            scales.push(previous.scales[b]);
        } else {
            scales.push(encode_block(&values[r], code, &mut codes));
        }
    }
    Quantized { codes, scales }
}

pub fn check_layout(len: usize, num_scales: usize, mode: ScaleMode) -> Result<()> {
    let expected = mode.num_scales(len);
    if num_scales != expected {
        return Err(OptimError::InvalidQuantizedBuffer {
            reason: format!(
                "{} elements need {} scale(s) in {:?} mode, got {}",
                len, expected, mode, num_scales
            ),
        });
    }
    Ok(())
}

pub fn dequantize(quantized: &Quantized, code: &Code, mode: ScaleMode) -> Result<Vec<f32>> {
    check_layout(quantized.codes.len(), quantized.scales.len(), mode)?;
    let mut out = vec![0.0; quantized.codes.len()];
    decode_into(quantized, code, mode, &mut out);
    Ok(out)
}

/// Decodes into `out`. The layout must already have been checked.
pub(crate) fn decode_into(quantized: &Quantized, code: &Code, mode: ScaleMode, out: &mut [f32]) {
    for (b, r) in mode.ranges(quantized.codes.len()).into_iter().enumerate() {
        let scale = quantized.scales.get(b).copied().unwrap_or(0.0);
        for i in r {
            out[i] = code.decode(quantized.codes[i]) * scale;
        }
    }
}

pub fn quantize_global(values: &[f32], code: &Code) -> (Vec<u8>, f32) {
    let q = quantize(values, code, ScaleMode::Global);
    (q.codes, q.scales[0])
}

pub fn dequantize_global(codes: &[u8], code: &Code, scale: f32) -> Vec<f32> {
    codes.iter().map(|c| code.decode(*c) * scale).collect()
}

pub fn quantize_blockwise(values: &[f32], code: &Code, block_size: usize) -> (Vec<u8>, Vec<f32>) {
    let q = quantize(values, code, ScaleMode::Blockwise { block_size });
    (q.codes, q.scales)
}

pub fn dequantize_blockwise(
    codes: &[u8],
    code: &Code,
    absmax: &[f32],
    block_size: usize,
) -> Result<Vec<f32>> {
    let quantized = Quantized {
        codes: codes.to_vec(),
        scales: absmax.to_vec(),
    };
    dequantize(&quantized, code, ScaleMode::Blockwise { block_size })
}
