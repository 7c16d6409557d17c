use crate::clipping::PercentileClipper;
use crate::codec::{Code, Quantized, ScaleMode};
use crate::error::{OptimError, Result};
use crate::state::{ParamState, StateStore, StateTensor};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};
use qstate_structs::core::{ParamStateRecord, StateBuffer, StateDict};

/// Converts between live optimizer state and [`StateDict`].
///
/// `load(dump(x))` reproduces `x` bit for bit: codes, maps, scales and full
/// precision buffers are copied verbatim and the byte encoding keeps floats
/// in binary form.
pub struct StateSerializer;

impl StateSerializer {
    pub fn dump(
        kind: OptimizerKind,
        config: &OptimizerConfig,
        store: &StateStore,
        clipper: Option<&PercentileClipper>,
    ) -> StateDict {
        StateDict {
            kind,
            config: config.clone(),
            state: store
                .iter()
                .map(|(slot, state)| (slot, record_from_state(state)))
                .collect(),
            clipper: clipper.map(PercentileClipper::to_record),
        }
    }

    /// Rebuilds the store and clipper held in `dict`. Only the structure of the
    /// records is checked here; matching them against live parameters is up to
    /// the caller.
    pub fn load(dict: &StateDict, num_slots: usize) -> Result<(StateStore, Option<PercentileClipper>)> {
        let mut store = StateStore::with_slots(num_slots);
        for (slot, record) in dict.state.iter() {
            if *slot >= num_slots {
                return Err(OptimError::invalid_state_dict(format!(
                    "slot {} is out of range for {} parameters",
                    slot, num_slots
                )));
            }
            let state = state_from_record(dict.kind, record).map_err(|e| match e {
                OptimError::InvalidStateDict { reason } => {
                    OptimError::invalid_state_dict(format!("slot {}: {}", slot, reason))
                }
                other => OptimError::invalid_state_dict(format!("slot {}: {}", slot, other)),
            })?;
            store.insert(*slot, state);
        }
        let clipper = dict
            .clipper
            .as_ref()
            .map(PercentileClipper::from_record)
            .transpose()?;
        Ok((store, clipper))
    }

    pub fn to_bytes(dict: &StateDict) -> Result<Vec<u8>> {
        qstate_utils::compress_obj(dict).map_err(|e| OptimError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<StateDict> {
        qstate_utils::decompress_obj(bytes).map_err(|e| OptimError::Serialization(e.to_string()))
    }

    /// Hex digest identifying the contents of `dict`.
    pub fn fingerprint(dict: &StateDict) -> Result<String> {
        qstate_utils::fingerprint(dict).map_err(|e| OptimError::Serialization(e.to_string()))
    }
}

struct SlotFields {
    buffer: StateBuffer,
    qmap: Option<Vec<f32>>,
    max: Option<f32>,
    absmax: Option<Vec<f32>>,
    block_size: Option<usize>,
}

fn slot_fields(tensor: &StateTensor) -> SlotFields {
    match tensor {
        StateTensor::Full(values) => SlotFields {
            buffer: StateBuffer::F32(values.clone()),
            qmap: None,
            max: None,
            absmax: None,
            block_size: None,
        },
        StateTensor::Quantized {
            quantized,
            code,
            mode,
        } => SlotFields {
            buffer: StateBuffer::U8(quantized.codes.clone()),
            qmap: Some(code.values().to_vec()),
            max: tensor.max(),
            absmax: tensor.absmax().map(<[f32]>::to_vec),
            block_size: mode.block_size(),
        },
    }
}

pub fn record_from_state(state: &ParamState) -> ParamStateRecord {
    let s1 = slot_fields(state.state1());
    let s2 = state.state2().map(slot_fields);
    ParamStateRecord {
        shape: state.shape().to_vec(),
        dtype: state.dtype(),
        step: state.step(),
        skip_zeros: state.skip_zeros(),
        block_size: s1.block_size,
        state1: s1.buffer,
        qmap1: s1.qmap,
        max1: s1.max,
        absmax1: s1.absmax,
        state2: s2.as_ref().map(|s| s.buffer.clone()),
        qmap2: s2.as_ref().and_then(|s| s.qmap.clone()),
        max2: s2.as_ref().and_then(|s| s.max),
        absmax2: s2.and_then(|s| s.absmax),
        unorm_vec: state.unorm_vec(),
    }
}

fn tensor_from_fields(
    name: &str,
    numel: usize,
    buffer: &StateBuffer,
    qmap: Option<&Vec<f32>>,
    max: Option<f32>,
    absmax: Option<&Vec<f32>>,
    block_size: Option<usize>,
) -> Result<StateTensor> {
    if buffer.len() != numel {
        return Err(OptimError::invalid_state_dict(format!(
            "{} holds {} values, parameter has {}",
            name,
            buffer.len(),
            numel
        )));
    }
    match buffer {
        StateBuffer::F32(values) => {
            if qmap.is_some() || max.is_some() || absmax.is_some() {
                return Err(OptimError::invalid_state_dict(format!(
                    "32-bit {} carries quantization metadata",
                    name
                )));
            }
            Ok(StateTensor::Full(values.clone()))
        }
        StateBuffer::U8(codes) => {
            let qmap = qmap.ok_or_else(|| {
                OptimError::invalid_state_dict(format!("8-bit {} has no qmap", name))
            })?;
            let code = Code::from_values(qmap.clone())?;
            let (mode, scales) = match (block_size, max, absmax) {
                (Some(0), _, _) => {
                    return Err(OptimError::invalid_state_dict("block_size must be > 0"));
                }
                (Some(block_size), None, Some(absmax)) => {
                    (ScaleMode::Blockwise { block_size }, absmax.clone())
                }
                (None, Some(max), None) => (ScaleMode::Global, vec![max]),
                _ => {
                    return Err(OptimError::invalid_state_dict(format!(
                        "8-bit {} needs either max (global) or absmax with block_size (blockwise)",
                        name
                    )));
                }
            };
            StateTensor::quantized(
                Quantized {
                    codes: codes.clone(),
                    scales,
                },
                code,
                mode,
            )
        }
    }
}

pub fn state_from_record(kind: OptimizerKind, record: &ParamStateRecord) -> Result<ParamState> {
    let numel = record.numel();
    let state1 = tensor_from_fields(
        "state1",
        numel,
        &record.state1,
        record.qmap1.as_ref(),
        record.max1,
        record.absmax1.as_ref(),
        record.block_size,
    )?;
    let state2 = match (&record.state2, kind.num_states()) {
        (Some(buffer), 2) => Some(tensor_from_fields(
            "state2",
            numel,
            buffer,
            record.qmap2.as_ref(),
            record.max2,
            record.absmax2.as_ref(),
            record.block_size,
        )?),
        (None, 1) => None,
        (_, expected) => {
            return Err(OptimError::invalid_state_dict(format!(
                "{} keeps {} state buffer(s), record has {}",
                kind,
                expected,
                1 + record.state2.is_some() as usize
            )));
        }
    };
    if let Some(state2) = &state2 {
        if state2.optim_bits() != state1.optim_bits() {
            return Err(OptimError::invalid_state_dict(
                "state1 and state2 have different bit-widths",
            ));
        }
    }
    let unorm_vec = if kind.uses_trust_ratio() {
        Some(record.unorm_vec.unwrap_or(0.0))
    } else {
        None
    };
    Ok(ParamState {
        step: record.step,
        shape: record.shape.clone(),
        dtype: record.dtype,
        skip_zeros: record.skip_zeros,
        state1,
        state2,
        unorm_vec,
    })
}
