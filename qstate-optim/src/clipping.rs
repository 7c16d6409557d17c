use crate::error::{OptimError, Result};
use ndarray::ArrayView1;
use qstate_structs::core::ClipperRecord;
use tracing::debug;

/// Number of past gradient norms the clipper remembers.
pub const GNORM_WINDOW: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipOutcome {
    pub current_norm: f32,
    pub clip_threshold: f32,
    pub scale: f32,
}

/// L2 norm of several slices taken together, accumulated in `f64`.
pub fn global_norm(grads: &[&[f32]]) -> f32 {
    grads
        .iter()
        .map(|g| {
            ArrayView1::from(*g).fold(0.0f64, |acc, v| acc + (*v as f64) * (*v as f64))
        })
        .sum::<f64>()
        .sqrt() as f32
}

/// Records `current_norm` in the ring buffer at `step % window` and returns the
/// scale that brings it down to the `percentile`-th norm seen in the last
/// `min(step, window)` steps. `step` counts from 1.
pub fn clip_from_norm(current_norm: f32, history: &mut [f32], step: u64, percentile: u32) -> ClipOutcome {
    let window = history.len();
    if window == 0 {
        return ClipOutcome {
            current_norm,
            clip_threshold: current_norm,
            scale: 1.0,
        };
    }
    let step = step.max(1);
    history[(step % window as u64) as usize] = current_norm;

    let n = (step as usize).min(window);
    let mut recent: Vec<f32> = (0..n as u64)
        .map(|k| history[((step - k) % window as u64) as usize])
        .collect();
    recent.sort_by(f32::total_cmp);
    let index = (percentile as usize * n / 100).min(n - 1);
    let clip_threshold = recent[index];

    let scale = if current_norm > clip_threshold && clip_threshold > 0.0 {
        clip_threshold / current_norm
    } else {
        1.0
    };
    ClipOutcome {
        current_norm,
        clip_threshold,
        scale,
    }
}

/// Single-tensor form: the norm is taken over `grad` alone.
pub fn percentile_clipping(grad: &[f32], history: &mut [f32], step: u64, percentile: u32) -> ClipOutcome {
    clip_from_norm(global_norm(&[grad]), history, step, percentile)
}

/// Adaptive gradient clipping state shared by all parameters of an optimizer.
#[derive(Clone, Debug, PartialEq)]
pub struct PercentileClipper {
    percentile: u32,
    step: u64,
    history: Vec<f32>,
}

impl PercentileClipper {
    pub fn new(percentile: u32) -> Result<Self> {
        if percentile == 0 || percentile >= 100 {
            return Err(OptimError::invalid_config(format!(
                "percentile_clipping must be in (0, 100), got {}",
                percentile
            )));
        }
        Ok(Self {
            percentile,
            step: 0,
            history: vec![0.0; GNORM_WINDOW],
        })
    }

    pub fn percentile(&self) -> u32 {
        self.percentile
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn history(&self) -> &[f32] {
        &self.history
    }

    /// Advances one optimizer step using the norm of all `grads` together.
    pub fn observe(&mut self, grads: &[&[f32]]) -> ClipOutcome {
        self.step += 1;
        let outcome = clip_from_norm(global_norm(grads), &mut self.history, self.step, self.percentile);
        debug!(
            step = self.step,
            norm = outcome.current_norm,
            threshold = outcome.clip_threshold,
            scale = outcome.scale,
            "percentile clipping"
        );
        outcome
    }

    pub fn to_record(&self) -> ClipperRecord {
        ClipperRecord {
            percentile: self.percentile,
            step: self.step,
            history: self.history.clone(),
        }
    }

    pub fn from_record(record: &ClipperRecord) -> Result<Self> {
        let mut clipper = Self::new(record.percentile)
            .map_err(|e| OptimError::invalid_state_dict(e.to_string()))?;
        if record.history.len() != GNORM_WINDOW {
            return Err(OptimError::invalid_state_dict(format!(
                "clipper history must hold {} norms, got {}",
                GNORM_WINDOW,
                record.history.len()
            )));
        }
        clipper.step = record.step;
        clipper.history = record.history.clone();
        Ok(clipper)
    }
}
