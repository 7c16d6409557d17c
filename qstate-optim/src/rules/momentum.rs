use super::{StepBuffers, StepOutcome, UpdateRule};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

/// SGD with heavy-ball momentum. `betas.0` is the momentum.
pub struct Momentum;

impl UpdateRule for Momentum {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Momentum
    }

    fn signed_state(&self, _index: usize) -> bool {
        true
    }

    fn apply(&self, config: &OptimizerConfig, buffers: StepBuffers<'_>) -> StepOutcome {
        let StepBuffers {
            param,
            grad,
            state1,
            step,
            skip_zeros,
            ..
        } = buffers;
        momentum_buffer_update(config, param, grad, state1, step, skip_zeros);
        let lr = config.lr;
        Zip::from(ArrayViewMut1::from(param))
            .and(ArrayView1::from(grad))
            .and(ArrayView1::from(&*state1))
            .for_each(|p, &g, &buf| {
                if skip_zeros && g == 0.0 {
                    return;
                }
                *p -= lr * buf;
            });
        StepOutcome::default()
    }
}

/// `buf = g` on the first step, `buf = momentum * buf + g` afterwards, with
/// coupled weight decay folded into `g`. Shared with LARS.
pub(super) fn momentum_buffer_update(
    config: &OptimizerConfig,
    param: &[f32],
    grad: &[f32],
    state1: &mut [f32],
    step: u64,
    skip_zeros: bool,
) {
    let momentum = config.betas.0;
    let weight_decay = config.weight_decay;
    Zip::from(ArrayView1::from(param))
        .and(ArrayView1::from(grad))
        .and(ArrayViewMut1::from(state1))
        .for_each(|&p, &g, buf| {
            if skip_zeros && g == 0.0 {
                return;
            }
            let g = if weight_decay > 0.0 { g + weight_decay * p } else { g };
            *buf = if step == 1 { g } else { momentum * *buf + g };
        });
}
