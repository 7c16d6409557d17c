use super::{StepBuffers, StepOutcome, UpdateRule};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

/// RMSprop without momentum. `betas.0` is the smoothing constant.
pub struct Rmsprop;

impl UpdateRule for Rmsprop {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Rmsprop
    }

    fn signed_state(&self, _index: usize) -> bool {
        false
    }

    fn apply(&self, config: &OptimizerConfig, buffers: StepBuffers<'_>) -> StepOutcome {
        let StepBuffers {
            param,
            grad,
            state1,
            skip_zeros,
            ..
        } = buffers;
        let alpha = config.betas.0;
        let (lr, eps, weight_decay) = (config.lr, config.eps, config.weight_decay);
        Zip::from(ArrayViewMut1::from(param))
            .and(ArrayView1::from(grad))
            .and(ArrayViewMut1::from(state1))
            .for_each(|p, &g, sq| {
                if skip_zeros && g == 0.0 {
                    return;
                }
                let g = if weight_decay > 0.0 { g + weight_decay * *p } else { g };
                *sq = alpha * *sq + (1.0 - alpha) * g * g;
                *p -= lr * (g / (sq.sqrt() + eps));
            });
        StepOutcome::default()
    }
}
