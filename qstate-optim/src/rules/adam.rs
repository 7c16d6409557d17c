use super::{StepBuffers, StepOutcome, UpdateRule};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

/// Adam with decoupled weight decay.
pub struct Adam;

impl UpdateRule for Adam {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Adam
    }

    fn signed_state(&self, index: usize) -> bool {
        index == 0
    }

    fn apply(&self, config: &OptimizerConfig, buffers: StepBuffers<'_>) -> StepOutcome {
        let StepBuffers {
            param,
            grad,
            state1,
            state2,
            step,
            skip_zeros,
        } = buffers;
        let (beta1, beta2) = config.betas;
        let t = step.min(i32::MAX as u64) as i32;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2_sqrt = (1.0 - beta2.powi(t)).sqrt();
        let step_size = config.lr / bias_correction1;
        let decay = 1.0 - config.lr * config.weight_decay;
        let eps = config.eps;

        Zip::from(ArrayViewMut1::from(param))
            .and(ArrayView1::from(grad))
            .and(ArrayViewMut1::from(state1))
            .and(ArrayViewMut1::from(state2))
            .for_each(|p, &g, m, v| {
                if skip_zeros && g == 0.0 {
                    return;
                }
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                if config.weight_decay > 0.0 {
                    *p *= decay;
                }
                let denom = v.sqrt() / bias_correction2_sqrt + eps;
                *p -= step_size * (*m / denom);
            });
        StepOutcome::default()
    }
}
