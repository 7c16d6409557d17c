use super::{l2_norm, trust_ratio, StepBuffers, StepOutcome, UpdateRule};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

/// Adam moments with a layer-wise trust ratio on the whole update,
/// weight decay included.
pub struct Lamb;

impl UpdateRule for Lamb {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Lamb
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
        let (eps, weight_decay) = (config.eps, config.weight_decay);

        let mut update = vec![0.0f32; param.len()];
        Zip::from(ArrayViewMut1::from(&mut update[..]))
            .and(ArrayView1::from(&*param))
            .and(ArrayView1::from(grad))
            .and(ArrayViewMut1::from(state1))
            .and(ArrayViewMut1::from(state2))
            .for_each(|u, &p, &g, m, v| {
                if skip_zeros && g == 0.0 {
                    return;
                }
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let denom = v.sqrt() / bias_correction2_sqrt + eps;
                *u = (*m / bias_correction1) / denom + weight_decay * p;
            });

        let pnorm = l2_norm(param);
        let unorm = l2_norm(&update);
        let alpha = config.lr * trust_ratio(config.max_unorm, pnorm, unorm);
        Zip::from(ArrayViewMut1::from(param))
            .and(ArrayView1::from(&update[..]))
            .for_each(|p, &u| *p -= alpha * u);
        StepOutcome { unorm: Some(unorm) }
    }
}
