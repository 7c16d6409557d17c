use super::momentum::momentum_buffer_update;
use super::{l2_norm, trust_ratio, StepBuffers, StepOutcome, UpdateRule};
use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};

/// Momentum SGD scaled by a layer-wise trust ratio.
pub struct Lars;

impl UpdateRule for Lars {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Lars
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
        let pnorm = l2_norm(param);
        momentum_buffer_update(config, param, grad, state1, step, skip_zeros);

        let unorm = if skip_zeros {
            let applied: Vec<f32> = state1
                .iter()
                .zip(grad)
                .map(|(u, g)| if *g == 0.0 { 0.0 } else { *u })
                .collect();
            l2_norm(&applied)
        } else {
            l2_norm(state1)
        };
        let alpha = config.lr * trust_ratio(config.max_unorm, pnorm, unorm);

        Zip::from(ArrayViewMut1::from(param))
            .and(ArrayView1::from(grad))
            .and(ArrayView1::from(&*state1))
            .for_each(|p, &g, &u| {
                if skip_zeros && g == 0.0 {
                    return;
                }
                *p -= alpha * u;
            });
        StepOutcome { unorm: Some(unorm) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_trust_ratio_bounds_update() {
        let config = OptimizerConfig::for_kind(OptimizerKind::Lars).with_lr(1.0);
        let mut param = [3.0f32, 4.0];
        let mut buf = [0.0f32; 2];
        let outcome = Lars.apply(
            &config,
            StepBuffers {
                param: &mut param,
                grad: &[0.0, 10.0],
                state1: &mut buf,
                state2: &mut [],
                step: 1,
                skip_zeros: false,
            },
        );
        assert_eq!(outcome.unorm, Some(10.0));
        // ratio = 0.02 * 5 / 10 = 0.01, so the step is 0.1
        assert_eq!(param[0], 3.0);
        assert_relative_eq!(param[1], 3.9, max_relative = 1e-6);
    }
}
