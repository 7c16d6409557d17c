#![allow(dead_code)]

use qstate_optim::{DType, OptimizerConfig, OptimizerKind, ParamArena, ParamId, Tensor};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

pub fn seed(n: u64) -> [u8; 32] {
    qstate_utils::u8s_from_str(&format!("qstate-test-{}", n))
}

pub fn randn(numel: usize, scale: f32, rng: &mut StdRng) -> Vec<f32> {
    (0..numel)
        .map(|_| rng.sample::<f32, _>(StandardNormal) * scale)
        .collect()
}

pub fn rng(n: u64) -> StdRng {
    StdRng::from_seed(seed(n))
}

/// Arena with one randomly initialised parameter per shape.
pub fn make_params(shapes: &[Vec<usize>], dtype: DType, n: u64) -> (ParamArena, Vec<ParamId>) {
    let mut arena = ParamArena::new();
    let ids = shapes
        .iter()
        .enumerate()
        .map(|(i, shape)| arena.add(Tensor::randn(shape.clone(), dtype, 0.1, seed(n + i as u64))))
        .collect();
    (arena, ids)
}

/// Sets a `randn * 0.01` gradient on every parameter and returns the values
/// actually stored (rounded to the parameter dtype).
pub fn set_random_grads(arena: &mut ParamArena, ids: &[ParamId], rng: &mut StdRng) -> Vec<Vec<f32>> {
    ids.iter()
        .map(|id| {
            let value = arena.value(*id).unwrap();
            let grad = Tensor::new(
                value.shape().to_vec(),
                value.dtype(),
                randn(value.numel(), 0.01, rng),
            )
            .unwrap();
            let stored = grad.to_vec();
            arena.set_grad(*id, grad).unwrap();
            stored
        })
        .collect()
}

fn norm(values: &[f32]) -> f32 {
    values
        .iter()
        .fold(0.0f64, |acc, v| acc + (*v as f64) * (*v as f64))
        .sqrt() as f32
}

fn trust_ratio(max_unorm: f32, pnorm: f32, unorm: f32) -> f32 {
    if max_unorm > 0.0 && unorm > max_unorm * pnorm {
        max_unorm * pnorm / unorm
    } else {
        1.0
    }
}

/// Plain loop f32 implementation of every family, used as ground truth.
pub struct Reference {
    pub kind: OptimizerKind,
    pub config: OptimizerConfig,
    pub param: Vec<f32>,
    pub state1: Vec<f32>,
    pub state2: Vec<f32>,
    pub step: u64,
    pub unorm: f32,
}

impl Reference {
    pub fn new(kind: OptimizerKind, config: OptimizerConfig, param: &[f32]) -> Self {
        Self {
            kind,
            config,
            param: param.to_vec(),
            state1: vec![0.0; param.len()],
            state2: vec![0.0; param.len()],
            step: 0,
            unorm: 0.0,
        }
    }

    pub fn step(&mut self, grad: &[f32]) {
        self.step += 1;
        match self.kind {
            OptimizerKind::Adam => self.adam(grad),
            OptimizerKind::Momentum => self.momentum(grad),
            OptimizerKind::Rmsprop => self.rmsprop(grad),
            OptimizerKind::Lars => self.lars(grad),
            OptimizerKind::Lamb => self.lamb(grad),
        }
    }

    fn adam(&mut self, grad: &[f32]) {
        let c = &self.config;
        let (b1, b2) = c.betas;
        let t = self.step as i32;
        let bc1 = 1.0 - b1.powi(t);
        let bc2_sqrt = (1.0 - b2.powi(t)).sqrt();
        let step_size = c.lr / bc1;
        for i in 0..grad.len() {
            let g = grad[i];
            if c.skip_zeros && g == 0.0 {
                continue;
            }
            self.state1[i] = b1 * self.state1[i] + (1.0 - b1) * g;
            self.state2[i] = b2 * self.state2[i] + (1.0 - b2) * g * g;
            if c.weight_decay > 0.0 {
                self.param[i] *= 1.0 - c.lr * c.weight_decay;
            }
            let denom = self.state2[i].sqrt() / bc2_sqrt + c.eps;
            self.param[i] -= step_size * (self.state1[i] / denom);
        }
    }

    fn momentum_buffer(&mut self, grad: &[f32]) {
        let c = &self.config;
        for i in 0..grad.len() {
            let mut g = grad[i];
            if c.skip_zeros && g == 0.0 {
                continue;
            }
            if c.weight_decay > 0.0 {
                g += c.weight_decay * self.param[i];
            }
            self.state1[i] = if self.step == 1 {
                g
            } else {
                c.betas.0 * self.state1[i] + g
            };
        }
    }

    fn momentum(&mut self, grad: &[f32]) {
        self.momentum_buffer(grad);
        for i in 0..grad.len() {
            if self.config.skip_zeros && grad[i] == 0.0 {
                continue;
            }
            self.param[i] -= self.config.lr * self.state1[i];
        }
    }

    fn rmsprop(&mut self, grad: &[f32]) {
        let c = &self.config;
        let alpha = c.betas.0;
        for i in 0..grad.len() {
            let mut g = grad[i];
            if c.skip_zeros && g == 0.0 {
                continue;
            }
            if c.weight_decay > 0.0 {
                g += c.weight_decay * self.param[i];
            }
            self.state1[i] = alpha * self.state1[i] + (1.0 - alpha) * g * g;
            self.param[i] -= c.lr * (g / (self.state1[i].sqrt() + c.eps));
        }
    }

    fn lars(&mut self, grad: &[f32]) {
        let pnorm = norm(&self.param);
        self.momentum_buffer(grad);
        let skip = self.config.skip_zeros;
        let applied: Vec<f32> = (0..grad.len())
            .map(|i| if skip && grad[i] == 0.0 { 0.0 } else { self.state1[i] })
            .collect();
        self.unorm = norm(&applied);
        let alpha = self.config.lr * trust_ratio(self.config.max_unorm, pnorm, self.unorm);
        for i in 0..grad.len() {
            if skip && grad[i] == 0.0 {
                continue;
            }
            self.param[i] -= alpha * self.state1[i];
        }
    }

    fn lamb(&mut self, grad: &[f32]) {
        let c = &self.config;
        let (b1, b2) = c.betas;
        let t = self.step as i32;
        let bc1 = 1.0 - b1.powi(t);
        let bc2_sqrt = (1.0 - b2.powi(t)).sqrt();
        let mut update = vec![0.0f32; grad.len()];
        for i in 0..grad.len() {
            let g = grad[i];
            if c.skip_zeros && g == 0.0 {
                continue;
            }
            self.state1[i] = b1 * self.state1[i] + (1.0 - b1) * g;
            self.state2[i] = b2 * self.state2[i] + (1.0 - b2) * g * g;
            let denom = self.state2[i].sqrt() / bc2_sqrt + c.eps;
            update[i] = (self.state1[i] / bc1) / denom + c.weight_decay * self.param[i];
        }
        let pnorm = norm(&self.param);
        self.unorm = norm(&update);
        let alpha = c.lr * trust_ratio(c.max_unorm, pnorm, self.unorm);
        for i in 0..grad.len() {
            self.param[i] -= alpha * update[i];
        }
    }
}
