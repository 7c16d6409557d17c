use crate::clipping::PercentileClipper;
use crate::error::{OptimError, Result};
use crate::registry::OptimConfigRegistry;
use crate::rules::{rule_for, StepBuffers, UpdateRule};
use crate::serialize::StateSerializer;
use crate::state::{resolve_bits, scale_mode, ParamState, StateMemoryStats, StateStore};
use crate::tensor::{check_grad, ParamArena, ParamId, Tensor};
use ahash::{HashMap, HashMapExt};
use qstate_structs::config::{OptimizerConfig, OptimizerKind};
use qstate_structs::core::StateDict;
use tracing::{debug, info, warn};

/// Builds an optimizer of `kind` for `params` without per-parameter overrides.
pub fn create_optimizer(
    kind: OptimizerKind,
    params: &[ParamId],
    config: OptimizerConfig,
) -> Result<Optimizer> {
    Optimizer::new(kind, params, config)
}

/// Stateful optimizer over a fixed list of parameters.
///
/// State for a parameter is created on its first step with the bit-width
/// resolved from the configuration and the parameter size, and keeps that
/// bit-width for life.
#[derive(Clone)]
pub struct Optimizer {
    kind: OptimizerKind,
    rule: &'static dyn UpdateRule,
    config: OptimizerConfig,
    params: Vec<ParamId>,
    slots: HashMap<ParamId, usize>,
    param_configs: Vec<OptimizerConfig>,
    store: StateStore,
    clipper: Option<PercentileClipper>,
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, params: &[ParamId], config: OptimizerConfig) -> Result<Self> {
        Self::build(kind, params, config, None)
    }

    /// Like [`Optimizer::new`], with the overrides `registry` holds for
    /// registered parameters applied on top of `config`.
    pub fn with_registry(
        kind: OptimizerKind,
        params: &[ParamId],
        config: OptimizerConfig,
        registry: &OptimConfigRegistry,
    ) -> Result<Self> {
        Self::build(kind, params, config, Some(registry))
    }

    fn build(
        kind: OptimizerKind,
        params: &[ParamId],
        config: OptimizerConfig,
        registry: Option<&OptimConfigRegistry>,
    ) -> Result<Self> {
        config
            .validate(kind)
            .map_err(|e| OptimError::invalid_config(e.to_string()))?;

        let mut slots = HashMap::with_capacity(params.len());
        for (slot, param) in params.iter().enumerate() {
            if slots.insert(*param, slot).is_some() {
                return Err(OptimError::DuplicateParameter { param: *param });
            }
        }

        let param_configs = params
            .iter()
            .map(|param| {
                let resolved = match registry {
                    Some(registry) => registry.resolve(*param, &config),
                    None => config.clone(),
                };
                resolved
                    .validate(kind)
                    .map_err(|e| OptimError::InvalidOverride {
                        param: *param,
                        key: "config".to_string(),
                        reason: e.to_string(),
                    })?;
                Ok(resolved)
            })
            .collect::<Result<Vec<_>>>()?;

        let clipper = config
            .percentile_clipping
            .map(PercentileClipper::new)
            .transpose()?;

        info!(
            kind = %kind,
            num_params = params.len(),
            optim_bits = %config.optim_bits,
            block_wise = config.block_wise,
            percentile_clipping = ?config.percentile_clipping,
            "created optimizer"
        );

        Ok(Self {
            kind,
            rule: rule_for(kind),
            config,
            params: params.to_vec(),
            slots,
            param_configs,
            store: StateStore::with_slots(params.len()),
            clipper,
        })
    }

    pub fn kind(&self) -> OptimizerKind {
        self.kind
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn params(&self) -> &[ParamId] {
        &self.params
    }

    /// Effective configuration of `param` after registry overrides.
    pub fn param_config(&self, param: ParamId) -> Option<&OptimizerConfig> {
        self.slots.get(&param).map(|slot| &self.param_configs[*slot])
    }

    pub fn state(&self, param: ParamId) -> Option<&ParamState> {
        self.slots.get(&param).and_then(|slot| self.store.get(*slot))
    }

    pub fn clipper(&self) -> Option<&PercentileClipper> {
        self.clipper.as_ref()
    }

    pub fn memory_usage(&self) -> StateMemoryStats {
        self.store.memory_usage()
    }

    /// Applies one update to every managed parameter that has a gradient.
    ///
    /// Inputs are checked before anything is written: on error no parameter,
    /// state or clipper history has changed.
    pub fn step(&mut self, arena: &mut ParamArena) -> Result<()> {
        for (slot, id) in self.params.iter().enumerate() {
            let param = arena.get(*id)?;
            if let Some(grad) = &param.grad {
                check_grad(*id, &param.value, grad)?;
            }
            if let Some(state) = self.store.get(slot) {
                check_state(*id, state, &param.value)?;
            }
        }

        let gnorm_scale = match self.clipper.as_mut() {
            Some(clipper) => {
                let mut grads = Vec::with_capacity(self.params.len());
                for id in self.params.iter() {
                    if let Some(grad) = &arena.get(*id)?.grad {
                        grads.push(grad.as_slice());
                    }
                }
                clipper.observe(&grads).scale
            }
            None => 1.0,
        };

        let rule = self.rule;
        for (slot, id) in self.params.iter().enumerate() {
            let param = arena.get_mut(*id)?;
            let Some(grad) = param.grad.as_ref() else {
                continue;
            };
            if param.value.is_empty() {
                debug!(param = %id, "skipping zero-sized parameter");
                continue;
            }
            let config = &self.param_configs[slot];
            let value = &mut param.value;
            let state = self.store.get_or_insert_with(slot, || {
                let state = ParamState::new(rule, value, config);
                debug!(
                    param = %id,
                    numel = value.numel(),
                    optim_bits = %state.optim_bits(),
                    skip_zeros = state.skip_zeros(),
                    "initialized optimizer state"
                );
                state
            });
            apply_step(rule, config, state, value, grad.as_slice(), gnorm_scale);
        }
        Ok(())
    }

    pub fn state_dict(&self) -> StateDict {
        StateSerializer::dump(self.kind, &self.config, &self.store, self.clipper.as_ref())
    }

    /// Replaces all state with the contents of `dict`.
    ///
    /// Every record is checked against the live parameter in `arena` (shape,
    /// dtype, bit-width, skip_zeros and quantization layout) before anything is replaced;
    /// on error the current state is kept. Hyperparameters are taken from this
    /// optimizer, not from `dict`.
    pub fn load_state_dict(&mut self, dict: &StateDict, arena: &ParamArena) -> Result<()> {
        if dict.kind != self.kind {
            return Err(OptimError::invalid_state_dict(format!(
                "state dict is for {}, optimizer is {}",
                dict.kind, self.kind
            )));
        }
        let (store, clipper) = StateSerializer::load(dict, self.params.len())?;

        for (slot, state) in store.iter() {
            let id = self.params[slot];
            check_state(id, state, arena.value(id)?)?;
            let config = &self.param_configs[slot];
            let expected = resolve_bits(config, state.numel());
            if state.optim_bits() != expected {
                return Err(OptimError::BitWidthMismatch {
                    slot,
                    expected,
                    actual: state.optim_bits(),
                });
            }
            if state.skip_zeros() != config.skip_zeros {
                return Err(OptimError::invalid_state_dict(format!(
                    "slot {} was saved with skip_zeros = {}, optimizer uses {}",
                    slot,
                    state.skip_zeros(),
                    config.skip_zeros
                )));
            }
            if let Some(mode) = state.state1().scale_mode() {
                if mode != scale_mode(config) {
                    return Err(OptimError::invalid_state_dict(format!(
                        "slot {} is quantized with {:?}, optimizer uses {:?}",
                        slot,
                        mode,
                        scale_mode(config)
                    )));
                }
            }
        }

        let clipper = match (self.clipper.as_ref(), clipper) {
            (Some(current), Some(loaded)) => {
                if loaded.percentile() != current.percentile() {
                    return Err(OptimError::invalid_state_dict(format!(
                        "clipper percentile is {}, optimizer uses {}",
                        loaded.percentile(),
                        current.percentile()
                    )));
                }
                Some(loaded)
            }
            (Some(current), None) => {
                warn!("state dict has no clipper history; starting a fresh one");
                Some(PercentileClipper::new(current.percentile())?)
            }
            (None, Some(_)) => {
                warn!("state dict clipper history ignored; clipping is disabled");
                None
            }
            (None, None) => None,
        };

        if dict.config != self.config {
            debug!("state dict hyperparameters differ from the optimizer's; keeping the optimizer's");
        }
        info!(
            kind = %self.kind,
            num_states = store.num_initialized(),
            "loaded optimizer state"
        );
        self.store = store;
        self.clipper = clipper;
        Ok(())
    }
}

fn check_state(id: ParamId, state: &ParamState, value: &Tensor) -> Result<()> {
    if state.shape() != value.shape() {
        return Err(OptimError::ShapeMismatch {
            context: format!("state of parameter {}", id),
            expected: value.shape().to_vec(),
            actual: state.shape().to_vec(),
        });
    }
    if state.dtype() != value.dtype() {
        return Err(OptimError::DTypeMismatch {
            context: format!("state of parameter {}", id),
            expected: value.dtype(),
            actual: state.dtype(),
        });
    }
    Ok(())
}

fn apply_step(
    rule: &dyn UpdateRule,
    config: &OptimizerConfig,
    state: &mut ParamState,
    value: &mut Tensor,
    grad: &[f32],
    gnorm_scale: f32,
) {
    let scaled: Vec<f32>;
    let grad = if gnorm_scale == 1.0 {
        grad
    } else {
        scaled = grad.iter().map(|g| g * gnorm_scale).collect();
        &scaled
    };
    let frozen: Option<Vec<bool>> = state
        .skip_zeros
        .then(|| grad.iter().map(|g| *g == 0.0).collect());

    let mut state1 = state.state1.take_working();
    let mut state2 = state
        .state2
        .as_mut()
        .map(|s| s.take_working())
        .unwrap_or_default();
    state.step += 1;

    let outcome = rule.apply(
        config,
        StepBuffers {
            param: value.data_mut(),
            grad,
            state1: &mut state1,
            state2: &mut state2,
            step: state.step,
            skip_zeros: state.skip_zeros,
        },
    );
    value.round_to_dtype();

    state.state1.store_working(state1, frozen.as_deref());
    if let Some(state2_buffer) = state.state2.as_mut() {
        state2_buffer.store_working(state2, frozen.as_deref());
    }
    if outcome.unorm.is_some() {
        state.unorm_vec = outcome.unorm;
    }
}
