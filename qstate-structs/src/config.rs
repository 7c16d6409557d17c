use crate::serializable_struct_with_getters;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Momentum,
    Rmsprop,
    Lars,
    Lamb,
}

impl OptimizerKind {
    pub const ALL: [OptimizerKind; 5] = [
        OptimizerKind::Adam,
        OptimizerKind::Momentum,
        OptimizerKind::Rmsprop,
        OptimizerKind::Lars,
        OptimizerKind::Lamb,
    ];

    /// Number of accumulator buffers the family keeps per parameter.
    pub fn num_states(&self) -> usize {
        match self {
            OptimizerKind::Adam | OptimizerKind::Lamb => 2,
            OptimizerKind::Momentum | OptimizerKind::Rmsprop | OptimizerKind::Lars => 1,
        }
    }

    pub fn uses_trust_ratio(&self) -> bool {
        matches!(self, OptimizerKind::Lars | OptimizerKind::Lamb)
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptimizerKind::Adam => "adam",
            OptimizerKind::Momentum => "momentum",
            OptimizerKind::Rmsprop => "rmsprop",
            OptimizerKind::Lars => "lars",
            OptimizerKind::Lamb => "lamb",
        };
        write!(f, "{}", name)
    }
}

/// Storage width of optimizer accumulators. Serialized as the number `8` or
/// `32`; any other number is rejected during deserialization.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(try_from = "u32", into = "u32")]
pub enum OptimBits {
    Eight,
    #[default]
    ThirtyTwo,
}

impl TryFrom<u32> for OptimBits {
    type Error = String;

    fn try_from(bits: u32) -> Result<Self, Self::Error> {
        match bits {
            8 => Ok(OptimBits::Eight),
            32 => Ok(OptimBits::ThirtyTwo),
            _ => Err(format!("optim_bits must be 8 or 32, got {}", bits)),
        }
    }
}

impl From<OptimBits> for u32 {
    fn from(bits: OptimBits) -> u32 {
        match bits {
            OptimBits::Eight => 8,
            OptimBits::ThirtyTwo => 32,
        }
    }
}

impl fmt::Display for OptimBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-bit", u32::from(*self))
    }
}

pub const DEFAULT_BLOCK_SIZE: usize = 2048;
pub const DEFAULT_MIN_8BIT_SIZE: usize = 4096;

serializable_struct_with_getters! {
    #[serde(deny_unknown_fields)]
    OptimizerConfig {
        lr: f32,
        // (beta1, beta2) for Adam/LAMB. One-state families read the first
        // entry as momentum (Momentum, LARS) or smoothing constant (RMSprop).
        betas: (f32, f32),
        eps: f32,
        weight_decay: f32,
        optim_bits: OptimBits,
        percentile_clipping: Option<u32>,
        block_wise: bool,
        block_size: usize,
        skip_zeros: bool,
        min_8bit_size: usize,
        max_unorm: f32,
    }
}

impl OptimizerConfig {
    pub fn for_kind(kind: OptimizerKind) -> Self {
        let (lr, betas, max_unorm) = match kind {
            OptimizerKind::Adam => (1e-3, (0.9, 0.999), 0.0),
            OptimizerKind::Momentum => (1e-2, (0.9, 0.0), 0.0),
            OptimizerKind::Rmsprop => (1e-2, (0.99, 0.0), 0.0),
            OptimizerKind::Lars => (1e-2, (0.9, 0.0), 0.02),
            OptimizerKind::Lamb => (1e-3, (0.9, 0.999), 1.0),
        };
        Self {
            lr,
            betas,
            eps: 1e-8,
            weight_decay: 0.0,
            optim_bits: OptimBits::ThirtyTwo,
            percentile_clipping: None,
            block_wise: true,
            block_size: DEFAULT_BLOCK_SIZE,
            skip_zeros: false,
            min_8bit_size: DEFAULT_MIN_8BIT_SIZE,
            max_unorm,
        }
    }

    /// Returns a copy with the keys of `hyperparameters` replaced. Unknown keys
    /// and ill-typed values are errors.
    pub fn with_hyperparameters(
        &self,
        hyperparameters: &Option<Map<String, Value>>,
    ) -> anyhow::Result<Self> {
        match hyperparameters {
            Some(map) => qstate_utils::merge_obj(self, map),
            None => Ok(self.clone()),
        }
    }

    /// Rejects values no update rule of `kind` can run with.
    pub fn validate(&self, kind: OptimizerKind) -> anyhow::Result<()> {
        for (name, value) in [
            ("lr", self.lr),
            ("eps", self.eps),
            ("weight_decay", self.weight_decay),
            ("max_unorm", self.max_unorm),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(anyhow!("{} must be finite and >= 0, got {}", name, value));
            }
        }
        if self.eps == 0.0
            && matches!(
                kind,
                OptimizerKind::Adam | OptimizerKind::Rmsprop | OptimizerKind::Lamb
            )
        {
            return Err(anyhow!("eps must be > 0 for {}", kind));
        }
        let (beta1, beta2) = self.betas;
        if !(0.0..1.0).contains(&beta1) {
            return Err(anyhow!("betas.0 must be in [0, 1), got {}", beta1));
        }
        if kind.num_states() == 2 && !(0.0..1.0).contains(&beta2) {
            return Err(anyhow!("betas.1 must be in [0, 1), got {}", beta2));
        }
        if matches!(kind, OptimizerKind::Momentum | OptimizerKind::Lars) && beta1 == 0.0 {
            return Err(anyhow!("{} without momentum is not supported", kind));
        }
        if let Some(percentile) = self.percentile_clipping {
            if percentile == 0 || percentile >= 100 {
                return Err(anyhow!(
                    "percentile_clipping must be in (0, 100), got {}",
                    percentile
                ));
            }
        }
        if self.block_size == 0 {
            return Err(anyhow!("block_size must be > 0"));
        }
        Ok(())
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_betas(mut self, betas: (f32, f32)) -> Self {
        self.betas = betas;
        self
    }

    pub fn with_eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_optim_bits(mut self, optim_bits: OptimBits) -> Self {
        self.optim_bits = optim_bits;
        self
    }

    pub fn with_percentile_clipping(mut self, percentile: u32) -> Self {
        self.percentile_clipping = Some(percentile);
        self
    }

    pub fn with_block_wise(mut self, block_wise: bool) -> Self {
        self.block_wise = block_wise;
        self
    }

    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_skip_zeros(mut self, skip_zeros: bool) -> Self {
        self.skip_zeros = skip_zeros;
        self
    }

    pub fn with_min_8bit_size(mut self, min_8bit_size: usize) -> Self {
        self.min_8bit_size = min_8bit_size;
        self
    }

    pub fn with_max_unorm(mut self, max_unorm: f32) -> Self {
        self.max_unorm = max_unorm;
        self
    }
}

serializable_struct_with_getters! {
    #[serde(deny_unknown_fields)]
    ParamOverride {
        optim_bits: Option<OptimBits>,
        skip_zeros: Option<bool>,
        lr: Option<f32>,
        betas: Option<(f32, f32)>,
        eps: Option<f32>,
        weight_decay: Option<f32>,
        min_8bit_size: Option<usize>,
    }
}

impl ParamOverride {
    /// Effective configuration of one parameter: `base` with every field set
    /// in this override replaced.
    pub fn apply(&self, base: &OptimizerConfig) -> OptimizerConfig {
        let mut config = base.clone();
        if let Some(optim_bits) = self.optim_bits {
            config.optim_bits = optim_bits;
        }
        if let Some(skip_zeros) = self.skip_zeros {
            config.skip_zeros = skip_zeros;
        }
        if let Some(lr) = self.lr {
            config.lr = lr;
        }
        if let Some(betas) = self.betas {
            config.betas = betas;
        }
        if let Some(eps) = self.eps {
            config.eps = eps;
        }
        if let Some(weight_decay) = self.weight_decay {
            config.weight_decay = weight_decay;
        }
        if let Some(min_8bit_size) = self.min_8bit_size {
            config.min_8bit_size = min_8bit_size;
        }
        config
    }

    pub fn is_empty(&self) -> bool {
        *self == ParamOverride::default()
    }
}
