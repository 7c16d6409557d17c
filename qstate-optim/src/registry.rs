use crate::error::{OptimError, Result};
use crate::tensor::ParamId;
use ahash::{HashMap, HashMapExt, HashSet, HashSetExt};
use qstate_structs::config::{OptimizerConfig, ParamOverride};
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// Per-parameter hyperparameter overrides, consulted when an optimizer is
/// constructed.
///
/// Overrides are recorded first, then [`register_parameters`] freezes them for
/// the registered parameters. Overriding a registered parameter is rejected so
/// a built optimizer can never disagree with the registry it was built from.
///
/// [`register_parameters`]: OptimConfigRegistry::register_parameters
#[derive(Clone, Debug, Default)]
pub struct OptimConfigRegistry {
    overrides: HashMap<ParamId, ParamOverride>,
    registered: HashSet<ParamId>,
}

impl OptimConfigRegistry {
    pub fn new() -> Self {
        Self {
            overrides: HashMap::new(),
            registered: HashSet::new(),
        }
    }

    /// Clears all overrides and registrations.
    pub fn initialize(&mut self) {
        self.overrides.clear();
        self.registered.clear();
    }

    pub fn override_config(&mut self, param: ParamId, key: &str, value: impl Into<Value>) -> Result<()> {
        let mut map = Map::new();
        map.insert(key.to_string(), value.into());
        self.override_configs(param, map)
    }

    /// Merges several `key -> value` overrides for one parameter. Either all of
    /// them apply or none do.
    pub fn override_configs(&mut self, param: ParamId, overrides: Map<String, Value>) -> Result<()> {
        if self.registered.contains(&param) {
            return Err(OptimError::RegistryFrozen { param });
        }
        let existing = self.overrides.get(&param).cloned().unwrap_or_default();
        let keys = overrides.keys().cloned().collect::<Vec<_>>().join(",");
        let merged = qstate_utils::merge_obj(&existing, &overrides).map_err(|e| {
            OptimError::InvalidOverride {
                param,
                key: keys.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(param = %param, keys = %keys, "recorded config override");
        self.overrides.insert(param, merged);
        Ok(())
    }

    /// Marks `params` as belonging to an optimizer. Overrides recorded for
    /// parameters outside every registered set never take effect.
    pub fn register_parameters(&mut self, params: &[ParamId]) -> Result<()> {
        let mut seen = HashSet::new();
        for param in params {
            if self.registered.contains(param) || !seen.insert(*param) {
                return Err(OptimError::DuplicateParameter { param: *param });
            }
        }
        self.registered.extend(params.iter().copied());
        for param in self.overrides.keys() {
            if !self.registered.contains(param) {
                warn!(param = %param, "override recorded for unregistered parameter is ignored");
            }
        }
        Ok(())
    }

    pub fn is_registered(&self, param: ParamId) -> bool {
        self.registered.contains(&param)
    }

    /// Override in effect for `param`, if it is registered and has one.
    pub fn override_for(&self, param: ParamId) -> Option<&ParamOverride> {
        if !self.registered.contains(&param) {
            return None;
        }
        self.overrides.get(&param).filter(|o| !o.is_empty())
    }

    /// `base` with the override of `param` applied.
    pub fn resolve(&self, param: ParamId, base: &OptimizerConfig) -> OptimizerConfig {
        match self.override_for(param) {
            Some(o) => o.apply(base),
            None => base.clone(),
        }
    }
}
