use qstate_structs::config::{OptimBits, OptimizerConfig, OptimizerKind, ParamOverride};
use serde_json::{json, Map, Value};

fn map(value: Value) -> Option<Map<String, Value>> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}

#[test]
fn test_kind_defaults() {
    let adam = OptimizerConfig::for_kind(OptimizerKind::Adam);
    assert_eq!(adam.betas, (0.9, 0.999));
    assert_eq!(adam.optim_bits, OptimBits::ThirtyTwo);
    assert_eq!(adam.block_size, 2048);
    assert_eq!(adam.min_8bit_size, 4096);
    assert!(adam.percentile_clipping().is_none());
    assert_eq!(OptimizerConfig::for_kind(OptimizerKind::Lars).max_unorm, 0.02);
    assert_eq!(OptimizerConfig::for_kind(OptimizerKind::Lamb).max_unorm, 1.0);
}

#[test]
fn test_with_hyperparameters() {
    let base = OptimizerConfig::for_kind(OptimizerKind::Adam);
    assert_eq!(base.with_hyperparameters(&None).unwrap(), base);

    let config = base
        .with_hyperparameters(&map(json!({
            "lr": 0.5,
            "optim_bits": 8,
            "percentile_clipping": 5,
            "betas": [0.8, 0.99]
        })))
        .unwrap();
    assert_eq!(config.lr, 0.5);
    assert_eq!(config.optim_bits, OptimBits::Eight);
    assert_eq!(config.percentile_clipping, Some(5));
    assert_eq!(config.betas, (0.8, 0.99));
    assert_eq!(config.eps, base.eps);

    assert!(base
        .with_hyperparameters(&map(json!({"learning_rate": 0.5})))
        .is_err());
    assert!(base
        .with_hyperparameters(&map(json!({"optim_bits": 4})))
        .is_err());
}

#[test]
fn test_param_override_apply() {
    let base = OptimizerConfig::for_kind(OptimizerKind::Adam);
    let empty = ParamOverride::default();
    assert!(empty.is_empty());
    assert_eq!(empty.apply(&base), base);

    let ov: ParamOverride =
        serde_json::from_value(json!({"optim_bits": 8, "skip_zeros": true})).unwrap();
    assert!(!ov.is_empty());
    assert_eq!(ov.optim_bits(), Some(&OptimBits::Eight));
    let applied = ov.apply(&base);
    assert_eq!(applied.optim_bits, OptimBits::Eight);
    assert!(applied.skip_zeros);
    assert_eq!(applied.lr, base.lr);

    assert!(serde_json::from_value::<ParamOverride>(json!({"block_size": 16})).is_err());
}

#[test]
fn test_builder() {
    let config = OptimizerConfig::for_kind(OptimizerKind::Momentum)
        .with_lr(0.1)
        .with_optim_bits(OptimBits::Eight)
        .with_block_wise(false)
        .with_skip_zeros(true);
    assert_eq!(config.lr, 0.1);
    assert_eq!(config.optim_bits, OptimBits::Eight);
    assert!(!config.block_wise);
    assert!(config.skip_zeros);
}

#[test]
fn test_validate() {
    for kind in OptimizerKind::ALL {
        assert!(OptimizerConfig::for_kind(kind).validate(kind).is_ok());
    }
    let adam = OptimizerConfig::for_kind(OptimizerKind::Adam);
    assert!(adam.clone().with_lr(-1.0).validate(OptimizerKind::Adam).is_err());
    assert!(adam.clone().with_eps(f32::NAN).validate(OptimizerKind::Adam).is_err());
    assert!(adam
        .clone()
        .with_betas((0.9, 1.0))
        .validate(OptimizerKind::Adam)
        .is_err());
    assert!(adam
        .clone()
        .with_percentile_clipping(100)
        .validate(OptimizerKind::Adam)
        .is_err());
    assert!(adam.clone().with_block_size(0).validate(OptimizerKind::Adam).is_err());

    let momentum = OptimizerConfig::for_kind(OptimizerKind::Momentum).with_betas((0.0, 0.0));
    assert!(momentum.validate(OptimizerKind::Momentum).is_err());
    assert!(momentum.validate(OptimizerKind::Rmsprop).is_ok());

    // families dividing by sqrt(state) + eps need eps > 0
    for kind in [OptimizerKind::Adam, OptimizerKind::Rmsprop, OptimizerKind::Lamb] {
        let config = OptimizerConfig::for_kind(kind).with_eps(0.0);
        assert!(config.validate(kind).is_err());
    }
    for kind in [OptimizerKind::Momentum, OptimizerKind::Lars] {
        let config = OptimizerConfig::for_kind(kind).with_eps(0.0);
        assert!(config.validate(kind).is_ok());
    }
}
