mod common;

use common::{make_params, rng, set_random_grads, Reference};
use qstate_optim::{
    create_optimizer, DType, OptimBits, OptimError, Optimizer, OptimizerConfig, OptimizerKind,
    ParamArena, StateSerializer, Tensor,
};
use qstate_utils::assert_close;

fn tolerances(dtype: DType) -> (f32, f32) {
    match dtype {
        DType::F32 => (1e-6, 1e-5),
        DType::F16 => (1e-4, 1e-3),
    }
}

fn reload(optimizer: &Optimizer, arena: &ParamArena, config: &OptimizerConfig) -> Optimizer {
    let bytes = StateSerializer::to_bytes(&optimizer.state_dict()).unwrap();
    let dict = StateSerializer::from_bytes(&bytes).unwrap();
    let mut fresh = create_optimizer(optimizer.kind(), optimizer.params(), config.clone()).unwrap();
    fresh.load_state_dict(&dict, arena).unwrap();
    fresh
}

#[test]
fn test_optimizer32bit_matches_reference() {
    for kind in OptimizerKind::ALL {
        for dtype in [DType::F32, DType::F16] {
            let (atol, rtol) = tolerances(dtype);
            let config = OptimizerConfig::for_kind(kind).with_weight_decay(0.01);
            let shapes = vec![vec![32, 16], vec![7, 13]];
            let (mut arena, ids) = make_params(&shapes, dtype, 1);
            let mut references: Vec<Reference> = ids
                .iter()
                .map(|id| Reference::new(kind, config.clone(), arena.value(*id).unwrap().as_slice()))
                .collect();
            let mut optimizer = create_optimizer(kind, &ids, config.clone()).unwrap();
            let mut rng = rng(42);

            for step in 1..=50 {
                let grads = set_random_grads(&mut arena, &ids, &mut rng);
                optimizer.step(&mut arena).unwrap();
                for ((id, reference), grad) in ids.iter().zip(references.iter_mut()).zip(&grads) {
                    reference.step(grad);
                    let value = arena.value(*id).unwrap();
                    assert_close(value.as_slice(), &reference.param, atol, rtol)
                        .unwrap_or_else(|e| panic!("{} {} step {}: {}", kind, dtype, step, e));

                    let state = optimizer.state(*id).unwrap();
                    assert_eq!(state.step(), step);
                    assert_eq!(state.optim_bits(), OptimBits::ThirtyTwo);
                    assert_close(&state.state1().dequantized(), &reference.state1, atol, rtol)
                        .unwrap_or_else(|e| panic!("{} {} state1 step {}: {}", kind, dtype, step, e));
                    if let Some(state2) = state.state2() {
                        assert_close(&state2.dequantized(), &reference.state2, atol, rtol).unwrap();
                    }
                    if kind.uses_trust_ratio() {
                        assert!(state.unorm_vec().unwrap() > 0.0);
                    } else {
                        assert!(state.unorm_vec().is_none());
                    }

                    // half precision parameters drift from an f32 reference
                    reference.param = value.to_vec();
                }
                if step % 10 == 0 && step < 50 {
                    optimizer = reload(&optimizer, &arena, &config);
                }
            }
        }
    }
}

#[test]
fn test_adam_reload_matches_continuous_run() {
    let kind = OptimizerKind::Adam;
    let config = OptimizerConfig::for_kind(kind);
    let shapes = vec![vec![1024, 32]];
    let (mut arena_a, ids) = make_params(&shapes, DType::F32, 7);
    let (mut arena_b, _) = make_params(&shapes, DType::F32, 7);
    let mut continuous = create_optimizer(kind, &ids, config.clone()).unwrap();
    let mut reloaded = create_optimizer(kind, &ids, config.clone()).unwrap();
    let mut rng_a = rng(3);
    let mut rng_b = rng(3);

    for step in 1..=50 {
        set_random_grads(&mut arena_a, &ids, &mut rng_a);
        set_random_grads(&mut arena_b, &ids, &mut rng_b);
        continuous.step(&mut arena_a).unwrap();
        reloaded.step(&mut arena_b).unwrap();
        if [10, 20, 30, 40].contains(&step) {
            reloaded = reload(&reloaded, &arena_b, &config);
        }
        assert_eq!(
            arena_a.value(ids[0]).unwrap().as_slice(),
            arena_b.value(ids[0]).unwrap().as_slice()
        );
    }
    assert_eq!(continuous.state_dict(), reloaded.state_dict());
}

#[test]
fn test_skip_zeros_leaves_masked_elements() {
    for kind in OptimizerKind::ALL {
        let config = OptimizerConfig::for_kind(kind).with_skip_zeros(true);
        let (mut arena, ids) = make_params(&[vec![16, 16]], DType::F32, 11);
        let mut optimizer = create_optimizer(kind, &ids, config).unwrap();
        let mut rng = rng(5);

        // warm up so the accumulators are non-zero
        for _ in 0..3 {
            set_random_grads(&mut arena, &ids, &mut rng);
            optimizer.step(&mut arena).unwrap();
        }
        let before = arena.value(ids[0]).unwrap().to_vec();
        let state_before = optimizer.state(ids[0]).unwrap().clone();

        set_random_grads(&mut arena, &ids, &mut rng);
        let grad = &mut arena.get_mut(ids[0]).unwrap().grad;
        if let Some(grad) = grad.as_mut() {
            grad.map_inplace(|i, g| if i % 3 == 0 { 0.0 } else { g });
        }
        optimizer.step(&mut arena).unwrap();

        let after = arena.value(ids[0]).unwrap().as_slice();
        let state_after = optimizer.state(ids[0]).unwrap();
        let s1_before = state_before.state1().dequantized();
        let s1_after = state_after.state1().dequantized();
        let s2_before = state_before.state2().map(|s| s.dequantized());
        let s2_after = state_after.state2().map(|s| s.dequantized());
        assert_eq!(s2_after.is_some(), kind.num_states() == 2);
        let mut moved = 0;
        for i in 0..after.len() {
            if i % 3 == 0 {
                assert_eq!(after[i], before[i], "{} param {}", kind, i);
                assert_eq!(s1_after[i], s1_before[i], "{} state1 {}", kind, i);
                if let (Some(s2_before), Some(s2_after)) = (&s2_before, &s2_after) {
                    assert_eq!(s2_after[i], s2_before[i], "{} state2 {}", kind, i);
                }
            } else if after[i] != before[i] {
                moved += 1;
            }
        }
        assert!(moved > 0, "{} did not update unmasked elements", kind);
    }
}

#[test]
fn test_params_without_grad_or_elements_are_skipped() {
    let mut arena = ParamArena::new();
    let empty = arena.add(Tensor::zeros(vec![0, 4], DType::F32));
    let no_grad = arena.add(Tensor::randn(vec![8], DType::F32, 0.1, common::seed(1)));
    let live = arena.add(Tensor::randn(vec![8], DType::F32, 0.1, common::seed(2)));
    arena.set_grad(empty, Tensor::zeros(vec![0, 4], DType::F32)).unwrap();
    arena
        .set_grad(live, Tensor::new(vec![8], DType::F32, vec![0.5; 8]).unwrap())
        .unwrap();
    let before = arena.value(no_grad).unwrap().clone();

    let mut optimizer =
        create_optimizer(OptimizerKind::Adam, &[empty, no_grad, live], OptimizerConfig::for_kind(OptimizerKind::Adam))
            .unwrap();
    optimizer.step(&mut arena).unwrap();

    assert!(optimizer.state(empty).is_none());
    assert!(optimizer.state(no_grad).is_none());
    assert_eq!(optimizer.state(live).unwrap().step(), 1);
    assert_eq!(arena.value(no_grad).unwrap(), &before);

    let mut nothing = create_optimizer(OptimizerKind::Lamb, &[], OptimizerConfig::for_kind(OptimizerKind::Lamb)).unwrap();
    nothing.step(&mut arena).unwrap();
    assert_eq!(nothing.memory_usage().total_params, 0);
}

#[test]
fn test_failed_step_changes_nothing() {
    let (mut arena, ids) = make_params(&[vec![4, 4], vec![3]], DType::F32, 21);
    let config = OptimizerConfig::for_kind(OptimizerKind::Momentum).with_percentile_clipping(50);
    let mut optimizer = create_optimizer(OptimizerKind::Momentum, &ids, config).unwrap();
    let mut rng = rng(9);
    set_random_grads(&mut arena, &ids, &mut rng);
    optimizer.step(&mut arena).unwrap();

    let params_before: Vec<Tensor> = ids.iter().map(|id| arena.value(*id).unwrap().clone()).collect();
    let dict_before = optimizer.state_dict();

    set_random_grads(&mut arena, &ids, &mut rng);
    // bypass set_grad to plant a malformed gradient on the last parameter
    arena.get_mut(ids[1]).unwrap().grad = Some(Tensor::zeros(vec![4], DType::F32));
    let err = optimizer.step(&mut arena).unwrap_err();
    assert!(matches!(err, OptimError::ShapeMismatch { .. }));

    for (id, before) in ids.iter().zip(&params_before) {
        assert_eq!(arena.value(*id).unwrap(), before);
    }
    assert_eq!(optimizer.state_dict(), dict_before);
}

#[test]
fn test_construction_errors() {
    let (_, ids) = make_params(&[vec![2], vec![2]], DType::F32, 0);
    let duplicated = [ids[0], ids[1], ids[0]];
    assert_eq!(
        create_optimizer(OptimizerKind::Adam, &duplicated, OptimizerConfig::for_kind(OptimizerKind::Adam))
            .err(),
        Some(OptimError::DuplicateParameter { param: ids[0] })
    );
    let bad = OptimizerConfig::for_kind(OptimizerKind::Lars).with_betas((0.0, 0.0));
    assert!(matches!(
        create_optimizer(OptimizerKind::Lars, &ids, bad),
        Err(OptimError::InvalidConfig { .. })
    ));
}
