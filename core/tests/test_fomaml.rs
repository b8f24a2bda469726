// First-order MAML against the closed-form oracles.
//
// Three variable partitions: unique (inner = latent, outer = weight),
// shared (inner = outer = latent) and overlapping (inner = latent, outer = all).


use meta_oracles::*;
use metagrad_core::meta::MetaLearner;
use metagrad_core::optimizer::{Momentum, MomentumConfig};
use metagrad_core::{fomaml_step, Backend, CostFn, Estimator, MetaConfig, ReturnInnerV, VarSelector};

#[test_log::test]
fn test_fomaml_unique_variables() {
    for case in sweep() {
        let cfg = case.config(VarSelector::keys(["latent"]), VarSelector::keys(["weight"]));
        let batch = task_batch(case.num_tasks);
        let vars = variables(case.num_tasks, 0.0, 1.0);
        let outer = case.with_outer_cost.then_some(&linear_outer_cost as &dyn CostFn);

        let result = fomaml_step(&batch, &linear_inner_cost, outer, &vars, &cfg);
        let Some(out) = skip_unsupported(result, &case) else { continue };

        assert_eq!(out.outer_grads.key_chains(), vec!["weight"], "[{case}]");
        assert_grad_rows(&out.outer_grads, "weight", unique_weight_grad(Order::First, &case, 0.0, 1.0), &case);
        assert_inner_v(&out, &case, |k, x| linear_latent(k, x, 0.0, 1.0));
    }
}

#[test_log::test]
fn test_fomaml_shared_variables() {
    for case in sweep() {
        let cfg = case.config(VarSelector::keys(["latent"]), VarSelector::keys(["latent"]));
        let batch = task_batch(case.num_tasks);
        let vars = variables(case.num_tasks, 1.0, 1.0);
        let outer = case.with_outer_cost.then_some(&quadratic_outer_cost as &dyn CostFn);

        let result = fomaml_step(&batch, &quadratic_inner_cost, outer, &vars, &cfg);
        let Some(out) = skip_unsupported(result, &case) else { continue };

        assert_eq!(out.outer_grads.key_chains(), vec!["latent"], "[{case}]");
        assert_grad_rows(&out.outer_grads, "latent", shared_latent_grad(Order::First, &case, 1.0), &case);
        assert_inner_v(&out, &case, |k, x| quadratic_latent(k, x, 1.0));
    }
}

#[test_log::test]
fn test_fomaml_overlapping_variables() {
    for case in sweep() {
        let cfg = case.config(VarSelector::keys(["latent"]), VarSelector::All);
        let batch = task_batch(case.num_tasks);
        let vars = variables(case.num_tasks, 0.0, 1.0);
        let outer = case.with_outer_cost.then_some(&linear_outer_cost as &dyn CostFn);

        let result = fomaml_step(&batch, &linear_inner_cost, outer, &vars, &cfg);
        let Some(out) = skip_unsupported(result, &case) else { continue };

        assert_eq!(out.outer_grads.key_chains(), vec!["latent", "weight"], "[{case}]");
        assert_grad_rows(&out.outer_grads, "latent", overlapping_latent_grad(&case), &case);
        assert_grad_rows(&out.outer_grads, "weight", unique_weight_grad(Order::First, &case, 0.0, 1.0), &case);
        assert_inner_v(&out, &case, |k, x| linear_latent(k, x, 0.0, 1.0));
    }
}

#[test]
fn test_fomaml_single_step_concrete() {
    // one task, latent = 0, weight = 1, one step, last snapshot, no outer cost:
    // weight gradient = -(lr·weight·x²) - x·latent = -0.01
    let cfg = MetaConfig {
        inner_grad_steps: 1,
        inner_learning_rate: LR,
        inner_v: VarSelector::keys(["latent"]),
        outer_v: VarSelector::keys(["weight"]),
        ..Default::default()
    };
    let mut learner = MetaLearner::new(Backend::HigherOrder, Estimator::Fomaml, cfg).unwrap();
    let out = learner.step(&task_batch(1), &linear_inner_cost, None, &variables(1, 0.0, 1.0)).unwrap();
    let g = out.outer_grads.leaf("weight").unwrap();
    assert!((g.data[0] + 0.01).abs() < 1e-6, "weight grad {:?}", g.data);
    assert!(out.inner_v.is_empty());
    // cost at the adapted latent: -x·latent·weight = -0.01
    assert!((out.cost + 0.01).abs() < 1e-6, "cost {}", out.cost);
}

#[test]
fn test_fomaml_leaves_variables_untouched() {
    let vars = variables(2, 0.0, 1.0);
    let before = vars.clone();
    let cfg = MetaConfig { inner_grad_steps: 3, inner_v: VarSelector::keys(["latent"]), ..Default::default() };
    let mut learner = MetaLearner::new(Backend::FirstOrder, Estimator::Fomaml, cfg).unwrap();
    learner.step(&task_batch(2), &linear_inner_cost, None, &vars).unwrap();
    assert_eq!(vars, before);
}

#[test]
fn test_fomaml_except_selector() {
    // Except(weight) as inner selection behaves like Keys(latent).
    let case = Case {
        inner_grad_steps: 2,
        with_outer_cost: false,
        average_across_steps: true,
        num_tasks: 2,
        return_inner_v: ReturnInnerV::All,
    };
    let cfg = case.config(VarSelector::except(["weight"]), VarSelector::except(["latent"]));
    let mut learner = MetaLearner::new(Backend::FirstOrder, Estimator::Fomaml, cfg).unwrap();
    let out = learner.step(&task_batch(2), &linear_inner_cost, None, &variables(2, 0.0, 1.0)).unwrap();
    assert_grad_rows(&out.outer_grads, "weight", unique_weight_grad(Order::First, &case, 0.0, 1.0), &case);
    assert_inner_v(&out, &case, |k, x| linear_latent(k, x, 0.0, 1.0));
}

#[test]
fn test_fomaml_with_momentum_inner_optimizer() {
    // Inner gradient on latent is the constant -x·w, so with momentum β:
    //   latent_1 = lr·x·w,  latent_2 = latent_1 + lr·(1 + β)·x·w
    // and the last-snapshot weight gradient is -x·latent_2.
    let beta = 0.5;
    let cfg = MetaConfig {
        inner_grad_steps: 2,
        inner_learning_rate: LR,
        inner_v: VarSelector::keys(["latent"]),
        outer_v: VarSelector::keys(["weight"]),
        return_inner_v: ReturnInnerV::All,
        ..Default::default()
    };
    let mut learner = MetaLearner::new(Backend::FirstOrder, Estimator::Fomaml, cfg)
        .unwrap()
        .with_optimizer(Box::new(Momentum::new(MomentumConfig { beta }).unwrap()));
    assert_eq!(learner.optimizer_name(), "momentum");

    let out = learner.step(&task_batch(1), &linear_inner_cost, None, &variables(1, 0.0, 1.0)).unwrap();
    let latent_2 = LR + LR * (1.0 + beta);
    let g = out.outer_grads.leaf("weight").unwrap();
    assert!((g.data[0] + latent_2).abs() < 1e-6, "weight grad {:?}", g.data);
    let snap = out.inner_v[2].leaf("latent").unwrap();
    assert!((snap.data[0] - latent_2).abs() < 1e-6);

    // Velocity is reset between calls.
    let again = learner.step(&task_batch(1), &linear_inner_cost, None, &variables(1, 0.0, 1.0)).unwrap();
    assert_eq!(again.outer_grads, out.outer_grads);
}
