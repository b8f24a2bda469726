/// Criterion benchmarks for the meta-gradient estimators.
///
/// Measures one meta step per estimator across an inner-step sweep
/// (1, 3, 5) on a small per-task regression problem.
///
/// Run: cargo bench --bench meta_bench
/// Reports saved to: target/criterion/

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use metagrad_core::meta::MetaLearner;
use metagrad_core::tensor::SimpleRng;
use metagrad_core::{Backend, BufId, Container, Estimator, MetaConfig, MetaError, Result, Tape, Tensor};

const TASKS: usize = 4;
const POINTS: usize = 16;

fn make_problem(seed: u64) -> (Container<Tensor>, Container<Tensor>) {
    let mut rng = SimpleRng::new(seed);
    let mut x = vec![0.0f32; TASKS * POINTS];
    let mut y = vec![0.0f32; TASKS * POINTS];
    rng.fill_uniform(&mut x, 1.0);
    rng.fill_uniform(&mut y, 1.0);
    let batch = Container::from_leaves([
        ("x", Tensor::new(x, vec![TASKS, POINTS]).unwrap()),
        ("y", Tensor::new(y, vec![TASKS, POINTS]).unwrap()),
    ]).unwrap();
    let vars = Container::from_leaves([
        ("w", Tensor::full(&[TASKS], 0.3)),
        ("b", Tensor::full(&[TASKS], 0.0)),
    ]).unwrap();
    (batch, vars)
}

fn regression(tape: &mut Tape, batch: &Container<BufId>, vars: &Container<BufId>) -> Result<BufId> {
    let x = *batch.leaf("x")?;
    let y = *batch.leaf("y")?;
    let w = *vars.leaf("w")?;
    let b = *vars.leaf("b")?;
    let mut total = None;
    for t in 0..TASKS {
        let wt = tape.row(w, t)?;
        let wt = tape.broadcast(wt, &[POINTS])?;
        let bt = tape.row(b, t)?;
        let bt = tape.broadcast(bt, &[POINTS])?;
        let xt = tape.row(x, t)?;
        let yt = tape.row(y, t)?;
        let wx = tape.mul(wt, xt)?;
        let z = tape.add(wx, bt)?;
        let pred = tape.sigmoid(z)?;
        let err = tape.sub(pred, yt)?;
        let sq = tape.square(err)?;
        let c = tape.sum(sq)?;
        total = Some(match total {
            Some(acc) => tape.add(acc, c)?,
            None => c,
        });
    }
    total.ok_or(MetaError::EmptyContainer)
}

fn bench_estimators(c: &mut Criterion) {
    let (batch, vars) = make_problem(42);
    let mut group = c.benchmark_group("meta_step");
    for estimator in [Estimator::Fomaml, Estimator::Maml, Estimator::Reptile] {
        for steps in [1, 3, 5] {
            let cfg = MetaConfig { inner_grad_steps: steps, inner_learning_rate: 0.1, ..Default::default() };
            let mut learner = MetaLearner::new(Backend::HigherOrder, estimator, cfg).unwrap();
            group.bench_with_input(BenchmarkId::new(estimator.name(), steps), &steps, |b, _| {
                b.iter(|| learner.step(&batch, &regression, None, &vars).unwrap());
            });
        }
    }
    group.finish();
}

criterion_group!(benches, bench_estimators);
criterion_main!(benches);
