/// Meta-gradient step estimators: FOMAML, second-order MAML and Reptile.
///
/// All three share one shape of computation. Per task row, an inner loop
/// simulates `inner_grad_steps` updates of the inner variables against the
/// inner cost, producing a trajectory of `inner_grad_steps + 1` snapshots.
/// The outer gradient is then read off that trajectory:
///
///   - FOMAML: gradient of the outer cost at detached snapshots.
///   - MAML:   gradient of the outer objective through the whole trajectory,
///             back to the original variables (second order).
///   - Reptile: inner gradients along the trajectory, averaged, over lr.
///
/// Costs are sums of per-task terms, so row t of every gradient belongs to
/// task t. Outer gradients are averaged over task rows and broadcast back,
/// keeping each variable's shape.

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::config::{MetaConfig, ReturnInnerV};
use crate::container::{Container, VarSelector};
use crate::dispatch::Backend;
use crate::error::{MetaError, Result};
use crate::optimizer::{self, GradientDescent, InnerOptimizer};
use crate::tape::{with_tape, BufId, Tape};
use crate::tensor::Tensor;

// ── Cost functions ───────────────────────────────────────────────────

/// A scalar cost of (batch, variables), recorded on the tape.
pub trait CostFn {
    fn cost(&self, tape: &mut Tape, batch: &Container<BufId>, vars: &Container<BufId>) -> Result<BufId>;
}

impl<F> CostFn for F
where
    F: Fn(&mut Tape, &Container<BufId>, &Container<BufId>) -> Result<BufId>,
{
    fn cost(&self, tape: &mut Tape, batch: &Container<BufId>, vars: &Container<BufId>) -> Result<BufId> {
        self(tape, batch, vars)
    }
}

/// Maps the task batch to the batch one of the two costs sees.
pub type BatchFn = Box<dyn Fn(&Container<Tensor>) -> Result<Container<Tensor>>>;

/// Result of one meta step.
#[derive(Clone, Debug, PartialEq)]
pub struct MetaStepOutput {
    /// Inner cost at the final snapshot, averaged over tasks.
    pub cost: f32,
    /// One entry per outer variable, same shape as the variable.
    pub outer_grads: Container<Tensor>,
    /// Inner-variable snapshots, as requested by `return_inner_v`.
    pub inner_v: Vec<Container<Tensor>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Estimator {
    Fomaml,
    Maml,
    Reptile,
}

impl Estimator {
    pub fn name(self) -> &'static str {
        match self {
            Estimator::Fomaml => "fomaml",
            Estimator::Maml => "maml",
            Estimator::Reptile => "reptile",
        }
    }
}

// ── Free-function entry points ───────────────────────────────────────

/// First-order MAML on the backend named by `METAGRAD_BACKEND`.
///
/// `outer_cost` defaults to `inner_cost`.
pub fn fomaml_step(
    batch: &Container<Tensor>,
    inner_cost: &dyn CostFn,
    outer_cost: Option<&dyn CostFn>,
    variables: &Container<Tensor>,
    cfg: &MetaConfig,
) -> Result<MetaStepOutput> {
    MetaLearner::new(Backend::from_env()?, Estimator::Fomaml, cfg.clone())?
        .step(batch, inner_cost, outer_cost, variables)
}

/// Second-order MAML on the backend named by `METAGRAD_BACKEND`.
pub fn maml_step(
    batch: &Container<Tensor>,
    inner_cost: &dyn CostFn,
    outer_cost: Option<&dyn CostFn>,
    variables: &Container<Tensor>,
    cfg: &MetaConfig,
) -> Result<MetaStepOutput> {
    MetaLearner::new(Backend::from_env()?, Estimator::Maml, cfg.clone())?
        .step(batch, inner_cost, outer_cost, variables)
}

/// Reptile on the backend named by `METAGRAD_BACKEND`.
pub fn reptile_step(
    batch: &Container<Tensor>,
    cost: &dyn CostFn,
    variables: &Container<Tensor>,
    cfg: &MetaConfig,
) -> Result<MetaStepOutput> {
    MetaLearner::new(Backend::from_env()?, Estimator::Reptile, cfg.clone())?
        .step(batch, cost, None, variables)
}

// ── MetaLearner ──────────────────────────────────────────────────────

/// An estimator bound to a backend, inner optimizer and configuration.
pub struct MetaLearner {
    pub backend: Backend,
    pub estimator: Estimator,
    pub config: MetaConfig,
    optimizer: Box<dyn InnerOptimizer>,
    inner_batch_fn: Option<BatchFn>,
    outer_batch_fn: Option<BatchFn>,
}

impl MetaLearner {
    pub fn new(backend: Backend, estimator: Estimator, config: MetaConfig) -> Result<Self> {
        config.validate()?;
        Ok(MetaLearner {
            backend,
            estimator,
            config,
            optimizer: Box::new(GradientDescent),
            inner_batch_fn: None,
            outer_batch_fn: None,
        })
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn InnerOptimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Batch seen by the inner cost (e.g. the support split).
    pub fn with_inner_batch_fn(
        mut self,
        f: impl Fn(&Container<Tensor>) -> Result<Container<Tensor>> + 'static,
    ) -> Self {
        self.inner_batch_fn = Some(Box::new(f));
        self
    }

    /// Batch seen by the outer cost (e.g. the query split).
    pub fn with_outer_batch_fn(
        mut self,
        f: impl Fn(&Container<Tensor>) -> Result<Container<Tensor>> + 'static,
    ) -> Self {
        self.outer_batch_fn = Some(Box::new(f));
        self
    }

    pub fn optimizer_name(&self) -> &'static str {
        self.optimizer.name()
    }

    /// Run one meta step. Reptile ignores `outer_cost`.
    pub fn step(
        &mut self,
        batch: &Container<Tensor>,
        inner_cost: &dyn CostFn,
        outer_cost: Option<&dyn CostFn>,
        variables: &Container<Tensor>,
    ) -> Result<MetaStepOutput> {
        let inner_batch = apply_batch_fn(&self.inner_batch_fn, batch)?;
        let outer_batch = apply_batch_fn(&self.outer_batch_fn, batch)?;
        let num_tasks = num_tasks(variables, &[&inner_batch, &outer_batch])?;

        let step = StepInputs {
            inner_batch: &inner_batch,
            outer_batch: &outer_batch,
            inner_cost,
            outer_cost: outer_cost.unwrap_or(inner_cost),
            variables,
            cfg: &self.config,
            num_tasks,
        };
        let estimator = self.estimator;
        let opt = self.optimizer.as_mut();
        opt.reset();

        let out = with_tape(self.backend, |tape| match estimator {
            Estimator::Fomaml => fomaml(tape, opt, &step),
            Estimator::Maml => maml(tape, opt, &step),
            Estimator::Reptile => reptile(tape, opt, &step),
        })?;

        debug!(
            "{}: backend={} tasks={} steps={} avg={} cost={:.6}",
            estimator.name(), self.backend, num_tasks, self.config.inner_grad_steps,
            self.config.average_across_steps, out.cost,
        );
        Ok(out)
    }

    /// One meta-training step: estimate outer gradients, then take an outer
    /// gradient-descent step with `outer_learning_rate`.
    pub fn train_step(
        &mut self,
        batch: &Container<Tensor>,
        inner_cost: &dyn CostFn,
        outer_cost: Option<&dyn CostFn>,
        variables: &Container<Tensor>,
    ) -> Result<(Container<Tensor>, MetaStepOutput)> {
        let out = self.step(batch, inner_cost, outer_cost, variables)?;
        let updated = optimizer::gradient_descent_update(
            variables, &out.outer_grads, self.config.outer_learning_rate,
        )?;
        Ok((updated, out))
    }

    /// Value of the outer objective MAML differentiates: the outer cost at
    /// the final snapshot, or its mean over all snapshots when averaging.
    /// Needs only first-order gradients.
    pub fn outer_objective(
        &mut self,
        batch: &Container<Tensor>,
        inner_cost: &dyn CostFn,
        outer_cost: Option<&dyn CostFn>,
        variables: &Container<Tensor>,
    ) -> Result<f32> {
        let inner_batch = apply_batch_fn(&self.inner_batch_fn, batch)?;
        let outer_batch = apply_batch_fn(&self.outer_batch_fn, batch)?;
        let num_tasks = num_tasks(variables, &[&inner_batch, &outer_batch])?;
        let step = StepInputs {
            inner_batch: &inner_batch,
            outer_batch: &outer_batch,
            inner_cost,
            outer_cost: outer_cost.unwrap_or(inner_cost),
            variables,
            cfg: &self.config,
            num_tasks,
        };
        let opt = self.optimizer.as_mut();
        opt.reset();
        with_tape(self.backend, |tape| {
            let (traj, _) = trajectory(tape, opt, &step, false, "objective")?;
            let batch = load(tape, step.outer_batch, false);
            let mut total = 0.0;
            let picked = contributing(&traj, step.cfg.average_across_steps);
            for snap in picked {
                let c = eval_cost(step.outer_cost, tape, &batch, snap)?;
                total += tape.value(c)?;
            }
            Ok(total / picked.len() as f32)
        })
    }
}

fn apply_batch_fn(f: &Option<BatchFn>, batch: &Container<Tensor>) -> Result<Container<Tensor>> {
    match f {
        Some(f) => f(batch),
        None => Ok(batch.clone()),
    }
}

/// Every variable and batch leaf must carry the same number of task rows.
fn num_tasks(variables: &Container<Tensor>, batches: &[&Container<Tensor>]) -> Result<usize> {
    let vars = variables.leaves();
    let (_, first) = vars.first().ok_or(MetaError::EmptyContainer)?;
    let expected = first.num_rows().unwrap_or(0);
    let batch_leaves: Vec<(String, &Tensor)> = batches.iter().flat_map(|b| b.leaves()).collect();
    for (key, t) in vars.iter().chain(batch_leaves.iter()) {
        t.validate()?;
        let found = t.num_rows().unwrap_or(0);
        if found != expected || found == 0 {
            return Err(MetaError::TaskCount { key: key.clone(), expected: expected.max(1), found });
        }
    }
    Ok(expected)
}

// ── Shared machinery ─────────────────────────────────────────────────

struct StepInputs<'a> {
    inner_batch: &'a Container<Tensor>,
    outer_batch: &'a Container<Tensor>,
    inner_cost: &'a dyn CostFn,
    outer_cost: &'a dyn CostFn,
    variables: &'a Container<Tensor>,
    cfg: &'a MetaConfig,
    num_tasks: usize,
}

fn load(tape: &mut Tape, c: &Container<Tensor>, param: bool) -> Container<BufId> {
    c.map(|_, t| if param { tape.register_param(t) } else { tape.constant(t) })
}

fn to_host(tape: &Tape, c: &Container<BufId>) -> Container<Tensor> {
    c.map(|_, &id| tape.to_tensor(id))
}

fn eval_cost(
    cost: &dyn CostFn,
    tape: &mut Tape,
    batch: &Container<BufId>,
    vars: &Container<BufId>,
) -> Result<BufId> {
    let id = cost.cost(tape, batch, vars)?;
    if tape.buf_numel(id) != 1 {
        return Err(MetaError::NotScalar(tape.buf_shape(id).to_vec()));
    }
    Ok(id)
}

/// Gradients of `cost` w.r.t. every leaf of `wrt`, keyed the same way.
fn grads_wrt(
    tape: &mut Tape,
    cost: BufId,
    wrt: &Container<BufId>,
    create_graph: bool,
) -> Result<Container<BufId>> {
    let leaves = wrt.leaves();
    let ids: Vec<BufId> = leaves.iter().map(|(_, id)| **id).collect();
    let grads = tape.grad(cost, &ids, create_graph)?;
    Container::from_leaves(leaves.into_iter().map(|(k, _)| k).zip(grads))
}

fn add_host(acc: Option<Container<Tensor>>, g: Container<Tensor>) -> Result<Container<Tensor>> {
    match acc {
        None => Ok(g),
        Some(acc) => acc.zip_with(&g, |_, a, b| a.zip_map(b, |x, y| x + y)),
    }
}

/// Scale by `1 / count`, then average over task rows keeping the shape.
fn finish_grads(sum: Container<Tensor>, count: usize, extra_scale: f32) -> Result<Container<Tensor>> {
    let s = extra_scale / count as f32;
    sum.try_map(|_, g| g.scaled(s).mean_rows_broadcast())
}

/// Snapshots that contribute to the outer gradient.
fn contributing(traj: &[Container<BufId>], average: bool) -> &[Container<BufId>] {
    if average {
        traj
    } else {
        &traj[traj.len() - 1..]
    }
}

/// Run the inner loop from the original variables.
///
/// With `create_graph` every update stays connected to the originals;
/// otherwise each new snapshot is a fresh leaf. Returns the trajectory
/// (`inner_grad_steps + 1` snapshots of all variables) and the inner
/// gradients taken at each pre-update snapshot.
fn trajectory(
    tape: &mut Tape,
    opt: &mut dyn InnerOptimizer,
    step: &StepInputs<'_>,
    create_graph: bool,
    label: &str,
) -> Result<(Vec<Container<BufId>>, Vec<Container<BufId>>)> {
    let cfg = step.cfg;
    let batch = load(tape, step.inner_batch, false);
    let mut traj = vec![load(tape, step.variables, true)];
    let mut inner_grads = Vec::with_capacity(cfg.inner_grad_steps);

    for k in 0..cfg.inner_grad_steps {
        let current = &traj[k];
        let cost = eval_cost(step.inner_cost, tape, &batch, current)?;
        let inner = current.select(&cfg.inner_v)?;
        let grads = grads_wrt(tape, cost, &inner, create_graph)?;
        let updated = opt.step(tape, &inner, &grads, cfg.inner_learning_rate)?;
        let updated = if create_graph {
            updated
        } else {
            updated.map(|_, &id| tape.detach(id))
        };
        trace!(
            "{label}: inner step {}/{} cost={:.6}",
            k + 1, cfg.inner_grad_steps, tape.value(cost)? / step.num_tasks as f32,
        );
        let next = current.merge(&updated)?;
        traj.push(next);
        inner_grads.push(grads);
    }
    Ok((traj, inner_grads))
}

/// Inner cost at the final snapshot, averaged over tasks.
fn final_cost(tape: &mut Tape, step: &StepInputs<'_>, last: &Container<BufId>) -> Result<f32> {
    let batch = load(tape, step.inner_batch, false);
    let c = eval_cost(step.inner_cost, tape, &batch, last)?;
    Ok(tape.value(c)? / step.num_tasks as f32)
}

fn returned_snapshots(
    tape: &Tape,
    traj: &[Container<BufId>],
    sel: &VarSelector,
    mode: ReturnInnerV,
) -> Result<Vec<Container<Tensor>>> {
    let picked: &[Container<BufId>] = match mode {
        ReturnInnerV::None => &[],
        ReturnInnerV::First => {
            let i = 1.min(traj.len() - 1);
            &traj[i..=i]
        }
        ReturnInnerV::All => traj,
    };
    picked.iter().map(|s| s.select(sel).map(|v| to_host(tape, &v))).collect()
}

// ── Estimators ───────────────────────────────────────────────────────

fn fomaml(tape: &mut Tape, opt: &mut dyn InnerOptimizer, step: &StepInputs<'_>) -> Result<MetaStepOutput> {
    tape.backend().require_gradients()?;
    let cfg = step.cfg;
    let (traj, _) = trajectory(tape, opt, step, false, "fomaml")?;

    let batch = load(tape, step.outer_batch, false);
    let picked = contributing(&traj, cfg.average_across_steps);
    let mut sum = None;
    for snap in picked {
        let detached = snap.map(|_, &id| tape.detach(id));
        let outer = detached.select(&cfg.outer_v)?;
        let cost = eval_cost(step.outer_cost, tape, &batch, &detached)?;
        let grads = grads_wrt(tape, cost, &outer, false)?;
        sum = Some(add_host(sum, to_host(tape, &grads))?);
    }
    let outer_grads = match sum {
        Some(s) => finish_grads(s, picked.len(), 1.0)?,
        None => Container::new(),
    };

    let last = &traj[traj.len() - 1];
    Ok(MetaStepOutput {
        cost: final_cost(tape, step, last)?,
        outer_grads,
        inner_v: returned_snapshots(tape, &traj, &cfg.inner_v, cfg.return_inner_v)?,
    })
}

fn maml(tape: &mut Tape, opt: &mut dyn InnerOptimizer, step: &StepInputs<'_>) -> Result<MetaStepOutput> {
    tape.backend().require_nested_gradients()?;
    let cfg = step.cfg;
    let (traj, _) = trajectory(tape, opt, step, true, "maml")?;

    let batch = load(tape, step.outer_batch, false);
    let picked = contributing(&traj, cfg.average_across_steps);
    let mut objective: Option<BufId> = None;
    for snap in picked {
        let c = eval_cost(step.outer_cost, tape, &batch, snap)?;
        objective = Some(match objective {
            Some(acc) => tape.add(acc, c)?,
            None => c,
        });
    }
    let objective = objective.ok_or(MetaError::EmptyContainer)?;

    // Differentiate w.r.t. the original variables, through every update.
    let originals = traj[0].select(&cfg.outer_v)?;
    let grads = grads_wrt(tape, objective, &originals, false)?;
    let outer_grads = finish_grads(to_host(tape, &grads), picked.len(), 1.0)?;

    let last = &traj[traj.len() - 1];
    Ok(MetaStepOutput {
        cost: final_cost(tape, step, last)?,
        outer_grads,
        inner_v: returned_snapshots(tape, &traj, &cfg.inner_v, cfg.return_inner_v)?,
    })
}

fn reptile(tape: &mut Tape, opt: &mut dyn InnerOptimizer, step: &StepInputs<'_>) -> Result<MetaStepOutput> {
    tape.backend().require_gradients()?;
    let cfg = step.cfg;
    if cfg.inner_grad_steps == 0 {
        warn!("reptile: inner_grad_steps = 0, outer gradient is the plain cost gradient over lr");
    }
    let (traj, inner_grads) = trajectory(tape, opt, step, false, "reptile")?;

    let last = &traj[traj.len() - 1];
    let batch = load(tape, step.inner_batch, false);
    let cost = eval_cost(step.inner_cost, tape, &batch, last)?;
    let last_inner = last.select(&cfg.inner_v)?;
    let final_grads = grads_wrt(tape, cost, &last_inner, false)?;

    let mut sum = None;
    for g in inner_grads.iter().chain(std::iter::once(&final_grads)) {
        sum = Some(add_host(sum, to_host(tape, g))?);
    }
    let outer_grads = match sum {
        Some(s) => finish_grads(s, cfg.inner_grad_steps + 1, 1.0 / cfg.inner_learning_rate)?,
        None => Container::new(),
    };

    Ok(MetaStepOutput {
        cost: tape.value(cost)? / step.num_tasks as f32,
        outer_grads,
        inner_v: returned_snapshots(tape, &traj, &cfg.inner_v, cfg.return_inner_v)?,
    })
}
