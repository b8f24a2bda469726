/// Inner-loop update rules and the host-side outer update.
///
/// Inner rules run on the tape: every update is built from recorded ops, so
/// a second-order estimator can differentiate the whole trajectory. The
/// outer update runs on host tensors once per meta step.

use serde::{Deserialize, Serialize};

use crate::container::Container;
use crate::error::{MetaError, Result};
use crate::tape::{BufId, Tape};
use crate::tensor::Tensor;

/// A differentiable update rule for the inner loop.
///
/// `reset` is called once per estimator call, before the first inner step,
/// so state never leaks between meta steps.
pub trait InnerOptimizer {
    fn name(&self) -> &'static str;

    fn reset(&mut self);

    /// New variables from `vars` and their gradients. Every leaf of `vars`
    /// must have a gradient of the same shape.
    fn step(
        &mut self,
        tape: &mut Tape,
        vars: &Container<BufId>,
        grads: &Container<BufId>,
        lr: f32,
    ) -> Result<Container<BufId>>;
}

// ── Plain gradient descent ───────────────────────────────────────────

/// v ← v − lr·g
#[derive(Clone, Copy, Debug, Default)]
pub struct GradientDescent;

impl InnerOptimizer for GradientDescent {
    fn name(&self) -> &'static str {
        "gradient_descent"
    }

    fn reset(&mut self) {}

    fn step(
        &mut self,
        tape: &mut Tape,
        vars: &Container<BufId>,
        grads: &Container<BufId>,
        lr: f32,
    ) -> Result<Container<BufId>> {
        vars.zip_with(grads, |_, &v, &g| {
            let delta = tape.scale(g, lr)?;
            tape.sub(v, delta)
        })
    }
}

// ── Heavy-ball momentum ──────────────────────────────────────────────

/// Momentum hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MomentumConfig {
    pub beta: f32,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        MomentumConfig { beta: 0.9 }
    }
}

/// u ← β·u + g;  v ← v − lr·u.  The velocity starts at zero each call.
pub struct Momentum {
    pub config: MomentumConfig,
    velocity: Container<BufId>,
}

impl Momentum {
    pub fn new(config: MomentumConfig) -> Result<Self> {
        if !(0.0..1.0).contains(&config.beta) {
            return Err(MetaError::InvalidConfig(format!(
                "momentum beta must be in [0, 1), got {}", config.beta
            )));
        }
        Ok(Momentum { config, velocity: Container::new() })
    }
}

impl InnerOptimizer for Momentum {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn reset(&mut self) {
        self.velocity = Container::new();
    }

    fn step(
        &mut self,
        tape: &mut Tape,
        vars: &Container<BufId>,
        grads: &Container<BufId>,
        lr: f32,
    ) -> Result<Container<BufId>> {
        let beta = self.config.beta;
        let mut velocity = Container::new();
        let mut updated = Container::new();
        for (key, &v) in vars.leaves() {
            let g = *grads.leaf(&key)?;
            let u = match self.velocity.get(&key) {
                Some(&prev) => {
                    let decayed = tape.scale(prev, beta)?;
                    tape.add(decayed, g)?
                }
                None => g,
            };
            let delta = tape.scale(u, lr)?;
            updated.insert(&key, tape.sub(v, delta)?)?;
            velocity.insert(&key, u)?;
        }
        self.velocity = velocity;
        Ok(updated)
    }
}

// ── Outer update ─────────────────────────────────────────────────────

/// Host-side gradient-descent update. Variables without a gradient entry
/// are carried over unchanged.
pub fn gradient_descent_update(
    vars: &Container<Tensor>,
    grads: &Container<Tensor>,
    lr: f32,
) -> Result<Container<Tensor>> {
    vars.try_map(|key, v| match grads.get(key) {
        Some(g) => v.zip_map(g, |a, b| a - lr * b),
        None => Ok(v.clone()),
    })
}
