/// Meta-step configuration.
///
/// Shared by all three estimators. Reptile reads only `inner_grad_steps`,
/// `inner_learning_rate`, `inner_v` and `return_inner_v`.

use serde::{Deserialize, Serialize};

use crate::container::VarSelector;
use crate::error::{MetaError, Result};

/// Which inner-variable snapshots a meta step hands back.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnInnerV {
    #[default]
    None,
    /// The snapshot after the first inner update.
    First,
    /// Every snapshot, initial one included.
    All,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub inner_grad_steps: usize,
    pub inner_learning_rate: f32,
    /// Average the outer gradient over every snapshot instead of using the last.
    pub average_across_steps: bool,
    pub inner_v: VarSelector,
    pub outer_v: VarSelector,
    pub return_inner_v: ReturnInnerV,
    /// Used by `MetaLearner::train_step` only.
    pub outer_learning_rate: f32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        MetaConfig {
            inner_grad_steps: 1,
            inner_learning_rate: 1e-2,
            average_across_steps: false,
            inner_v: VarSelector::All,
            outer_v: VarSelector::All,
            return_inner_v: ReturnInnerV::None,
            outer_learning_rate: 1e-3,
        }
    }
}

impl MetaConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, lr) in [
            ("inner_learning_rate", self.inner_learning_rate),
            ("outer_learning_rate", self.outer_learning_rate),
        ] {
            if !lr.is_finite() || lr <= 0.0 {
                return Err(MetaError::InvalidConfig(format!(
                    "{name} must be finite and positive, got {lr}"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<MetaConfig> {
        let cfg: MetaConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
