/// Error taxonomy for the tape, containers and meta-gradient estimators.

use thiserror::Error;

use crate::dispatch::Backend;

pub type Result<T> = std::result::Result<T, MetaError>;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("shape mismatch in {op}: expected {expected:?}, found {found:?}")]
    Shape {
        op: &'static str,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("cost function must return a scalar, got shape {0:?}")]
    NotScalar(Vec<usize>),

    #[error("container has no leaves")]
    EmptyContainer,

    #[error("key chain `{0}` not found")]
    MissingKey(String),

    #[error("key chain `{0}` passes through an existing leaf")]
    KeyConflict(String),

    #[error("leaf `{key}` has {found} task rows, expected {expected}")]
    TaskCount {
        key: String,
        expected: usize,
        found: usize,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("backend {backend:?} does not support {feature}")]
    Unsupported {
        backend: Backend,
        feature: &'static str,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl MetaError {
    pub(crate) fn shape(op: &'static str, expected: &[usize], found: &[usize]) -> Self {
        MetaError::Shape {
            op,
            expected: expected.to_vec(),
            found: found.to_vec(),
        }
    }

    /// True when the error only reflects a missing engine capability.
    /// Callers sweeping over backends treat this as "skip", not "fail".
    pub fn is_unsupported(&self) -> bool {
        matches!(self, MetaError::Unsupported { .. })
    }
}
