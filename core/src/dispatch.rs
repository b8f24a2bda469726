/// Gradient-engine selection.
///
/// Every estimator runs on a `Tape`, but not every tape can do everything:
///
/// | Backend        | gradients | nested (second-order) gradients |
/// |----------------|-----------|---------------------------------|
/// | `HigherOrder`  | yes       | yes (VJPs recorded as tape ops) |
/// | `FirstOrder`   | yes       | no  (numeric reverse sweep)     |
/// | `ForwardOnly`  | no        | no                              |
///
/// FOMAML and Reptile need gradients; MAML needs nested gradients.
/// Asking a backend for a capability it lacks yields `MetaError::Unsupported`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MetaError, Result};

/// Environment variable consulted by `Backend::from_env`.
pub const BACKEND_ENV: &str = "METAGRAD_BACKEND";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    HigherOrder,
    FirstOrder,
    ForwardOnly,
}

/// What a backend can differentiate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    pub gradients: bool,
    pub nested_gradients: bool,
}

impl Backend {
    pub const ALL: [Backend; 3] = [Backend::HigherOrder, Backend::FirstOrder, Backend::ForwardOnly];

    pub fn capabilities(self) -> Capabilities {
        match self {
            Backend::HigherOrder => Capabilities { gradients: true, nested_gradients: true },
            Backend::FirstOrder => Capabilities { gradients: true, nested_gradients: false },
            Backend::ForwardOnly => Capabilities { gradients: false, nested_gradients: false },
        }
    }

    /// Fail with `Unsupported` unless plain gradients are available.
    pub fn require_gradients(self) -> Result<()> {
        if self.capabilities().gradients {
            Ok(())
        } else {
            Err(MetaError::Unsupported { backend: self, feature: "gradients" })
        }
    }

    /// Fail with `Unsupported` unless gradients of gradients are available.
    pub fn require_nested_gradients(self) -> Result<()> {
        self.require_gradients()?;
        if self.capabilities().nested_gradients {
            Ok(())
        } else {
            Err(MetaError::Unsupported { backend: self, feature: "nested gradients" })
        }
    }

    /// Read `METAGRAD_BACKEND`; unset means `HigherOrder`.
    pub fn from_env() -> Result<Backend> {
        match std::env::var(BACKEND_ENV) {
            Ok(name) => name.parse(),
            Err(_) => Ok(Backend::default()),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Backend::HigherOrder => "higher-order",
            Backend::FirstOrder => "first-order",
            Backend::ForwardOnly => "forward-only",
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        Backend::HigherOrder
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Backend> {
        match s.trim().to_ascii_lowercase().as_str() {
            "higher-order" | "higher_order" => Ok(Backend::HigherOrder),
            "first-order" | "first_order" => Ok(Backend::FirstOrder),
            "forward-only" | "forward_only" => Ok(Backend::ForwardOnly),
            other => Err(MetaError::InvalidConfig(format!("unknown backend `{other}`"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_table() {
        assert!(Backend::HigherOrder.capabilities().nested_gradients);
        assert!(Backend::FirstOrder.capabilities().gradients);
        assert!(!Backend::FirstOrder.capabilities().nested_gradients);
        assert!(!Backend::ForwardOnly.capabilities().gradients);
    }

    #[test]
    fn test_require_nested_on_first_order() {
        let err = Backend::FirstOrder.require_nested_gradients().unwrap_err();
        assert!(err.is_unsupported());
        assert!(err.to_string().contains("nested"));
    }

    #[test]
    fn test_forward_only_reports_gradients_first() {
        match Backend::ForwardOnly.require_nested_gradients() {
            Err(MetaError::Unsupported { feature, .. }) => assert_eq!(feature, "gradients"),
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
