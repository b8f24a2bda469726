pub mod error;
pub mod tensor;
pub mod container;
pub mod dispatch;
pub mod tape;
pub mod optimizer;
pub mod config;
pub mod meta;
pub mod gradient;

pub use config::{MetaConfig, ReturnInnerV};
pub use container::{Container, VarSelector};
pub use dispatch::Backend;
pub use error::{MetaError, Result};
pub use meta::{fomaml_step, maml_step, reptile_step, CostFn, Estimator, MetaLearner, MetaStepOutput};
pub use tape::{with_tape, BufId, Tape};
pub use tensor::Tensor;
