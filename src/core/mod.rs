pub mod config;
pub mod context;
pub mod error;
pub mod registry;
pub mod steplist;

pub use config::{ConfigUnit, ConfigValue, ResolvedConfig};
pub use context::{EnvSnapshot, ResolutionContext};
pub use error::RunnerError;
pub use registry::StepType;
pub use steplist::{StepEntry, StepInstance};
