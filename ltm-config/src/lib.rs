pub mod env;
pub mod error;
pub mod plan;

pub use env::EnvConfig;
pub use error::ConfigError;
pub use plan::{Catalog, Invocation, InvocationOptions, ParsedPlan};
