pub mod executor;
pub mod helper;
pub mod kernel;
pub mod protocol;
pub mod rules;

pub use executor::{SandboxExecutor, SandboxResult};
pub use protocol::SandboxOperation;
pub use rules::SandboxRules;
