/// One pipeline stage, built from a workflow file block
mod stage;
pub use stage::{FileMatcher, QueueCommands, Stage};

/// The validated, ordered set of stages
mod workflow;
pub use workflow::Workflow;

mod error;
pub use error::Error;

/// Prefix for stage keys that set a parameter in the new job's INCAR.
pub const INCAR_KEY_PREFIX: &str = "incar.";
