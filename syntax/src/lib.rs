#[macro_use]
mod macros;
mod parse;
pub use parse::{parse_key_values, parse_workflow, Error};
pub mod ast;

/// Comment markers accepted in the workflow definition file.
pub const WORKFLOW_COMMENTS: &str = "#";
/// Comment markers accepted in key-value parameter files (INCAR and control files).
pub const KEY_VALUE_COMMENTS: &str = "#!";
