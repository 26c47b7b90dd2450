/// Decide which job dirs to create this cycle.
mod planner;
pub use planner::{plan, Candidate};

/// Fill a new job dir with its inputs.
mod copy_from_step;
pub use copy_from_step::{prepare_job, CopyFromStep, InputPreparer};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Input file {0:?} does not exist")]
    MissingInput(std::path::PathBuf),
    #[error("Step {0} is not defined in the workflow")]
    UnknownStep(u32),
}
