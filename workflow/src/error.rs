#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Block on line {0}: missing required key '{1}'")]
    MissingKey(usize, &'static str),
    #[error("Block on line {0}: unknown key '{1}'")]
    UnknownKey(usize, String),
    #[error("Block on line {0}: key '{1}' is defined more than once")]
    DuplicateKey(usize, String),
    #[error("Block on line {0}: invalid value '{2}' for key '{1}'")]
    InvalidValue(usize, &'static str, String),
    #[error("Block on line {0}: invalid regex for re_to_parse_queue_id: {1}")]
    InvalidRegex(usize, regex::Error),
    #[error("Block on line {0}: empty {1} file matcher (set a prefix or a suffix)")]
    EmptyMatcher(usize, &'static str),
    #[error("Block on line {0}: step_no must be at least 1")]
    StepZero(usize),
    #[error("Step {0} is defined more than once")]
    DuplicateStep(u32),
    #[error("Step {0} depends on step {1}, which is not defined")]
    UnknownDependency(u32, u32),
    #[error("Dependency cycle through step {0}")]
    Cycle(u32),
    #[error("Workflow file defines no stages")]
    Empty,
}
