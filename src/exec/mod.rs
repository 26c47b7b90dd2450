/// Run a shell command in a job dir
mod run_cmd;
pub use run_cmd::{run_cmd, run_with_retries, CmdOutput};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to spawn `{0}`")]
    Spawn(String),
    #[error("Lost the {0} pipe of `{1}`")]
    Pipe(&'static str, String),
    #[error("`{cmd}` failed after {attempts} attempt(s): {status}")]
    Failed {
        cmd: String,
        attempts: usize,
        status: String,
    },
}
