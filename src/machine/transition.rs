use anyhow::Result;

use status::{Status, StatusChange};

use crate::job::Job;
use crate::joblog::{Action, JobLog};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Transition {from} -> {to} is not allowed")]
    NotAllowed { from: Status, to: Status },
    #[error("Status {0} has no sentinel file")]
    NoSentinel(Status),
}

/// The edges the orchestrator may take on its own.
/// Any active job may be sent to `manual`.
pub fn is_allowed(from: &Status, to: &Status) -> bool {
    use Status::*;
    match (from, to) {
        (from, Manual) => from.is_active(),
        (Vis, Ready | PriorReady) => true,
        (Ready | PriorReady, Running) => true,
        (Running, Done | Error) => true,
        (SubDirCal, Done) => true,
        (Error, Killed) => true,
        (Killed, Ready | Custom(_)) => true,
        (Done, DoneCleanedAnalyzed | DoneFailedToCleanAnalyze) => true,
        _ => false,
    }
}

/// Move a job along an allowed edge. `content` is written into the new sentinel.
pub fn transition(
    job: &Job,
    log: &JobLog,
    from: Status,
    to: Status,
    content: &str,
) -> Result<StatusChange> {
    if !is_allowed(&from, &to) {
        return Err(Error::NotAllowed { from, to }.into());
    }
    force(job, log, from, to, content)
}

/// Move a job without consulting the edge table; used for operator overrides.
///
/// The new sentinel is written before the old one is removed. If we die in
/// between, both exist and the scanner's priority order picks one.
pub fn force(
    job: &Job,
    log: &JobLog,
    from: Status,
    to: Status,
    content: &str,
) -> Result<StatusChange> {
    let new = job
        .sentinel(&to)
        .ok_or_else(|| Error::NoSentinel(to.clone()))?;
    job.fs().write_file(&new, content)?;
    if let Some(old) = job.sentinel(&from) {
        if old != new {
            job.fs().remove_if_exists(&old)?;
        }
    }
    log.write(Action::Transition, &format!("{from} -> {to}"))?;
    Ok(StatusChange::new(job.path(), from, to))
}
