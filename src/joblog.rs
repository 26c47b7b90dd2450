use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::fs::Fs;

/// What kind of action a job log line records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Detect,
    Correct,
    Backup,
    Rename,
    Remove,
    Transition,
    Submit,
    Kill,
    Prepare,
    Manual,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Detect => "detect",
            Action::Correct => "correct",
            Action::Backup => "backup",
            Action::Rename => "rename",
            Action::Remove => "remove",
            Action::Transition => "transition",
            Action::Submit => "submit",
            Action::Kill => "kill",
            Action::Prepare => "prepare",
            Action::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Append-only, human-readable record of everything done to one job,
/// kept at `<job>/htc_job.log`.
#[derive(Debug, Clone)]
pub struct JobLog<'a> {
    fs: &'a Fs,
    job: PathBuf,
    path: PathBuf,
}

impl<'a> JobLog<'a> {
    pub fn new(fs: &'a Fs, job: &Path) -> Self {
        let mut path = PathBuf::new();
        fs.job_log(job, &mut path);
        Self {
            fs,
            job: job.to_path_buf(),
            path,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one timestamped line: `YYYY-MM-DD HH:MM:SS [action] message`.
    pub fn write(&self, action: Action, msg: &str) -> Result<()> {
        log::debug!("{:?} [{}] {}", self.job, action, msg);
        let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        self.fs.append_line(&self.path, &format!("{stamp} [{action}] {msg}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_lines() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(dir.path(), false);
        let log = JobLog::new(&fs, dir.path());
        log.write(Action::Detect, "TOO FEW BANDS in out")?;
        log.write(Action::Correct, "INCAR: NBANDS 16 -> 20")?;

        let text = fs.read_to_string(log.path())?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(2, lines.len());
        assert!(lines[0].ends_with("[detect] TOO FEW BANDS in out"));
        assert!(lines[1].ends_with("[correct] INCAR: NBANDS 16 -> 20"));
        // "2026-01-01 12:00:00 " prefix
        assert_eq!(Some(' '), lines[0].chars().nth(19));
        Ok(())
    }
}
