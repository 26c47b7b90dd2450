use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;

use status::{Status, StatusChange};
use workflow::Workflow;

use crate::checker::{Checker, Correction, MalformedOutput, AFTER_CAL, ON_THE_FLY};
use crate::exec;
use crate::fs::Fs;
use crate::job::Job;
use crate::joblog::{Action, JobLog};
use crate::queue::{QueueClient, QueueSnapshot};

use super::transition;

/// What one job's update produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Outcome {
    pub change: Option<StatusChange>,
    /// new consecutive queue-miss count; `Some(0)` clears it, `None` leaves it alone
    pub misses: Option<u32>,
}

impl Outcome {
    fn changed(change: StatusChange) -> Self {
        Self {
            change: Some(change),
            misses: Some(0),
        }
    }

    fn unchanged() -> Self {
        Self::default()
    }
}

/// Advances jobs along the state machine, one bucket at a time.
pub struct Updater<'a> {
    fs: &'a Fs,
    workflow: &'a Workflow,
    queue: &'a QueueClient,
    snapshot: &'a QueueSnapshot,
    misses: &'a BTreeMap<PathBuf, u32>,
    miss_limit: u32,
}

impl<'a> Updater<'a> {
    pub fn new(
        fs: &'a Fs,
        workflow: &'a Workflow,
        queue: &'a QueueClient,
        snapshot: &'a QueueSnapshot,
        misses: &'a BTreeMap<PathBuf, u32>,
        miss_limit: u32,
    ) -> Self {
        Self {
            fs,
            workflow,
            queue,
            snapshot,
            misses,
            miss_limit,
        }
    }

    /// Handle one job currently filed under `status`.
    /// Statuses with nothing to do this cycle yield an empty outcome.
    pub fn update(&self, path: &Path, status: &Status) -> Result<Outcome> {
        if !matches!(
            status,
            Status::Running | Status::Error | Status::Killed | Status::SubDirCal | Status::Done
        ) {
            return Ok(Outcome::unchanged());
        }
        let job = Job::new(self.fs, self.workflow, path)?;
        match status {
            Status::Running => self.update_running(&job),
            Status::Error => self.update_error(&job),
            Status::Killed => self.update_killed(&job),
            Status::SubDirCal => self.update_sub_dir_cal(&job),
            _ => self.update_done(&job),
        }
    }

    /// Finished jobs get the full check, running ones the on-the-fly one.
    /// A job the queue has lost is tolerated for a few cycles.
    fn update_running(&self, job: &Job) -> Result<Outcome> {
        let log = job.log();
        if job.is_completed()? {
            if Checker::resolve(AFTER_CAL, job).check()?.is_some() {
                return Ok(Outcome::changed(StatusChange::new(
                    job.path(),
                    Status::Running,
                    Status::Error,
                )));
            }
            let change = transition(job, &log, Status::Running, Status::Done, "")?;
            return Ok(Outcome::changed(change));
        }

        if Checker::resolve(ON_THE_FLY, job).check()?.is_some() {
            return Ok(Outcome::changed(StatusChange::new(
                job.path(),
                Status::Running,
                Status::Error,
            )));
        }

        let present = match job.queue_id()? {
            Some(id) => self.snapshot.contains(&job.stage().queue.query, &id),
            None => Some(false),
        };
        match present {
            Some(true) => Ok(Outcome {
                change: None,
                misses: Some(0),
            }),
            None => Ok(Outcome::unchanged()),
            Some(false) => {
                let misses = self.misses.get(job.path()).copied().unwrap_or(0) + 1;
                if misses < self.miss_limit {
                    log::info!("{:?} missing from queue ({}/{})", job.path(), misses, self.miss_limit);
                    return Ok(Outcome {
                        change: None,
                        misses: Some(misses),
                    });
                }
                log.write(
                    Action::Manual,
                    &format!("gone from the queue without finishing ({misses} checks)"),
                )?;
                let change = transition(job, &log, Status::Running, Status::Manual, "lost")?;
                Ok(Outcome::changed(change))
            }
        }
    }

    /// Make sure the queue stops the job before its files are touched.
    fn update_error(&self, job: &Job) -> Result<Outcome> {
        let log = job.log();
        let tag = job.read_tag(&Status::Error)?;
        if let Some(id) = job.queue_id()? {
            if self.snapshot.contains(&job.stage().queue.query, &id) != Some(false) {
                self.queue.kill(job, &id)?;
            }
        }
        let change = transition(job, &log, Status::Error, Status::Killed, &tag)?;
        Ok(Outcome::changed(change))
    }

    fn update_killed(&self, job: &Job) -> Result<Outcome> {
        let log = job.log();
        let tag = job.read_tag(&Status::Killed)?;
        let checker = Checker::resolve(&tag, job);
        if checker.is_null() {
            log::info!("{:?}: no checker registered for '{}'", job.path(), tag);
        }
        let change = match checker.correct()? {
            Correction::Fixed => transition(job, &log, Status::Killed, Status::Ready, "")?,
            Correction::NotFixed => {
                log.write(Action::Manual, &format!("'{tag}' could not be corrected"))?;
                transition(job, &log, Status::Killed, Status::Manual, &tag)?
            }
            Correction::AlreadyHandled => {
                let now = status::classify(job.path())?;
                StatusChange::new(job.path(), Status::Killed, now)
            }
        };
        Ok(Outcome::changed(change))
    }

    /// The stage's driver manages the sub-directory jobs and flips the
    /// parent's sentinel itself once they are all done.
    fn update_sub_dir_cal(&self, job: &Job) -> Result<Outcome> {
        let log = job.log();
        let Some(cmd) = &job.stage().sub_dir_cal_cmd else {
            log.write(Action::Manual, "no sub_dir_cal_cmd for this stage")?;
            let change = transition(job, &log, Status::SubDirCal, Status::Manual, "")?;
            return Ok(Outcome::changed(change));
        };
        let output = exec::run_cmd(cmd, job.path())?;
        if !output.success() {
            log.write(
                Action::Manual,
                &format!("`{cmd}` failed with {}: {}", output.status, output.stderr.trim()),
            )?;
            let change = transition(job, &log, Status::SubDirCal, Status::Manual, "")?;
            return Ok(Outcome::changed(change));
        }
        let now = status::classify(job.path())?;
        if now == Status::SubDirCal {
            Ok(Outcome::unchanged())
        } else {
            Ok(Outcome::changed(StatusChange::new(job.path(), Status::SubDirCal, now)))
        }
    }

    /// Optional cleanup and analysis of a finished job.
    fn update_done(&self, job: &Job) -> Result<Outcome> {
        let stage = job.stage();
        if !stage.has_post_processing() {
            return Ok(Outcome::unchanged());
        }
        let log = job.log();
        for name in &stage.remove_after_cal {
            if self.fs.remove_if_exists(job.file(name))? {
                log.write(Action::Remove, name)?;
            }
        }
        let ok = match &stage.post_process_command {
            Some(cmd) => {
                let output = exec::run_cmd(cmd, job.path())?;
                if !output.success() {
                    log::warn!("{:?}: `{}` failed with {}", job.path(), cmd, output.status);
                }
                output.success()
            }
            None => true,
        };
        let to = if ok {
            Status::DoneCleanedAnalyzed
        } else {
            Status::DoneFailedToCleanAnalyze
        };
        Ok(Outcome::changed(transition(job, &log, Status::Done, to, "")?))
    }

    /// Park a job whose update failed; see [`park`].
    pub fn fault(&self, path: &Path, from: &Status, err: &anyhow::Error) -> Result<StatusChange> {
        park(self.fs, path, from, err)
    }
}

/// Force a job into `manual` after an error nobody could handle. If a
/// malformed output file caused it, a copy is kept next to it as
/// `<file>.manual_debug`.
pub fn park(fs: &Fs, path: &Path, from: &Status, err: &anyhow::Error) -> Result<StatusChange> {
    let log = JobLog::new(fs, path);
    if let Some(malformed) = err.downcast_ref::<MalformedOutput>() {
        let mut debug = malformed.file.clone().into_os_string();
        debug.push(".manual_debug");
        if malformed.file.is_file() {
            fs.copy(&malformed.file, &debug)?;
        }
    }
    log.write(Action::Manual, &format!("{err:#}"))?;

    fs.write_file(path.join("__manual__"), &format!("{err:#}\n"))?;
    if let Some(old) = from.file_name() {
        if old != "__manual__" {
            fs.remove_if_exists(path.join(old))?;
        }
    }
    log.write(Action::Transition, &format!("{from} -> manual"))?;
    Ok(StatusChange::new(path, from.clone(), Status::Manual))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::test::workflow;
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        fs: Fs,
        wf: Workflow,
        queue: QueueClient,
        snapshot: QueueSnapshot,
        misses: BTreeMap<PathBuf, u32>,
        job: PathBuf,
    }

    impl Fixture {
        fn new(extra: &str, files: &[(&str, &str)]) -> Result<Self> {
            let dir = tempdir()?;
            let job = dir.path().join("Si/step_1_opt");
            fs::create_dir_all(&job)?;
            for (name, text) in files {
                fs::write(job.join(name), text)?;
            }
            let mut snapshot = QueueSnapshot::default();
            snapshot.insert("echo 7", Some("7\n".to_owned()));
            Ok(Self {
                fs: Fs::new(dir.path(), false),
                _dir: dir,
                wf: workflow(extra)?,
                queue: QueueClient::new(0, Duration::ZERO),
                snapshot,
                misses: BTreeMap::new(),
                job,
            })
        }

        fn updater(&self) -> Updater<'_> {
            Updater::new(&self.fs, &self.wf, &self.queue, &self.snapshot, &self.misses, 3)
        }

        fn update(&self, status: Status) -> Result<Outcome> {
            self.updater().update(&self.job, &status)
        }
    }

    #[test]
    fn test_completed_with_too_few_bands_goes_to_error() -> Result<()> {
        let f = Fixture::new(
            "",
            &[
                ("INCAR", "NBANDS = 12\n"),
                ("__running__", ""),
                ("out", "  TOO FEW BANDS\n"),
                ("vasp.out", ""),
                ("vasp.err", ""),
            ],
        )?;
        let outcome = f.update(Status::Running)?;
        assert_eq!(
            Some(StatusChange::new(&f.job, Status::Running, Status::Error)),
            outcome.change
        );
        assert_eq!(Status::Error, status::classify(&f.job)?);
        assert_eq!("too_few_bands", fs::read_to_string(f.job.join("__error__"))?);
        Ok(())
    }

    #[test]
    fn test_clean_finish_is_done() -> Result<()> {
        let f = Fixture::new(
            "",
            &[
                ("INCAR", ""),
                ("__running__", ""),
                ("OUTCAR", "General timing and accounting informations for this job:"),
                ("vasp.out", ""),
                ("vasp.err", ""),
            ],
        )?;
        f.update(Status::Running)?;
        assert_eq!(Status::Done, status::classify(&f.job)?);
        Ok(())
    }

    #[test]
    fn test_queue_misses() -> Result<()> {
        let mut f = Fixture::new(
            "",
            &[("INCAR", ""), ("__running__", ""), ("job_id", "Submitted batch job 7\n")],
        )?;
        // still queued:
        assert_eq!(Some(0), f.update(Status::Running)?.misses);

        fs::write(f.job.join("job_id"), "Submitted batch job 8\n")?;
        assert_eq!(Some(1), f.update(Status::Running)?.misses);
        f.misses.insert(f.job.clone(), 2);
        let outcome = f.update(Status::Running)?;
        assert_eq!(Some(Status::Manual), outcome.change.map(|c| c.to));
        assert_eq!(Status::Manual, status::classify(&f.job)?);
        Ok(())
    }

    #[test]
    fn test_error_is_killed_then_corrected() -> Result<()> {
        let f = Fixture::new(
            "",
            &[
                ("INCAR", "ISMEAR = -5\n"),
                ("__error__", "tetirr"),
                ("job_id", "Submitted batch job 7\n"),
                ("out", "Routine TETIRR needs special values"),
            ],
        )?;
        f.update(Status::Error)?;
        assert_eq!(Status::Killed, status::classify(&f.job)?);
        assert_eq!("tetirr", fs::read_to_string(f.job.join("__killed__"))?);
        assert!(fs::read_to_string(f.job.join("htc_job.log"))?.contains("[kill] `true 7`"));

        f.update(Status::Killed)?;
        assert_eq!(Status::Ready, status::classify(&f.job)?);
        Ok(())
    }

    #[test]
    fn test_unregistered_tag_goes_manual() -> Result<()> {
        let f = Fixture::new("", &[("INCAR", ""), ("__killed__", "cosmic_ray")])?;
        let outcome = f.update(Status::Killed)?;
        assert_eq!(Some(Status::Manual), outcome.change.map(|c| c.to));
        assert_eq!(Status::Manual, status::classify(&f.job)?);
        Ok(())
    }

    #[test]
    fn test_retry_ceiling_goes_manual() -> Result<()> {
        let f = Fixture::new(
            "max_error_times = 1",
            &[("INCAR", "ISMEAR = -5\n"), ("__killed__", "tetirr")],
        )?;
        fs::create_dir_all(f.job.join("error_folder/error_1"))?;
        f.update(Status::Killed)?;
        assert_eq!(Status::Manual, status::classify(&f.job)?);
        assert_eq!("ISMEAR = -5\n", fs::read_to_string(f.job.join("INCAR"))?);
        Ok(())
    }

    #[test]
    fn test_done_post_processing() -> Result<()> {
        let f = Fixture::new(
            "remove_after_cal = WAVECAR\npost_process_command = test -f OUTCAR",
            &[("INCAR", ""), ("__done__", ""), ("WAVECAR", "big")],
        )?;
        f.update(Status::Done)?;
        assert!(!f.job.join("WAVECAR").exists());
        assert_eq!(Status::DoneFailedToCleanAnalyze, status::classify(&f.job)?);
        Ok(())
    }

    #[test]
    fn test_sub_dir_cal() -> Result<()> {
        let f = Fixture::new(
            "sub_dir_cal_cmd = touch __done__ && rm __sub_dir_cal__",
            &[("INCAR", ""), ("__sub_dir_cal__", "")],
        )?;
        let outcome = f.update(Status::SubDirCal)?;
        assert_eq!(Some(Status::Done), outcome.change.map(|c| c.to));
        Ok(())
    }

    #[test]
    fn test_fault_keeps_debug_copy() -> Result<()> {
        let f = Fixture::new(
            "",
            &[
                ("INCAR", "NBANDS = 12\n"),
                ("__killed__", "too_few_bands"),
                ("OUTCAR", "NBANDS= ****\n"),
            ],
        )?;
        let updater = f.updater();
        let err = updater.update(&f.job, &Status::Killed).unwrap_err();
        let change = updater.fault(&f.job, &Status::Killed, &err)?;
        assert_eq!(Status::Manual, change.to);
        assert_eq!(Status::Manual, status::classify(&f.job)?);
        assert!(!f.job.join("__killed__").exists());
        assert!(f.job.join("OUTCAR.manual_debug").is_file());
        Ok(())
    }
}
