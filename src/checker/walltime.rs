use anyhow::Result;

use status::Status;

use crate::job::Job;
use crate::joblog::{Action, JobLog};

use super::{contcar_to_poscar, give_up, Correction, Diagnose, Oszicar};

/// What various queueing systems print when a job runs out of time.
const SIGNATURES: [&str; 3] = ["TERM_RUNLIMIT", "DUE TO TIME LIMIT", "walltime exceeded"];

/// Terminal tag for jobs that couldn't finish even one ionic step in their walltime.
pub const INSUFFICIENT_WALLTIME: &str = "insufficient_walltime";

pub(super) struct Walltime;
pub(super) static WALLTIME: Walltime = Walltime;

impl Diagnose for Walltime {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        for path in [job.queue_stdout()?, job.queue_stderr()?].into_iter().flatten() {
            let text = job.fs().read_lossy(&path)?;
            if let Some(sig) = SIGNATURES.iter().find(|sig| text.contains(*sig)) {
                return Ok(Some(format!("'{}' in {:?}", sig, path.file_name().unwrap_or_default())));
            }
        }
        Ok(None)
    }

    /// Restart from the last geometry. If not a single ionic step finished,
    /// a restart would hit the same wall, so the job is parked instead.
    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction> {
        let oszicar = job.file("OSZICAR");
        let finished = if oszicar.is_file() {
            Oszicar::parse(&job.fs().read_lossy(&oszicar)?, &oszicar)?
                .ionic_steps
                .len()
        } else {
            0
        };

        if finished == 0 {
            log.write(Action::Correct, "walltime: no ionic step finished, walltime is too short")?;
            crate::machine::transition(
                job,
                log,
                Status::Killed,
                Status::Custom(INSUFFICIENT_WALLTIME.to_owned()),
                "",
            )?;
            return Ok(Correction::AlreadyHandled);
        }
        if contcar_to_poscar(job, log)? {
            Ok(Correction::Fixed)
        } else {
            give_up(log, "walltime: no CONTCAR to continue from")
        }
    }
}

#[cfg(test)]
mod test {
    use super::super::test::make_job;
    use super::super::Checker;
    use super::*;
    use crate::fs::Fs;
    use crate::job::test::workflow;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_walltime_without_progress_is_parked() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[
                ("INCAR", ""),
                ("__killed__", "walltime"),
                ("vasp.out", ""),
                ("vasp.err", "slurmstepd: *** JOB 12 CANCELLED DUE TO TIME LIMIT ***"),
            ],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        assert!(WALLTIME.detect(&job)?.is_some());

        assert_eq!(Correction::AlreadyHandled, Checker::resolve("walltime", &job).correct()?);
        assert_eq!(
            Status::Custom(INSUFFICIENT_WALLTIME.to_owned()),
            status::classify(&path)?
        );
        Ok(())
    }

    #[test]
    fn test_walltime_restarts_from_contcar() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[
                ("INCAR", ""),
                ("POSCAR", "start"),
                ("CONTCAR", "step 1"),
                ("OSZICAR", "   1 F= -.1E+02 E0= -.1E+02\n"),
                ("vasp.out", "TERM_RUNLIMIT: job killed after reaching LSF run time limit"),
                ("vasp.err", ""),
            ],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        assert_eq!(Correction::Fixed, Checker::resolve("walltime", &job).correct()?);
        assert_eq!("step 1", fs::read_to_string(path.join("POSCAR"))?);
        assert!(!path.join("vasp.out").exists());
        Ok(())
    }
}
