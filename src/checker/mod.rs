//! Error detection and correction for one job.
//!
//! Each recognized error has a tag, which is what gets persisted in the
//! `__error__`/`__killed__` sentinels, and a [`Diagnose`] impl that knows how to
//! spot it and how to fix it. [`Checker`] ties a diagnosis to a job's log and
//! backup writer.

use std::path::PathBuf;

use anyhow::Result;

use status::Status;

use crate::backup::BackupWriter;
use crate::incar::Incar;
use crate::job::Job;
use crate::joblog::{Action, JobLog};

/// Checks on the computation's own output file
mod signature;

/// Queue-reported walltime exhaustion
mod walltime;

/// Convergence checks on OSZICAR
mod oszicar;
pub use oszicar::Oszicar;

/// OUTCAR completeness and band count
mod outcar;

/// Checker name that runs every check meant for a job still running.
pub const ON_THE_FLY: &str = "on_the_fly";
/// Checker name that runs every check meant for a job whose run has ended.
pub const AFTER_CAL: &str = "after_cal";

/// Outcome of a correction attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correction {
    /// inputs were changed, the job can be resubmitted
    Fixed,
    /// nothing (more) can be done automatically
    NotFixed,
    /// the checker already moved the job to its own terminal status
    AlreadyHandled,
}

/// An output file that exists but can't be read the way we expect.
/// Jobs that hit this are moved to manual with the file kept for debugging.
#[derive(Debug, thiserror::Error)]
#[error("Malformed {file:?}: {msg}")]
pub struct MalformedOutput {
    pub file: PathBuf,
    pub msg: String,
}

impl MalformedOutput {
    pub fn new(file: PathBuf, msg: impl Into<String>) -> Self {
        Self {
            file,
            msg: msg.into(),
        }
    }
}

/// Every error this crate knows how to detect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    TooFewBands,
    Rhosyg,
    Pricel,
    SubspaceMatrix,
    Edddav,
    Zpotrf,
    RealOptlay,
    Tetirr,
    IncorrectShift,
    Brmix,
    Zbrent,
    Walltime,
    ElectronicDivergence,
    IonicDivergence,
    PositiveEnergy,
    UnfinishedOutcar,
}

impl ErrorKind {
    /// Checks that make sense while the job is still running.
    pub const ON_THE_FLY: [ErrorKind; 9] = [
        ErrorKind::TooFewBands,
        ErrorKind::Rhosyg,
        ErrorKind::Pricel,
        ErrorKind::SubspaceMatrix,
        ErrorKind::Edddav,
        ErrorKind::Zpotrf,
        ErrorKind::RealOptlay,
        ErrorKind::Tetirr,
        ErrorKind::IncorrectShift,
    ];

    /// Checks run once the queue reports the job finished.
    pub const AFTER_CAL: [ErrorKind; 16] = [
        ErrorKind::TooFewBands,
        ErrorKind::Rhosyg,
        ErrorKind::Pricel,
        ErrorKind::SubspaceMatrix,
        ErrorKind::Edddav,
        ErrorKind::Zpotrf,
        ErrorKind::RealOptlay,
        ErrorKind::Tetirr,
        ErrorKind::IncorrectShift,
        ErrorKind::Brmix,
        ErrorKind::Zbrent,
        ErrorKind::Walltime,
        ErrorKind::ElectronicDivergence,
        ErrorKind::IonicDivergence,
        ErrorKind::PositiveEnergy,
        ErrorKind::UnfinishedOutcar,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            ErrorKind::TooFewBands => "too_few_bands",
            ErrorKind::Rhosyg => "rhosyg",
            ErrorKind::Pricel => "pricel",
            ErrorKind::SubspaceMatrix => "subspace_matrix",
            ErrorKind::Edddav => "edddav",
            ErrorKind::Zpotrf => "zpotrf",
            ErrorKind::RealOptlay => "real_optlay",
            ErrorKind::Tetirr => "tetirr",
            ErrorKind::IncorrectShift => "incorrect_shift",
            ErrorKind::Brmix => "brmix",
            ErrorKind::Zbrent => "zbrent",
            ErrorKind::Walltime => "walltime",
            ErrorKind::ElectronicDivergence => "electronic_divergence",
            ErrorKind::IonicDivergence => "ionic_divergence",
            ErrorKind::PositiveEnergy => "positive_energy",
            ErrorKind::UnfinishedOutcar => "unfinished_outcar",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::AFTER_CAL.iter().copied().find(|kind| kind.tag() == tag)
    }

    fn diagnosis(self) -> &'static dyn Diagnose {
        match self {
            ErrorKind::TooFewBands => &signature::TOO_FEW_BANDS,
            ErrorKind::Rhosyg => &signature::RHOSYG,
            ErrorKind::Pricel => &signature::PRICEL,
            ErrorKind::SubspaceMatrix => &signature::SUBSPACE_MATRIX,
            ErrorKind::Edddav => &signature::EDDDAV,
            ErrorKind::Zpotrf => &signature::ZPOTRF,
            ErrorKind::RealOptlay => &signature::REAL_OPTLAY,
            ErrorKind::Tetirr => &signature::TETIRR,
            ErrorKind::IncorrectShift => &signature::INCORRECT_SHIFT,
            ErrorKind::Brmix => &signature::BRMIX,
            ErrorKind::Zbrent => &signature::ZBRENT,
            ErrorKind::Walltime => &walltime::WALLTIME,
            ErrorKind::ElectronicDivergence => &oszicar::ELECTRONIC_DIVERGENCE,
            ErrorKind::IonicDivergence => &oszicar::IONIC_DIVERGENCE,
            ErrorKind::PositiveEnergy => &oszicar::POSITIVE_ENERGY,
            ErrorKind::UnfinishedOutcar => &outcar::UNFINISHED_OUTCAR,
        }
    }
}

/// How to spot one error and how to fix it.
trait Diagnose: Sync {
    /// A short description of what was found, or `None` if the error is absent.
    /// A missing target file means the error is absent.
    fn detect(&self, job: &Job) -> Result<Option<String>>;

    /// Change the job's inputs so the next run can avoid the error.
    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction>;
}

#[derive(Debug, Clone)]
enum Selection {
    One(ErrorKind),
    All(&'static [ErrorKind]),
    /// unknown tag; detects nothing, fixes nothing
    Null,
}

/// A checker bound to one job, resolved from a tag or a composite name.
#[derive(Debug)]
pub struct Checker<'a> {
    name: String,
    selection: Selection,
    job: &'a Job<'a>,
    log: JobLog<'a>,
    backup: BackupWriter<'a>,
}

impl<'a> Checker<'a> {
    /// Unknown names resolve to a checker that does nothing.
    pub fn resolve(name: &str, job: &'a Job<'a>) -> Self {
        let selection = match name {
            ON_THE_FLY => Selection::All(&ErrorKind::ON_THE_FLY),
            AFTER_CAL => Selection::All(&ErrorKind::AFTER_CAL),
            tag => ErrorKind::from_tag(tag).map_or(Selection::Null, Selection::One),
        };
        Self {
            name: name.to_owned(),
            selection,
            job,
            log: job.log(),
            backup: BackupWriter::new(job),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self.selection, Selection::Null)
    }

    fn kinds(&self) -> &[ErrorKind] {
        match &self.selection {
            Selection::One(kind) => std::slice::from_ref(kind),
            Selection::All(kinds) => kinds,
            Selection::Null => &[],
        }
    }

    /// Look for errors in a running job, stopping at the first one found.
    ///
    /// Returns `Ok(None)` if the job looks healthy. Otherwise the job is moved
    /// from `running` to `error` with the error's tag in the sentinel, and the tag
    /// is returned.
    pub fn check(&self) -> Result<Option<ErrorKind>> {
        for &kind in self.kinds() {
            if let Some(found) = kind.diagnosis().detect(self.job)? {
                self.log
                    .write(Action::Detect, &format!("{}: {}", kind.tag(), found))?;
                crate::machine::transition(
                    self.job,
                    &self.log,
                    Status::Running,
                    Status::Error,
                    kind.tag(),
                )?;
                return Ok(Some(kind));
            }
        }
        Ok(None)
    }

    /// Try to fix the error this checker was resolved from.
    ///
    /// Gives up without touching anything once the job has as many snapshots as
    /// its stage allows retries. Otherwise the job's files are backed up first.
    pub fn correct(&self) -> Result<Correction> {
        let kind = match self.selection {
            Selection::One(kind) => kind,
            _ => {
                self.log.write(
                    Action::Correct,
                    &format!("no correction registered for '{}'", self.name),
                )?;
                return Ok(Correction::NotFixed);
            }
        };

        let tries = self.backup.retry_count()?;
        let max = self.job.stage().max_error_times;
        if tries >= max {
            self.log.write(
                Action::Correct,
                &format!("{}: giving up, {} of {} retries used", kind.tag(), tries, max),
            )?;
            return Ok(Correction::NotFixed);
        }

        self.backup.backup()?;
        let correction = kind.diagnosis().correct(self.job, &self.log)?;
        if correction == Correction::Fixed {
            self.clear_outputs()?;
        }
        Ok(correction)
    }

    /// The run's outputs are archived; drop them so the next run's
    /// completion markers start from scratch.
    fn clear_outputs(&self) -> Result<()> {
        let mut stale = vec![self.job.file(&self.job.stage().program_output)];
        stale.extend(self.job.queue_stdout()?);
        stale.extend(self.job.queue_stderr()?);
        for path in stale {
            if self.job.fs().remove_if_exists(&path)? {
                self.log.write(Action::Remove, &format!("{:?}", path))?;
            }
        }
        Ok(())
    }
}

/// Pending INCAR changes for one correction, logged together on save.
struct IncarEdit<'a> {
    job: &'a Job<'a>,
    log: &'a JobLog<'a>,
    incar: Incar,
    changes: Vec<String>,
}

impl<'a> IncarEdit<'a> {
    fn open(job: &'a Job<'a>, log: &'a JobLog<'a>) -> Result<Self> {
        let incar = Incar::read(job.fs(), &job.file("INCAR"))?;
        Ok(Self {
            job,
            log,
            incar,
            changes: Vec::with_capacity(4),
        })
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.incar.get(key)
    }

    fn get_as<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.incar.get_as(key)
    }

    /// true if `key` is set to `val`, ignoring case.
    fn is(&self, key: &str, val: &str) -> bool {
        self.get(key).is_some_and(|v| v.eq_ignore_ascii_case(val))
    }

    fn set(&mut self, key: &str, val: &str) {
        let old = self.incar.set(key, val);
        self.changes.push(format!(
            "{} {} -> {}",
            key,
            old.as_deref().unwrap_or("unset"),
            val
        ));
    }

    fn save(self) -> Result<Correction> {
        self.incar.write(self.job.fs(), &self.job.file("INCAR"))?;
        self.log
            .write(Action::Correct, &format!("INCAR: {}", self.changes.join(", ")))?;
        Ok(Correction::Fixed)
    }
}

/// Log why a correction can't go any further.
fn give_up(log: &JobLog, why: &str) -> Result<Correction> {
    log.write(Action::Correct, why)?;
    Ok(Correction::NotFixed)
}

/// Delete files that would poison a restart.
fn remove_files(job: &Job, log: &JobLog, names: &[&str]) -> Result<()> {
    for name in names {
        if job.fs().remove_if_exists(job.file(name))? {
            log.write(Action::Remove, name)?;
        }
    }
    Ok(())
}

/// Continue from the last geometry: CONTCAR replaces POSCAR.
/// Returns false if there is no usable CONTCAR.
fn contcar_to_poscar(job: &Job, log: &JobLog) -> Result<bool> {
    let contcar = job.file("CONTCAR");
    if !contcar.is_file() || std::fs::metadata(&contcar)?.len() == 0 {
        return Ok(false);
    }
    job.fs().rename(&contcar, job.file("POSCAR"))?;
    log.write(Action::Rename, "CONTCAR -> POSCAR")?;
    Ok(true)
}
