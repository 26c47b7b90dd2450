use std::path::Path;

use anyhow::Result;

use crate::incar::Incar;
use crate::job::Job;
use crate::joblog::JobLog;

use super::{contcar_to_poscar, give_up, Correction, Diagnose, IncarEdit, MalformedOutput};

const NELM_DEFAULT: usize = 60;

/// One finished ionic step.
#[derive(Debug, Clone, PartialEq)]
pub struct IonicStep {
    pub electronic_steps: usize,
    /// the `F=` free energy
    pub energy: f64,
}

/// The per-step summary a run writes to OSZICAR.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Oszicar {
    pub ionic_steps: Vec<IonicStep>,
    /// electronic steps of an ionic step that hasn't finished yet
    pub pending_electronic_steps: usize,
}

impl Oszicar {
    /// Electronic steps are lines starting with an algorithm label such as
    /// `DAV:` or `RMM:`; a line holding `F=` closes an ionic step.
    pub fn parse(text: &str, path: &Path) -> Result<Self, MalformedOutput> {
        let mut oszicar = Self::default();
        for line in text.lines() {
            if let Some((_, rest)) = line.split_once("F=") {
                let field = rest.split_whitespace().next().unwrap_or("");
                let energy = field.parse().map_err(|_| {
                    MalformedOutput::new(path.to_path_buf(), format!("bad F= value '{field}'"))
                })?;
                oszicar.ionic_steps.push(IonicStep {
                    electronic_steps: oszicar.pending_electronic_steps,
                    energy,
                });
                oszicar.pending_electronic_steps = 0;
            } else if line
                .split_whitespace()
                .next()
                .is_some_and(|label| label.ends_with(':') && label.len() > 1)
            {
                oszicar.pending_electronic_steps += 1;
            }
        }
        Ok(oszicar)
    }

    pub fn final_energy(&self) -> Option<f64> {
        self.ionic_steps.last().map(|step| step.energy)
    }
}

/// Read the job's OSZICAR and INCAR; `None` if there's no OSZICAR yet.
fn read(job: &Job) -> Result<Option<(Oszicar, Incar)>> {
    let path = job.file("OSZICAR");
    if !path.is_file() {
        return Ok(None);
    }
    let text = job.fs().read_lossy(&path)?;
    let oszicar = Oszicar::parse(&text, &path)?;
    let incar = Incar::read(job.fs(), &job.file("INCAR"))?;
    Ok(Some((oszicar, incar)))
}

pub(super) struct ElectronicDivergence;
pub(super) static ELECTRONIC_DIVERGENCE: ElectronicDivergence = ElectronicDivergence;

impl Diagnose for ElectronicDivergence {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        let Some((oszicar, incar)) = read(job)? else {
            return Ok(None);
        };
        let nelm = incar.get_as("NELM").unwrap_or(NELM_DEFAULT);
        match oszicar.ionic_steps.last() {
            Some(step) if step.electronic_steps >= nelm => Ok(Some(format!(
                "ionic step {} needed {} electronic steps (NELM = {})",
                oszicar.ionic_steps.len(),
                step.electronic_steps,
                nelm
            ))),
            _ => Ok(None),
        }
    }

    /// ALGO = All first, then slower charge mixing.
    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction> {
        let mut edit = IncarEdit::open(job, log)?;
        if !edit.is("ALGO", "All") {
            edit.set("ALGO", "All");
        } else if edit.get_as::<f64>("AMIX") != Some(0.1) {
            edit.set("AMIX", "0.1");
            edit.set("BMIX", "0.01");
        } else {
            return give_up(log, "electronic_divergence: ALGO and mixing already adjusted");
        }
        edit.save()
    }
}

pub(super) struct IonicDivergence;
pub(super) static IONIC_DIVERGENCE: IonicDivergence = IonicDivergence;

impl Diagnose for IonicDivergence {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        let Some((oszicar, incar)) = read(job)? else {
            return Ok(None);
        };
        let nsw: usize = incar.get_as("NSW").unwrap_or(0);
        let ibrion: i32 = incar
            .get_as("IBRION")
            .unwrap_or(if nsw <= 1 { -1 } else { 0 });
        let steps = oszicar.ionic_steps.len();
        if nsw > 0 && ibrion != -1 && steps >= nsw {
            Ok(Some(format!("relaxation not converged in NSW = {nsw} ionic steps")))
        } else {
            Ok(None)
        }
    }

    /// Keep relaxing from where the last run stopped.
    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction> {
        if contcar_to_poscar(job, log)? {
            Ok(Correction::Fixed)
        } else {
            give_up(log, "ionic_divergence: no CONTCAR to continue from")
        }
    }
}

pub(super) struct PositiveEnergy;
pub(super) static POSITIVE_ENERGY: PositiveEnergy = PositiveEnergy;

impl Diagnose for PositiveEnergy {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        let Some((oszicar, _)) = read(job)? else {
            return Ok(None);
        };
        match oszicar.final_energy() {
            Some(energy) if energy > 0.0 => Ok(Some(format!("final energy F = {energy}"))),
            _ => Ok(None),
        }
    }

    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction> {
        let mut edit = IncarEdit::open(job, log)?;
        if edit.is("ALGO", "Normal") {
            return give_up(log, "positive_energy: ALGO = Normal already");
        }
        edit.set("ALGO", "Normal");
        edit.save()
    }
}
