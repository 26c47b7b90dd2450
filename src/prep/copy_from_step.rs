use std::path::{Path, PathBuf};

use anyhow::Result;

use status::{Status, StatusChange};
use workflow::{Stage, Workflow};

use crate::fs::Fs;
use crate::incar::Incar;
use crate::job::Job;
use crate::joblog::Action;
use crate::machine;

use super::{Candidate, Error};

/// Fills a freshly created job dir with its inputs.
pub trait InputPreparer: Sync {
    /// `source` is the dir inputs come from: the prerequisite step's job dir,
    /// or the material folder itself for step 0.
    fn prepare(&self, job: &Job, source: &Path) -> Result<()>;
}

/// Copies the stage's input files from its copy-from step, then applies the
/// stage's INCAR edits and drops in the submission script.
#[derive(Debug, Default, Clone, Copy)]
pub struct CopyFromStep;

impl InputPreparer for CopyFromStep {
    fn prepare(&self, job: &Job, source: &Path) -> Result<()> {
        let fs = job.fs();
        let stage = job.stage();
        let log = job.log();

        for name in &stage.copy_files {
            let from = if name == "POSCAR" && stage.contcar_to_poscar && stage.copy_which_step != 0 {
                "CONTCAR"
            } else {
                name.as_str()
            };
            let src = source.join(from);
            if !src.is_file() {
                return Err(Error::MissingInput(src).into());
            }
            fs.copy(&src, job.file(name))?;
        }
        log.write(
            Action::Prepare,
            &format!("copied {} from {:?}", stage.copy_files.join(", "), source),
        )?;

        let incar_path = job.file("INCAR");
        let mut incar = if incar_path.is_file() {
            Incar::read(fs, &incar_path)?
        } else {
            Incar::default()
        };
        for (key, val) in &stage.new_incar_tags {
            incar.set(key, val);
        }
        for key in &stage.remove_incar_tags {
            incar.remove(key);
        }
        incar.write(fs, &incar_path)?;

        if let Some(script) = &stage.submission_script {
            let src = fs.root().join(script);
            let name = src.file_name().ok_or_else(|| Error::MissingInput(src.clone()))?;
            if !src.is_file() {
                return Err(Error::MissingInput(src).into());
            }
            fs.copy(&src, job.file(&name.to_string_lossy()))?;
        }
        Ok(())
    }
}

fn source_dir(wf: &Workflow, stage: &Stage, material: &Path) -> Result<PathBuf> {
    match stage.copy_which_step {
        0 => Ok(material.to_path_buf()),
        step => {
            let from = wf.stage(step).ok_or(Error::UnknownStep(step))?;
            Ok(material.join(&from.dir_name))
        }
    }
}

/// Create one job dir and bring it to `ready`/`prior_ready`, or leave it
/// in `vis` if the stage wants inputs checked by hand.
/// A job whose inputs can't be prepared ends up in `manual`.
pub fn prepare_job(
    fs: &Fs,
    wf: &Workflow,
    preparer: &dyn InputPreparer,
    candidate: &Candidate,
) -> Result<StatusChange> {
    let stage = wf
        .stage(candidate.step_no)
        .ok_or(Error::UnknownStep(candidate.step_no))?;
    let job = Job::with_stage(fs, stage, &candidate.material, &candidate.path);
    let log = job.log();

    let source = source_dir(wf, stage, job.material())?;

    // the placeholder INCAR makes the dir a job to the scanner before it has a
    // status, so an interrupted preparation is never left behind unseen.
    fs.create_dir(job.path())?;
    fs.write_file(job.file(status::STAGE_INPUT), "")?;
    if let Some(vis) = job.sentinel(&Status::Vis) {
        fs.write_file(vis, "")?;
    }

    let to = match preparer.prepare(&job, &source) {
        Err(e) => {
            log.write(Action::Manual, &format!("input preparation failed: {e:#}"))?;
            machine::transition(&job, &log, Status::Vis, Status::Manual, "")?;
            Status::Manual
        }
        Ok(()) if stage.manual_input_check => {
            log.write(Action::Prepare, "waiting for a manual input check")?;
            Status::Vis
        }
        Ok(()) => {
            let to = if stage.priority_submission {
                Status::PriorReady
            } else {
                Status::Ready
            };
            machine::transition(&job, &log, Status::Vis, to.clone(), "")?;
            to
        }
    };
    Ok(StatusChange::new(job.path(), Status::Other, to))
}
