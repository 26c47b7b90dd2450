use std::path::PathBuf;

use anyhow::Result;

use util::PathEncodingError;

use crate::fs::{same_contents, JOB_LOG};
use crate::job::Job;
use crate::joblog::{Action, JobLog};

/// Files every snapshot tries to save, besides the stage's program output,
/// its extra backup files and the queue std files.
pub const CORE_FILES: [&str; 6] = ["INCAR", "POSCAR", "CONTCAR", "KPOINTS", "OUTCAR", "OSZICAR"];

const SNAPSHOT_PREFIX: &str = "error_";

/// Takes numbered snapshots of a job's relevant files under `<job>/error_folder`.
/// The number of snapshots is the job's retry count.
#[derive(Debug)]
pub struct BackupWriter<'a> {
    job: &'a Job<'a>,
    log: JobLog<'a>,
}

impl<'a> BackupWriter<'a> {
    pub fn new(job: &'a Job<'a>) -> Self {
        Self {
            job,
            log: job.log(),
        }
    }

    /// How many snapshots the job has accumulated.
    pub fn retry_count(&self) -> Result<usize> {
        Ok(self.snapshots()?.len())
    }

    /// Save the current files into a new snapshot and return its path.
    /// If nothing changed since the newest snapshot, that one is returned instead.
    pub fn backup(&self) -> Result<PathBuf> {
        let fs = self.job.fs();
        let files = self.candidates()?;
        let latest = self.snapshots()?.pop();

        if let Some((n, dir)) = &latest {
            if self.unchanged_since(&files, dir)? {
                self.log.write(
                    Action::Backup,
                    &format!("files unchanged since {SNAPSHOT_PREFIX}{n}, reusing it"),
                )?;
                return Ok(dir.clone());
            }
        }

        let n = latest.map_or(1, |(n, _)| n + 1);
        let mut dir = PathBuf::new();
        fs.snapshot(self.job.path(), n, &mut dir);
        fs.create_dir(&dir)?;
        for name in &files {
            fs.copy(self.job.file(name), dir.join(name))?;
        }
        self.log.write(
            Action::Backup,
            &format!("saved {} to {SNAPSHOT_PREFIX}{n}", files.join(", ")),
        )?;
        Ok(dir)
    }

    /// Names of the files to save that currently exist in the job dir.
    fn candidates(&self) -> Result<Vec<String>> {
        let stage = self.job.stage();
        let mut names: Vec<String> = CORE_FILES.iter().map(|s| s.to_string()).collect();
        names.push(stage.program_output.clone());
        names.push(JOB_LOG.to_owned());
        names.extend(stage.extra_backup_files.iter().cloned());
        for std_file in [self.job.queue_stdout()?, self.job.queue_stderr()?]
            .into_iter()
            .flatten()
        {
            let name = std_file.file_name().and_then(|n| n.to_str());
            names.push(name.ok_or(PathEncodingError)?.to_owned());
        }
        names.sort();
        names.dedup();

        let mut present = Vec::with_capacity(names.len());
        for name in names {
            if self.job.file(&name).is_file() {
                present.push(name);
            } else {
                log::debug!("{:?}: no {} to back up", self.job.path(), name);
            }
        }
        Ok(present)
    }

    /// Same file names and contents, ignoring the job log which grows every cycle.
    fn unchanged_since(&self, files: &[String], snapshot: &std::path::Path) -> Result<bool> {
        let mut saved = self.job.fs().file_names(snapshot)?;
        saved.retain(|name| name != JOB_LOG);
        let files: Vec<&String> = files.iter().filter(|name| *name != JOB_LOG).collect();
        if saved.len() != files.len() || saved.iter().zip(&files).any(|(a, b)| a != *b) {
            return Ok(false);
        }
        for name in files {
            if !same_contents(&self.job.file(name), &snapshot.join(name))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Existing snapshots, sorted by number.
    fn snapshots(&self) -> Result<Vec<(usize, PathBuf)>> {
        let fs = self.job.fs();
        let mut archive = PathBuf::new();
        fs.error_archive(self.job.path(), &mut archive);
        if !fs.is_dir(&archive) {
            return Ok(Vec::new());
        }
        let mut found = Vec::with_capacity(8);
        for entry in fs.read_dir(&archive)? {
            let entry = entry?;
            let name = entry.file_name();
            let number = name
                .to_str()
                .and_then(|name| name.strip_prefix(SNAPSHOT_PREFIX))
                .and_then(|n| n.parse::<usize>().ok());
            if let (Some(n), true) = (number, entry.file_type()?.is_dir()) {
                found.push((n, entry.path()));
            }
        }
        found.sort();
        Ok(found)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::Fs;
    use crate::job::test::workflow;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_backup_dedup() -> Result<()> {
        let dir = tempdir()?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("extra_backup_files = vasprun.xml")?;
        let path = dir.path().join("Si/step_1_opt");
        fs::create_dir_all(&path)?;
        fs::write(path.join("INCAR"), "NBANDS = 16\n")?;
        fs::write(path.join("out"), "TOO FEW BANDS\n")?;
        fs::write(path.join("vasprun.xml"), "<xml/>")?;
        fs::write(path.join("vasp.out"), "")?;
        let job = Job::new(&fs_, &wf, &path)?;
        let backup = BackupWriter::new(&job);

        assert_eq!(0, backup.retry_count()?);
        let first = backup.backup()?;
        assert_eq!(path.join("error_folder/error_1"), first);
        assert!(first.join("vasprun.xml").is_file());
        assert!(first.join("vasp.out").is_file());
        assert!(!first.join("POSCAR").exists());

        // only the job log changed: same snapshot.
        assert_eq!(first, backup.backup()?);
        assert_eq!(1, backup.retry_count()?);

        fs::write(path.join("INCAR"), "NBANDS = 20\n")?;
        let second = backup.backup()?;
        assert_eq!(path.join("error_folder/error_2"), second);
        assert_eq!("NBANDS = 16\n", fs::read_to_string(first.join("INCAR"))?);
        assert_eq!(2, backup.retry_count()?);

        // a new file also counts as a change.
        fs::write(path.join("OSZICAR"), "")?;
        assert_eq!(path.join("error_folder/error_3"), backup.backup()?);
        Ok(())
    }
}
