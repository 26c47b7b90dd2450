use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use walkdir::WalkDir;

use util::PathEncodingError;

use crate::{Buckets, Status, ERROR_ARCHIVE, MATERIAL_COMPLETE, STAGE_INPUT};

/// Which part of the tree to scan.
#[derive(Debug, Clone)]
pub enum ScanScope {
    /// every material folder under the root
    All,
    /// only these material folders
    Materials(Vec<PathBuf>),
    /// only these job directories
    Jobs(Vec<PathBuf>),
}

/// Walks a root directory of material folders and files every job
/// directory into exactly one bucket. Never writes to disk.
#[derive(Debug, Clone)]
pub struct Scanner {
    root: PathBuf,
    /// if true, material folders marked complete are scanned anyway
    ignore_complete: bool,
}

impl Scanner {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            ignore_complete: false,
        }
    }

    /// Scan material folders even if they hold a `__complete__` marker.
    pub fn ignore_complete(mut self, ignore: bool) -> Self {
        self.ignore_complete = ignore;
        self
    }

    /// Direct, non-hidden subdirectories of the root, sorted.
    pub fn material_folders(&self) -> Result<Vec<PathBuf>> {
        let mut folders = Vec::with_capacity(64);
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("while listing root directory {:?}", self.root))?;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_str().ok_or(PathEncodingError)?;
            if name.starts_with('.') || !entry.file_type()?.is_dir() {
                continue;
            }
            folders.push(entry.path());
        }
        folders.sort();
        Ok(folders)
    }

    /// Classify every job in `scope`.
    pub fn scan(&self, scope: &ScanScope) -> Result<Buckets> {
        let mut buckets = Buckets::default();
        match scope {
            ScanScope::All => {
                for material in self.material_folders()? {
                    self.scan_material(&material, &mut buckets)?;
                }
            }
            ScanScope::Materials(materials) => {
                for material in materials {
                    self.scan_material(material, &mut buckets)?;
                }
            }
            ScanScope::Jobs(jobs) => {
                for job in jobs {
                    // a job dir can vanish under external cleanup; it just drops out.
                    if job.join(STAGE_INPUT).is_file() {
                        buckets.insert(&classify(job)?, job.clone());
                    }
                }
            }
        }
        Ok(buckets)
    }

    fn scan_material(&self, material: &Path, buckets: &mut Buckets) -> Result<()> {
        if !self.ignore_complete && material.join(MATERIAL_COMPLETE).exists() {
            log::trace!("skipping complete material folder {:?}", material);
            return Ok(());
        }
        for job in job_dirs(material)? {
            let status = classify(&job)?;
            buckets.insert(&status, job);
        }
        Ok(())
    }
}

/// Every directory below `material` that holds a stage-input file,
/// excluding anything inside an error archive.
pub fn job_dirs(material: &Path) -> Result<Vec<PathBuf>> {
    let mut jobs = Vec::with_capacity(8);
    let walker = WalkDir::new(material)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.file_name() != ERROR_ARCHIVE);
    for entry in walker {
        let entry = entry.with_context(|| format!("while walking {:?}", material))?;
        if entry.file_type().is_dir() && entry.path().join(STAGE_INPUT).is_file() {
            jobs.push(entry.into_path());
        }
    }
    Ok(jobs)
}

/// Determine the status of one job directory.
///
/// Known sentinels are checked in [`Status::PRIORITY`] order and the first one
/// present wins. Failing that, any other `__tag__` file names the bucket; if
/// there are several, the lexicographically smallest tag wins. A directory with
/// no sentinel at all is [`Status::Other`].
pub fn classify(job: &Path) -> Result<Status> {
    let mut names = Vec::with_capacity(32);
    let entries =
        fs::read_dir(job).with_context(|| format!("while listing job directory {:?}", job))?;
    for entry in entries {
        let entry = entry?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_owned());
        }
    }

    for status in Status::PRIORITY.iter() {
        if let Some(file_name) = status.file_name() {
            if names.iter().any(|name| *name == file_name) {
                return Ok(status.clone());
            }
        }
    }

    let custom = names
        .iter()
        .filter_map(|name| Status::from_file_name(name))
        .filter(|status| matches!(status, Status::Custom(_)))
        .min();
    Ok(custom.unwrap_or(Status::Other))
}
