use std::path::{Component, Path, PathBuf};

use anyhow::Result;

use status::Status;
use util::PathEncodingError;
use workflow::{FileMatcher, Stage, Workflow};

use crate::fs::Fs;
use crate::joblog::JobLog;
use crate::queue;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Job dir {0:?} is not inside a material folder under the root")]
    NotInMaterial(PathBuf),
    #[error("Job dir {0:?} doesn't belong to any stage of the workflow")]
    UnknownStage(PathBuf),
}

/// A job directory, bound to the stage that owns it.
#[derive(Debug, Clone)]
pub struct Job<'a> {
    path: PathBuf,
    material: PathBuf,
    stage: &'a Stage,
    fs: &'a Fs,
}

impl<'a> Job<'a> {
    /// Resolve `path` to its material folder and stage. The stage is the first
    /// path component below the material folder named like a stage's dir, so
    /// sub-directory jobs belong to the stage dir that contains them.
    pub fn new(fs: &'a Fs, workflow: &'a Workflow, path: &Path) -> Result<Self> {
        let rel = path
            .strip_prefix(fs.root())
            .map_err(|_| Error::NotInMaterial(path.to_path_buf()))?;
        let mut components = rel.components().filter_map(|c| match c {
            Component::Normal(name) => Some(name),
            _ => None,
        });
        let material = components
            .next()
            .ok_or_else(|| Error::NotInMaterial(path.to_path_buf()))?;
        let mut stage = None;
        for name in components {
            let name = name.to_str().ok_or(PathEncodingError)?;
            if let Some(found) = workflow.stage_by_dir_name(name) {
                stage = Some(found);
                break;
            }
        }
        let stage = stage.ok_or_else(|| Error::UnknownStage(path.to_path_buf()))?;
        Ok(Self {
            path: path.to_path_buf(),
            material: fs.root().join(material),
            stage,
            fs,
        })
    }

    /// Bind a job to a known stage without resolving it from the path.
    pub fn with_stage(fs: &'a Fs, stage: &'a Stage, material: &Path, path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            material: material.to_path_buf(),
            stage,
            fs,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn material(&self) -> &Path {
        &self.material
    }

    pub fn stage(&self) -> &'a Stage {
        self.stage
    }

    pub fn fs(&self) -> &'a Fs {
        self.fs
    }

    pub fn log(&self) -> JobLog<'a> {
        JobLog::new(self.fs, &self.path)
    }

    /// `<job>/<name>`
    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// `<job>/__<status>__`, if the status has a sentinel file.
    pub fn sentinel(&self, status: &Status) -> Option<PathBuf> {
        status.file_name().map(|name| self.path.join(name))
    }

    /// The tag stored in a sentinel, trimmed. Empty if the sentinel is empty or missing.
    pub fn read_tag(&self, status: &Status) -> Result<String> {
        match self.sentinel(status) {
            Some(path) if path.is_file() => Ok(self.fs.read_to_string(path)?.trim().to_owned()),
            _ => Ok(String::new()),
        }
    }

    /// Queue id recorded at submission, or `None` if the id file is gone.
    pub fn queue_id(&self) -> Result<Option<String>> {
        let id_file = self.file(&self.stage.queue.id_file);
        if !id_file.is_file() {
            return Ok(None);
        }
        let text = self.fs.read_to_string(&id_file)?;
        Ok(Some(queue::parse_queue_id(&text, &self.stage.queue.id_regex)?))
    }

    /// The queue-written stdout file, if present.
    pub fn queue_stdout(&self) -> Result<Option<PathBuf>> {
        self.matching_file(&self.stage.stdout)
    }

    /// The queue-written stderr file, if present.
    pub fn queue_stderr(&self) -> Result<Option<PathBuf>> {
        self.matching_file(&self.stage.stderr)
    }

    /// A running job is finished once the queue has written both of its std files.
    pub fn is_completed(&self) -> Result<bool> {
        Ok(self.queue_stdout()?.is_some() && self.queue_stderr()?.is_some())
    }

    /// With several matches (from earlier submissions) the last name in sort order wins.
    fn matching_file(&self, matcher: &FileMatcher) -> Result<Option<PathBuf>> {
        Ok(self
            .fs
            .file_names(&self.path)?
            .into_iter()
            .filter(|name| matcher.matches(name))
            .last()
            .map(|name| self.path.join(name)))
    }
}
