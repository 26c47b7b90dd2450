use std::fmt;

/// Every status a job directory can be in. All variants except [`Status::Other`]
/// correspond to a sentinel file named `__<name>__`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Status {
    Manual,
    Skipped,
    DoneCleanedAnalyzed,
    DoneFailedToCleanAnalyze,
    Done,
    Killed,
    Error,
    Running,
    SubDirCal,
    PriorReady,
    Ready,
    Vis,
    /// Any other `__tag__` file, e.g. a checker-specific terminal tag.
    Custom(String),
    /// No sentinel at all.
    Other,
}

impl Status {
    /// Known sentinels, in the order the scanner checks them:
    /// terminal/failed states, then in-flight states, then not-yet-submitted ones.
    pub const PRIORITY: [Status; 12] = [
        Status::Manual,
        Status::Skipped,
        Status::DoneCleanedAnalyzed,
        Status::DoneFailedToCleanAnalyze,
        Status::Done,
        Status::Killed,
        Status::Error,
        Status::Running,
        Status::SubDirCal,
        Status::PriorReady,
        Status::Ready,
        Status::Vis,
    ];

    /// Bucket name, which is also the sentinel name without underscores.
    pub fn name(&self) -> &str {
        match self {
            Status::Manual => "manual",
            Status::Skipped => "skipped",
            Status::DoneCleanedAnalyzed => "done_cleaned_analyzed",
            Status::DoneFailedToCleanAnalyze => "done_failed_to_clean_analyze",
            Status::Done => "done",
            Status::Killed => "killed",
            Status::Error => "error",
            Status::Running => "running",
            Status::SubDirCal => "sub_dir_cal",
            Status::PriorReady => "prior_ready",
            Status::Ready => "ready",
            Status::Vis => "vis",
            Status::Custom(tag) => tag,
            Status::Other => "other",
        }
    }

    /// Inverse of [`Status::name`]. Unknown names become [`Status::Custom`].
    pub fn from_name(name: &str) -> Self {
        Self::PRIORITY
            .iter()
            .find(|status| status.name() == name)
            .cloned()
            .unwrap_or_else(|| match name {
                "other" => Status::Other,
                tag => Status::Custom(tag.to_owned()),
            })
    }

    /// `__<name>__`; `None` for [`Status::Other`], which has no file.
    pub fn file_name(&self) -> Option<String> {
        match self {
            Status::Other => None,
            status => Some(format!("__{}__", status.name())),
        }
    }

    /// Interpret a file name as a sentinel, if it is shaped like `__<name>__`.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let name = file_name.strip_prefix("__")?.strip_suffix("__")?;
        if name.is_empty() || name.starts_with('_') || name.ends_with('_') {
            return None;
        }
        Some(Self::from_name(name))
    }

    /// A final status is never left by this system on its own.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            Status::Done
                | Status::DoneCleanedAnalyzed
                | Status::DoneFailedToCleanAnalyze
                | Status::Skipped
        )
    }

    /// A job in one of these states satisfies a dependency on it.
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            Status::Done | Status::DoneCleanedAnalyzed | Status::DoneFailedToCleanAnalyze
        )
    }

    /// true while the orchestrator still has work to do for the job.
    /// `manual`, custom tags and unclassified dirs wait for a human.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Status::Vis
                | Status::Ready
                | Status::PriorReady
                | Status::Running
                | Status::SubDirCal
                | Status::Error
                | Status::Killed
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
