use std::path::{Path, PathBuf};

use super::Fs;

/// Written under the root dir after every cycle.
pub const STATUS_FILE: &str = "htc_job_status.txt";

/// Per-job action log, inside each job dir.
pub const JOB_LOG: &str = "htc_job.log";

/// Files an operator may drop into the root dir to steer the loop.
pub const CONTROL_SENTINELS: [&str; 7] = [
    "__stop__",
    "__update_now__",
    "__scan_all__",
    "__reload_workflow__",
    "__go_to_submission__",
    "__write_status__",
    "__change_signal_file__",
];

/// Utility fns for making common types of paths.
/// Some take the job dir as a prefix, others build from the root.
impl Fs {
    /// $ROOT/htc_job_status.txt
    pub fn status_file<'a>(&self, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(&self.root, STATUS_FILE, buf)
    }

    /// $ROOT/__signal__
    pub fn control_sentinel<'a>(&self, name: &str, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(&self.root, name, buf)
    }

    /// $ROOT/material/step_n_name
    pub fn stage_dir<'a>(&self, material: &Path, dir_name: &str, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(material, dir_name, buf)
    }

    /// $JOB/htc_job.log
    pub fn job_log<'a>(&self, job: &Path, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(job, JOB_LOG, buf)
    }

    /// $JOB/error_folder
    pub fn error_archive<'a>(&self, job: &Path, buf: &'a mut PathBuf) -> &'a Path {
        self.parts2(job, status::ERROR_ARCHIVE, buf)
    }

    /// $JOB/error_folder/error_n
    pub fn snapshot<'a>(&self, job: &Path, n: usize, buf: &'a mut PathBuf) -> &'a Path {
        self.parts3(job, status::ERROR_ARCHIVE, format!("error_{n}"), buf)
    }

    fn parts2<'a, T, U>(&self, p1: T, p2: U, buf: &'a mut PathBuf) -> &'a Path
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
    {
        buf.clear();
        buf.push(p1);
        buf.push(p2);
        &*buf
    }

    fn parts3<'a, T, U, V>(&self, p1: T, p2: U, p3: V, buf: &'a mut PathBuf) -> &'a Path
    where
        T: AsRef<Path>,
        U: AsRef<Path>,
        V: AsRef<Path>,
    {
        buf.clear();
        buf.push(p1);
        buf.push(p2);
        buf.push(p3);
        &*buf
    }
}
