use std::path::PathBuf;

use anyhow::Result;

use status::{Buckets, Status, StatusChange};
use workflow::Workflow;

use crate::fs::Fs;
use crate::job::Job;
use crate::joblog::Action;
use crate::machine;

pub const STOP: &str = "__stop__";
pub const UPDATE_NOW: &str = "__update_now__";
pub const SCAN_ALL: &str = "__scan_all__";
pub const RELOAD_WORKFLOW: &str = "__reload_workflow__";
pub const GO_TO_SUBMISSION: &str = "__go_to_submission__";
pub const WRITE_STATUS: &str = "__write_status__";
pub const CHANGE_SIGNAL: &str = "__change_signal_file__";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Missing key '{0}' in {CHANGE_SIGNAL}")]
    MissingKey(&'static str),
    #[error("Invalid no_of_changes '{0}' in {CHANGE_SIGNAL}: expected a number or 'all'")]
    InvalidCount(String),
}

/// Bulk re-classification requested through `__change_signal_file__`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub from: Status,
    pub to: Status,
    /// `None` means every job in the `from` bucket
    pub count: Option<usize>,
}

impl ChangeSignal {
    pub fn parse(text: &str) -> Result<Self> {
        let mut from = None;
        let mut to = None;
        let mut count = None;
        for kv in syntax::parse_key_values(text)? {
            match kv.key.to_ascii_lowercase().as_str() {
                "old_signal_file" => from = Some(parse_status(kv.val)),
                "new_signal_file" => to = Some(parse_status(kv.val)),
                "no_of_changes" => count = Some(kv.val.trim()),
                other => log::warn!("ignoring unknown key '{other}' in {CHANGE_SIGNAL}"),
            }
        }
        let count = match count.ok_or(Error::MissingKey("no_of_changes"))? {
            all if all.eq_ignore_ascii_case("all") => None,
            n => Some(n.parse().map_err(|_| Error::InvalidCount(n.to_owned()))?),
        };
        Ok(Self {
            from: from.ok_or(Error::MissingKey("old_signal_file"))?,
            to: to.ok_or(Error::MissingKey("new_signal_file"))?,
            count,
        })
    }

    /// Move up to `count` jobs, in path order, from one bucket to the other.
    /// Jobs that can't be moved are skipped with a warning.
    pub fn apply(&self, fs: &Fs, wf: &Workflow, buckets: &Buckets) -> Vec<StatusChange> {
        let jobs = buckets.get(&self.from);
        let take = self.count.unwrap_or(jobs.len()).min(jobs.len());
        let mut changes = Vec::with_capacity(take);
        for path in &jobs[..take] {
            let moved = Job::new(fs, wf, path).and_then(|job| {
                let log = job.log();
                log.write(
                    Action::Manual,
                    &format!("operator override {} -> {}", self.from, self.to),
                )?;
                machine::force(&job, &log, self.from.clone(), self.to.clone(), "")
            });
            match moved {
                Ok(change) => changes.push(change),
                Err(e) => log::warn!("could not re-classify {:?}: {:#}", path, e),
            }
        }
        changes
    }
}

/// Accept both `manual` and `__manual__`.
fn parse_status(text: &str) -> Status {
    let text = text.trim();
    Status::from_file_name(text).unwrap_or_else(|| Status::from_name(text))
}

/// Control sentinels found in the root dir at the start of a cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    pub stop: bool,
    pub update_now: bool,
    pub scan_all: bool,
    pub reload_workflow: bool,
    pub go_to_submission: bool,
    pub write_status: bool,
    pub change_signal: Option<ChangeSignal>,
}

impl Signals {
    pub fn read(fs: &Fs) -> Result<Self> {
        let mut buf = PathBuf::new();
        let mut present = |name: &str| fs.exists(fs.control_sentinel(name, &mut buf));
        let mut signals = Self {
            stop: present(STOP),
            update_now: present(UPDATE_NOW),
            scan_all: present(SCAN_ALL),
            reload_workflow: present(RELOAD_WORKFLOW),
            go_to_submission: present(GO_TO_SUBMISSION),
            write_status: present(WRITE_STATUS),
            change_signal: None,
        };
        let change = fs.control_sentinel(CHANGE_SIGNAL, &mut buf);
        if fs.is_file(change) {
            let text = fs.read_to_string(change)?;
            // a typo in the file shouldn't take the loop down; it stays until fixed.
            match ChangeSignal::parse(&text) {
                Ok(signal) => signals.change_signal = Some(signal),
                Err(e) => log::warn!("ignoring {:?}: {:#}", change, e),
            }
        }
        Ok(signals)
    }

    /// Names of the signals that were applied and should now be deleted.
    /// `__stop__` is left in place so a restarted loop stops again.
    pub fn consumable(&self) -> Vec<&'static str> {
        [
            (self.update_now, UPDATE_NOW),
            (self.scan_all, SCAN_ALL),
            (self.reload_workflow, RELOAD_WORKFLOW),
            (self.go_to_submission, GO_TO_SUBMISSION),
            (self.write_status, WRITE_STATUS),
            (self.change_signal.is_some(), CHANGE_SIGNAL),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect()
    }

    pub fn consume(&self, fs: &Fs) -> Result<()> {
        let mut buf = PathBuf::new();
        for name in self.consumable() {
            fs.remove_if_exists(fs.control_sentinel(name, &mut buf))?;
            log::info!("consumed control signal {name}");
        }
        Ok(())
    }

    /// Checked between the phases of a cycle.
    pub fn stop_requested(fs: &Fs) -> bool {
        let mut buf = PathBuf::new();
        fs.exists(fs.control_sentinel(STOP, &mut buf))
    }

    /// Poll for `__update_now__` or `__stop__`, which cut the wait short.
    pub fn interrupts_sleep(fs: &Fs) -> bool {
        let mut buf = PathBuf::new();
        fs.exists(fs.control_sentinel(UPDATE_NOW, &mut buf))
            || fs.exists(fs.control_sentinel(STOP, &mut buf))
    }
}
