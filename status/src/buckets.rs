use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::Status;

/// One job moving from one bucket to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub path: PathBuf,
    pub from: Status,
    pub to: Status,
}

impl StatusChange {
    pub fn new(path: &Path, from: Status, to: Status) -> Self {
        Self {
            path: path.to_path_buf(),
            from,
            to,
        }
    }
}

/// Job paths grouped by status name. Each path list is kept sorted,
/// so two scans of an unchanged tree compare equal.
#[derive(Debug, Default, Clone, PartialEq, Eq, Hash)]
pub struct Buckets {
    map: BTreeMap<String, Vec<PathBuf>>,
}

impl Buckets {
    /// Add `path` to the bucket for `status`, keeping the bucket sorted.
    pub fn insert(&mut self, status: &Status, path: PathBuf) {
        let bucket = self.map.entry(status.name().to_owned()).or_default();
        if let Err(pos) = bucket.binary_search(&path) {
            bucket.insert(pos, path);
        }
    }

    /// Jobs in the bucket for `status` (empty if there are none).
    pub fn get(&self, status: &Status) -> &[PathBuf] {
        self.map
            .get(status.name())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn count(&self, status: &Status) -> usize {
        self.get(status).len()
    }

    /// Total number of jobs across all buckets.
    pub fn total(&self) -> usize {
        self.map.values().map(Vec::len).sum()
    }

    /// Number of jobs the orchestrator still has to act on.
    pub fn active(&self) -> usize {
        self.iter()
            .filter(|(status, _)| status.is_active())
            .map(|(_, jobs)| jobs.len())
            .sum()
    }

    /// The status a job is currently filed under, if any.
    pub fn status_of(&self, path: &Path) -> Option<Status> {
        self.map
            .iter()
            .find(|(_, jobs)| jobs.binary_search_by(|p| p.as_path().cmp(path)).is_ok())
            .map(|(name, _)| Status::from_name(name))
    }

    /// Iterate over non-empty buckets, in bucket-name order.
    pub fn iter(&self) -> impl Iterator<Item = (Status, &[PathBuf])> {
        self.map
            .iter()
            .filter(|(_, jobs)| !jobs.is_empty())
            .map(|(name, jobs)| (Status::from_name(name), jobs.as_slice()))
    }

    /// Move a job between buckets. A job that isn't in `from` (e.g. because a
    /// concurrent control signal already moved it) is simply filed under `to`.
    pub fn apply(&mut self, change: &StatusChange) {
        self.remove(&change.from, &change.path);
        self.insert(&change.to, change.path.clone());
    }

    pub fn remove(&mut self, status: &Status, path: &Path) -> bool {
        let Some(bucket) = self.map.get_mut(status.name()) else {
            return false;
        };
        let Ok(pos) = bucket.binary_search_by(|p| p.as_path().cmp(path)) else {
            return false;
        };
        bucket.remove(pos);
        if bucket.is_empty() {
            self.map.remove(status.name());
        }
        true
    }

    /// Fold another partial view into this one.
    pub fn merge(&mut self, other: Buckets) {
        for (name, jobs) in other.map {
            let status = Status::from_name(&name);
            for job in jobs {
                self.insert(&status, job);
            }
        }
    }

    /// Hash of the full contents, used to notice a loop that has stopped making progress.
    pub fn digest(&self) -> u64 {
        let mut hasher = rustc_hash::FxHasher::default();
        for (name, jobs) in &self.map {
            if !jobs.is_empty() {
                name.hash(&mut hasher);
                jobs.hash(&mut hasher);
            }
        }
        hasher.finish()
    }
}
