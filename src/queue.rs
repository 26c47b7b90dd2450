use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use regex::Regex;

use workflow::Stage;

use crate::exec;
use crate::job::Job;
use crate::joblog::Action;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Queue id pattern /{pattern}/ matched {count} times, expected exactly once")]
    IdMatches { pattern: String, count: usize },
    #[error("Submission of {0:?} wrote no queue id file")]
    MissingIdFile(String),
}

/// Extract the queue id from submission output. The pattern must match
/// exactly once; its first capture group is the id, or the whole match
/// if the pattern has no groups.
pub fn parse_queue_id(text: &str, regex: &Regex) -> Result<String, Error> {
    let mut matches = regex.captures_iter(text);
    let (first, rest) = (matches.next(), matches.count());
    match first {
        Some(caps) if rest == 0 => {
            let id = caps.get(1).or_else(|| caps.get(0)).map_or("", |m| m.as_str());
            Ok(id.trim().to_owned())
        }
        _ => Err(Error::IdMatches {
            pattern: regex.as_str().to_owned(),
            count: usize::from(first.is_some()) + rest,
        }),
    }
}

/// Queue listings taken once per cycle, one per distinct query command.
/// A listing that couldn't be taken is `None`; every job is then considered present.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    listings: BTreeMap<String, Option<String>>,
}

impl QueueSnapshot {
    pub fn insert(&mut self, query: &str, listing: Option<String>) {
        self.listings.insert(query.to_owned(), listing);
    }

    /// Whether `id` shows up in the listing for `query`; `None` if unknown.
    pub fn contains(&self, query: &str, id: &str) -> Option<bool> {
        let listing = self.listings.get(query)?.as_ref()?;
        let dotted = format!("{id}.");
        Some(
            listing
                .split_whitespace()
                .any(|token| token == id || token.starts_with(&dotted)),
        )
    }
}

/// Runs the per-stage queue commands with bounded retries.
#[derive(Debug, Clone)]
pub struct QueueClient {
    retries: usize,
    retry_delay: Duration,
}

impl QueueClient {
    pub fn new(retries: usize, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
        }
    }

    /// Query the queue once for each distinct query command among `stages`.
    pub fn snapshot<'a, I>(&self, stages: I, dir: &Path) -> QueueSnapshot
    where
        I: IntoIterator<Item = &'a Stage>,
    {
        let mut snapshot = QueueSnapshot::default();
        for stage in stages {
            let query = &stage.queue.query;
            if snapshot.listings.contains_key(query) {
                continue;
            }
            let listing = match exec::run_with_retries(query, dir, self.retries, self.retry_delay) {
                Ok(output) => Some(output.stdout),
                Err(e) => {
                    log::warn!("queue query failed, treating all jobs as queued: {:#}", e);
                    None
                }
            };
            snapshot.insert(query, listing);
        }
        snapshot
    }

    /// Submit a job from inside its dir and return the queue id it was given.
    pub fn submit(&self, job: &Job) -> Result<String> {
        let queue = &job.stage().queue;
        let id_file = job.file(&queue.id_file);
        // a stale id from an earlier submission must not be mistaken for the new one.
        job.fs().remove_if_exists(&id_file)?;

        exec::run_with_retries(&queue.submit, job.path(), self.retries, self.retry_delay)
            .with_context(|| format!("submitting {:?}", job.path()))?;
        let id = job
            .queue_id()?
            .ok_or_else(|| Error::MissingIdFile(queue.id_file.clone()))?;
        job.log().write(Action::Submit, &format!("`{}` -> queue id {}", queue.submit, id))?;
        Ok(id)
    }

    /// Ask the queue to kill a job.
    pub fn kill(&self, job: &Job, id: &str) -> Result<()> {
        let cmd = format!("{} {}", job.stage().queue.kill, id);
        exec::run_with_retries(&cmd, job.path(), self.retries, self.retry_delay)?;
        job.log().write(Action::Kill, &format!("`{cmd}`"))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::Fs;
    use crate::job::test::workflow;
    use tempfile::tempdir;

    #[test]
    fn test_parse_queue_id() -> Result<()> {
        let re = Regex::new("Submitted batch job ([0-9]+)")?;
        assert_eq!("1234", parse_queue_id("Submitted batch job 1234\n", &re)?);
        assert!(parse_queue_id("nothing here", &re).is_err());
        let twice = "Submitted batch job 1\nSubmitted batch job 2\n";
        match parse_queue_id(twice, &re) {
            Err(Error::IdMatches { count, .. }) => assert_eq!(2, count),
            other => panic!("expected IdMatches, got {other:?}"),
        }

        let whole = Regex::new("[0-9]+\\.pbs")?;
        assert_eq!("77.pbs", parse_queue_id("77.pbs", &whole)?);
        Ok(())
    }

    #[test]
    fn test_snapshot_contains() {
        let mut snapshot = QueueSnapshot::default();
        snapshot.insert("squeue", Some("JOBID NAME\n1234 vasp\n5678.pbs01 vasp\n".to_owned()));
        snapshot.insert("broken", None);
        assert_eq!(Some(true), snapshot.contains("squeue", "1234"));
        assert_eq!(Some(true), snapshot.contains("squeue", "5678"));
        assert_eq!(Some(false), snapshot.contains("squeue", "123"));
        assert_eq!(None, snapshot.contains("broken", "1234"));
        assert_eq!(None, snapshot.contains("never-run", "1234"));
    }

    #[test]
    fn test_submit_and_kill() -> Result<()> {
        let dir = tempdir()?;
        let fs = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let path = dir.path().join("Si/step_1_opt");
        std::fs::create_dir_all(&path)?;
        std::fs::write(path.join("job_id"), "Submitted batch job 1\n")?;
        let job = Job::new(&fs, &wf, &path)?;

        let client = QueueClient::new(0, Duration::ZERO);
        assert_eq!("7", client.submit(&job)?);
        client.kill(&job, "7")?;
        let log = fs.read_to_string(path.join("htc_job.log"))?;
        assert!(log.contains("[submit]"));
        assert!(log.contains("[kill] `true 7`"));

        let snapshot = client.snapshot(wf.stages(), dir.path());
        assert_eq!(Some(true), snapshot.contains("echo 7", "7"));
        Ok(())
    }
}
