use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::args::Args;

/// Pause between attempts of a failing queue command.
const RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("--workers must be at least 1")]
    NoWorkers,
    #[error("--queue-miss-limit must be at least 1")]
    NoMissLimit,
    #[error("--stagnation-limit must be at least 1")]
    NoStagnationLimit,
}

/// Settings are like Args, except all the logic has
/// been applied so e.g. defaults are added in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub root: PathBuf,
    pub workflow: PathBuf,
    pub workers: usize,
    pub max_running: usize,
    pub max_ready: usize,
    pub interval: Duration,
    pub stagnation_limit: usize,
    pub queue_miss_limit: u32,
    pub command_retries: usize,
    pub retry_delay: Duration,
    pub once: bool,
    pub status_only: bool,
    pub dry_run: bool,
    pub verbose: u8,
}

impl Settings {
    /// Status-only and dry runs never touch the job tree.
    pub fn read_only(&self) -> bool {
        self.status_only || self.dry_run
    }
}

impl TryFrom<Args> for Settings {
    type Error = anyhow::Error;
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        if args.workers == 0 {
            return Err(Error::NoWorkers.into());
        }
        if args.queue_miss_limit == 0 {
            return Err(Error::NoMissLimit.into());
        }
        if args.stagnation_limit == 0 {
            return Err(Error::NoStagnationLimit.into());
        }

        let root = PathBuf::from(&args.root)
            .canonicalize()
            .with_context(|| format!("while resolving root directory {:?}", args.root))?;
        let workflow = root.join(&args.workflow);

        Ok(Self {
            root,
            workflow,
            workers: args.workers,
            max_running: args.max_running,
            max_ready: args.max_ready,
            interval: Duration::from_secs(args.interval),
            stagnation_limit: args.stagnation_limit,
            queue_miss_limit: args.queue_miss_limit,
            command_retries: args.command_retries,
            retry_delay: RETRY_DELAY,
            once: args.once,
            status_only: args.status_only,
            dry_run: args.dry_run,
            verbose: args.verbose,
        })
    }
}
