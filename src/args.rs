use clap::Parser;

const CMD_NAME: &str = "htcf";
const DEFAULT_ROOT: &str = ".";
const DEFAULT_WORKFLOW: &str = "htc_setup";

/// Stores our command-line args format.
#[derive(Parser, Debug)]
#[command(name = CMD_NAME, version, about = None, long_about = None)]
pub struct Args {
    /// Root directory holding one folder per material
    #[arg(short, long, value_name = "DIR", default_value = DEFAULT_ROOT)]
    #[arg(env = "HTC_FLOW_ROOT")]
    pub root: String,

    /// Workflow definition file, relative to the root dir unless absolute
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_WORKFLOW)]
    #[arg(env = "HTC_FLOW_WORKFLOW")]
    pub workflow: String,

    /// Number of cooperating workers
    #[arg(short = 'j', long, value_name = "N", default_value_t = 1)]
    pub workers: usize,

    /// Maximum number of jobs in the queue at once
    #[arg(long, value_name = "N", default_value_t = 50)]
    pub max_running: usize,

    /// Maximum number of prepared jobs waiting for submission
    #[arg(long, value_name = "N", default_value_t = 100)]
    pub max_ready: usize,

    /// Seconds to sleep between cycles
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub interval: u64,

    /// Stop after this many consecutive cycles without any status change
    #[arg(long, value_name = "N", default_value_t = 1000)]
    pub stagnation_limit: usize,

    /// Consecutive queue listings a running job may be missing from before it's declared lost
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub queue_miss_limit: u32,

    /// Retries for failed queue commands
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub command_retries: usize,

    /// Run exactly one cycle
    #[arg(long)]
    pub once: bool,

    /// Scan the job tree, write the status file and exit
    #[arg(long)]
    pub status_only: bool,

    /// Dry run; scan and report but don't modify anything
    #[arg(short = 'n', long)]
    pub dry_run: bool,

    /// Print additional info (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
