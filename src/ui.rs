use colored::Colorize;

use status::{Buckets, Status};
use util::Timer;

use crate::settings::Settings;

/// All user-facing output of the distinguished worker goes through this struct.
pub struct Ui {
    /// -v setting, displays extra text info to user
    pub verbose: bool,
    /// keeps track of time for each cycle
    timer: Timer,
}

impl Ui {
    pub fn new(settings: &Settings) -> Self {
        Self {
            verbose: settings.verbose > 0,
            timer: Timer::now(),
        }
    }

    pub fn start_timer(&mut self) {
        if self.verbose {
            self.timer.reset();
        }
    }

    pub fn print_elapsed(&self, phase: &str) -> Result<(), std::time::SystemTimeError> {
        if self.verbose {
            self.timer.print_elapsed(phase)
        } else {
            Ok(())
        }
    }

    pub fn verbose_progress(&self, msg: &str) {
        if self.verbose {
            eprint!("{}... ", msg.magenta());
        }
    }

    pub fn done(&self) {
        if self.verbose {
            eprintln!("{}.", "done".green());
        }
    }

    pub fn signal(&self, name: &str) {
        eprintln!("{} {}", "Control signal".cyan(), name);
    }

    /// One line per cycle, with the counts that matter most.
    pub fn cycle_summary(&self, cycle: usize, buckets: &Buckets, submitted: usize, faults: usize) {
        let count = |status: &Status| buckets.count(status);
        let waiting = count(&Status::Ready) + count(&Status::PriorReady) + count(&Status::Vis);
        let done = count(&Status::Done)
            + count(&Status::DoneCleanedAnalyzed)
            + count(&Status::DoneFailedToCleanAnalyze);
        let mut line = format!(
            "cycle {cycle}: {} running, {} waiting, {} submitted, {} done",
            count(&Status::Running),
            waiting,
            submitted,
            done,
        );
        let errors = count(&Status::Error) + count(&Status::Killed);
        if errors > 0 {
            line.push_str(&format!(", {} {}", errors, "in error".yellow()));
        }
        let manual = count(&Status::Manual);
        if manual > 0 {
            line.push_str(&format!(", {} {}", manual, "manual".red()));
        }
        if faults > 0 {
            line.push_str(&format!(", {} {}", faults, "new faults".red()));
        }
        eprintln!("{line}");
    }

    /// Full per-bucket counts, used for status-only and dry runs.
    pub fn bucket_table(&self, buckets: &Buckets) {
        for (status, jobs) in buckets.iter() {
            eprintln!("{:>30} {}", status.to_string().bold(), jobs.len());
        }
        eprintln!("{:>30} {}", "total".bold(), buckets.total());
    }

    pub fn finished(&self, reason: &str) {
        eprintln!("\n{} {}.", "Finished:".green(), reason);
    }

    pub fn stopped(&self, reason: &str) {
        eprintln!("\n{} {}.", "Stopped:".yellow(), reason);
    }
}
