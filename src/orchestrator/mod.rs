use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

use status::{Buckets, ScanScope, Scanner, Status, StatusChange, MATERIAL_COMPLETE};
use workflow::Workflow;

use crate::fs::Fs;
use crate::job::Job;
use crate::joblog::Action;
use crate::machine::{self, Outcome, Updater};
use crate::prep::{self, Candidate, InputPreparer};
use crate::queue::{QueueClient, QueueSnapshot};
use crate::settings::Settings;
use crate::ui::Ui;

/// Collective operations between workers
mod comm;
pub use comm::{group, Comm};

/// Operator control sentinels in the root dir
mod control;
pub use control::{ChangeSignal, Signals};

mod faults;
use faults::Faults;

/// Global status file
mod report;
pub use report::write_status;

/// How often the root worker looks for control signals while sleeping.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Buckets updated each cycle, in this order.
const UPDATE_ORDER: [Status; 5] = [
    Status::Running,
    Status::Error,
    Status::Killed,
    Status::SubDirCal,
    Status::Done,
];

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Worker {rank} failed: {msg}")]
    WorkerFailed { rank: usize, msg: String },
}

/// What every worker shares read-only.
pub struct Context<'a> {
    pub settings: &'a Settings,
    pub fs: &'a Fs,
    pub queue: QueueClient,
    pub preparer: &'a dyn InputPreparer,
}

/// Why the loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// no job is left outside a terminal bucket
    Finished,
    /// nothing changed for `--stagnation-limit` cycles
    Stagnated,
    /// `__stop__` was found
    Stopped,
    /// `--once`
    SingleCycle,
}

/// The state of the job tree every worker agrees on between phases.
#[derive(Debug, Clone, Default)]
struct View {
    buckets: Buckets,
    /// consecutive queue listings each running job was missing from
    misses: BTreeMap<PathBuf, u32>,
}

impl View {
    fn apply(&mut self, path: &Path, outcome: Outcome) {
        if let Some(change) = &outcome.change {
            self.buckets.apply(change);
        }
        match outcome.misses {
            Some(0) => {
                self.misses.remove(path);
            }
            Some(n) => {
                self.misses.insert(path.to_path_buf(), n);
            }
            None => (),
        }
    }
}

/// What one worker did to its shard of a phase.
#[derive(Debug, Clone, Default)]
struct ShardReport {
    outcomes: Vec<(PathBuf, Outcome)>,
    faults: Vec<(PathBuf, String)>,
}

impl ShardReport {
    fn changed(&mut self, change: StatusChange) {
        let path = change.path.clone();
        self.outcomes.push((
            path,
            Outcome {
                change: Some(change),
                misses: Some(0),
            },
        ));
    }
}

/// Counts consecutive cycles that ended with the same bucket map.
#[derive(Debug, Default)]
struct Stagnation {
    last: Option<u64>,
    unchanged: usize,
}

impl Stagnation {
    fn observe(&mut self, digest: u64) -> usize {
        if self.last == Some(digest) {
            self.unchanged += 1;
        } else {
            self.last = Some(digest);
            self.unchanged = 0;
        }
        self.unchanged
    }
}

/// One member of the worker group. Every worker runs the same cycle;
/// worker 0 additionally talks to the queue and the operator.
pub struct Worker<'a> {
    comm: Comm,
    ctx: &'a Context<'a>,
    workflow: Workflow,
    /// material folders taking part in this cycle
    materials: Vec<PathBuf>,
    view: View,
    faults: Faults,
    ui: Option<Ui>,
}

impl<'a> Worker<'a> {
    pub fn new(comm: Comm, ctx: &'a Context<'a>, workflow: Workflow) -> Self {
        let ui = comm.is_root().then(|| Ui::new(ctx.settings));
        Self {
            comm,
            ctx,
            workflow,
            materials: Vec::with_capacity(0),
            view: View::default(),
            faults: Faults::default(),
            ui,
        }
    }

    /// Run cycles until the job tree is finished, stuck or stopped.
    /// All workers return the same [`Exit`], or all fail together.
    pub fn run(mut self) -> Result<Exit> {
        let mut stagnation = Stagnation::default();
        let mut cycle = 0;
        loop {
            cycle += 1;
            if let Some(ui) = &mut self.ui {
                ui.start_timer();
            }
            log::debug!("worker {} starting cycle {cycle}", self.comm.rank());

            let fs = self.ctx.fs;
            let signals = self.share(|| Signals::read(fs))?;
            self.announce(&signals);
            if signals.stop {
                if let Some(ui) = &self.ui {
                    ui.stopped("found __stop__ in the root directory");
                }
                return Ok(Exit::Stopped);
            }
            if signals.reload_workflow {
                self.reload_workflow()?;
            }

            self.scan(signals.scan_all)?;
            if signals.write_status {
                let buckets = &self.view.buckets;
                self.share(|| write_status(fs, buckets, cycle))?;
            }
            if let Some(change) = &signals.change_signal {
                self.change_signals(change)?;
            }

            if !signals.go_to_submission {
                if self.stop_raised(&signals)? {
                    return Ok(Exit::Stopped);
                }
                self.update()?;
                self.mark_complete()?;
                if self.stop_raised(&signals)? {
                    return Ok(Exit::Stopped);
                }
                self.prepare()?;
            }
            if self.stop_raised(&signals)? {
                return Ok(Exit::Stopped);
            }
            let submitted = self.submit()?;

            let finish = self
                .comm
                .is_root()
                .then(|| self.finish_cycle(cycle, &signals, submitted));
            self.share_result(finish)?;

            let exit = if self.view.buckets.active() == 0 {
                Some(Exit::Finished)
            } else if stagnation.observe(self.view.buckets.digest()) >= self.ctx.settings.stagnation_limit {
                Some(Exit::Stagnated)
            } else if self.ctx.settings.once {
                Some(Exit::SingleCycle)
            } else {
                None
            };
            // all views are identical, but leave together even if they somehow aren't.
            if self.comm.any(exit.is_some())? {
                let exit = exit.unwrap_or(Exit::Stopped);
                if let Some(ui) = &self.ui {
                    match exit {
                        Exit::Finished => ui.finished("no active jobs left"),
                        Exit::Stagnated => ui.stopped(&format!(
                            "nothing changed for {} cycles",
                            self.ctx.settings.stagnation_limit
                        )),
                        _ => (),
                    }
                }
                if exit == Exit::Stagnated {
                    log::warn!("job tree unchanged for {} cycles, giving up", stagnation.unchanged);
                }
                return Ok(exit);
            }

            if !signals.update_now {
                self.sleep();
            }
            self.comm.barrier()?;
        }
    }
}

// COLLECTIVE HELPERS //////////
impl<'a> Worker<'a> {
    /// The part of `items` this worker owns.
    fn shard<'s, T>(&self, items: &'s [T]) -> &'s [T] {
        &items[util::shard_range(items.len(), self.comm.rank(), self.comm.size())]
    }

    /// All-gather every worker's result for a phase. If any worker failed,
    /// every worker gets the same error.
    fn exchange<T: Clone + Send + 'static>(&self, local: Result<T>) -> Result<Vec<T>> {
        let local = local.map_err(|e| format!("{e:#}"));
        let all = self.comm.all_gather(local)?;
        let mut values = Vec::with_capacity(all.len());
        for (rank, result) in all.into_iter().enumerate() {
            match result {
                Ok(value) => values.push(value),
                Err(msg) => return Err(Error::WorkerFailed { rank, msg }.into()),
            }
        }
        Ok(values)
    }

    /// Run `f` on worker 0 only and hand its result to everyone.
    fn share<T, F>(&self, f: F) -> Result<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Result<T>,
    {
        let local = self.comm.is_root().then(f);
        self.share_result(local)
    }

    fn share_result<T: Clone + Send + 'static>(&self, local: Option<Result<T>>) -> Result<T> {
        let local = local.map(|result| result.map_err(|e| format!("{e:#}")));
        self.comm
            .broadcast(local)?
            .map_err(|msg| Error::WorkerFailed { rank: 0, msg }.into())
    }

    fn merge(&mut self, reports: Vec<ShardReport>) {
        for report in reports {
            for (path, outcome) in report.outcomes {
                self.view.apply(&path, outcome);
            }
            if self.comm.is_root() {
                self.faults.extend(report.faults);
            }
        }
    }
}

// PHASES //////////
impl<'a> Worker<'a> {
    fn announce(&self, signals: &Signals) {
        let Some(ui) = &self.ui else { return };
        if signals.stop {
            ui.signal(control::STOP);
        }
        for name in signals.consumable() {
            ui.signal(name);
        }
    }

    /// Look for `__stop__` between phases. When it shows up mid-cycle, the
    /// signals already applied this cycle are consumed before leaving.
    fn stop_raised(&self, signals: &Signals) -> Result<bool> {
        let fs = self.ctx.fs;
        if !self.share(|| Ok(Signals::stop_requested(fs)))? {
            return Ok(false);
        }
        self.share(|| signals.consume(fs))?;
        if let Some(ui) = &self.ui {
            ui.signal(control::STOP);
            ui.stopped("found __stop__ in the root directory");
        }
        Ok(true)
    }

    /// A broken workflow file keeps the old workflow in place.
    fn reload_workflow(&mut self) -> Result<()> {
        let path = &self.ctx.settings.workflow;
        let reloaded = self.share(|| match Workflow::load(path) {
            Ok(wf) => Ok(Some(wf)),
            Err(e) => {
                log::warn!("keeping the current workflow, reload failed: {e:#}");
                Ok(None)
            }
        })?;
        if let Some(wf) = reloaded {
            log::info!("reloaded workflow from {:?}", path);
            self.workflow = wf;
        }
        Ok(())
    }

    /// Rebuild the view from disk. Material folders are split among workers.
    fn scan(&mut self, scan_all: bool) -> Result<()> {
        let root = self.ctx.fs.root();
        let materials = self.share(|| {
            let mut materials = Scanner::new(root).material_folders()?;
            if !scan_all {
                materials.retain(|m| !m.join(MATERIAL_COMPLETE).exists());
            }
            Ok(materials)
        })?;

        let scope = ScanScope::Materials(self.shard(&materials).to_vec());
        let local = Scanner::new(root).ignore_complete(true).scan(&scope);
        let mut buckets = Buckets::default();
        for part in self.exchange(local)? {
            buckets.merge(part);
        }

        let running = buckets.get(&Status::Running);
        self.view
            .misses
            .retain(|path, _| running.binary_search(path).is_ok());
        self.view.buckets = buckets;
        self.materials = materials;
        Ok(())
    }

    fn change_signals(&mut self, change: &ChangeSignal) -> Result<()> {
        let (fs, wf, buckets) = (self.ctx.fs, &self.workflow, &self.view.buckets);
        let changes = self.share(|| Ok(change.apply(fs, wf, buckets)))?;
        log::info!("re-classified {} jobs from {} to {}", changes.len(), change.from, change.to);
        for change in &changes {
            self.view.buckets.apply(change);
        }
        Ok(())
    }

    /// Advance every job in the updatable buckets by one step.
    fn update(&mut self) -> Result<()> {
        let mut snapshot = None;
        let empty = QueueSnapshot::default();
        for status in UPDATE_ORDER.iter() {
            let jobs = self.view.buckets.get(status).to_vec();
            if jobs.is_empty() {
                continue;
            }
            if matches!(status, Status::Running | Status::Error) && snapshot.is_none() {
                let (ctx, wf) = (self.ctx, &self.workflow);
                snapshot = Some(self.share(|| Ok(ctx.queue.snapshot(wf.stages(), ctx.fs.root())))?);
            }
            let local = self.update_shard(status, &jobs, snapshot.as_ref().unwrap_or(&empty));
            let reports = self.exchange(local)?;
            self.merge(reports);
        }
        Ok(())
    }

    fn update_shard(
        &self,
        status: &Status,
        jobs: &[PathBuf],
        snapshot: &QueueSnapshot,
    ) -> Result<ShardReport> {
        let settings = self.ctx.settings;
        let updater = Updater::new(
            self.ctx.fs,
            &self.workflow,
            &self.ctx.queue,
            snapshot,
            &self.view.misses,
            settings.queue_miss_limit,
        );
        let mut report = ShardReport::default();
        for path in self.shard(jobs) {
            match updater.update(path, status) {
                Ok(outcome) => report.outcomes.push((path.clone(), outcome)),
                Err(e) => {
                    log::warn!("{:?}: {:#}", path, e);
                    let change = updater
                        .fault(path, status, &e)
                        .with_context(|| format!("while moving {:?} to manual", path))?;
                    report.faults.push((path.clone(), format!("{e:#}")));
                    report.changed(change);
                }
            }
        }
        Ok(report)
    }

    /// Mark material folders whose every stage is final, so later scans skip them.
    fn mark_complete(&self) -> Result<()> {
        let local = self.mark_complete_shard();
        self.exchange(local)?;
        Ok(())
    }

    fn mark_complete_shard(&self) -> Result<()> {
        let fs = self.ctx.fs;
        for material in self.shard(&self.materials) {
            let complete = self.workflow.stages().iter().all(|stage| {
                self.view
                    .buckets
                    .status_of(&material.join(&stage.dir_name))
                    .is_some_and(|status| status.is_final())
            });
            let marker = material.join(MATERIAL_COMPLETE);
            if complete && !fs.exists(&marker) {
                fs.write_file(&marker, "")?;
                log::info!("{:?} is complete", material);
            }
        }
        Ok(())
    }

    /// Create the job dirs whose prerequisites are done.
    /// Worker 0 decides which and deals them out.
    fn prepare(&mut self) -> Result<()> {
        let chunks = self.comm.is_root().then(|| {
            let ctx = self.ctx;
            let candidates = prep::plan(
                ctx.fs,
                &self.workflow,
                &self.materials,
                &self.view.buckets,
                ctx.settings.max_ready,
            );
            let size = self.comm.size();
            (0..size)
                .map(|rank| candidates[util::shard_range(candidates.len(), rank, size)].to_vec())
                .collect()
        });
        let mine: Vec<Candidate> = self.comm.scatter(chunks)?;
        let local = Ok(self.prepare_shard(&mine));
        let reports = self.exchange(local)?;
        self.merge(reports);
        Ok(())
    }

    fn prepare_shard(&self, candidates: &[Candidate]) -> ShardReport {
        let mut report = ShardReport::default();
        for candidate in candidates {
            match prep::prepare_job(self.ctx.fs, &self.workflow, self.ctx.preparer, candidate) {
                Ok(change) => report.outcomes.push((
                    candidate.path.clone(),
                    Outcome {
                        change: Some(change),
                        misses: None,
                    },
                )),
                Err(e) => {
                    log::warn!("could not create {:?}: {:#}", candidate.path, e);
                    report.faults.push((candidate.path.clone(), format!("{e:#}")));
                }
            }
        }
        report
    }

    /// Worker 0 submits `prior_ready` jobs, then `ready` ones, while there is
    /// room under `--max-running`. Returns the number submitted.
    fn submit(&mut self) -> Result<usize> {
        let report = self.share(|| Ok(self.submit_on_root()))?;
        let submitted = report
            .outcomes
            .iter()
            .filter(|(_, outcome)| {
                outcome
                    .change
                    .as_ref()
                    .is_some_and(|change| change.to == Status::Running)
            })
            .count();
        self.merge(vec![report]);
        Ok(submitted)
    }

    fn submit_on_root(&self) -> ShardReport {
        let buckets = &self.view.buckets;
        let room = self
            .ctx
            .settings
            .max_running
            .saturating_sub(buckets.count(&Status::Running));
        let queued = buckets
            .get(&Status::PriorReady)
            .iter()
            .map(|path| (path, Status::PriorReady))
            .chain(buckets.get(&Status::Ready).iter().map(|path| (path, Status::Ready)))
            .take(room);

        let mut report = ShardReport::default();
        for (path, from) in queued {
            match self.submit_one(path, &from) {
                Ok(change) => report.changed(change),
                Err(e) => {
                    log::warn!("{:?}: {:#}", path, e);
                    report.faults.push((path.clone(), format!("{e:#}")));
                    match machine::park(self.ctx.fs, path, &from, &e) {
                        Ok(change) => report.changed(change),
                        Err(e) => log::error!("could not move {:?} to manual: {:#}", path, e),
                    }
                }
            }
        }
        report
    }

    fn submit_one(&self, path: &Path, from: &Status) -> Result<StatusChange> {
        let job = Job::new(self.ctx.fs, &self.workflow, path)?;
        let log = job.log();
        match self.ctx.queue.submit(&job) {
            Ok(id) => machine::transition(&job, &log, from.clone(), Status::Running, &id),
            Err(e) => {
                log::warn!("{:?}: submission failed: {:#}", path, e);
                log.write(Action::Manual, &format!("submission failed: {e:#}"))?;
                machine::transition(&job, &log, from.clone(), Status::Manual, "submission failed")
            }
        }
    }

    /// Worker 0's end-of-cycle duties.
    fn finish_cycle(&mut self, cycle: usize, signals: &Signals, submitted: usize) -> Result<()> {
        let fs = self.ctx.fs;
        write_status(fs, &self.view.buckets, cycle)?;
        signals.consume(fs)?;
        if let Some(ui) = &self.ui {
            ui.cycle_summary(cycle, &self.view.buckets, submitted, self.faults.len());
            ui.print_elapsed(&format!("cycle {cycle}"))?;
        }
        self.faults.print_recap(&format!("running cycle {cycle}"));
        Ok(())
    }

    /// Only worker 0 waits out the interval; the others wait for it at the barrier.
    fn sleep(&self) {
        if !self.comm.is_root() {
            return;
        }
        let deadline = Instant::now() + self.ctx.settings.interval;
        loop {
            let now = Instant::now();
            if now >= deadline || Signals::interrupts_sleep(self.ctx.fs) {
                return;
            }
            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

/// Run `workers` workers on scoped threads until they stop. Returns the exit
/// reported by worker 0, or the first error.
pub fn run_group(ctx: &Context, workflow: &Workflow, workers: usize) -> Result<Exit> {
    let results: Vec<Result<Exit>> = thread::scope(|s| {
        let handles: Vec<_> = group(workers)
            .into_iter()
            .map(|comm| {
                let wf = workflow.clone();
                s.spawn(move || Worker::new(comm, ctx, wf).run())
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(Error::WorkerFailed {
                        rank,
                        msg: "panicked".to_owned(),
                    }
                    .into())
                })
            })
            .collect()
    });
    let mut exit = None;
    for result in results {
        let this = result?;
        exit.get_or_insert(this);
    }
    Ok(exit.unwrap_or(Exit::Stopped))
}
