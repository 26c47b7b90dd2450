use anyhow::{Context as _, Result};
use colored::Colorize;

use status::{ScanScope, Scanner};
use workflow::Workflow;

use crate::fs::Fs;
use crate::orchestrator::{self, Context, Exit};
use crate::prep::CopyFromStep;
use crate::queue::QueueClient;
use crate::settings::Settings;
use crate::ui::Ui;

/// This struct actually runs the command-line app.
pub struct App {
    /// Interpreted command line settings
    settings: Settings,
    /// Filesystem interface
    fs: Fs,
    /// User interface
    ui: Ui,
}

impl App {
    /// Create a new `App`.
    pub fn new(settings: Settings) -> Self {
        let fs = Fs::new(&settings.root, settings.dry_run);
        let ui = Ui::new(&settings);
        Self { settings, fs, ui }
    }

    /// Run the app: either a one-off scan or the orchestration loop.
    pub fn run(mut self) -> Result<Exit> {
        if self.settings.verbose > 0 {
            eprintln!("Using root directory {:?}", self.settings.root);
        }
        self.fs.ensure_root_exists()?;

        if self.settings.read_only() {
            self.survey()?;
            return Ok(Exit::SingleCycle);
        }

        let workflow = self.load_workflow()?;
        let ctx = Context {
            settings: &self.settings,
            fs: &self.fs,
            queue: QueueClient::new(self.settings.command_retries, self.settings.retry_delay),
            preparer: &CopyFromStep,
        };
        eprintln!(
            "\n{} with {} worker(s).\n",
            "Starting orchestration".magenta(),
            self.settings.workers
        );
        orchestrator::run_group(&ctx, &workflow, self.settings.workers)
            .context("while running the orchestration loop")
    }

    fn load_workflow(&mut self) -> Result<Workflow> {
        self.ui
            .verbose_progress(&format!("Loading workflow {:?}", self.settings.workflow));
        self.ui.start_timer();
        let wf = Workflow::load(&self.settings.workflow)?;
        self.ui.done();
        self.ui.print_elapsed("Loading workflow")?;
        log::info!("workflow has {} stages", wf.stages().len());
        Ok(wf)
    }

    /// Scan the whole tree once and report. A dry run only prints the counts.
    fn survey(&mut self) -> Result<()> {
        self.ui.verbose_progress("Scanning job tree");
        self.ui.start_timer();
        let buckets = Scanner::new(self.fs.root())
            .ignore_complete(true)
            .scan(&ScanScope::All)?;
        self.ui.done();
        self.ui.print_elapsed("Scanning job tree")?;

        self.ui.bucket_table(&buckets);
        if !self.fs.is_dry_run() {
            orchestrator::write_status(&self.fs, &buckets, 0)?;
        }
        Ok(())
    }
}
