/// High-level command line app
mod app;
/// Definition of command-line args
mod args;
/// Versioned snapshots of a job's files
mod backup;
/// Error detection and correction
mod checker;
/// Running shell commands
mod exec;
/// Filesystem operations
mod fs;
/// The stage parameter file
mod incar;
/// A job dir bound to its stage
mod job;
/// Append-only per-job log
mod joblog;
/// Job state machine
mod machine;
/// The cooperating worker loop
mod orchestrator;
/// Creating new job dirs
mod prep;
/// Batch queue commands
mod queue;
/// Combined command-line and workflow file run settings
mod settings;
/// Text UI
mod ui;

// exported for tests:
pub use app::App;
pub use args::Args;
pub use orchestrator::Exit;
pub use settings::Settings;

/// Run the command-line app.
pub fn run() -> Result<(), anyhow::Error> {
    use clap::Parser;
    let args = Args::parse();

    // INTERPRET SETTINGS ///////////////
    let settings: Settings = args.try_into()?;

    let log_level = match settings.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logging::log_to_stderr(log_level);

    // RUN THE THING /////////////////
    let app = App::new(settings);
    let exit = app.run()?;
    log::info!("exiting: {:?}", exit);

    Ok(())
}
