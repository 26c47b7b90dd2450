use anyhow::Result;
use htc_flow::{App, Args, Exit, Settings};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// The fake queue finishes every job the moment it's submitted.
const WORKFLOW: &str = "# two-step test workflow
**start
step_no = 1
cal_name = structure optimization
copy_which_step = 0
job_submission_command = echo 'Submitted batch job 42' > job_id && echo 'General timing and accounting informations for this job:' > OUTCAR && cp POSCAR CONTCAR && touch vasp.out vasp.err
job_query_command = echo 42
job_killing_command = true
where_to_parse_queue_id = job_id
re_to_parse_queue_id = Submitted batch job ([0-9]+)
**end

**start
step_no = 2
cal_name = scf
incar.NSW = 0
job_submission_command = echo 'Submitted batch job 43' > job_id && echo 'General timing and accounting informations for this job:' > OUTCAR && touch vasp.out vasp.err
job_query_command = echo 43
job_killing_command = true
where_to_parse_queue_id = job_id
re_to_parse_queue_id = Submitted batch job ([0-9]+)
**end
";

/// Submission only; the job stays "in the queue" until the test says otherwise.
const SLOW_WORKFLOW: &str = "**start
step_no = 1
cal_name = opt
job_submission_command = echo 'Submitted batch job 42' > job_id
job_query_command = echo 42
job_killing_command = true
where_to_parse_queue_id = job_id
re_to_parse_queue_id = Submitted batch job ([0-9]+)
**end
";

fn basic_args(root: &Path) -> Args {
    Args {
        root: root.to_str().expect("utf-8 tempdir").to_owned(),
        workflow: String::from("htc_setup"),
        workers: 2,
        max_running: 50,
        max_ready: 100,
        interval: 0,
        stagnation_limit: 1000,
        queue_miss_limit: 3,
        command_retries: 0,
        once: false,
        status_only: false,
        dry_run: false,
        verbose: 1,
    }
}

fn run(args: Args) -> Result<Exit> {
    simple_logging::log_to_stderr(log::LevelFilter::Debug);
    let settings: Settings = args.try_into()?;
    App::new(settings).run()
}

fn material(root: &Path, name: &str) -> Result<()> {
    let dir = root.join(name);
    fs::create_dir_all(&dir)?;
    fs::write(dir.join("INCAR"), "ENCUT = 520\nNSW = 60\n")?;
    fs::write(dir.join("POSCAR"), format!("{name} structure\n"))?;
    fs::write(dir.join("KPOINTS"), "Automatic\n0\nMonkhorst-Pack\n4 4 4\n")?;
    fs::write(dir.join("POTCAR"), "potential\n")?;
    Ok(())
}

/// A job that has just come back from the queue with `out` as its program output.
fn finished_job(root: &Path, incar: &str, out: &str) -> Result<std::path::PathBuf> {
    let job = root.join("Si/step_1_opt");
    fs::create_dir_all(&job)?;
    fs::write(job.join("INCAR"), incar)?;
    fs::write(job.join("POSCAR"), "Si structure\n")?;
    fs::write(job.join("__running__"), "42")?;
    fs::write(job.join("job_id"), "Submitted batch job 42\n")?;
    fs::write(job.join("out"), out)?;
    fs::write(job.join("vasp.out"), "")?;
    fs::write(job.join("vasp.err"), "")?;
    Ok(job)
}

#[test]
fn test_pipeline_runs_to_completion() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), WORKFLOW)?;
    material(root, "Si")?;
    material(root, "Fe")?;

    assert_eq!(Exit::Finished, run(basic_args(root))?);

    for name in ["Si", "Fe"] {
        let folder = root.join(name);
        assert!(folder.join("__complete__").exists(), "{name} is marked complete");
        let opt = folder.join("step_1_structure_optimization");
        let scf = folder.join("step_2_scf");
        assert!(opt.join("__done__").exists());
        assert!(scf.join("__done__").exists());
        assert_eq!(format!("{name} structure\n"), fs::read_to_string(scf.join("POSCAR"))?);
        assert_eq!("ENCUT = 520\nNSW = 0\n", fs::read_to_string(scf.join("INCAR"))?);
        let log = fs::read_to_string(scf.join("htc_job.log"))?;
        assert!(log.contains("[submit]"));
        assert!(log.contains("running -> done"));
    }
    let report = fs::read_to_string(root.join("htc_job_status.txt"))?;
    assert!(report.contains("== done (4)"));

    dir.close()?;
    Ok(())
}

#[test]
fn test_error_is_corrected_and_resubmitted() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), SLOW_WORKFLOW)?;
    let job = finished_job(
        root,
        "ISMEAR = -5\nENCUT = 400\n",
        " Routine TETIRR needs special values\n",
    )?;

    let mut args = basic_args(root);
    args.once = true;
    assert_eq!(Exit::SingleCycle, run(args)?);

    assert!(job.join("__running__").exists(), "job was resubmitted");
    assert_eq!(
        "ISMEAR = 0\nENCUT = 400\nSIGMA = 0.05\n",
        fs::read_to_string(job.join("INCAR"))?
    );
    assert!(job.join("error_folder/error_1/INCAR").is_file());
    assert!(!job.join("out").exists(), "old output was archived");
    let log = fs::read_to_string(job.join("htc_job.log"))?;
    for line in ["running -> error", "error -> killed", "killed -> ready", "ready -> running"] {
        assert!(log.contains(line), "log has '{line}'");
    }
    Ok(())
}

#[test]
fn test_uncorrectable_error_goes_manual() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), SLOW_WORKFLOW)?;
    // already at the safe setting, so there is nothing left to try:
    let job = finished_job(root, "ISMEAR = 0\n", " Routine TETIRR needs special values\n")?;

    let mut args = basic_args(root);
    args.once = true;
    run(args)?;

    assert!(job.join("__manual__").exists());
    assert!(!job.join("__killed__").exists());
    Ok(())
}

#[test]
fn test_lost_job_goes_manual() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), SLOW_WORKFLOW)?;
    let job = root.join("Si/step_1_opt");
    fs::create_dir_all(&job)?;
    fs::write(job.join("INCAR"), "")?;
    fs::write(job.join("__running__"), "")?;
    fs::write(job.join("job_id"), "Submitted batch job 99\n")?;

    let mut args = basic_args(root);
    args.queue_miss_limit = 2;
    // the first cycle only counts a miss, the second gives up; then nothing is active.
    assert_eq!(Exit::Finished, run(args)?);
    assert!(job.join("__manual__").exists());
    Ok(())
}

#[test]
fn test_status_only_and_dry_run() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), SLOW_WORKFLOW)?;
    material(root, "Si")?;
    let job = finished_job(root, "ISMEAR = -5\n", " Routine TETIRR needs special values\n")?;

    let mut args = basic_args(root);
    args.dry_run = true;
    run(args)?;
    assert!(!root.join("htc_job_status.txt").exists());

    let mut args = basic_args(root);
    args.status_only = true;
    run(args)?;
    let report = fs::read_to_string(root.join("htc_job_status.txt"))?;
    assert!(report.contains("== running (1)"));

    // neither run touched the job:
    assert!(job.join("__running__").exists());
    assert!(!job.join("htc_job.log").exists());
    Ok(())
}

#[test]
fn test_stop_signal_is_kept() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    fs::write(root.join("htc_setup"), SLOW_WORKFLOW)?;
    material(root, "Si")?;
    fs::write(root.join("__stop__"), "")?;
    fs::write(root.join("__scan_all__"), "")?;

    assert_eq!(Exit::Stopped, run(basic_args(root))?);
    assert!(root.join("__stop__").exists());
    assert!(!root.join("Si/step_1_opt").exists());
    Ok(())
}
