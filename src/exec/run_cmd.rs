use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use super::Error;

/// Captured result of one shell command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Run `cmd` through `sh -c` inside `dir`, capturing stdout and stderr.
/// A non-zero exit is not an error here; check [`CmdOutput::success`].
pub fn run_cmd(cmd: &str, dir: &Path) -> Result<CmdOutput> {
    log::trace!("running `{}` in {:?}", cmd, dir);
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(cmd)
        .current_dir(dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| Error::Spawn(cmd.to_owned()))?;

    let child_out = child
        .stdout
        .take()
        .ok_or_else(|| Error::Pipe("stdout", cmd.to_owned()))?;
    let child_err = child
        .stderr
        .take()
        .ok_or_else(|| Error::Pipe("stderr", cmd.to_owned()))?;

    // both pipes are drained concurrently so a chatty child can't block on a full buffer.
    let thread_out = thread::spawn(move || communicate(child_out));
    let thread_err = thread::spawn(move || communicate(child_err));
    let stdout = thread_out
        .join()
        .map_err(|_| Error::Pipe("stdout", cmd.to_owned()))??;
    let stderr = thread_err
        .join()
        .map_err(|_| Error::Pipe("stderr", cmd.to_owned()))??;

    let status = child
        .wait()
        .with_context(|| format!("waiting on `{cmd}`"))?;
    Ok(CmdOutput {
        status,
        stdout,
        stderr,
    })
}

/// Run `cmd` up to `1 + retries` times, sleeping `delay` between attempts,
/// until it exits successfully. Fails if every attempt failed.
pub fn run_with_retries(
    cmd: &str,
    dir: &Path,
    retries: usize,
    delay: Duration,
) -> Result<CmdOutput> {
    let attempts = retries + 1;
    let mut last_status = String::new();
    for attempt in 1..=attempts {
        match run_cmd(cmd, dir) {
            Ok(output) if output.success() => return Ok(output),
            Ok(output) => {
                last_status = format!("{}; stderr: {}", output.status, output.stderr.trim());
            }
            Err(e) => last_status = format!("{e:#}"),
        }
        log::warn!("attempt {attempt}/{attempts} of `{cmd}` failed: {last_status}");
        if attempt < attempts && !delay.is_zero() {
            thread::sleep(delay);
        }
    }
    Err(Error::Failed {
        cmd: cmd.to_owned(),
        attempts,
        status: last_status,
    }
    .into())
}

fn communicate<R: Read>(mut stream: R) -> std::io::Result<String> {
    let mut bytes = Vec::with_capacity(1024);
    stream.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_captures_output_in_dir() -> Result<()> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join("job_id"), "Submitted batch job 42\n")?;
        let output = run_cmd("cat job_id; echo oops >&2", dir.path())?;
        assert!(output.success());
        assert_eq!("Submitted batch job 42\n", output.stdout);
        assert_eq!("oops\n", output.stderr);
        Ok(())
    }

    #[test]
    fn test_retries_exhausted() -> Result<()> {
        let dir = tempdir()?;
        // each attempt appends a line, so we can count them.
        let err = run_with_retries("echo x >> tries; false", dir.path(), 2, Duration::ZERO)
            .unwrap_err();
        assert!(format!("{err}").contains("3 attempt"));
        assert_eq!(3, std::fs::read_to_string(dir.path().join("tries"))?.lines().count());
        Ok(())
    }

    #[test]
    fn test_retry_succeeds_eventually() -> Result<()> {
        let dir = tempdir()?;
        let cmd = "echo x >> tries; test $(wc -l < tries) -ge 2";
        let output = run_with_retries(cmd, dir.path(), 3, Duration::ZERO)?;
        assert!(output.success());
        assert_eq!(2, std::fs::read_to_string(dir.path().join("tries"))?.lines().count());
        Ok(())
    }
}
