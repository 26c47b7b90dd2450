use std::fmt::Write;
use std::path::PathBuf;

use anyhow::Result;

use status::Buckets;

use crate::fs::Fs;

/// Render the bucket map: a timestamp header, then one section per bucket.
pub fn render(buckets: &Buckets, cycle: usize) -> String {
    let mut text = String::with_capacity(64 * buckets.total() + 128);
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    // writing to a String can't fail.
    let _ = writeln!(text, "# htc-flow job status, cycle {cycle}, written {now}");
    let _ = writeln!(text, "# {} jobs, {} active", buckets.total(), buckets.active());
    for (status, jobs) in buckets.iter() {
        let _ = writeln!(text, "\n== {} ({})", status, jobs.len());
        for job in jobs {
            let _ = writeln!(text, "{}", job.display());
        }
    }
    text
}

/// Rewrite `<root>/htc_job_status.txt`.
pub fn write_status(fs: &Fs, buckets: &Buckets, cycle: usize) -> Result<()> {
    let mut buf = PathBuf::new();
    let path = fs.status_file(&mut buf);
    fs.write_file(path, &render(buckets, cycle))?;
    log::debug!("wrote {:?}", path);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use status::Status;

    #[test]
    fn test_render() {
        let mut buckets = Buckets::default();
        buckets.insert(&Status::Running, PathBuf::from("/r/Si/step_1_opt"));
        buckets.insert(&Status::Running, PathBuf::from("/r/Fe/step_1_opt"));
        buckets.insert(&Status::Manual, PathBuf::from("/r/Cu/step_1_opt"));
        let text = render(&buckets, 4);
        assert!(text.starts_with("# htc-flow job status, cycle 4, written "));
        assert!(text.contains("# 3 jobs, 2 active\n"));
        assert!(text.contains("\n== manual (1)\n/r/Cu/step_1_opt\n"));
        assert!(text.contains("\n== running (2)\n/r/Fe/step_1_opt\n/r/Si/step_1_opt\n"));
    }
}
