use std::path::Path;

use anyhow::Result;

use crate::job::Job;
use crate::joblog::JobLog;

use super::{give_up, Correction, Diagnose, MalformedOutput};

const FINISHED_MARKER: &str = "General timing and accounting informations";

/// The band count the run used, from the `NBANDS=` field.
pub(super) fn nbands(text: &str, path: &Path) -> Result<Option<u32>, MalformedOutput> {
    let Some((_, rest)) = text.split_once("NBANDS=") else {
        return Ok(None);
    };
    let field = rest.split_whitespace().next().unwrap_or("");
    field
        .parse()
        .map(Some)
        .map_err(|_| MalformedOutput::new(path.to_path_buf(), format!("bad NBANDS= value '{field}'")))
}

/// An OUTCAR that was cut off before its final timing section.
pub(super) struct UnfinishedOutcar;

pub(super) static UNFINISHED_OUTCAR: UnfinishedOutcar = UnfinishedOutcar;

impl Diagnose for UnfinishedOutcar {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        let path = job.file("OUTCAR");
        if !path.is_file() {
            return Ok(None);
        }
        let text = job.fs().read_lossy(&path)?;
        if text.contains(FINISHED_MARKER) {
            Ok(None)
        } else {
            Ok(Some("OUTCAR ends before the timing summary".to_owned()))
        }
    }

    fn correct(&self, _job: &Job, log: &JobLog) -> Result<Correction> {
        give_up(log, "unfinished_outcar: cause unknown, needs a human")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_nbands() -> Result<()> {
        let path = Path::new("OUTCAR");
        let text = "number of bands    NBANDS=     24\n";
        assert_eq!(Some(24), nbands(text, path)?);
        assert_eq!(None, nbands("nothing", path)?);
        assert!(nbands("NBANDS= ***", path).is_err());
        Ok(())
    }
}
