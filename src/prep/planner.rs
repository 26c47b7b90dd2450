use std::path::PathBuf;

use status::{Buckets, Status};
use workflow::Workflow;

use crate::fs::Fs;

/// A job dir that can be created now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub material: PathBuf,
    pub step_no: u32,
    pub path: PathBuf,
}

/// Every stage dir that doesn't exist yet and whose dependencies are all done,
/// in material then step order, limited so that the number of jobs waiting
/// for submission never exceeds `max_ready`.
pub fn plan(
    fs: &Fs,
    wf: &Workflow,
    materials: &[PathBuf],
    buckets: &Buckets,
    max_ready: usize,
) -> Vec<Candidate> {
    let waiting = buckets.count(&Status::Ready)
        + buckets.count(&Status::PriorReady)
        + buckets.count(&Status::Vis);
    let room = max_ready.saturating_sub(waiting);
    if room == 0 {
        log::debug!("{waiting} jobs already waiting for submission, preparing none");
        return Vec::new();
    }

    let mut candidates = Vec::with_capacity(room.min(64));
    let mut buf = PathBuf::new();
    'materials: for material in materials {
        for stage in wf.stages() {
            let path = fs.stage_dir(material, &stage.dir_name, &mut buf);
            if fs.exists(path) {
                continue;
            }
            let ready = stage.dependencies().all(|dep| {
                wf.stage(dep).is_some_and(|dep| {
                    let dep_path = material.join(&dep.dir_name);
                    buckets.status_of(&dep_path).is_some_and(|s| s.is_done())
                })
            });
            if ready {
                candidates.push(Candidate {
                    material: material.clone(),
                    step_no: stage.step_no,
                    path: path.to_path_buf(),
                });
                if candidates.len() == room {
                    break 'materials;
                }
            }
        }
    }
    candidates
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::job::test::workflow;
    use anyhow::Result;
    use std::path::Path;
    use tempfile::tempdir;

    #[test]
    fn test_plan() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        let fs = Fs::new(root, false);
        let wf = workflow("")?;
        let (si, fe, cu) = (root.join("Si"), root.join("Fe"), root.join("Cu"));

        let mut buckets = Buckets::default();
        std::fs::create_dir_all(si.join("step_1_opt"))?;
        buckets.insert(&Status::DoneCleanedAnalyzed, si.join("step_1_opt"));
        std::fs::create_dir_all(fe.join("step_1_opt"))?;
        buckets.insert(&Status::Running, fe.join("step_1_opt"));
        std::fs::create_dir_all(&cu)?;

        let materials = vec![cu.clone(), fe, si.clone()];
        let planned = plan(&fs, &wf, &materials, &buckets, 10);
        let paths: Vec<&Path> = planned.iter().map(|c| c.path.as_path()).collect();
        assert_eq!(paths, [cu.join("step_1_opt"), si.join("step_2_scf")]);
        assert_eq!(2, planned[1].step_no);

        // room for one more only:
        buckets.insert(&Status::Ready, root.join("x/step_1_opt"));
        buckets.insert(&Status::Vis, root.join("y/step_1_opt"));
        assert_eq!(1, plan(&fs, &wf, &materials, &buckets, 3).len());
        assert!(plan(&fs, &wf, &materials, &buckets, 2).is_empty());
        Ok(())
    }
}
