use std::path::Path;

use anyhow::{Context, Result};

use syntax::ast;
use util::HashMap;

use crate::{Error, Stage};

/// The ordered, validated set of stages. Stages are sorted by `step_no`
/// and only handed out by shared reference.
#[derive(Debug, Clone)]
pub struct Workflow {
    stages: Vec<Stage>,
}

impl Workflow {
    /// Read and validate a workflow definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("while reading workflow file {:?}", path))?;
        let blocks = syntax::parse_workflow(&text)
            .with_context(|| format!("while parsing workflow file {:?}", path))?;
        Self::from_blocks(&blocks).with_context(|| format!("in workflow file {:?}", path))
    }

    /// Build stages from parsed blocks and check the dependency graph.
    pub fn from_blocks(blocks: &[ast::Block]) -> Result<Self> {
        if blocks.is_empty() {
            return Err(Error::Empty.into());
        }
        let mut stages = Vec::with_capacity(blocks.len());
        for block in blocks {
            let stage = Stage::from_block(block)?;
            log::debug!("loaded stage {} ({})", stage.step_no, stage.dir_name);
            stages.push(stage);
        }
        stages.sort_by_key(|stage| stage.step_no);
        for pair in stages.windows(2) {
            if pair[0].step_no == pair[1].step_no {
                return Err(Error::DuplicateStep(pair[0].step_no).into());
            }
        }

        let wf = Self { stages };
        wf.check_dependencies()?;
        Ok(wf)
    }

    /// All stages, in step order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Get the stage with the given step number.
    pub fn stage(&self, step_no: u32) -> Option<&Stage> {
        self.stages
            .binary_search_by_key(&step_no, |stage| stage.step_no)
            .ok()
            .map(|i| &self.stages[i])
    }

    /// Get the stage whose job directories are named `dir_name`.
    pub fn stage_by_dir_name(&self, dir_name: &str) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.dir_name == dir_name)
    }

    /// Every dependency must name a defined step, and following dependencies
    /// must never lead back to where it started.
    fn check_dependencies(&self) -> Result<(), Error> {
        for stage in &self.stages {
            for dep in stage.dependencies() {
                if self.stage(dep).is_none() {
                    return Err(Error::UnknownDependency(stage.step_no, dep));
                }
            }
        }

        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(wf: &Workflow, step: u32, marks: &mut HashMap<u32, Mark>) -> Result<(), Error> {
            match marks.get(&step) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => return Err(Error::Cycle(step)),
                None => {}
            }
            marks.insert(step, Mark::Visiting);
            if let Some(stage) = wf.stage(step) {
                for dep in stage.dependencies() {
                    visit(wf, dep, marks)?;
                }
            }
            marks.insert(step, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::with_capacity_and_hasher(self.stages.len(), Default::default());
        for stage in &self.stages {
            visit(self, stage.step_no, &mut marks)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn block(step_no: u32, extra: &str) -> String {
        format!(
            "**start
step_no = {step_no}
cal_name = step{step_no}
job_submission_command = true
job_query_command = true
job_killing_command = true
where_to_parse_queue_id = job_id
re_to_parse_queue_id = ([0-9]+)
{extra}
**end
"
        )
    }

    fn load(text: &str) -> Result<Workflow> {
        let blocks = syntax::parse_workflow(text)?;
        Workflow::from_blocks(&blocks)
    }

    #[test]
    fn test_sorted_lookup() -> Result<()> {
        let text = block(2, "") + &block(1, "");
        let wf = load(&text)?;
        assert_eq!(vec![1, 2], wf.stages().iter().map(|s| s.step_no).collect::<Vec<_>>());
        assert_eq!(Some(2), wf.stage(2).map(|s| s.step_no));
        assert!(wf.stage(3).is_none());
        assert_eq!(Some(1), wf.stage_by_dir_name("step_1_step1").map(|s| s.step_no));
        Ok(())
    }

    #[test]
    fn test_duplicate_step() {
        let text = block(1, "") + &block(1, "");
        assert!(load(&text).is_err());
    }

    #[test]
    fn test_unknown_dependency() {
        let text = block(1, "") + &block(2, "additional_cal_dependence = 5");
        let err = load(&text).unwrap_err();
        assert!(format!("{err}").contains("not defined"));
    }

    #[test]
    fn test_cycle() {
        let text = block(1, "additional_cal_dependence = 2") + &block(2, "");
        let err = load(&text).unwrap_err();
        assert!(format!("{err}").contains("cycle"));

        let self_loop = block(1, "copy_which_step = 1");
        assert!(load(&self_loop).is_err());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() -> Result<()> {
        let text = block(1, "")
            + &block(2, "")
            + &block(3, "copy_which_step = 1")
            + &block(4, "additional_cal_dependence = 2, 3");
        let wf = load(&text)?;
        let deps: Vec<u32> = wf.stage(4).map(|s| s.dependencies().collect()).unwrap_or_default();
        assert_eq!(vec![3, 2, 3], deps);
        Ok(())
    }

    #[test]
    fn test_empty() {
        assert!(load("# nothing here\n").is_err());
    }
}
