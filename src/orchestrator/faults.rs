use std::path::PathBuf;

use colored::Colorize;

/// Jobs parked in `manual` because their update failed, collected over one cycle.
#[derive(Debug, Default)]
pub struct Faults {
    // ideally empty, so no up-front allocation.
    faults: Vec<(PathBuf, String)>,
}

impl Faults {
    pub fn extend(&mut self, faults: impl IntoIterator<Item = (PathBuf, String)>) {
        self.faults.extend(faults);
    }

    pub fn len(&self) -> usize {
        self.faults.len()
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    /// Hand over everything recorded so far, leaving this empty.
    pub fn take(&mut self) -> Vec<(PathBuf, String)> {
        std::mem::take(&mut self.faults)
    }

    /// Print every fault to stderr and clear the list.
    pub fn print_recap(&mut self, label: &str) {
        if self.is_empty() {
            return;
        }
        eprintln!("\n{} job(s) moved to manual while {label}:\n", self.faults.len());
        for (job, msg) in self.take() {
            eprintln!("{}: {}\n    {msg}", "FAULT".red(), job.display());
        }
        eprintln!();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_collect_and_take() {
        let mut faults = Faults::default();
        assert!(faults.is_empty());
        faults.extend([
            (PathBuf::from("/r/Si/step_1_opt"), "bad OSZICAR".to_owned()),
            (PathBuf::from("/r/Fe/step_1_opt"), "gone".to_owned()),
        ]);
        assert_eq!(2, faults.len());
        let taken = faults.take();
        assert_eq!("bad OSZICAR", taken[0].1);
        assert!(faults.is_empty());
        faults.print_recap("updating");
    }
}
