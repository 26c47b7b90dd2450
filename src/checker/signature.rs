use anyhow::Result;

use crate::job::Job;
use crate::joblog::{Action, JobLog};

use super::outcar;
use super::{contcar_to_poscar, give_up, remove_files, Correction, Diagnose, IncarEdit};

type Fix = fn(&Job, &JobLog) -> Result<Correction>;

/// An error recognized by fixed strings in the computation's own output file.
pub(super) struct SignatureChecker {
    /// all of these must appear
    signatures: &'static [&'static str],
    fix: Fix,
}

impl Diagnose for SignatureChecker {
    fn detect(&self, job: &Job) -> Result<Option<String>> {
        let output = job.file(&job.stage().program_output);
        if !output.is_file() {
            return Ok(None);
        }
        let text = job.fs().read_lossy(&output)?;
        if self.signatures.iter().all(|sig| text.contains(sig)) {
            Ok(Some(format!(
                "'{}' in {}",
                self.signatures.join("' and '"),
                job.stage().program_output
            )))
        } else {
            Ok(None)
        }
    }

    fn correct(&self, job: &Job, log: &JobLog) -> Result<Correction> {
        (self.fix)(job, log)
    }
}

pub(super) static TOO_FEW_BANDS: SignatureChecker = SignatureChecker {
    signatures: &["TOO FEW BANDS"],
    fix: fix_too_few_bands,
};

pub(super) static RHOSYG: SignatureChecker = SignatureChecker {
    signatures: &["RHOSYG internal error"],
    fix: fix_rhosyg,
};

pub(super) static PRICEL: SignatureChecker = SignatureChecker {
    signatures: &["internal error in subroutine PRICEL"],
    fix: fix_pricel,
};

pub(super) static SUBSPACE_MATRIX: SignatureChecker = SignatureChecker {
    signatures: &["ERROR in subspace rotation PSSYEVX"],
    fix: fix_subspace_matrix,
};

pub(super) static EDDDAV: SignatureChecker = SignatureChecker {
    signatures: &["Error EDDDAV: Call to ZHEGV failed"],
    fix: fix_edddav,
};

pub(super) static ZPOTRF: SignatureChecker = SignatureChecker {
    signatures: &["LAPACK: Routine ZPOTRF failed"],
    fix: fix_zpotrf,
};

pub(super) static REAL_OPTLAY: SignatureChecker = SignatureChecker {
    signatures: &["REAL_OPTLAY: internal error"],
    fix: fix_real_optlay,
};

pub(super) static TETIRR: SignatureChecker = SignatureChecker {
    signatures: &["Routine TETIRR needs special values"],
    fix: fix_tetirr,
};

pub(super) static INCORRECT_SHIFT: SignatureChecker = SignatureChecker {
    signatures: &["Could not get correct shifts"],
    fix: fix_incorrect_shift,
};

pub(super) static BRMIX: SignatureChecker = SignatureChecker {
    signatures: &[
        "BRMIX: very serious problems",
        "the old and the new charge density differ",
    ],
    fix: fix_brmix,
};

pub(super) static ZBRENT: SignatureChecker = SignatureChecker {
    signatures: &["ZBRENT: fatal error"],
    fix: fix_zbrent,
};

const POTIM_DEFAULT: f64 = 0.5;
const POTIM_FLOOR: f64 = 0.1;
const EDIFF_DEFAULT: f64 = 1e-4;
const EDIFF_FLOOR: f64 = 1e-6;
const TOLERANCE: f64 = 1e-12;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= TOLERANCE * b.abs().max(1.0)
}

/// Short scientific notation, e.g. `1E-6` rather than `1.0000000000000002e-6`.
fn sci(v: f64) -> String {
    let s = format!("{v:.3E}");
    match s.split_once('E') {
        Some((mantissa, exp)) => {
            let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
            format!("{mantissa}E{exp}")
        }
        None => s,
    }
}

/// Increase NBANDS by 10% over what the run actually used.
fn fix_too_few_bands(job: &Job, log: &JobLog) -> Result<Correction> {
    let path = job.file("OUTCAR");
    if !path.is_file() {
        return give_up(log, "too_few_bands: no OUTCAR to read NBANDS from");
    }
    let text = job.fs().read_lossy(&path)?;
    let Some(nbands) = outcar::nbands(&text, &path)? else {
        return give_up(log, "too_few_bands: NBANDS not found in OUTCAR");
    };
    let mut edit = IncarEdit::open(job, log)?;
    edit.set("NBANDS", &more_bands(nbands).to_string());
    edit.save()
}

/// 10% more, rounded up, and at least one more.
fn more_bands(nbands: u32) -> u32 {
    ((nbands * 11 + 9) / 10).max(nbands + 1)
}

/// Tighten SYMPREC first, then turn symmetry off.
fn fix_rhosyg(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    let symprec = edit.get_as::<f64>("SYMPREC");
    if !symprec.is_some_and(|v| close(v, 1e-4)) {
        edit.set("SYMPREC", "1E-4");
    } else if edit.get_as::<i32>("ISYM") != Some(0) {
        edit.set("ISYM", "0");
    } else {
        return give_up(log, "rhosyg: SYMPREC = 1E-4 and ISYM = 0 already");
    }
    edit.save()
}

fn fix_pricel(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    let symprec_done = edit.get_as::<f64>("SYMPREC").is_some_and(|v| close(v, 1e-8));
    let isym_done = edit.get_as::<i32>("ISYM") == Some(0);
    if symprec_done && isym_done {
        return give_up(log, "pricel: SYMPREC = 1E-8 and ISYM = 0 already");
    }
    edit.set("SYMPREC", "1E-8");
    edit.set("ISYM", "0");
    edit.save()
}

fn fix_subspace_matrix(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    if edit.is("ALGO", "Normal") {
        return give_up(log, "subspace_matrix: ALGO = Normal already");
    }
    edit.set("ALGO", "Normal");
    edit.save()
}

fn fix_edddav(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    if edit.is("ALGO", "All") {
        return give_up(log, "edddav: ALGO = All already");
    }
    remove_files(job, log, &["CHGCAR"])?;
    edit.set("ALGO", "All");
    edit.save()
}

/// Halve POTIM, down to a floor.
fn fix_zpotrf(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    let potim = edit.get_as::<f64>("POTIM").unwrap_or(POTIM_DEFAULT) / 2.0;
    if potim < POTIM_FLOOR - TOLERANCE {
        return give_up(log, &format!("zpotrf: POTIM would drop below {POTIM_FLOOR}"));
    }
    edit.set("ISYM", "0");
    edit.set("POTIM", &potim.to_string());
    remove_files(job, log, &["WAVECAR", "CHGCAR"])?;
    edit.save()
}

fn fix_real_optlay(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    if edit.get_as::<bool>("LREAL") == Some(false) {
        return give_up(log, "real_optlay: LREAL = .FALSE. already");
    }
    edit.set("LREAL", ".FALSE.");
    edit.save()
}

fn fix_tetirr(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    if edit.get_as::<i32>("ISMEAR") == Some(0) {
        return give_up(log, "tetirr: ISMEAR = 0 already");
    }
    edit.set("ISMEAR", "0");
    edit.set("SIGMA", "0.05");
    edit.save()
}

/// Switch the k-point mesh to Gamma-centered (third line of KPOINTS).
fn fix_incorrect_shift(job: &Job, log: &JobLog) -> Result<Correction> {
    let path = job.file("KPOINTS");
    if !path.is_file() {
        return give_up(log, "incorrect_shift: no KPOINTS file");
    }
    let text = job.fs().read_to_string(&path)?;
    let mut lines: Vec<&str> = text.lines().collect();
    let Some(mode) = lines.get(2) else {
        return Err(super::MalformedOutput::new(path, "fewer than 3 lines").into());
    };
    if mode.trim_start().starts_with(['G', 'g']) {
        return give_up(log, "incorrect_shift: KPOINTS is Gamma-centered already");
    }
    let old = mode.trim().to_owned();
    lines[2] = "Gamma";
    let mut new_text = lines.join("\n");
    new_text.push('\n');
    job.fs().write_file(&path, &new_text)?;
    log.write(Action::Correct, &format!("KPOINTS: {old} -> Gamma"))?;
    Ok(Correction::Fixed)
}

fn fix_brmix(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    if edit.get_as::<bool>("ADDGRID") == Some(true) {
        return give_up(log, "brmix: ADDGRID = .TRUE. already");
    }
    edit.set("ADDGRID", ".TRUE.");
    edit.save()
}

/// Switch to quasi-Newton relaxation with a tighter EDIFF, from the last geometry.
fn fix_zbrent(job: &Job, log: &JobLog) -> Result<Correction> {
    let mut edit = IncarEdit::open(job, log)?;
    let ediff = edit.get_as::<f64>("EDIFF").unwrap_or(EDIFF_DEFAULT) / 10.0;
    if ediff < EDIFF_FLOOR * (1.0 - 1e-9) {
        return give_up(log, &format!("zbrent: EDIFF would drop below {EDIFF_FLOOR:E}"));
    }
    edit.set("IBRION", "1");
    edit.set("EDIFF", &sci(ediff));
    contcar_to_poscar(job, log)?;
    edit.save()
}

#[cfg(test)]
mod test {
    use super::super::test::make_job;
    use super::super::{Checker, ON_THE_FLY};
    use super::*;
    use crate::fs::Fs;
    use crate::job::test::workflow;
    use std::fs;
    use tempfile::tempdir;

    const OUTCAR: &str = "\
   k-points           NKPTS =      4   k-points in BZ     NKDIM =      4   number of bands    NBANDS=     16
";

    #[test]
    fn test_too_few_bands() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[
                ("INCAR", "ENCUT = 520\nNBANDS = 12\nISMEAR = 0\n"),
                ("out", "TOO FEW BANDS"),
                ("OUTCAR", OUTCAR),
            ],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;

        assert_eq!(Correction::Fixed, Checker::resolve("too_few_bands", &job).correct()?);
        // 16 * 1.1 = 17.6, rounded up; other keys untouched and in order.
        assert_eq!(
            "ENCUT = 520\nNBANDS = 18\nISMEAR = 0\n",
            fs::read_to_string(path.join("INCAR"))?
        );
        Ok(())
    }

    #[test]
    fn test_more_bands() {
        assert_eq!(11, more_bands(10));
        assert_eq!(18, more_bands(16));
        assert_eq!(2, more_bands(1));
        assert_eq!(110, more_bands(100));
    }

    #[test]
    fn test_detect_in_output_with_invalid_bytes() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(dir.path(), &[("INCAR", "NBANDS = 12
")])?;
        fs::write(path.join("out"), b"\xff\xfe garbage\n TOO FEW BANDS\n")?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;

        assert!(TOO_FEW_BANDS.detect(&job)?.is_some());
        assert!(RHOSYG.detect(&job)?.is_none());
        Ok(())
    }

    #[test]
    fn test_too_few_bands_without_outcar() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(dir.path(), &[("INCAR", "NBANDS = 12\n")])?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        assert_eq!(Correction::NotFixed, Checker::resolve("too_few_bands", &job).correct()?);
        Ok(())
    }

    #[test]
    fn test_rhosyg_escalates() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(dir.path(), &[("INCAR", "ENCUT = 400\n"), ("out", "x")])?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        let log = job.log();

        assert_eq!(Correction::Fixed, fix_rhosyg(&job, &log)?);
        assert_eq!("ENCUT = 400\nSYMPREC = 1E-4\n", fs::read_to_string(path.join("INCAR"))?);
        assert_eq!(Correction::Fixed, fix_rhosyg(&job, &log)?);
        assert_eq!(
            "ENCUT = 400\nSYMPREC = 1E-4\nISYM = 0\n",
            fs::read_to_string(path.join("INCAR"))?
        );
        assert_eq!(Correction::NotFixed, fix_rhosyg(&job, &log)?);
        Ok(())
    }

    #[test]
    fn test_zpotrf_floor() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[("INCAR", "POTIM = 0.4\n"), ("WAVECAR", "bin"), ("CHGCAR", "bin")],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        let log = job.log();

        assert_eq!(Correction::Fixed, fix_zpotrf(&job, &log)?);
        assert_eq!("POTIM = 0.2\nISYM = 0\n", fs::read_to_string(path.join("INCAR"))?);
        assert!(!path.join("WAVECAR").exists());
        assert!(!path.join("CHGCAR").exists());
        assert_eq!(Correction::Fixed, fix_zpotrf(&job, &log)?);
        assert_eq!(Correction::NotFixed, fix_zpotrf(&job, &log)?);
        Ok(())
    }

    #[test]
    fn test_incorrect_shift() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[("INCAR", ""), ("KPOINTS", "auto\n0\nMonkhorst-Pack\n4 4 4\n")],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        let log = job.log();

        assert_eq!(Correction::Fixed, fix_incorrect_shift(&job, &log)?);
        assert_eq!("auto\n0\nGamma\n4 4 4\n", fs::read_to_string(path.join("KPOINTS"))?);
        assert_eq!(Correction::NotFixed, fix_incorrect_shift(&job, &log)?);

        fs::write(path.join("KPOINTS"), "auto\n")?;
        let err = fix_incorrect_shift(&job, &log).unwrap_err();
        assert!(err.downcast_ref::<super::super::MalformedOutput>().is_some());
        Ok(())
    }

    #[test]
    fn test_zbrent() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[
                ("INCAR", "IBRION = 2\nEDIFF = 1E-5\n"),
                ("POSCAR", "old"),
                ("CONTCAR", "new"),
            ],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        let log = job.log();

        assert_eq!(Correction::Fixed, fix_zbrent(&job, &log)?);
        assert_eq!("IBRION = 1\nEDIFF = 1E-6\n", fs::read_to_string(path.join("INCAR"))?);
        assert_eq!("new", fs::read_to_string(path.join("POSCAR"))?);
        assert!(!path.join("CONTCAR").exists());
        assert_eq!(Correction::NotFixed, fix_zbrent(&job, &log)?);
        Ok(())
    }

    #[test]
    fn test_sci() {
        assert_eq!("1E-6", sci(1e-5 / 10.0));
        assert_eq!("2.5E-5", sci(2.5e-5));
    }

    #[test]
    fn test_brmix_needs_both_signatures() -> Result<()> {
        let dir = tempdir()?;
        let path = make_job(
            dir.path(),
            &[("INCAR", ""), ("out", "BRMIX: very serious problems\n")],
        )?;
        let fs_ = Fs::new(dir.path(), false);
        let wf = workflow("")?;
        let job = Job::new(&fs_, &wf, &path)?;
        assert_eq!(None, BRMIX.detect(&job)?);

        fs::write(
            path.join("out"),
            "BRMIX: very serious problems\n the old and the new charge density differ\n",
        )?;
        assert!(BRMIX.detect(&job)?.is_some());
        // brmix only runs after the calculation
        fs::write(path.join("__running__"), "")?;
        assert_eq!(None, Checker::resolve(ON_THE_FLY, &job).check()?);
        Ok(())
    }
}
