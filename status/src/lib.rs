//!
//! A job's status lives entirely on disk, as a zero-byte (or tag-holding)
//! sentinel file named `__<status>__` inside the job directory.
//!
//! This crate defines the sentinel vocabulary ([`Status`]), the bucket map
//! that groups job paths by status ([`Buckets`]), and the read-only
//! [`Scanner`] that walks a root directory of material folders and
//! classifies every job directory it finds.
//!
//! The scanner never writes. Everything that mutates sentinels lives in the
//! main crate, which applies changes and reports them as [`StatusChange`]s.

/// status vocabulary and sentinel file names
mod sentinel;
pub use sentinel::Status;

/// job paths grouped by status
mod buckets;
pub use buckets::{Buckets, StatusChange};

/// read-only classification of a job tree
mod scanner;
pub use scanner::{classify, job_dirs, ScanScope, Scanner};

/// Per-job archive of backup snapshots; never scanned for jobs.
pub const ERROR_ARCHIVE: &str = "error_folder";

/// A directory is a job iff it holds this stage-input file.
pub const STAGE_INPUT: &str = "INCAR";

/// Marks a material folder whose every stage is final, so scans can skip it.
pub const MATERIAL_COMPLETE: &str = "__complete__";
