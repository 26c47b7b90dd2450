/// Allowed edges and the sentinel swap itself
mod transition;
pub use transition::{force, is_allowed, transition, Error};

/// Per-bucket handling of one job per cycle
mod update;
pub use update::{park, Outcome, Updater};
