//! Child process execution and output interpretation.

pub mod matcher;
pub mod progress;
pub mod runner;

pub use matcher::{matcher_for, Recoverable, RecoverableMatcher};
pub use progress::{classify, ProgressState};
pub use runner::{OutputLine, RunOutcome, Runner};
