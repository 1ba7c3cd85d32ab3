//! Privilege-elevation strategy selection.
//!
//! Decides how a privileged command gets its authentication prompt: a
//! graphical polkit dialog, or `sudo -A` with an askpass helper. Evaluated
//! fresh for every install session because the user's environment can change
//! between sessions.

pub mod broker;
pub mod environment;

pub use broker::{select_elevation, ElevationStrategy, PkexecProbe, PolkitProbe};
pub use environment::{EnvironmentInfo, SessionKind};
