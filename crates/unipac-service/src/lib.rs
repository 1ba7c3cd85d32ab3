//! Install session orchestration.

pub mod orchestrator;
pub mod planner;
pub mod session;

pub use orchestrator::Installer;
pub use planner::{CommandPlanner, SystemPlanner};
pub use session::{InstallSession, SessionHandle};
