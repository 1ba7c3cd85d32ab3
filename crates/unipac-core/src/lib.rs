pub mod command;
pub mod error;
pub mod event;
pub mod source;

// re-export the main types so consumers dont have to dig around
pub use command::{CommandBuilder, CommandSpec, Elevation, ToolPaths};
pub use error::{Error, Result};
pub use event::{OutputStream, ProgressEvent, SessionEvent, SessionState};
pub use source::{Action, InstallOptions, InstallRequest, PackageToken, Source, SourceSet};
