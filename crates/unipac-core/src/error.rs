use thiserror::Error;

// covers every way an install session can go wrong, per-source or session-wide
#[derive(Error, Debug)]
pub enum Error {
    #[error("No compatible AUR helper installed")]
    NoHelperAvailable,

    #[error("Authentication cancelled by user")]
    AuthCancelled,

    #[error("No askpass program available for sudo")]
    AskpassMissing,

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Process exited with code {0}")]
    ProcessFailed(i32),

    #[error("Process timed out after {0} seconds")]
    Timeout(u64),

    #[error("Another install session is already running")]
    SessionBusy,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
