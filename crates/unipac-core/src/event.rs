use serde::{Deserialize, Serialize};
use std::fmt;

/// Coarse progress derived from tool output. Advisory only, never drives
/// control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProgressEvent {
    /// A download with its parsed size, e.g. "downloading 12.4 MiB".
    Download(String),
    /// A bracketed percentage, e.g. "42%".
    Percent(String),
    /// The tool reported a package as installed or upgraded; transient
    /// download/percent state is stale from here on.
    Installed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Running,
    Success,
    PartialFailure,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionState::Running)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Running => write!(f, "running"),
            SessionState::Success => write!(f, "success"),
            SessionState::PartialFailure => write!(f, "partial failure"),
            SessionState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Everything a subscriber can observe about a session. Delivery thread is
/// the subscriber's problem; the orchestrator never touches UI state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionEvent {
    Log {
        stream: OutputStream,
        text: String,
    },
    Progress {
        source_index: usize,
        event: ProgressEvent,
        /// Free-text status line combining the transient download and percent
        /// state for this source.
        summary: String,
    },
    Lifecycle {
        state: SessionState,
        completed: usize,
        total: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Success.is_terminal());
        assert!(SessionState::PartialFailure.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
    }
}
