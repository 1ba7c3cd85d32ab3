use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use unipac_core::{SessionState, Source};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Mutable runtime state for one orchestrator run. Only the session task
/// writes it; totals are fixed at creation and the completed count never
/// exceeds them.
#[derive(Debug)]
pub struct InstallSession {
    pub total: usize,
    pub completed: usize,
    pub failed_sources: Vec<(Source, String)>,
    pub cancelled: bool,
}

impl InstallSession {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            failed_sources: Vec::new(),
            cancelled: false,
        }
    }

    pub fn record_success(&mut self, tokens: usize) {
        self.completed = (self.completed + tokens).min(self.total);
    }

    pub fn record_failure(&mut self, source: Source, reason: impl Into<String>) {
        self.failed_sources.push((source, reason.into()));
    }

    pub fn terminal_state(&self) -> SessionState {
        if self.cancelled {
            SessionState::Cancelled
        } else if self.failed_sources.is_empty() {
            SessionState::Success
        } else {
            SessionState::PartialFailure
        }
    }
}

/// Caller-side handle to a running session. Cancellation is cooperative and
/// idempotent; cancelling after the terminal state is a no-op.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: u64,
    pub(crate) cancel: CancellationToken,
}

impl SessionHandle {
    pub(crate) fn new() -> Self {
        Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completed_is_bounded_by_total() {
        let mut session = InstallSession::new(3);
        session.record_success(2);
        session.record_success(2);
        assert_eq!(session.completed, 3);
    }

    #[test]
    fn test_terminal_state_priority() {
        let mut session = InstallSession::new(2);
        assert_eq!(session.terminal_state(), SessionState::Success);

        session.record_failure(Source::SystemRepo, "exit code 1");
        assert_eq!(session.terminal_state(), SessionState::PartialFailure);

        // cancellation wins over failures
        session.cancelled = true;
        assert_eq!(session.terminal_state(), SessionState::Cancelled);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let handle = SessionHandle::new();
        assert!(!handle.is_cancelled());
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());
    }
}
