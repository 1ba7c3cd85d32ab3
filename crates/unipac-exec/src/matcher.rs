//! Recoverable-condition detection on subprocess stderr.
//!
//! This is advisory string matching against tool output, not a stable
//! contract; keeping it behind a trait means the patterns can change without
//! touching orchestration logic.

use unipac_core::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recoverable {
    /// The user dismissed or failed an authentication prompt. A cancellation,
    /// not a failure.
    AuthCancelled,
    /// sudo had no askpass program to call. Environment-configuration error,
    /// surfaced distinctly from a dismissal even though both stop the session.
    AskpassMissing,
    /// Worth one elevated retry for the language registry.
    PermissionDenied,
}

pub trait RecoverableMatcher: Send + Sync {
    fn classify(&self, stderr: &str) -> Option<Recoverable>;
}

// polkit and sudo phrasings for a dismissed prompt
const AUTH_CANCELLED_MARKERS: &[&str] = &[
    "request dismissed",
    "authentication cancelled",
    "authentication canceled",
    "dismissed the authentication",
    "not authorized",
    "error executing command as another user",
];

const ASKPASS_MISSING_MARKERS: &[&str] = &[
    "no askpass program specified",
    "askpass program not found",
    "a terminal is required to read the password",
];

const PERMISSION_MARKERS: &[&str] = &[
    "permission denied",
    "errno 13",
    "eacces",
    "consider using the `--user` option",
];

/// Matcher for the AUR helper: its privileged steps prompt via polkit/sudo,
/// so a dismissal shows up in stderr rather than as a distinct exit code.
pub struct HelperAuthMatcher;

impl RecoverableMatcher for HelperAuthMatcher {
    fn classify(&self, stderr: &str) -> Option<Recoverable> {
        let lower = stderr.to_lowercase();
        // missing askpass first: its phrasing can also mention authentication
        if ASKPASS_MISSING_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Recoverable::AskpassMissing);
        }
        if AUTH_CANCELLED_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Recoverable::AuthCancelled);
        }
        None
    }
}

/// Matcher for pip: an unprivileged install into a system prefix fails with a
/// permission error and deserves one elevated retry.
pub struct RegistryPermissionMatcher;

impl RecoverableMatcher for RegistryPermissionMatcher {
    fn classify(&self, stderr: &str) -> Option<Recoverable> {
        let lower = stderr.to_lowercase();
        if PERMISSION_MARKERS.iter().any(|m| lower.contains(m)) {
            return Some(Recoverable::PermissionDenied);
        }
        None
    }
}

/// The matcher that applies to a source's stderr, if any.
pub fn matcher_for(source: Source) -> Option<Box<dyn RecoverableMatcher>> {
    match source {
        Source::CommunityHelper => Some(Box::new(HelperAuthMatcher)),
        Source::LanguageRegistry => Some(Box::new(RegistryPermissionMatcher)),
        Source::SystemRepo | Source::SandboxedApp => None,
    }
}
