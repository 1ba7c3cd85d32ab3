use crate::environment::{EnvironmentInfo, SessionKind};
use std::path::PathBuf;
use std::process::Command;
use tracing::{debug, warn};
use unipac_core::command::Elevation;

/// How privileged commands get wrapped for this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElevationStrategy {
    /// No prefix; the command runs as the current user.
    Direct,
    /// `sudo -A` with the given askpass program.
    SudoAskpass(PathBuf),
    /// Plain `pkexec`, letting it fall back to its internal agent if needed.
    Pkexec,
    /// `pkexec --disable-internal-agent`; used when a real agent is known to
    /// be running, so a failure surfaces instead of a dead text prompt.
    PkexecNoAgent,
}

impl Elevation for ElevationStrategy {
    fn prefix(&self) -> Vec<String> {
        match self {
            ElevationStrategy::Direct => Vec::new(),
            ElevationStrategy::SudoAskpass(_) => vec!["sudo".to_string(), "-A".to_string()],
            ElevationStrategy::Pkexec => vec!["pkexec".to_string()],
            ElevationStrategy::PkexecNoAgent => vec![
                "pkexec".to_string(),
                "--disable-internal-agent".to_string(),
            ],
        }
    }

    fn env(&self) -> Vec<(String, String)> {
        match self {
            ElevationStrategy::SudoAskpass(askpass) => vec![(
                "SUDO_ASKPASS".to_string(),
                askpass.display().to_string(),
            )],
            _ => Vec::new(),
        }
    }
}

/// Liveness check for the graphical polkit binary. A trait so the decision
/// policy stays testable without pkexec installed.
pub trait PolkitProbe {
    fn pkexec_responds(&self) -> bool;
}

pub struct PkexecProbe;

impl PolkitProbe for PkexecProbe {
    fn pkexec_responds(&self) -> bool {
        Command::new("pkexec")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}

/// Picks the elevation strategy for one session. Pure given its inputs;
/// priority order matters and the first matching rule wins.
pub fn select_elevation(env: &EnvironmentInfo, probe: &dyn PolkitProbe) -> ElevationStrategy {
    // tiling environments: graphical polkit dialogs are unreliable there,
    // askpass always wins when one exists
    if env.is_tiling() {
        return match &env.askpass {
            Some(askpass) => ElevationStrategy::SudoAskpass(askpass.clone()),
            None => {
                warn!("tiling environment with no askpass helper; falling back to pkexec");
                ElevationStrategy::Pkexec
            }
        };
    }

    if !env.agent_running && env.session == SessionKind::Wayland {
        return match &env.askpass {
            Some(askpass) => ElevationStrategy::SudoAskpass(askpass.clone()),
            None => ElevationStrategy::Pkexec,
        };
    }

    if env.agent_running {
        // dont trust the agent blindly, a stale entry in /proc or a broken
        // pkexec install would leave the user with no prompt at all
        if probe.pkexec_responds() {
            return ElevationStrategy::PkexecNoAgent;
        }
        debug!("pkexec liveness probe failed despite a running agent");
        return match &env.askpass {
            Some(askpass) => ElevationStrategy::SudoAskpass(askpass.clone()),
            None => ElevationStrategy::Pkexec,
        };
    }

    // last resort: askpass if available, otherwise hope pkexec can prompt
    match &env.askpass {
        Some(askpass) => ElevationStrategy::SudoAskpass(askpass.clone()),
        None => ElevationStrategy::Pkexec,
    }
}
