use std::path::PathBuf;
use tracing::debug;

/// Minimal/tiling environments where graphical polkit dialogs are unreliable.
pub const TILING_DESKTOPS: &[&str] = &[
    "i3", "sway", "hyprland", "bspwm", "dwm", "qtile", "awesome", "xmonad", "river",
];

// askpass programs worth looking for, roughly by how common they are
const ASKPASS_PROGRAMS: &[&str] = &[
    "ksshaskpass",
    "ssh-askpass",
    "lxqt-openssh-askpass",
    "x11-ssh-askpass",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Wayland,
    X11,
    Other,
}

/// Snapshot of the desktop/session facts the broker decides on. Built once
/// per install session by `detect()`; everything downstream is pure.
#[derive(Debug, Clone)]
pub struct EnvironmentInfo {
    /// Lowercased desktop identifier (XDG_CURRENT_DESKTOP or DESKTOP_SESSION).
    pub desktop: String,
    pub session: SessionKind,
    /// A compositor-specific marker variable was present (SWAYSOCK,
    /// HYPRLAND_INSTANCE_SIGNATURE).
    pub compositor_marker: bool,
    /// A polkit authentication agent process is running.
    pub agent_running: bool,
    /// Askpass helper, either configured via SUDO_ASKPASS or discovered on
    /// PATH.
    pub askpass: Option<PathBuf>,
}

impl EnvironmentInfo {
    pub fn detect() -> Self {
        let desktop = std::env::var("XDG_CURRENT_DESKTOP")
            .or_else(|_| std::env::var("DESKTOP_SESSION"))
            .unwrap_or_default()
            .to_lowercase();

        let session = match std::env::var("XDG_SESSION_TYPE").as_deref() {
            Ok("wayland") => SessionKind::Wayland,
            Ok("x11") => SessionKind::X11,
            _ => SessionKind::Other,
        };

        let compositor_marker = std::env::var_os("SWAYSOCK").is_some()
            || std::env::var_os("HYPRLAND_INSTANCE_SIGNATURE").is_some();

        let askpass = configured_askpass().or_else(find_askpass);
        let agent_running = polkit_agent_running();

        let info = Self {
            desktop,
            session,
            compositor_marker,
            agent_running,
            askpass,
        };
        debug!(?info, "detected session environment");
        info
    }

    pub fn is_tiling(&self) -> bool {
        self.compositor_marker || TILING_DESKTOPS.iter().any(|d| self.desktop.contains(d))
    }
}

fn configured_askpass() -> Option<PathBuf> {
    let path = PathBuf::from(std::env::var_os("SUDO_ASKPASS")?);
    path.is_file().then_some(path)
}

fn find_askpass() -> Option<PathBuf> {
    ASKPASS_PROGRAMS
        .iter()
        .find_map(|p| which::which(p).ok())
}

// desktops whose agent runs inside the shell process itself, so no
// "polkit" substring ever shows up in /proc
const SHELL_AGENTS: &[&str] = &["gnome-shell", "plasmashell"];

// comm is truncated to 15 chars, so "agent" may be cut off; match on the
// framework name instead. polkitd itself doesnt count, it has no UI
fn agent_comm(comm: &str) -> bool {
    if comm == "polkitd" {
        return false;
    }
    comm.contains("polkit")
        || comm.contains("policykit")
        || SHELL_AGENTS.contains(&comm)
}

// scan /proc comm names for a polkit agent
fn polkit_agent_running() -> bool {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return false;
    };

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().filter(|n| n.bytes().all(|b| b.is_ascii_digit())) else {
            continue;
        };
        let Ok(comm) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) else {
            continue;
        };
        if agent_comm(comm.trim()) {
            return true;
        }
    }

    false
}
