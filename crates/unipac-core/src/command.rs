use crate::error::{Error, Result};
use crate::source::{Action, InstallOptions, PackageToken, Source};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// AUR helpers we know how to drive, in preference order.
pub const AUR_HELPERS: &[&str] = &["yay", "paru", "pikaur", "trizen"];

pub const DEFAULT_FLATPAK_REMOTE: &str = "flathub";
pub const FLATHUB_URL: &str = "https://dl.flathub.org/repo/flathub.flatpakrepo";

/// An executable argument vector plus an environment overlay. Never mutated
/// after construction; the runner applies `env` on top of the inherited
/// environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            env: Vec::new(),
        }
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.argv.join(" "))
    }
}

/// The argument prefix (and environment) used to run a command with
/// administrative privileges. Implemented by the auth broker's strategies.
pub trait Elevation {
    fn prefix(&self) -> Vec<String>;

    fn env(&self) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Snapshot of the tools and paths command construction depends on, taken
/// once per session so building stays pure.
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    /// First AUR helper found on PATH, if any.
    pub helper: Option<String>,
    pub home: Option<PathBuf>,
    /// PATH at snapshot time, for the pip user-prefix overlay.
    pub path: Option<String>,
}

impl ToolPaths {
    pub fn discover() -> Self {
        let helper = AUR_HELPERS
            .iter()
            .find(|h| which::which(h).is_ok())
            .map(|h| h.to_string());

        Self {
            helper,
            home: dirs::home_dir(),
            path: std::env::var("PATH").ok(),
        }
    }
}

/// Maps `(source, action, tokens)` plus session flags to a runnable command.
/// Pure given its `ToolPaths`; side effects like remote registration are
/// returned as separate specs for the caller to run.
pub struct CommandBuilder {
    tools: ToolPaths,
}

impl CommandBuilder {
    pub fn new(tools: ToolPaths) -> Self {
        Self { tools }
    }

    pub fn build(
        &self,
        source: Source,
        action: Action,
        tokens: &[PackageToken],
        opts: &InstallOptions,
        elevation: &dyn Elevation,
    ) -> Result<CommandSpec> {
        if tokens.is_empty() {
            return Err(Error::Other(format!("no packages requested for {}", source)));
        }

        match source {
            Source::SystemRepo => {
                // always privileged
                Ok(wrap(pacman_argv("pacman", action, tokens), elevation))
            }
            Source::CommunityHelper => {
                let helper = self.tools.helper.as_deref().ok_or(Error::NoHelperAvailable)?;
                // the helper elevates its own privileged steps, but still needs
                // a working graphical prompt channel, so the whole invocation
                // goes through pkexec rather than the session strategy
                let mut argv = vec!["pkexec".to_string()];
                argv.extend(pacman_argv(helper, action, tokens));
                Ok(CommandSpec::new(argv))
            }
            Source::SandboxedApp => {
                let argv = flatpak_argv(action, tokens, opts.force_elevated);
                if opts.force_elevated {
                    Ok(wrap(argv, elevation))
                } else {
                    Ok(CommandSpec::new(argv))
                }
            }
            Source::LanguageRegistry => {
                if opts.force_elevated {
                    Ok(wrap(pip_argv(action, tokens, false), elevation))
                } else {
                    let mut spec = CommandSpec::new(pip_argv(action, tokens, true));
                    spec.env = self.user_prefix_env();
                    Ok(spec)
                }
            }
        }
    }

    /// Idempotent registration of the default public flatpak remote. Run
    /// best-effort before a flatpak install; a failure here is not fatal.
    pub fn remote_setup(&self, opts: &InstallOptions) -> CommandSpec {
        let scope = if opts.force_elevated {
            "--system"
        } else {
            "--user"
        };
        CommandSpec::new(
            [
                "flatpak",
                "remote-add",
                "--if-not-exists",
                scope,
                DEFAULT_FLATPAK_REMOTE,
                FLATHUB_URL,
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        )
    }

    // redirect the install prefix into the user's home and make its bin
    // directory win on PATH
    fn user_prefix_env(&self) -> Vec<(String, String)> {
        let Some(home) = &self.tools.home else {
            return Vec::new();
        };
        let base = home.join(".local");
        let path = match &self.tools.path {
            Some(path) => format!("{}/bin:{}", base.display(), path),
            None => format!("{}/bin", base.display()),
        };
        vec![
            ("PYTHONUSERBASE".to_string(), base.display().to_string()),
            ("PATH".to_string(), path),
        ]
    }
}

fn wrap(argv: Vec<String>, elevation: &dyn Elevation) -> CommandSpec {
    let mut full = elevation.prefix();
    full.extend(argv);
    CommandSpec {
        argv: full,
        env: elevation.env(),
    }
}

// pacman and the AUR helpers share the same flag surface
fn pacman_argv(tool: &str, action: Action, tokens: &[PackageToken]) -> Vec<String> {
    let mut argv = vec![tool.to_string()];
    match action {
        Action::Install => argv.extend(["-S".to_string(), "--noconfirm".to_string()]),
        Action::Uninstall => argv.extend(["-R".to_string(), "--noconfirm".to_string()]),
        Action::Update => argv.extend(["-Syu".to_string(), "--noconfirm".to_string()]),
    }
    argv.extend(tokens.iter().map(|t| t.0.clone()));
    argv
}

fn flatpak_argv(action: Action, tokens: &[PackageToken], system_wide: bool) -> Vec<String> {
    let scope = if system_wide { "--system" } else { "--user" };
    let mut argv = vec!["flatpak".to_string()];
    match action {
        Action::Install => {
            argv.extend(["install".to_string(), "-y".to_string(), scope.to_string()]);
            argv.push(DEFAULT_FLATPAK_REMOTE.to_string());
        }
        Action::Uninstall => {
            argv.extend(["uninstall".to_string(), "-y".to_string(), scope.to_string()]);
        }
        Action::Update => {
            argv.extend(["update".to_string(), "-y".to_string(), scope.to_string()]);
        }
    }
    argv.extend(tokens.iter().map(|t| t.0.clone()));
    argv
}

fn pip_argv(action: Action, tokens: &[PackageToken], user_mode: bool) -> Vec<String> {
    let mut argv = vec!["pip".to_string()];
    match action {
        Action::Install => {
            argv.push("install".to_string());
            if user_mode {
                argv.push("--user".to_string());
            }
        }
        Action::Uninstall => {
            // pip uninstall finds user-site packages without a flag
            argv.extend(["uninstall".to_string(), "-y".to_string()]);
        }
        Action::Update => {
            argv.extend(["install".to_string(), "--upgrade".to_string()]);
            if user_mode {
                argv.push("--user".to_string());
            }
        }
    }
    argv.extend(tokens.iter().map(|t| t.0.clone()));
    argv
}
