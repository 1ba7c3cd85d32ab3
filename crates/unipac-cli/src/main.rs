//! unipac - install, remove and update packages across pacman, the AUR,
//! flatpak and pip from a single frontend.

use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use unipac_core::{Action, InstallRequest, OutputStream, SessionEvent, SessionState, Source};
use unipac_service::Installer;

#[derive(Parser)]
#[command(name = "unipac", version, about = "Multi-source package install frontend")]
struct Cli {
    /// Emit session events as JSON lines instead of plain text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Install packages
    Install(Targets),
    /// Remove packages
    Remove(Targets),
    /// Update packages
    Update(Targets),
}

#[derive(Args)]
struct Targets {
    /// Packages from the distribution repositories
    #[arg(long = "repo", value_name = "PKG")]
    repo: Vec<String>,

    /// Packages from the AUR
    #[arg(long = "aur", value_name = "PKG")]
    aur: Vec<String>,

    /// Flatpak application IDs (org.example.App)
    #[arg(long = "flatpak", value_name = "APP_ID")]
    flatpak: Vec<String>,

    /// Packages from PyPI
    #[arg(long = "pip", value_name = "PKG")]
    pip: Vec<String>,

    /// Run with elevated privileges (system-wide flatpak and pip)
    #[arg(long)]
    elevated: bool,
}

impl Targets {
    fn into_request(self, action: Action) -> InstallRequest {
        let mut request = InstallRequest::new(action);
        for (source, tokens) in [
            (Source::SystemRepo, self.repo),
            (Source::CommunityHelper, self.aur),
            (Source::SandboxedApp, self.flatpak),
            (Source::LanguageRegistry, self.pip),
        ] {
            if !tokens.is_empty() {
                request = request.with_source(source, tokens);
            }
        }
        if self.elevated {
            request = request.elevated();
        }
        request
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let (action, targets) = match cli.command {
        Command::Install(t) => (Action::Install, t),
        Command::Remove(t) => (Action::Uninstall, t),
        Command::Update(t) => (Action::Update, t),
    };

    let request = targets.into_request(action);
    if request.is_empty() {
        bail!("nothing to do; pass at least one of --repo/--aur/--flatpak/--pip");
    }

    let installer = Installer::new();
    let mut events = installer.subscribe();
    let handle = installer.submit(request)?;

    // Ctrl-C requests cooperative cancellation; the running command gets a
    // terminate signal within one polling interval
    let cancel_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling, waiting for the current command to stop...");
            cancel_handle.cancel();
        }
    });

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => bail!("event stream closed unexpectedly"),
        };

        if cli.json {
            println!("{}", serde_json::to_string(&event)?);
            if let SessionEvent::Lifecycle { state, .. } = event {
                if state.is_terminal() {
                    if state != SessionState::Success {
                        std::process::exit(1);
                    }
                    return Ok(());
                }
            }
            continue;
        }

        match event {
            SessionEvent::Log { stream, text } => match stream {
                OutputStream::Stdout => println!("{}", text),
                OutputStream::Stderr => eprintln!("{}", text),
            },
            SessionEvent::Progress { summary, .. } => {
                if !summary.is_empty() {
                    println!(":: {}", summary);
                }
            }
            SessionEvent::Lifecycle {
                state,
                completed,
                total,
            } => {
                if state.is_terminal() {
                    println!("{}: {}/{} packages", state, completed, total);
                    if state != SessionState::Success {
                        std::process::exit(1);
                    }
                    return Ok(());
                }
            }
        }
    }
}
