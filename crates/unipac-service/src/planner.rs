use tracing::info;
use unipac_auth::{select_elevation, ElevationStrategy, EnvironmentInfo, PkexecProbe};
use unipac_core::{
    Action, CommandBuilder, CommandSpec, InstallOptions, PackageToken, Result, Source, ToolPaths,
};

/// Produces the concrete commands for one session. The seam that lets tests
/// substitute plain shell commands for the real package tools.
pub trait CommandPlanner: Send + Sync {
    fn plan(
        &self,
        source: Source,
        action: Action,
        tokens: &[PackageToken],
        opts: &InstallOptions,
    ) -> Result<CommandSpec>;

    /// Best-effort preparation for a source (e.g. registering the default
    /// flatpak remote). Failures of the returned command are ignored.
    fn prepare(&self, source: Source, action: Action, opts: &InstallOptions)
        -> Option<CommandSpec>;
}

/// The production planner: evaluates the session environment once, picks an
/// elevation strategy, and composes the command builder with it.
pub struct SystemPlanner {
    builder: CommandBuilder,
    strategy: ElevationStrategy,
}

impl SystemPlanner {
    /// Re-evaluates the environment. Called once per session, never cached
    /// for the process lifetime.
    pub fn for_session() -> Self {
        let env = EnvironmentInfo::detect();
        let strategy = select_elevation(&env, &PkexecProbe);
        info!(?strategy, "elevation strategy for this session");

        Self {
            builder: CommandBuilder::new(ToolPaths::discover()),
            strategy,
        }
    }
}

impl CommandPlanner for SystemPlanner {
    fn plan(
        &self,
        source: Source,
        action: Action,
        tokens: &[PackageToken],
        opts: &InstallOptions,
    ) -> Result<CommandSpec> {
        self.builder.build(source, action, tokens, opts, &self.strategy)
    }

    fn prepare(
        &self,
        source: Source,
        action: Action,
        opts: &InstallOptions,
    ) -> Option<CommandSpec> {
        // only installs need the public remote to exist
        if source == Source::SandboxedApp && action == Action::Install {
            Some(self.builder.remote_setup(opts))
        } else {
            None
        }
    }
}
