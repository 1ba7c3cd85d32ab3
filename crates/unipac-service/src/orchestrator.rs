use crate::planner::{CommandPlanner, SystemPlanner};
use crate::session::{InstallSession, SessionHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use unipac_core::{
    CommandSpec, Error, InstallRequest, OutputStream, Result, SessionEvent, SessionState,
};
use unipac_exec::matcher::{matcher_for, Recoverable};
use unipac_exec::progress::{classify, ProgressState};
use unipac_exec::runner::{OutputLine, RunOutcome, Runner};

const EVENT_CAPACITY: usize = 256;

type PlannerFactory = Box<dyn Fn() -> Box<dyn CommandPlanner> + Send + Sync>;

/// The top-level coordinator. Accepts one `InstallRequest` at a time, runs
/// the whole per-source loop on a single supervised background task and
/// broadcasts progress, log and lifecycle events to subscribers.
pub struct Installer {
    planner_factory: PlannerFactory,
    runner: Arc<Runner>,
    events: broadcast::Sender<SessionEvent>,
    active: Arc<AtomicBool>,
}

impl Installer {
    pub fn new() -> Self {
        Self::with_planner(|| Box::new(SystemPlanner::for_session()))
    }

    pub fn with_planner<F>(factory: F) -> Self
    where
        F: Fn() -> Box<dyn CommandPlanner> + Send + Sync + 'static,
    {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            planner_factory: Box::new(factory),
            runner: Arc::new(Runner::new()),
            events,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_runner(mut self, runner: Runner) -> Self {
        self.runner = Arc::new(runner);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Accepts a request and starts its session. Rejects with `SessionBusy`
    /// while another session is active; interleaving elevation prompts from
    /// two privileged processes is unsafe for the user.
    pub fn submit(&self, request: InstallRequest) -> Result<SessionHandle> {
        if request.is_empty() {
            return Err(Error::Other("empty install request".to_string()));
        }
        if self.active.swap(true, Ordering::SeqCst) {
            return Err(Error::SessionBusy);
        }

        let handle = SessionHandle::new();
        // environment is re-evaluated per session, not cached
        let planner = (self.planner_factory)();
        let runner = self.runner.clone();
        let events = self.events.clone();
        let active = self.active.clone();
        let cancel = handle.cancel.clone();
        let id = handle.id();

        tokio::spawn(async move {
            info!(session = id, "install session started");
            let session = run_session(&request, planner.as_ref(), &runner, &cancel, &events).await;
            let state = session.terminal_state();
            info!(
                session = id,
                %state,
                completed = session.completed,
                total = session.total,
                "install session finished"
            );
            let _ = events.send(SessionEvent::Lifecycle {
                state,
                completed: session.completed,
                total: session.total,
            });
            active.store(false, Ordering::SeqCst);
        });

        Ok(handle)
    }
}

impl Default for Installer {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_session(
    request: &InstallRequest,
    planner: &dyn CommandPlanner,
    runner: &Runner,
    cancel: &CancellationToken,
    events: &broadcast::Sender<SessionEvent>,
) -> InstallSession {
    let mut session = InstallSession::new(request.total_tokens());
    let _ = events.send(SessionEvent::Lifecycle {
        state: SessionState::Running,
        completed: 0,
        total: session.total,
    });

    // sources run strictly in request order so elevation prompts never overlap
    for (index, set) in request.sources.iter().enumerate() {
        if cancel.is_cancelled() {
            session.cancelled = true;
            break;
        }

        // empty sets contribute nothing to the totals, nothing to run
        if set.tokens.is_empty() {
            continue;
        }

        if let Some(prep) = planner.prepare(set.source, request.action, &request.options) {
            // optional precondition, failure is not a session failure
            if let Err(e) = run_source(runner, &prep, cancel, events, index).await {
                warn!(source = %set.source, error = %e, "preparation step failed");
            }
            // a cancel that arrived during the prep step must not start the
            // main command
            if cancel.is_cancelled() {
                session.cancelled = true;
                break;
            }
        }

        let spec = match planner.plan(set.source, request.action, &set.tokens, &request.options) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(source = %set.source, error = %e, "command build failed");
                let _ = events.send(SessionEvent::Log {
                    stream: OutputStream::Stderr,
                    text: format!("{}: {}", set.source, e),
                });
                session.record_failure(set.source, e.to_string());
                continue;
            }
        };

        match run_source(runner, &spec, cancel, events, index).await {
            Ok(outcome) if outcome.success() => session.record_success(set.tokens.len()),
            Ok(outcome) if outcome.cancelled => {
                session.cancelled = true;
                break;
            }
            Ok(outcome) => match matcher_for(set.source).and_then(|m| m.classify(&outcome.stderr)) {
                Some(Recoverable::AuthCancelled) => {
                    info!(source = %set.source, "authentication prompt dismissed, stopping session");
                    session.cancelled = true;
                    break;
                }
                Some(Recoverable::AskpassMissing) => {
                    warn!(source = %set.source, "no askpass program configured, stopping session");
                    let _ = events.send(SessionEvent::Log {
                        stream: OutputStream::Stderr,
                        text: format!("{}: {}", set.source, Error::AskpassMissing),
                    });
                    session.cancelled = true;
                    break;
                }
                Some(Recoverable::PermissionDenied) => {
                    retry_elevated(request, planner, runner, cancel, events, index, &mut session)
                        .await;
                    if session.cancelled {
                        break;
                    }
                }
                None => session.record_failure(set.source, format!("exit code {}", outcome.code)),
            },
            Err(e) => {
                warn!(source = %set.source, error = %e, "command run failed");
                session.record_failure(set.source, e.to_string());
            }
        }
    }

    if cancel.is_cancelled() {
        session.cancelled = true;
    }
    session
}

// exactly one retry of the same tokens, elevated; a second failure marks the
// source failed and the session moves on
async fn retry_elevated(
    request: &InstallRequest,
    planner: &dyn CommandPlanner,
    runner: &Runner,
    cancel: &CancellationToken,
    events: &broadcast::Sender<SessionEvent>,
    index: usize,
    session: &mut InstallSession,
) {
    let set = &request.sources[index];
    info!(source = %set.source, "permission denied, retrying elevated");

    let mut opts = request.options;
    opts.force_elevated = true;

    match planner.plan(set.source, request.action, &set.tokens, &opts) {
        Ok(spec) => match run_source(runner, &spec, cancel, events, index).await {
            Ok(outcome) if outcome.success() => session.record_success(set.tokens.len()),
            Ok(outcome) if outcome.cancelled => session.cancelled = true,
            Ok(outcome) => {
                session.record_failure(set.source, format!("exit code {} after elevated retry", outcome.code))
            }
            Err(e) => session.record_failure(set.source, e.to_string()),
        },
        Err(e) => session.record_failure(set.source, e.to_string()),
    }
}

// run one command, re-emitting every output line and any derived progress
async fn run_source(
    runner: &Runner,
    spec: &CommandSpec,
    cancel: &CancellationToken,
    events: &broadcast::Sender<SessionEvent>,
    index: usize,
) -> Result<RunOutcome> {
    let _ = events.send(SessionEvent::Log {
        stream: OutputStream::Stdout,
        text: format!("$ {}", spec),
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let forward_events = events.clone();
    let forward = tokio::spawn(async move {
        let mut progress = ProgressState::default();
        while let Some(line) = rx.recv().await {
            if line.stream == OutputStream::Stdout {
                if let Some(event) = classify(&line.text) {
                    let summary = progress.apply(&event);
                    let _ = forward_events.send(SessionEvent::Progress {
                        source_index: index,
                        event,
                        summary,
                    });
                }
            }
            let _ = forward_events.send(SessionEvent::Log {
                stream: line.stream,
                text: line.text,
            });
        }
    });

    let outcome = runner.run(spec, cancel, tx).await;
    let _ = forward.await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use unipac_core::{Action, InstallOptions, PackageToken, ProgressEvent, Source};

    #[derive(Clone, Default)]
    struct FakePlanner {
        scripts: HashMap<(Source, bool), String>,
        prep_scripts: HashMap<Source, String>,
    }

    impl FakePlanner {
        fn new() -> Self {
            Self::default()
        }

        fn script(mut self, source: Source, elevated: bool, script: &str) -> Self {
            self.scripts.insert((source, elevated), script.to_string());
            self
        }

        fn prep_script(mut self, source: Source, script: &str) -> Self {
            self.prep_scripts.insert(source, script.to_string());
            self
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    impl CommandPlanner for FakePlanner {
        fn plan(
            &self,
            source: Source,
            _action: Action,
            _tokens: &[PackageToken],
            opts: &InstallOptions,
        ) -> unipac_core::Result<CommandSpec> {
            self.scripts
                .get(&(source, opts.force_elevated))
                .map(|script| sh(script))
                .ok_or(Error::NoHelperAvailable)
        }

        fn prepare(
            &self,
            source: Source,
            _action: Action,
            _opts: &InstallOptions,
        ) -> Option<CommandSpec> {
            self.prep_scripts.get(&source).map(|script| sh(script))
        }
    }

    fn installer(planner: FakePlanner) -> Installer {
        Installer::with_planner(move || Box::new(planner.clone()))
    }

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<SessionEvent>,
    ) -> (SessionState, usize, usize) {
        tokio::time::timeout(Duration::from_secs(20), async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Lifecycle {
                        state,
                        completed,
                        total,
                    }) if state.is_terminal() => return (state, completed, total),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("event channel closed before terminal state")
                    }
                }
            }
        })
        .await
        .expect("session did not reach a terminal state")
    }

    #[tokio::test]
    async fn test_all_sources_succeed() {
        let installer = installer(
            FakePlanner::new()
                .script(Source::SystemRepo, false, "echo installed htop; exit 0")
                .script(Source::SandboxedApp, false, "exit 0"),
        );
        let mut rx = installer.subscribe();

        let request = InstallRequest::install()
            .with_source(Source::SystemRepo, ["htop"])
            .with_source(Source::SandboxedApp, ["org.example.App"]);
        installer.submit(request).unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Success);
        assert_eq!(completed, 2);
        assert_eq!(total, 2);
        assert!(!installer.is_busy());
    }

    #[tokio::test]
    async fn test_plain_failure_is_partial() {
        let installer = installer(
            FakePlanner::new().script(Source::SystemRepo, false, "echo unrelated >&2; exit 1"),
        );
        let mut rx = installer.subscribe();

        installer
            .submit(InstallRequest::install().with_source(Source::SystemRepo, ["bad-pkg"]))
            .unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::PartialFailure);
        assert_eq!(completed, 0);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_second_submission_rejected_while_running() {
        let installer =
            installer(FakePlanner::new().script(Source::SystemRepo, false, "sleep 5"));
        let mut rx = installer.subscribe();

        let handle = installer
            .submit(InstallRequest::install().with_source(Source::SystemRepo, ["htop"]))
            .unwrap();

        let err = installer
            .submit(InstallRequest::install().with_source(Source::SystemRepo, ["btop"]))
            .unwrap_err();
        assert!(matches!(err, Error::SessionBusy));

        handle.cancel();
        let (state, _, _) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancellation_stops_remaining_sources() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("second-ran");

        let installer = installer(
            FakePlanner::new()
                .script(Source::SystemRepo, false, "sleep 30")
                .script(
                    Source::SandboxedApp,
                    false,
                    &format!("touch {}; exit 0", marker.display()),
                ),
        );
        let mut rx = installer.subscribe();

        let handle = installer
            .submit(
                InstallRequest::install()
                    .with_source(Source::SystemRepo, ["htop"])
                    .with_source(Source::SandboxedApp, ["org.example.App"]),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();
        handle.cancel(); // idempotent

        let (state, completed, _) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(completed, 0);
        assert!(!marker.exists(), "cancelled session started a later source");
    }

    #[tokio::test]
    async fn test_registry_permission_denied_retries_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("elevated-runs");

        let installer = installer(
            FakePlanner::new()
                .script(
                    Source::LanguageRegistry,
                    false,
                    "echo '[Errno 13] Permission denied' >&2; exit 1",
                )
                .script(
                    Source::LanguageRegistry,
                    true,
                    &format!("echo run >> {}; exit 0", counter.display()),
                ),
        );
        let mut rx = installer.subscribe();

        installer
            .submit(InstallRequest::install().with_source(Source::LanguageRegistry, ["requests"]))
            .unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Success);
        assert_eq!(completed, 1);
        assert_eq!(total, 1);

        let runs = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(runs.lines().count(), 1, "elevated retry ran more than once");
    }

    #[tokio::test]
    async fn test_failed_elevated_retry_marks_source_and_continues() {
        let installer = installer(
            FakePlanner::new()
                .script(
                    Source::LanguageRegistry,
                    false,
                    "echo 'Permission denied' >&2; exit 1",
                )
                .script(Source::LanguageRegistry, true, "exit 1")
                .script(Source::SystemRepo, false, "exit 0"),
        );
        let mut rx = installer.subscribe();

        installer
            .submit(
                InstallRequest::install()
                    .with_source(Source::LanguageRegistry, ["requests"])
                    .with_source(Source::SystemRepo, ["htop"]),
            )
            .unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::PartialFailure);
        assert_eq!(completed, 1);
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_dismissed_auth_prompt_cancels_session() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("repo-ran");

        let installer = installer(
            FakePlanner::new()
                .script(
                    Source::CommunityHelper,
                    false,
                    "echo 'Error executing command as another user: Request dismissed' >&2; exit 126",
                )
                .script(
                    Source::SystemRepo,
                    false,
                    &format!("touch {}; exit 0", marker.display()),
                ),
        );
        let mut rx = installer.subscribe();

        installer
            .submit(
                InstallRequest::install()
                    .with_source(Source::CommunityHelper, ["paru-bin"])
                    .with_source(Source::SystemRepo, ["htop"]),
            )
            .unwrap();

        let (state, completed, _) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(completed, 0);
        assert!(
            !marker.exists(),
            "sources after an auth cancellation must not start"
        );
    }

    #[tokio::test]
    async fn test_missing_askpass_stops_session() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("repo-ran");

        let installer = installer(
            FakePlanner::new()
                .script(
                    Source::CommunityHelper,
                    false,
                    "echo 'sudo: no askpass program specified, try setting SUDO_ASKPASS' >&2; exit 1",
                )
                .script(
                    Source::SystemRepo,
                    false,
                    &format!("touch {}; exit 0", marker.display()),
                ),
        );
        let mut rx = installer.subscribe();

        installer
            .submit(
                InstallRequest::install()
                    .with_source(Source::CommunityHelper, ["paru-bin"])
                    .with_source(Source::SystemRepo, ["htop"]),
            )
            .unwrap();

        let (state, completed, _) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(completed, 0);
        assert!(
            !marker.exists(),
            "sources after a missing-askpass stop must not start"
        );
    }

    #[tokio::test]
    async fn test_empty_token_set_does_not_break_completed_count() {
        // requests built by hand can still carry an empty set
        let installer = installer(
            FakePlanner::new().script(Source::SandboxedApp, false, "exit 0"),
        );
        let mut rx = installer.subscribe();

        let mut request =
            InstallRequest::install().with_source(Source::SandboxedApp, ["org.example.App"]);
        request.sources.insert(
            0,
            unipac_core::SourceSet {
                source: Source::SystemRepo,
                tokens: Vec::new(),
            },
        );
        installer.submit(request).unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Success);
        assert_eq!(completed, 1);
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_prepare_skips_main_command() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("install-ran");

        let installer = installer(
            FakePlanner::new()
                .prep_script(Source::SandboxedApp, "sleep 30")
                .script(
                    Source::SandboxedApp,
                    false,
                    &format!("touch {}; exit 0", marker.display()),
                ),
        );
        let mut rx = installer.subscribe();

        let handle = installer
            .submit(InstallRequest::install().with_source(Source::SandboxedApp, ["org.example.App"]))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.cancel();

        let (state, completed, _) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::Cancelled);
        assert_eq!(completed, 0);
        assert!(
            !marker.exists(),
            "a cancel during the prep step still spawned the install command"
        );
    }

    #[tokio::test]
    async fn test_build_failure_continues_to_next_source() {
        // no script registered for the helper, so plan() fails for it
        let installer =
            installer(FakePlanner::new().script(Source::SystemRepo, false, "exit 0"));
        let mut rx = installer.subscribe();

        installer
            .submit(
                InstallRequest::install()
                    .with_source(Source::CommunityHelper, ["paru-bin"])
                    .with_source(Source::SystemRepo, ["htop"]),
            )
            .unwrap();

        let (state, completed, total) = wait_terminal(&mut rx).await;
        assert_eq!(state, SessionState::PartialFailure);
        assert_eq!(completed, 1);
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn test_empty_request_rejected() {
        let installer = installer(FakePlanner::new());
        let err = installer.submit(InstallRequest::install()).unwrap_err();
        assert!(matches!(err, Error::Other(_)));
        assert!(!installer.is_busy());
    }

    #[tokio::test]
    async fn test_progress_events_reemitted() {
        let installer = installer(FakePlanner::new().script(
            Source::SystemRepo,
            false,
            "echo 'downloading htop 1.2 MiB'; echo '[ 50%]'; echo 'htop installed'; exit 0",
        ));
        let mut rx = installer.subscribe();

        installer
            .submit(InstallRequest::install().with_source(Source::SystemRepo, ["htop"]))
            .unwrap();

        let mut progress = Vec::new();
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Progress { event, summary, .. }) => {
                    progress.push((event, summary))
                }
                Ok(SessionEvent::Lifecycle { state, .. }) if state.is_terminal() => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }

        assert_eq!(
            progress[0].0,
            ProgressEvent::Download("downloading 1.2 MiB".to_string())
        );
        assert_eq!(progress[1].1, "downloading 1.2 MiB 50%");
        assert_eq!(progress[2].0, ProgressEvent::Installed);
    }
}
