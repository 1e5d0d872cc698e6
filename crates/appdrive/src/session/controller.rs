use super::launch_wait::{LaunchWait, wait_for_launch};
use super::stages::{Stage, pipeline, resolve_app};
use super::{Collaborators, DeathWatch, SessionDeath, SessionState};
use crate::config::{DeviceKind, Orientation, SessionArgs};
use crate::context::ContextEngine;
use crate::device::{DeviceInfo, ResetOptions, session_preferences};
use crate::dispatch::{CommandQueue, CommandResult, DispatchState};
use crate::instruments::{ExitWatch, Supervisor};
use crate::{DriverError, Result};
use appdrive_protocol::CommandResponse;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const BUNDLE_ID_PROBE: &str = "au.bundleId()";
pub const BOOTSTRAP_PREFIX: &str = "setBootstrapConfig: ";

pub fn orientation_payload(orientation: Orientation) -> String {
    let name = match orientation {
        Orientation::Portrait => "PORTRAIT",
        Orientation::Landscape => "LANDSCAPE",
    };
    format!("au.setOrientation('{}')", name)
}

/// Handles that exist only while a session is starting or running.
struct ActiveSession {
    args: SessionArgs,
    queue: CommandQueue,
    contexts: Arc<ContextEngine>,
}

/// Everything start, stop and recovery mutate. Guarded by one lock so the
/// three never interleave.
struct Lifecycle {
    supervisor: Supervisor,
    generation: u64,
    device: Option<DeviceInfo>,
    app_path: Option<PathBuf>,
    bundle_id: Option<String>,
    orientation: Option<Orientation>,
    logs_started: bool,
    watcher: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl Lifecycle {
    fn device(&self) -> Result<&DeviceInfo> {
        self.device
            .as_ref()
            .ok_or_else(|| DriverError::Configuration("No device has been detected".to_string()))
    }
}

struct Inner {
    collaborators: Collaborators,
    dispatch: Arc<DispatchState>,
    state: watch::Sender<SessionState>,
    lifecycle: Mutex<Lifecycle>,
    session: RwLock<Option<Arc<ActiveSession>>>,
    launch_wait: LaunchWait,
}

/// Runs one session at a time against a device and an instrumentation engine.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(collaborators: Collaborators) -> Self {
        Self::with_launch_wait(collaborators, LaunchWait::default())
    }

    pub fn with_launch_wait(collaborators: Collaborators, launch_wait: LaunchWait) -> Self {
        let dispatch = DispatchState::new();
        let supervisor = Supervisor::new(collaborators.backend.clone(), dispatch.clone());
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                collaborators,
                dispatch,
                state,
                lifecycle: Mutex::new(Lifecycle {
                    supervisor,
                    generation: 0,
                    device: None,
                    app_path: None,
                    bundle_id: None,
                    orientation: None,
                    logs_started: false,
                    watcher: None,
                    worker: None,
                }),
                session: RwLock::new(None),
                launch_wait,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.dispatch.is_shutting_down()
    }

    /// Whether a command is currently in flight against the engine.
    pub async fn has_pending_command(&self) -> bool {
        !self.inner.dispatch.pending.is_empty().await
    }

    /// Runs the startup pipeline for `args`.
    ///
    /// The returned watch fires once if the engine later dies on its own.
    /// A failing stage aborts the pipeline, tears down what was started and
    /// returns the error wrapped with the stage it came from.
    pub async fn start(&self, args: SessionArgs) -> Result<DeathWatch> {
        let args = args.with_env_overrides();
        args.validate()?;

        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        let current = self.state();
        if !current.is_startable() || lifecycle.supervisor.is_active() {
            return Err(DriverError::Configuration(format!(
                "Cannot start a session while another is {}",
                current
            )));
        }

        let kind = args.device_kind();
        lifecycle.generation += 1;
        lifecycle.bundle_id = args.bundle_id.clone();
        inner.dispatch.set_shutting_down(false);
        inner.dispatch.clear_exit().await;
        inner.set_state(SessionState::Starting(kind));

        let (queue, worker) = CommandQueue::spawn(inner.dispatch.clone(), args.command_timeout());
        lifecycle.worker = Some(worker);
        let contexts = Arc::new(ContextEngine::new(
            queue.clone(),
            inner.dispatch.gates.clone(),
            inner.collaborators.debugger.clone(),
        ));
        let session = Arc::new(ActiveSession {
            args,
            queue,
            contexts,
        });
        *inner.session.write().await = Some(session.clone());

        let (died_tx, died_rx) = oneshot::channel();
        let mut died_tx = Some(died_tx);

        for &stage in pipeline(kind) {
            debug!(stage = %stage, "Entering stage");
            let result = if let Some(code) = inner.dispatch.engine_exit().await {
                Err(DriverError::UnexpectedProcessExit { code })
            } else {
                inner.run_stage(stage, &mut lifecycle, &session, &mut died_tx).await
            };

            if let Err(e) = result {
                let e = e.in_stage(stage);
                error!("Session start failed: {}", e);
                inner.set_state(SessionState::Stopping);
                inner.shutdown(&mut lifecycle, false).await;
                inner.set_state(SessionState::Stopped);
                return Err(e);
            }
        }

        inner.set_state(SessionState::Running);
        Ok(died_rx)
    }

    /// Stops the engine if one runs, then cleans up. Safe to call repeatedly.
    pub async fn stop(&self) -> Result<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        let state = self.state();
        info!(%state, "Stopping session");

        if state != SessionState::Idle {
            inner.set_state(SessionState::Stopping);
        }
        inner.shutdown(&mut lifecycle, false).await;
        if state != SessionState::Idle {
            inner.set_state(SessionState::Stopped);
        }
        Ok(())
    }

    /// Enqueues `payload` for the running session.
    ///
    /// Without a session the command resolves immediately with no result.
    pub async fn submit(&self, payload: impl Into<String>) -> oneshot::Receiver<CommandResult> {
        match self.inner.active().await {
            Some(session) => session.queue.submit(payload),
            None => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(Ok(None));
                rx
            }
        }
    }

    pub async fn execute(&self, payload: impl Into<String>) -> CommandResult {
        match self.inner.active().await {
            Some(session) => session.queue.execute(payload).await,
            None => Ok(None),
        }
    }

    pub async fn contexts(&self) -> Result<Vec<String>> {
        self.inner.require_active().await?.contexts.contexts().await
    }

    pub async fn current_context(&self) -> Option<String> {
        match self.inner.active().await {
            Some(session) => Some(session.contexts.current_context().await),
            None => None,
        }
    }

    pub async fn set_context(&self, name: &str) -> Result<()> {
        self.inner.require_active().await?.contexts.set_context(name).await
    }
}

impl Inner {
    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        info!(from = %previous, to = %state, "Session state changed");
    }

    async fn active(&self) -> Option<Arc<ActiveSession>> {
        self.session.read().await.clone()
    }

    async fn require_active(&self) -> Result<Arc<ActiveSession>> {
        self.active()
            .await
            .ok_or_else(|| DriverError::Configuration("No active session".to_string()))
    }

    async fn run_stage(
        self: &Arc<Self>,
        stage: Stage,
        lifecycle: &mut Lifecycle,
        session: &ActiveSession,
        died: &mut Option<oneshot::Sender<SessionDeath>>,
    ) -> Result<()> {
        let args = &session.args;
        let target = self.collaborators.targets.for_kind(args.device_kind());

        match stage {
            Stage::DetectDevice => {
                let device = target.detect(args).await?;
                info!(udid = %device.udid, name = %device.name, "Detected device");
                lifecycle.device = Some(device);
            }
            Stage::ResolveApp => {
                lifecycle.app_path = match args.app.as_deref() {
                    Some(app) => Some(resolve_app(app)?),
                    None => {
                        debug!("No app path configured, expecting the app to be installed");
                        None
                    }
                };
            }
            Stage::PrepareDevice => {
                let device = lifecycle.device()?;
                if args.full_reset {
                    target.clean_state(device).await?;
                }
                let directories = target.directories(device).await?;
                debug!(count = directories.len(), "Device directories present");
                target
                    .set_locale(device, args.language.as_deref(), args.locale.as_deref())
                    .await?;
                target.set_preferences(device, &session_preferences(args)).await?;
                let options = ResetOptions::from_args(args, lifecycle.bundle_id.clone());
                target.reset(device, &options).await?;
                target.launch(device).await?;
            }
            Stage::CreateProcess => {
                let launch = args.launch_config(lifecycle.app_path.clone(), lifecycle.bundle_id.clone());
                lifecycle
                    .supervisor
                    .create(launch, args.launch_timeout(), args.launch_tries)?;
            }
            Stage::StartLogCapture => {
                self.collaborators.logs.start(lifecycle.device()?).await?;
                lifecycle.logs_started = true;
            }
            Stage::InstallApp => {
                let Some(app) = lifecycle.app_path.clone() else {
                    debug!("Nothing to install");
                    return Ok(());
                };
                let device = lifecycle.device()?;
                if device.kind == DeviceKind::RealDevice && args.full_reset {
                    let options = ResetOptions::from_args(args, lifecycle.bundle_id.clone());
                    target.reset(device, &options).await?;
                }
                target.install(device, &app).await?;
            }
            Stage::LaunchInstrumentation => {
                let exit = lifecycle.supervisor.start().await?;
                if let Some(died) = died.take() {
                    let watcher = watch_for_exit(self.clone(), lifecycle.generation, exit, died);
                    lifecycle.watcher = Some(tokio::spawn(watcher));
                }
            }
            Stage::DiscoverBundleId => {
                if lifecycle.bundle_id.is_none() {
                    let response = session.queue.execute_attached(BUNDLE_ID_PROBE).await?;
                    lifecycle.bundle_id = response
                        .as_ref()
                        .filter(|r| r.is_success())
                        .and_then(|r| r.value_str())
                        .map(str::to_string);
                    info!(bundle_id = ?lifecycle.bundle_id, "Discovered bundle id");
                }
            }
            Stage::ConfigureBootstrap => {
                let config = lifecycle
                    .supervisor
                    .process()
                    .map(|process| process.launch().bootstrap_json())
                    .ok_or_else(|| {
                        DriverError::Configuration("Instrumentation process is not running".to_string())
                    })?;
                let payload = format!("{}{}", BOOTSTRAP_PREFIX, config);
                expect_success(session.queue.execute_attached(payload).await?, "Bootstrap configuration")?;
            }
            Stage::InitialOrientation => {
                if let Some(orientation) = args.orientation {
                    let response = session.queue.execute_attached(orientation_payload(orientation)).await?;
                    expect_success(response, "Setting the initial orientation")?;
                    lifecycle.orientation = Some(orientation);
                }
            }
            Stage::InitialWebview => session.contexts.initial_webview(args).await?,
            Stage::WaitForLaunch => {
                wait_for_launch(&session.queue, args.wait_for_app_script.as_deref(), self.launch_wait)
                    .await?;
            }
        }
        Ok(())
    }

    /// Stops the engine when one is active, answers any stranded command, then cleans up.
    async fn shutdown(&self, lifecycle: &mut Lifecycle, from_recovery: bool) {
        self.dispatch.set_shutting_down(true);
        if let Some(watcher) = lifecycle.watcher.take() {
            if !from_recovery {
                watcher.abort();
            }
        }

        if lifecycle.supervisor.is_active() {
            match lifecycle.supervisor.stop().await {
                Ok(code) => debug!(?code, "Instrumentation stopped"),
                Err(e) => warn!("Failed to stop instrumentation: {}", e),
            }
        } else {
            debug!("No instrumentation process active, cleaning up directly");
        }

        let stranded = DriverError::CommandProxy("Session stopped while the command was in flight".to_string());
        if let Some(payload) = self.dispatch.pending.fail(stranded).await {
            warn!(payload = %payload, "Answered stranded command during teardown");
        }

        self.cleanup(lifecycle).await;
    }

    /// Resets transient state and the device. Never fails.
    async fn cleanup(&self, lifecycle: &mut Lifecycle) {
        let session = self.session.write().await.take();
        if let Some(session) = &session {
            session.contexts.reset().await;
        }
        lifecycle.orientation = None;

        let logs = &self.collaborators.logs;
        if lifecycle.logs_started {
            if let Err(e) = logs.stop().await {
                warn!("Failed to stop log capture: {}", e);
            }
            lifecycle.logs_started = false;
        }
        logs.clear().await;

        let bundle_id = lifecycle.bundle_id.take();
        if let Some(device) = lifecycle.device.take() {
            let options = match &session {
                Some(session) => ResetOptions::from_args(&session.args, bundle_id),
                None => ResetOptions {
                    bundle_id,
                    ..Default::default()
                },
            };
            let target = self.collaborators.targets.for_kind(device.kind);
            if let Err(e) = target.reset(&device, &options).await {
                warn!(udid = %device.udid, "Device reset failed during cleanup: {}", e);
            }
        }
        lifecycle.app_path = None;

        self.dispatch.gates.reset();
        // the worker drains once the last queue handle is gone
        lifecycle.worker.take();
        self.dispatch.set_shutting_down(false);
        self.dispatch.clear_exit().await;
        debug!("Session cleanup complete");
    }
}

fn expect_success(response: Option<CommandResponse>, what: &str) -> Result<()> {
    match response {
        Some(response) if response.is_success() => Ok(()),
        Some(response) => Err(DriverError::CommandProxy(format!(
            "{} failed ({}): {}",
            what,
            response.status,
            response.value_str().unwrap_or_default()
        ))),
        None => Err(DriverError::CommandProxy(format!(
            "{} was skipped, no instrumentation attached",
            what
        ))),
    }
}

/// Recovers from an engine exit that nobody asked for.
async fn watch_for_exit(
    inner: Arc<Inner>,
    generation: u64,
    exit: ExitWatch,
    died: oneshot::Sender<SessionDeath>,
) {
    let Ok(code) = exit.await else {
        return;
    };

    inner.dispatch.record_exit(code).await;
    inner.dispatch.set_shutting_down(true);
    if let Some(payload) = inner
        .dispatch
        .pending
        .fail(DriverError::UnexpectedProcessExit { code })
        .await
    {
        warn!(payload = %payload, ?code, "Engine exited with a command in flight");
    }

    let mut lifecycle = inner.lifecycle.lock().await;
    if lifecycle.generation != generation || *inner.state.borrow() != SessionState::Running {
        debug!("Engine exit already handled");
        return;
    }

    error!(?code, "Instrumentation exited unexpectedly, tearing the session down");
    inner.set_state(SessionState::Crashed);
    inner.shutdown(&mut lifecycle, true).await;
    inner.set_state(SessionState::Stopped);
    drop(lifecycle);

    if died.send(SessionDeath { exit_code: code }).is_err() {
        debug!("Nobody is listening for session death");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appdrive_protocol::Status;
    use serde_json::json;

    #[test]
    fn test_orientation_payload() {
        assert_eq!(orientation_payload(Orientation::Landscape), "au.setOrientation('LANDSCAPE')");
    }

    #[test]
    fn test_expect_success() {
        assert!(expect_success(Some(CommandResponse::success(json!(null))), "x").is_ok());
        let err = expect_success(Some(CommandResponse::error(Status::UNKNOWN_ERROR, "nope")), "x")
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
        assert!(matches!(expect_success(None, "x"), Err(DriverError::CommandProxy(_))));
    }
}
