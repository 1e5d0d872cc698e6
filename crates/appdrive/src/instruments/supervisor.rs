use super::process::{EngineBackend, EngineProcess};
use super::proxy::CommandProxy;
use crate::dispatch::DispatchState;
use crate::{DriverError, Result};
use appdrive_protocol::LaunchConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Bound on the graceful proxy shutdown before the process is terminated.
pub const PROXY_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
/// Bound on waiting for the process to exit after it was told to terminate.
pub const PROCESS_EXIT_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Option<i32>),
}

/// Fires at most once, with the exit code, when a connected engine exits
/// without having been asked to.
pub type ExitWatch = oneshot::Receiver<Option<i32>>;

type ExitSender = Arc<Mutex<Option<oneshot::Sender<Option<i32>>>>>;

#[derive(Debug, Default)]
struct ExitFlags {
    connected: AtomicBool,
    expected: AtomicBool,
    exited: AtomicBool,
}

struct ProcessHandle {
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    status: watch::Receiver<ProcessStatus>,
    flags: Arc<ExitFlags>,
    monitor: JoinHandle<()>,
}

/// The engine process owned by the supervisor for one session.
pub struct InstrumentationProcess {
    launch: LaunchConfig,
    launch_timeout: Duration,
    launch_tries: u32,
    handle: Option<ProcessHandle>,
    exit_code: Option<Option<i32>>,
}

impl InstrumentationProcess {
    pub fn launch(&self) -> &LaunchConfig {
        &self.launch
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid)
    }

    pub fn exit_code(&self) -> Option<Option<i32>> {
        self.exit_code
    }
}

enum LaunchOutcome {
    Connected,
    Exited(Option<i32>),
    Failed(DriverError),
}

/// Owns the engine process and its command proxy.
pub struct Supervisor {
    backend: Arc<dyn EngineBackend>,
    dispatch: Arc<DispatchState>,
    process: Option<InstrumentationProcess>,
    proxy: Option<Arc<dyn CommandProxy>>,
}

impl Supervisor {
    pub fn new(backend: Arc<dyn EngineBackend>, dispatch: Arc<DispatchState>) -> Self {
        Self {
            backend,
            dispatch,
            process: None,
            proxy: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.process.is_some()
    }

    pub fn process(&self) -> Option<&InstrumentationProcess> {
        self.process.as_ref()
    }

    pub fn create(
        &mut self,
        launch: LaunchConfig,
        launch_timeout: Duration,
        launch_tries: u32,
    ) -> Result<()> {
        if self.process.is_some() {
            return Err(DriverError::Configuration(
                "An instrumentation process is already active for this session".to_string(),
            ));
        }
        self.process = Some(InstrumentationProcess {
            launch,
            launch_timeout,
            launch_tries: launch_tries.max(1),
            handle: None,
            exit_code: None,
        });
        Ok(())
    }

    /// Starts the proxy and the engine, returning once the engine connects.
    ///
    /// An engine that exits before connecting is relaunched up to the
    /// configured number of tries. On failure the proxy and any running
    /// process are torn down before the error is returned.
    pub async fn start(&mut self) -> Result<ExitWatch> {
        let (launch, launch_timeout, launch_tries) = match &self.process {
            Some(p) if p.handle.is_none() => (p.launch.clone(), p.launch_timeout, p.launch_tries),
            Some(_) => {
                return Err(DriverError::Configuration(
                    "Instrumentation process was already started".to_string(),
                ));
            }
            None => {
                return Err(DriverError::Configuration(
                    "Instrumentation process has not been created".to_string(),
                ));
            }
        };

        let proxy = self.backend.listen(&launch).await?;
        self.proxy = Some(proxy.clone());

        let (exit_tx, exit_rx) = oneshot::channel();
        let exit_tx: ExitSender = Arc::new(Mutex::new(Some(exit_tx)));

        let mut failure = None;
        for attempt in 1..=launch_tries {
            let process = match self.backend.spawn(&launch).await {
                Ok(process) => process,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            let mut handle = spawn_monitor(process, exit_tx.clone());
            info!(attempt, pid = ?handle.pid, "Instrumentation process spawned, waiting for connection");

            let mut status = handle.status.clone();
            let outcome = tokio::select! {
                biased;
                connected = tokio::time::timeout(launch_timeout, proxy.wait_connected()) => match connected {
                    Ok(Ok(())) => LaunchOutcome::Connected,
                    Ok(Err(e)) => LaunchOutcome::Failed(e),
                    Err(_) => LaunchOutcome::Failed(DriverError::CommandProxy(format!(
                        "Instrumentation engine did not connect within {:?}",
                        launch_timeout
                    ))),
                },
                code = wait_exited(&mut status) => LaunchOutcome::Exited(code),
            };

            match outcome {
                LaunchOutcome::Connected => {
                    // From here on an exit is reported, never relaunched.
                    handle.flags.connected.store(true, Ordering::SeqCst);
                    // The monitor may have seen the exit before the flag was set.
                    if handle.flags.exited.load(Ordering::SeqCst) {
                        let code = match *handle.status.borrow() {
                            ProcessStatus::Exited(code) => code,
                            ProcessStatus::Running => None,
                        };
                        report_unexpected_exit(&exit_tx, code).await;
                    }
                    if let Some(process) = self.process.as_mut() {
                        process.handle = Some(handle);
                    }
                    self.dispatch.publish_proxy(proxy).await;
                    info!("Instrumentation engine is ready");
                    return Ok(exit_rx);
                }
                LaunchOutcome::Exited(code) if attempt < launch_tries => {
                    warn!(attempt, ?code, "Instrumentation exited before connecting, relaunching");
                }
                LaunchOutcome::Exited(code) => {
                    failure = Some(DriverError::CommandProxy(format!(
                        "Instrumentation exited (code {:?}) before connecting to the proxy",
                        code
                    )));
                    break;
                }
                LaunchOutcome::Failed(e) => {
                    terminate(&mut handle).await;
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(proxy) = self.proxy.take() {
            if let Err(e) = proxy.shutdown().await {
                debug!("Proxy shutdown after failed launch: {}", e);
            }
        }
        Err(failure.unwrap_or_else(|| {
            DriverError::CommandProxy("Instrumentation failed to launch".to_string())
        }))
    }

    /// Shuts the proxy down, then terminates the process.
    ///
    /// The exit that results is treated as expected and is not reported
    /// through the [`ExitWatch`]. Returns the exit code when a process ran.
    pub async fn stop(&mut self) -> Result<Option<i32>> {
        let Some(mut process) = self.process.take() else {
            return Ok(None);
        };
        let mut handle = process.handle.take();
        if let Some(handle) = &handle {
            handle.flags.expected.store(true, Ordering::SeqCst);
        }

        self.dispatch.withdraw_proxy().await;
        match self.proxy.take() {
            Some(proxy) => match tokio::time::timeout(PROXY_SHUTDOWN_GRACE, proxy.shutdown()).await {
                Ok(Ok(())) => debug!("Command proxy shut down"),
                Ok(Err(e)) => warn!("Command proxy shutdown failed: {}", e),
                Err(_) => warn!("Command proxy shutdown timed out after {:?}", PROXY_SHUTDOWN_GRACE),
            },
            None => debug!("Command proxy already gone, terminating process directly"),
        }

        let code = match handle.as_mut() {
            Some(handle) => terminate(handle).await,
            None => None,
        };
        process.exit_code = Some(code);
        info!(?code, "Instrumentation process stopped");
        Ok(code)
    }
}

/// Asks the monitored process to exit and waits a bounded time for it.
async fn terminate(handle: &mut ProcessHandle) -> Option<i32> {
    if let Some(kill) = handle.kill_tx.take() {
        let _ = kill.send(());
    }
    match tokio::time::timeout(PROCESS_EXIT_GRACE, wait_exited(&mut handle.status)).await {
        Ok(code) => code,
        Err(_) => {
            warn!("Instrumentation process did not exit within {:?}", PROCESS_EXIT_GRACE);
            handle.monitor.abort();
            None
        }
    }
}

async fn wait_exited(status: &mut watch::Receiver<ProcessStatus>) -> Option<i32> {
    match status.wait_for(|s| matches!(s, ProcessStatus::Exited(_))).await {
        Ok(s) => match *s {
            ProcessStatus::Exited(code) => code,
            ProcessStatus::Running => None,
        },
        Err(_) => None,
    }
}

fn spawn_monitor(process: Box<dyn EngineProcess>, exit_tx: ExitSender) -> ProcessHandle {
    let pid = process.pid();
    let (kill_tx, kill_rx) = oneshot::channel();
    let (status_tx, status) = watch::channel(ProcessStatus::Running);
    let flags = Arc::new(ExitFlags::default());

    let monitor = tokio::spawn(monitor(process, kill_rx, status_tx, flags.clone(), exit_tx));

    ProcessHandle {
        pid,
        kill_tx: Some(kill_tx),
        status,
        flags,
        monitor,
    }
}

async fn monitor(
    mut process: Box<dyn EngineProcess>,
    mut kill_rx: oneshot::Receiver<()>,
    status_tx: watch::Sender<ProcessStatus>,
    flags: Arc<ExitFlags>,
    exit_tx: ExitSender,
) {
    let waited = tokio::select! {
        result = process.wait() => Some(result),
        _ = &mut kill_rx => None,
    };
    let result = match waited {
        Some(result) => result,
        None => {
            if let Err(e) = process.kill().await {
                warn!("Failed to terminate instrumentation process: {}", e);
            }
            process.wait().await
        }
    };
    let code = match result {
        Ok(code) => code,
        Err(e) => {
            warn!("Failed to collect instrumentation exit status: {}", e);
            None
        }
    };
    status_tx.send_replace(ProcessStatus::Exited(code));
    flags.exited.store(true, Ordering::SeqCst);

    let connected = flags.connected.load(Ordering::SeqCst);
    let expected = flags.expected.load(Ordering::SeqCst);
    if connected && !expected {
        report_unexpected_exit(&exit_tx, code).await;
    } else {
        debug!(?code, connected, expected, "Instrumentation process exited");
    }
}

/// Sends `code` through the exit watch unless it was already sent.
async fn report_unexpected_exit(exit_tx: &ExitSender, code: Option<i32>) {
    if let Some(tx) = exit_tx.lock().await.take() {
        warn!(?code, "Instrumentation process exited unexpectedly");
        let _ = tx.send(code);
    }
}
