use super::{DispatchState, GateCondition};
use crate::{DriverError, Result};
use appdrive_protocol::CommandResponse;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// How often an open gate is re-checked.
pub const GATE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome delivered to the submitter of a command.
///
/// `Ok(None)` means no instrumentation engine was attached when the command
/// reached the head of the queue; the command was skipped, not failed.
pub type CommandResult = Result<Option<CommandResponse>>;

#[derive(Debug)]
pub struct QueuedCommand {
    pub payload: String,
    pub enqueued_at: DateTime<Utc>,
    responder: oneshot::Sender<CommandResult>,
}

struct InFlight {
    payload: String,
    responder: oneshot::Sender<CommandResult>,
    abort: oneshot::Sender<()>,
}

/// Holds the responder owed to the command currently in flight.
///
/// Whoever takes the entry first answers the caller: the dispatch worker when
/// the engine responds, or crash recovery when the engine dies mid-command.
#[derive(Default)]
pub struct PendingSlot {
    inner: Mutex<Option<InFlight>>,
}

impl PendingSlot {
    async fn install(
        &self,
        payload: String,
        responder: oneshot::Sender<CommandResult>,
    ) -> oneshot::Receiver<()> {
        let (abort, aborted) = oneshot::channel();
        *self.inner.lock().await = Some(InFlight {
            payload,
            responder,
            abort,
        });
        aborted
    }

    async fn complete(&self, result: CommandResult) -> bool {
        match self.inner.lock().await.take() {
            Some(in_flight) => {
                let _ = in_flight.responder.send(result);
                true
            }
            None => false,
        }
    }

    /// Answers the in-flight command with `error` and releases the worker
    /// waiting on it. Returns the payload that was pending, if any.
    pub async fn fail(&self, error: DriverError) -> Option<String> {
        let in_flight = self.inner.lock().await.take()?;
        let _ = in_flight.responder.send(Err(error));
        let _ = in_flight.abort.send(());
        Some(in_flight.payload)
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_none()
    }
}

impl std::fmt::Debug for PendingSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingSlot").finish_non_exhaustive()
    }
}

/// FIFO command processor with exactly one command in flight at a time.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<QueuedCommand>,
    state: Arc<DispatchState>,
}

impl CommandQueue {
    /// Starts the dispatch worker. The worker exits once every queue handle is dropped.
    pub fn spawn(state: Arc<DispatchState>, gate_timeout: Duration) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run(rx, state.clone(), gate_timeout));
        (Self { tx, state }, handle)
    }

    /// Enqueues `payload` without waiting for it to be serviced.
    pub fn submit(&self, payload: impl Into<String>) -> oneshot::Receiver<CommandResult> {
        let (responder, rx) = oneshot::channel();
        let command = QueuedCommand {
            payload: payload.into(),
            enqueued_at: Utc::now(),
            responder,
        };
        if let Err(mpsc::error::SendError(command)) = self.tx.send(command) {
            debug!(payload = %command.payload, "Dispatch worker is gone, skipping command");
            let _ = command.responder.send(Ok(None));
        }
        rx
    }

    /// Enqueues `payload` and waits for its result.
    pub async fn execute(&self, payload: impl Into<String>) -> CommandResult {
        self.submit(payload).await.map_err(|_| {
            DriverError::CommandProxy("Dispatch queue dropped the command".to_string())
        })?
    }

    /// Like [`execute`](Self::execute), for commands that only make sense
    /// against a live engine.
    ///
    /// A command skipped because the engine died while it waited fails with
    /// [`DriverError::UnexpectedProcessExit`] instead of resolving empty.
    pub async fn execute_attached(&self, payload: impl Into<String>) -> CommandResult {
        let result = self.execute(payload).await?;
        if result.is_none() {
            if let Some(code) = self.state.engine_exit().await {
                return Err(DriverError::UnexpectedProcessExit { code });
            }
        }
        Ok(result)
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<QueuedCommand>,
    state: Arc<DispatchState>,
    gate_timeout: Duration,
) {
    while let Some(command) = rx.recv().await {
        dispatch(&state, command, gate_timeout).await;
    }
    debug!("Dispatch queue closed");
}

async fn dispatch(state: &DispatchState, command: QueuedCommand, gate_timeout: Duration) {
    let QueuedCommand {
        payload,
        enqueued_at,
        responder,
    } = command;

    if let Err(e) = wait_for_gates(state, &payload, gate_timeout).await {
        warn!(payload = %payload, "{}", e);
        let _ = responder.send(Err(e));
        return;
    }

    let proxy = match state.proxy().await {
        Some(proxy) if !state.is_shutting_down() => proxy,
        _ => {
            debug!(payload = %payload, "No instrumentation attached, skipping command");
            let _ = responder.send(Ok(None));
            return;
        }
    };

    let queued_ms = (Utc::now() - enqueued_at).num_milliseconds();
    debug!(payload = %payload, queued_ms, "Dispatching command");

    let aborted = state.pending.install(payload.clone(), responder).await;
    tokio::select! {
        result = proxy.send(&payload) => {
            if !state.pending.complete(result.map(Some)).await {
                debug!(payload = %payload, "Response arrived after the command was already answered");
            }
        }
        _ = aborted => {
            debug!(payload = %payload, "In-flight command was answered by crash recovery");
        }
    }
}

async fn wait_for_gates(state: &DispatchState, payload: &str, limit: Duration) -> Result<()> {
    let wait = async {
        for gate in GateCondition::ORDER {
            if gate.is_bypassed_by(payload) || !state.gates.is_open(gate) {
                continue;
            }
            debug!(gate = %gate, payload = %payload, "Command waiting for gate to close");
            while state.gates.is_open(gate) {
                tokio::time::sleep(GATE_POLL_INTERVAL).await;
            }
        }
    };

    tokio::time::timeout(limit, wait).await.map_err(|_| {
        DriverError::CommandProxy(format!(
            "Timed out after {:?} waiting to dispatch '{}'",
            limit, payload
        ))
    })
}
