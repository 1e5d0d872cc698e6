//! Serialized command dispatch towards the instrumentation engine.
//!
//! Every command, whether issued by a caller or by an internal probe, passes
//! through a single [`CommandQueue`]. The queue waits for open
//! [`GateCondition`]s to close, records the in-flight command in the
//! [`PendingSlot`] so crash recovery can answer it, and forwards the payload to
//! whichever proxy the supervisor has currently published.

pub mod gate;
pub mod queue;

pub use gate::{ALERT_PAYLOAD_PREFIXES, GateCondition, GateFlags, GateGuard};
pub use queue::{CommandQueue, CommandResult, PendingSlot, QueuedCommand};

use crate::instruments::CommandProxy;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// State shared between the session, the supervisor and the dispatch queue.
#[derive(Default)]
pub struct DispatchState {
    pub gates: Arc<GateFlags>,
    pub pending: PendingSlot,
    shutting_down: AtomicBool,
    proxy: RwLock<Option<Arc<dyn CommandProxy>>>,
    engine_exit: RwLock<Option<Option<i32>>>,
}

impl DispatchState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn set_shutting_down(&self, value: bool) {
        self.shutting_down.store(value, Ordering::SeqCst);
    }

    /// Records that the engine exited on its own with `code`.
    pub async fn record_exit(&self, code: Option<i32>) {
        *self.engine_exit.write().await = Some(code);
    }

    /// The exit code of an engine that died unasked, until the next cleanup.
    pub async fn engine_exit(&self) -> Option<Option<i32>> {
        *self.engine_exit.read().await
    }

    pub async fn clear_exit(&self) {
        self.engine_exit.write().await.take();
    }

    /// The proxy commands are currently forwarded to, if any.
    pub async fn proxy(&self) -> Option<Arc<dyn CommandProxy>> {
        self.proxy.read().await.clone()
    }

    pub async fn publish_proxy(&self, proxy: Arc<dyn CommandProxy>) {
        *self.proxy.write().await = Some(proxy);
    }

    pub async fn withdraw_proxy(&self) -> Option<Arc<dyn CommandProxy>> {
        self.proxy.write().await.take()
    }
}

impl std::fmt::Debug for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchState")
            .field("gates", &self.gates)
            .field("shutting_down", &self.is_shutting_down())
            .field("proxy", &"<proxy>")
            .finish()
    }
}
