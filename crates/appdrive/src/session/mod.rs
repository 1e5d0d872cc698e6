//! Session lifecycle: startup pipeline, teardown and crash recovery.

pub mod controller;
pub mod launch_wait;
pub mod stages;

pub use controller::SessionController;
pub use launch_wait::{LaunchWait, wait_for_launch};
pub use stages::{REAL_DEVICE_PIPELINE, SIMULATOR_PIPELINE, Stage, pipeline};

use crate::config::DeviceKind;
use crate::context::{NoopRemoteDebugger, RemoteDebugger};
use crate::device::{DeviceTargets, LogCapture, SyslogCapture};
use crate::instruments::{EngineBackend, InstrumentsBackend};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Idle,
    Starting(DeviceKind),
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl SessionState {
    /// Whether a new session may be started from this state.
    pub fn is_startable(&self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => f.write_str("idle"),
            SessionState::Starting(DeviceKind::Simulator) => f.write_str("starting(simulator)"),
            SessionState::Starting(DeviceKind::RealDevice) => f.write_str("starting(real-device)"),
            SessionState::Running => f.write_str("running"),
            SessionState::Stopping => f.write_str("stopping"),
            SessionState::Stopped => f.write_str("stopped"),
            SessionState::Crashed => f.write_str("crashed"),
        }
    }
}

/// Sent once when the engine dies without being asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDeath {
    pub exit_code: Option<i32>,
}

pub type DeathWatch = oneshot::Receiver<SessionDeath>;

/// External strategies the controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub backend: Arc<dyn EngineBackend>,
    pub targets: DeviceTargets,
    pub logs: Arc<dyn LogCapture>,
    pub debugger: Arc<dyn RemoteDebugger>,
}

impl Collaborators {
    /// Real instruments, simctl/libimobiledevice tooling and syslog capture.
    pub fn system(instruments_path: Option<PathBuf>) -> Self {
        Self {
            backend: Arc::new(InstrumentsBackend::new(instruments_path)),
            targets: DeviceTargets::system(),
            logs: Arc::new(SyslogCapture::new()),
            debugger: Arc::new(NoopRemoteDebugger),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_idle_and_stopped_are_startable() {
        assert!(SessionState::Idle.is_startable());
        assert!(SessionState::Stopped.is_startable());
        assert!(!SessionState::Running.is_startable());
        assert!(!SessionState::Starting(DeviceKind::Simulator).is_startable());
        assert!(!SessionState::Crashed.is_startable());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Starting(DeviceKind::RealDevice).to_string(), "starting(real-device)");
        assert_eq!(SessionState::Running.to_string(), "running");
    }
}
