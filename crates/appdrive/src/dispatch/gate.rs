use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Payload prefixes for alert handling. These must be able to interrupt a
/// blocked remote-debugger flow, so they skip the remote-command gate.
pub const ALERT_PAYLOAD_PREFIXES: &[&str] = &[
    "au.alertIsPresent",
    "au.getAlertText",
    "au.acceptAlert",
    "au.dismissAlert",
    "au.setAlertText",
    "au.waitForAlertToClose",
];

/// A named condition that holds queued commands back while it is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateCondition {
    /// Set by the context engine while it switches the selected web page.
    SelectingNewPage,
    /// Set by the remote debugger while one of its commands is outstanding.
    RemoteCommandInProgress,
}

impl GateCondition {
    /// Evaluation order used by the dispatch queue.
    pub const ORDER: [GateCondition; 2] = [
        GateCondition::SelectingNewPage,
        GateCondition::RemoteCommandInProgress,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            GateCondition::SelectingNewPage => "selecting-new-page",
            GateCondition::RemoteCommandInProgress => "remote-command-in-progress",
        }
    }

    /// Whether `payload` is allowed through this gate even while it is open.
    pub fn is_bypassed_by(&self, payload: &str) -> bool {
        match self {
            GateCondition::SelectingNewPage => false,
            GateCondition::RemoteCommandInProgress => ALERT_PAYLOAD_PREFIXES
                .iter()
                .any(|prefix| payload.starts_with(prefix)),
        }
    }
}

impl std::fmt::Display for GateCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Default)]
pub struct GateFlags {
    selecting_new_page: AtomicBool,
    remote_command: AtomicBool,
}

impl GateFlags {
    pub fn new() -> Self {
        Self::default()
    }

    fn flag(&self, gate: GateCondition) -> &AtomicBool {
        match gate {
            GateCondition::SelectingNewPage => &self.selecting_new_page,
            GateCondition::RemoteCommandInProgress => &self.remote_command,
        }
    }

    pub fn is_open(&self, gate: GateCondition) -> bool {
        self.flag(gate).load(Ordering::SeqCst)
    }

    pub fn open(&self, gate: GateCondition) {
        self.flag(gate).store(true, Ordering::SeqCst);
    }

    pub fn close(&self, gate: GateCondition) {
        self.flag(gate).store(false, Ordering::SeqCst);
    }

    /// Opens `gate` until the returned guard is dropped.
    pub fn hold(self: &Arc<Self>, gate: GateCondition) -> GateGuard {
        self.open(gate);
        GateGuard {
            flags: Arc::clone(self),
            gate,
        }
    }

    pub fn reset(&self) {
        for gate in GateCondition::ORDER {
            self.close(gate);
        }
    }
}

/// Closes its gate on drop.
#[derive(Debug)]
pub struct GateGuard {
    flags: Arc<GateFlags>,
    gate: GateCondition,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        self.flags.close(self.gate);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alert_prefixes_bypass_remote_gate_only() {
        let payload = "au.acceptAlert()";
        assert!(GateCondition::RemoteCommandInProgress.is_bypassed_by(payload));
        assert!(!GateCondition::SelectingNewPage.is_bypassed_by(payload));
        assert!(!GateCondition::RemoteCommandInProgress.is_bypassed_by("au.tap('Login')"));
    }

    #[test]
    fn test_guard_closes_gate_on_drop() {
        let flags = Arc::new(GateFlags::new());
        {
            let _guard = flags.hold(GateCondition::SelectingNewPage);
            assert!(flags.is_open(GateCondition::SelectingNewPage));
        }
        assert!(!flags.is_open(GateCondition::SelectingNewPage));
    }
}
