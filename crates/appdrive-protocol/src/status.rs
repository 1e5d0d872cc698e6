use serde::{Deserialize, Serialize};

/// Status code carried by every response from the instrumentation engine.
///
/// Codes follow the numeric enumeration shared with the engine's bootstrap
/// script; unknown codes are preserved as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Self = Self(0);
    /// The session (or the engine behind it) is gone.
    pub const NO_SUCH_DRIVER: Self = Self(6);
    pub const NO_SUCH_ELEMENT: Self = Self(7);
    pub const NO_SUCH_FRAME: Self = Self(8);
    pub const UNKNOWN_COMMAND: Self = Self(9);
    pub const STALE_ELEMENT_REFERENCE: Self = Self(10);
    pub const UNKNOWN_ERROR: Self = Self(13);
    pub const JAVASCRIPT_ERROR: Self = Self(17);
    pub const TIMEOUT: Self = Self(21);
    pub const NO_SUCH_WINDOW: Self = Self(23);
    pub const UNEXPECTED_ALERT_OPEN: Self = Self(26);
    pub const NO_ALERT_OPEN: Self = Self(27);
    pub const SESSION_NOT_CREATED: Self = Self(33);

    pub fn is_success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Human-readable summary of the code
    pub fn description(&self) -> &'static str {
        match self.0 {
            0 => "The command executed successfully",
            6 => "A session is either terminated or not started",
            7 => "An element could not be located on the page using the given search parameters",
            8 => "A request to switch to a frame could not be satisfied because the frame could not be found",
            9 => "The requested resource could not be found, or a request was received using an HTTP method that is not supported by the mapped resource",
            10 => "An element command failed because the referenced element is no longer attached to the DOM",
            13 => "An unknown server-side error occurred while processing the command",
            17 => "An error occurred while executing user supplied JavaScript",
            21 => "An operation did not complete before its timeout expired",
            23 => "A request to switch to a different window could not be satisfied because the window could not be found",
            26 => "A modal dialog was open, blocking this operation",
            27 => "An attempt was made to operate on a modal dialog when one was not open",
            33 => "A new session could not be created",
            _ => "Unknown status",
        }
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::SUCCESS
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.0, self.description())
    }
}
