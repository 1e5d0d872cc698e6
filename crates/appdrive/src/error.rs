use appdrive_protocol::Status;
use std::time::Duration;
use thiserror::Error;

use crate::session::Stage;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("App did not finish launching within {0:?}")]
    LaunchTimeout(Duration),

    #[error("Instrumentation process exited unexpectedly (exit code: {code:?})")]
    UnexpectedProcessExit { code: Option<i32> },

    #[error("Command proxy error: {0}")]
    CommandProxy(String),

    #[error("No web view matching {0} appeared before the navigation deadline")]
    WebviewNotFound(String),

    #[error("Device not available: {0}")]
    DeviceNotAvailable(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Stage '{stage}' failed: {source}")]
    Stage {
        stage: Stage,
        #[source]
        source: Box<DriverError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DriverError>;

impl DriverError {
    /// Wraps an error with the pipeline stage it came from.
    pub fn in_stage(self, stage: Stage) -> Self {
        DriverError::Stage {
            stage,
            source: Box::new(self),
        }
    }

    /// The innermost error, with any stage context removed.
    pub fn root(&self) -> &DriverError {
        match self {
            DriverError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Whether the engine died underneath the operation that failed.
    pub fn is_engine_exit(&self) -> bool {
        matches!(self.root(), DriverError::UnexpectedProcessExit { .. })
    }

    /// Status code reported to callers for this error.
    pub fn status(&self) -> Status {
        match self.root() {
            DriverError::UnexpectedProcessExit { .. } => Status::NO_SUCH_DRIVER,
            DriverError::LaunchTimeout(_) => Status::SESSION_NOT_CREATED,
            DriverError::Configuration(_) => Status::SESSION_NOT_CREATED,
            DriverError::DeviceNotAvailable(_) => Status::SESSION_NOT_CREATED,
            DriverError::WebviewNotFound(_) => Status::NO_SUCH_WINDOW,
            _ => Status::UNKNOWN_ERROR,
        }
    }
}
