use crate::dispatch::CommandQueue;
use crate::{DriverError, Result};
use appdrive_protocol::CommandResponse;
use serde_json::Value;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const LAUNCH_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const LAUNCH_WAIT_INTERVAL: Duration = Duration::from_millis(500);

pub const NATIVE_TREE_PROBE: &str = "au.mainApp().getTreeForXML()";
/// Present in the native tree while the home screen is still showing.
pub const HOME_SCREEN_MARKER: &str = "SpringBoard";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchWait {
    pub timeout: Duration,
    pub interval: Duration,
}

impl Default for LaunchWait {
    fn default() -> Self {
        Self {
            timeout: LAUNCH_WAIT_TIMEOUT,
            interval: LAUNCH_WAIT_INTERVAL,
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// The default readiness check: a non-empty tree that is not the home screen.
pub fn app_tree_ready(response: &CommandResponse) -> bool {
    if !response.is_success() || is_empty(&response.value) {
        return false;
    }
    let tree = match &response.value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    !tree.contains(HOME_SCREEN_MARKER)
}

/// Readiness for a caller-provided script: any truthy value.
pub fn custom_probe_ready(response: &CommandResponse) -> bool {
    response.is_success()
        && match &response.value {
            Value::Bool(b) => *b,
            other => !is_empty(other),
        }
}

/// Polls until the app under test is in the foreground.
pub async fn wait_for_launch(
    queue: &CommandQueue,
    custom_probe: Option<&str>,
    wait: LaunchWait,
) -> Result<()> {
    let (probe, ready): (&str, fn(&CommandResponse) -> bool) = match custom_probe {
        Some(script) => (script, custom_probe_ready),
        None => (NATIVE_TREE_PROBE, app_tree_ready),
    };

    let started = Instant::now();
    loop {
        match queue.execute_attached(probe).await {
            Ok(Some(response)) if ready(&response) => {
                info!(elapsed = ?started.elapsed(), "App finished launching");
                return Ok(());
            }
            Ok(_) => debug!("App not ready yet"),
            Err(e) if e.is_engine_exit() => return Err(e),
            Err(e) => debug!("Launch probe failed: {}", e),
        }

        if started.elapsed() >= wait.timeout {
            return Err(DriverError::LaunchTimeout(wait.timeout));
        }
        tokio::time::sleep(wait.interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use appdrive_protocol::Status;
    use serde_json::json;

    #[test]
    fn test_home_screen_is_not_ready() {
        let home = CommandResponse::success(json!("<UIAApplication name=\"SpringBoard\"/>"));
        assert!(!app_tree_ready(&home));

        let app = CommandResponse::success(json!({"name": "MyApp", "children": []}));
        assert!(app_tree_ready(&app));

        assert!(!app_tree_ready(&CommandResponse::success(json!(""))));
        assert!(!app_tree_ready(&CommandResponse::error(Status::UNKNOWN_ERROR, "boom")));
    }

    #[test]
    fn test_custom_probe_truthiness() {
        assert!(custom_probe_ready(&CommandResponse::success(json!(true))));
        assert!(!custom_probe_ready(&CommandResponse::success(json!(false))));
        assert!(custom_probe_ready(&CommandResponse::success(json!("ok"))));
        assert!(!custom_probe_ready(&CommandResponse::success(Value::Null)));
    }
}
