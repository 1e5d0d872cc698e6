use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the engine delivers text to a focused element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SendKeyStrategy {
    OneByOne,
    #[default]
    Grouped,
    SetValue,
}

/// What the engine does when a system alert appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlertPolicy {
    #[default]
    Leave,
    AutoAccept,
    AutoDismiss,
}

/// Configuration bundle handed to the instrumentation engine at process start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    pub socket_path: PathBuf,
    pub alert_policy: AlertPolicy,
    pub send_key_strategy: SendKeyStrategy,
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub udid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_path: Option<PathBuf>,
}

impl LaunchConfig {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            alert_policy: AlertPolicy::default(),
            send_key_strategy: SendKeyStrategy::default(),
            verbose: false,
            bundle_id: None,
            udid: None,
            app_path: None,
        }
    }

    /// The subset of the bundle the bootstrap script reads after launch.
    pub fn bootstrap_json(&self) -> serde_json::Value {
        serde_json::json!({
            "autoAcceptAlerts": self.alert_policy == AlertPolicy::AutoAccept,
            "autoDismissAlerts": self.alert_policy == AlertPolicy::AutoDismiss,
            "sendKeyStrategy": self.send_key_strategy,
            "verbose": self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_json_reflects_alert_policy() {
        let mut config = LaunchConfig::new(PathBuf::from("/tmp/instruments.sock"));
        config.alert_policy = AlertPolicy::AutoDismiss;
        config.send_key_strategy = SendKeyStrategy::OneByOne;

        let json = config.bootstrap_json();
        assert_eq!(json["autoAcceptAlerts"], false);
        assert_eq!(json["autoDismissAlerts"], true);
        assert_eq!(json["sendKeyStrategy"], "oneByOne");
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let config = LaunchConfig::new(PathBuf::from("/tmp/s.sock"));
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"socketPath\":\"/tmp/s.sock\""));
        assert!(!text.contains("bundleId"));
    }
}
