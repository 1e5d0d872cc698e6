use crate::{DriverError, Result};
use appdrive_protocol::{AlertPolicy, LaunchConfig, SendKeyStrategy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Browser name that selects the built-in browser app instead of a user app.
pub const BUILTIN_BROWSER: &str = "safari";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Orientation {
    Portrait,
    Landscape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Simulator,
    RealDevice,
}

/// Immutable configuration snapshot for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionArgs {
    pub udid: Option<String>,
    pub app: Option<String>,
    pub bundle_id: Option<String>,
    pub platform_version: Option<String>,
    pub device_name: Option<String>,
    pub browser_name: Option<String>,
    pub launch_timeout_ms: u64,
    pub launch_tries: u32,
    pub auto_accept_alerts: bool,
    pub auto_dismiss_alerts: bool,
    pub send_key_strategy: SendKeyStrategy,
    pub verbose: bool,
    pub socket_path: Option<PathBuf>,
    pub orientation: Option<Orientation>,
    pub auto_webview: bool,
    pub initial_url: Option<String>,
    pub webview_title: Option<String>,
    pub wait_for_app_script: Option<String>,
    pub language: Option<String>,
    pub locale: Option<String>,
    pub full_reset: bool,
    pub no_reset: bool,
    pub instruments_path: Option<PathBuf>,
    pub command_timeout_ms: u64,
}

impl Default for SessionArgs {
    fn default() -> Self {
        Self {
            udid: None,
            app: None,
            bundle_id: None,
            platform_version: None,
            device_name: None,
            browser_name: None,
            launch_timeout_ms: 90_000,
            launch_tries: 1,
            auto_accept_alerts: false,
            auto_dismiss_alerts: false,
            send_key_strategy: SendKeyStrategy::default(),
            verbose: false,
            socket_path: None,
            orientation: None,
            auto_webview: false,
            initial_url: None,
            webview_title: None,
            wait_for_app_script: None,
            language: None,
            locale: None,
            full_reset: false,
            no_reset: false,
            instruments_path: None,
            command_timeout_ms: 60_000,
        }
    }
}

impl SessionArgs {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DriverError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| DriverError::Configuration(format!("Invalid capabilities: {}", e)))
    }

    /// Applies `APPDRIVE_UDID` and `APPDRIVE_INSTRUMENTS` from the environment.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(udid) = std::env::var("APPDRIVE_UDID") {
            if !udid.is_empty() {
                self.udid = Some(udid);
            }
        }
        if let Ok(path) = std::env::var("APPDRIVE_INSTRUMENTS") {
            if !path.is_empty() {
                self.instruments_path = Some(PathBuf::from(path));
            }
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.app.is_none() && self.bundle_id.is_none() && !self.is_builtin_browser() {
            return Err(DriverError::Configuration(
                "Either 'app' or 'bundleId' is required".to_string(),
            ));
        }
        if self.auto_accept_alerts && self.auto_dismiss_alerts {
            return Err(DriverError::Configuration(
                "'autoAcceptAlerts' and 'autoDismissAlerts' are mutually exclusive".to_string(),
            ));
        }
        if self.launch_tries == 0 {
            return Err(DriverError::Configuration(
                "'launchTries' must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn device_kind(&self) -> DeviceKind {
        match self.udid {
            Some(_) => DeviceKind::RealDevice,
            None => DeviceKind::Simulator,
        }
    }

    pub fn is_builtin_browser(&self) -> bool {
        self.browser_name
            .as_deref()
            .is_some_and(|b| b.eq_ignore_ascii_case(BUILTIN_BROWSER))
    }

    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Major component of `platformVersion`, when it parses.
    pub fn platform_major(&self) -> Option<u32> {
        self.platform_version
            .as_deref()
            .and_then(|v| v.split('.').next())
            .and_then(|m| m.trim().parse().ok())
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            std::env::temp_dir().join(format!("appdrive-instruments-{}.sock", std::process::id()))
        })
    }

    pub fn alert_policy(&self) -> AlertPolicy {
        if self.auto_accept_alerts {
            AlertPolicy::AutoAccept
        } else if self.auto_dismiss_alerts {
            AlertPolicy::AutoDismiss
        } else {
            AlertPolicy::Leave
        }
    }

    /// Builds the bundle handed to the instrumentation engine.
    pub fn launch_config(&self, app_path: Option<PathBuf>, bundle_id: Option<String>) -> LaunchConfig {
        let mut config = LaunchConfig::new(self.socket_path());
        config.alert_policy = self.alert_policy();
        config.send_key_strategy = self.send_key_strategy;
        config.verbose = self.verbose;
        config.udid = self.udid.clone();
        config.app_path = app_path;
        config.bundle_id = bundle_id;
        config
    }
}
