//! Device targets: the simulator or physical device hosting the app under test.

pub mod log_capture;
pub mod real_device;
pub mod simulator;

pub use log_capture::{LogCapture, SyslogCapture};
pub use real_device::RealDevice;
pub use simulator::Simulator;

use crate::config::{DeviceKind, SessionArgs};
use crate::{DriverError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::process::Command;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub udid: String,
    pub name: String,
    pub platform_version: Option<String>,
    pub kind: DeviceKind,
}

/// How much of the app's state the reset flow removes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResetOptions {
    pub bundle_id: Option<String>,
    pub full_reset: bool,
    pub no_reset: bool,
}

impl ResetOptions {
    pub fn from_args(args: &SessionArgs, bundle_id: Option<String>) -> Self {
        Self {
            bundle_id,
            full_reset: args.full_reset,
            no_reset: args.no_reset,
        }
    }
}

/// Preference domain -> key -> value.
pub type Preferences = BTreeMap<String, BTreeMap<String, serde_json::Value>>;

/// Capability interface over simulator and real-device specifics.
#[async_trait]
pub trait DeviceTarget: Send + Sync {
    async fn detect(&self, args: &SessionArgs) -> Result<DeviceInfo>;

    async fn install(&self, device: &DeviceInfo, app: &Path) -> Result<()>;

    async fn reset(&self, device: &DeviceInfo, options: &ResetOptions) -> Result<()>;

    async fn clean_state(&self, device: &DeviceInfo) -> Result<()>;

    async fn directories(&self, device: &DeviceInfo) -> Result<Vec<PathBuf>>;

    async fn set_locale(
        &self,
        device: &DeviceInfo,
        language: Option<&str>,
        locale: Option<&str>,
    ) -> Result<()>;

    async fn set_preferences(&self, device: &DeviceInfo, preferences: &Preferences) -> Result<()>;

    async fn launch(&self, device: &DeviceInfo) -> Result<()>;

    async fn terminate(&self, device: &DeviceInfo) -> Result<()>;
}

/// One adapter per device kind; the session picks by configuration.
#[derive(Clone)]
pub struct DeviceTargets {
    pub simulator: Arc<dyn DeviceTarget>,
    pub real_device: Arc<dyn DeviceTarget>,
}

impl DeviceTargets {
    pub fn system() -> Self {
        Self {
            simulator: Arc::new(Simulator::new()),
            real_device: Arc::new(RealDevice::new()),
        }
    }

    pub fn for_kind(&self, kind: DeviceKind) -> Arc<dyn DeviceTarget> {
        match kind {
            DeviceKind::Simulator => self.simulator.clone(),
            DeviceKind::RealDevice => self.real_device.clone(),
        }
    }
}

/// Preferences applied to every session.
pub fn session_preferences(args: &SessionArgs) -> Preferences {
    let mut preferences = Preferences::new();
    let keyboard = preferences
        .entry("com.apple.Preferences".to_string())
        .or_default();
    keyboard.insert("KeyboardAutocorrection".to_string(), false.into());
    keyboard.insert("KeyboardPrediction".to_string(), false.into());

    if args.is_builtin_browser() {
        let safari = preferences
            .entry("com.apple.mobilesafari".to_string())
            .or_default();
        safari.insert("WarnAboutFraudulentWebsites".to_string(), false.into());
        safari.insert("WebKitJavaScriptCanOpenWindowsAutomatically".to_string(), true.into());
    }
    preferences
}

/// Runs an external tool and returns its stdout.
pub(crate) async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| DriverError::Device(format!("Failed to run {}: {}", program, e)))?;

    if !output.status.success() {
        return Err(DriverError::Device(format!(
            "{} {} failed: {}",
            program,
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
