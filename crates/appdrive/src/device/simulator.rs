use super::{DeviceInfo, DeviceTarget, Preferences, ResetOptions, run_tool};
use crate::config::{DeviceKind, SessionArgs};
use crate::{DriverError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const XCRUN: &str = "xcrun";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorDevice {
    pub udid: String,
    pub name: String,
    pub state: String,
    pub runtime: String,
    pub is_available: bool,
}

impl SimulatorDevice {
    /// `com.apple.CoreSimulator.SimRuntime.iOS-17-2` -> `17.2`
    pub fn platform_version(&self) -> Option<String> {
        let tail = self.runtime.rsplit('.').next()?;
        let version = tail.strip_prefix("iOS-")?;
        Some(version.replace('-', "."))
    }

    pub fn is_booted(&self) -> bool {
        self.state == "Booted"
    }
}

/// Parses `simctl list devices --json` output.
pub fn parse_device_list(json: &str) -> Result<Vec<SimulatorDevice>> {
    let data: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| DriverError::Device(format!("Failed to parse device list: {}", e)))?;

    let mut devices = Vec::new();
    if let Some(by_runtime) = data.get("devices").and_then(|d| d.as_object()) {
        for (runtime, list) in by_runtime {
            for device in list.as_array().into_iter().flatten() {
                let Some(udid) = device.get("udid").and_then(|u| u.as_str()) else {
                    continue;
                };
                devices.push(SimulatorDevice {
                    udid: udid.to_string(),
                    name: device
                        .get("name")
                        .and_then(|n| n.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    state: device
                        .get("state")
                        .and_then(|s| s.as_str())
                        .unwrap_or("Unknown")
                        .to_string(),
                    runtime: runtime.clone(),
                    is_available: device
                        .get("isAvailable")
                        .and_then(|a| a.as_bool())
                        .unwrap_or(false),
                });
            }
        }
    }
    Ok(devices)
}

/// Picks the simulator matching the requested name and platform version.
///
/// Without a name, a booted simulator is preferred over any available one.
pub fn choose_device<'a>(
    devices: &'a [SimulatorDevice],
    name: Option<&str>,
    platform_version: Option<&str>,
) -> Option<&'a SimulatorDevice> {
    let candidates: Vec<&SimulatorDevice> = devices
        .iter()
        .filter(|d| d.is_available)
        .filter(|d| name.is_none_or(|n| d.name == n))
        .filter(|d| {
            platform_version.is_none_or(|v| d.platform_version().as_deref() == Some(v))
        })
        .collect();

    candidates
        .iter()
        .find(|d| d.is_booted())
        .or_else(|| candidates.first())
        .copied()
}

#[derive(Debug, Default)]
pub struct Simulator;

impl Simulator {
    pub fn new() -> Self {
        Self
    }

    async fn list_devices(&self) -> Result<Vec<SimulatorDevice>> {
        let output = run_tool(XCRUN, &["simctl", "list", "devices", "--json"]).await?;
        parse_device_list(&output)
    }

    async fn write_default(
        &self,
        device: &DeviceInfo,
        domain: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<()> {
        let (kind, rendered) = match value {
            serde_json::Value::Bool(b) => ("-bool", b.to_string()),
            serde_json::Value::Number(n) if n.is_i64() => ("-int", n.to_string()),
            serde_json::Value::Number(n) => ("-float", n.to_string()),
            serde_json::Value::String(s) => ("-string", s.clone()),
            other => ("-string", other.to_string()),
        };
        run_tool(
            XCRUN,
            &["simctl", "spawn", &device.udid, "defaults", "write", domain, key, kind, &rendered],
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceTarget for Simulator {
    async fn detect(&self, args: &SessionArgs) -> Result<DeviceInfo> {
        let devices = self.list_devices().await?;
        let device = choose_device(
            &devices,
            args.device_name.as_deref(),
            args.platform_version.as_deref(),
        )
        .ok_or_else(|| {
            DriverError::DeviceNotAvailable(format!(
                "No simulator matches name {:?} and platform version {:?}",
                args.device_name, args.platform_version
            ))
        })?;

        info!(udid = %device.udid, name = %device.name, state = %device.state, "Using simulator");
        Ok(DeviceInfo {
            udid: device.udid.clone(),
            name: device.name.clone(),
            platform_version: device.platform_version(),
            kind: DeviceKind::Simulator,
        })
    }

    async fn install(&self, device: &DeviceInfo, app: &Path) -> Result<()> {
        let app = app.display().to_string();
        info!(udid = %device.udid, app = %app, "Installing app on simulator");
        run_tool(XCRUN, &["simctl", "install", &device.udid, &app]).await?;
        Ok(())
    }

    async fn reset(&self, device: &DeviceInfo, options: &ResetOptions) -> Result<()> {
        if options.no_reset {
            debug!("noReset set, leaving simulator state alone");
            return Ok(());
        }
        let Some(bundle_id) = options.bundle_id.as_deref() else {
            debug!("No bundle id known, nothing to reset");
            return Ok(());
        };

        if let Err(e) = run_tool(XCRUN, &["simctl", "terminate", &device.udid, bundle_id]).await {
            debug!("App was not running: {}", e);
        }
        if options.full_reset {
            if let Err(e) = run_tool(XCRUN, &["simctl", "uninstall", &device.udid, bundle_id]).await {
                debug!("App was not installed: {}", e);
            }
            self.terminate(device).await?;
        }
        Ok(())
    }

    async fn clean_state(&self, device: &DeviceInfo) -> Result<()> {
        // erase requires a shut-down simulator
        if let Err(e) = self.terminate(device).await {
            debug!("Simulator was not running: {}", e);
        }
        run_tool(XCRUN, &["simctl", "erase", &device.udid]).await?;
        Ok(())
    }

    async fn directories(&self, device: &DeviceInfo) -> Result<Vec<PathBuf>> {
        let home = std::env::var("HOME").unwrap_or_default();
        let root = PathBuf::from(home)
            .join("Library/Developer/CoreSimulator/Devices")
            .join(&device.udid)
            .join("data");
        let preferences = root.join("Library/Preferences");
        Ok([root, preferences].into_iter().filter(|p| p.exists()).collect())
    }

    async fn set_locale(
        &self,
        device: &DeviceInfo,
        language: Option<&str>,
        locale: Option<&str>,
    ) -> Result<()> {
        if let Some(language) = language {
            run_tool(
                XCRUN,
                &[
                    "simctl", "spawn", &device.udid, "defaults", "write", ".GlobalPreferences",
                    "AppleLanguages", "-array", language,
                ],
            )
            .await?;
        }
        if let Some(locale) = locale {
            run_tool(
                XCRUN,
                &[
                    "simctl", "spawn", &device.udid, "defaults", "write", ".GlobalPreferences",
                    "AppleLocale", "-string", locale,
                ],
            )
            .await?;
        }
        Ok(())
    }

    async fn set_preferences(&self, device: &DeviceInfo, preferences: &Preferences) -> Result<()> {
        for (domain, values) in preferences {
            for (key, value) in values {
                self.write_default(device, domain, key, value).await?;
            }
        }
        Ok(())
    }

    async fn launch(&self, device: &DeviceInfo) -> Result<()> {
        match run_tool(XCRUN, &["simctl", "boot", &device.udid]).await {
            Ok(_) => Ok(()),
            Err(DriverError::Device(msg)) if msg.contains("current state: Booted") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn terminate(&self, device: &DeviceInfo) -> Result<()> {
        match run_tool(XCRUN, &["simctl", "shutdown", &device.udid]).await {
            Ok(_) => Ok(()),
            Err(DriverError::Device(msg)) if msg.contains("current state: Shutdown") => Ok(()),
            Err(e) => {
                warn!("Failed to shut down simulator {}: {}", device.udid, e);
                Err(e)
            }
        }
    }
}
