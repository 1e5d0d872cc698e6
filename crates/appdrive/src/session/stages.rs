use crate::config::DeviceKind;
use crate::{DriverError, Result};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// One step of session startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    DetectDevice,
    ResolveApp,
    PrepareDevice,
    CreateProcess,
    StartLogCapture,
    InstallApp,
    LaunchInstrumentation,
    DiscoverBundleId,
    ConfigureBootstrap,
    InitialOrientation,
    InitialWebview,
    WaitForLaunch,
}

impl Stage {
    pub fn name(&self) -> &'static str {
        match self {
            Stage::DetectDevice => "detect-device",
            Stage::ResolveApp => "resolve-app",
            Stage::PrepareDevice => "prepare-device",
            Stage::CreateProcess => "create-process",
            Stage::StartLogCapture => "start-log-capture",
            Stage::InstallApp => "install-app",
            Stage::LaunchInstrumentation => "launch-instrumentation",
            Stage::DiscoverBundleId => "discover-bundle-id",
            Stage::ConfigureBootstrap => "configure-bootstrap",
            Stage::InitialOrientation => "initial-orientation",
            Stage::InitialWebview => "initial-webview",
            Stage::WaitForLaunch => "wait-for-launch",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub const SIMULATOR_PIPELINE: &[Stage] = &[
    Stage::DetectDevice,
    Stage::ResolveApp,
    Stage::PrepareDevice,
    Stage::CreateProcess,
    Stage::StartLogCapture,
    Stage::InstallApp,
    Stage::LaunchInstrumentation,
    Stage::DiscoverBundleId,
    Stage::ConfigureBootstrap,
    Stage::InitialOrientation,
    Stage::InitialWebview,
    Stage::WaitForLaunch,
];

/// Real devices keep their locale and preferences, so there is no prepare step.
pub const REAL_DEVICE_PIPELINE: &[Stage] = &[
    Stage::DetectDevice,
    Stage::ResolveApp,
    Stage::CreateProcess,
    Stage::StartLogCapture,
    Stage::InstallApp,
    Stage::LaunchInstrumentation,
    Stage::DiscoverBundleId,
    Stage::ConfigureBootstrap,
    Stage::InitialOrientation,
    Stage::InitialWebview,
    Stage::WaitForLaunch,
];

pub fn pipeline(kind: DeviceKind) -> &'static [Stage] {
    match kind {
        DeviceKind::Simulator => SIMULATOR_PIPELINE,
        DeviceKind::RealDevice => REAL_DEVICE_PIPELINE,
    }
}

/// Resolves the `app` capability to a bundle on disk.
///
/// Glob patterns pick the most recently modified match.
pub fn resolve_app(app: &str) -> Result<PathBuf> {
    if !app.contains(['*', '?', '[']) {
        let path = PathBuf::from(app);
        if path.exists() {
            return Ok(path);
        }
        return Err(DriverError::Configuration(format!("App '{}' does not exist", app)));
    }

    let matches = glob::glob(app)
        .map_err(|e| DriverError::Configuration(format!("Invalid app pattern '{}': {}", app, e)))?;

    let newest = matches
        .filter_map(|entry| entry.ok())
        .max_by_key(|path| modified(path));

    match newest {
        Some(path) => {
            debug!(pattern = app, resolved = %path.display(), "Resolved app pattern");
            Ok(path)
        }
        None => Err(DriverError::Configuration(format!("No app matches '{}'", app))),
    }
}

fn modified(path: &Path) -> SystemTime {
    path.metadata()
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
