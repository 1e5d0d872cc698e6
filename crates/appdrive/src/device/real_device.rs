use super::{DeviceInfo, DeviceTarget, Preferences, ResetOptions, run_tool};
use crate::config::{DeviceKind, SessionArgs};
use crate::{DriverError, Result};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LOOKUP_ATTEMPTS: u32 = 3;
pub const LOOKUP_INTERVAL: Duration = Duration::from_secs(1);

/// Physical device driven through libimobiledevice tools.
#[derive(Debug, Default)]
pub struct RealDevice;

impl RealDevice {
    pub fn new() -> Self {
        Self
    }

    async fn connected_udids(&self) -> Result<Vec<String>> {
        let output = run_tool("idevice_id", &["-l"]).await?;
        Ok(parse_udid_list(&output))
    }
}

pub fn parse_udid_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| line.split_whitespace().next().unwrap_or(line).to_string())
        .collect()
}

/// Polls `list` until it reports `udid`, giving up after [`LOOKUP_ATTEMPTS`].
pub async fn lookup_udid<F, Fut>(udid: &str, mut list: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Vec<String>>>,
{
    for attempt in 1..=LOOKUP_ATTEMPTS {
        match list().await {
            Ok(udids) if udids.iter().any(|listed| listed == udid) => return Ok(()),
            Ok(_) => debug!(attempt, "Device {} not listed yet", udid),
            Err(e) => debug!(attempt, "Device lookup failed: {}", e),
        }
        if attempt < LOOKUP_ATTEMPTS {
            tokio::time::sleep(LOOKUP_INTERVAL).await;
        }
    }

    Err(DriverError::DeviceNotAvailable(format!(
        "Device {} not found after {} attempts",
        udid, LOOKUP_ATTEMPTS
    )))
}

#[async_trait]
impl DeviceTarget for RealDevice {
    async fn detect(&self, args: &SessionArgs) -> Result<DeviceInfo> {
        let udid = args
            .udid
            .clone()
            .ok_or_else(|| DriverError::Configuration("Real device sessions need a udid".into()))?;

        lookup_udid(&udid, || self.connected_udids()).await?;
        info!(udid = %udid, "Real device connected");
        Ok(DeviceInfo {
            name: args.device_name.clone().unwrap_or_else(|| "iOS Device".into()),
            platform_version: args.platform_version.clone(),
            kind: DeviceKind::RealDevice,
            udid,
        })
    }

    async fn install(&self, device: &DeviceInfo, app: &Path) -> Result<()> {
        let app = app.display().to_string();
        info!(udid = %device.udid, app = %app, "Installing app on device");
        run_tool("ideviceinstaller", &["-u", &device.udid, "-i", &app]).await?;
        Ok(())
    }

    async fn reset(&self, device: &DeviceInfo, options: &ResetOptions) -> Result<()> {
        if options.no_reset || !options.full_reset {
            return Ok(());
        }
        if let Some(bundle_id) = options.bundle_id.as_deref() {
            run_tool("ideviceinstaller", &["-u", &device.udid, "-U", bundle_id]).await?;
        }
        Ok(())
    }

    async fn clean_state(&self, device: &DeviceInfo) -> Result<()> {
        debug!(udid = %device.udid, "Real devices keep their state between sessions");
        Ok(())
    }

    async fn directories(&self, _device: &DeviceInfo) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn set_locale(
        &self,
        device: &DeviceInfo,
        language: Option<&str>,
        locale: Option<&str>,
    ) -> Result<()> {
        if language.is_some() || locale.is_some() {
            warn!(udid = %device.udid, "Language and locale cannot be changed on a real device");
        }
        Ok(())
    }

    async fn set_preferences(&self, device: &DeviceInfo, preferences: &Preferences) -> Result<()> {
        if !preferences.is_empty() {
            debug!(udid = %device.udid, "Skipping {} preference domains on real device", preferences.len());
        }
        Ok(())
    }

    async fn launch(&self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_udid_list() {
        let output = "00008030-001A\n\n00008101-0022 (USB)\n";
        assert_eq!(parse_udid_list(output), vec!["00008030-001A", "00008101-0022"]);
        assert!(parse_udid_list("").is_empty());
    }

    #[tokio::test]
    async fn test_detect_requires_udid() {
        let err = RealDevice::new().detect(&SessionArgs::default()).await.unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_gives_up_after_three_attempts() {
        let calls = AtomicUsize::new(0);
        let started = tokio::time::Instant::now();

        let err = lookup_udid("0000-missing", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["0000-other".to_string()])
        })
        .await
        .unwrap_err();

        assert!(matches!(err, DriverError::DeviceNotAvailable(_)));
        assert_eq!(calls.load(Ordering::SeqCst), LOOKUP_ATTEMPTS as usize);
        let elapsed = started.elapsed();
        assert!(elapsed >= LOOKUP_INTERVAL * (LOOKUP_ATTEMPTS - 1), "gave up after {elapsed:?}");
        assert!(elapsed < LOOKUP_INTERVAL * LOOKUP_ATTEMPTS, "gave up after {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_retries_until_listed() {
        let calls = AtomicUsize::new(0);
        lookup_udid("0000-late", || async {
            let call = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == 1 {
                return Err(DriverError::Device("usbmuxd not ready".into()));
            }
            Ok(vec!["0000-late".to_string()])
        })
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
