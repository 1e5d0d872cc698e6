use super::proxy::{CommandProxy, UnixSocketProxy};
use crate::{DriverError, Result};
use appdrive_protocol::LaunchConfig;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// A running instrumentation engine process.
#[async_trait]
pub trait EngineProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Waits for the process to exit and returns its exit code.
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Asks the process to terminate. Safe to call after it has exited.
    async fn kill(&mut self) -> Result<()>;
}

/// Starts the command proxy and the engine process for one session.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    async fn listen(&self, launch: &LaunchConfig) -> Result<Arc<dyn CommandProxy>>;

    async fn spawn(&self, launch: &LaunchConfig) -> Result<Box<dyn EngineProcess>>;
}

const DEFAULT_INSTRUMENTS: &str = "instruments";
const DEFAULT_TEMPLATE: &str = "Automation";

/// Runs Apple's `instruments` CLI with the automation template.
#[derive(Debug, Clone)]
pub struct InstrumentsBackend {
    instruments_path: PathBuf,
    template: String,
    bootstrap_script: Option<PathBuf>,
    work_dir: PathBuf,
}

impl InstrumentsBackend {
    pub fn new(instruments_path: Option<PathBuf>) -> Self {
        Self {
            instruments_path: instruments_path.unwrap_or_else(|| PathBuf::from(DEFAULT_INSTRUMENTS)),
            template: DEFAULT_TEMPLATE.to_string(),
            bootstrap_script: None,
            work_dir: std::env::temp_dir().join("appdrive-instruments"),
        }
    }

    pub fn with_bootstrap_script(mut self, script: PathBuf) -> Self {
        self.bootstrap_script = Some(script);
        self
    }

    pub fn with_work_dir(mut self, work_dir: PathBuf) -> Self {
        self.work_dir = work_dir;
        self
    }

    fn config_path(&self) -> PathBuf {
        self.work_dir.join("launch-config.json")
    }

    /// Arguments passed to `instruments` for `launch`.
    pub fn arguments(&self, launch: &LaunchConfig) -> Result<Vec<String>> {
        let target = match (&launch.app_path, &launch.bundle_id) {
            (Some(path), _) => path.display().to_string(),
            (None, Some(bundle_id)) => bundle_id.clone(),
            (None, None) => {
                return Err(DriverError::Configuration(
                    "Launch needs an app path or a bundle id".to_string(),
                ));
            }
        };

        let mut args = vec![
            "-t".to_string(),
            self.template.clone(),
            "-D".to_string(),
            self.work_dir.join("trace").display().to_string(),
        ];
        if let Some(udid) = &launch.udid {
            args.push("-w".to_string());
            args.push(udid.clone());
        }
        args.push(target);
        if let Some(script) = &self.bootstrap_script {
            args.push("-e".to_string());
            args.push("UIASCRIPT".to_string());
            args.push(script.display().to_string());
        }
        args.push("-e".to_string());
        args.push("UIARESULTSPATH".to_string());
        args.push(self.work_dir.display().to_string());
        args.push("-e".to_string());
        args.push("APPDRIVE_LAUNCH_CONFIG".to_string());
        args.push(self.config_path().display().to_string());
        Ok(args)
    }
}

#[async_trait]
impl EngineBackend for InstrumentsBackend {
    async fn listen(&self, launch: &LaunchConfig) -> Result<Arc<dyn CommandProxy>> {
        let proxy = UnixSocketProxy::bind(launch.socket_path.clone()).await?;
        Ok(proxy)
    }

    async fn spawn(&self, launch: &LaunchConfig) -> Result<Box<dyn EngineProcess>> {
        tokio::fs::create_dir_all(&self.work_dir).await?;
        tokio::fs::write(self.config_path(), serde_json::to_vec_pretty(launch)?).await?;

        let args = self.arguments(launch)?;
        info!(
            instruments = %self.instruments_path.display(),
            args = ?args,
            "Launching instrumentation engine"
        );

        let mut child = Command::new(&self.instruments_path)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                DriverError::Configuration(format!(
                    "Failed to launch {}: {}",
                    self.instruments_path.display(),
                    e
                ))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, "stderr"));
        }

        Ok(Box::new(InstrumentsProcess { child }))
    }
}

async fn forward_output<R: AsyncRead + Unpin>(stream: R, name: &'static str) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "appdrive::instruments::output", stream = name, "{}", line);
    }
}

struct InstrumentsProcess {
    child: Child,
}

#[async_trait]
impl EngineProcess for InstrumentsProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.start_kill() {
            Ok(()) => Ok(()),
            // Already reaped.
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch() -> LaunchConfig {
        let mut launch = LaunchConfig::new(PathBuf::from("/tmp/engine.sock"));
        launch.app_path = Some(PathBuf::from("/apps/Demo.app"));
        launch
    }

    #[test]
    fn test_arguments_for_simulator() {
        let backend = InstrumentsBackend::new(None).with_work_dir(PathBuf::from("/tmp/work"));
        let args = backend.arguments(&launch()).unwrap();
        assert_eq!(&args[..4], ["-t", "Automation", "-D", "/tmp/work/trace"]);
        assert!(args.contains(&"/apps/Demo.app".to_string()));
        assert!(!args.contains(&"-w".to_string()));
        assert_eq!(args.last().unwrap(), "/tmp/work/launch-config.json");
    }

    #[test]
    fn test_arguments_target_real_device() {
        let backend = InstrumentsBackend::new(None);
        let mut launch = launch();
        launch.udid = Some("abc123".to_string());
        let args = backend.arguments(&launch).unwrap();
        let pos = args.iter().position(|a| a == "-w").unwrap();
        assert_eq!(args[pos + 1], "abc123");
    }

    #[test]
    fn test_arguments_require_target() {
        let backend = InstrumentsBackend::new(None);
        let launch = LaunchConfig::new(PathBuf::from("/tmp/engine.sock"));
        assert!(matches!(
            backend.arguments(&launch),
            Err(DriverError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let backend = InstrumentsBackend::new(Some(dir.path().join("no-such-instruments")))
            .with_work_dir(dir.path().to_path_buf());
        let err = backend.spawn(&launch()).await.err().unwrap();
        assert!(matches!(err, DriverError::Configuration(_)));
    }
}
