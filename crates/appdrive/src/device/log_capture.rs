use super::DeviceInfo;
use crate::config::DeviceKind;
use crate::{DriverError, Result};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const DEFAULT_CAPACITY: usize = 10_000;

/// Collects device logs for the lifetime of a session.
#[async_trait]
pub trait LogCapture: Send + Sync {
    async fn start(&self, device: &DeviceInfo) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    async fn clear(&self);

    async fn lines(&self) -> Vec<String>;
}

/// Bounded buffer that drops the oldest lines once full.
#[derive(Debug)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    capacity: usize,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, line: String) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }
}

/// Streams the system log of a simulator or device into a [`LogBuffer`].
pub struct SyslogCapture {
    buffer: Arc<Mutex<LogBuffer>>,
    child: Mutex<Option<Child>>,
}

impl SyslogCapture {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Arc::new(Mutex::new(LogBuffer::new(capacity))),
            child: Mutex::new(None),
        }
    }

    pub fn command_for(device: &DeviceInfo) -> (&'static str, Vec<String>) {
        match device.kind {
            DeviceKind::Simulator => (
                "xcrun",
                vec![
                    "simctl".into(),
                    "spawn".into(),
                    device.udid.clone(),
                    "log".into(),
                    "stream".into(),
                    "--style".into(),
                    "compact".into(),
                ],
            ),
            DeviceKind::RealDevice => ("idevicesyslog", vec!["-u".into(), device.udid.clone()]),
        }
    }
}

impl Default for SyslogCapture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogCapture for SyslogCapture {
    async fn start(&self, device: &DeviceInfo) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            debug!("Log capture already running");
            return Ok(());
        }

        let (program, args) = Self::command_for(device);
        let mut child = Command::new(program)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| DriverError::Device(format!("Failed to start {}: {}", program, e)))?;

        if let Some(stdout) = child.stdout.take() {
            let buffer = self.buffer.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    buffer.lock().await.push(line);
                }
                debug!("Log stream ended");
            });
        }

        info!(udid = %device.udid, "Started log capture");
        *slot = Some(child);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            if let Err(e) = child.kill().await {
                warn!("Failed to stop log capture: {}", e);
            }
        }
        Ok(())
    }

    async fn clear(&self) {
        self.buffer.lock().await.clear();
    }

    async fn lines(&self) -> Vec<String> {
        self.buffer.lock().await.snapshot()
    }
}
