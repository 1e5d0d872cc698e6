#![allow(dead_code)]

use appdrive::context::{DISCOVERY_PROBE, RemoteDebugger, WebContext};
use appdrive::device::{DeviceInfo, DeviceTarget, DeviceTargets, LogCapture, Preferences, ResetOptions};
use appdrive::instruments::{CommandProxy, EngineBackend, EngineProcess};
use appdrive::session::launch_wait::NATIVE_TREE_PROBE;
use appdrive::session::{Collaborators, SessionController};
use appdrive::{DriverError, Result, SessionArgs};
use appdrive_protocol::{CommandResponse, LaunchConfig};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

pub const BUNDLE_ID: &str = "io.appdrive.fixture";

/// Engine side of the proxy: answers probes, echoes everything else.
#[derive(Default)]
pub struct FakeProxy {
    sent: Mutex<Vec<String>>,
    hang: Mutex<HashSet<String>>,
    webviews: Mutex<Value>,
    tree: Mutex<Option<Value>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl FakeProxy {
    pub fn new() -> Arc<Self> {
        let proxy = Self::default();
        *proxy.webviews.lock().unwrap() = json!([]);
        Arc::new(proxy)
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, payload: &str) -> usize {
        self.sent().iter().filter(|p| p.as_str() == payload).count()
    }

    /// `payload` is accepted but never answered.
    pub fn hang_on(&self, payload: &str) {
        self.hang.lock().unwrap().insert(payload.to_string());
    }

    pub fn set_webviews(&self, webviews: Value) {
        *self.webviews.lock().unwrap() = webviews;
    }

    pub fn set_tree(&self, tree: Value) {
        *self.tree.lock().unwrap() = Some(tree);
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    pub async fn wait_for_sent(&self, payload: &str) {
        while self.sent_count(payload) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn reply(&self, payload: &str) -> CommandResponse {
        if payload == NATIVE_TREE_PROBE {
            let tree = self.tree.lock().unwrap().clone();
            return CommandResponse::success(tree.unwrap_or_else(|| json!({"name": "Fixture"})));
        }
        if payload == DISCOVERY_PROBE {
            return CommandResponse::success(self.webviews.lock().unwrap().clone());
        }
        if payload == "au.bundleId()" {
            return CommandResponse::success(json!(BUNDLE_ID));
        }
        CommandResponse::success(json!(payload))
    }
}

#[async_trait]
impl CommandProxy for FakeProxy {
    async fn wait_connected(&self) -> Result<()> {
        Ok(())
    }

    async fn send(&self, payload: &str) -> Result<CommandResponse> {
        self.sent.lock().unwrap().push(payload.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let hangs = self.hang.lock().unwrap().contains(payload);
        if hangs {
            std::future::pending::<()>().await;
        }
        tokio::task::yield_now().await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(self.reply(payload))
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeProcess {
    exit_rx: Option<oneshot::Receiver<i32>>,
    killed: Arc<AtomicUsize>,
    was_killed: bool,
}

#[async_trait]
impl EngineProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        Some(31337)
    }

    async fn wait(&mut self) -> Result<Option<i32>> {
        if self.was_killed {
            return Ok(Some(0));
        }
        match self.exit_rx.as_mut() {
            Some(rx) => Ok(rx.await.ok()),
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> Result<()> {
        self.was_killed = true;
        self.killed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeBackend {
    pub proxy: Arc<FakeProxy>,
    spawns: AtomicUsize,
    kills: Arc<AtomicUsize>,
    exit_tx: Mutex<Option<oneshot::Sender<i32>>>,
}

impl FakeBackend {
    pub fn new(proxy: Arc<FakeProxy>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            spawns: AtomicUsize::new(0),
            kills: Arc::new(AtomicUsize::new(0)),
            exit_tx: Mutex::new(None),
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    /// Makes the running engine exit on its own.
    pub fn crash(&self, code: i32) {
        if let Some(tx) = self.exit_tx.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }
}

#[async_trait]
impl EngineBackend for FakeBackend {
    async fn listen(&self, _launch: &LaunchConfig) -> Result<Arc<dyn CommandProxy>> {
        Ok(self.proxy.clone())
    }

    async fn spawn(&self, _launch: &LaunchConfig) -> Result<Box<dyn EngineProcess>> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        *self.exit_tx.lock().unwrap() = Some(tx);
        Ok(Box::new(FakeProcess {
            exit_rx: Some(rx),
            killed: self.kills.clone(),
            was_killed: false,
        }))
    }
}

#[derive(Default)]
pub struct FakeDevice {
    pub missing: AtomicBool,
    pub failing_reset: AtomicBool,
    detects: AtomicUsize,
    resets: AtomicUsize,
    installs: Mutex<Vec<PathBuf>>,
}

impl FakeDevice {
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn installs(&self) -> Vec<PathBuf> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeviceTarget for FakeDevice {
    async fn detect(&self, args: &SessionArgs) -> Result<DeviceInfo> {
        self.detects.fetch_add(1, Ordering::SeqCst);
        if self.missing.load(Ordering::SeqCst) {
            return Err(DriverError::DeviceNotAvailable("fixture device unplugged".into()));
        }
        Ok(DeviceInfo {
            udid: args.udid.clone().unwrap_or_else(|| "SIM-FIXTURE".into()),
            name: "Fixture Phone".into(),
            platform_version: args.platform_version.clone(),
            kind: args.device_kind(),
        })
    }

    async fn install(&self, _device: &DeviceInfo, app: &Path) -> Result<()> {
        self.installs.lock().unwrap().push(app.to_path_buf());
        Ok(())
    }

    async fn reset(&self, _device: &DeviceInfo, _options: &ResetOptions) -> Result<()> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.failing_reset.load(Ordering::SeqCst) {
            return Err(DriverError::Device("reset exploded".into()));
        }
        Ok(())
    }

    async fn clean_state(&self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    async fn directories(&self, _device: &DeviceInfo) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }

    async fn set_locale(&self, _device: &DeviceInfo, _language: Option<&str>, _locale: Option<&str>) -> Result<()> {
        Ok(())
    }

    async fn set_preferences(&self, _device: &DeviceInfo, _preferences: &Preferences) -> Result<()> {
        Ok(())
    }

    async fn launch(&self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }

    async fn terminate(&self, _device: &DeviceInfo) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeLogs {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub clears: AtomicUsize,
}

#[async_trait]
impl LogCapture for FakeLogs {
    async fn start(&self, _device: &DeviceInfo) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) {
        self.clears.fetch_add(1, Ordering::SeqCst);
    }

    async fn lines(&self) -> Vec<String> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct FakeDebugger {
    selected: Mutex<Vec<String>>,
    pub cancels: AtomicUsize,
}

impl FakeDebugger {
    pub fn selected(&self) -> Vec<String> {
        self.selected.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteDebugger for FakeDebugger {
    async fn select_page(&self, page: &WebContext) -> Result<()> {
        self.selected.lock().unwrap().push(page.id.clone());
        Ok(())
    }

    async fn cancel_page_load(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// A controller wired to fakes, with handles to inspect them.
pub struct Harness {
    pub proxy: Arc<FakeProxy>,
    pub backend: Arc<FakeBackend>,
    pub device: Arc<FakeDevice>,
    pub logs: Arc<FakeLogs>,
    pub debugger: Arc<FakeDebugger>,
}

impl Harness {
    pub fn new() -> Self {
        let proxy = FakeProxy::new();
        Self {
            backend: FakeBackend::new(proxy.clone()),
            proxy,
            device: Arc::new(FakeDevice::default()),
            logs: Arc::new(FakeLogs::default()),
            debugger: Arc::new(FakeDebugger::default()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            backend: self.backend.clone(),
            targets: DeviceTargets {
                simulator: self.device.clone(),
                real_device: self.device.clone(),
            },
            logs: self.logs.clone(),
            debugger: self.debugger.clone(),
        }
    }

    pub fn controller(&self) -> SessionController {
        SessionController::new(self.collaborators())
    }

    pub fn simulator_args(&self) -> SessionArgs {
        SessionArgs {
            bundle_id: Some(BUNDLE_ID.to_string()),
            platform_version: Some("17.2".to_string()),
            ..Default::default()
        }
    }
}
