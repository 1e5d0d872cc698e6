use crate::{DriverError, Result};
use appdrive_protocol::{CommandResponse, ProxyReply, ProxyRequest};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Local channel carrying opaque instructions to the instrumentation engine.
#[async_trait]
pub trait CommandProxy: Send + Sync {
    /// Resolves once the engine has made its first connection.
    async fn wait_connected(&self) -> Result<()>;

    /// Sends one instruction and waits for its response.
    async fn send(&self, payload: &str) -> Result<CommandResponse>;

    /// Gracefully closes the transport.
    async fn shutdown(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Waiting,
    Connected,
    Closed,
}

type ResponseHandlers = Arc<Mutex<HashMap<String, oneshot::Sender<CommandResponse>>>>;

/// Unix socket server the engine's bootstrap script connects back to.
///
/// Requests and replies are newline-delimited JSON. Only the first client is
/// served; the engine never reconnects within one process lifetime.
pub struct UnixSocketProxy {
    socket_path: PathBuf,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    response_handlers: ResponseHandlers,
    state: watch::Receiver<ConnectionState>,
    server_handle: Mutex<Option<JoinHandle<()>>>,
}

impl UnixSocketProxy {
    /// Binds the socket and starts accepting the engine's connection.
    pub async fn bind(socket_path: PathBuf) -> Result<Arc<Self>> {
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).map_err(|e| {
                DriverError::CommandProxy(format!("Failed to remove existing socket: {}", e))
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| DriverError::CommandProxy(format!("Failed to bind Unix socket: {}", e)))?;

        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&socket_path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(&socket_path, perms)?;
        }

        info!(socket = %socket_path.display(), "Command proxy listening");

        let writer = Arc::new(Mutex::new(None));
        let response_handlers: ResponseHandlers = Arc::new(Mutex::new(HashMap::new()));
        let (state_tx, state) = watch::channel(ConnectionState::Waiting);

        let handle = tokio::spawn(serve(
            listener,
            writer.clone(),
            response_handlers.clone(),
            state_tx,
        ));

        Ok(Arc::new(Self {
            socket_path,
            writer,
            response_handlers,
            state,
            server_handle: Mutex::new(Some(handle)),
        }))
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }
}

#[async_trait]
impl CommandProxy for UnixSocketProxy {
    async fn wait_connected(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| *s != ConnectionState::Waiting)
            .await
            .map(|s| *s)
            .map_err(|_| DriverError::CommandProxy("Proxy server stopped".to_string()))?;

        match reached {
            ConnectionState::Connected => Ok(()),
            _ => Err(DriverError::CommandProxy(
                "Engine disconnected before the proxy became ready".to_string(),
            )),
        }
    }

    async fn send(&self, payload: &str) -> Result<CommandResponse> {
        if self.connection_state() != ConnectionState::Connected {
            return Err(DriverError::CommandProxy(
                "Not connected to the instrumentation engine".to_string(),
            ));
        }

        let request = ProxyRequest {
            id: Uuid::new_v4().to_string(),
            payload: payload.to_string(),
        };
        let (tx, rx) = oneshot::channel();
        self.response_handlers
            .lock()
            .await
            .insert(request.id.clone(), tx);

        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let written = {
            let mut writer = self.writer.lock().await;
            match writer.as_mut() {
                Some(stream) => match stream.write_all(line.as_bytes()).await {
                    Ok(()) => stream.flush().await,
                    Err(e) => Err(e),
                },
                None => Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "proxy writer closed",
                )),
            }
        };

        if let Err(e) = written {
            self.response_handlers.lock().await.remove(&request.id);
            return Err(DriverError::CommandProxy(format!("Failed to send command: {}", e)));
        }

        rx.await.map_err(|_| {
            DriverError::CommandProxy("Connection closed before a response arrived".to_string())
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(handle) = self.server_handle.lock().await.take() {
            handle.abort();
        }
        if let Some(mut stream) = self.writer.lock().await.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error shutting down proxy stream: {}", e);
            }
        }
        self.response_handlers.lock().await.clear();
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        debug!(socket = %self.socket_path.display(), "Command proxy shut down");
        Ok(())
    }
}

impl Drop for UnixSocketProxy {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            let _ = std::fs::remove_file(&self.socket_path);
        }
    }
}

async fn serve(
    listener: UnixListener,
    writer: Arc<Mutex<Option<OwnedWriteHalf>>>,
    response_handlers: ResponseHandlers,
    state: watch::Sender<ConnectionState>,
) {
    let stream = match listener.accept().await {
        Ok((stream, _)) => stream,
        Err(e) => {
            warn!("Failed to accept engine connection: {}", e);
            state.send_replace(ConnectionState::Closed);
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    *writer.lock().await = Some(write_half);
    state.send_replace(ConnectionState::Connected);
    info!("Instrumentation engine connected to command proxy");

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => match serde_json::from_str::<ProxyReply>(&line) {
                Ok(reply) => {
                    let handler = response_handlers.lock().await.remove(&reply.id);
                    match handler {
                        Some(tx) => {
                            let _ = tx.send(reply.response);
                        }
                        None => debug!(id = %reply.id, "Reply for unknown command"),
                    }
                }
                Err(e) => warn!("Unparseable proxy reply: {}", e),
            },
            Err(e) => {
                warn!("Error reading from engine: {}", e);
                break;
            }
        }
    }

    info!("Instrumentation engine disconnected from command proxy");
    writer.lock().await.take();
    // Dropping the senders fails every outstanding `send`.
    response_handlers.lock().await.clear();
    state.send_replace(ConnectionState::Closed);
}
