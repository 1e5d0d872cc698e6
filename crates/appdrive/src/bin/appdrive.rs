use appdrive::dispatch::CommandResult;
use appdrive::session::{Collaborators, DeathWatch, SessionController};
use appdrive::{DriverError, SessionArgs};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(serde::Deserialize)]
struct JsonRpcRequest {
    #[allow(dead_code)]
    jsonrpc: String,
    id: Option<Value>,
    method: String,
    params: Option<Value>,
}

#[derive(serde::Serialize)]
struct JsonRpcResponse {
    jsonrpc: String,
    id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<Value>,
}

impl JsonRpcResponse {
    fn ok(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn err(id: Option<Value>, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        let mut error = json!({ "code": code, "message": message.into() });
        if let Some(data) = data {
            error["data"] = data;
        }
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    fn driver_error(id: Option<Value>, e: &DriverError) -> Self {
        Self::err(id, -32000, e.to_string(), Some(json!({ "status": e.status() })))
    }
}

type Output = Arc<Mutex<Stdout>>;

async fn write_line(out: &Output, value: &impl serde::Serialize) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    let mut out = out.lock().await;
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Forwards a session death to the client as a notification.
fn report_death(out: Output, died: DeathWatch) {
    tokio::spawn(async move {
        if let Ok(death) = died.await {
            let notification = json!({
                "jsonrpc": "2.0",
                "method": "session/died",
                "params": death,
            });
            if let Err(e) = write_line(&out, &notification).await {
                error!("Failed to report session death: {}", e);
            }
        }
    });
}

fn string_param(params: &Option<Value>, key: &str) -> Option<String> {
    params
        .as_ref()
        .and_then(|p| p.get(key))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

/// Capabilities used by `session/start` requests that carry no params.
fn default_capabilities() -> anyhow::Result<SessionArgs> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--capabilities" {
            let path = args
                .next()
                .ok_or_else(|| anyhow::anyhow!("--capabilities needs a file path"))?;
            let caps = SessionArgs::from_file(std::path::Path::new(&path))?;
            info!(path = %path, "Loaded default capabilities");
            return Ok(caps);
        }
    }
    Ok(SessionArgs::default())
}

/// Answers an already enqueued `session/execute` once its result arrives.
fn respond_when_done(out: Output, id: Option<Value>, result: oneshot::Receiver<CommandResult>) {
    tokio::spawn(async move {
        let response = match result.await {
            Ok(Ok(Some(response))) => match serde_json::to_value(response) {
                Ok(value) => JsonRpcResponse::ok(id, value),
                Err(e) => JsonRpcResponse::err(id, -32603, format!("Internal error: {}", e), None),
            },
            Ok(Ok(None)) => JsonRpcResponse::ok(id, Value::Null),
            Ok(Err(e)) => JsonRpcResponse::driver_error(id, &e),
            Err(_) => JsonRpcResponse::driver_error(
                id,
                &DriverError::CommandProxy("Dispatch queue dropped the command".to_string()),
            ),
        };
        if let Err(e) = write_line(&out, &response).await {
            error!("Failed to write command response: {}", e);
        }
    });
}

fn controller_for(args: &SessionArgs) -> SessionController {
    let instruments = args
        .instruments_path
        .clone()
        .or_else(|| std::env::var_os("APPDRIVE_INSTRUMENTS").map(PathBuf::from));
    SessionController::new(Collaborators::system(instruments))
}

/// Handles one request. `None` means the response is written later by a spawned task.
async fn handle(
    controller: &mut SessionController,
    defaults: &SessionArgs,
    out: &Output,
    request: JsonRpcRequest,
) -> Option<JsonRpcResponse> {
    let id = request.id;
    let response = match request.method.as_str() {
        "session/start" => {
            let args: SessionArgs = match request.params {
                Some(params) => match serde_json::from_value(params) {
                    Ok(args) => args,
                    Err(e) => {
                        return Some(JsonRpcResponse::err(id, -32602, format!("Invalid params: {}", e), None));
                    }
                },
                None => defaults.clone(),
            };
            // each session gets an engine backend built from its own capabilities
            if controller.state().is_startable() {
                *controller = controller_for(&args);
            }
            match controller.start(args).await {
                Ok(died) => {
                    report_death(out.clone(), died);
                    JsonRpcResponse::ok(id, json!({ "state": controller.state().to_string() }))
                }
                Err(e) => JsonRpcResponse::driver_error(id, &e),
            }
        }
        "session/stop" => match controller.stop().await {
            Ok(()) => JsonRpcResponse::ok(id, json!({ "state": controller.state().to_string() })),
            Err(e) => JsonRpcResponse::driver_error(id, &e),
        },
        "session/execute" => {
            let Some(payload) = string_param(&request.params, "payload") else {
                return Some(JsonRpcResponse::err(id, -32602, "Missing 'payload'", None));
            };
            // enqueued in request order; the reply may come after later requests
            let result = controller.submit(payload).await;
            debug!(?id, "Command enqueued");
            respond_when_done(out.clone(), id, result);
            return None;
        }
        "session/contexts" => match controller.contexts().await {
            Ok(contexts) => JsonRpcResponse::ok(
                id,
                json!({ "contexts": contexts, "current": controller.current_context().await }),
            ),
            Err(e) => JsonRpcResponse::driver_error(id, &e),
        },
        "session/setContext" => {
            let Some(name) = string_param(&request.params, "name") else {
                return Some(JsonRpcResponse::err(id, -32602, "Missing 'name'", None));
            };
            match controller.set_context(&name).await {
                Ok(()) => JsonRpcResponse::ok(id, json!({ "current": name })),
                Err(e) => JsonRpcResponse::driver_error(id, &e),
            }
        }
        "session/state" => JsonRpcResponse::ok(
            id,
            json!({
                "state": controller.state().to_string(),
                "shuttingDown": controller.is_shutting_down(),
                "context": controller.current_context().await,
            }),
        ),
        other => JsonRpcResponse::err(id, -32601, format!("Method not found: {}", other), None),
    };
    Some(response)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let defaults = default_capabilities()?;
    let mut controller = controller_for(&defaults);
    let out: Output = Arc::new(Mutex::new(tokio::io::stdout()));

    info!("appdrive ready, listening for JSON-RPC requests on stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: JsonRpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let response = JsonRpcResponse::err(None, -32700, format!("Parse error: {}", e), None);
                write_line(&out, &response).await?;
                continue;
            }
        };

        if let Some(response) = handle(&mut controller, &defaults, &out, request).await {
            write_line(&out, &response).await?;
        }
    }

    info!("stdin closed, stopping session");
    controller.stop().await?;
    Ok(())
}
