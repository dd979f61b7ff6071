//! Hub server: one read-write owner per hub directory.
//!
//! Startup probes the socket for a live owner, takes `hub.lock`, reclaims a
//! stale socket file and binds. Each client connection is a loop of
//! newline-delimited JSON requests; registry calls run on the blocking pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::config::DevacConfig;
use crate::errors::{DevacError, DevacResult};
use crate::hub::protocol::{
    AddEdgesParams, ClearDiagnosticsParams, DependentsParams, FederatedQueryParams, HubMethod,
    PushDiagnosticsParams, QueryDiagnosticsParams, RegisterParams, RepoIdParams, RpcError,
    RpcRequest, RpcResponse, SummaryParams, INVALID_REQUEST, METHOD_NOT_FOUND, OPERATION_FAILED,
    PARSE_ERROR,
};
use crate::hub::registry::CentralHub;
use crate::query::guards::MAX_IPC_LINE_BYTES;
use crate::store::DirLock;

pub const HUB_LOCK_NAME: &str = "hub.lock";

/// Whether something accepts connections on `socket_path` within `timeout`.
pub async fn probe_socket(socket_path: &Path, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, UnixStream::connect(socket_path)).await,
        Ok(Ok(_))
    )
}

pub struct HubServer {
    config: DevacConfig,
}

/// A started hub. Dropping the handle leaves the server running.
pub struct HubHandle {
    socket_path: PathBuf,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<DevacResult<()>>,
}

impl HubHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Wait for the accept loop to exit.
    pub async fn wait(self) -> DevacResult<()> {
        self.task
            .await
            .map_err(|e| DevacError::Hub(format!("hub task failed: {e}")))?
    }
}

impl HubServer {
    pub fn new(config: DevacConfig) -> Self {
        Self { config }
    }

    pub async fn start(self) -> DevacResult<HubHandle> {
        let hub_dir = self.config.hub.hub_dir();
        std::fs::create_dir_all(&hub_dir)?;
        let socket_path = self.config.hub.socket_path();

        if socket_path.exists() && probe_socket(&socket_path, self.config.hub.probe_timeout()).await {
            return Err(DevacError::HubAlreadyRunning(socket_path.display().to_string()));
        }
        let lock = DirLock::try_acquire(&hub_dir.join(HUB_LOCK_NAME))?
            .ok_or_else(|| DevacError::HubAlreadyRunning(socket_path.display().to_string()))?;
        if socket_path.exists() {
            warn!(socket = %socket_path.display(), "reclaiming stale hub socket");
            std::fs::remove_file(&socket_path)?;
        }

        let hub_config = self.config.hub.clone();
        let engine_config = self.config.engine.clone();
        let hub = tokio::task::spawn_blocking(move || CentralHub::open(&hub_config, &engine_config))
            .await
            .map_err(|e| DevacError::Hub(format!("hub open task failed: {e}")))??;

        let listener = UnixListener::bind(&socket_path)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            Arc::new(hub),
            shutdown_tx.clone(),
            shutdown_rx,
            socket_path.clone(),
            lock,
        ));
        info!(socket = %socket_path.display(), "hub listening");
        Ok(HubHandle {
            socket_path,
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Start and serve until a client calls `shutdown`.
    pub async fn run(self) -> DevacResult<()> {
        self.start().await?.wait().await
    }
}

async fn accept_loop(
    listener: UnixListener,
    hub: Arc<CentralHub>,
    shutdown_tx: watch::Sender<bool>,
    mut shutdown_rx: watch::Receiver<bool>,
    socket_path: PathBuf,
    lock: DirLock,
) -> DevacResult<()> {
    let mut clients = JoinSet::new();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        clients.spawn(serve_client(
                            stream,
                            Arc::clone(&hub),
                            shutdown_tx.clone(),
                            shutdown_tx.subscribe(),
                        ));
                    }
                    Err(e) => warn!("Failed to accept hub client on socket={}: {}", socket_path.display(), e),
                }
            }
            Some(joined) = clients.join_next(), if !clients.is_empty() => {
                if let Err(e) = joined {
                    warn!("Hub client task failed: {}", e);
                }
            }
        }
    }
    drop(listener);

    // Clients stop reading once shutdown is signalled; requests already
    // dispatched run to completion before the hub and its lock are released.
    while let Some(joined) = clients.join_next().await {
        if let Err(e) = joined {
            warn!("Hub client task failed: {}", e);
        }
    }
    drop(hub);
    match std::fs::remove_file(&socket_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove hub socket={}: {}", socket_path.display(), e),
    }
    drop(lock);
    info!(socket = %socket_path.display(), "hub stopped");
    Ok(())
}

/// One newline-delimited frame read from a client.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    TooLong,
    Eof,
}

/// Read one frame, buffering at most `limit + 1` bytes so a peer that never
/// sends a newline cannot grow the buffer without bound.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    let read = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }
    if buf.len() > limit {
        return Ok(Frame::TooLong);
    }
    Ok(Frame::Line(String::from_utf8_lossy(buf).into_owned()))
}

async fn serve_client(
    stream: UnixStream,
    hub: Arc<CentralHub>,
    shutdown: watch::Sender<bool>,
    mut stopping: watch::Receiver<bool>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut buf = Vec::new();
    loop {
        if *stopping.borrow() {
            break;
        }
        let frame = tokio::select! {
            frame = read_frame(&mut reader, &mut buf, MAX_IPC_LINE_BYTES) => frame,
            _ = stopping.changed() => break,
        };
        let (response, stop, close) = match frame {
            Ok(Frame::Line(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let (response, stop) = handle_line(&hub, &line).await;
                (response, stop, false)
            }
            Ok(Frame::TooLong) => {
                warn!(limit = MAX_IPC_LINE_BYTES, "dropping hub client after oversized request");
                (oversized_request(), false, true)
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                debug!(error = %e, "hub client read failed");
                break;
            }
        };
        let mut payload = match serde_json::to_string(&response) {
            Ok(p) => p,
            Err(e) => {
                warn!("Failed to encode hub response: {}", e);
                continue;
            }
        };
        payload.push('\n');
        if let Err(e) = write_half.write_all(payload.as_bytes()).await {
            debug!(error = %e, "hub client write failed");
            break;
        }
        if stop {
            let _ = write_half.flush().await;
            let _ = shutdown.send(true);
            break;
        }
        if close {
            let _ = write_half.flush().await;
            let _ = write_half.shutdown().await;
            break;
        }
    }
}

fn oversized_request() -> RpcResponse {
    RpcResponse::failure(
        Value::Null,
        RpcError::new(INVALID_REQUEST, format!("request exceeds {MAX_IPC_LINE_BYTES} bytes")),
    )
}

/// Decode, dispatch and encode one request line. The flag asks the server
/// to stop after replying.
pub async fn handle_line(hub: &Arc<CentralHub>, line: &str) -> (RpcResponse, bool) {
    if line.len() > MAX_IPC_LINE_BYTES {
        return (oversized_request(), false);
    }
    let raw: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            return (
                RpcResponse::failure(Value::Null, RpcError::new(PARSE_ERROR, format!("Parse error: {e}"))),
                false,
            )
        }
    };
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let request: RpcRequest = match serde_json::from_value(raw) {
        Ok(r) => r,
        Err(e) => {
            return (
                RpcResponse::failure(id, RpcError::new(INVALID_REQUEST, format!("Invalid request: {e}"))),
                false,
            )
        }
    };
    let Some(method) = HubMethod::from_name(&request.method) else {
        return (
            RpcResponse::failure(
                id,
                RpcError::new(METHOD_NOT_FOUND, format!("Method not found: {}", request.method)),
            ),
            false,
        );
    };

    match method {
        HubMethod::Ping => return (RpcResponse::success(id, json!("pong")), false),
        HubMethod::Shutdown => return (RpcResponse::success(id, json!({ "stopping": true })), true),
        _ => {}
    }

    let hub = Arc::clone(hub);
    let params = request.params;
    let outcome = tokio::task::spawn_blocking(move || dispatch(&hub, method, params)).await;
    let response = match outcome {
        Ok(Ok(result)) => RpcResponse::success(id, result),
        Ok(Err(e)) => {
            debug!(method = method.as_str(), error = %e, "hub method failed");
            RpcResponse::failure(id, RpcError::from(&e))
        }
        Err(e) => RpcResponse::failure(id, RpcError::new(OPERATION_FAILED, format!("task failed: {e}"))),
    };
    (response, false)
}

fn params<T: DeserializeOwned>(value: Value) -> DevacResult<T> {
    let value = if value.is_null() { json!({}) } else { value };
    serde_json::from_value(value).map_err(|e| DevacError::InvalidParams(e.to_string()))
}

/// Run one registry method. Lifecycle methods are answered by the connection
/// loop and never reach here.
pub fn dispatch(hub: &CentralHub, method: HubMethod, raw: Value) -> DevacResult<Value> {
    if method.is_write() && hub.is_read_only() {
        return Err(DevacError::HubReadOnly(method.as_str().to_string()));
    }
    let result = match method {
        HubMethod::Ping | HubMethod::Shutdown => Value::Null,
        HubMethod::Register => {
            let p: RegisterParams = params(raw)?;
            serde_json::to_value(hub.register_repo(&p.path)?)?
        }
        HubMethod::Unregister => {
            let p: RepoIdParams = params(raw)?;
            json!({ "removed": hub.unregister_repo(&p.repo_id)? })
        }
        HubMethod::Refresh => {
            let p: RepoIdParams = params(raw)?;
            serde_json::to_value(hub.refresh_repo(&p.repo_id)?)?
        }
        HubMethod::RefreshAll => serde_json::to_value(hub.refresh_all()?)?,
        HubMethod::ListRepos => serde_json::to_value(hub.list_repos()?)?,
        HubMethod::GetRepo => {
            let p: RepoIdParams = params(raw)?;
            serde_json::to_value(hub.get_repo(&p.repo_id)?)?
        }
        HubMethod::Query => {
            let p: FederatedQueryParams = params(raw)?;
            serde_json::to_value(hub.federated_query(&p.sql, p.branch.as_deref(), p.limit)?)?
        }
        HubMethod::AddCrossRepoEdges => {
            let p: AddEdgesParams = params(raw)?;
            json!({ "added": hub.add_cross_repo_edges(&p.edges)? })
        }
        HubMethod::GetDependents => {
            let p: DependentsParams = params(raw)?;
            serde_json::to_value(hub.get_cross_repo_dependents(&p.target)?)?
        }
        HubMethod::PushDiagnostics => {
            let p: PushDiagnosticsParams = params(raw)?;
            json!({ "stored": hub.push_diagnostics(&p.repo_id, &p.source, &p.records)? })
        }
        HubMethod::QueryDiagnostics => {
            let p: QueryDiagnosticsParams = params(raw)?;
            let records = hub.query_diagnostics(&p)?;
            serde_json::to_value(records)?
        }
        HubMethod::ClearDiagnostics => {
            let p: ClearDiagnosticsParams = params(raw)?;
            json!({ "removed": hub.clear_diagnostics(p.repo_id.as_deref(), p.source.as_deref())? })
        }
        HubMethod::DiagnosticsSummary => {
            let p: SummaryParams = params(raw)?;
            serde_json::to_value(hub.diagnostics_summary(p.repo_id.as_deref())?)?
        }
    };
    Ok(result)
}
