//! HTTP implementation of the GUI bridge.
//!
//! Binds an axum server on the configured bridge address:
//! - `GET /health` answers `ok`.
//! - `GET /launcher.js` is the page-side script. Pages include it to open
//!   the `/ws` socket.
//! - `GET /ws` is the page socket. The bridge pushes a `hello` message on
//!   connect and a `shutdown` message before it stops. When the last page
//!   disconnects and none reconnects within the close delay, the window
//!   counts as closed.
//! - `POST /api/close` is an explicit window-closed beacon.
//! - Any other path serves a file from the build output, or redirects to
//!   the dev server in dev mode.
//!
//! Ctrl-C and SIGTERM are treated the same as the window closing.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::body::Body;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BridgeTarget, CloseEvent, GuiBridge};
use crate::config::BridgeConfig;
use crate::shutdown::shutdown_signal;
use crate::{AppError, Result};

/// Page-side script that connects the page to the bridge socket and
/// re-dispatches pushed messages as `launcher:<event>` window events.
const LAUNCHER_JS: &str = r#"(() => {
  const script = document.currentScript;
  const base = new URL(script ? script.src : "/launcher.js", location.href);
  const url = new URL("/ws", base);
  url.protocol = url.protocol === "https:" ? "wss:" : "ws:";
  url.searchParams.set("page", location.pathname.replace(/^\//, "") || "index.html");
  const socket = new WebSocket(url);
  socket.addEventListener("message", (event) => {
    const message = JSON.parse(event.data);
    window.dispatchEvent(new CustomEvent("launcher:" + message.event, { detail: message }));
  });
  window.launcherSocket = socket;
})();
"#;

/// Bridge backed by a local axum HTTP server.
#[derive(Debug, Clone)]
pub struct HttpBridge {
    config: BridgeConfig,
}

impl HttpBridge {
    /// Create a bridge that will bind `config.host:config.port`.
    #[must_use]
    pub fn new(config: &BridgeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

impl GuiBridge for HttpBridge {
    fn serve(
        &self,
        target: BridgeTarget,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<CloseEvent>> + Send + '_>> {
        Box::pin(serve_http(&self.config, target, cancel))
    }
}

/// Optional body of the close beacon.
#[derive(Debug, Default, Deserialize)]
struct ClosePayload {
    #[serde(default)]
    page: String,
}

/// Query string of the page socket.
#[derive(Debug, Default, Deserialize)]
struct SocketQuery {
    #[serde(default)]
    page: String,
}

/// Pages currently connected over `/ws`.
#[derive(Debug, Default)]
struct Clients {
    connected: HashMap<u64, SocketAddr>,
    next_id: u64,
    /// Bumped on every connect, so a pending close can tell whether a page
    /// came back in the meantime.
    generation: u64,
}

#[derive(Clone)]
struct BridgeState {
    target: Arc<BridgeTarget>,
    close_tx: mpsc::Sender<CloseEvent>,
    clients: Arc<Mutex<Clients>>,
    close_delay: Duration,
    stop: CancellationToken,
}

impl BridgeState {
    fn connect(&self, peer: SocketAddr) -> u64 {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let id = clients.next_id;
        clients.next_id += 1;
        clients.generation += 1;
        clients.connected.insert(id, peer);
        id
    }

    /// Forget page `id`, returning the generation if no page is left.
    fn disconnect(&self, id: u64) -> Option<u64> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.connected.remove(&id);
        clients.connected.is_empty().then_some(clients.generation)
    }

    fn idle_since(&self, generation: u64) -> bool {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients.connected.is_empty() && clients.generation == generation
    }
}

async fn serve_http(
    config: &BridgeConfig,
    target: BridgeTarget,
    cancel: CancellationToken,
) -> Result<CloseEvent> {
    let (host, port) = (config.host.as_str(), config.port);
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|err| AppError::Bridge(format!("failed to bind {host}:{port}: {err}")))?;
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Bridge(format!("failed to read bound address: {err}")))?;
    let url = format!("http://{addr}/");

    match &target {
        BridgeTarget::Assets { root, entry } => {
            info!(%url, root = %root.display(), entry, "bridge serving production build");
        }
        BridgeTarget::DevProxy { host, port } => {
            info!(
                %url,
                dev_server = %format!("http://{host}:{port}/"),
                "bridge forwarding to dev server"
            );
        }
    }

    let stop = CancellationToken::new();
    let (close_tx, mut close_rx) = mpsc::channel(4);
    let state = BridgeState {
        target: Arc::new(target),
        close_tx,
        clients: Arc::new(Mutex::new(Clients::default())),
        close_delay: config.close_delay(),
        stop: stop.clone(),
    };
    let router = Router::new()
        .route("/health", get(health))
        .route("/launcher.js", get(launcher_js))
        .route("/ws", get(page_socket))
        .route("/api/close", post(close_beacon))
        .fallback(page)
        .with_state(state);

    let server_stop = stop.clone();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { server_stop.cancelled().await })
        .await
    });

    if config.open_browser {
        open_window(url);
    }

    let event = tokio::select! {
        Some(event) = close_rx.recv() => {
            info!(page = event.page, "window closed");
            event
        }
        () = shutdown_signal() => {
            info!("shutdown signal received; closing bridge");
            CloseEvent::default()
        }
        () = cancel.cancelled() => {
            info!("bridge cancelled");
            CloseEvent::default()
        }
    };

    stop.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => return Err(AppError::Bridge(format!("server error: {err}"))),
        Err(err) => return Err(AppError::Bridge(format!("server task failed: {err}"))),
    }

    info!("bridge shut down");
    Ok(event)
}

/// Open `url` with the system's default browser without blocking the
/// runtime. Failure is logged; the URL is already in the logs.
fn open_window(url: String) {
    tokio::task::spawn_blocking(move || match open::that(&url) {
        Ok(()) => info!(%url, "opened window"),
        Err(err) => warn!(%url, %err, "failed to open window; open the url manually"),
    });
}

async fn health() -> &'static str {
    "ok"
}

async fn launcher_js() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/javascript; charset=utf-8")],
        LAUNCHER_JS,
    )
}

async fn page_socket(
    upgrade: WebSocketUpgrade,
    State(state): State<BridgeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(query): Query<SocketQuery>,
) -> Response {
    upgrade.on_upgrade(move |socket| run_page_socket(socket, state, peer, query.page))
}

async fn run_page_socket(mut socket: WebSocket, state: BridgeState, peer: SocketAddr, page: String) {
    let id = state.connect(peer);
    info!(%peer, page, "page connected");

    let target = match state.target.as_ref() {
        BridgeTarget::Assets { .. } => "prod",
        BridgeTarget::DevProxy { .. } => "dev",
    };
    let hello = json!({ "event": "hello", "target": target });
    if let Err(err) = socket.send(Message::Text(hello.to_string().into())).await {
        debug!(%peer, %err, "page went away before hello");
    } else {
        loop {
            tokio::select! {
                incoming = socket.recv() => match incoming {
                    None | Some(Err(_) | Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                },
                () = state.stop.cancelled() => {
                    let bye = json!({ "event": "shutdown" });
                    let _ = socket.send(Message::Text(bye.to_string().into())).await;
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    }

    info!(%peer, page, "page disconnected");
    if let Some(generation) = state.disconnect(id) {
        if !state.stop.is_cancelled() {
            tokio::spawn(close_after_delay(state, generation, page));
        }
    }
}

/// Report the window closed unless a page reconnects within the delay.
async fn close_after_delay(state: BridgeState, generation: u64, page: String) {
    tokio::select! {
        () = tokio::time::sleep(state.close_delay) => {}
        () = state.stop.cancelled() => return,
    }
    if !state.idle_since(generation) {
        debug!("page reconnected; window still open");
        return;
    }

    info!(page, "last page disconnected");
    let event = CloseEvent {
        page,
        connections: Vec::new(),
    };
    if state.close_tx.send(event).await.is_err() {
        debug!("window closed after the bridge stopped listening");
    }
}

async fn close_beacon(
    State(state): State<BridgeState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: String,
) -> StatusCode {
    let payload: ClosePayload = if body.trim().is_empty() {
        ClosePayload::default()
    } else {
        match serde_json::from_str(&body) {
            Ok(payload) => payload,
            Err(err) => {
                debug!(%err, "ignoring malformed close payload");
                ClosePayload::default()
            }
        }
    };

    let event = CloseEvent {
        page: payload.page,
        connections: vec![peer.to_string()],
    };
    if state.close_tx.send(event).await.is_err() {
        warn!("close beacon arrived after the bridge stopped listening");
    }
    StatusCode::ACCEPTED
}

async fn page(State(state): State<BridgeState>, uri: Uri) -> Response {
    match state.target.as_ref() {
        BridgeTarget::DevProxy { host, port } => {
            let path = uri.path_and_query().map_or("/", |pq| pq.as_str());
            Redirect::temporary(&format!("http://{host}:{port}{path}")).into_response()
        }
        BridgeTarget::Assets { root, entry } => serve_asset(root, entry, uri.path()).await,
    }
}

async fn serve_asset(root: &Path, entry: &str, request_path: &str) -> Response {
    let Some(path) = resolve_asset_path(root, entry, request_path) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match tokio::fs::read(&path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&path))],
            Body::from(bytes),
        )
            .into_response(),
        Err(err) => {
            debug!(path = %path.display(), %err, "asset not found");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// Map a request path onto a file under `root`.
///
/// `/` and directory paths resolve to `entry`. Paths that would escape
/// `root` resolve to `None`.
fn resolve_asset_path(root: &Path, entry: &str, request_path: &str) -> Option<PathBuf> {
    let relative = Path::new(request_path.trim_start_matches('/'));
    let mut resolved = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }

    if resolved.is_dir() {
        resolved.push(entry);
    }
    Some(resolved)
}

fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("js" | "mjs") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json" | "map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("webp") => "image/webp",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
