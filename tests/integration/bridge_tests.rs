//! Integration tests for the HTTP bridge.
//!
//! Each test discovers a free port, then lets the bridge bind it. The bridge
//! runs in a spawned task and reports its close event through the join
//! handle.

use std::path::Path;
use std::time::Duration;

use futures_util::StreamExt;
use gui_launcher::bridge::{BridgeTarget, CloseEvent, GuiBridge, HttpBridge};
use gui_launcher::config::BridgeConfig;
use gui_launcher::Result;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::test_helpers::closed_port;

struct RunningBridge {
    base_url: String,
    cancel: CancellationToken,
    handle: JoinHandle<Result<CloseEvent>>,
}

fn bridge_config(port: u16, close_delay_ms: u64) -> BridgeConfig {
    BridgeConfig {
        host: "127.0.0.1".into(),
        port,
        open_browser: false,
        close_delay_ms,
    }
}

async fn spawn_bridge(target: BridgeTarget) -> RunningBridge {
    spawn_bridge_with_delay(target, 50).await
}

async fn spawn_bridge_with_delay(target: BridgeTarget, close_delay_ms: u64) -> RunningBridge {
    let port = closed_port().await;
    let bridge = HttpBridge::new(&bridge_config(port, close_delay_ms));
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    let handle = tokio::spawn(async move { bridge.serve(target, serve_cancel).await });

    let base_url = format!("http://127.0.0.1:{port}");
    let client = client();
    for _ in 0..100 {
        if client.get(format!("{base_url}/health")).send().await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    RunningBridge {
        base_url,
        cancel,
        handle,
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("http client")
}

type PageSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connect to the page socket the way `launcher.js` does.
async fn connect_page(bridge: &RunningBridge, page: &str) -> PageSocket {
    let url = format!(
        "{}/ws?page={page}",
        bridge.base_url.replacen("http://", "ws://", 1)
    );
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .expect("websocket connect");
    socket
}

/// Next pushed message, decoded as JSON.
async fn next_event(socket: &mut PageSocket) -> serde_json::Value {
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("message arrives")
        .expect("socket open")
        .expect("valid frame");
    let Message::Text(text) = message else {
        panic!("expected a text message, got {message:?}");
    };
    serde_json::from_str(text.as_str()).expect("json message")
}

fn assets_target(root: &Path) -> BridgeTarget {
    std::fs::write(root.join("index.html"), "<h1>launcher</h1>").expect("write entry");
    std::fs::create_dir(root.join("assets")).expect("assets dir");
    std::fs::write(root.join("assets").join("app.js"), "console.log(1);").expect("write js");
    BridgeTarget::Assets {
        root: root.to_path_buf(),
        entry: "index.html".into(),
    }
}

async fn finish(bridge: RunningBridge) -> CloseEvent {
    tokio::time::timeout(Duration::from_secs(5), bridge.handle)
        .await
        .expect("bridge stops")
        .expect("bridge task")
        .expect("bridge result")
}

#[tokio::test]
async fn health_returns_ok() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let resp = client()
        .get(format!("{}/health", bridge.base_url))
        .send()
        .await
        .expect("GET /health");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "ok");

    bridge.cancel.cancel();
    finish(bridge).await;
}

/// `/` serves the entry page; nested paths serve files with a matching
/// content type.
#[tokio::test]
async fn serves_build_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;
    let client = client();

    let resp = client
        .get(format!("{}/", bridge.base_url))
        .send()
        .await
        .expect("GET /");
    assert_eq!(resp.status(), 200);
    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    assert_eq!(content_type.as_deref(), Some("text/html; charset=utf-8"));
    assert_eq!(resp.text().await.expect("body"), "<h1>launcher</h1>");

    let resp = client
        .get(format!("{}/assets/app.js", bridge.base_url))
        .send()
        .await
        .expect("GET app.js");
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.expect("body"), "console.log(1);");

    bridge.cancel.cancel();
    finish(bridge).await;
}

#[tokio::test]
async fn missing_asset_is_not_found() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let resp = client()
        .get(format!("{}/nope.css", bridge.base_url))
        .send()
        .await
        .expect("GET missing");
    assert_eq!(resp.status(), 404);

    bridge.cancel.cancel();
    finish(bridge).await;
}

/// The close beacon ends the bridge and carries the reporting page.
#[tokio::test]
async fn close_beacon_ends_serving() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let resp = client()
        .post(format!("{}/api/close", bridge.base_url))
        .header("content-type", "application/json")
        .body(r#"{"page":"index.html"}"#)
        .send()
        .await
        .expect("POST /api/close");
    assert_eq!(resp.status(), 202);

    let event = finish(bridge).await;
    assert_eq!(event.page, "index.html");
    assert_eq!(event.connections.len(), 1);
    assert!(event.connections[0].starts_with("127.0.0.1:"));
}

/// An empty beacon body still closes the window.
#[tokio::test]
async fn empty_close_beacon_is_accepted() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let resp = client()
        .post(format!("{}/api/close", bridge.base_url))
        .send()
        .await
        .expect("POST /api/close");
    assert_eq!(resp.status(), 202);

    let event = finish(bridge).await;
    assert!(event.page.is_empty());
}

/// In dev mode pages redirect to the dev server, keeping path and query.
#[tokio::test]
async fn dev_proxy_redirects_to_dev_server() {
    let bridge = spawn_bridge(BridgeTarget::DevProxy {
        host: "127.0.0.1".into(),
        port: 5173,
    })
    .await;

    let resp = client()
        .get(format!("{}/src/main.ts?v=1", bridge.base_url))
        .send()
        .await
        .expect("GET page");
    assert_eq!(resp.status(), 307);
    let location = resp
        .headers()
        .get("location")
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);
    assert_eq!(
        location.as_deref(),
        Some("http://127.0.0.1:5173/src/main.ts?v=1")
    );

    bridge.cancel.cancel();
    finish(bridge).await;
}

/// Cancelling resolves with an empty close event.
#[tokio::test]
async fn cancel_stops_bridge() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    bridge.cancel.cancel();
    let event = finish(bridge).await;
    assert_eq!(event, CloseEvent::default());
}

/// A port that is already taken is a bridge error, not a hang.
#[tokio::test]
async fn occupied_port_is_a_bridge_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let port = listener.local_addr().expect("local addr").port();
    let bridge = HttpBridge::new(&bridge_config(port, 50));

    let result = bridge
        .serve(
            BridgeTarget::DevProxy {
                host: "127.0.0.1".into(),
                port: 5173,
            },
            CancellationToken::new(),
        )
        .await;
    assert!(matches!(result, Err(gui_launcher::AppError::Bridge(_))));
    drop(listener);
}

#[tokio::test]
async fn launcher_script_is_served() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let resp = client()
        .get(format!("{}/launcher.js", bridge.base_url))
        .send()
        .await
        .expect("GET /launcher.js");
    assert_eq!(resp.status(), 200);
    let body = resp.text().await.expect("body");
    assert!(body.contains("new WebSocket"));

    bridge.cancel.cancel();
    finish(bridge).await;
}

/// Closing the only page ends serving once the close delay has passed.
#[tokio::test]
async fn last_page_disconnect_closes_window() {
    let temp = tempfile::tempdir().expect("tempdir");
    let bridge = spawn_bridge(assets_target(temp.path())).await;

    let mut socket = connect_page(&bridge, "index.html").await;
    let hello = next_event(&mut socket).await;
    assert_eq!(hello["event"], "hello");
    assert_eq!(hello["target"], "prod");
    socket.close(None).await.expect("close socket");
    drop(socket);

    let event = finish(bridge).await;
    assert_eq!(event.page, "index.html");
    assert!(event.connections.is_empty());
}

/// A page that reconnects within the close delay (a reload) keeps the
/// window open, and is told when the bridge shuts down.
#[tokio::test]
async fn reload_within_close_delay_keeps_window_open() {
    let bridge = spawn_bridge_with_delay(
        BridgeTarget::DevProxy {
            host: "127.0.0.1".into(),
            port: 5173,
        },
        300,
    )
    .await;

    let mut first = connect_page(&bridge, "index.html").await;
    assert_eq!(next_event(&mut first).await["target"], "dev");
    first.close(None).await.expect("close socket");
    drop(first);

    let mut second = connect_page(&bridge, "index.html").await;
    assert_eq!(next_event(&mut second).await["event"], "hello");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(!bridge.handle.is_finished(), "reload must not close the window");

    bridge.cancel.cancel();
    assert_eq!(next_event(&mut second).await["event"], "shutdown");
    let event = finish(bridge).await;
    assert_eq!(event, CloseEvent::default());
}
