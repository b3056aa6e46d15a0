//! Integration test for the HTTP health endpoint.
//! Spins up the IPC server on a random port and sends a raw HTTP GET /health request.

use std::sync::Arc;

use alarmd::config::DaemonConfig;
use alarmd::credential::StaticCredentialVerifier;
use alarmd::storage::Store;
use alarmd::{ipc, AppContext};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

async fn make_test_ctx(dir: &TempDir, port: u16) -> Arc<AppContext> {
    let data_dir = dir.path().to_path_buf();
    let config = Arc::new(DaemonConfig::new(
        Some(port),
        Some(data_dir.clone()),
        Some("error".to_string()),
        None,
    ));
    let store = Arc::new(Store::new(&data_dir).await.unwrap());
    let verifier = Arc::new(StaticCredentialVerifier::new());
    Arc::new(AppContext::new(config, store, verifier))
}

#[tokio::test]
async fn test_health_endpoint_response_fields() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = ipc::run(ctx_clone).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    let request = "GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);

    let body_start = response
        .find("\r\n\r\n")
        .map(|i| i + 4)
        .expect("no body in response");
    let body = &response[body_start..];

    let json: serde_json::Value = serde_json::from_str(body).expect("body is not valid JSON");

    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json["uptime"].is_number());
    assert!(json["activeSessions"].is_number());
    assert_eq!(json["activeSessions"], 0);
    assert_eq!(json["port"].as_u64().unwrap(), port as u64);
    assert_eq!(
        json["version"].as_str().unwrap(),
        env!("CARGO_PKG_VERSION")
    );
}

#[tokio::test]
async fn test_health_endpoint_returns_200() {
    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = ipc::run(ctx_clone).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut stream = TcpStream::connect(format!("127.0.0.1:{port}")).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf);

    let first_line = response.lines().next().unwrap_or("");
    assert!(first_line.contains("200"), "expected HTTP 200, got: {first_line}");
    assert!(response.contains("Content-Type: application/json"));
}

#[tokio::test]
async fn unauthenticated_websocket_connection_is_closed_without_an_envelope() {
    use futures_util::StreamExt;

    let dir = TempDir::new().unwrap();
    let port = find_free_port();
    let ctx = make_test_ctx(&dir, port).await;

    let ctx_clone = ctx.clone();
    tokio::spawn(async move {
        let _ = ipc::run(ctx_clone).await;
    });

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    // No token in the query string at all — the credential verifier rejects
    // the empty-string token and the handshake callback never saw one.
    let url = format!("ws://127.0.0.1:{port}/");
    let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let (_sink, mut stream) = ws.split();

    // The connection is closed with no frames at all, not even an error envelope.
    let next = stream.next().await;
    assert!(
        next.is_none() || matches!(next, Some(Ok(tokio_tungstenite::tungstenite::Message::Close(_)))),
        "expected the connection to close without a data frame, got {next:?}"
    );
}
