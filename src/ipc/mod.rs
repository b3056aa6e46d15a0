//! Connection lifecycle: accept loop, WebSocket upgrade with query-string
//! bearer auth, per-session read/write loop, and graceful shutdown.
//!
//! Grounded on the teacher's `ipc::run`/`handle_connection` shape (shared
//! health-check port, per-IP connection rate limiting, SIGTERM/Ctrl-C
//! shutdown future) but generalized from JSON-RPC dispatch over a shared
//! broadcast channel to the alarm/page envelope protocol over a per-session
//! bounded channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, instrument, warn};

use crate::dispatcher::{self, SessionCtx};
use crate::error::{error_frame, AlarmError};
use crate::protocol::{InboundMessage, OutboundMessage, PageSummary, UserSummary};
use crate::session::new_handle;
use crate::AppContext;

const MAX_RPC_PER_SEC: u32 = 100;

/// Per-IP connection rate tracker — identical shape to the teacher's.
struct ConnectionRateLimiter {
    connections: HashMap<IpAddr, Vec<Instant>>,
    limit_per_min: usize,
}

impl ConnectionRateLimiter {
    fn new(limit_per_min: usize) -> Self {
        Self { connections: HashMap::new(), limit_per_min }
    }

    fn check_and_record(&mut self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let one_min_ago = now - std::time::Duration::from_secs(60);

        let timestamps = self.connections.entry(ip).or_default();
        timestamps.retain(|t| *t > one_min_ago);

        if timestamps.len() >= self.limit_per_min {
            return false;
        }
        timestamps.push(now);
        true
    }
}

/// Per-connection command rate tracker using a tumbling one-second window.
struct RpcRateLimiter {
    count: u32,
    window_start: Instant,
}

impl RpcRateLimiter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn check(&mut self) -> bool {
        let now = Instant::now();
        if now.duration_since(self.window_start).as_secs() >= 1 {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.count <= MAX_RPC_PER_SEC
    }
}

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("127.0.0.1:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "alarmd listening (WebSocket + HTTP health on same port)");

    let conn_limiter = Arc::new(AsyncMutex::new(ConnectionRateLimiter::new(
        ctx.config.max_connections_per_min,
    )));

    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received — stopping IPC server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };

                {
                    let mut limiter = conn_limiter.lock().await;
                    if !limiter.check_and_record(peer.ip()) {
                        warn!(peer = %peer, "connection rate limit exceeded — rejecting");
                        drop(stream);
                        continue;
                    }
                }

                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("IPC server stopped");
    Ok(())
}

async fn handle_health_check(mut stream: TcpStream, ctx: &AppContext) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let uptime_secs = ctx.started_at.elapsed().as_secs();
    let active = ctx.registry.active_count().await;
    let body = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": uptime_secs,
        "activeSessions": active,
        "port": ctx.config.port,
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}

/// Resolves when a shutdown signal is received: SIGTERM or Ctrl-C on Unix,
/// Ctrl-C only elsewhere.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Pull `token` out of the WebSocket handshake request's query string.
/// Read synchronously inside the `accept_hdr_async` callback, before the
/// upgrade completes — an unauthenticated peer never finishes the
/// handshake at all.
fn extract_token(req: &Request) -> Option<String> {
    let query = req.uri().query()?;
    for pair in query.split('&') {
        if let Some(value) = pair.strip_prefix("token=") {
            return Some(value.to_string());
        }
    }
    None
}

async fn handle_connection(stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    // Both an HTTP health check and a WebSocket upgrade start with "GET ";
    // peek far enough to tell a health check apart without consuming bytes
    // the WS handshake would otherwise need.
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    let token_holder: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let token_holder_cb = token_holder.clone();
    let callback = move |req: &Request, response: Response| {
        *token_holder_cb.lock().unwrap() = extract_token(req);
        Ok(response)
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, callback).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(err = %e, "websocket handshake failed");
            return Ok(());
        }
    };
    let (mut sink, stream) = ws.split();

    let token = token_holder.lock().unwrap().clone().unwrap_or_default();
    let identity = match ctx.credentials.verify(&token).await {
        Ok(identity) => identity,
        Err(_) => {
            debug!("authentication failed — closing without an envelope");
            let _ = sink.close().await;
            return Ok(());
        }
    };

    run_active_session(sink, stream, identity, ctx).await
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsStream = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

#[instrument(skip(sink, stream, ctx), fields(user_id = %identity.user_id))]
async fn run_active_session(
    mut sink: WsSink,
    mut stream: WsStream,
    identity: crate::credential::VerifiedIdentity,
    ctx: Arc<AppContext>,
) -> Result<()> {
    let (handle, mut outbound_rx) = new_handle(&identity.user_id);
    let session_ctx = SessionCtx { user_id: identity.user_id.clone(), session_id: handle.session_id.clone() };

    if let Err(e) = send_initial_state(&mut sink, &identity, &ctx).await {
        warn!(err = %e, "failed to send initial_state — dropping connection before registration");
        return Ok(());
    }

    ctx.registry.attach(handle.clone()).await;
    let mut rpc_limiter = RpcRateLimiter::new();

    let result = loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !rpc_limiter.check() {
                            let _ = send(&mut sink, OutboundMessage::Error {
                                message: "rate limit exceeded".to_string(),
                            }).await;
                            continue;
                        }
                        if let Err(fatal) = handle_inbound_text(&text, &session_ctx, &handle, &ctx, &mut sink).await {
                            break fatal;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break false,
                    Some(Err(e)) => {
                        warn!(err = %e, "ws read error");
                        break false;
                    }
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if send(&mut sink, msg).await.is_err() {
                            break false;
                        }
                    }
                    None => break false,
                }
            }
        }
    };

    ctx.registry.detach(&handle.session_id).await;
    let _ = result;
    Ok(())
}

/// Returns `Err(true)` when the error is fatal and the connection should be
/// torn down; `Err(false)`/`Ok(())` otherwise (an `error` frame was enough).
async fn handle_inbound_text(
    text: &str,
    session_ctx: &SessionCtx,
    handle: &crate::session::SessionHandle,
    ctx: &Arc<AppContext>,
    sink: &mut WsSink,
) -> Result<(), bool> {
    let msg: InboundMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            let _ = send(sink, OutboundMessage::Error {
                message: format!("malformed message: {e}"),
            }).await;
            return Ok(());
        }
    };

    if let Err(err) = dispatcher::dispatch(session_ctx, handle, msg, ctx).await {
        error_log(&err);
        let fatal = err.is_fatal_to_connection();
        let _ = sink.send(Message::Text(error_frame(&err).to_string())).await;
        if fatal {
            return Err(true);
        }
    }

    Ok(())
}

fn error_log(err: &AlarmError) {
    if matches!(err, AlarmError::InternalFailure(_)) {
        error!(err = %err, "internal failure while dispatching a command");
    } else {
        debug!(err = %err, "command rejected");
    }
}

async fn send(sink: &mut WsSink, msg: OutboundMessage) -> Result<(), ()> {
    sink.send(Message::Text(msg.into_json().to_string()))
        .await
        .map_err(|_| ())
}

/// Builds and sends the one-time `initial_state` frame: the caller's
/// identity, every page they can see, and every alarm on those pages.
async fn send_initial_state(
    sink: &mut WsSink,
    identity: &crate::credential::VerifiedIdentity,
    ctx: &AppContext,
) -> anyhow::Result<()> {
    let visible = ctx.store.list_pages_visible_to(&identity.user_id).await?;
    let page_ids: std::collections::HashSet<String> =
        visible.iter().map(|v| v.page.id.clone()).collect();
    let alarms = ctx.store.list_alarms_in_pages(&page_ids).await?;

    let frame = OutboundMessage::InitialState {
        user: UserSummary { id: identity.user_id.clone(), username: identity.username.clone() },
        pages: visible
            .iter()
            .map(|v| PageSummary::new(&v.page, v.is_owner, v.can_edit))
            .collect(),
        alarms,
    };

    sink.send(Message::Text(frame.into_json().to_string()))
        .await
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}
