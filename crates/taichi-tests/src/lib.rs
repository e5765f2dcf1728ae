//! Integration tests for the TaiChi gateway
//!
//! End-to-end tests drive a real gateway bound to an ephemeral loopback
//! port, over HTTP with `reqwest` and over WebSocket with
//! `tokio-tungstenite`.
//!
//! ```bash
//! cargo test -p taichi-tests
//! ```
//!
//! # Test Structure
//!
//! - `routing_test.rs` - mount order, anchoring, unmatched paths
//! - `isolation_test.rs` - application faults stay on their connection
//! - `lifecycle_test.rs` - draining, grace period, bind failure
//! - `apps_test.rs` - administration, metrics and terminal applications
//!
//! This library only holds the harness and fixture applications.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::http::StatusCode;
use taichi_config::Configuration;
use taichi_core::{
    AppError, AppRequest, AppResponse, AppResult, GatewayError, GatewayResult, Lifecycle,
    RequestResponseApp, StopReason, StreamApp, StreamContext,
};
use taichi_gateway::{GatewayServer, ServerSettings, StreamConnections};
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

// =============================================================================
// Harness
// =============================================================================

/// A gateway on an ephemeral port that shuts down when dropped
pub struct TestGateway {
    pub addr: SocketAddr,
    pub lifecycle: Lifecycle,
    pub connections: StreamConnections,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<GatewayResult<StopReason>>>,
}

impl TestGateway {
    /// Configure with default configuration, let `mount` register
    /// applications, then bind and serve.
    ///
    /// ```ignore
    /// let gateway = TestGateway::start(1, |server, _config| {
    ///     server.mount(".*", MountedApplication::request_response("echo", EchoApp))?;
    ///     Ok(())
    /// })
    /// .await?;
    /// ```
    pub async fn start<F>(grace_period_secs: u64, mount: F) -> GatewayResult<Self>
    where
        F: FnOnce(&mut GatewayServer, Arc<Configuration>) -> GatewayResult<()>,
    {
        let settings = ServerSettings {
            grace_period_secs,
            ..ServerSettings::loopback()
        };
        let mut server = GatewayServer::new(settings);
        let config = server.configure_with(Configuration::default())?;
        mount(&mut server, config)?;

        let gateway = server.bind().await?;
        let addr = gateway.local_addr();
        let lifecycle = gateway.lifecycle();
        let connections = gateway.connections();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(gateway.serve(async {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            lifecycle,
            connections,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Deliver the shutdown signal
    pub fn interrupt(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for the gateway to stop
    pub async fn join(mut self) -> GatewayResult<StopReason> {
        match self.handle.take() {
            Some(handle) => handle
                .await
                .map_err(|e| GatewayError::Unexpected(e.to_string()))?,
            None => Err(GatewayError::Unexpected("gateway already joined".into())),
        }
    }
}

impl Drop for TestGateway {
    fn drop(&mut self) {
        self.interrupt();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    false
}

/// WebSocket client connected to a [`TestGateway`]
pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open a WebSocket, panicking if the handshake fails
pub async fn connect_ws(url: &str) -> WsClient {
    let (ws, _response) = tokio_tungstenite::connect_async(url)
        .await
        .unwrap_or_else(|e| panic!("WebSocket connect to {} failed: {}", url, e));
    ws
}

/// Next text frame, skipping control frames. `None` once the server
/// closes the stream or nothing arrives within five seconds.
pub async fn next_text(ws: &mut WsClient) -> Option<String> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .ok()??;
        match next {
            Ok(WsMessage::Text(text)) => return Some(text.to_string()),
            Ok(WsMessage::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

/// Whether the server closed the stream within five seconds
pub async fn closed_by_server(ws: &mut WsClient) -> bool {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Err(_) => return false,
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(WsMessage::Close(_)))) => return true,
            Ok(Some(Ok(_))) => continue,
        }
    }
}

// =============================================================================
// Request/response fixtures
// =============================================================================

/// Answers with a fixed name, the path and the query it saw
pub struct NamedApp(pub &'static str);

impl RequestResponseApp for NamedApp {
    fn call(&self, request: AppRequest) -> AppResult<AppResponse> {
        Ok(AppResponse::text(
            StatusCode::OK,
            format!(
                "{} {} {}",
                self.0,
                request.path,
                request.query.unwrap_or_default()
            ),
        ))
    }
}

/// How [`FaultyApp`] fails
#[derive(Debug, Clone, Copy)]
pub enum Fault {
    Error,
    Panic,
}

pub struct FaultyApp(pub Fault);

impl RequestResponseApp for FaultyApp {
    fn call(&self, _request: AppRequest) -> AppResult<AppResponse> {
        match self.0 {
            Fault::Error => Err(AppError::Failed("fixture failure".into())),
            Fault::Panic => panic!("fixture panic"),
        }
    }
}

/// Blocks its worker before answering
pub struct SlowApp(pub Duration);

impl RequestResponseApp for SlowApp {
    fn call(&self, _request: AppRequest) -> AppResult<AppResponse> {
        std::thread::sleep(self.0);
        Ok(AppResponse::text(StatusCode::OK, "slow"))
    }
}

// =============================================================================
// Stream fixtures
// =============================================================================

/// Echoes text frames until the peer closes; says "bye" when draining
pub struct EchoStreamApp;

#[async_trait]
impl StreamApp for EchoStreamApp {
    async fn serve(&self, mut socket: WebSocket, ctx: StreamContext) -> AppResult<()> {
        loop {
            tokio::select! {
                biased;
                _ = ctx.draining() => {
                    socket.send(Message::Text(Utf8Bytes::from_static("bye"))).await?;
                    let _ = socket.send(Message::Close(None)).await;
                    return Ok(());
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Text(text))) => socket.send(Message::Text(text)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(_)) => {}
                },
            }
        }
    }
}

/// Sets its flag when dropped
#[derive(Debug)]
pub struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Ignores the drain notification and holds its socket until it is dropped
#[derive(Debug, Clone, Default)]
pub struct StubbornStreamApp {
    dropped: Arc<AtomicBool>,
}

impl StubbornStreamApp {
    /// Whether a session of this app has been dropped
    pub fn was_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamApp for StubbornStreamApp {
    async fn serve(&self, mut socket: WebSocket, _ctx: StreamContext) -> AppResult<()> {
        let _flag = DropFlag(Arc::clone(&self.dropped));
        socket.send(Message::Text(Utf8Bytes::from_static("ready"))).await?;
        while let Some(Ok(_)) = socket.recv().await {}
        std::future::pending::<()>().await;
        Ok(())
    }
}

/// Fails its session after the first frame
pub struct BrokenStreamApp;

#[async_trait]
impl StreamApp for BrokenStreamApp {
    async fn serve(&self, mut socket: WebSocket, _ctx: StreamContext) -> AppResult<()> {
        let _ = socket.recv().await;
        Err(AppError::Stream("fixture stream failure".into()))
    }
}
