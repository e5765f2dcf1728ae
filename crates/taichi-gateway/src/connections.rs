//! Tracking of upgraded stream connections.
//!
//! Upgraded WebSocket connections leave hyper's connection tracking once
//! the handshake completes, so graceful shutdown of the HTTP server does
//! not wait for them. Every stream session is therefore spawned on a
//! [`TaskTracker`] owned here, with two tokens:
//!
//! - `drain` is cancelled when shutdown starts; applications observe it
//!   through [`StreamContext::draining`] and should end their session.
//! - `force` is cancelled when the grace period runs out; the session
//!   future is dropped, which drops the socket and anything the
//!   application holds.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocket;
use taichi_core::{StreamApp, StreamContext};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Shared registry of active stream sessions
#[derive(Debug, Clone, Default)]
pub struct StreamConnections {
    tracker: TaskTracker,
    drain: CancellationToken,
    force: CancellationToken,
}

impl StreamConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stream sessions currently running
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Token cancelled when draining starts
    pub(crate) fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    pub(crate) fn context(
        &self,
        path: &str,
        query: Option<&str>,
        peer: Option<SocketAddr>,
    ) -> StreamContext {
        StreamContext::new(path, query.map(str::to_owned), peer, self.drain.clone())
    }

    /// Notify sessions that the server is draining. Closing the tracker
    /// lets [`wait_idle`](Self::wait_idle) resolve once the last session ends.
    pub(crate) fn begin_drain(&self) {
        self.drain.cancel();
        self.tracker.close();
    }

    /// Drop every remaining session.
    pub(crate) fn force_close(&self) {
        self.force.cancel();
    }

    /// Wait until draining has started and every session has ended.
    pub(crate) async fn wait_idle(&self) {
        self.tracker.wait().await
    }

    /// Run one session to completion. Failures and panics of the
    /// application are logged and confined to this connection.
    pub(crate) async fn run(
        &self,
        app_name: Arc<str>,
        app: Arc<dyn StreamApp>,
        socket: WebSocket,
        ctx: StreamContext,
    ) {
        let connection = ctx.connection_id;
        let force = self.force.clone();
        info!(app = %app_name, %connection, path = %ctx.path, peer = ?ctx.peer, "Stream connection opened");

        let session = self.tracker.spawn(async move {
            tokio::select! {
                result = app.serve(socket, ctx) => Some(result),
                _ = force.cancelled() => None,
            }
        });

        match session.await {
            Ok(Some(Ok(()))) => {
                info!(app = %app_name, %connection, "Stream connection closed");
            }
            Ok(Some(Err(err))) => {
                warn!(app = %app_name, %connection, error = %err, "Stream application failed, connection closed");
            }
            Ok(None) => {
                warn!(app = %app_name, %connection, "Stream connection closed after grace period");
            }
            Err(join) if join.is_panic() => {
                error!(app = %app_name, %connection, "Stream application panicked, connection closed");
            }
            Err(join) => {
                warn!(app = %app_name, %connection, error = %join, "Stream session cancelled");
            }
        }
    }
}
