//! Adapters that let foreign-protocol applications be mounted as native
//! handlers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, FromRequestParts, Request};
use axum::response::{IntoResponse, Response};
use taichi_core::{
    AppRequest, GatewayError, MountedApplication, Protocol, RequestResponseApp, StreamApp,
};
use tokio::sync::Semaphore;
use tracing::{debug, error, warn};

use crate::connections::StreamConnections;
use crate::error::ApiError;

/// Resources shared by every adapter of one server
#[derive(Debug, Clone)]
pub(crate) struct AdapterResources {
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) max_body_bytes: usize,
    pub(crate) connections: StreamConnections,
}

/// Uniform handler registered in the route table
#[derive(Clone)]
pub enum SubAppAdapter {
    RequestResponse(RequestResponseAdapter),
    Stream(StreamAdapter),
}

impl SubAppAdapter {
    pub(crate) fn wrap(app: MountedApplication, resources: &AdapterResources) -> Self {
        match app {
            MountedApplication::RequestResponse { name, app } => {
                SubAppAdapter::RequestResponse(RequestResponseAdapter {
                    name,
                    app,
                    workers: Arc::clone(&resources.workers),
                    max_body_bytes: resources.max_body_bytes,
                })
            }
            MountedApplication::Stream { name, app } => SubAppAdapter::Stream(StreamAdapter {
                name,
                app,
                connections: resources.connections.clone(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            SubAppAdapter::RequestResponse(adapter) => &adapter.name,
            SubAppAdapter::Stream(adapter) => &adapter.name,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            SubAppAdapter::RequestResponse(_) => Protocol::RequestResponse,
            SubAppAdapter::Stream(_) => Protocol::Stream,
        }
    }

    /// Serve one inbound request
    pub async fn handle(&self, request: Request) -> Response {
        match self {
            SubAppAdapter::RequestResponse(adapter) => adapter.handle(request).await,
            SubAppAdapter::Stream(adapter) => adapter.handoff(request).await,
        }
    }
}

// =============================================================================
// Request/response
// =============================================================================

/// Runs a synchronous application on the bounded blocking worker pool
#[derive(Clone)]
pub struct RequestResponseAdapter {
    name: Arc<str>,
    app: Arc<dyn RequestResponseApp>,
    workers: Arc<Semaphore>,
    max_body_bytes: usize,
}

impl RequestResponseAdapter {
    /// Buffer the request, call the application off the event loop and
    /// translate its response. Path and query are forwarded unmodified.
    pub async fn handle(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();

        let body = match body::to_bytes(body, self.max_body_bytes).await {
            Ok(bytes) => bytes,
            Err(err) => {
                return ApiError::PayloadTooLarge(format!(
                    "Request body rejected (limit {} bytes): {}",
                    self.max_body_bytes, err
                ))
                .into_response()
            }
        };

        let app_request = AppRequest {
            method: parts.method,
            path: parts.uri.path().to_owned(),
            query: parts.uri.query().map(str::to_owned),
            headers: parts.headers,
            body,
        };

        let permit = match Arc::clone(&self.workers).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return ApiError::ServiceUnavailable("Worker pool is closed".to_string())
                    .into_response()
            }
        };

        let app = Arc::clone(&self.app);
        let result = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            app.call(app_request)
        })
        .await;

        match result {
            Ok(Ok(response)) => response.into_response(),
            Ok(Err(err)) => {
                warn!(app = %self.name, error = %err, "Application returned an error");
                ApiError::from(GatewayError::AdapterFault {
                    app: self.name.to_string(),
                    message: err.to_string(),
                })
                .into_response()
            }
            Err(join) => {
                error!(app = %self.name, error = %join, "Application panicked while handling request");
                ApiError::from(GatewayError::AdapterFault {
                    app: self.name.to_string(),
                    message: join.to_string(),
                })
                .into_response()
            }
        }
    }
}

// =============================================================================
// Persistent stream
// =============================================================================

/// Hands upgraded WebSocket connections to a streaming application
#[derive(Clone)]
pub struct StreamAdapter {
    name: Arc<str>,
    app: Arc<dyn StreamApp>,
    connections: StreamConnections,
}

impl StreamAdapter {
    /// Complete the upgrade and give the socket to the application. The
    /// adapter does not look at any frame after the handshake.
    pub async fn handoff(&self, request: Request) -> Response {
        if self.connections.is_draining() {
            return ApiError::ServiceUnavailable("Server is shutting down".to_string())
                .into_response();
        }

        let peer = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);
        let (mut parts, _body) = request.into_parts();

        let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(upgrade) => upgrade,
            Err(rejection) => {
                debug!(app = %self.name, path = %parts.uri.path(), "Rejected non-upgrade request on stream mount");
                return rejection.into_response();
            }
        };

        let ctx = self
            .connections
            .context(parts.uri.path(), parts.uri.query(), peer);
        let name = Arc::clone(&self.name);
        let app = Arc::clone(&self.app);
        let connections = self.connections.clone();

        upgrade
            .on_failed_upgrade({
                let name = Arc::clone(&self.name);
                move |err| warn!(app = %name, error = %err, "WebSocket upgrade failed")
            })
            .on_upgrade(move |socket| async move { connections.run(name, app, socket, ctx).await })
    }
}
