//! Mountable application traits - the boundary between the gateway and
//! the sub-applications it serves.
//!
//! Two protocol families are supported:
//!
//! - [`RequestResponseApp`]: a synchronous handler that receives a complete
//!   request and returns a complete response. The gateway runs it on a
//!   bounded blocking worker pool.
//! - [`StreamApp`]: an asynchronous handler that takes ownership of an
//!   upgraded WebSocket and drives it until the session ends.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ws::WebSocket;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

// =============================================================================
// Request/response protocol
// =============================================================================

/// A fully-buffered request handed to a [`RequestResponseApp`]
#[derive(Debug, Clone)]
pub struct AppRequest {
    pub method: Method,
    /// Original request path, unmodified
    pub path: String,
    /// Original query string (without `?`), unmodified
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A complete response produced by a [`RequestResponseApp`]
#[derive(Debug, Clone)]
pub struct AppResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl AppResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Plain-text response
    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(Bytes::from(body.into()))
    }

    /// JSON response
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> AppResult<Self> {
        let body = serde_json::to_vec(value)
            .map_err(|e| AppError::Failed(format!("Failed to encode response: {}", e)))?;
        Ok(Self::new(status)
            .with_header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            )
            .with_body(Bytes::from(body)))
    }

    pub fn with_header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }
}

impl IntoResponse for AppResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// Synchronous request/response application (WSGI-style).
///
/// `call` may block; the gateway never runs it on the event loop.
pub trait RequestResponseApp: Send + Sync + 'static {
    fn call(&self, request: AppRequest) -> AppResult<AppResponse>;
}

// =============================================================================
// Persistent stream protocol
// =============================================================================

/// Per-connection information handed to a [`StreamApp`]
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub connection_id: Uuid,
    pub path: String,
    pub query: Option<String>,
    pub peer: Option<SocketAddr>,
    drain: CancellationToken,
}

impl StreamContext {
    pub fn new(
        path: impl Into<String>,
        query: Option<String>,
        peer: Option<SocketAddr>,
        drain: CancellationToken,
    ) -> Self {
        Self {
            connection_id: Uuid::new_v4(),
            path: path.into(),
            query,
            peer,
            drain,
        }
    }

    /// Whether the server has started draining
    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Resolves once the server starts draining. Streams should finish
    /// their session soon after; they are force-closed when the grace
    /// period runs out.
    pub async fn draining(&self) {
        self.drain.cancelled().await
    }
}

/// Stateful streaming application.
///
/// The application owns the socket: framing, keepalive and teardown are
/// its responsibility. Dropping the socket closes the connection.
#[async_trait]
pub trait StreamApp: Send + Sync + 'static {
    async fn serve(&self, socket: WebSocket, ctx: StreamContext) -> AppResult<()>;
}

// =============================================================================
// Mounted applications
// =============================================================================

/// Protocol family a mounted application expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    RequestResponse,
    Stream,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::RequestResponse => f.write_str("request-response"),
            Protocol::Stream => f.write_str("stream"),
        }
    }
}

/// An application together with the protocol it speaks
#[derive(Clone)]
pub enum MountedApplication {
    RequestResponse {
        name: Arc<str>,
        app: Arc<dyn RequestResponseApp>,
    },
    Stream {
        name: Arc<str>,
        app: Arc<dyn StreamApp>,
    },
}

impl MountedApplication {
    pub fn request_response(name: &str, app: impl RequestResponseApp) -> Self {
        Self::RequestResponse {
            name: Arc::from(name),
            app: Arc::new(app),
        }
    }

    pub fn stream(name: &str, app: impl StreamApp) -> Self {
        Self::Stream {
            name: Arc::from(name),
            app: Arc::new(app),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            MountedApplication::RequestResponse { name, .. }
            | MountedApplication::Stream { name, .. } => name,
        }
    }

    pub fn protocol(&self) -> Protocol {
        match self {
            MountedApplication::RequestResponse { .. } => Protocol::RequestResponse,
            MountedApplication::Stream { .. } => Protocol::Stream,
        }
    }
}

impl fmt::Debug for MountedApplication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountedApplication")
            .field("name", &self.name())
            .field("protocol", &self.protocol())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Hello;

    impl RequestResponseApp for Hello {
        fn call(&self, request: AppRequest) -> AppResult<AppResponse> {
            Ok(AppResponse::text(StatusCode::OK, format!("hello {}", request.path)))
        }
    }

    #[test]
    fn mounted_application_reports_protocol() {
        let mounted = MountedApplication::request_response("hello", Hello);
        assert_eq!(mounted.name(), "hello");
        assert_eq!(mounted.protocol(), Protocol::RequestResponse);
    }

    #[test]
    fn app_response_translates_to_http_response() {
        let response = AppResponse::text(StatusCode::CREATED, "done")
            .with_header(
                header::HeaderName::from_static("x-app"),
                HeaderValue::from_static("hello"),
            )
            .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers()["x-app"], "hello");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; charset=utf-8"
        );
    }

    #[test]
    fn json_response_sets_content_type() {
        let response =
            AppResponse::json(StatusCode::OK, &serde_json::json!({"ok": true})).unwrap();
        assert_eq!(
            response.headers[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(&response.body[..], br#"{"ok":true}"#);
    }

    #[test]
    fn stream_context_observes_drain() {
        let drain = CancellationToken::new();
        let ctx = StreamContext::new("/ws/x", None, None, drain.clone());
        assert!(!ctx.is_draining());
        drain.cancel();
        assert!(ctx.is_draining());
    }
}
