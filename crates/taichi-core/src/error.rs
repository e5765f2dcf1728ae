//! Common error types for the gateway and its mounted applications

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::lifecycle::ServerState;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type returned by mounted applications
pub type AppResult<T> = Result<T, AppError>;

/// Errors raised by the composition and dispatch layer
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered pattern matched the request path
    #[error("No route matched path: {0}")]
    NoRouteMatched(String),

    /// The listener could not be bound
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// A mounted application failed while serving a single connection
    #[error("Application '{app}' failed: {message}")]
    AdapterFault { app: String, message: String },

    /// A route pattern is not a valid regular expression
    #[error("Invalid route pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// Lifecycle transition not permitted from the current state
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: ServerState, to: ServerState },

    /// Anything uncategorised that reached the top level
    #[error("Unexpected failure: {0}")]
    Unexpected(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl GatewayError {
    /// Whether this error must stop the whole process.
    ///
    /// Per-connection and per-request failures are absorbed by the gateway;
    /// only listener-level and uncategorised faults are fatal.
    pub fn is_fatal(&self) -> bool {
        match self {
            GatewayError::NoRouteMatched(_) | GatewayError::AdapterFault { .. } => false,
            GatewayError::Bind { .. }
            | GatewayError::InvalidPattern { .. }
            | GatewayError::InvalidTransition { .. }
            | GatewayError::Unexpected(_)
            | GatewayError::Io(_) => true,
        }
    }

    /// Operator-facing explanation for a bind failure, if this is one.
    pub fn bind_hint(&self) -> Option<&'static str> {
        match self {
            GatewayError::Bind { source, .. } => Some(match source.kind() {
                io::ErrorKind::AddrInUse => "port already in use, stop the other process or pick another port",
                io::ErrorKind::PermissionDenied => {
                    "permission denied, ports below 1024 need elevated privileges"
                }
                io::ErrorKind::AddrNotAvailable => "address not available on this host",
                _ => "check the configured address and port",
            }),
            _ => None,
        }
    }
}

/// Errors returned by mounted applications.
///
/// The request/response adapter turns every variant into a 500 response;
/// applications that want another status return it as a normal response.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Failed(String),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Axum(#[from] axum::Error),
}
