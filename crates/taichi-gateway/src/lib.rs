//! taichi-gateway - One listener, several mounted applications
//!
//! The gateway owns a single HTTP/1.1 listener and dispatches every
//! request through an ordered route table to one of the mounted
//! applications:
//!
//! ```text
//!                    ┌───────────────────────────────────────────┐
//!   connection ────▶ │ RouteTable (first match wins)             │
//!                    │   /webssh/.*  ──▶ StreamAdapter (terminal)│
//!                    │   /ws/.*      ──▶ StreamAdapter (monitor) │
//!                    │   .*          ──▶ RequestResponseAdapter  │
//!                    │                   (admin, worker pool)    │
//!                    └───────────────────────────────────────────┘
//! ```
//!
//! Request/response applications run on a bounded blocking worker pool so
//! a slow request never stalls stream traffic. Stream applications get the
//! upgraded WebSocket and own it until the session ends.

pub mod adapter;
pub mod connections;
pub mod dispatch;
pub mod error;
pub mod server;
pub mod settings;

pub use adapter::{RequestResponseAdapter, StreamAdapter, SubAppAdapter};
pub use connections::StreamConnections;
pub use error::ApiError;
pub use server::{BoundGateway, GatewayServer};
pub use settings::ServerSettings;

// Re-export core types for convenience
pub use taichi_core::{
    GatewayError, GatewayResult, Lifecycle, MountedApplication, ServerState, StopReason,
};
