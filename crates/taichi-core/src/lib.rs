//! taichi-core - Core traits and types for the TaiChi gateway
//!
//! This crate provides the abstractions shared by the gateway and the
//! applications it mounts: the application traits, the ordered route
//! table, the server lifecycle and the common error types.

pub mod app;
pub mod error;
pub mod lifecycle;
pub mod routing;

pub use app::{
    AppRequest, AppResponse, MountedApplication, Protocol, RequestResponseApp, StreamApp,
    StreamContext,
};
pub use error::{AppError, AppResult, GatewayError, GatewayResult};
pub use lifecycle::{Lifecycle, ServerState, StopReason};
pub use routing::{RouteBinding, RoutePattern, RouteTable, RouteTableBuilder};
