//! taichi-apps - Sub-applications mounted by the TaiChi gateway
//!
//! - [`AdminApp`]: synchronous administration API (catch-all mount)
//! - [`MonitorApp`]: pushes system metric snapshots over a WebSocket
//! - [`TerminalApp`]: relays a shell process over a WebSocket

pub mod admin;
pub mod monitor;
pub mod terminal;

pub use admin::{AdminApp, RELEASE, WELCOME_MESSAGE};
pub use monitor::{MetricsSnapshot, MonitorApp, MonitorSettings};
pub use terminal::{is_unsupported, TerminalApp, TerminalSession, TerminalSettings, UNSUPPORTED_COMMANDS};
