//! Gateway lifecycle state machine.
//!
//! ```text
//! Unconfigured ──configure──▶ Mounting ──bind──▶ Listening ──signal──▶ Draining ──▶ Stopped
//!                                 │                   │                                ▲
//!                                 └── bind failure ───┴──── accept loop fault ─────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;

use crate::error::{GatewayError, GatewayResult};

/// Lifecycle state of the gateway server
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Process started, configuration not loaded yet
    Unconfigured,
    /// Configuration loaded, sub-applications being registered
    Mounting,
    /// Listener bound, accepting connections
    Listening,
    /// Shutdown requested; no new connections, in-flight ones finishing
    Draining,
    /// Terminal state
    Stopped,
}

impl ServerState {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: ServerState) -> bool {
        use ServerState::*;
        matches!(
            (self, next),
            (Unconfigured, Mounting)
                | (Mounting, Listening)
                | (Mounting, Stopped)
                | (Listening, Draining)
                | (Listening, Stopped)
                | (Draining, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Unconfigured => "unconfigured",
            ServerState::Mounting => "mounting",
            ServerState::Listening => "listening",
            ServerState::Draining => "draining",
            ServerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the server reached `Stopped`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Interrupt or termination signal
    Interrupted,
    /// The accept loop ended on its own
    Normal,
    /// The accept loop failed
    Fatal(String),
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Interrupted => f.write_str("interrupted"),
            StopReason::Normal => f.write_str("normal exit"),
            StopReason::Fatal(msg) => write!(f, "fatal error: {}", msg),
        }
    }
}

/// Shared, observable handle on the server state
#[derive(Debug, Clone)]
pub struct Lifecycle {
    tx: Arc<watch::Sender<ServerState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ServerState::Unconfigured);
        Self { tx: Arc::new(tx) }
    }

    /// Current state
    pub fn current(&self) -> ServerState {
        *self.tx.borrow()
    }

    /// Subscribe to state changes
    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.tx.subscribe()
    }

    /// Move to `next`, rejecting illegal transitions without changing state.
    pub fn advance(&self, next: ServerState) -> GatewayResult<()> {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::info!(from = %current, to = %next, "Server state changed");
                *current = next;
                true
            } else {
                outcome = Err(GatewayError::InvalidTransition {
                    from: *current,
                    to: next,
                });
                false
            }
        });
        outcome
    }

    /// Wait until the server has reached `state` or any later state.
    pub async fn reached(&self, state: ServerState) {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|current| *current >= state).await;
    }
}
