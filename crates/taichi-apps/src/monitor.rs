//! System metrics stream
//!
//! Each connection gets its own sampler and receives one JSON snapshot per
//! interval until the peer closes or the server drains.

use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use taichi_core::{AppError, AppResult, StreamApp, StreamContext};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace};

fn default_interval_ms() -> u64 {
    1000
}

/// Settings for [`MonitorApp`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Delay between two snapshots
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(10))
    }
}

/// One sample of system-wide resource usage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub cpu_cores: usize,
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub uptime_secs: u64,
    /// 1, 5 and 15 minute load averages
    pub load_average: [f64; 3],
}

impl MetricsSnapshot {
    /// Refresh `system` and sample it
    pub fn collect(system: &mut System) -> Self {
        system.refresh_cpu_usage();
        system.refresh_memory();
        let load = System::load_average();

        Self {
            timestamp: Utc::now(),
            cpu_percent: system.global_cpu_usage(),
            cpu_cores: system.cpus().len(),
            memory_total_bytes: system.total_memory(),
            memory_used_bytes: system.used_memory(),
            uptime_secs: System::uptime(),
            load_average: [load.one, load.five, load.fifteen],
        }
    }
}

/// Streams [`MetricsSnapshot`]s as JSON text frames
#[derive(Debug, Clone, Default)]
pub struct MonitorApp {
    settings: MonitorSettings,
}

impl MonitorApp {
    pub fn new(settings: MonitorSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl StreamApp for MonitorApp {
    async fn serve(&self, mut socket: WebSocket, ctx: StreamContext) -> AppResult<()> {
        let mut system = System::new();
        let mut ticker = tokio::time::interval(self.settings.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = ctx.draining() => {
                    debug!(connection = %ctx.connection_id, "Closing metrics stream for shutdown");
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: Utf8Bytes::from_static("server shutting down"),
                    };
                    let _ = socket.send(Message::Close(Some(frame))).await;
                    return Ok(());
                }
                incoming = socket.recv() => match incoming {
                    None | Some(Ok(Message::Close(_))) => return Ok(()),
                    Some(Err(err)) => return Err(err.into()),
                    Some(Ok(_)) => {}
                },
                _ = ticker.tick() => {
                    let snapshot = MetricsSnapshot::collect(&mut system);
                    let json = serde_json::to_string(&snapshot)
                        .map_err(|e| AppError::Stream(format!("Failed to encode snapshot: {}", e)))?;
                    trace!(connection = %ctx.connection_id, cpu = snapshot.cpu_percent, "Metrics snapshot");
                    socket.send(Message::Text(json.into())).await?;
                }
            }
        }
    }
}
