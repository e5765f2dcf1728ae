//! The bundled applications served through the gateway
//!
//! Run with: cargo test -p taichi-tests --test apps_test

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use pretty_assertions::assert_eq;
use taichi_apps::{
    AdminApp, MetricsSnapshot, MonitorApp, MonitorSettings, TerminalApp, TerminalSettings,
};
use taichi_config::{ConfigKey, ConfigStore};
use taichi_core::MountedApplication;
use taichi_tests::{closed_by_server, connect_ws, next_text, wait_for, TestGateway};
use tokio_tungstenite::tungstenite::Message;

/// Mounts the three applications the way the daemon does
async fn start(terminal: TerminalApp) -> TestGateway {
    TestGateway::start(2, move |server, config| {
        server
            .mount("/webssh/.*", MountedApplication::stream("terminal", terminal))?
            .mount(
                "/ws/.*",
                MountedApplication::stream(
                    "monitor",
                    MonitorApp::new(MonitorSettings { interval_ms: 50 }),
                ),
            )?
            .mount(".*", MountedApplication::request_response("admin", AdminApp::new(config)))?;
        Ok(())
    })
    .await
    .unwrap()
}

/// Collect text frames until one contains `needle`
async fn read_until(ws: &mut taichi_tests::WsClient, needle: &str) -> String {
    let mut seen = String::new();
    while let Some(text) = next_text(ws).await {
        seen.push_str(&text);
        if seen.contains(needle) {
            break;
        }
    }
    seen
}

#[tokio::test]
async fn test_admin_serves_configuration() {
    let gateway = start(TerminalApp::default()).await;

    let health: serde_json::Value = reqwest::get(format!("{}/health", gateway.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let config: serde_json::Value = reqwest::get(format!("{}/api/config", gateway.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    for key in ConfigKey::ALL {
        assert_eq!(config[key.as_str()], key.default_value());
    }

    let missing = reqwest::get(format!("{}/no/such/page", gateway.base_url()))
        .await
        .unwrap();
    assert_eq!(missing.status().as_u16(), 404);
}

#[tokio::test]
async fn test_admin_sees_patched_configuration_from_store() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{"source_url": "https://mirror.example"}"#).unwrap();
    let before = std::fs::read(&path).unwrap();

    let config = Arc::new(ConfigStore::new(&path).load());
    let app = AdminApp::new(Arc::clone(&config));
    let gateway = TestGateway::start(1, move |server, _default| {
        server.mount(".*", MountedApplication::request_response("admin", app))?;
        Ok(())
    })
    .await
    .unwrap();

    let body: serde_json::Value = reqwest::get(format!("{}/api/config", gateway.base_url()))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["source_url"], "https://mirror.example");
    assert_eq!(
        body["docker_download_url"],
        ConfigKey::DockerDownloadUrl.default_value()
    );
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn test_monitor_streams_snapshots() {
    let gateway = start(TerminalApp::default()).await;
    let mut ws = connect_ws(&gateway.ws_url("/ws/metrics")).await;

    for _ in 0..2 {
        let text = next_text(&mut ws).await.expect("snapshot");
        let snapshot: MetricsSnapshot = serde_json::from_str(&text).unwrap();
        assert!(snapshot.memory_total_bytes > 0);
    }

    ws.close(None).await.unwrap();
    let connections = gateway.connections.clone();
    let closed = wait_for(
        || {
            let connections = connections.clone();
            async move { connections.active() == 0 }
        },
        Duration::from_secs(2),
    )
    .await;
    assert!(closed);
}

#[tokio::test]
async fn test_monitor_closes_when_draining() {
    let mut gateway = start(TerminalApp::default()).await;
    let mut ws = connect_ws(&gateway.ws_url("/ws/metrics")).await;
    assert!(next_text(&mut ws).await.is_some());

    gateway.interrupt();

    assert!(closed_by_server(&mut ws).await);
    gateway.join().await.unwrap();
}

#[tokio::test]
async fn test_terminal_runs_commands() {
    let gateway = start(TerminalApp::default()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("echo taichi-$((40 + 2))".to_string()))
        .await
        .unwrap();

    assert!(read_until(&mut ws, "taichi-42").await.contains("taichi-42"));
}

#[tokio::test]
async fn test_terminal_refuses_interactive_programs() {
    let gateway = start(TerminalApp::default()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("vim /etc/hosts".to_string()))
        .await
        .unwrap();

    let reply = read_until(&mut ws, "Unsupported command").await;
    assert!(reply.contains("Unsupported command: vim"));

    // The shell is still usable afterwards
    ws.send(Message::text("echo still-here".to_string()))
        .await
        .unwrap();
    assert!(read_until(&mut ws, "still-here").await.contains("still-here"));
}

#[tokio::test]
async fn test_terminal_reports_shell_exit() {
    let gateway = start(TerminalApp::default()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("exit 3".to_string())).await.unwrap();

    let notice = read_until(&mut ws, "process exited").await;
    assert!(notice.contains("process exited"));
    assert!(closed_by_server(&mut ws).await);
}

#[tokio::test]
async fn test_terminal_releases_shell_on_disconnect() {
    let terminal = TerminalApp::new(TerminalSettings::default());
    let gateway = start(terminal.clone()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("echo up".to_string())).await.unwrap();
    read_until(&mut ws, "up").await;

    let sessions = terminal.sessions();
    assert_eq!(sessions.len(), 1);
    let pid = sessions[0].pid.expect("shell pid");

    ws.close(None).await.unwrap();
    drop(ws);

    let probe = terminal.clone();
    let released = wait_for(
        || {
            let probe = probe.clone();
            async move { probe.sessions().is_empty() }
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(released);

    // Reaped, not left as a zombie
    #[cfg(target_os = "linux")]
    assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    #[cfg(not(target_os = "linux"))]
    let _ = pid;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_releases_shell_after_disconnect_mid_echo() {
    let terminal = TerminalApp::new(TerminalSettings::default());
    let gateway = start(terminal.clone()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("cat".to_string())).await.unwrap();
    // Larger than the stdin and stdout pipe buffers together
    let flood = "x".repeat(400 * 1024);
    ws.send(Message::text(flood)).await.unwrap();
    drop(ws);

    let sessions = terminal.clone();
    let released = wait_for(
        || {
            let sessions = sessions.clone();
            async move { sessions.sessions().is_empty() }
        },
        Duration::from_secs(5),
    )
    .await;
    assert!(released, "shell still held after the client left");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_terminal_releases_shell_that_closed_its_output() {
    let terminal = TerminalApp::new(TerminalSettings::default());
    let gateway = start(terminal.clone()).await;
    let mut ws = connect_ws(&gateway.ws_url("/webssh/session")).await;

    ws.send(Message::text("echo closing; exec >&- 2>&-; sleep 30".to_string()))
        .await
        .unwrap();
    read_until(&mut ws, "closing").await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(terminal.sessions().len(), 1);

    ws.close(None).await.unwrap();
    drop(ws);

    let sessions = terminal.clone();
    let released = wait_for(
        || {
            let sessions = sessions.clone();
            async move { sessions.sessions().is_empty() }
        },
        Duration::from_secs(3),
    )
    .await;
    assert!(released, "session waited on a shell with no output pipes");
}
