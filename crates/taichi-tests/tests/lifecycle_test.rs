//! Startup and shutdown behaviour
//!
//! Run with: cargo test -p taichi-tests --test lifecycle_test

use std::time::{Duration, Instant};

use futures_util::SinkExt;
use pretty_assertions::assert_eq;
use taichi_config::Configuration;
use taichi_core::{GatewayError, MountedApplication, ServerState, StopReason};
use taichi_gateway::{GatewayServer, ServerSettings};
use taichi_tests::{
    closed_by_server, connect_ws, next_text, wait_for, EchoStreamApp, NamedApp,
    StubbornStreamApp, TestGateway,
};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_drains_cooperative_stream() {
    let mut gateway = TestGateway::start(5, |server, _config| {
        server
            .mount("/ws/.*", MountedApplication::stream("echo", EchoStreamApp))?
            .mount(".*", MountedApplication::request_response("ok", NamedApp("ok")))?;
        Ok(())
    })
    .await
    .unwrap();
    let lifecycle = gateway.lifecycle.clone();

    let mut ws = connect_ws(&gateway.ws_url("/ws/echo")).await;
    ws.send(Message::text("hello".to_string())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("hello"));

    let started = Instant::now();
    gateway.interrupt();

    assert_eq!(next_text(&mut ws).await.as_deref(), Some("bye"));
    assert!(closed_by_server(&mut ws).await);

    let reason = gateway.join().await.unwrap();
    assert_eq!(reason, StopReason::Interrupted);
    assert_eq!(lifecycle.current(), ServerState::Stopped);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_grace_period_force_closes_stubborn_stream() {
    let stubborn = StubbornStreamApp::default();
    let app = stubborn.clone();
    let mut gateway = TestGateway::start(1, move |server, _config| {
        server.mount("/ws/.*", MountedApplication::stream("stubborn", app))?;
        Ok(())
    })
    .await
    .unwrap();
    let lifecycle = gateway.lifecycle.clone();

    let mut ws = connect_ws(&gateway.ws_url("/ws/hold")).await;
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("ready"));

    let started = Instant::now();
    gateway.interrupt();

    tokio::time::timeout(Duration::from_secs(2), lifecycle.reached(ServerState::Draining))
        .await
        .expect("gateway never started draining");
    assert_eq!(lifecycle.current(), ServerState::Draining);
    assert!(!stubborn.was_dropped());

    let reason = gateway.join().await.unwrap();

    assert_eq!(reason, StopReason::Interrupted);
    assert!(started.elapsed() >= Duration::from_millis(900));
    assert!(stubborn.was_dropped());
    assert_eq!(lifecycle.current(), ServerState::Stopped);
    assert!(closed_by_server(&mut ws).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_no_new_connections_while_draining() {
    let stubborn = StubbornStreamApp::default();
    let app = stubborn.clone();
    let mut gateway = TestGateway::start(3, move |server, _config| {
        server
            .mount("/ws/.*", MountedApplication::stream("stubborn", app))?
            .mount(".*", MountedApplication::request_response("ok", NamedApp("ok")))?;
        Ok(())
    })
    .await
    .unwrap();
    let addr = gateway.addr;

    let mut ws = connect_ws(&gateway.ws_url("/ws/hold")).await;
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("ready"));

    gateway.interrupt();

    let refused = wait_for(
        || async move { TcpStream::connect(addr).await.is_err() },
        Duration::from_secs(2),
    )
    .await;
    assert!(refused, "listener still accepting while draining");
    assert_eq!(gateway.lifecycle.current(), ServerState::Draining);
    assert_eq!(gateway.connections.active(), 1);

    drop(ws);
    gateway.join().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_with_unbounded_grace_period() {
    let mut gateway = TestGateway::start(u64::MAX, |server, _config| {
        server
            .mount("/ws/.*", MountedApplication::stream("echo", EchoStreamApp))?
            .mount(".*", MountedApplication::request_response("ok", NamedApp("ok")))?;
        Ok(())
    })
    .await
    .unwrap();
    let lifecycle = gateway.lifecycle.clone();

    let mut ws = connect_ws(&gateway.ws_url("/ws/echo")).await;
    ws.send(Message::text("hello".to_string())).await.unwrap();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("hello"));

    gateway.interrupt();
    assert_eq!(next_text(&mut ws).await.as_deref(), Some("bye"));

    let reason = gateway.join().await.unwrap();
    assert_eq!(reason, StopReason::Interrupted);
    assert_eq!(lifecycle.current(), ServerState::Stopped);
}

#[tokio::test]
async fn test_bind_failure_is_reported_and_terminal() {
    let occupied = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let mut server = GatewayServer::new(ServerSettings {
        port,
        ..ServerSettings::loopback()
    });
    let lifecycle = server.lifecycle();
    server.configure_with(Configuration::default()).unwrap();
    server
        .mount(".*", MountedApplication::request_response("ok", NamedApp("ok")))
        .unwrap();

    let err = server.bind().await.err().unwrap();

    match &err {
        GatewayError::Bind { addr, .. } => assert_eq!(addr.port(), port),
        other => panic!("expected bind failure, got {:?}", other),
    }
    assert!(err.is_fatal());
    assert!(err.bind_hint().unwrap().contains("port already in use"));
    assert_eq!(lifecycle.current(), ServerState::Stopped);
}

#[tokio::test]
async fn test_mount_before_configure_is_rejected() {
    let mut server = GatewayServer::new(ServerSettings::loopback());
    let err = server
        .mount(".*", MountedApplication::request_response("ok", NamedApp("ok")))
        .err()
        .unwrap();
    assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    assert_eq!(server.lifecycle().current(), ServerState::Unconfigured);
}
