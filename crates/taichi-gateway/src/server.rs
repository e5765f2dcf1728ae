//! Gateway server - listener ownership and lifecycle

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use taichi_config::{ConfigStore, Configuration, LoadOutcome};
use taichi_core::{
    GatewayError, GatewayResult, Lifecycle, MountedApplication, RouteTable, RouteTableBuilder,
    ServerState, StopReason,
};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::adapter::{AdapterResources, SubAppAdapter};
use crate::connections::StreamConnections;
use crate::dispatch::create_router;
use crate::settings::ServerSettings;

/// Gateway server before the listener is bound.
///
/// ```rust,ignore
/// let mut server = GatewayServer::new(settings);
/// let config = server.configure(&ConfigStore::new(path))?;
/// server.mount("/webssh/.*", MountedApplication::stream("terminal", terminal))?;
/// server.mount(".*", MountedApplication::request_response("admin", AdminApp::new(config)))?;
/// let gateway = server.bind().await?;
/// gateway.serve(shutdown_signal()).await?;
/// ```
pub struct GatewayServer {
    settings: ServerSettings,
    lifecycle: Lifecycle,
    routes: RouteTableBuilder<SubAppAdapter>,
    resources: AdapterResources,
    config: Option<Arc<Configuration>>,
}

impl GatewayServer {
    pub fn new(settings: ServerSettings) -> Self {
        let resources = AdapterResources {
            workers: Arc::new(Semaphore::new(
                settings.blocking_workers.clamp(1, Semaphore::MAX_PERMITS),
            )),
            max_body_bytes: settings.max_body_bytes,
            connections: StreamConnections::new(),
        };
        Self {
            settings,
            lifecycle: Lifecycle::new(),
            routes: RouteTableBuilder::new(),
            resources,
            config: None,
        }
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Load the configuration and start mounting. The returned value is
    /// what mounted applications should be built from.
    pub fn configure(&mut self, store: &ConfigStore) -> GatewayResult<Arc<Configuration>> {
        let (config, outcome) = store.load_with_outcome();
        match &outcome {
            LoadOutcome::Loaded => info!(path = %store.path().display(), "Configuration loaded"),
            other => info!(path = %store.path().display(), outcome = ?other, "Configuration loaded with repairs"),
        }
        self.configure_with(config)
    }

    /// Start mounting with an already-loaded configuration.
    pub fn configure_with(&mut self, config: Configuration) -> GatewayResult<Arc<Configuration>> {
        self.lifecycle.advance(ServerState::Mounting)?;
        let config = Arc::new(config);
        self.config = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Configuration loaded by [`configure`](Self::configure), if any
    pub fn configuration(&self) -> Option<&Arc<Configuration>> {
        self.config.as_ref()
    }

    /// Wrap an application and append it to the route table.
    ///
    /// Only legal while mounting. Registration order decides precedence:
    /// mount specific prefixes before catch-all patterns.
    pub fn mount(&mut self, pattern: &str, app: MountedApplication) -> GatewayResult<&mut Self> {
        let state = self.lifecycle.current();
        if state != ServerState::Mounting {
            return Err(GatewayError::InvalidTransition {
                from: state,
                to: ServerState::Mounting,
            });
        }

        let name = app.name().to_string();
        let protocol = app.protocol();
        let adapter = SubAppAdapter::wrap(app, &self.resources);
        self.routes.register(pattern, adapter)?;
        info!(%pattern, app = %name, %protocol, "Mounted application");
        Ok(self)
    }

    /// Freeze the route table and bind the listener.
    ///
    /// A bind failure is terminal: the server moves to `Stopped` and the
    /// error is returned for the caller to report.
    pub async fn bind(self) -> GatewayResult<BoundGateway> {
        let state = self.lifecycle.current();
        if state != ServerState::Mounting {
            return Err(GatewayError::InvalidTransition {
                from: state,
                to: ServerState::Listening,
            });
        }

        let routes = self.routes.freeze();
        if routes.is_empty() {
            warn!("No applications mounted, every request will get 404");
        }

        let addr = self.settings.socket_addr();
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(source) => {
                let _ = self.lifecycle.advance(ServerState::Stopped);
                return Err(GatewayError::Bind { addr, source });
            }
        };
        let local_addr = listener.local_addr()?;
        self.lifecycle.advance(ServerState::Listening)?;

        Ok(BoundGateway {
            listener,
            local_addr,
            routes,
            lifecycle: self.lifecycle,
            connections: self.resources.connections,
            grace_period: self.settings.grace_period(),
        })
    }
}

/// Gateway with a bound listener, ready to serve
pub struct BoundGateway {
    listener: TcpListener,
    local_addr: SocketAddr,
    routes: RouteTable<SubAppAdapter>,
    lifecycle: Lifecycle,
    connections: StreamConnections,
    grace_period: Duration,
}

impl BoundGateway {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.clone()
    }

    /// Handle on the active stream sessions
    pub fn connections(&self) -> StreamConnections {
        self.connections.clone()
    }

    /// Accept and dispatch connections until `shutdown` resolves, then
    /// drain.
    ///
    /// Draining stops the accept loop, notifies stream sessions, and gives
    /// in-flight requests and sessions the grace period to finish. Whatever
    /// is still running afterwards is closed.
    pub async fn serve<F>(self, shutdown: F) -> GatewayResult<StopReason>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let BoundGateway {
            listener,
            local_addr,
            routes,
            lifecycle,
            connections,
            grace_period,
        } = self;

        let app = create_router(routes).into_make_service_with_connect_info::<SocketAddr>();

        let signal = {
            let lifecycle = lifecycle.clone();
            let connections = connections.clone();
            async move {
                shutdown.await;
                info!("Shutdown requested, draining connections");
                if let Err(err) = lifecycle.advance(ServerState::Draining) {
                    warn!(error = %err, "Unexpected state when draining");
                }
                connections.begin_drain();
            }
        };

        let mut server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
        });
        info!(addr = %local_addr, "Gateway listening");

        let drain_started = connections.drain_token();
        tokio::select! {
            biased;
            _ = drain_started.cancelled() => {}
            result = &mut server => {
                let reason = match result {
                    Ok(Ok(())) => StopReason::Normal,
                    Ok(Err(err)) => StopReason::Fatal(err.to_string()),
                    Err(join) => StopReason::Fatal(join.to_string()),
                };
                return Self::stop_without_drain(&lifecycle, &connections, reason).await;
            }
        }

        let deadline = drain_deadline(grace_period);

        match tokio::time::timeout_at(deadline, &mut server).await {
            Ok(Ok(Ok(()))) => debug!("In-flight requests finished"),
            Ok(Ok(Err(err))) => warn!(error = %err, "Accept loop failed while draining"),
            Ok(Err(join)) => warn!(error = %join, "Accept loop task failed while draining"),
            Err(_) => {
                warn!("In-flight requests still running after grace period, aborting them");
                server.abort();
            }
        }

        if tokio::time::timeout_at(deadline, connections.wait_idle())
            .await
            .is_err()
        {
            warn!(
                remaining = connections.active(),
                "Stream connections still open after grace period, closing them"
            );
            connections.force_close();
            connections.wait_idle().await;
        }

        lifecycle.advance(ServerState::Stopped)?;
        info!(reason = %StopReason::Interrupted, "Gateway stopped");
        Ok(StopReason::Interrupted)
    }

    /// The accept loop ended before any shutdown request.
    async fn stop_without_drain(
        lifecycle: &Lifecycle,
        connections: &StreamConnections,
        reason: StopReason,
    ) -> GatewayResult<StopReason> {
        connections.begin_drain();
        connections.force_close();
        connections.wait_idle().await;
        lifecycle.advance(ServerState::Stopped)?;

        match reason {
            StopReason::Fatal(msg) => {
                error!(reason = %msg, "Gateway stopped: accept loop failed");
                Err(GatewayError::Unexpected(msg))
            }
            other => {
                info!(reason = %other, "Gateway stopped");
                Ok(other)
            }
        }
    }
}

/// Far enough out to stand in for "never" on a grace period too large for
/// [`Instant`] arithmetic
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

fn drain_deadline(grace_period: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(grace_period).unwrap_or_else(|| now + FAR_FUTURE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use taichi_core::{AppRequest, AppResponse, AppResult, RequestResponseApp};

    struct Ok200;

    impl RequestResponseApp for Ok200 {
        fn call(&self, _request: AppRequest) -> AppResult<AppResponse> {
            Ok(AppResponse::new(axum::http::StatusCode::OK))
        }
    }

    #[test]
    fn mount_requires_configuration_first() {
        let mut server = GatewayServer::new(ServerSettings::loopback());
        let err = server
            .mount(".*", MountedApplication::request_response("ok", Ok200))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            GatewayError::InvalidTransition {
                from: ServerState::Unconfigured,
                ..
            }
        ));
    }

    #[test]
    fn configure_loads_store_and_enters_mounting() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = ConfigStore::new(dir.path().join("config.json"));
        let mut server = GatewayServer::new(ServerSettings::loopback());

        let config = server.configure(&store).unwrap();

        assert_eq!(server.lifecycle().current(), ServerState::Mounting);
        assert_eq!(*config, Configuration::default());
        assert!(store.path().exists());
    }

    #[test]
    fn configure_twice_is_rejected() {
        let mut server = GatewayServer::new(ServerSettings::loopback());
        server.configure_with(Configuration::default()).unwrap();
        assert!(server.configure_with(Configuration::default()).is_err());
    }

    #[tokio::test]
    async fn bind_before_configure_is_rejected() {
        let server = GatewayServer::new(ServerSettings::loopback());
        let err = server.bind().await.err().unwrap();
        assert!(matches!(err, GatewayError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn bind_failure_is_terminal() {
        let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let settings = ServerSettings {
            port: occupied.local_addr().unwrap().port(),
            ..ServerSettings::loopback()
        };
        let mut server = GatewayServer::new(settings);
        let lifecycle = server.lifecycle();
        server.configure_with(Configuration::default()).unwrap();

        let err = server.bind().await.err().unwrap();

        assert!(matches!(err, GatewayError::Bind { .. }));
        assert!(err.bind_hint().unwrap().contains("in use"));
        assert_eq!(lifecycle.current(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_without_connections() {
        let mut server = GatewayServer::new(ServerSettings::loopback());
        server.configure_with(Configuration::default()).unwrap();
        server
            .mount(".*", MountedApplication::request_response("ok", Ok200))
            .unwrap();
        let gateway = server.bind().await.unwrap();
        let lifecycle = gateway.lifecycle();
        assert_eq!(lifecycle.current(), ServerState::Listening);

        let reason = gateway.serve(async {}).await.unwrap();

        assert_eq!(reason, StopReason::Interrupted);
        assert_eq!(lifecycle.current(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn serve_drains_with_unbounded_grace_period() {
        let settings = ServerSettings {
            grace_period_secs: u64::MAX,
            ..ServerSettings::loopback()
        };
        let mut server = GatewayServer::new(settings);
        server.configure_with(Configuration::default()).unwrap();
        let gateway = server.bind().await.unwrap();
        let lifecycle = gateway.lifecycle();

        let reason = gateway.serve(async {}).await.unwrap();

        assert_eq!(reason, StopReason::Interrupted);
        assert_eq!(lifecycle.current(), ServerState::Stopped);
    }

    #[test]
    fn drain_deadline_saturates_instead_of_overflowing() {
        let before = Instant::now();
        let deadline = drain_deadline(Duration::from_secs(u64::MAX));
        assert!(deadline >= before + FAR_FUTURE);

        let short = drain_deadline(Duration::from_secs(1));
        assert!(short <= Instant::now() + Duration::from_secs(1));
    }

    #[test]
    fn oversized_worker_pool_is_clamped() {
        let server = GatewayServer::new(ServerSettings {
            blocking_workers: usize::MAX,
            ..ServerSettings::loopback()
        });
        assert_eq!(
            server.resources.workers.available_permits(),
            Semaphore::MAX_PERMITS
        );

        let server = GatewayServer::new(ServerSettings {
            blocking_workers: 0,
            ..ServerSettings::loopback()
        });
        assert_eq!(server.resources.workers.available_permits(), 1);
    }
}
