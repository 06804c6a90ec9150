//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. Binding early lets the binary fail fast on a taken port
//! before the cache has finished warming.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tracing::info;

use super::config::NetworkConfig;
use super::handlers::{
    flush_handler, get_eligible_handler, get_operator_handler, health_handler,
    list_eligible_handler, list_operator_handler, liveness_handler, not_found_handler,
    poll_handler, readiness_handler, AppState,
};
use super::lifecycle::ServiceLifecycle;
use super::middleware::{build_http_layers, track_in_flight};
use crate::cache::UtilizationCache;

/// Assembles the axum router with all routes and middleware.
///
/// Routes:
/// - `GET /poll` -- the whole eligible snapshot
/// - `GET /storagenodes`, `GET /storagenodes/{id}` -- eligible tier
/// - `GET /operator/storagenodes`, `GET /operator/storagenodes/{id}` -- operator tier
/// - `POST /flush` -- synchronous refresh
/// - `GET /health`, `/health/live`, `/health/ready` -- probes
///
/// API routes are wrapped in [`track_in_flight`]; probes are not.
pub fn build_router(state: AppState) -> Router {
    let layers = build_http_layers(&state.config);

    let api = Router::new()
        .route("/poll", get(poll_handler))
        .route("/storagenodes", get(list_eligible_handler))
        .route("/storagenodes/{id}", get(get_eligible_handler))
        .route("/operator/storagenodes", get(list_operator_handler))
        .route("/operator/storagenodes/{id}", get(get_operator_handler))
        .route("/flush", post(flush_handler))
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state.lifecycle),
            track_in_flight,
        ));

    api.route("/health", get(health_handler))
        .route("/health/live", get(liveness_handler))
        .route("/health/ready", get(readiness_handler))
        .fallback(not_found_handler)
        .layer(layers)
        .with_state(state)
}

/// Manages the HTTP server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- takes over the cache's lifecycle
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    listener: Option<TcpListener>,
    lifecycle: Arc<ServiceLifecycle>,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    #[must_use]
    pub fn new(config: NetworkConfig, cache: Arc<UtilizationCache>) -> Self {
        Self {
            config,
            listener: None,
            lifecycle: Arc::new(ServiceLifecycle::new(cache)),
        }
    }

    /// Returns a shared reference to the service lifecycle.
    #[must_use]
    pub fn lifecycle(&self) -> Arc<ServiceLifecycle> {
        Arc::clone(&self.lifecycle)
    }

    fn app_state(&self) -> AppState {
        AppState {
            cache: Arc::clone(self.lifecycle.cache()),
            lifecycle: Arc::clone(&self.lifecycle),
            config: Arc::new(self.config.clone()),
            start_time: Instant::now(),
        }
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Starts serving connections until the shutdown signal fires.
    ///
    /// After the shutdown signal, new API requests get 503 while in-flight
    /// ones get up to `drain_timeout` to finish. The cache is then closed and
    /// health reports `stopped`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server encounters a fatal I/O error.
    ///
    /// # Panics
    ///
    /// Panics if `start()` was not called before `serve()`.
    pub async fn serve(
        mut self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let listener = self
            .listener
            .take()
            .expect("start() must be called before serve()");
        let router = build_router(self.app_state());

        self.lifecycle.mark_serving();
        info!("Serving HTTP connections");

        let signal_lifecycle = Arc::clone(&self.lifecycle);
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                shutdown.await;
                info!("shutdown signal received");
                signal_lifecycle.begin_drain();
            })
            .await;

        // The server may also have stopped on an I/O error.
        self.lifecycle.drain(self.config.drain_timeout).await;

        result?;
        Ok(())
    }
}
