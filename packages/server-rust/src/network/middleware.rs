//! HTTP middleware for the storinfo server.
//!
//! [`build_http_layers`] is the transport stack applied to every route.
//! Middleware ordering follows the outer-to-inner convention: the first
//! layer listed is the outermost (processes the request first on the way
//! in, and the response last on the way out).
//!
//! [`track_in_flight`] is applied to the API routes only, so health probes
//! keep answering while the server drains.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use super::config::NetworkConfig;
use super::error::ApiError;
use super::lifecycle::ServiceLifecycle;

/// The composed Tower layer type produced by [`build_http_layers`].
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            CorsLayer,
            tower::layer::util::Stack<
                CompressionLayer,
                tower::layer::util::Stack<
                    TraceLayer<
                        tower_http::classify::SharedClassifier<
                            tower_http::classify::ServerErrorsAsFailures,
                        >,
                    >,
                    tower::layer::util::Stack<
                        SetRequestIdLayer<MakeRequestUuid>,
                        tower::layer::util::Identity,
                    >,
                >,
            >,
        >,
    >,
>;

/// Builds the HTTP-level Tower middleware stack from the network configuration.
///
/// **Middleware ordering (outermost to innermost):**
/// 1. `SetRequestId` -- assigns a UUID v4 `X-Request-Id` to every incoming request
/// 2. `Tracing` -- logs request/response with structured trace spans
/// 3. `Compression` -- gzip response compression (full `/poll` bodies are large)
/// 4. `CORS` -- Cross-Origin Resource Sharing based on configured origins
/// 5. `Timeout` -- enforces a maximum request processing duration
/// 6. `PropagateRequestId` -- copies `X-Request-Id` from the request to the response
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    let cors = build_cors_layer(&config.cors_origins);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(
            x_request_id.clone(),
            MakeRequestUuid,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// Builds the CORS layer from the configured list of allowed origins.
///
/// A wildcard `"*"` in the origins list allows any origin. Otherwise,
/// each origin string is parsed and added to an explicit allowlist.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::HEAD, Method::POST])
        .allow_headers(Any)
        .expose_headers([axum::http::header::LINK])
}

/// Counts the request as in flight for its whole lifetime, or answers 503
/// once the server has started draining.
pub async fn track_in_flight(
    State(lifecycle): State<Arc<ServiceLifecycle>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(_guard) = lifecycle.admit() else {
        debug!(
            state = lifecycle.health().as_str(),
            path = %request.uri().path(),
            "rejecting request"
        );
        return ApiError::ShuttingDown.into_response();
    };
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;
    use crate::cache::{CacheConfig, UtilizationCache};
    use crate::store::RecordFeed;

    #[test]
    fn build_http_layers_does_not_panic_with_defaults() {
        let config = NetworkConfig::default();
        let _layers = build_http_layers(&config);
    }

    #[test]
    fn build_cors_layer_specific_origins() {
        let origins = vec![
            "http://localhost:3000".to_string(),
            "https://example.com".to_string(),
        ];
        let _cors = build_cors_layer(&origins);
    }

    #[test]
    fn build_http_layers_with_custom_timeout() {
        let config = NetworkConfig {
            request_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let _layers = build_http_layers(&config);
    }

    fn lifecycle() -> Arc<ServiceLifecycle> {
        let cache = UtilizationCache::start(CacheConfig::default(), RecordFeed::fixed(Vec::new()));
        Arc::new(ServiceLifecycle::new(Arc::new(cache)))
    }

    fn gated_router(lifecycle: &Arc<ServiceLifecycle>) -> Router {
        let observed = Arc::clone(lifecycle);
        Router::new()
            .route(
                "/work",
                get(move || {
                    let observed = Arc::clone(&observed);
                    async move { observed.in_flight().to_string() }
                }),
            )
            .route_layer(axum::middleware::from_fn_with_state(
                Arc::clone(lifecycle),
                track_in_flight,
            ))
    }

    #[tokio::test]
    async fn ready_server_counts_request_in_flight() {
        let lifecycle = lifecycle();
        lifecycle.mark_serving();

        let response = gated_router(&lifecycle)
            .oneshot(axum::http::Request::get("/work").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 64).await.unwrap();
        assert_eq!(&body[..], b"1");
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn draining_server_rejects_with_503() {
        let lifecycle = lifecycle();
        lifecycle.mark_serving();
        lifecycle.begin_drain();

        let response = gated_router(&lifecycle)
            .oneshot(axum::http::Request::get("/work").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(lifecycle.in_flight(), 0);
    }
}
