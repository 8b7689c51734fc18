//! Transport middleware shared by every route, plus the in-flight gate for
//! the record API.
//!
//! [`build_http_layers`] is applied once to the whole router. Layers added
//! to a `ServiceBuilder` wrap the ones added after them, so the first entry
//! sees the request first and the response last.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::HeaderName;
use axum::http::{Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use super::config::NetworkConfig;
use super::error::ApiError;
use super::shutdown::ShutdownController;

/// Concrete type of the transport stack; innermost layer is nested deepest.
type HttpLayers = tower::layer::util::Stack<
    PropagateRequestIdLayer,
    tower::layer::util::Stack<
        TimeoutLayer,
        tower::layer::util::Stack<
            RequestBodyLimitLayer,
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
    >,
>;

/// Transport stack for the whole router, outermost first:
///
/// 1. `x-request-id` assignment (UUID v4) when the client sent none
/// 2. `TraceLayer` request/response spans
/// 3. gzip compression
/// 4. CORS from `cors_origins`
/// 5. body size cap (`max_body_bytes`, 413)
/// 6. `request_timeout` (408)
/// 7. `x-request-id` echoed on the response
///
/// Admission control and in-flight tracking wrap the API routes only, so
/// health probes are never rate limited or refused while draining.
#[must_use]
pub fn build_http_layers(config: &NetworkConfig) -> HttpLayers {
    let x_request_id = HeaderName::from_static("x-request-id");

    let cors = build_cors_layer(&config.cors_origins);

    ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(x_request_id.clone(), MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(PropagateRequestIdLayer::new(x_request_id))
        .into_inner()
}

/// `*` anywhere in the list allows every origin; otherwise unparsable
/// entries are skipped.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let parsed: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any)
}

/// Counts the request as in flight for graceful drain, and refuses it with
/// 503 unless the server is `Ready`.
pub async fn track_in_flight(
    State(shutdown): State<Arc<ShutdownController>>,
    req: Request,
    next: Next,
) -> Response {
    if !shutdown.is_accepting() {
        return ApiError::ShuttingDown.into_response();
    }
    let _guard = shutdown.in_flight_guard();
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn layers_build_from_any_config() {
        let _ = build_http_layers(&NetworkConfig::default());
        let _ = build_http_layers(&NetworkConfig {
            cors_origins: vec!["http://kv.test".to_string(), "not a url\n".to_string()],
            max_body_bytes: 16,
            ..NetworkConfig::default()
        });
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let app = Router::new()
            .route("/", axum::routing::post(|body: String| async move { body }))
            .layer(build_http_layers(&NetworkConfig {
                max_body_bytes: 4,
                ..NetworkConfig::default()
            }));

        let small = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from("abc"))
            .unwrap();
        let resp = app.clone().oneshot(small).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key("x-request-id"));

        let big = Request::builder()
            .method(Method::POST)
            .uri("/")
            .body(Body::from("abcdefgh"))
            .unwrap();
        let resp = app.oneshot(big).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    fn tracked_router(shutdown: Arc<ShutdownController>) -> Router {
        Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn_with_state(shutdown, track_in_flight))
    }

    fn get_root() -> Request {
        Request::builder().uri("/").body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn in_flight_tracking_refuses_unless_ready() {
        let shutdown = Arc::new(ShutdownController::new());
        let router = tracked_router(Arc::clone(&shutdown));

        let resp = router.clone().oneshot(get_root()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        shutdown.set_ready();
        let resp = router.clone().oneshot(get_root()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(shutdown.in_flight_count(), 0);

        shutdown.trigger_shutdown();
        let resp = router.oneshot(get_root()).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
