//! Per-request logging, independent of any policy verdict.

use std::time::Duration;

use axum::Router;
use axum::extract::Request;
use axum::response::Response;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{Span, info, info_span};

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Wrap `router` so each request is tagged with an `x-request-id` (generated
/// when the caller sends none) and logged once it completes, with method,
/// path, status and latency. Request spans are children of `span`.
pub fn with_request_logging(router: Router, span: Span) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(move |request: &Request| {
                        let request_id = request
                            .headers()
                            .get(REQUEST_ID_HEADER)
                            .and_then(|value| value.to_str().ok())
                            .unwrap_or_default();
                        info_span!(
                            parent: &span,
                            "request",
                            method = %request.method(),
                            path = request.uri().path(),
                            request_id,
                        )
                    })
                    .on_response(|response: &Response, latency: Duration, _span: &Span| {
                        info!(
                            status = response.status().as_u16(),
                            latency_ms = latency.as_secs_f64() * 1000.0,
                            "request completed"
                        );
                    }),
            )
            .layer(PropagateRequestIdLayer::x_request_id()),
    )
}
