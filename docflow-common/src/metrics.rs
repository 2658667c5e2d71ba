use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return its render handle.
/// Call once per process; tests exercising routers should skip it.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    const SECONDS_BUCKETS: &[f64] = &[
        0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(SECONDS_BUCKETS)
        .unwrap()
        .install_recorder()
        .unwrap()
}

/// Add a `/metrics` route rendering `handle` plus request tracking to `router`.
pub fn setup_metrics_routes(router: Router, handle: PrometheusHandle) -> Router {
    router
        .route("/metrics", get(move || ready(handle.render())))
        .layer(axum::middleware::from_fn(track_requests))
}

/// Middleware recording request counts and latency per matched route.
pub async fn track_requests(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("docflow_http_requests_total", &labels).increment(1);
    metrics::histogram!("docflow_http_requests_duration_seconds", &labels).record(latency);

    response
}
