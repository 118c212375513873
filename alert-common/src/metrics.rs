use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub const CONNECTION_TRANSITIONS: &str = "alert_connection_transitions_total";
pub const CONNECTION_STATE: &str = "alert_connection_state";
pub const RECONNECT_DELAY: &str = "alert_reconnect_delay_seconds";
pub const BYTES_RECEIVED: &str = "alert_stream_bytes_total";
pub const FRAMES_RECEIVED: &str = "alert_frames_total";
pub const FRAMES_TOO_LARGE: &str = "alert_frames_too_large_total";
pub const PARSE_FAILURES: &str = "alert_parse_failures_total";
pub const INACTIVE_EVENTS: &str = "alert_inactive_events_total";
pub const EVENTS_ADMITTED: &str = "alert_events_admitted_total";
pub const EVENTS_SUPPRESSED: &str = "alert_events_suppressed_total";
pub const DISPATCH_DROPPED: &str = "alert_dispatch_dropped_total";
pub const SINK_DELIVERIES: &str = "alert_sink_deliveries_total";
pub const SINK_DELIVERY_DURATION: &str = "alert_sink_delivery_duration_seconds";
pub const SINK_QUEUE_DROPPED: &str = "alert_sink_queue_dropped_total";

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_routes`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and middleware to a router, should be called last.
pub fn setup_metrics_routes(router: Router) -> Router {
    let recorder_handle = setup_metrics_recorder();

    router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> PrometheusHandle {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("histogram buckets are not empty")
        .install_recorder()
        .expect("failed to install the prometheus recorder")
}

/// Middleware to record some common HTTP metrics on the probe and metrics endpoints.
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
