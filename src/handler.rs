//! Route handlers and router assembly for the scrape target.
//!
//! Two demo endpoints drive the counters, `/metrics` renders them. The
//! registry travels inside [`AppState`] so every handler sees the same
//! counters without a global.
use std::{io, sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{MatchedPath, State},
    http::{self, HeaderValue},
    routing::get,
};
use axum_macros::debug_handler;
use hyper::{HeaderMap, StatusCode, header::CONTENT_TYPE};
use log::info;
use scrape_target::error::AppError;
use tokio::time::sleep;
use tower_http::{
    compression::CompressionLayer, cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer,
};

use crate::metrics::{MetricsError, MetricsRegistry};

/// How long `/slow` holds a response back.
pub(crate) const SLOW_DELAY: Duration = Duration::from_millis(3000);
/// Content type announced on `/metrics` responses.
pub(crate) const EXPOSITION_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

const API_HITS: &str = "api_hits";
const HTTP_REQUESTS: &str = "http_requests";

pub(crate) struct AppState {
    pub(crate) metrics: MetricsRegistry,
}

/// Registers the counters the demo endpoints bump. Call once before the
/// registry is shared with the router.
pub(crate) fn register_app_counters(metrics: &mut MetricsRegistry) -> Result<(), MetricsError> {
    metrics.register_counter(API_HITS, "Number of hits to the API", &[])?;
    metrics.register_counter(
        HTTP_REQUESTS,
        "Number of HTTP requests",
        &["route", "method", "status"],
    )?;
    Ok(())
}

pub(crate) fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/fast", get(fast_handler))
        .route("/slow", get(slow_handler))
        .route("/metrics", get(metrics_handler))
        .layer((
            TraceLayer::new_for_http()
                .make_span_with(make_span)
                .on_failure(()),
            CorsLayer::permissive(),
            TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, Duration::from_secs(30)),
            CompressionLayer::new(),
        ))
        .with_state(Arc::new(state))
}

fn make_span(req: &http::Request<axum::body::Body>) -> tracing::Span {
    let method = req.method();
    let path = req.uri().path();

    // the route pattern that matched, e.g. "/fast"
    let matched_path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched_path| matched_path.as_str());

    tracing::debug_span!("recv request", %method, %path, matched_path)
}

async fn fast_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, &'static str), AppError> {
    state.metrics.increment(API_HITS, &[])?;
    state.metrics.increment(
        HTTP_REQUESTS,
        &[("route", "/fast"), ("method", "GET"), ("status", "200")],
    )?;
    info!("fast request hit");
    Ok((StatusCode::OK, "This is a fast request!"))
}

/// Holds the response back for [`SLOW_DELAY`] without blocking the worker
/// thread. Counters are bumped before the delay, so an in-flight request is
/// already visible to a concurrent scrape.
async fn slow_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, &'static str), AppError> {
    state.metrics.increment(API_HITS, &[])?;
    state.metrics.increment(
        HTTP_REQUESTS,
        &[("route", "/slow"), ("method", "GET"), ("status", "200")],
    )?;
    info!("slow request hit, responding in {SLOW_DELAY:?}");
    sleep(SLOW_DELAY).await;
    Ok((StatusCode::OK, "This is a slow request!"))
}

/// Serializes the registry on every scrape, so the text always reflects the
/// counters at request time.
#[debug_handler]
async fn metrics_handler(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, HeaderMap, String), AppError> {
    let text = state
        .metrics
        .serialize()
        .map_err(|err| io::Error::other(format!("encode metrics: {err}")))?;
    info!("serving metrics scrape");
    Ok((StatusCode::OK, exposition_headers(), text))
}

fn exposition_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static(EXPOSITION_CONTENT_TYPE),
    );
    headers
}
