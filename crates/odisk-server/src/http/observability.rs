use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tracing::Instrument;
use uuid::Uuid;

use crate::metrics::Metrics;

static REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
const MAX_REQUEST_ID_LEN: usize = 128;

/// Wraps every routed request in an `http_request` span, echoes or assigns `x-request-id`, and
/// records the outcome in [`Metrics`].
///
/// Disk handlers fill in `disk_id` on the span once they have resolved the path.
pub(crate) async fn middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let request_id = client_request_id(req.headers()).unwrap_or_else(|| Uuid::new_v4().to_string());
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "<unknown>".to_string(), |matched| matched.as_str().to_string());
    let method = req.method().clone();

    let span = tracing::info_span!(
        "http_request",
        request_id = %request_id,
        method = %method,
        route = %route,
        user_agent = tracing::field::Empty,
        disk_id = tracing::field::Empty,
    );
    if let Some(agent) = req.headers().get(header::USER_AGENT).and_then(|v| v.to_str().ok()) {
        span.record("user_agent", agent);
    }

    let started = Instant::now();
    let mut res = next.run(req).instrument(span.clone()).await;
    let latency = started.elapsed();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        res.headers_mut().insert(REQUEST_ID.clone(), value);
    }
    metrics.observe_http_request(&route, method.as_str(), res.status().as_u16(), latency);
    tracing::info!(
        parent: &span,
        status = res.status().as_u16(),
        latency_ms = latency.as_millis() as u64,
        "request complete"
    );

    res
}

fn client_request_id(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(&REQUEST_ID)?.to_str().ok()?.trim();
    (!value.is_empty() && value.len() <= MAX_REQUEST_ID_LEN).then(|| value.to_string())
}
