//! Remote disc server: shares image files and optical drives with remote clients that speak the
//! range-read "online disk" protocol.
//!
//! - [`http`]: `GET`/`HEAD /<disk-id>[.ext]`, the protocol surface proper
//! - [`api`]: `/images` listing, upload and delete
//! - [`announce`]: re-publishes a service record whenever the disk set changes
//! - [`server`]: wires everything to a listener plus the registry poller

pub mod announce;
pub mod api;
pub mod config;
pub mod http;
pub mod metrics;
pub mod server;

use std::sync::Arc;

use axum::middleware;
use odisk_media::DiskRegistry;

use metrics::Metrics;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<DiskRegistry>,
    pub metrics: Arc<Metrics>,
    metrics_endpoint_disabled: bool,
}

impl AppState {
    pub fn new(registry: Arc<DiskRegistry>) -> Self {
        Self {
            registry,
            metrics: Arc::new(Metrics::new()),
            metrics_endpoint_disabled: false,
        }
    }

    /// Disable the `/metrics` endpoint entirely (it will not be mounted, so requests return `404`).
    pub fn with_disable_metrics(mut self, disable_metrics: bool) -> Self {
        self.metrics_endpoint_disabled = disable_metrics;
        self
    }

    pub fn metrics_endpoint_disabled(&self) -> bool {
        self.metrics_endpoint_disabled
    }
}

pub fn app(state: AppState) -> axum::Router {
    let metrics = Arc::clone(&state.metrics);

    axum::Router::new()
        .merge(http::router(state.clone()))
        .merge(api::router(state))
        .route_layer(middleware::from_fn_with_state(
            metrics,
            http::observability::middleware,
        ))
}

pub use server::{start, start_with, RunningServer, ServerConfig};
