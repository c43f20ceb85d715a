pub mod disks;
pub mod range;

mod metrics;
pub(crate) mod observability;

use axum::{
    routing::get,
    Router,
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    let router = Router::<AppState>::new()
        .route("/:disk", get(disks::get_disk).head(disks::head_disk))
        .route("/healthz", get(healthz));
    let router = if state.metrics_endpoint_disabled() {
        router
    } else {
        router.route("/metrics", get(metrics::handle))
    };
    router.with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}
