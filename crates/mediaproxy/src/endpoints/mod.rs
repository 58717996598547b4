use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tower::ServiceBuilder;

use mediaproxy_service::coordinator::FetchCoordinator;
use mediaproxy_service::metric;

mod media;
mod metrics;

use media::serve_media;
use metrics::MetricsLayer;

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(coordinator: Arc<FetchCoordinator>) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);

    // Media identifiers may appear anywhere at the end of the target, so every request that is not
    // routed otherwise is a media request.
    Router::new()
        .fallback(serve_media)
        .with_state(coordinator)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
