use std::future::ready;
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::RwLock;
use tower_http::trace::TraceLayer;

use crate::api::BridgeError;
use crate::config::{ConsumerDefaults, KafkaConfig};
use crate::endpoint::source::SourceEndpoint;
use crate::prometheus::track_metrics;
use crate::registry::SessionRegistry;
use crate::{consumer, producer};

#[derive(Clone)]
pub struct State {
    pub registry: SessionRegistry,
    pub source: Arc<RwLock<SourceEndpoint>>,
    pub kafka: KafkaConfig,
    pub consumer: ConsumerDefaults,
}

async fn index() -> &'static str {
    "kafka-bridge"
}

async fn healthy() -> StatusCode {
    StatusCode::OK
}

async fn ready_check(AxumState(state): AxumState<State>) -> StatusCode {
    if state.source.read().await.is_open() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn not_found(uri: Uri) -> BridgeError {
    BridgeError::RouteNotFound(uri.path().to_string())
}

pub fn router(state: State, metrics: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(index))
        .route("/healthy", get(healthy))
        .route("/ready", get(ready_check))
        .route("/consumers/:group_id", post(consumer::create))
        .route(
            "/consumers/:group_id/instances/:name",
            axum::routing::delete(consumer::delete),
        )
        .route(
            "/consumers/:group_id/instances/:name/subscription",
            post(consumer::subscribe).delete(consumer::unsubscribe),
        )
        .route(
            "/consumers/:group_id/instances/:name/assignments",
            post(consumer::assign),
        )
        .route(
            "/consumers/:group_id/instances/:name/records",
            get(consumer::poll),
        )
        .route(
            "/consumers/:group_id/instances/:name/offsets",
            post(consumer::commit),
        )
        .route(
            "/consumers/:group_id/instances/:name/positions",
            post(consumer::seek),
        )
        .route(
            "/consumers/:group_id/instances/:name/positions/beginning",
            post(consumer::seek_to_beginning),
        )
        .route(
            "/consumers/:group_id/instances/:name/positions/end",
            post(consumer::seek_to_end),
        )
        .route("/topics/:topic", post(producer::send))
        .route(
            "/topics/:topic/partitions/:partition",
            post(producer::send_to_partition),
        )
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // The recorder is process-global, tests build routers without it
    match metrics {
        Some(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        None => router,
    }
}
