use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::info;

use crate::api::BridgeError;
use crate::config::Config;
use crate::endpoint::source::SourceEndpoint;
use crate::endpoint::BridgeEndpoint;
use crate::prometheus::setup_metrics_recorder;
use crate::registry::SessionRegistry;
use crate::router;

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    // Producer construction blocks until the brokers answer
    let mut source = SourceEndpoint::new(config.kafka.clone());
    let source = tokio::task::spawn_blocking(move || {
        source.open()?;
        Ok::<_, BridgeError>(source)
    })
    .await?
    .context("failed to open the source endpoint")?;
    let source = Arc::new(RwLock::new(source));

    let registry = SessionRegistry::new();
    let metrics = if config.export_prometheus {
        Some(setup_metrics_recorder().context("failed to install the metrics recorder")?)
    } else {
        None
    };

    let app = router::router(
        router::State {
            registry: registry.clone(),
            source: source.clone(),
            kafka: config.kafka,
            consumer: config.consumer,
        },
        metrics,
    );

    info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("closing {} consumer instances", registry.len());
    registry.close_all().await;

    let mut source = source.write_owned().await;
    tokio::task::spawn_blocking(move || source.close()).await?;
    info!("shutdown complete");

    Ok(())
}
