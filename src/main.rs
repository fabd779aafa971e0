#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watchparty::config::AppConfig;
use watchparty::media::{MediaConfig, MediaServer, MediaSessionManager};
use watchparty::metrics::ServerMetrics;
use watchparty::room::RoomRegistry;
use watchparty::signaling::{ConnectionHub, Gateway, SignalingServer};
use watchparty::store::{KeyValueStore, MemoryStore, RedisStore};

/// Engine events queued ahead of the gateway
const ENGINE_EVENT_CAPACITY: usize = 1024;

/// Any end of the engine event task is fatal: the media layer can no longer
/// report worker deaths or transport failures
fn engine_outcome(result: std::result::Result<watchparty::error::Result<()>, JoinError>) -> Result<()> {
    match result {
        Ok(Err(e)) => Err(anyhow!(e).context("media engine failed")),
        Ok(Ok(())) => Err(anyhow!("engine event stream closed")),
        Err(e) => Err(anyhow!(e).context("engine event task aborted")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "watchparty=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Watchparty - Starting server");

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(
        "Node {} announcing {} with {} worker(s)",
        config.node_id, config.announce_ip, config.num_workers
    );

    let (store, hub): (Arc<dyn KeyValueStore>, ConnectionHub) = match &config.redis_url {
        Some(url) => {
            info!("Using Redis at {}", url);
            let store = RedisStore::connect(url).await.context("connecting to Redis")?;
            let hub = ConnectionHub::with_fanout(url, config.node_id.clone())
                .context("starting cross-node fan-out")?;
            (Arc::new(store), hub)
        }
        None => {
            info!("No REDIS_URL set, room state is local to this process");
            (Arc::new(MemoryStore::new()), ConnectionHub::new())
        }
    };

    let (events_tx, events_rx) = mpsc::channel(ENGINE_EVENT_CAPACITY);
    let media_server = Arc::new(
        MediaServer::new(MediaConfig::from_app(&config), events_tx)
            .await
            .context("starting mediasoup workers")?,
    );
    let media = Arc::new(MediaSessionManager::new(media_server.clone()));
    let registry = Arc::new(RoomRegistry::new(store));
    let metrics = ServerMetrics::new();

    let gateway = Arc::new(Gateway::new(registry, media, hub, metrics, config.node_id.clone()));
    info!("Room registry and media server initialized");

    let event_gateway = gateway.clone();
    let mut engine_events = tokio::spawn(async move { event_gateway.run_engine_events(events_rx).await });

    let signaling_server = SignalingServer::new(gateway, config.max_connections, config.metrics_token.clone());

    // Run server with graceful shutdown
    let outcome = tokio::select! {
        result = signaling_server.serve(config.port) => {
            result.context("signaling server failed")
        }
        result = &mut engine_events => engine_outcome(result),
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    };

    media_server.shutdown().await;
    match &outcome {
        Ok(()) => info!("Server shutdown complete"),
        Err(e) => error!("Server stopped: {:#}", e),
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use watchparty::error::Error;

    #[test]
    fn worker_death_fails_the_process() {
        let err = engine_outcome(Ok(Err(Error::Unavailable("media worker 0 died".into())))).unwrap_err();
        assert!(format!("{err:#}").contains("media worker 0 died"));
        assert!(engine_outcome(Ok(Ok(()))).is_err());
    }

    #[tokio::test]
    async fn aborted_event_task_fails_the_process() {
        let task = tokio::spawn(async { std::future::pending::<watchparty::error::Result<()>>().await });
        task.abort();
        assert!(engine_outcome(task.await).is_err());
    }
}
