#![forbid(unsafe_code)]

// Media module - mediasoup worker and router management
// Handles mediasoup workers, routers, transports, producers, and consumers

pub mod config;
pub mod engine;
pub mod router_manager;
pub mod session;
pub mod transport_manager;
pub mod types;
pub mod worker_manager;

#[cfg(test)]
pub(crate) mod fake;

pub use config::{MediaConfig, ObserverConfig, RouterConfig, WorkerConfig};
pub use engine::{EngineEvent, LifecycleSender, SfuEngine};
pub use router_manager::RouterManager;
pub use session::MediaSessionManager;
pub use transport_manager::TransportManager;
pub use types::{ConsumerInfo, MediaError, MediaResult, TrackKind, TransportDirection, TransportInfo};
pub use worker_manager::WorkerManager;

use async_trait::async_trait;
use mediasoup::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

fn parse_producer_id(producer_id: &str) -> MediaResult<ProducerId> {
    producer_id
        .parse()
        .map_err(|_| MediaError::ResourceNotFound(format!("producer {producer_id}")))
}

/// Main MediaServer struct that coordinates all mediasoup operations
pub struct MediaServer {
    worker_manager: Arc<WorkerManager>,
    router_manager: Arc<RouterManager>,
    transport_manager: Arc<TransportManager>,
}

impl MediaServer {
    /// Starts the worker pool. Observer, DTLS, producer-close and worker-death
    /// notifications are delivered on `events`.
    pub async fn new(config: MediaConfig, events: mpsc::Sender<EngineEvent>) -> MediaResult<Self> {
        info!("Initializing MediaServer with {} workers", config.worker_config.num_workers);

        let config = Arc::new(config);
        let worker_manager = Arc::new(WorkerManager::new(config.clone(), events.clone()).await?);
        let router_manager = Arc::new(RouterManager::new(
            worker_manager.clone(),
            config.router_config.clone(),
            config.observer_config.clone(),
            events.clone(),
        ));
        let transport_manager = Arc::new(TransportManager::new(config.webrtc_transport_config.clone(), events));

        Ok(Self {
            worker_manager,
            router_manager,
            transport_manager,
        })
    }

    /// Gracefully shuts down all workers and cleans up resources
    pub async fn shutdown(&self) {
        info!("Shutting down MediaServer");

        // First close all transports
        self.transport_manager.close_all();

        // Then close all routers; workers exit when the server is dropped
        self.router_manager.close_all().await;

        info!("MediaServer shutdown complete");
    }
}

#[async_trait]
impl SfuEngine for MediaServer {
    fn worker_count(&self) -> usize {
        self.worker_manager.worker_count()
    }

    async fn open_room(&self, room_id: &str, worker_index: usize) -> MediaResult<()> {
        debug!("Creating router for room: {}", room_id);
        self.router_manager.create_router(room_id, worker_index).await?;
        Ok(())
    }

    async fn close_room(&self, room_id: &str) -> MediaResult<()> {
        debug!("Removing router for room: {}", room_id);
        self.transport_manager.close_room(room_id);
        self.router_manager.remove_router(room_id).await
    }

    async fn rtp_capabilities(&self, room_id: &str) -> MediaResult<Value> {
        let router = self.router_manager.get_router(room_id).await?;
        serde_json::to_value(router.rtp_capabilities())
            .map_err(|e| MediaError::RouterError(format!("Failed to encode capabilities: {e}")))
    }

    async fn create_transport(
        &self,
        room_id: &str,
        client_id: &str,
        direction: TransportDirection,
    ) -> MediaResult<TransportInfo> {
        let router = self.router_manager.get_router(room_id).await?;
        debug!("Creating {:?} transport for client {} in room {}", direction, client_id, room_id);
        self.transport_manager.create_transport(&router, room_id, client_id).await
    }

    async fn connect_transport(&self, _room_id: &str, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        self.transport_manager.connect_transport(transport_id, dtls_parameters).await
    }

    async fn close_transport(&self, _room_id: &str, transport_id: &str) -> MediaResult<()> {
        self.transport_manager.close_transport(transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        room_id: &str,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        let producer_id = self
            .transport_manager
            .produce(room_id, transport_id, kind, rtp_parameters)
            .await?;
        Ok(producer_id.to_string())
    }

    async fn observe_producer(&self, room_id: &str, producer_id: &str) -> MediaResult<()> {
        self.router_manager
            .observe_producer(room_id, parse_producer_id(producer_id)?)
            .await
    }

    async fn close_producer(&self, _room_id: &str, producer_id: &str) -> MediaResult<()> {
        self.transport_manager.close_producer(producer_id);
        Ok(())
    }

    async fn can_consume(&self, room_id: &str, producer_id: &str, rtp_capabilities: &Value) -> MediaResult<bool> {
        let Ok(capabilities) = serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) else {
            return Ok(false);
        };
        let router = self.router_manager.get_router(room_id).await?;
        Ok(router.can_consume(&parse_producer_id(producer_id)?, &capabilities))
    }

    async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerInfo> {
        let capabilities: RtpCapabilities = serde_json::from_value(rtp_capabilities)
            .map_err(|e| MediaError::InvalidParameters(format!("malformed RTP capabilities: {e}")))?;
        self.transport_manager
            .consume(room_id, client_id, transport_id, parse_producer_id(producer_id)?, capabilities)
            .await
    }

    async fn close_consumer(&self, _room_id: &str, consumer_id: &str) -> MediaResult<()> {
        self.transport_manager.close_consumer(consumer_id);
        Ok(())
    }
}
