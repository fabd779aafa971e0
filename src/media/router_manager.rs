#![forbid(unsafe_code)]

// Router management for rooms, one router and one audio level observer per room

use crate::media::config::{ObserverConfig, RouterConfig};
use crate::media::engine::EngineEvent;
use crate::media::types::{MediaError, MediaResult};
use crate::media::worker_manager::WorkerManager;
use mediasoup::audio_level_observer::AudioLevelObserver;
use mediasoup::prelude::*;
use mediasoup::rtp_observer::{RtpObserver, RtpObserverAddProducerOptions};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

/// A room's router together with its worker and observer
#[derive(Clone)]
struct RouterInfo {
    router: Router,
    worker_index: usize,
    audio_observer: AudioLevelObserver,
}

/// Manages routers for different rooms
pub struct RouterManager {
    routers: Arc<RwLock<HashMap<String, RouterInfo>>>,
    worker_manager: Arc<WorkerManager>,
    router_config: RouterConfig,
    observer_config: ObserverConfig,
    events: mpsc::Sender<EngineEvent>,
}

impl RouterManager {
    pub fn new(
        worker_manager: Arc<WorkerManager>,
        router_config: RouterConfig,
        observer_config: ObserverConfig,
        events: mpsc::Sender<EngineEvent>,
    ) -> Self {
        Self {
            routers: Arc::new(RwLock::new(HashMap::new())),
            worker_manager,
            router_config,
            observer_config,
            events,
        }
    }

    /// Creates a router and its audio level observer for a room on the given worker
    pub async fn create_router(&self, room_id: &str, worker_index: usize) -> MediaResult<String> {
        if self.routers.read().await.contains_key(room_id) {
            return Err(MediaError::RouterError(format!("Router already exists for room: {room_id}")));
        }

        let worker = self.worker_manager.worker(worker_index)?;
        let router = worker
            .create_router(self.router_config.to_router_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        let audio_observer = router
            .create_audio_level_observer(self.observer_config.to_observer_options())
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create audio level observer: {e}")))?;

        let router_id = router.id().to_string();
        info!("Created router {} for room {} on worker {}", router_id, room_id, worker_index);

        self.setup_router_handlers(&router, room_id);
        self.setup_observer_handlers(&audio_observer, room_id);

        self.routers.write().await.insert(
            room_id.to_string(),
            RouterInfo {
                router,
                worker_index,
                audio_observer,
            },
        );

        Ok(router_id)
    }

    /// Gets a router for a room
    pub async fn get_router(&self, room_id: &str) -> MediaResult<Router> {
        self.routers
            .read()
            .await
            .get(room_id)
            .map(|info| info.router.clone())
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    pub async fn get_worker_index(&self, room_id: &str) -> MediaResult<usize> {
        self.routers
            .read()
            .await
            .get(room_id)
            .map(|info| info.worker_index)
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))
    }

    /// Subscribes a producer to the room's audio level observer
    pub async fn observe_producer(&self, room_id: &str, producer_id: ProducerId) -> MediaResult<()> {
        let observer = self
            .routers
            .read()
            .await
            .get(room_id)
            .map(|info| info.audio_observer.clone())
            .ok_or_else(|| MediaError::RoomNotFound(room_id.to_string()))?;

        observer
            .add_producer(RtpObserverAddProducerOptions::new(producer_id))
            .await?;
        debug!("Producer {} added to audio observer of room {}", producer_id, room_id);
        Ok(())
    }

    /// Removes a router for a room; the router closes once dropped
    pub async fn remove_router(&self, room_id: &str) -> MediaResult<()> {
        match self.routers.write().await.remove(room_id) {
            Some(info) => {
                info!("Removed router for room {} from worker {}", room_id, info.worker_index);
                Ok(())
            }
            None => Err(MediaError::RoomNotFound(room_id.to_string())),
        }
    }

    pub async fn has_router(&self, room_id: &str) -> bool {
        self.routers.read().await.contains_key(room_id)
    }

    pub async fn router_count(&self) -> usize {
        self.routers.read().await.len()
    }

    /// Sets up event handlers for a router
    fn setup_router_handlers(&self, router: &Router, room_id: &str) {
        let room_id = room_id.to_string();

        router
            .on_worker_close(move || {
                warn!("Worker closed for router in room: {}", room_id);
            })
            .detach();
    }

    /// Forwards observer callbacks to the engine event channel. Dropping a
    /// volume report when the channel is full is fine; the next one follows
    /// within one interval.
    fn setup_observer_handlers(&self, observer: &AudioLevelObserver, room_id: &str) {
        observer
            .on_volumes({
                let events = self.events.clone();
                let room_id = room_id.to_string();
                move |volumes| {
                    let volumes = volumes
                        .iter()
                        .map(|v| (v.producer.id().to_string(), v.volume))
                        .collect();
                    let _ = events.try_send(EngineEvent::Volumes {
                        room_id: room_id.clone(),
                        volumes,
                    });
                }
            })
            .detach();

        observer
            .on_silence({
                let events = self.events.clone();
                let room_id = room_id.to_string();
                move || {
                    let _ = events.try_send(EngineEvent::Silence {
                        room_id: room_id.clone(),
                    });
                }
            })
            .detach();
    }

    /// Closes all routers
    pub async fn close_all(&self) {
        info!("Closing all routers");
        for (room_id, _info) in self.routers.write().await.drain() {
            debug!("Closed router for room: {}", room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;

    #[tokio::test]
    async fn test_router_lifecycle() {
        let mut config = MediaConfig::default();
        config.worker_config.num_workers = 1;
        let (tx, _rx) = mpsc::channel(8);
        let worker_manager = Arc::new(WorkerManager::new(Arc::new(config.clone()), tx.clone()).await.unwrap());
        let router_manager = RouterManager::new(worker_manager, config.router_config, config.observer_config, tx);

        router_manager.create_router("test-room", 0).await.unwrap();
        assert!(router_manager.has_router("test-room").await);
        assert_eq!(router_manager.get_worker_index("test-room").await.unwrap(), 0);
        assert!(router_manager.create_router("test-room", 0).await.is_err());

        router_manager.remove_router("test-room").await.unwrap();
        assert!(!router_manager.has_router("test-room").await);
        assert_eq!(router_manager.router_count().await, 0);
    }
}
