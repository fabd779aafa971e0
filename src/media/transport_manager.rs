#![forbid(unsafe_code)]

// Transport, producer and consumer objects of every room, keyed by id

use crate::media::config::WebRtcTransportConfig;
use crate::media::engine::{EngineEvent, LifecycleSender};
use crate::media::types::{ConsumerInfo, MediaError, MediaResult, TrackKind, TransportInfo};
use mediasoup::data_structures::DtlsState;
use mediasoup::prelude::*;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

struct TransportEntry {
    transport: WebRtcTransport,
    room_id: String,
}

struct ProducerEntry {
    producer: Producer,
    room_id: String,
    transport_id: String,
}

struct ConsumerEntry {
    consumer: Consumer,
    room_id: String,
    transport_id: String,
}

#[derive(Default)]
struct Objects {
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
}

impl Objects {
    /// Drops a transport with everything created on it
    fn remove_transport(&mut self, transport_id: &str) -> bool {
        self.producers.retain(|_, p| p.transport_id != transport_id);
        self.consumers.retain(|_, c| c.transport_id != transport_id);
        self.transports.remove(transport_id).is_some()
    }
}

fn invalid<E: std::fmt::Display>(what: &str) -> impl FnOnce(E) -> MediaError + '_ {
    move |e| MediaError::InvalidParameters(format!("malformed {what}: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T) -> MediaResult<Value> {
    serde_json::to_value(value).map_err(|e| MediaError::TransportError(format!("Failed to encode parameters: {e}")))
}

/// Owns mediasoup transports, producers and consumers.
///
/// Mediasoup objects close when their last handle is dropped, so removing an
/// entry here is what closes it. The map is behind a std RwLock that is never
/// held across an await point; handles are cloned out before any IPC.
pub struct TransportManager {
    objects: StdRwLock<Objects>,
    config: WebRtcTransportConfig,
    events: LifecycleSender,
}

impl TransportManager {
    pub fn new(config: WebRtcTransportConfig, events: mpsc::Sender<EngineEvent>) -> Self {
        Self {
            objects: StdRwLock::new(Objects::default()),
            config,
            events: LifecycleSender::new(events),
        }
    }

    fn transport(&self, transport_id: &str) -> MediaResult<WebRtcTransport> {
        let objects = self.objects.read().unwrap_or_else(|e| e.into_inner());
        objects
            .transports
            .get(transport_id)
            .map(|entry| entry.transport.clone())
            .ok_or_else(|| MediaError::ResourceNotFound(format!("transport {transport_id}")))
    }

    /// Creates a WebRTC transport for a client on the room's router
    pub async fn create_transport(&self, router: &Router, room_id: &str, client_id: &str) -> MediaResult<TransportInfo> {
        let transport = router
            .create_webrtc_transport(self.config.to_transport_options())
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        if let Some(bitrate) = self.config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to cap incoming bitrate of transport {}: {}", transport.id(), e);
            }
        }

        let info = TransportInfo {
            id: transport.id().to_string(),
            ice_parameters: to_json(transport.ice_parameters())?,
            ice_candidates: to_json(transport.ice_candidates())?,
            dtls_parameters: to_json(&transport.dtls_parameters())?,
        };
        self.setup_transport_handlers(&transport, room_id, client_id);

        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .transports
            .insert(
                info.id.clone(),
                TransportEntry {
                    transport,
                    room_id: room_id.to_string(),
                },
            );

        info!("Created transport {} for client {} in room {}", info.id, client_id, room_id);
        Ok(info)
    }

    pub async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let dtls_parameters: DtlsParameters =
            serde_json::from_value(dtls_parameters).map_err(invalid("DTLS parameters"))?;
        let transport = self.transport(transport_id)?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to connect transport: {e}")))?;

        info!("Connected transport {}", transport_id);
        Ok(())
    }

    pub fn close_transport(&self, transport_id: &str) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        if objects.remove_transport(transport_id) {
            debug!("Closed transport {}", transport_id);
        }
    }

    pub async fn produce(
        &self,
        room_id: &str,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
    ) -> MediaResult<ProducerId> {
        let rtp_parameters: RtpParameters =
            serde_json::from_value(rtp_parameters).map_err(invalid("RTP parameters"))?;
        let kind = match kind {
            TrackKind::Audio => MediaKind::Audio,
            TrackKind::Video => MediaKind::Video,
        };
        let transport = self.transport(transport_id)?;

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;
        let producer_id = producer.id();

        producer
            .on_close({
                let room_id = room_id.to_string();
                move || {
                    debug!("Producer {} closed in room {}", producer_id, room_id);
                }
            })
            .detach();

        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .producers
            .insert(
                producer_id.to_string(),
                ProducerEntry {
                    producer,
                    room_id: room_id.to_string(),
                    transport_id: transport_id.to_string(),
                },
            );

        info!("Created {:?} producer {} in room {}", kind, producer_id, room_id);
        Ok(producer_id)
    }

    pub fn close_producer(&self, producer_id: &str) {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .producers
            .remove(producer_id);
        if let Some(entry) = removed {
            debug!("Closed producer {} in room {}", entry.producer.id(), entry.room_id);
        }
    }

    /// Creates a consumer on a receive transport. When its producer closes the
    /// consumer is dropped and `EngineEvent::ConsumerClosed` is raised.
    pub async fn consume(
        &self,
        room_id: &str,
        client_id: &str,
        transport_id: &str,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> MediaResult<ConsumerInfo> {
        let transport = self.transport(transport_id)?;

        let consumer = transport
            .consume(ConsumerOptions::new(producer_id, rtp_capabilities))
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;
        let consumer_id = consumer.id().to_string();

        consumer
            .on_producer_close({
                let events = self.events.clone();
                let room_id = room_id.to_string();
                let client_id = client_id.to_string();
                let consumer_id = consumer_id.clone();
                move || {
                    events.send(EngineEvent::ConsumerClosed {
                        room_id,
                        client_id,
                        consumer_id,
                    });
                }
            })
            .detach();

        let info = ConsumerInfo {
            producer_id: producer_id.to_string(),
            id: consumer_id.clone(),
            kind: match consumer.kind() {
                MediaKind::Audio => TrackKind::Audio,
                MediaKind::Video => TrackKind::Video,
            },
            rtp_parameters: to_json(consumer.rtp_parameters())?,
            consumer_type: to_json(&consumer.r#type())?
                .as_str()
                .unwrap_or("simple")
                .to_string(),
            producer_paused: consumer.producer_paused(),
        };

        self.objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .consumers
            .insert(
                consumer_id.clone(),
                ConsumerEntry {
                    consumer,
                    room_id: room_id.to_string(),
                    transport_id: transport_id.to_string(),
                },
            );

        info!("Created consumer {} for producer {} and client {}", consumer_id, producer_id, client_id);
        Ok(info)
    }

    pub fn close_consumer(&self, consumer_id: &str) {
        let removed = self
            .objects
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .consumers
            .remove(consumer_id);
        if let Some(entry) = removed {
            debug!("Closed consumer {} in room {}", entry.consumer.id(), entry.room_id);
        }
    }

    /// Closes every object belonging to a room
    pub fn close_room(&self, room_id: &str) {
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.consumers.retain(|_, c| c.room_id != room_id);
        objects.producers.retain(|_, p| p.room_id != room_id);
        objects.transports.retain(|_, t| t.room_id != room_id);
    }

    /// Sets up event handlers for a transport.
    /// Handlers are detached so they persist for the transport's lifetime.
    fn setup_transport_handlers(&self, transport: &WebRtcTransport, room_id: &str, client_id: &str) {
        let transport_id = transport.id().to_string();

        transport
            .on_dtls_state_change({
                let events = self.events.clone();
                let room_id = room_id.to_string();
                let client_id = client_id.to_string();
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for transport {} (client {})", dtls_state, transport_id, client_id);
                    if matches!(dtls_state, DtlsState::Failed | DtlsState::Closed) {
                        events.send(EngineEvent::TransportClosed {
                            room_id: room_id.clone(),
                            client_id: client_id.clone(),
                            transport_id: transport_id.clone(),
                        });
                    }
                }
            })
            .detach();

        transport
            .on_ice_state_change({
                let transport_id = transport_id.clone();
                move |ice_state| {
                    debug!("ICE state: {:?} for transport {}", ice_state, transport_id);
                }
            })
            .detach();

        transport
            .on_close(Box::new(move || {
                debug!("Transport {} closed", transport_id);
            }))
            .detach();
    }

    /// Closes all transports, producers and consumers
    pub fn close_all(&self) {
        info!("Closing all transports");
        let mut objects = self.objects.write().unwrap_or_else(|e| e.into_inner());
        objects.consumers.clear();
        objects.producers.clear();
        objects.transports.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::MediaConfig;
    use crate::media::router_manager::RouterManager;
    use crate::media::worker_manager::WorkerManager;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_transport_creation() {
        let mut config = MediaConfig::default();
        config.worker_config.num_workers = 1;
        let (tx, _rx) = mpsc::channel(8);
        let worker_manager = Arc::new(WorkerManager::new(Arc::new(config.clone()), tx.clone()).await.unwrap());
        let router_manager = RouterManager::new(
            worker_manager,
            config.router_config.clone(),
            config.observer_config.clone(),
            tx.clone(),
        );
        let transport_manager = TransportManager::new(config.webrtc_transport_config.clone(), tx);

        router_manager.create_router("test-room", 0).await.unwrap();
        let router = router_manager.get_router("test-room").await.unwrap();

        let send = transport_manager.create_transport(&router, "test-room", "c1").await.unwrap();
        let recv = transport_manager.create_transport(&router, "test-room", "c1").await.unwrap();
        assert_ne!(send.id, recv.id);
        assert!(send.ice_candidates.is_array());

        let err = transport_manager
            .connect_transport(&send.id, serde_json::json!({ "bogus": true }))
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::InvalidParameters(_)));

        transport_manager.close_room("test-room");
        assert!(transport_manager.transport(&send.id).is_err());
    }
}
