#![forbid(unsafe_code)]

// Signaling gateway - applies client events to the registry, admission and media layers

use super::hub::{ConnectionHub, Outbound};
use super::protocol::{
    ClientEnvelope, ClientJoinDetails, ClientMessage, Notification, PlaylistDetails, ReplyBody, ServerMessage,
    VideoDetails,
};
use crate::error::{Error, Result};
use crate::media::{EngineEvent, MediaSessionManager, TrackKind, TransportDirection};
use crate::metrics::{Counter, ServerMetrics};
use crate::room::{AdmissionController, EntryDecision, HostMigration, Room, RoomRegistry, RoomType, WaitingVerdict};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_CLIENT_NAME_LEN: usize = 64;
const MAX_CHAT_LEN: usize = 4096;
const MAX_VIDEO_ID_LEN: usize = 256;

fn check_len(field: &str, value: &str, max: usize) -> Result<()> {
    if value.is_empty() || value.len() > max {
        return Err(Error::BadRequest(format!("{field} must be 1-{max} characters")));
    }
    Ok(())
}

fn others(room: &Room, client_id: &str) -> Vec<String> {
    room.clients
        .iter()
        .filter(|c| c.id != client_id)
        .map(|c| c.id.clone())
        .collect()
}

/// Dispatches inbound events and broadcasts the resulting state.
///
/// Every mutating event resolves the caller's room through the registry,
/// applies the change there and re-broadcasts to the room. Membership is the
/// only access check. A room's media lives on the node that opened it;
/// other nodes refuse to join or queue for that room.
pub struct Gateway {
    registry: Arc<RoomRegistry>,
    admission: AdmissionController,
    media: Arc<MediaSessionManager>,
    hub: ConnectionHub,
    metrics: ServerMetrics,
    node_id: String,
}

impl Gateway {
    pub fn new(
        registry: Arc<RoomRegistry>,
        media: Arc<MediaSessionManager>,
        hub: ConnectionHub,
        metrics: ServerMetrics,
        node_id: String,
    ) -> Self {
        Self {
            admission: AdmissionController::new(registry.clone()),
            registry,
            media,
            hub,
            metrics,
            node_id,
        }
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn media(&self) -> &MediaSessionManager {
        &self.media
    }

    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    pub fn connect(&self, conn_id: &str, sender: mpsc::Sender<Outbound>) {
        self.hub.register(conn_id, sender);
        debug!("Connection {} registered", conn_id);
    }

    /// Decodes one text frame and handles it. Undecodable frames are
    /// answered with a `badRequest` error and go no further.
    pub async fn handle_text(&self, conn_id: &str, text: &str) {
        match ClientEnvelope::parse(text) {
            Ok(envelope) => self.handle(conn_id, envelope).await,
            Err(e) => {
                warn!("Invalid message format from {}: {}", conn_id, e.reason);
                self.metrics.inc(Counter::Errors);
                let err = Error::BadRequest(format!("Invalid message format: {}", e.reason));
                self.hub.send(conn_id, &ServerMessage::error(e.request_id, &err));
            }
        }
    }

    /// Handles one decoded event. Replies go to the caller only, and only
    /// when the event carried a request id; errors are always reported.
    pub async fn handle(&self, conn_id: &str, envelope: ClientEnvelope) {
        let ClientEnvelope { request_id, message } = envelope;
        let event = message.name();
        debug!("{} from {}", event, conn_id);

        match self.dispatch(conn_id, message).await {
            Ok(body) => {
                if request_id.is_some() {
                    self.hub.send(conn_id, &ServerMessage::reply(request_id, body));
                }
            }
            Err(e) => {
                match &e {
                    Error::Store(_) | Error::Engine(_) | Error::Unavailable(_) => {
                        error!("{} from {} failed: {}", event, conn_id, e)
                    }
                    _ => debug!("{} from {} rejected: {}", event, conn_id, e),
                }
                self.metrics.inc(Counter::Errors);
                self.hub.send(conn_id, &ServerMessage::error(request_id, &e));
            }
        }
    }

    async fn dispatch(&self, conn_id: &str, message: ClientMessage) -> Result<ReplyBody> {
        match message {
            ClientMessage::Join {
                room_id,
                client_name,
                youtube_id,
                room_type,
            } => {
                let room = self
                    .join_room(conn_id, &room_id, &client_name, youtube_id, room_type, false)
                    .await?;
                Ok(ReplyBody::Joined {
                    client_id: conn_id.to_string(),
                    room,
                })
            }
            ClientMessage::GetRtpCapabilities => {
                let room_id = self.registry.room_of(conn_id).await?;
                let rtp_capabilities = self.media.rtp_capabilities(&room_id).await?;
                Ok(ReplyBody::RtpCapabilities { rtp_capabilities })
            }
            ClientMessage::GetProducers => {
                let room_id = self.registry.room_of(conn_id).await?;
                let producers = self.media.producers_for(&room_id, conn_id).await?;
                self.hub.send(conn_id, &ServerMessage::new_producers(producers));
                Ok(ReplyBody::Ok)
            }
            ClientMessage::CreateTransport { direction } => self.create_transport(conn_id, direction).await,
            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room_id = self.registry.room_of(conn_id).await?;
                self.media
                    .connect_transport(&room_id, conn_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::Produce {
                producer_transport_id,
                media_type,
                rtp_parameters,
            } => {
                self.produce(conn_id, &producer_transport_id, media_type, rtp_parameters)
                    .await
            }
            ClientMessage::Consume {
                consumer_transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let room_id = self.registry.room_of(conn_id).await?;
                let consumer = self
                    .media
                    .consume(&room_id, conn_id, &consumer_transport_id, &producer_id, rtp_capabilities)
                    .await?;
                self.metrics.inc(Counter::ConsumersCreated);
                Ok(ReplyBody::ConsumerCreated(consumer))
            }
            ClientMessage::ProducerClosed { .. } => {
                let room_id = self.registry.room_of(conn_id).await?;
                self.close_producer(&room_id, conn_id).await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::VideoStateChange { kind, payload } => {
                self.video_state_change(conn_id, kind, payload).await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::ChangeVideo(index) => {
                self.change_video(conn_id, index).await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::NewMessage(text) => {
                check_len("message", &text, MAX_CHAT_LEN)?;
                let (room, client) = self.registry.membership(conn_id).await?;
                self.broadcast(
                    &room,
                    ServerMessage::NotifyClient(Notification::ClientMessage {
                        client: Some(client.name),
                        client_id: client.id,
                        message: text,
                    }),
                );
                Ok(ReplyBody::Ok)
            }
            ClientMessage::AddToPlaylist(video_id) => {
                check_len("video id", &video_id, MAX_VIDEO_ID_LEN)?;
                let (room, client) = self.registry.membership(conn_id).await?;
                let playlist = self.registry.append_video(&room.id, &video_id).await?;
                self.metrics.inc(Counter::PlaylistEdits);
                self.broadcast(
                    &room,
                    ServerMessage::NotifyClient(Notification::AddToPlaylist {
                        details: PlaylistDetails { playlist },
                    }),
                );
                self.system_line(&room, conn_id, format!("{} added a new video", client.name));
                Ok(ReplyBody::Ok)
            }
            ClientMessage::DeletePlaylistItem(index) => {
                let (room, client) = self.registry.membership(conn_id).await?;
                let playlist = self.registry.remove_video(&room.id, index).await?;
                self.metrics.inc(Counter::PlaylistEdits);
                self.broadcast(
                    &room,
                    ServerMessage::NotifyClient(Notification::DeletePlaylistItem {
                        details: PlaylistDetails { playlist },
                    }),
                );
                self.system_line(&room, conn_id, format!("{} deleted a playlist item", client.name));
                Ok(ReplyBody::Ok)
            }
            ClientMessage::InsertVideoAtIndex { old_index, new_index } => {
                let (room, client) = self.registry.membership(conn_id).await?;
                let playlist = self.registry.move_video(&room.id, old_index, new_index).await?;
                self.metrics.inc(Counter::PlaylistEdits);
                self.broadcast(
                    &room,
                    ServerMessage::NotifyClient(Notification::MovePlaylistItem {
                        details: PlaylistDetails { playlist },
                    }),
                );
                self.system_line(
                    &room,
                    conn_id,
                    format!(
                        "{} swapped playlist item #{} with item #{}",
                        client.name,
                        old_index + 1,
                        new_index + 1
                    ),
                );
                Ok(ReplyBody::Ok)
            }
            ClientMessage::Mute { id } => {
                self.toggle_mute(conn_id, id).await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::GetRoomType { client_name, room_id } => {
                check_len("roomId", &room_id, MAX_ROOM_ID_LEN)?;
                check_len("clientName", &client_name, MAX_CLIENT_NAME_LEN)?;
                let admitted = self.request_entry(conn_id, &room_id, &client_name).await?;
                Ok(ReplyBody::RoomAdmission { admitted })
            }
            ClientMessage::WaitingResponse { socket_id, status } => {
                self.waiting_response(conn_id, &socket_id, status).await?;
                Ok(ReplyBody::Ok)
            }
            ClientMessage::Disconnect => {
                self.hub.close(conn_id);
                self.disconnect(conn_id).await?;
                Ok(ReplyBody::Ok)
            }
        }
    }

    fn broadcast(&self, room: &Room, message: ServerMessage) {
        self.hub.send_many(&room.client_ids(), &message);
    }

    fn system_line(&self, room: &Room, client_id: &str, text: String) {
        self.broadcast(room, ServerMessage::NotifyClient(Notification::system(client_id, text)));
    }

    fn check_media_node(&self, room: &Room) -> Result<()> {
        match &room.media_node {
            Some(owner) if *owner != self.node_id => Err(Error::Unavailable(format!(
                "room {} is served by node {owner}",
                room.id
            ))),
            _ => Ok(()),
        }
    }

    /// Releases a client's media and closes the room's router if that left it empty
    async fn release_media(&self, room_id: &str, conn_id: &str) {
        if let Err(e) = self.media.disconnect(room_id, conn_id).await {
            warn!("Failed to release media of {} in room {}: {}", conn_id, room_id, e);
        }
        if let Err(e) = self.media.close_room(room_id).await {
            warn!("Failed to close media of room {}: {}", room_id, e);
        }
    }

    /// Registry half of a join: creates the room, pins its media to this
    /// node and adds the client
    async fn enter_room(
        &self,
        conn_id: &str,
        room_id: &str,
        name: &str,
        youtube_id: Option<String>,
        room_type: RoomType,
    ) -> Result<()> {
        let (_, created) = self.registry.create_room_if_absent(room_id, youtube_id, room_type).await?;
        if created {
            self.metrics.inc(Counter::RoomsCreated);
        }
        let room = self.registry.pin_media(room_id, &self.node_id).await?;
        self.check_media_node(&room)?;
        self.registry.add_client(room_id, conn_id, name).await?;
        Ok(())
    }

    /// Server-side join. `admitted` is set when a host has already accepted
    /// the connection into a gated room.
    async fn join_room(
        &self,
        conn_id: &str,
        room_id: &str,
        name: &str,
        youtube_id: Option<String>,
        room_type: RoomType,
        admitted: bool,
    ) -> Result<Room> {
        check_len("roomId", room_id, MAX_ROOM_ID_LEN)?;
        check_len("clientName", name, MAX_CLIENT_NAME_LEN)?;

        match self.registry.room_of(conn_id).await {
            Ok(current) if current == room_id => return self.registry.get_room(room_id).await,
            Ok(current) => {
                return Err(Error::InvalidState(format!("{conn_id} is already in room {current}")));
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match self.registry.get_room(room_id).await {
            Ok(room) => {
                self.check_media_node(&room)?;
                if !admitted && room.is_gated() && !room.is_member(conn_id) {
                    return Err(Error::InvalidState(format!(
                        "room {room_id} requires the host's approval"
                    )));
                }
            }
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        self.media.join(room_id, conn_id).await?;
        if let Err(e) = self
            .enter_room(conn_id, room_id, name, youtube_id.clone(), room_type)
            .await
        {
            if let Err(cleanup) = self.registry.remove_client(room_id, conn_id).await {
                warn!("Failed to undo roster entry of {} in room {}: {}", conn_id, room_id, cleanup);
            }
            self.release_media(room_id, conn_id).await;
            return Err(e);
        }
        self.metrics.inc(Counter::Joins);

        let room = self.registry.get_room(room_id).await?;
        info!("Client {} ({}) joined room {}", conn_id, name, room_id);

        self.hub.send_many(
            &others(&room, conn_id),
            &ServerMessage::NotifyClient(Notification::ClientJoin {
                details: ClientJoinDetails {
                    room_id: room_id.to_string(),
                    client_id: conn_id.to_string(),
                    client_name: name.to_string(),
                },
            }),
        );
        self.broadcast(&room, ServerMessage::UpdateClientList(room.clients.clone()));
        self.broadcast(&room, ServerMessage::UpdatePlaylist(room.playlist.clone()));
        self.system_line(&room, conn_id, format!("{name} entered"));
        if youtube_id.is_none() {
            self.hub.send(
                conn_id,
                &ServerMessage::NotifyClient(Notification::ChangeVideo {
                    details: VideoDetails {
                        youtube_id: room.video_id.clone(),
                    },
                }),
            );
        }
        Ok(room)
    }

    async fn create_transport(&self, conn_id: &str, direction: TransportDirection) -> Result<ReplyBody> {
        let room_id = self.registry.room_of(conn_id).await?;
        let transport = self.media.create_transport(&room_id, conn_id, direction).await?;
        Ok(ReplyBody::TransportCreated(transport))
    }

    async fn produce(
        &self,
        conn_id: &str,
        transport_id: &str,
        kind: TrackKind,
        rtp_parameters: Value,
    ) -> Result<ReplyBody> {
        let (room, _) = self.registry.membership(conn_id).await?;
        let producer_id = self
            .media
            .produce(&room.id, conn_id, transport_id, kind, rtp_parameters)
            .await?;
        self.metrics.inc(Counter::ProducersCreated);

        self.hub.send_many(
            &others(&room, conn_id),
            &ServerMessage::new_producers([producer_id.clone()]),
        );
        Ok(ReplyBody::ProducerCreated { producer_id })
    }

    /// Closes a client's producer and tells that client; a no-op when it has none
    async fn close_producer(&self, room_id: &str, client_id: &str) -> Result<()> {
        if let Some(producer_id) = self.media.close_producer(room_id, client_id).await? {
            self.hub.send(client_id, &ServerMessage::ProducerClosed { producer_id });
        }
        Ok(())
    }

    async fn video_state_change(&self, conn_id: &str, kind: String, payload: Map<String, Value>) -> Result<()> {
        let (room, client) = self.registry.membership(conn_id).await?;

        let line = match kind.as_str() {
            "PLAY_VIDEO" => Some(format!("{} started the video", client.name)),
            "PAUSE_VIDEO" => Some(format!("{} paused the video", client.name)),
            _ => None,
        };

        let mut details = payload;
        details.insert("type".to_string(), Value::String(kind));
        details.insert(
            "client".to_string(),
            json!({ "name": client.name, "socketId": conn_id }),
        );
        self.hub.send_many(
            &others(&room, conn_id),
            &ServerMessage::NotifyClient(Notification::UpdateVideoState { details }),
        );
        if let Some(line) = line {
            self.system_line(&room, conn_id, line);
        }
        Ok(())
    }

    async fn change_video(&self, conn_id: &str, index: usize) -> Result<()> {
        let (room, client) = self.registry.membership(conn_id).await?;
        let video_id = self.registry.change_video(&room.id, index).await?;
        self.broadcast(
            &room,
            ServerMessage::NotifyClient(Notification::ChangeVideo {
                details: VideoDetails {
                    youtube_id: Some(video_id),
                },
            }),
        );
        self.system_line(&room, conn_id, format!("{} changed the video", client.name));
        Ok(())
    }

    /// Toggles the mute flag of `target` (the caller by default). Muting
    /// also closes the target's producer.
    async fn toggle_mute(&self, conn_id: &str, target: Option<String>) -> Result<()> {
        let room_id = self.registry.room_of(conn_id).await?;
        let target = target.unwrap_or_else(|| conn_id.to_string());
        let (client, roster) = self.registry.toggle_mute(&target, &room_id).await?;

        if client.is_muted {
            self.close_producer(&room_id, &client.id).await?;
        }

        let ids: Vec<String> = roster.iter().map(|c| c.id.clone()).collect();
        let verb = if client.is_muted { "muted" } else { "unmuted" };
        self.hub.send_many(&ids, &ServerMessage::UpdateClientList(roster));
        self.hub.send_many(
            &ids,
            &ServerMessage::NotifyClient(Notification::system(&client.id, format!("{} {}", client.name, verb))),
        );
        Ok(())
    }

    /// Answers whether the connection may join right away. Gated rooms park
    /// it on the waiting list and alert the host.
    async fn request_entry(&self, conn_id: &str, room_id: &str, name: &str) -> Result<bool> {
        match self.registry.get_room(room_id).await {
            Ok(room) => self.check_media_node(&room)?,
            Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        match self.admission.request_entry(conn_id, room_id, name).await? {
            EntryDecision::Admit => Ok(true),
            EntryDecision::Waiting {
                host_id,
                waiting_clients,
                ..
            } => {
                self.metrics.inc(Counter::WaitingRequests);
                match host_id {
                    Some(host_id) => self.hub.send(&host_id, &ServerMessage::WaitingClient { waiting_clients }),
                    None => warn!("Room {} has no host to admit {}", room_id, conn_id),
                }
                Ok(false)
            }
        }
    }

    async fn waiting_response(&self, responder_id: &str, waiting_id: &str, verdict: WaitingVerdict) -> Result<()> {
        let resolution = self.admission.respond(responder_id, waiting_id, verdict).await?;

        self.hub.send(
            responder_id,
            &ServerMessage::UpdateWaitingClients {
                waiting_client_list: resolution.waiting_clients.clone(),
                client_id_left: waiting_id.to_string(),
            },
        );

        match resolution.verdict {
            WaitingVerdict::Accept => {
                self.admit_waiting(waiting_id, &resolution.room_id, &resolution.name)
                    .await?;
            }
            WaitingVerdict::Decline => {
                self.hub.send(waiting_id, &ServerMessage::Declined);
                self.hub.close(waiting_id);
            }
        }
        Ok(())
    }

    /// Joins an accepted connection on its behalf. A connection whose socket
    /// closed meanwhile is not joined, or is removed again if it closed
    /// during the join.
    async fn admit_waiting(&self, waiting_id: &str, room_id: &str, name: &str) -> Result<()> {
        if !self.hub.is_local(waiting_id) {
            return Err(Error::NotFound(format!("connection {waiting_id} is gone")));
        }
        self.join_room(waiting_id, room_id, name, None, RoomType::default(), true)
            .await?;
        if !self.hub.is_local(waiting_id) {
            info!("Connection {} closed while being admitted to room {}", waiting_id, room_id);
            self.disconnect(waiting_id).await?;
            return Err(Error::NotFound(format!("connection {waiting_id} is gone")));
        }
        self.hub.send(waiting_id, &ServerMessage::Admitted);
        Ok(())
    }

    /// Runs every cleanup a departing connection needs: waiting-list
    /// removal, media release, host migration and roster update.
    pub async fn disconnect(&self, conn_id: &str) -> Result<()> {
        self.hub.unregister(conn_id);

        if let Some(departure) = self.admission.leave_waiting(conn_id).await? {
            debug!("Waiting connection {} left room {}", conn_id, departure.room_id);
            if let Some(host_id) = departure.host_id {
                self.hub.send(
                    &host_id,
                    &ServerMessage::UpdateWaitingClients {
                        waiting_client_list: departure.waiting_clients,
                        client_id_left: conn_id.to_string(),
                    },
                );
            }
            return Ok(());
        }

        let (room, client) = match self.registry.membership(conn_id).await {
            Ok(found) => found,
            Err(Error::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if let Err(e) = self.media.disconnect(&room.id, conn_id).await {
            warn!("Failed to release media of {} in room {}: {}", conn_id, room.id, e);
        }

        if let HostMigration::Promoted {
            new_host,
            waiting_clients,
        } = self.admission.migrate_host(&room.id, conn_id).await?
        {
            self.metrics.inc(Counter::HostMigrations);
            self.hub.send_many(
                &others(&room, conn_id),
                &ServerMessage::NewHost {
                    name: new_host.name.clone(),
                    host_id: new_host.id.clone(),
                },
            );
            self.hub.send(
                &new_host.id,
                &ServerMessage::UpdateWaitingClients {
                    waiting_client_list: waiting_clients,
                    client_id_left: String::new(),
                },
            );
        }

        let roster = self.registry.remove_client(&room.id, conn_id).await?;
        self.metrics.inc(Counter::Leaves);
        info!("Client {} ({}) left room {}", conn_id, client.name, room.id);

        if roster.is_empty() {
            // a newcomer may have joined the media session since; close_room keeps it then
            match self.media.close_room(&room.id).await {
                Ok(true) => {}
                Ok(false) => debug!("Media of room {} stays open for new members", room.id),
                Err(e) => warn!("Failed to close media of room {}: {}", room.id, e),
            }
            return Ok(());
        }

        let ids: Vec<String> = roster.iter().map(|c| c.id.clone()).collect();
        self.hub.send_many(&ids, &ServerMessage::UpdateClientList(roster));
        self.hub.send_many(
            &ids,
            &ServerMessage::NotifyClient(Notification::system(conn_id, format!("{} left", client.name))),
        );
        Ok(())
    }

    /// Forwards engine notifications until the channel closes. Returns
    /// `Unavailable` as soon as a worker dies.
    pub async fn run_engine_events(&self, mut events: mpsc::Receiver<EngineEvent>) -> Result<()> {
        while let Some(event) = events.recv().await {
            self.handle_engine_event(event).await?;
        }
        Ok(())
    }

    pub async fn handle_engine_event(&self, event: EngineEvent) -> Result<()> {
        match event {
            EngineEvent::Volumes { room_id, volumes } => {
                let client_volumes = self.media.speaker_volumes(&room_id, &volumes).await;
                self.active_speaker(&room_id, Some(client_volumes)).await;
            }
            EngineEvent::Silence { room_id } => {
                self.active_speaker(&room_id, None).await;
            }
            EngineEvent::ConsumerClosed {
                room_id,
                client_id,
                consumer_id,
            } => match self.media.consumer_closed(&room_id, &client_id, &consumer_id).await {
                Ok(true) => self.hub.send(&client_id, &ServerMessage::ConsumerClosed { consumer_id }),
                Ok(false) => {}
                Err(e) => warn!("Failed to release consumer {}: {}", consumer_id, e),
            },
            EngineEvent::TransportClosed {
                room_id,
                client_id,
                transport_id,
            } => match self.media.transport_closed(&room_id, &client_id, &transport_id).await {
                Ok(Some(producer_id)) => self.hub.send(&client_id, &ServerMessage::ProducerClosed { producer_id }),
                Ok(None) => {}
                Err(e) => warn!("Failed to release transport {}: {}", transport_id, e),
            },
            EngineEvent::WorkerDied { worker_index } => {
                let rooms = self.media.rooms_on_worker(worker_index).await;
                error!("Media worker {} died, {} room(s) lost their media: {:?}", worker_index, rooms.len(), rooms);
                return Err(Error::Unavailable(format!("media worker {worker_index} died")));
            }
        }
        Ok(())
    }

    /// Sends the speaking levels together with the whole roster so stale
    /// highlights can be cleared
    async fn active_speaker(&self, room_id: &str, client_volumes: Option<HashMap<String, i8>>) {
        let room = match self.registry.get_room(room_id).await {
            Ok(room) => room,
            Err(e) => {
                debug!("Dropping speaker update for room {}: {}", room_id, e);
                return;
            }
        };
        let clients = room.client_ids();
        self.hub.send_many(&clients, &ServerMessage::ActiveSpeaker { client_volumes, clients: clients.clone() });
    }
}
