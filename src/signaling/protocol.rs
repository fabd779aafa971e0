#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::error::ErrorKind;
use crate::media::types::{ConsumerInfo, TrackKind, TransportDirection, TransportInfo};
use crate::room::{Client, Room, RoomType, WaitingVerdict};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

/// Client-to-Server messages, one payload shape per event name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Enter a room, creating it on first join
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        client_name: String,
        #[serde(default, rename = "youtubeID")]
        youtube_id: Option<String>,
        #[serde(default)]
        room_type: RoomType,
    },
    GetRtpCapabilities,
    GetProducers,
    CreateTransport {
        direction: TransportDirection,
    },
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        dtls_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Produce {
        producer_transport_id: String,
        #[serde(default)]
        media_type: TrackKind,
        rtp_parameters: Value,
    },
    #[serde(rename_all = "camelCase")]
    Consume {
        consumer_transport_id: String,
        producer_id: String,
        rtp_capabilities: Value,
    },
    /// The caller's local track ended
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        #[serde(default)]
        producer_id: Option<String>,
    },
    VideoStateChange {
        #[serde(rename = "type")]
        kind: String,
        #[serde(default)]
        payload: Map<String, Value>,
    },
    ChangeVideo(usize),
    NewMessage(String),
    AddToPlaylist(String),
    DeletePlaylistItem(usize),
    #[serde(rename_all = "camelCase")]
    InsertVideoAtIndex {
        old_index: usize,
        new_index: usize,
    },
    /// Toggle the mute flag of `id`, or of the caller when absent
    Mute {
        #[serde(default)]
        id: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    GetRoomType {
        client_name: String,
        room_id: String,
    },
    #[serde(rename_all = "camelCase")]
    WaitingResponse {
        socket_id: String,
        status: WaitingVerdict,
    },
    Disconnect,
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Join { .. } => "join",
            ClientMessage::GetRtpCapabilities => "getRtpCapabilities",
            ClientMessage::GetProducers => "getProducers",
            ClientMessage::CreateTransport { .. } => "createTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::ProducerClosed { .. } => "producerClosed",
            ClientMessage::VideoStateChange { .. } => "videoStateChange",
            ClientMessage::ChangeVideo(_) => "changeVideo",
            ClientMessage::NewMessage(_) => "newMessage",
            ClientMessage::AddToPlaylist(_) => "addToPlaylist",
            ClientMessage::DeletePlaylistItem(_) => "deletePlaylistItem",
            ClientMessage::InsertVideoAtIndex { .. } => "insertVideoAtIndex",
            ClientMessage::Mute { .. } => "mute",
            ClientMessage::GetRoomType { .. } => "getRoomType",
            ClientMessage::WaitingResponse { .. } => "waitingResponse",
            ClientMessage::Disconnect => "disconnect",
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    #[serde(default)]
    request_id: Option<u64>,
    event: String,
    #[serde(default)]
    data: Option<Value>,
}

/// An inbound frame: a message plus the correlation id its reply will carry
#[derive(Debug, Clone, PartialEq)]
pub struct ClientEnvelope {
    pub request_id: Option<u64>,
    pub message: ClientMessage,
}

/// A frame that could not be decoded. Keeps the correlation id when the
/// outer envelope was readable so the error can still be matched.
#[derive(Debug)]
pub struct DecodeError {
    pub request_id: Option<u64>,
    pub reason: String,
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> Result<Self, DecodeError> {
        let raw: RawEnvelope = serde_json::from_str(text).map_err(|e| DecodeError {
            request_id: None,
            reason: e.to_string(),
        })?;

        let mut tagged = Map::new();
        tagged.insert("event".to_string(), Value::String(raw.event));
        if let Some(data) = raw.data {
            tagged.insert("data".to_string(), data);
        }
        let message = serde_json::from_value(Value::Object(tagged)).map_err(|e| DecodeError {
            request_id: raw.request_id,
            reason: e.to_string(),
        })?;

        Ok(Self {
            request_id: raw.request_id,
            message,
        })
    }
}

/// Result payload of a successful request
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ReplyBody {
    #[serde(rename_all = "camelCase")]
    Joined { client_id: String, room: Room },
    #[serde(rename_all = "camelCase")]
    RtpCapabilities { rtp_capabilities: Value },
    TransportCreated(TransportInfo),
    #[serde(rename_all = "camelCase")]
    ProducerCreated { producer_id: String },
    ConsumerCreated(ConsumerInfo),
    RoomAdmission { admitted: bool },
    Ok,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub body: ReplyBody,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientJoinDetails {
    pub room_id: String,
    pub client_id: String,
    pub client_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlaylistDetails {
    pub playlist: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VideoDetails {
    #[serde(rename = "youtubeID")]
    pub youtube_id: Option<String>,
}

/// Payload of `notifyClient`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notification")]
pub enum Notification {
    #[serde(rename = "clientJoin")]
    ClientJoin { details: ClientJoinDetails },
    /// Chat line; system lines carry no client name
    #[serde(rename = "clientMessage", rename_all = "camelCase")]
    ClientMessage {
        client: Option<String>,
        client_id: String,
        message: String,
    },
    #[serde(rename = "updateVideoState")]
    UpdateVideoState { details: Map<String, Value> },
    #[serde(rename = "addToPlaylist")]
    AddToPlaylist { details: PlaylistDetails },
    #[serde(rename = "deletePlaylistItem")]
    DeletePlaylistItem { details: PlaylistDetails },
    #[serde(rename = "movePlaylistItem")]
    MovePlaylistItem { details: PlaylistDetails },
    #[serde(rename = "CHANGE_VIDEO")]
    ChangeVideo { details: VideoDetails },
}

impl Notification {
    pub fn system(client_id: &str, message: impl Into<String>) -> Self {
        Notification::ClientMessage {
            client: None,
            client_id: client_id.to_string(),
            message: message.into(),
        }
    }
}

/// Server-to-Client messages
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    Reply(Reply),
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
    UpdateClientList(Vec<Client>),
    UpdatePlaylist(Vec<String>),
    NotifyClient(Notification),
    NewProducers(Vec<ProducerRef>),
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },
    /// Sent to a client whose own producer was closed
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    #[serde(rename_all = "camelCase")]
    WaitingClient { waiting_clients: IndexMap<String, String> },
    #[serde(rename_all = "camelCase")]
    UpdateWaitingClients {
        waiting_client_list: IndexMap<String, String>,
        client_id_left: String,
    },
    #[serde(rename_all = "camelCase")]
    NewHost { name: String, host_id: String },
    /// `client_volumes` is null on silence
    #[serde(rename_all = "camelCase")]
    ActiveSpeaker {
        client_volumes: Option<HashMap<String, i8>>,
        clients: Vec<String>,
    },
    Admitted,
    Declined,
}

impl ServerMessage {
    pub fn reply(request_id: Option<u64>, body: ReplyBody) -> Self {
        ServerMessage::Reply(Reply { request_id, body })
    }

    pub fn error(request_id: Option<u64>, err: &crate::error::Error) -> Self {
        ServerMessage::Error {
            request_id,
            kind: err.kind(),
            message: err.to_string(),
        }
    }

    pub fn new_producers<I: IntoIterator<Item = String>>(ids: I) -> Self {
        ServerMessage::NewProducers(
            ids.into_iter()
                .map(|producer_id| ProducerRef { producer_id })
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_join_with_correlation_id() {
        let envelope = ClientEnvelope::parse(
            r#"{"requestId":7,"event":"join","data":{"roomId":"r1","clientName":"Ann","youtubeID":"abc","roomType":"private"}}"#,
        )
        .unwrap();
        assert_eq!(envelope.request_id, Some(7));
        assert_eq!(
            envelope.message,
            ClientMessage::Join {
                room_id: "r1".into(),
                client_name: "Ann".into(),
                youtube_id: Some("abc".into()),
                room_type: RoomType::Gated,
            }
        );
    }

    #[test]
    fn parses_events_without_data() {
        let envelope = ClientEnvelope::parse(r#"{"event":"getProducers"}"#).unwrap();
        assert_eq!(envelope.request_id, None);
        assert_eq!(envelope.message, ClientMessage::GetProducers);

        let envelope = ClientEnvelope::parse(r#"{"event":"mute","data":{}}"#).unwrap();
        assert_eq!(envelope.message, ClientMessage::Mute { id: None });
    }

    #[test]
    fn parses_scalar_payloads() {
        let envelope = ClientEnvelope::parse(r#"{"event":"deletePlaylistItem","data":2}"#).unwrap();
        assert_eq!(envelope.message, ClientMessage::DeletePlaylistItem(2));

        let envelope = ClientEnvelope::parse(r#"{"event":"newMessage","data":"hi"}"#).unwrap();
        assert_eq!(envelope.message, ClientMessage::NewMessage("hi".into()));
    }

    #[test]
    fn keeps_request_id_on_bad_payload() {
        let err = ClientEnvelope::parse(r#"{"requestId":3,"event":"changeVideo","data":"x"}"#).unwrap_err();
        assert_eq!(err.request_id, Some(3));

        let err = ClientEnvelope::parse(r#"{"requestId":4,"event":"teleport"}"#).unwrap_err();
        assert_eq!(err.request_id, Some(4));

        let err = ClientEnvelope::parse("not json").unwrap_err();
        assert_eq!(err.request_id, None);
    }

    #[test]
    fn serializes_reply_and_error() {
        let reply = ServerMessage::reply(Some(5), ReplyBody::ProducerCreated { producer_id: "p1".into() });
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"event": "reply", "data": {"requestId": 5, "type": "producerCreated", "producerId": "p1"}})
        );

        let err = crate::error::Error::Incompatible("opus".into());
        assert_eq!(
            serde_json::to_value(ServerMessage::error(Some(6), &err)).unwrap(),
            json!({"event": "error", "data": {"requestId": 6, "kind": "incompatible", "message": "Incompatible: opus"}})
        );
    }

    #[test]
    fn serializes_notifications() {
        let line = ServerMessage::NotifyClient(Notification::system("c1", "Ann entered"));
        assert_eq!(
            serde_json::to_value(&line).unwrap(),
            json!({"event": "notifyClient", "data": {
                "notification": "clientMessage", "client": null, "clientId": "c1", "message": "Ann entered"
            }})
        );

        let change = ServerMessage::NotifyClient(Notification::ChangeVideo {
            details: VideoDetails { youtube_id: Some("v1".into()) },
        });
        assert_eq!(
            serde_json::to_value(&change).unwrap(),
            json!({"event": "notifyClient", "data": {"notification": "CHANGE_VIDEO", "details": {"youtubeID": "v1"}}})
        );
    }

    #[test]
    fn serializes_speaker_and_unit_events() {
        let silence = ServerMessage::ActiveSpeaker {
            client_volumes: None,
            clients: vec!["a".into()],
        };
        assert_eq!(
            serde_json::to_value(&silence).unwrap(),
            json!({"event": "activeSpeaker", "data": {"clientVolumes": null, "clients": ["a"]}})
        );
        assert_eq!(serde_json::to_value(ServerMessage::Declined).unwrap(), json!({"event": "declined"}));
        assert_eq!(
            serde_json::to_value(ServerMessage::new_producers(["p1".to_string()])).unwrap(),
            json!({"event": "newProducers", "data": [{"producerId": "p1"}]})
        );
    }
}
