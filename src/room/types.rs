#![forbid(unsafe_code)]

// Room records as persisted in the shared store

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Admission policy of a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RoomType {
    /// Anyone may join directly
    #[default]
    #[serde(rename = "public", alias = "open")]
    Open,
    /// Newcomers wait until a member accepts them
    #[serde(rename = "private", alias = "gated")]
    Gated,
}

/// Room member as shown in the roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_muted: bool,
}

impl Client {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            is_muted: false,
        }
    }
}

/// Authoritative room state.
///
/// `clients` is ordered by join time; the front of the list is the
/// longest-present member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub room_type: RoomType,
    #[serde(default)]
    pub video_id: Option<String>,
    #[serde(default)]
    pub playlist: Vec<String>,
    #[serde(default)]
    pub clients: Vec<Client>,
    /// Connection id -> display name, in arrival order
    #[serde(default)]
    pub waiting_clients: IndexMap<String, String>,
    /// Node whose media server hosts the room's router
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_node: Option<String>,
}

impl Room {
    pub fn new(id: impl Into<String>, video_id: Option<String>, room_type: RoomType) -> Self {
        Self {
            id: id.into(),
            host_id: None,
            room_type,
            video_id,
            playlist: Vec::new(),
            clients: Vec::new(),
            waiting_clients: IndexMap::new(),
            media_node: None,
        }
    }

    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.iter().find(|c| c.id == client_id)
    }

    pub fn is_member(&self, client_id: &str) -> bool {
        self.client(client_id).is_some()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.clients.iter().map(|c| c.id.clone()).collect()
    }

    pub fn is_gated(&self) -> bool {
        self.room_type == RoomType::Gated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_type_uses_wire_names() {
        assert_eq!(serde_json::to_string(&RoomType::Gated).unwrap(), "\"private\"");
        assert_eq!(serde_json::to_string(&RoomType::Open).unwrap(), "\"public\"");
        let parsed: RoomType = serde_json::from_str("\"gated\"").unwrap();
        assert_eq!(parsed, RoomType::Gated);
    }

    #[test]
    fn room_record_tolerates_missing_fields() {
        let room: Room = serde_json::from_str(r#"{"id":"r1"}"#).unwrap();
        assert_eq!(room.room_type, RoomType::Open);
        assert!(room.clients.is_empty());
        assert!(room.host_id.is_none());
        assert!(room.media_node.is_none());
    }
}
