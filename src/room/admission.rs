#![forbid(unsafe_code)]

// Waiting-room admission for gated rooms and host hand-over

use super::{Client, HostChange, RoomRegistry};
use crate::error::{Error, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// A member's answer to a waiting client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitingVerdict {
    Accept,
    Decline,
}

/// What happens to a connection that asked to enter a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryDecision {
    /// The connection may join right away
    Admit,
    /// The connection was parked; the host has to be told
    Waiting {
        room_id: String,
        host_id: Option<String>,
        waiting_clients: IndexMap<String, String>,
    },
}

/// A waiting client that has been accepted or declined
#[derive(Debug, Clone)]
pub struct WaitingResolution {
    pub room_id: String,
    pub client_id: String,
    pub name: String,
    pub verdict: WaitingVerdict,
    pub waiting_clients: IndexMap<String, String>,
}

/// A waiting client that went away before being answered
#[derive(Debug, Clone)]
pub struct WaitingDeparture {
    pub room_id: String,
    pub host_id: Option<String>,
    pub waiting_clients: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostMigration {
    Unchanged,
    /// The new host inherits the current waiting list
    Promoted {
        new_host: Client,
        waiting_clients: IndexMap<String, String>,
    },
    Vacated,
}

/// Gatekeeper for gated rooms
pub struct AdmissionController {
    registry: Arc<RoomRegistry>,
}

impl AdmissionController {
    pub fn new(registry: Arc<RoomRegistry>) -> Self {
        Self { registry }
    }

    /// Decides whether `conn_id` may join `room_id` directly. Missing and open
    /// rooms admit immediately; gated rooms park the connection.
    pub async fn request_entry(&self, conn_id: &str, room_id: &str, name: &str) -> Result<EntryDecision> {
        let room = match self.registry.get_room(room_id).await {
            Ok(room) => room,
            Err(Error::NotFound(_)) => return Ok(EntryDecision::Admit),
            Err(e) => return Err(e),
        };
        if !room.is_gated() || room.is_member(conn_id) {
            return Ok(EntryDecision::Admit);
        }

        let room = match self.registry.add_waiting(room_id, conn_id, name).await {
            Ok(room) => room,
            // closed between the two reads
            Err(Error::NotFound(_)) => return Ok(EntryDecision::Admit),
            Err(e) => return Err(e),
        };
        info!("Connection {} ({}) is waiting to enter room {}", conn_id, name, room_id);

        Ok(EntryDecision::Waiting {
            room_id: room.id,
            host_id: room.host_id,
            waiting_clients: room.waiting_clients,
        })
    }

    /// Applies a member's answer to a waiting connection. The responder must
    /// belong to the room the connection is waiting for.
    pub async fn respond(
        &self,
        responder_id: &str,
        waiting_id: &str,
        verdict: WaitingVerdict,
    ) -> Result<WaitingResolution> {
        let room_id = self
            .registry
            .waiting_room_of(waiting_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("waiting client {waiting_id}")))?;

        let room = self.registry.get_room(&room_id).await?;
        if !room.is_member(responder_id) {
            return Err(Error::InvalidState(format!(
                "{responder_id} is not a member of room {room_id}"
            )));
        }

        let (room, name) = self
            .registry
            .remove_waiting(waiting_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("waiting client {waiting_id}")))?;

        info!("{} answered {:?} for {} ({}) in room {}", responder_id, verdict, waiting_id, name, room_id);
        Ok(WaitingResolution {
            room_id,
            client_id: waiting_id.to_string(),
            name,
            verdict,
            waiting_clients: room.waiting_clients,
        })
    }

    /// Drops a disconnected connection from whichever waiting list holds it
    pub async fn leave_waiting(&self, conn_id: &str) -> Result<Option<WaitingDeparture>> {
        Ok(self
            .registry
            .remove_waiting(conn_id)
            .await?
            .map(|(room, _)| WaitingDeparture {
                room_id: room.id,
                host_id: room.host_id,
                waiting_clients: room.waiting_clients,
            }))
    }

    /// Moves the host role off a departing client
    pub async fn migrate_host(&self, room_id: &str, departing: &str) -> Result<HostMigration> {
        match self.registry.promote_host(room_id, departing).await? {
            HostChange::Unchanged => Ok(HostMigration::Unchanged),
            HostChange::Vacated => Ok(HostMigration::Vacated),
            HostChange::Promoted(new_host) => {
                let waiting_clients = self.registry.get_room(room_id).await?.waiting_clients;
                Ok(HostMigration::Promoted {
                    new_host,
                    waiting_clients,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomType;
    use crate::store::MemoryStore;

    async fn setup(room_type: RoomType) -> (Arc<RoomRegistry>, AdmissionController) {
        let registry = Arc::new(RoomRegistry::new(Arc::new(MemoryStore::new())));
        registry.create_room_if_absent("r1", None, room_type).await.unwrap();
        registry.add_client("r1", "host", "Hana").await.unwrap();
        let admission = AdmissionController::new(registry.clone());
        (registry, admission)
    }

    #[tokio::test]
    async fn missing_and_open_rooms_admit() {
        let (_, admission) = setup(RoomType::Open).await;
        assert_eq!(admission.request_entry("c1", "r1", "Cy").await.unwrap(), EntryDecision::Admit);
        assert_eq!(admission.request_entry("c1", "nope", "Cy").await.unwrap(), EntryDecision::Admit);
    }

    #[tokio::test]
    async fn gated_room_parks_connection() {
        let (registry, admission) = setup(RoomType::Gated).await;
        match admission.request_entry("c1", "r1", "Cy").await.unwrap() {
            EntryDecision::Waiting { host_id, waiting_clients, .. } => {
                assert_eq!(host_id.as_deref(), Some("host"));
                assert_eq!(waiting_clients.get("c1").map(String::as_str), Some("Cy"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!registry.get_room("r1").await.unwrap().is_member("c1"));
    }

    #[tokio::test]
    async fn only_members_may_answer() {
        let (_, admission) = setup(RoomType::Gated).await;
        admission.request_entry("c1", "r1", "Cy").await.unwrap();

        let err = admission.respond("stranger", "c1", WaitingVerdict::Accept).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));

        let resolution = admission.respond("host", "c1", WaitingVerdict::Decline).await.unwrap();
        assert_eq!(resolution.name, "Cy");
        assert_eq!(resolution.verdict, WaitingVerdict::Decline);
        assert!(resolution.waiting_clients.is_empty());

        let err = admission.respond("host", "c1", WaitingVerdict::Accept).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn leaving_waiting_list_reports_host() {
        let (_, admission) = setup(RoomType::Gated).await;
        admission.request_entry("c1", "r1", "Cy").await.unwrap();
        admission.request_entry("c2", "r1", "Di").await.unwrap();

        let departure = admission.leave_waiting("c1").await.unwrap().unwrap();
        assert_eq!(departure.host_id.as_deref(), Some("host"));
        assert_eq!(departure.waiting_clients.keys().collect::<Vec<_>>(), vec!["c2"]);
        assert!(admission.leave_waiting("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn migrate_host_hands_over_waiting_list() {
        let (registry, admission) = setup(RoomType::Gated).await;
        registry.add_client("r1", "a", "Ada").await.unwrap();
        admission.request_entry("c1", "r1", "Cy").await.unwrap();

        match admission.migrate_host("r1", "host").await.unwrap() {
            HostMigration::Promoted { new_host, waiting_clients } => {
                assert_eq!(new_host.id, "a");
                assert!(waiting_clients.contains_key("c1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(admission.migrate_host("r1", "host").await.unwrap(), HostMigration::Unchanged);
    }
}
