#![forbid(unsafe_code)]

// Room module - shared room registry backed by the versioned key-value store

pub mod admission;
pub mod types;

pub use self::admission::{
    AdmissionController, EntryDecision, HostMigration, WaitingDeparture, WaitingResolution, WaitingVerdict,
};
pub use self::types::{Client, Room, RoomType};

use crate::error::{Error, Result};
use crate::playlist::PlaylistStore;
use crate::store::{KeyValueStore, StoreError};
use std::sync::Arc;
use tracing::{debug, info, warn};

const ROOM_KEY_PREFIX: &str = "watchparty:room:";
const CLIENT_KEY_PREFIX: &str = "watchparty:client:";
const WAITING_KEY_PREFIX: &str = "watchparty:waiting:";

/// Optimistic write attempts before a contended update is abandoned
const MAX_CAS_ATTEMPTS: usize = 16;

fn room_key(room_id: &str) -> String {
    format!("{ROOM_KEY_PREFIX}{room_id}")
}

fn client_key(client_id: &str) -> String {
    format!("{CLIENT_KEY_PREFIX}{client_id}")
}

fn waiting_key(conn_id: &str) -> String {
    format!("{WAITING_KEY_PREFIX}{conn_id}")
}

fn encode(key: &str, room: &Room) -> Result<String> {
    serde_json::to_string(room).map_err(|e| {
        Error::from(StoreError::Corrupt {
            key: key.to_string(),
            reason: e.to_string(),
        })
    })
}

fn room_not_found(room_id: &str) -> Error {
    Error::NotFound(format!("room {room_id}"))
}

/// Outcome of handing the host role on when a client leaves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostChange {
    /// The departing client was not the host
    Unchanged,
    /// The host role moved to this member
    Promoted(Client),
    /// Nobody is left to take over
    Vacated,
}

/// Authoritative room state shared by every gateway process.
///
/// Each room lives under one key. Mutations run as read-modify-write cycles
/// guarded by the store's version check; a cycle that loses a race reloads
/// and reapplies its change, so concurrent joins from different processes
/// never drop each other's roster entries.
pub struct RoomRegistry {
    store: Arc<dyn KeyValueStore>,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn load(&self, room_id: &str) -> Result<Option<(u64, Room)>> {
        let key = room_key(room_id);
        let Some(record) = self.store.get(&key).await? else {
            return Ok(None);
        };
        let room = serde_json::from_str(&record.value)
            .map_err(|e| Error::from(StoreError::Corrupt { key, reason: e.to_string() }))?;
        Ok(Some((record.version, room)))
    }

    /// Applies `mutate` to the current record and writes it back, retrying on
    /// version conflicts. An error from `mutate` aborts without writing.
    async fn update<T, F>(&self, room_id: &str, mut mutate: F) -> Result<(T, Room)>
    where
        F: FnMut(&mut Room) -> Result<T> + Send,
        T: Send,
    {
        let key = room_key(room_id);
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (version, mut room) = self.load(room_id).await?.ok_or_else(|| room_not_found(room_id))?;
            let outcome = mutate(&mut room)?;
            let value = encode(&key, &room)?;
            if self.store.compare_and_swap(&key, version, value).await? {
                return Ok((outcome, room));
            }
            debug!("Room {} changed during update (attempt {}), retrying", room_id, attempt);
        }
        warn!("Giving up on room {} after {} conflicting writes", room_id, MAX_CAS_ATTEMPTS);
        Err(Error::Unavailable(format!("room {room_id} is too contended to update")))
    }

    /// Unconditional write for the small index keys
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let version = self.store.get(key).await?.map_or(0, |v| v.version);
            if self.store.compare_and_swap(key, version, value.to_string()).await? {
                return Ok(());
            }
        }
        Err(Error::Unavailable(format!("key {key} is too contended to write")))
    }

    /// Returns the existing room, or creates it with the given initial video.
    /// The flag is `true` when this call created the room.
    pub async fn create_room_if_absent(
        &self,
        room_id: &str,
        video_id: Option<String>,
        room_type: RoomType,
    ) -> Result<(Room, bool)> {
        let key = room_key(room_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            if let Some((_, room)) = self.load(room_id).await? {
                return Ok((room, false));
            }
            let room = Room::new(room_id, video_id.clone(), room_type);
            if self.store.compare_and_swap(&key, 0, encode(&key, &room)?).await? {
                info!("Created {:?} room {}", room_type, room_id);
                return Ok((room, true));
            }
        }
        Err(Error::Unavailable(format!("room {room_id} could not be created")))
    }

    pub async fn get_room(&self, room_id: &str) -> Result<Room> {
        self.load(room_id)
            .await?
            .map(|(_, room)| room)
            .ok_or_else(|| room_not_found(room_id))
    }

    /// Adds a client to the roster (no-op if already present) and returns the
    /// updated roster. The first client of a host-less room becomes host.
    pub async fn add_client(&self, room_id: &str, client_id: &str, name: &str) -> Result<Vec<Client>> {
        let (_, room) = self
            .update(room_id, |room| {
                if !room.is_member(client_id) {
                    room.clients.push(Client::new(client_id, name));
                }
                if room.host_id.is_none() {
                    room.host_id = Some(client_id.to_string());
                }
                Ok(())
            })
            .await?;
        self.put(&client_key(client_id), room_id).await?;

        debug!("Client {} ({}) is in room {} ({} members)", client_id, name, room_id, room.clients.len());
        Ok(room.clients)
    }

    /// Removes a client and returns the remaining roster. Removing the last
    /// client deletes the room record; removing an absent client is a no-op.
    pub async fn remove_client(&self, room_id: &str, client_id: &str) -> Result<Vec<Client>> {
        let key = room_key(room_id);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some((version, mut room)) = self.load(room_id).await? else {
                self.store.delete(&client_key(client_id)).await?;
                return Ok(Vec::new());
            };

            let before = room.clients.len();
            room.clients.retain(|c| c.id != client_id);
            if room.clients.len() == before {
                return Ok(room.clients);
            }
            if room.host_id.as_deref() == Some(client_id) {
                room.host_id = room.clients.first().map(|c| c.id.clone());
            }

            let written = if room.clients.is_empty() {
                self.store.compare_and_delete(&key, version).await?
            } else {
                self.store.compare_and_swap(&key, version, encode(&key, &room)?).await?
            };
            if !written {
                continue;
            }

            self.store.delete(&client_key(client_id)).await?;
            if room.clients.is_empty() {
                for conn_id in room.waiting_clients.keys() {
                    self.store.delete(&waiting_key(conn_id)).await?;
                }
                info!("Room {} closed, last client {} left", room_id, client_id);
            }
            return Ok(room.clients);
        }
        Err(Error::Unavailable(format!("room {room_id} is too contended to update")))
    }

    /// Room the client currently belongs to
    pub async fn room_of(&self, client_id: &str) -> Result<String> {
        self.store
            .get(&client_key(client_id))
            .await?
            .map(|record| record.value)
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))
    }

    /// Resolves a client to its room and roster entry
    pub async fn membership(&self, client_id: &str) -> Result<(Room, Client)> {
        let room_id = self.room_of(client_id).await?;
        let room = self.get_room(&room_id).await?;
        let client = room
            .client(client_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("client {client_id}")))?;
        Ok((room, client))
    }

    pub async fn get_client(&self, client_id: &str) -> Result<Client> {
        self.membership(client_id).await.map(|(_, client)| client)
    }

    /// Pins the room's media to `node_id` unless another node holds it.
    /// Returns the room as stored, whose `media_node` names the owner.
    pub async fn pin_media(&self, room_id: &str, node_id: &str) -> Result<Room> {
        let (_, room) = self
            .update(room_id, |room| {
                if room.media_node.is_none() {
                    room.media_node = Some(node_id.to_string());
                }
                Ok(())
            })
            .await?;
        Ok(room)
    }

    pub async fn set_host(&self, room_id: &str, client_id: &str) -> Result<()> {
        self.update(room_id, |room| {
            if !room.is_member(client_id) {
                return Err(Error::NotFound(format!("client {client_id} in room {room_id}")));
            }
            room.host_id = Some(client_id.to_string());
            Ok(())
        })
        .await?;
        info!("Client {} is now host of room {}", client_id, room_id);
        Ok(())
    }

    /// Hands the host role to the longest-present remaining member if
    /// `departing` is the current host.
    pub async fn promote_host(&self, room_id: &str, departing: &str) -> Result<HostChange> {
        let (change, _) = self
            .update(room_id, |room| {
                if room.host_id.as_deref() != Some(departing) {
                    return Ok(HostChange::Unchanged);
                }
                match room.clients.iter().find(|c| c.id != departing).cloned() {
                    Some(successor) => {
                        room.host_id = Some(successor.id.clone());
                        Ok(HostChange::Promoted(successor))
                    }
                    None => Ok(HostChange::Vacated),
                }
            })
            .await?;
        if let HostChange::Promoted(successor) = &change {
            info!("Host of room {} moved from {} to {}", room_id, departing, successor.id);
        }
        Ok(change)
    }

    /// Flips the mute flag of a member; returns the member and the roster
    pub async fn toggle_mute(&self, client_id: &str, room_id: &str) -> Result<(Client, Vec<Client>)> {
        let (client, room) = self
            .update(room_id, |room| {
                let client = room
                    .clients
                    .iter_mut()
                    .find(|c| c.id == client_id)
                    .ok_or_else(|| Error::NotFound(format!("client {client_id} in room {room_id}")))?;
                client.is_muted = !client.is_muted;
                Ok(client.clone())
            })
            .await?;
        Ok((client, room.clients))
    }

    /// Parks a connection in a room's waiting list
    pub async fn add_waiting(&self, room_id: &str, conn_id: &str, name: &str) -> Result<Room> {
        let (_, room) = self
            .update(room_id, |room| {
                if room.is_member(conn_id) {
                    return Err(Error::InvalidState(format!("{conn_id} is already a member of {room_id}")));
                }
                room.waiting_clients.insert(conn_id.to_string(), name.to_string());
                Ok(())
            })
            .await?;
        self.put(&waiting_key(conn_id), room_id).await?;
        Ok(room)
    }

    /// Room whose waiting list holds this connection, if any
    pub async fn waiting_room_of(&self, conn_id: &str) -> Result<Option<String>> {
        Ok(self.store.get(&waiting_key(conn_id)).await?.map(|record| record.value))
    }

    /// Takes a connection out of its waiting list. Returns the updated room
    /// and the name it waited under, or `None` if it was not waiting.
    pub async fn remove_waiting(&self, conn_id: &str) -> Result<Option<(Room, String)>> {
        let Some(room_id) = self.waiting_room_of(conn_id).await? else {
            return Ok(None);
        };

        let removed = self
            .update(&room_id, |room| Ok(room.waiting_clients.shift_remove(conn_id)))
            .await;
        self.store.delete(&waiting_key(conn_id)).await?;

        match removed {
            Ok((Some(name), room)) => Ok(Some((room, name))),
            Ok((None, _)) | Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Runs a positional playlist edit and persists the resulting order
    async fn edit_playlist<T, F>(&self, room_id: &str, mut edit: F) -> Result<(T, Room)>
    where
        F: FnMut(&mut PlaylistStore) -> Result<T> + Send,
        T: Send,
    {
        self.update(room_id, |room| {
            let mut playlist = PlaylistStore::from_snapshot(room.playlist.iter().cloned());
            let outcome = edit(&mut playlist)?;
            room.playlist = playlist.snapshot_ids();
            Ok(outcome)
        })
        .await
    }

    pub async fn append_video(&self, room_id: &str, video_id: &str) -> Result<Vec<String>> {
        let (_, room) = self
            .edit_playlist(room_id, |playlist| {
                playlist.append(video_id);
                Ok(())
            })
            .await?;
        Ok(room.playlist)
    }

    pub async fn remove_video(&self, room_id: &str, index: usize) -> Result<Vec<String>> {
        let (removed, room) = self
            .edit_playlist(room_id, |playlist| playlist.remove_at(index))
            .await?;
        debug!("Removed {} from playlist of room {}", removed, room_id);
        Ok(room.playlist)
    }

    pub async fn move_video(&self, room_id: &str, old_index: usize, new_index: usize) -> Result<Vec<String>> {
        let (_, room) = self
            .edit_playlist(room_id, |playlist| playlist.move_to_index(old_index, new_index))
            .await?;
        Ok(room.playlist)
    }

    /// Makes the entry at `index` the current video; the playlist is unchanged
    pub async fn change_video(&self, room_id: &str, index: usize) -> Result<String> {
        let (video_id, _) = self
            .update(room_id, |room| {
                let playlist = PlaylistStore::from_snapshot(room.playlist.iter().cloned());
                let video_id = playlist.id_at(index)?.to_string();
                room.video_id = Some(video_id.clone());
                Ok(video_id)
            })
            .await?;
        Ok(video_id)
    }

    pub async fn playlist(&self, room_id: &str) -> Result<Vec<String>> {
        Ok(self.get_room(room_id).await?.playlist)
    }

    /// Deletes a room record together with every index entry pointing at it
    pub async fn close_room(&self, room_id: &str) -> Result<()> {
        let Some((_, room)) = self.load(room_id).await? else {
            return Ok(());
        };
        for client in &room.clients {
            self.store.delete(&client_key(&client.id)).await?;
        }
        for conn_id in room.waiting_clients.keys() {
            self.store.delete(&waiting_key(conn_id)).await?;
        }
        self.store.delete(&room_key(room_id)).await?;
        info!("Closed room {}", room_id);
        Ok(())
    }
}
