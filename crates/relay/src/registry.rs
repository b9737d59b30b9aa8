//! Connected-client and room bookkeeping.
//!
//! One registry instance sits behind a mutex in the server. All methods
//! are synchronous; dispatch locks, mutates, sends, unlocks.

use std::collections::{HashMap, HashSet};

use peerbeam_protocol::NetworkClient;
use tracing::debug;

use crate::client::ClientSender;

/// One connected client.
pub struct Client {
    pub info: NetworkClient,
    pub ip_group: String,
    /// The room this client created, if any.
    pub own_room: Option<String>,
    /// Every room the client currently occupies (own room included).
    pub rooms: HashSet<String>,
    pub sender: ClientSender,
}

/// One room. Occupancy never exceeds two: the owner plus at most one
/// requester or guest.
pub struct Room {
    pub owner: String,
    pub members: Vec<String>,
    /// Set once a request was accepted; the room is a busy session.
    pub established: bool,
}

#[derive(Default)]
pub struct Registry {
    clients: HashMap<String, Client>,
    rooms: HashMap<String, Room>,
    groups: HashMap<String, HashSet<String>>,
}

impl Registry {
    pub fn insert_client(&mut self, client: Client) {
        self.groups
            .entry(client.ip_group.clone())
            .or_default()
            .insert(client.info.id.clone());
        self.clients.insert(client.info.id.clone(), client);
    }

    /// Drops the client from the registry and its group. Room membership
    /// is left to the caller, which still needs the membership list to
    /// notify the other occupants.
    pub fn remove_client(&mut self, client_id: &str) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        if let Some(group) = self.groups.get_mut(&client.ip_group) {
            group.remove(client_id);
            if group.is_empty() {
                self.groups.remove(&client.ip_group);
            }
        }
        Some(client)
    }

    pub fn sender(&self, client_id: &str) -> Option<ClientSender> {
        self.clients.get(client_id).map(|c| c.sender.clone())
    }

    pub fn info(&self, client_id: &str) -> Option<NetworkClient> {
        self.clients.get(client_id).map(|c| c.info.clone())
    }

    pub fn ip_group_of(&self, client_id: &str) -> Option<String> {
        self.clients.get(client_id).map(|c| c.ip_group.clone())
    }

    pub fn own_room(&self, client_id: &str) -> Option<String> {
        self.clients.get(client_id).and_then(|c| c.own_room.clone())
    }

    /// Everyone in the group except `except`, as presence snapshots.
    pub fn group_clients(&self, group: &str, except: &str) -> Vec<NetworkClient> {
        self.members_of_group(group, except)
            .filter_map(|id| self.info(id))
            .collect()
    }

    pub fn group_senders(&self, group: &str, except: &str) -> Vec<ClientSender> {
        self.members_of_group(group, except)
            .filter_map(|id| self.sender(id))
            .collect()
    }

    fn members_of_group<'a>(
        &'a self,
        group: &str,
        except: &'a str,
    ) -> impl Iterator<Item = &'a String> {
        self.groups
            .get(group)
            .into_iter()
            .flatten()
            .filter(move |id| id.as_str() != except)
    }

    /// Claims a room id for `owner`. Fails if the id is taken.
    pub fn create_room(&mut self, room_id: &str, owner: &str) -> bool {
        if self.rooms.contains_key(room_id) {
            return false;
        }
        self.rooms.insert(
            room_id.to_string(),
            Room {
                owner: owner.to_string(),
                members: vec![owner.to_string()],
                established: false,
            },
        );
        if let Some(client) = self.clients.get_mut(owner) {
            client.own_room = Some(room_id.to_string());
            client.rooms.insert(room_id.to_string());
        }
        debug!(room_id, owner, "room created");
        true
    }

    pub fn room_exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    pub fn room_owner(&self, room_id: &str) -> Option<String> {
        self.rooms.get(room_id).map(|r| r.owner.clone())
    }

    pub fn member_count(&self, room_id: &str) -> usize {
        self.rooms.get(room_id).map_or(0, |r| r.members.len())
    }

    pub fn is_member(&self, room_id: &str, client_id: &str) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|r| r.members.iter().any(|m| m == client_id))
    }

    pub fn is_established(&self, room_id: &str) -> bool {
        self.rooms.get(room_id).is_some_and(|r| r.established)
    }

    pub fn set_established(&mut self, room_id: &str, established: bool) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.established = established;
        }
    }

    pub fn join_room(&mut self, room_id: &str, client_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            if !room.members.iter().any(|m| m == client_id) {
                room.members.push(client_id.to_string());
            }
        }
        if let Some(client) = self.clients.get_mut(client_id) {
            client.rooms.insert(room_id.to_string());
        }
    }

    pub fn leave_room(&mut self, room_id: &str, client_id: &str) {
        if let Some(room) = self.rooms.get_mut(room_id) {
            room.members.retain(|m| m != client_id);
        }
        if let Some(client) = self.clients.get_mut(client_id) {
            client.rooms.remove(room_id);
        }
    }

    /// Removes the room and clears it from every member's occupancy set.
    pub fn delete_room(&mut self, room_id: &str) {
        if let Some(room) = self.rooms.remove(room_id) {
            for member in room.members {
                if let Some(client) = self.clients.get_mut(&member) {
                    client.rooms.remove(room_id);
                    if client.own_room.as_deref() == Some(room_id) {
                        client.own_room = None;
                    }
                }
            }
            debug!(room_id, "room deleted");
        }
    }

    pub fn members(&self, room_id: &str) -> Vec<String> {
        self.rooms
            .get(room_id)
            .map(|r| r.members.clone())
            .unwrap_or_default()
    }

    /// Senders for the room's members; `except` filters one member out.
    pub fn member_senders(&self, room_id: &str, except: Option<&str>) -> Vec<ClientSender> {
        self.members(room_id)
            .iter()
            .filter(|id| except != Some(id.as_str()))
            .filter_map(|id| self.sender(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn client(id: &str, group: &str) -> Client {
        let (tx, _rx) = mpsc::channel(4);
        Client {
            info: NetworkClient {
                id: id.into(),
                name: format!("Alias {id}"),
                device_type: "desktop".into(),
                device_model: "Linux PC".into(),
            },
            ip_group: group.into(),
            own_room: None,
            rooms: HashSet::new(),
            sender: ClientSender::new(tx),
        }
    }

    #[test]
    fn group_snapshot_excludes_self() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "network_10.0.0.1"));
        registry.insert_client(client("b", "network_10.0.0.1"));
        registry.insert_client(client("c", "network_10.0.0.2"));

        let visible = registry.group_clients("network_10.0.0.1", "a");
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "b");
    }

    #[test]
    fn duplicate_room_id_is_refused() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "g"));
        registry.insert_client(client("b", "g"));

        assert!(registry.create_room("room_x", "a"));
        assert!(!registry.create_room("room_x", "b"));
        assert_eq!(registry.room_owner("room_x").as_deref(), Some("a"));
    }

    #[test]
    fn join_and_leave_track_membership_both_ways() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "g"));
        registry.insert_client(client("b", "g"));
        registry.create_room("room_x", "a");

        registry.join_room("room_x", "b");
        assert_eq!(registry.member_count("room_x"), 2);
        assert!(registry.is_member("room_x", "b"));

        registry.leave_room("room_x", "b");
        assert_eq!(registry.member_count("room_x"), 1);
        assert!(!registry.is_member("room_x", "b"));
        assert!(registry.clients.get("b").unwrap().rooms.is_empty());
    }

    #[test]
    fn join_is_idempotent() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "g"));
        registry.insert_client(client("b", "g"));
        registry.create_room("room_x", "a");

        registry.join_room("room_x", "b");
        registry.join_room("room_x", "b");
        assert_eq!(registry.member_count("room_x"), 2);
    }

    #[test]
    fn delete_room_clears_members() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "g"));
        registry.insert_client(client("b", "g"));
        registry.create_room("room_x", "a");
        registry.join_room("room_x", "b");

        registry.delete_room("room_x");
        assert!(!registry.room_exists("room_x"));
        assert!(registry.clients.get("a").unwrap().rooms.is_empty());
        assert_eq!(registry.own_room("a"), None);
        assert!(registry.clients.get("b").unwrap().rooms.is_empty());
    }

    #[test]
    fn remove_client_prunes_group() {
        let mut registry = Registry::default();
        registry.insert_client(client("a", "g"));
        let removed = registry.remove_client("a").unwrap();
        assert_eq!(removed.info.id, "a");
        assert!(registry.groups.is_empty());
        assert!(registry.remove_client("a").is_none());
    }
}
