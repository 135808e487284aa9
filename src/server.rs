use std::sync::Arc;

use dashmap::DashMap;
use log::info;
use serde_json::{json, Value};

use crate::auth::Authenticator;
use crate::config::Config;
use crate::peer::{ConnectionId, Peer, PeerId};
use crate::rooms::{Room, RoomId};
use crate::session::Session;
use crate::track::TrackRegistry;

/// The directory of rooms and connected peers, the room factory, and
/// the holder of everything process-wide: the track registry and the
/// authenticator.
pub struct Server {
    pub id: String,
    pub name: String,
    /// Public websocket base clients connect to, bound into tokens.
    pub ws_url: String,
    /// Public HTTP base track urls are minted under.
    pub url: String,

    pub auth: Authenticator,
    pub tracks: TrackRegistry,

    rooms: DashMap<RoomId, Arc<Room>>,
    peers: DashMap<ConnectionId, Arc<Peer>>,
}

impl Server {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            id: config.server_id.clone(),
            name: config.server_name.clone(),
            ws_url: config.ws_url.clone(),
            url: config.url.clone(),
            auth: Authenticator::new(&config.jwt_secret, &config.ws_url, &config.server_name),
            tracks: Default::default(),
            rooms: Default::default(),
            peers: Default::default(),
        })
    }

    /// Wraps a fresh transport session in a peer and starts its
    /// authentication deadline.
    pub fn register(self: &Arc<Self>, session: Arc<dyn Session>) -> Arc<Peer> {
        let peer = Peer::new(self, session);
        self.peers.insert(peer.connection(), peer.clone());

        peer
    }

    pub fn remove_peer(&self, peer: &Peer) {
        self.peers.remove(&peer.connection());
    }

    pub fn create_room(self: &Arc<Self>, name: String, admin_id: PeerId) -> Arc<Room> {
        let room = Room::new(self, name, admin_id);
        self.rooms.insert(room.id.clone(), room.clone());

        info!("Room {} created", room.name());
        self.broadcast_rooms();

        room
    }

    pub fn room_by_id(&self, id: &str) -> Option<Arc<Room>> {
        self.rooms.get(id).map(|r| r.clone())
    }

    pub fn has_room(&self, id: &str) -> bool {
        self.rooms.contains_key(id)
    }

    /// Detaches a room from the directory, evicting its registry
    /// entries.
    pub fn remove_room(&self, id: &str) {
        if let Some((_, room)) = self.rooms.remove(id) {
            room.evict_tracks(self);

            info!("Room {} removed", room.name());
            self.broadcast_rooms();
        }
    }

    /// The abridged rooms list, ordered by name for stable replies.
    pub fn serialized_rooms(&self) -> Vec<Value> {
        let mut rooms: Vec<_> = self.rooms.iter().map(|r| r.summary()).collect();

        rooms.sort_by(|a, b| {
            let by_name = a["name"].as_str().cmp(&b["name"].as_str());
            by_name.then(a["id"].as_str().cmp(&b["id"].as_str()))
        });

        rooms
    }

    /// Pushes the abridged rooms list to every connected peer.
    pub fn broadcast_rooms(&self) {
        let rooms = self.serialized_rooms();

        for peer in self.peers.iter() {
            peer.send("setRooms", json!({ "rooms": rooms.clone() }));
        }
    }
}

#[cfg(test)]
impl Server {
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
