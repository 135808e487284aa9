use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::peer::{Peer, PeerId};
use crate::rpc::ApiError;
use crate::server::Server;
use crate::track::{NowPlaying, Track};
use crate::util::{now_millis, now_secs};

pub type RoomId = String;

/// How many peers can be enrolled in the rotation at once.
pub const MAX_DJS: usize = 5;

/// How long a skip warning stays reversible before the track is ended.
pub const SKIP_GRACE: Duration = Duration::from_secs(5);

/// How long an empty room lingers before it is removed.
pub const REMOVAL_DELAY: Duration = Duration::from_secs(45);

/// How far into the future a published track starts, giving clients
/// time to begin buffering.
pub const PLAYBACK_LEAD_SECS: i64 = 5;

/// Minimum fraction of the room that must have voted for a skip to be
/// considered at all.
pub const SKIP_QUORUM: f64 = 0.30;

/// Minimum fraction of downvotes among cast votes for a skip.
pub const SKIP_DOWN_SHARE: f64 = 0.50;

/// A room: the rotation of djs taking turns to play tracks, the peers
/// listening to them, and the vote-and-skip protocol around it all.
pub struct Room {
    pub id: RoomId,
    name: String,
    admin_id: PeerId,

    server: Weak<Server>,
    state: Mutex<RoomState>,

    skip_timer: Mutex<Option<JoinHandle<()>>>,
    removal_timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct RoomState {
    peers: Vec<Arc<Peer>>,
    djs: Vec<Arc<Peer>>,
    active_dj: Option<Arc<Peer>>,
    /// Position the active dj held in `djs` when it was set. Keeps the
    /// rotation anchored when the active dj is spliced out mid-track.
    active_index: usize,
    admin: Option<Arc<Peer>>,
    now_playing: Option<NowPlaying>,
    on_deck: Option<Track>,
    skip_warning: bool,
}

impl RoomState {
    /// The dj who plays after the active one: the head of the rotation
    /// when nothing is active, the successor in cyclic order otherwise.
    fn next_dj(&self) -> Option<Arc<Peer>> {
        if self.djs.is_empty() {
            return None;
        }

        let Some(active) = &self.active_dj else {
            return self.djs.first().cloned();
        };

        match self.djs.iter().position(|d| d.is(active)) {
            Some(index) => self.djs.get((index + 1) % self.djs.len()).cloned(),
            // The active dj left the rotation; whoever slid into its
            // slot is next.
            None => self.djs.get(self.active_index % self.djs.len()).cloned(),
        }
    }

    fn roster(&self) -> Vec<Value> {
        self.peers.iter().map(|p| p.summary()).collect()
    }

    fn dj_list(&self) -> Vec<Value> {
        self.djs.iter().map(|d| d.summary()).collect()
    }
}

impl Room {
    pub fn new(server: &Arc<Server>, name: String, admin_id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            name,
            admin_id,
            server: Arc::downgrade(server),
            state: Default::default(),
            skip_timer: Default::default(),
            removal_timer: Default::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The abridged shape pushed with the server-wide rooms list.
    pub fn summary(&self) -> Value {
        let state = self.state.lock();

        json!({
            "id": self.id,
            "name": self.name,
            "adminId": self.admin_id,
            "peerCount": state.peers.len(),
            "nowPlaying": state.now_playing,
        })
    }

    /// The full shape returned to a peer entering the room.
    pub fn serialize_full(&self) -> Value {
        let state = self.state.lock();

        json!({
            "id": self.id,
            "name": self.name,
            "adminId": self.admin_id,
            "peers": state.roster(),
            "djs": state.dj_list(),
            "activeDj": state.active_dj.as_ref().and_then(|d| d.id()),
            "nowPlaying": state.now_playing,
            "onDeck": state.on_deck,
        })
    }

    pub fn is_active_dj(&self, peer: &Peer) -> bool {
        let state = self.state.lock();
        state.active_dj.as_ref().map(|a| a.is(peer)).unwrap_or(false)
    }

    pub fn next_dj_is(&self, peer: &Peer) -> bool {
        let state = self.state.lock();
        state.next_dj().map(|n| n.is(peer)).unwrap_or(false)
    }

    pub fn has_peer(&self, peer: &Peer) -> bool {
        self.state.lock().peers.iter().any(|p| p.is(peer))
    }

    /// Adds a peer to the roster and catches them up on the booth.
    pub fn add_peer(self: &Arc<Self>, peer: Arc<Peer>) {
        self.cancel_removal_timer();

        {
            let state = &mut *self.state.lock();

            if !state.peers.iter().any(|p| p.is(&peer)) {
                state.peers.push(peer.clone());
            }

            if peer.id().as_deref() == Some(self.admin_id.as_str()) {
                state.admin = Some(peer.clone());
            }

            self.broadcast(state, "setPeers", json!({ "peers": state.roster() }), Some(&peer));

            peer.send("setDjs", json!({ "djs": state.dj_list() }));
            peer.send(
                "setActiveDj",
                json!({ "djId": state.active_dj.as_ref().and_then(|d| d.id()) }),
            );

            if let Some(now_playing) = &state.now_playing {
                peer.send("playTrack", json!(now_playing));
            }

            if let Some(on_deck) = &state.on_deck {
                peer.send("setOnDeck", json!({ "track": on_deck }));
            }
        }

        self.update_server_rooms();

        info!("Peer {} entered room {}", peer.label(), self.name);
    }

    /// Removes a peer from the roster and the rotation, ending their
    /// track if one was playing. Schedules removal when the room
    /// empties out.
    pub async fn remove_peer(self: &Arc<Self>, peer: &Arc<Peer>) {
        {
            let state = &mut *self.state.lock();

            state.peers.retain(|p| !p.is(peer));

            if state.admin.as_ref().map(|a| a.is(peer)).unwrap_or(false) {
                state.admin = None;
            }
        }

        self.remove_dj(peer).await;

        let empty = {
            let state = &*self.state.lock();
            self.broadcast(state, "setPeers", json!({ "peers": state.roster() }), None);
            state.peers.is_empty()
        };

        self.update_server_rooms();

        if empty {
            self.start_removal_timer();
        }

        info!("Peer {} left room {}", peer.label(), self.name);
    }

    /// Enrolls a peer in the rotation. The first dj starts playback,
    /// and a dj who lands in the next slot is asked to prefetch.
    pub async fn add_dj(self: &Arc<Self>, peer: &Arc<Peer>) -> Result<(), ApiError> {
        let (first, next) = {
            let state = &mut *self.state.lock();

            if state.djs.iter().any(|d| d.is(peer)) {
                return Err(ApiError::AlreadyDj);
            }

            if state.djs.len() >= MAX_DJS {
                return Err(ApiError::TooManyDjs);
            }

            state.djs.push(peer.clone());
            self.broadcast(state, "setDjs", json!({ "djs": state.dj_list() }), None);

            let first = state.djs.len() == 1;
            let next = state.next_dj().map(|n| n.is(peer)).unwrap_or(false);

            (first, next)
        };

        if first {
            self.spin_dj().await;
        } else if next {
            self.spawn_fetch_on_deck();
        }

        Ok(())
    }

    /// Drops a peer from the rotation. Returns false if they were not
    /// in it.
    pub async fn remove_dj(self: &Arc<Self>, peer: &Arc<Peer>) -> bool {
        let (was_active, refresh_on_deck) = {
            let state = &mut *self.state.lock();

            if !state.djs.iter().any(|d| d.is(peer)) {
                return false;
            }

            let was_active = state.active_dj.as_ref().map(|a| a.is(peer)).unwrap_or(false);
            let refresh_on_deck = state.next_dj().map(|n| n.is(peer)).unwrap_or(false);

            state.djs.retain(|d| !d.is(peer));
            self.broadcast(state, "setDjs", json!({ "djs": state.dj_list() }), None);

            (was_active, refresh_on_deck)
        };

        if was_active {
            let ended = self.end_track().await;

            // Nothing was playing, so nothing advanced the rotation;
            // the active slot must not keep pointing at the leaver.
            if !ended {
                let state = &mut *self.state.lock();
                if state.active_dj.as_ref().map(|a| a.is(peer)).unwrap_or(false) {
                    self.set_active_dj(state, None);
                }
            }

            return true;
        }

        let should_refresh = {
            let state = &mut *self.state.lock();

            if state.djs.is_empty() {
                self.clear_on_deck(state);
                false
            } else {
                refresh_on_deck
            }
        };

        if should_refresh {
            self.spawn_fetch_on_deck();
        }

        true
    }

    /// Advances the rotation and publishes the next track.
    pub async fn spin_dj(self: &Arc<Self>) {
        let (dj, staged) = {
            let state = &mut *self.state.lock();

            let dj = state.next_dj();
            self.set_active_dj(state, dj.clone());

            let Some(dj) = dj else {
                self.clear_on_deck(state);
                return;
            };

            (dj, state.on_deck.take())
        };

        let (track, fresh) = match staged {
            Some(staged) => (Some(staged), false),
            None => (self.request_track(&dj).await, true),
        };

        let Some(server) = self.server.upgrade() else { return };

        {
            let state = &mut *self.state.lock();

            let still_active = state.active_dj.as_ref().map(|a| a.is(&dj)).unwrap_or(false);
            let still_enrolled = state.djs.iter().any(|d| d.is(&dj));

            if !server.has_room(&self.id) || !still_active || !still_enrolled {
                // The rotation moved while the dj was answering. A track
                // taken off the deck is already in the registry.
                if let (Some(track), false) = (&track, fresh) {
                    server.tracks.remove(&track.id);
                }

                return;
            }

            let Some(track) = track else {
                warn!(
                    "Dj {} provided no track, playback stalls in room {}",
                    dj.label(),
                    self.name
                );
                return;
            };

            if fresh {
                server.tracks.put(track.clone());
            }

            let now_playing = NowPlaying {
                track: track.stripped(),
                votes: HashMap::new(),
                started_at: now_secs() + PLAYBACK_LEAD_SECS,
            };

            let params = serde_json::to_value(&now_playing).expect("now playing is serializable");
            self.broadcast(state, "playTrack", params, None);
            state.now_playing = Some(now_playing);
        }

        self.update_server_rooms();

        dj.send("cycleSelectedQueue", json!({}));

        self.spawn_fetch_on_deck();
    }

    /// Prefetches a track from the next dj without blocking playback.
    pub async fn fetch_on_deck(self: Arc<Self>) {
        let target = {
            let Some(server) = self.server.upgrade() else { return };
            let state = &mut *self.state.lock();

            if let Some(displaced) = state.on_deck.take() {
                server.tracks.remove(&displaced.id);
            }

            match state.next_dj() {
                Some(target) => target,
                None => return,
            }
        };

        let Some(track) = self.request_track(&target).await else { return };

        let Some(server) = self.server.upgrade() else { return };
        let state = &mut *self.state.lock();

        // The rotation may have moved while the dj was answering; a
        // stale reply is discarded without touching the registry.
        let still_next = state.next_dj().map(|n| n.is(&target)).unwrap_or(false);

        if !server.has_room(&self.id) || !still_next {
            return;
        }

        server.tracks.put(track.clone());

        let stripped = track.stripped();
        state.on_deck = Some(stripped.clone());
        self.broadcast(state, "setOnDeck", json!({ "track": stripped }), None);
    }

    pub fn spawn_fetch_on_deck(self: &Arc<Self>) {
        tokio::spawn(self.clone().fetch_on_deck());
    }

    /// Ends the current track and advances the rotation. Returns false
    /// when nothing was playing.
    pub async fn end_track(self: &Arc<Self>) -> bool {
        {
            let state = &mut *self.state.lock();

            let Some(now_playing) = state.now_playing.take() else {
                return false;
            };

            if let Some(server) = self.server.upgrade() {
                server.tracks.remove(&now_playing.track.id);
            }

            self.cancel_skip_timer(state);

            self.broadcast(state, "stopTrack", json!({}), None);
            self.broadcast(state, "setActiveDj", json!({ "djId": Value::Null }), None);
        }

        self.update_server_rooms();
        self.spin_dj().await;

        true
    }

    /// Records a vote and evaluates the skip predicate.
    pub fn set_vote(self: &Arc<Self>, peer_id: &str, down: bool) -> Result<(), ApiError> {
        let state = &mut *self.state.lock();

        let votes = {
            let Some(now_playing) = state.now_playing.as_mut() else {
                return Err(ApiError::NoSongPlaying);
            };

            now_playing.votes.insert(peer_id.to_string(), down);
            now_playing.votes.clone()
        };

        self.broadcast(state, "setVotes", json!({ "votes": votes }), None);

        let downs = votes.values().filter(|&&down| down).count() as f64;
        let total = votes.len() as f64;

        if total == 0.0 || state.peers.is_empty() {
            return Ok(());
        }

        let quorum = total / state.peers.len() as f64;
        let down_share = downs / total;
        let should_skip = quorum >= SKIP_QUORUM && down_share >= SKIP_DOWN_SHARE;

        if should_skip && !state.skip_warning {
            state.skip_warning = true;
            self.broadcast(state, "setSkipWarning", json!({ "value": true }), None);
            self.start_skip_timer();
        } else if !should_skip && state.skip_warning {
            self.cancel_skip_timer(state);
        }

        Ok(())
    }

    /// Broadcasts a chat message to the room.
    pub fn send_chat(&self, sender: &str, message: &str) {
        let state = &*self.state.lock();

        self.broadcast(
            state,
            "newChatMsg",
            json!({
                "id": Uuid::new_v4().to_string(),
                "message": message,
                "senderId": sender,
                "timestamp": now_millis(),
            }),
            None,
        );
    }

    pub fn broadcast_profile(&self, peer: &Peer) {
        let state = &*self.state.lock();

        self.broadcast(
            state,
            "setPeerProfile",
            json!({ "peerId": peer.id(), "profile": peer.profile() }),
            None,
        );
    }

    /// Evicts this room's registry entries. Called when the room is
    /// removed from the server.
    pub fn evict_tracks(&self, server: &Server) {
        let state = &*self.state.lock();

        if let Some(now_playing) = &state.now_playing {
            server.tracks.remove(&now_playing.track.id);
        }

        if let Some(on_deck) = &state.on_deck {
            server.tracks.remove(&on_deck.id);
        }
    }

    async fn request_track(&self, dj: &Arc<Peer>) -> Option<Track> {
        let server = self.server.upgrade()?;

        match dj.call("requestTrack", json!({})).await {
            Ok(reply) => Track::from_reply(reply, &server.url),
            Err(err) => {
                warn!("requestTrack to dj {} failed: {}", dj.label(), err);
                None
            }
        }
    }

    fn set_active_dj(&self, state: &mut RoomState, dj: Option<Arc<Peer>>) {
        state.active_index = dj
            .as_ref()
            .and_then(|dj| state.djs.iter().position(|d| d.is(dj)))
            .unwrap_or(0);

        let dj_id = dj.as_ref().and_then(|d| d.id());
        state.active_dj = dj;

        self.broadcast(state, "setActiveDj", json!({ "djId": dj_id }), None);
    }

    fn clear_on_deck(&self, state: &mut RoomState) {
        if let Some(track) = state.on_deck.take() {
            if let Some(server) = self.server.upgrade() {
                server.tracks.remove(&track.id);
            }

            self.broadcast(state, "setOnDeck", json!({ "track": Value::Null }), None);
        }
    }

    fn broadcast(&self, state: &RoomState, name: &str, params: Value, exclude: Option<&Arc<Peer>>) {
        for peer in &state.peers {
            if exclude.map(|e| e.is(peer)).unwrap_or(false) {
                continue;
            }

            peer.send(name, params.clone());
        }
    }

    fn update_server_rooms(&self) {
        if let Some(server) = self.server.upgrade() {
            server.broadcast_rooms();
        }
    }

    fn start_skip_timer(self: &Arc<Self>) {
        let room = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(SKIP_GRACE).await;

            let Some(room) = room.upgrade() else { return };

            {
                let state = &mut *room.state.lock();
                state.skip_warning = false;
                room.broadcast(state, "setSkipWarning", json!({ "value": false }), None);
            }

            *room.skip_timer.lock() = None;

            room.end_track().await;
        });

        *self.skip_timer.lock() = Some(handle);
    }

    /// Clears the warning and its pending timer, if any.
    fn cancel_skip_timer(&self, state: &mut RoomState) {
        if let Some(timer) = self.skip_timer.lock().take() {
            timer.abort();
        }

        if state.skip_warning {
            state.skip_warning = false;
            self.broadcast(state, "setSkipWarning", json!({ "value": false }), None);
        }
    }

    fn start_removal_timer(self: &Arc<Self>) {
        let room = Arc::downgrade(self);

        let handle = tokio::spawn(async move {
            tokio::time::sleep(REMOVAL_DELAY).await;

            let Some(room) = room.upgrade() else { return };
            let still_empty = room.state.lock().peers.is_empty();

            if still_empty {
                if let Some(server) = room.server.upgrade() {
                    server.remove_room(&room.id);
                }
            }
        });

        let mut slot = self.removal_timer.lock();

        if let Some(previous) = slot.take() {
            previous.abort();
        }

        *slot = Some(handle);
    }

    fn cancel_removal_timer(&self) {
        if let Some(timer) = self.removal_timer.lock().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
impl Room {
    pub fn dj_ids(&self) -> Vec<String> {
        self.state.lock().djs.iter().filter_map(|d| d.id()).collect()
    }

    pub fn active_dj_id(&self) -> Option<String> {
        self.state.lock().active_dj.as_ref().and_then(|d| d.id())
    }

    pub fn now_playing_track_id(&self) -> Option<String> {
        self.state.lock().now_playing.as_ref().map(|n| n.track.id.clone())
    }

    pub fn on_deck_track_id(&self) -> Option<String> {
        self.state.lock().on_deck.as_ref().map(|t| t.id.clone())
    }

    pub fn skip_warning(&self) -> bool {
        self.state.lock().skip_warning
    }

    pub fn peer_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    pub fn admin_is_set(&self) -> bool {
        self.state.lock().admin.is_some()
    }
}
