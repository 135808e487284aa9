use std::fmt::{self, Display};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use log::info;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::rooms::Room;
use crate::rpc::{params, success, ApiError, RpcResult};
use crate::server::Server;
use crate::session::{IncomingRpc, Session, SessionError};

pub type PeerId = String;

/// Identifies one transport connection for the lifetime of the
/// process. Distinct from [PeerId], which only exists once a client
/// has authenticated and survives reconnects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static COUNTER: AtomicCell<u64> = AtomicCell::new(1);

        Self(COUNTER.fetch_add(1))
    }
}

impl Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How long a fresh connection gets to present a token before it is
/// dropped.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected client: owns the transport session, holds the peer's
/// identity and profile, forwards room-affecting calls to its current
/// room, and is the sink for everything the server pushes back out.
pub struct Peer {
    connection: ConnectionId,
    session: Arc<dyn Session>,
    server: Weak<Server>,

    id: Mutex<Option<PeerId>>,
    profile: Mutex<Option<Value>>,
    room: Mutex<Option<Weak<Room>>>,

    auth_timer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    jwt: String,
}

#[derive(Debug, Deserialize)]
struct CreateRoomParams {
    name: String,
}

#[derive(Debug, Deserialize)]
struct JoinRoomParams {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ChatParams {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ProfileParams {
    profile: Value,
}

#[derive(Debug, Deserialize)]
struct VoteParams {
    direction: VoteDirection,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum VoteDirection {
    Up,
    Down,
}

impl Peer {
    pub fn new(server: &Arc<Server>, session: Arc<dyn Session>) -> Arc<Self> {
        let peer = Arc::new(Self {
            connection: ConnectionId::next(),
            session,
            server: Arc::downgrade(server),
            id: Default::default(),
            profile: Default::default(),
            room: Default::default(),
            auth_timer: Default::default(),
        });

        let weak = Arc::downgrade(&peer);

        let timer = tokio::spawn(async move {
            tokio::time::sleep(AUTH_TIMEOUT).await;

            if let Some(peer) = weak.upgrade() {
                if peer.id().is_none() {
                    info!("Connection {} failed to authenticate in time", peer.connection);
                    peer.session.close();
                }
            }
        });

        *peer.auth_timer.lock() = Some(timer);

        peer
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn id(&self) -> Option<PeerId> {
        self.id.lock().clone()
    }

    pub fn profile(&self) -> Option<Value> {
        self.profile.lock().clone()
    }

    /// Two peers are the same when they share a connection.
    pub fn is(&self, other: &Peer) -> bool {
        self.connection == other.connection
    }

    /// A short name for logging.
    pub fn label(&self) -> String {
        self.id()
            .unwrap_or_else(|| format!("connection {}", self.connection))
    }

    /// The wire shape of this peer in rosters and dj lists.
    pub fn summary(&self) -> Value {
        json!({ "id": self.id(), "profile": self.profile() })
    }

    pub fn current_room(&self) -> Option<Arc<Room>> {
        self.room.lock().as_ref().and_then(|weak| weak.upgrade())
    }

    /// Pushes a server-originated message to this peer.
    pub fn send(&self, name: &str, params: Value) {
        self.session.send(name, params);
    }

    /// Invokes a method on this peer's client and awaits the reply.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, SessionError> {
        self.session.call(name, params).await
    }

    /// Handles one inbound RPC, turning any failure into the uniform
    /// error reply.
    pub async fn handle(self: &Arc<Self>, rpc: IncomingRpc) {
        let reply = match self.dispatch(&rpc.name, rpc.params).await {
            Ok(value) => value,
            Err(error) => error.to_reply(),
        };

        let _ = rpc.responder.send(reply);
    }

    /// Routes a call by name to its handler.
    pub async fn dispatch(self: &Arc<Self>, name: &str, raw: Value) -> RpcResult {
        match name {
            "join" => self.join(params(raw)?),
            "authenticate" => self.authenticate(params(raw)?),
            "fetchRooms" => self.fetch_rooms(),
            "createRoom" => self.create_room(params(raw)?),
            "joinRoom" => self.join_room(params(raw)?).await,
            "leaveRoom" => self.leave_room().await,
            "becomeDj" => self.become_dj().await,
            "stepDown" => self.step_down().await,
            "skipTurn" => self.skip_turn().await,
            "trackEnded" => self.track_ended().await,
            "updatedQueue" => self.updated_queue(),
            "sendChat" => self.send_chat(params(raw)?),
            "setProfile" => self.set_profile(params(raw)?),
            "vote" => self.vote(params(raw)?),
            _ => Err(ApiError::InvalidMethod),
        }
    }

    /// Tears this peer out of its room and the server directory.
    /// Called when the transport goes away, and never an error.
    pub async fn disconnect(self: &Arc<Self>) {
        self.cancel_auth_timer();

        if let Some(room) = self.current_room() {
            room.remove_peer(self).await;
        }

        *self.room.lock() = None;

        if let Some(server) = self.server.upgrade() {
            server.remove_peer(self);
        }

        info!("Peer {} disconnected", self.label());
    }

    fn join(&self, params: TokenParams) -> RpcResult {
        let server = self.server();

        let claims = server
            .auth
            .verify(&params.jwt)
            .map_err(|_| ApiError::InvalidToken)?;

        // A session token is not an invite
        if claims.i.is_some() {
            return Err(ApiError::InvalidToken);
        }

        let id = {
            let mut slot = self.id.lock();
            slot.get_or_insert_with(|| Uuid::new_v4().to_string()).clone()
        };

        self.cancel_auth_timer();

        let token = server.auth.sign_session(&id);

        info!("Peer {} joined the server", id);

        Ok(json!({ "token": token, "peerId": id }))
    }

    fn authenticate(&self, params: TokenParams) -> RpcResult {
        let server = self.server();

        let claims = server
            .auth
            .verify(&params.jwt)
            .map_err(|_| ApiError::InvalidToken)?;

        let embedded = claims.i.ok_or(ApiError::InvalidToken)?;

        // The id is immutable once assigned
        let id = {
            let mut slot = self.id.lock();
            slot.get_or_insert(embedded).clone()
        };

        self.cancel_auth_timer();

        Ok(json!({ "peerId": id }))
    }

    fn fetch_rooms(&self) -> RpcResult {
        Ok(Value::Array(self.server().serialized_rooms()))
    }

    fn create_room(self: &Arc<Self>, params: CreateRoomParams) -> RpcResult {
        if params.name.is_empty() {
            return Err(ApiError::EmptyName);
        }

        let admin_id = self.id().ok_or(ApiError::InvalidToken)?;
        let room = self.server().create_room(params.name, admin_id);

        Ok(room.summary())
    }

    async fn join_room(self: &Arc<Self>, params: JoinRoomParams) -> RpcResult {
        self.id().ok_or(ApiError::InvalidToken)?;

        let server = self.server();
        let room = server.room_by_id(&params.id).ok_or(ApiError::RoomNotFound)?;

        // A peer occupies one roster at a time
        if let Some(current) = self.current_room() {
            if current.id == room.id {
                return Ok(current.serialize_full());
            }

            *self.room.lock() = None;
            current.remove_peer(self).await;
        }

        *self.room.lock() = Some(Arc::downgrade(&room));
        room.add_peer(self.clone());

        Ok(room.serialize_full())
    }

    async fn leave_room(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        *self.room.lock() = None;
        room.remove_peer(self).await;

        Ok(success())
    }

    async fn become_dj(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        room.add_dj(self).await?;

        Ok(success())
    }

    async fn step_down(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        if !room.remove_dj(self).await {
            return Err(ApiError::NotDj);
        }

        Ok(success())
    }

    async fn skip_turn(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        if !room.is_active_dj(self) {
            return Err(ApiError::NotActiveDj);
        }

        room.end_track().await;

        Ok(success())
    }

    async fn track_ended(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        if !room.is_active_dj(self) {
            return Err(ApiError::NotActiveDj);
        }

        room.end_track().await;

        Ok(success())
    }

    fn updated_queue(self: &Arc<Self>) -> RpcResult {
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        // Silently idempotent for anyone who is not up next
        if room.next_dj_is(self) {
            room.spawn_fetch_on_deck();
        }

        Ok(success())
    }

    fn send_chat(&self, params: ChatParams) -> RpcResult {
        if params.message.is_empty() {
            return Err(ApiError::BlankMessage);
        }

        let sender = self.id().ok_or(ApiError::NotInRoom)?;
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        room.send_chat(&sender, &params.message);

        Ok(success())
    }

    fn set_profile(&self, params: ProfileParams) -> RpcResult {
        *self.profile.lock() = Some(params.profile);

        if let Some(room) = self.current_room() {
            room.broadcast_profile(self);
        }

        Ok(json!({ "success": true, "peerId": self.id() }))
    }

    fn vote(&self, params: VoteParams) -> RpcResult {
        let id = self.id().ok_or(ApiError::NotInRoom)?;
        let room = self.current_room().ok_or(ApiError::NotInRoom)?;

        room.set_vote(&id, matches!(params.direction, VoteDirection::Down))?;

        Ok(success())
    }

    fn server(&self) -> Arc<Server> {
        self.server.upgrade().expect("server outlives peers")
    }

    fn cancel_auth_timer(&self) {
        if let Some(timer) = self.auth_timer.lock().take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;

    use crate::config::Config;
    use crate::rpc::ApiError;
    use crate::server::Server;
    use crate::session::mock::MockSession;

    use super::{ConnectionId, Peer};

    fn test_server() -> Arc<Server> {
        Server::new(&Config::mock())
    }

    #[test]
    fn connection_ids_are_unique() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();

        assert_ne!(a, b);
    }

    async fn joined_peer(server: &Arc<Server>) -> (Arc<Peer>, Arc<MockSession>, String) {
        let session = MockSession::new();
        let peer = server.register(session.clone());

        let invite = server.auth.sign_invite();
        let reply = peer.dispatch("join", json!({ "jwt": invite })).await.unwrap();

        let token = reply["token"].as_str().unwrap().to_string();

        (peer, session, token)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_connections_are_closed_after_the_deadline() {
        let server = test_server();
        let session = MockSession::new();
        let _peer = server.register(session.clone());

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(session.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn joining_cancels_the_deadline() {
        let server = test_server();
        let (_peer, session, _) = joined_peer(&server).await;

        tokio::time::sleep(Duration::from_secs(6)).await;

        assert!(!session.is_closed());
    }

    #[tokio::test]
    async fn join_assigns_an_id_and_a_session_token() {
        let server = test_server();
        let (peer, _, token) = joined_peer(&server).await;

        let id = peer.id().unwrap();
        let claims = server.auth.verify(&token).unwrap();

        assert_eq!(claims.i.as_deref(), Some(id.as_str()));
    }

    #[tokio::test]
    async fn authenticate_restores_the_same_identity() {
        let server = test_server();
        let (peer, _, token) = joined_peer(&server).await;

        let reconnected = server.register(MockSession::new());
        let reply = reconnected
            .dispatch("authenticate", json!({ "jwt": token }))
            .await
            .unwrap();

        assert_eq!(reply["peerId"], json!(peer.id().unwrap()));
    }

    #[tokio::test]
    async fn join_rejects_bad_and_foreign_tokens() {
        let server = test_server();
        let peer = server.register(MockSession::new());

        let garbage = peer.dispatch("join", json!({ "jwt": "garbage" })).await;
        assert_eq!(garbage.unwrap_err(), ApiError::InvalidToken);

        // A session token does not open the front door
        let session_token = server.auth.sign_session("someone");
        let smuggled = peer.dispatch("join", json!({ "jwt": session_token })).await;
        assert_eq!(smuggled.unwrap_err(), ApiError::InvalidToken);

        assert_eq!(peer.id(), None);
    }

    #[tokio::test]
    async fn unknown_methods_are_rejected() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        let reply = peer.dispatch("scratchRecord", json!({})).await;

        assert_eq!(reply.unwrap_err(), ApiError::InvalidMethod);
        assert_eq!(
            ApiError::InvalidMethod.to_reply()["message"],
            "Invalid method name"
        );
    }

    #[tokio::test]
    async fn room_calls_require_a_room() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        for method in ["leaveRoom", "becomeDj", "stepDown", "skipTurn", "trackEnded"] {
            let reply = peer.dispatch(method, json!({})).await;
            assert_eq!(reply.unwrap_err(), ApiError::NotInRoom, "{method}");
        }

        let chat = peer.dispatch("sendChat", json!({ "message": "hey" })).await;
        assert_eq!(chat.unwrap_err(), ApiError::NotInRoom);
    }

    #[tokio::test]
    async fn create_room_validates_the_name() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        let reply = peer.dispatch("createRoom", json!({ "name": "" })).await;

        assert_eq!(reply.unwrap_err(), ApiError::EmptyName);
    }

    #[tokio::test]
    async fn blank_chat_messages_are_refused() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        let reply = peer.dispatch("sendChat", json!({ "message": "" })).await;

        assert_eq!(reply.unwrap_err(), ApiError::BlankMessage);
    }

    #[tokio::test]
    async fn the_last_profile_written_wins() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        peer.dispatch("setProfile", json!({ "profile": { "handle": "wax" } }))
            .await
            .unwrap();
        peer.dispatch("setProfile", json!({ "profile": { "handle": "flux" } }))
            .await
            .unwrap();

        assert_eq!(peer.profile(), Some(json!({ "handle": "flux" })));
    }

    #[tokio::test]
    async fn disconnect_deregisters_the_peer() {
        let server = test_server();
        let (peer, _, _) = joined_peer(&server).await;

        let reply = peer
            .dispatch("createRoom", json!({ "name": "basement" }))
            .await
            .unwrap();
        let room_id = reply["id"].as_str().unwrap().to_string();
        peer.dispatch("joinRoom", json!({ "id": room_id })).await.unwrap();

        let room = server.room_by_id(&room_id).unwrap();
        assert!(room.has_peer(&peer));

        peer.disconnect().await;

        assert!(!room.has_peer(&peer));
        assert_eq!(server.peer_count(), 0);
    }
}
