use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use thiserror::Error;

/// The outcome of a dispatched RPC: a success payload passed through
/// verbatim, or an error the dispatcher turns into a uniform reply.
pub type RpcResult = Result<Value, ApiError>;

#[derive(Debug, Error, PartialEq)]
pub enum ApiError {
    #[error("invalid token")]
    InvalidToken,
    #[error("Invalid method name")]
    InvalidMethod,
    #[error("you are not in a room")]
    NotInRoom,
    #[error("must be active dj to skip turn")]
    NotActiveDj,
    #[error("too many djs, not enough mics")]
    TooManyDjs,
    #[error("already a dj")]
    AlreadyDj,
    #[error("you are not a dj")]
    NotDj,
    #[error("name must be at least 1 character")]
    EmptyName,
    #[error("can't send a blank message")]
    BlankMessage,
    #[error("there is no song playing to vote on")]
    NoSongPlaying,
    #[error("room not found")]
    RoomNotFound,
    #[error("{0}")]
    Other(String),
}

impl ApiError {
    /// The wire shape every failure takes.
    pub fn to_reply(&self) -> Value {
        json!({ "error": true, "message": self.to_string() })
    }
}

/// The wire shape of a plain successful reply.
pub fn success() -> Value {
    json!({ "success": true })
}

/// Deserializes a handler's params struct, surfacing malformed input
/// the same way any other handler failure is surfaced.
pub fn params<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
    serde_json::from_value(value).map_err(|e| ApiError::Other(e.to_string()))
}
