use std::collections::HashMap;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::peer::PeerId;

pub type TrackId = String;

/// A track provided by a DJ. The registry copy keeps the payload
/// `data`; every peer-visible copy is stripped of it.
#[derive(Debug, Clone, Serialize)]
pub struct Track {
    pub id: TrackId,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Whatever else the client attached: title, artist, artwork...
    #[serde(flatten)]
    pub meta: Map<String, Value>,
}

impl Track {
    /// Builds a registry track out of a DJ's `requestTrack` reply,
    /// minting the server-assigned id and url.
    pub fn from_reply(reply: Value, http_base: &str) -> Option<Self> {
        let mut meta = reply.get("track")?.as_object()?.clone();

        let data = match meta.remove("data") {
            Some(Value::String(data)) => Some(data),
            _ => None,
        };

        let id = Uuid::new_v4().to_string();
        let url = format!("{http_base}tracks/{id}");

        Some(Self { id, url, data, meta })
    }

    /// A peer-visible copy without the payload data.
    pub fn stripped(&self) -> Self {
        Self {
            data: None,
            ..self.clone()
        }
    }
}

/// The record of the currently playing track in a room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NowPlaying {
    pub track: Track,
    /// Votes by peer id, `true` encoding a downvote.
    pub votes: HashMap<PeerId, bool>,
    /// Wall-clock seconds since the epoch at which playback starts.
    pub started_at: i64,
}

/// The process-wide mapping from track id to full track, read by the
/// HTTP collaborator that serves track payloads.
///
/// Rooms own the garbage discipline: a track is evicted when it
/// finishes playback, when it is displaced from on-deck before it ever
/// played, or when the owning room is removed.
#[derive(Debug, Default)]
pub struct TrackRegistry {
    tracks: DashMap<TrackId, Track>,
}

impl TrackRegistry {
    pub fn put(&self, track: Track) {
        self.tracks.insert(track.id.clone(), track);
    }

    pub fn get(&self, id: &str) -> Option<Track> {
        self.tracks.get(id).map(|t| t.clone())
    }

    pub fn remove(&self, id: &str) {
        self.tracks.remove(id);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tracks.contains_key(id)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{Track, TrackRegistry};

    #[test]
    fn tracks_are_minted_from_replies() {
        let reply = json!({ "track": { "data": "aGk=", "title": "daydream" } });

        let track = Track::from_reply(reply, "http://localhost:9050/").unwrap();

        assert_eq!(track.url, format!("http://localhost:9050/tracks/{}", track.id));
        assert_eq!(track.data.as_deref(), Some("aGk="));
        assert_eq!(track.meta["title"], "daydream");
    }

    #[test]
    fn replies_without_a_track_are_rejected() {
        assert!(Track::from_reply(json!({}), "http://localhost/").is_none());
        assert!(Track::from_reply(json!({ "track": 3 }), "http://localhost/").is_none());
    }

    #[test]
    fn stripping_removes_only_the_payload() {
        let reply = json!({ "track": { "data": "aGk=", "title": "daydream" } });
        let track = Track::from_reply(reply, "http://localhost/").unwrap();

        let stripped = track.stripped();

        assert_eq!(stripped.data, None);
        assert_eq!(stripped.id, track.id);
        assert_eq!(stripped.meta, track.meta);

        let wire = serde_json::to_value(&stripped).unwrap();
        assert!(wire.get("data").is_none());
        assert_eq!(wire["title"], "daydream");
    }

    #[test]
    fn registry_keeps_full_tracks_until_removed() {
        let registry = TrackRegistry::default();
        let reply = json!({ "track": { "data": "aGk=", "title": "daydream" } });
        let track = Track::from_reply(reply, "http://localhost/").unwrap();
        let id = track.id.clone();

        registry.put(track);

        assert!(registry.contains(&id));
        assert_eq!(registry.get(&id).unwrap().data.as_deref(), Some("aGk="));

        registry.remove(&id);
        assert!(!registry.contains(&id));
    }
}
