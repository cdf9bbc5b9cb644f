//! Types and codecs shared by the session host and its clients.
//!
//! The wire protocol is JSON inside WebSocket-compatible text frames. Every
//! message is adjacently tagged as `{"type": ..., "payload": ...}` so both
//! sides can reject unknown kinds before trusting any field.

pub mod action;
pub mod clock;
pub mod frame;
pub mod handshake;
pub mod replay;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub use action::{Action, InternalAction};

/// Stable player identity, derived from the client's secret.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlayerId(pub String);

impl PlayerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: PlayerId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub is_host: bool,
    pub connected: bool,
}

/// Display data a client presents when joining.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

/// The authoritative state: the player roster plus application fields.
///
/// Application fields are flattened next to `players` on the wire, so an
/// application state must not declare a field named `players` itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CanonicalState<S> {
    #[serde(default)]
    pub players: BTreeMap<PlayerId, Player>,
    #[serde(flatten)]
    pub app: S,
}

impl<S> CanonicalState<S> {
    pub fn new(app: S) -> Self {
        Self {
            players: BTreeMap::new(),
            app,
        }
    }
}

/// Immutable view of canonical state handed to readers.
pub type Snapshot<S> = Arc<CanonicalState<S>>;

// Client -> host messages

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
    Join(JoinRequest),
    Action(ActionRequest),
    Ping(Probe),
    AssetsLoaded(bool),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub secret: String,
}

impl JoinRequest {
    pub fn profile(&self) -> Profile {
        Profile {
            name: self.name.clone(),
            avatar: self.avatar.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Latency probe sent by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub id: u64,
    pub timestamp: u64,
}

// Host -> client messages

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    Welcome(Welcome),
    Reconnected(Reconnected),
    StateUpdate(StateUpdate),
    Pong(ProbeReply),
    Error(ErrorPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    pub player_id: PlayerId,
    pub state: Value,
    pub server_time: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reconnected {
    pub player_id: PlayerId,
    pub state: Value,
}

/// A coalesced state push. At most one of `action` / `actions` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateUpdate {
    pub new_state: Value,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<Action>>,
}

impl StateUpdate {
    /// Tags the update with the actions dispatched since the last push.
    pub fn new(new_state: Value, timestamp: u64, mut actions: Vec<Action>) -> Self {
        let (action, actions) = match actions.len() {
            0 => (None, None),
            1 => (actions.pop(), None),
            _ => (None, Some(actions)),
        };
        Self {
            new_state,
            timestamp,
            action,
            actions,
        }
    }

    /// Actions carried by this update, whichever field they arrived in.
    pub fn dispatched(&self) -> Vec<&Action> {
        match (&self.action, &self.actions) {
            (Some(action), _) => vec![action],
            (None, Some(actions)) => actions.iter().collect(),
            (None, None) => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeReply {
    pub id: u64,
    pub orig_timestamp: u64,
    pub server_time: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    InvalidSecret,
    ForbiddenAction,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error(ErrorPayload {
            code,
            message: message.into(),
        })
    }
}

/// Wall-clock milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Scoreboard {
        round: u32,
    }

    #[test]
    fn test_join_message_shape() {
        let raw = json!({
            "type": "JOIN",
            "payload": { "name": "Ada", "secret": "abcdefgh1234" }
        });
        let message: ClientMessage = serde_json::from_value(raw).unwrap();

        match message {
            ClientMessage::Join(join) => {
                assert_eq!(join.name, "Ada");
                assert_eq!(join.avatar, None);
                assert_eq!(join.secret, "abcdefgh1234");
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_action_message_keeps_inner_type() {
        let raw = r#"{"type":"ACTION","payload":{"type":"ADD_POINTS","payload":{"amount":3}}}"#;
        let message: ClientMessage = serde_json::from_str(raw).unwrap();

        match message {
            ClientMessage::Action(request) => {
                assert_eq!(request.kind, "ADD_POINTS");
                assert_eq!(request.payload, Some(json!({ "amount": 3 })));
            }
            other => panic!("Unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_assets_loaded_and_ping() {
        let loaded: ClientMessage =
            serde_json::from_str(r#"{"type":"ASSETS_LOADED","payload":true}"#).unwrap();
        assert_eq!(loaded, ClientMessage::AssetsLoaded(true));

        let ping: ClientMessage =
            serde_json::from_str(r#"{"type":"PING","payload":{"id":7,"timestamp":1000}}"#)
                .unwrap();
        assert_eq!(
            ping,
            ClientMessage::Ping(Probe {
                id: 7,
                timestamp: 1000
            })
        );
    }

    #[test]
    fn test_unknown_message_kind_is_rejected() {
        let result: Result<ClientMessage, _> =
            serde_json::from_str(r#"{"type":"TELEPORT","payload":{}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_error_message_codes() {
        let message = ServerMessage::error(ErrorCode::RateLimited, "slow down");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "ERROR");
        assert_eq!(value["payload"]["code"], "RATE_LIMITED");
        assert_eq!(value["payload"]["message"], "slow down");
    }

    #[test]
    fn test_state_update_action_tagging() {
        let none = StateUpdate::new(json!({}), 1, vec![]);
        let value = serde_json::to_value(&none).unwrap();
        assert!(value.get("action").is_none());
        assert!(value.get("actions").is_none());

        let one = StateUpdate::new(json!({}), 1, vec![Action::new("A")]);
        let value = serde_json::to_value(&one).unwrap();
        assert_eq!(value["action"]["type"], "A");
        assert!(value.get("actions").is_none());

        let many = StateUpdate::new(json!({}), 1, vec![Action::new("A"), Action::new("B")]);
        let value = serde_json::to_value(&many).unwrap();
        assert!(value.get("action").is_none());
        assert_eq!(value["actions"].as_array().unwrap().len(), 2);
        assert_eq!(many.dispatched().len(), 2);
    }

    #[test]
    fn test_canonical_state_flattens_app_fields() {
        let mut state = CanonicalState::new(Scoreboard { round: 4 });
        let id = PlayerId::new("p1");
        state.players.insert(
            id.clone(),
            Player {
                id,
                name: "Ada".into(),
                avatar: None,
                is_host: true,
                connected: true,
            },
        );

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["round"], 4);
        assert_eq!(value["players"]["p1"]["isHost"], true);

        let back: CanonicalState<Scoreboard> = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_timestamp_is_monotonic_enough() {
        let first = now_millis();
        std::thread::sleep(Duration::from_millis(2));
        assert!(now_millis() > first);
    }
}
