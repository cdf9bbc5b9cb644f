//! Actions: the only way canonical state changes.
//!
//! Types beginning with `__` are reserved for the engine's player lifecycle
//! and are never accepted from a remote client.

use crate::PlayerId;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RESERVED_PREFIX: &str = "__";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player_id: Option<PlayerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,
}

impl Action {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            payload: None,
            player_id: None,
            timestamp: None,
        }
    }

    pub fn internal(kind: InternalAction) -> Self {
        Self::new(kind.as_str())
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn from_player(mut self, player_id: PlayerId) -> Self {
        self.player_id = Some(player_id);
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn is_reserved(&self) -> bool {
        is_reserved_type(&self.kind)
    }

    pub fn internal_kind(&self) -> Option<InternalAction> {
        InternalAction::parse(&self.kind)
    }
}

pub fn is_reserved_type(kind: &str) -> bool {
    kind.starts_with(RESERVED_PREFIX)
}

/// Player lifecycle actions the engine dispatches on its own behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InternalAction {
    /// Replaces the whole state with the payload.
    Hydrate,
    PlayerJoined,
    PlayerLeft,
    PlayerReconnected,
    PlayerRemoved,
}

impl InternalAction {
    pub const ALL: [InternalAction; 5] = [
        InternalAction::Hydrate,
        InternalAction::PlayerJoined,
        InternalAction::PlayerLeft,
        InternalAction::PlayerReconnected,
        InternalAction::PlayerRemoved,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            InternalAction::Hydrate => "__HYDRATE__",
            InternalAction::PlayerJoined => "__PLAYER_JOINED__",
            InternalAction::PlayerLeft => "__PLAYER_LEFT__",
            InternalAction::PlayerReconnected => "__PLAYER_RECONNECTED__",
            InternalAction::PlayerRemoved => "__PLAYER_REMOVED__",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|internal| internal.as_str() == kind)
    }
}
