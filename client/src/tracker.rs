//! Client-side view of the session as pushed by the host.

use serde_json::Value;
use shared::clock::{ClockSample, ClockSync};
use shared::{ClientMessage, ErrorPayload, PlayerId, ServerMessage};

/// What a host message changed in the view.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Joined {
        player_id: PlayerId,
        reconnected: bool,
    },
    /// A state push; `actions` lists the dispatched action types in order.
    State {
        actions: Vec<String>,
    },
    Clock(ClockSample),
    Rejected(ErrorPayload),
    Ignored,
}

#[derive(Debug, Default)]
pub struct SessionView {
    pub player_id: Option<PlayerId>,
    pub state: Value,
    pub updates: u64,
    pub last_update: Option<u64>,
    clock: ClockSync,
}

impl SessionView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next latency probe to send.
    pub fn probe(&mut self, now: u64) -> ClientMessage {
        ClientMessage::Ping(self.clock.begin(now))
    }

    pub fn apply(&mut self, message: ServerMessage, receive_time: u64) -> Update {
        match message {
            ServerMessage::Welcome(welcome) => {
                self.player_id = Some(welcome.player_id.clone());
                self.state = welcome.state;
                Update::Joined {
                    player_id: welcome.player_id,
                    reconnected: false,
                }
            }
            ServerMessage::Reconnected(reconnected) => {
                self.player_id = Some(reconnected.player_id.clone());
                self.state = reconnected.state;
                Update::Joined {
                    player_id: reconnected.player_id,
                    reconnected: true,
                }
            }
            ServerMessage::StateUpdate(update) => {
                let actions = update
                    .dispatched()
                    .into_iter()
                    .map(|action| action.kind.clone())
                    .collect();
                self.state = update.new_state;
                self.updates += 1;
                self.last_update = Some(update.timestamp);
                Update::State { actions }
            }
            ServerMessage::Pong(reply) => match self.clock.complete(&reply, receive_time) {
                Some(sample) => Update::Clock(sample),
                None => Update::Ignored,
            },
            ServerMessage::Error(error) => Update::Rejected(error),
        }
    }

    /// Local time translated onto the host's clock, once a sample exists.
    pub fn host_time(&self, local: u64) -> Option<f64> {
        self.clock
            .best_offset()
            .map(|offset| local as f64 + offset)
    }

    pub fn player_count(&self) -> usize {
        self.state
            .get("players")
            .and_then(Value::as_object)
            .map_or(0, |players| players.len())
    }
}
