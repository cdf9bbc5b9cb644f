//! Demo application: a party-game scoreboard with chat.
//!
//! Any player may add points or chat. Only the host may start the next round.

use crate::middleware::{LoggerMiddleware, SchemaValidator};
use crate::pipeline::{Pipeline, RootReducer};
use log::info;
use serde::{Deserialize, Serialize};
use shared::{Action, CanonicalState, PlayerId, Snapshot};
use std::collections::BTreeMap;
use std::sync::Arc;

pub const ADD_POINTS: &str = "ADD_POINTS";
pub const CHAT: &str = "CHAT";
pub const NEXT_ROUND: &str = "NEXT_ROUND";

pub const MAX_POINTS_PER_ACTION: i64 = 100;
pub const MAX_CHAT_LEN: usize = 280;
pub const CHAT_HISTORY: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatLine {
    pub player_id: PlayerId,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameState {
    #[serde(default)]
    pub round: u32,
    #[serde(default)]
    pub scores: BTreeMap<PlayerId, i64>,
    #[serde(default)]
    pub chat: Vec<ChatLine>,
}

pub type GameSnapshot = Snapshot<GameState>;

fn points(action: &Action) -> Option<i64> {
    action.payload.as_ref()?.get("amount")?.as_i64()
}

fn chat_text(action: &Action) -> Option<&str> {
    action.payload.as_ref()?.get("text")?.as_str()
}

/// Application reducer. Unknown actions leave the state untouched.
pub fn reduce(state: &GameSnapshot, action: &Action) -> GameSnapshot {
    let Some(player_id) = action.player_id.as_ref() else {
        return Arc::clone(state);
    };

    match action.kind.as_str() {
        ADD_POINTS => {
            let Some(amount) = points(action) else {
                return Arc::clone(state);
            };
            let mut next = (**state).clone();
            *next.app.scores.entry(player_id.clone()).or_insert(0) += amount;
            Arc::new(next)
        }
        CHAT => {
            let Some(text) = chat_text(action) else {
                return Arc::clone(state);
            };
            let mut next = (**state).clone();
            next.app.chat.push(ChatLine {
                player_id: player_id.clone(),
                text: text.to_string(),
            });
            let overflow = next.app.chat.len().saturating_sub(CHAT_HISTORY);
            next.app.chat.drain(..overflow);
            Arc::new(next)
        }
        NEXT_ROUND => {
            let is_host = state
                .players
                .get(player_id)
                .map_or(false, |player| player.is_host);
            if !is_host {
                return Arc::clone(state);
            }
            let mut next = (**state).clone();
            next.app.round += 1;
            info!("Round {} started by {}", next.app.round, player_id);
            Arc::new(next)
        }
        _ => Arc::clone(state),
    }
}

/// Payload checks for the demo's action types.
pub fn validator() -> SchemaValidator {
    SchemaValidator::new()
        .rule(ADD_POINTS, |action| {
            points(action).map_or(false, |amount| {
                (-MAX_POINTS_PER_ACTION..=MAX_POINTS_PER_ACTION).contains(&amount)
            })
        })
        .rule(CHAT, |action| {
            chat_text(action).map_or(false, |text| {
                let len = text.chars().count();
                len > 0 && len <= MAX_CHAT_LEN
            })
        })
}

pub fn root_reducer() -> RootReducer<GameState> {
    RootReducer::new(reduce)
}

pub fn build_pipeline() -> Pipeline<GameState> {
    Pipeline::new(CanonicalState::new(GameState::default()), reduce)
        .with_middleware(LoggerMiddleware)
        .with_middleware(validator())
}
