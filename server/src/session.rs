//! Session registry: connections, secrets and player identities.
//!
//! This module tracks every live transport connection and arbitrates which
//! connection currently speaks for which player:
//! - Join resolution in two steps (`begin_join` / `complete_join`) so the
//!   identity hash can be computed off the engine task
//! - O(1) connection -> player lookups for the action hot path
//! - Disconnect grace periods and permanent removal
//! - Per-session rate limiting
//!
//! Each secret moves through a small state machine:
//!
//! ```text
//! absent --begin_join--> Pending(conn) --complete_join--> Active(conn, player)
//!    ^                        |                                  |
//!    +------- release --------+------------- release ------------+
//! ```
//!
//! Transitions are compare-and-set: a join completes only if the slot still
//! names the connection that started it, and a release only reports "player
//! left" if the slot still names the connection being released. A newer
//! connection for the same secret therefore always wins over a stale one.

use crate::config::RateLimit;
use crate::identity::{self, DerivedIdentity};
use log::{debug, info};
use shared::{PlayerId, Profile};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

pub type ConnectionId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    UnknownConnection(ConnectionId),
    #[error("secret does not have the expected format")]
    InvalidSecret,
    #[error("connection {0} already has a join in progress")]
    JoinInProgress(ConnectionId),
    #[error("connection {0} has already joined")]
    AlreadyJoined(ConnectionId),
    #[error("join for connection {0} was superseded")]
    StaleJoin(ConnectionId),
}

/// Fixed-window action counter for one session.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitWindow {
    pub count: u32,
    pub window_start: Instant,
}

impl RateLimitWindow {
    pub fn new(now: Instant) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    /// Counts one action; returns false once the window's budget is spent.
    pub fn allow(&mut self, limit: &RateLimit, now: Instant) -> bool {
        if now.duration_since(self.window_start) >= limit.window {
            self.window_start = now;
            self.count = 0;
        }
        if self.count >= limit.max_actions {
            return false;
        }
        self.count += 1;
        true
    }
}

#[derive(Debug)]
pub struct Session {
    pub connection_id: ConnectionId,
    pub secret: Option<String>,
    pub player_id: Option<PlayerId>,
    pub connected_at: Instant,
    pub last_activity_at: Instant,
    pub assets_loaded: bool,
    joining: Option<String>,
    rate: RateLimitWindow,
}

impl Session {
    fn new(connection_id: ConnectionId, now: Instant) -> Self {
        Self {
            connection_id,
            secret: None,
            player_id: None,
            connected_at: now,
            last_activity_at: now,
            assets_loaded: false,
            joining: None,
            rate: RateLimitWindow::new(now),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SecretSlot {
    Pending {
        connection_id: ConnectionId,
        /// Connection and player that held this secret when the join began.
        previous: Option<(ConnectionId, PlayerId)>,
    },
    Active {
        connection_id: ConnectionId,
        player_id: PlayerId,
    },
}

/// Proof that a join was started; consumed by `complete_join`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTicket {
    pub connection_id: ConnectionId,
    pub secret: String,
    pub profile: Profile,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub player_id: PlayerId,
    pub is_reconnect: bool,
    /// Older connection that spoke for this player and no longer does.
    pub superseded: Option<ConnectionId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The player lost their connection; the grace period has started.
    Left(PlayerId),
    /// A newer connection already speaks for this player.
    Superseded(PlayerId),
    /// The connection never finished joining.
    Anonymous,
    NotRegistered,
}

/// Owns all session bookkeeping. Only the engine task holds one.
pub struct SessionRegistry {
    sessions: HashMap<ConnectionId, Session>,
    by_secret: HashMap<String, SecretSlot>,
    by_player: HashMap<PlayerId, ConnectionId>,
    grace_deadlines: HashMap<PlayerId, Instant>,
    grace_period: Duration,
    rate_limit: RateLimit,
}

impl SessionRegistry {
    pub fn new(grace_period: Duration, rate_limit: RateLimit) -> Self {
        Self {
            sessions: HashMap::new(),
            by_secret: HashMap::new(),
            by_player: HashMap::new(),
            grace_deadlines: HashMap::new(),
            grace_period,
            rate_limit,
        }
    }

    /// Records a freshly accepted connection.
    pub fn register(&mut self, connection_id: ConnectionId, now: Instant) {
        self.sessions
            .insert(connection_id, Session::new(connection_id, now));
        debug!("Connection {} registered", connection_id);
    }

    pub fn session(&self, connection_id: ConnectionId) -> Option<&Session> {
        self.sessions.get(&connection_id)
    }

    pub fn touch(&mut self, connection_id: ConnectionId, now: Instant) {
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.last_activity_at = now;
        }
    }

    /// Validates the secret and marks it pending for this connection.
    pub fn begin_join(
        &mut self,
        connection_id: ConnectionId,
        secret: &str,
        profile: Profile,
    ) -> Result<JoinTicket, RegistryError> {
        let session = self
            .sessions
            .get_mut(&connection_id)
            .ok_or(RegistryError::UnknownConnection(connection_id))?;

        if !identity::is_valid_secret(secret) {
            return Err(RegistryError::InvalidSecret);
        }
        if session.joining.is_some() {
            return Err(RegistryError::JoinInProgress(connection_id));
        }
        if session.player_id.is_some() {
            return Err(RegistryError::AlreadyJoined(connection_id));
        }

        let previous = match self.by_secret.get(secret) {
            Some(SecretSlot::Active {
                connection_id: active,
                player_id,
            }) => Some((*active, player_id.clone())),
            Some(SecretSlot::Pending { previous, .. }) => previous.clone(),
            None => None,
        };
        self.by_secret.insert(
            secret.to_string(),
            SecretSlot::Pending {
                connection_id,
                previous,
            },
        );
        session.joining = Some(secret.to_string());

        Ok(JoinTicket {
            connection_id,
            secret: secret.to_string(),
            profile,
        })
    }

    /// Binds the connection to its derived identity.
    ///
    /// `is_known` reports whether canonical state already holds a player;
    /// that decides between the new-player and reconnection paths.
    pub fn complete_join(
        &mut self,
        ticket: &JoinTicket,
        identity: &DerivedIdentity,
        is_known: impl Fn(&PlayerId) -> bool,
    ) -> Result<JoinOutcome, RegistryError> {
        let connection_id = ticket.connection_id;
        let slot_matches = matches!(
            self.by_secret.get(&ticket.secret),
            Some(SecretSlot::Pending { connection_id: pending, .. }) if *pending == connection_id
        );
        let session_waiting = self
            .sessions
            .get(&connection_id)
            .and_then(|session| session.joining.as_deref())
            == Some(ticket.secret.as_str());
        if !slot_matches || !session_waiting {
            if slot_matches {
                self.take_pending(&ticket.secret, connection_id);
            }
            if let Some(session) = self.sessions.get_mut(&connection_id) {
                session.joining = None;
            }
            return Err(RegistryError::StaleJoin(connection_id));
        }

        let player_id = identity.resolve(&is_known);
        let is_reconnect = is_known(&player_id);

        if self.grace_deadlines.remove(&player_id).is_some() {
            debug!("Cancelled grace period for player {}", player_id);
        }

        let superseded = match self.by_player.insert(player_id.clone(), connection_id) {
            Some(old) if old != connection_id => {
                if let Some(old_session) = self.sessions.get_mut(&old) {
                    old_session.player_id = None;
                    old_session.secret = None;
                    Some(old)
                } else {
                    None
                }
            }
            _ => None,
        };

        self.by_secret.insert(
            ticket.secret.clone(),
            SecretSlot::Active {
                connection_id,
                player_id: player_id.clone(),
            },
        );
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.joining = None;
            session.secret = Some(ticket.secret.clone());
            session.player_id = Some(player_id.clone());
        }

        info!(
            "Connection {} {} as player {}",
            connection_id,
            if is_reconnect { "reconnected" } else { "joined" },
            player_id
        );

        Ok(JoinOutcome {
            player_id,
            is_reconnect,
            superseded,
        })
    }

    /// Player currently bound to a connection.
    pub fn resolve(&self, connection_id: ConnectionId) -> Option<&PlayerId> {
        self.sessions
            .get(&connection_id)
            .and_then(|session| session.player_id.as_ref())
    }

    #[cfg(test)]
    pub fn connection_for(&self, player_id: &PlayerId) -> Option<ConnectionId> {
        self.by_player.get(player_id).copied()
    }

    /// Forgets a closed connection.
    pub fn release(&mut self, connection_id: ConnectionId, now: Instant) -> ReleaseOutcome {
        let Some(session) = self.sessions.remove(&connection_id) else {
            return ReleaseOutcome::NotRegistered;
        };

        if let Some(secret) = session.joining {
            // A player whose socket closed while this join was pending has
            // nobody left to speak for them.
            if let Some(player_id) = self.take_pending(&secret, connection_id) {
                self.start_grace(player_id.clone(), now);
                return ReleaseOutcome::Left(player_id);
            }
        }

        let (Some(secret), Some(player_id)) = (session.secret, session.player_id) else {
            return ReleaseOutcome::Anonymous;
        };

        if self.by_player.get(&player_id) == Some(&connection_id) {
            self.by_player.remove(&player_id);
        }

        match self.by_secret.get(&secret) {
            Some(SecretSlot::Active {
                connection_id: active,
                ..
            }) if *active == connection_id => {
                self.by_secret.remove(&secret);
                self.start_grace(player_id.clone(), now);
                ReleaseOutcome::Left(player_id)
            }
            _ => {
                debug!(
                    "Connection {} closed after being superseded for player {}",
                    connection_id, player_id
                );
                ReleaseOutcome::Superseded(player_id)
            }
        }
    }

    /// Withdraws the pending join `connection_id` holds on `secret`.
    ///
    /// The secret returns to the connection that held it before, if that
    /// connection still speaks for its player. Otherwise the stranded player
    /// is returned.
    fn take_pending(&mut self, secret: &str, connection_id: ConnectionId) -> Option<PlayerId> {
        match self.by_secret.get(secret) {
            Some(SecretSlot::Pending {
                connection_id: pending,
                ..
            }) if *pending == connection_id => {}
            _ => return None,
        }
        let Some(SecretSlot::Pending { previous, .. }) = self.by_secret.remove(secret) else {
            return None;
        };
        let (previous_connection, player_id) = previous?;

        match self.by_player.get(&player_id) {
            Some(active) if *active == previous_connection => {
                debug!(
                    "Join on connection {} abandoned, secret returns to connection {}",
                    connection_id, previous_connection
                );
                self.by_secret.insert(
                    secret.to_string(),
                    SecretSlot::Active {
                        connection_id: previous_connection,
                        player_id,
                    },
                );
                None
            }
            Some(_) => None,
            None => Some(player_id),
        }
    }

    fn start_grace(&mut self, player_id: PlayerId, now: Instant) {
        info!(
            "Player {} disconnected, seat held for {:?}",
            player_id, self.grace_period
        );
        self.grace_deadlines.insert(player_id, now + self.grace_period);
    }

    #[cfg(test)]
    pub fn in_grace(&self, player_id: &PlayerId) -> bool {
        self.grace_deadlines.contains_key(player_id)
    }

    /// Players whose grace period ran out; they should be removed for good.
    pub fn expire(&mut self, now: Instant) -> Vec<PlayerId> {
        let mut expired: Vec<PlayerId> = self
            .grace_deadlines
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(player_id, _)| player_id.clone())
            .collect();
        expired.sort();

        for player_id in &expired {
            self.grace_deadlines.remove(player_id);
            info!("Player {} did not return, removing", player_id);
        }
        expired
    }

    /// Counts an action against the session's rate window.
    pub fn check_rate(&mut self, connection_id: ConnectionId, now: Instant) -> bool {
        let limit = self.rate_limit;
        self.sessions
            .get_mut(&connection_id)
            .map(|session| session.rate.allow(&limit, now))
            .unwrap_or(false)
    }

    pub fn mark_assets_loaded(&mut self, connection_id: ConnectionId, loaded: bool) {
        if let Some(session) = self.sessions.get_mut(&connection_id) {
            session.assets_loaded = loaded;
        }
    }

    /// True when every joined session reported its assets as loaded.
    pub fn all_assets_loaded(&self) -> bool {
        self.sessions
            .values()
            .filter(|session| session.player_id.is_some())
            .all(|session| session.assets_loaded)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
