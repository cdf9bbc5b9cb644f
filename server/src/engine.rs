//! The engine task: sole owner of sessions, canonical state and the
//! broadcast schedule.
//!
//! Connection tasks never touch shared state. They translate socket traffic
//! into [`EngineEvent`]s, and the engine answers through each connection's
//! [`Outbound`] channel. Because one task applies every event in arrival
//! order, no locking is needed anywhere in the dispatch path.

use crate::broadcast::BroadcastScheduler;
use crate::config::ServerConfig;
use crate::identity::{self, DerivedIdentity};
use crate::pipeline::Pipeline;
use crate::session::{ConnectionId, JoinTicket, RegistryError, ReleaseOutcome, SessionRegistry};
use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use shared::action::is_reserved_type;
use shared::replay::Recording;
use shared::{
    now_millis, Action, ActionRequest, CanonicalState, ErrorCode, InternalAction, JoinRequest,
    Reconnected, ServerMessage, Snapshot, StateUpdate, Welcome,
};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

/// Sent to every connection when the host shuts down.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Sent to a connection whose player joined again on another socket.
pub const CLOSE_SUPERSEDED: u16 = 4001;

/// What the engine asks a connection's writer to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(Arc<str>),
    Pong(Vec<u8>),
    /// Host-initiated close carrying a status code.
    Close(u16),
    /// Zero-payload close answering the peer's close.
    CloseEcho,
}

/// Bounded queue feeding one connection's writer.
///
/// Pushing never waits. A full queue means the peer stopped reading; the
/// connection's reader is told to give up and the push reports failure.
#[derive(Debug, Clone)]
pub struct ConnectionOutlet {
    connection_id: ConnectionId,
    tx: mpsc::Sender<Outbound>,
    overflow: Arc<Notify>,
}

impl ConnectionOutlet {
    pub fn new(connection_id: ConnectionId, tx: mpsc::Sender<Outbound>, overflow: Arc<Notify>) -> Self {
        Self {
            connection_id,
            tx,
            overflow,
        }
    }

    /// Resolves once a push found the queue full.
    pub async fn overflowed(&self) {
        self.overflow.notified().await
    }

    /// Returns false if the queue was full.
    pub fn push(&self, outbound: Outbound) -> bool {
        match self.tx.try_send(outbound) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Connection {} is not keeping up, dropping it",
                    self.connection_id
                );
                self.overflow.notify_one();
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Writer for connection {} already stopped", self.connection_id);
                true
            }
        }
    }
}

/// Client traffic the engine acts on. Pings are answered by the
/// connection itself and never get here.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionMessage {
    Join(JoinRequest),
    Action(ActionRequest),
    AssetsLoaded(bool),
}

#[derive(Debug)]
pub enum EngineEvent {
    Connected {
        connection_id: ConnectionId,
        outlet: ConnectionOutlet,
    },
    Message {
        connection_id: ConnectionId,
        message: SessionMessage,
    },
    IdentityDerived {
        ticket: JoinTicket,
        identity: DerivedIdentity,
    },
    Disconnected {
        connection_id: ConnectionId,
    },
    /// An action from the host itself. Reserved types are allowed.
    HostDispatch(Action),
    Shutdown,
}

/// Cloneable sender for engine events.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineHandle {
    pub(crate) fn from_sender(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Returns false once the engine has stopped.
    pub fn send(&self, event: EngineEvent) -> bool {
        self.tx.send(event).is_ok()
    }

    pub fn dispatch(&self, action: Action) -> bool {
        self.send(EngineEvent::HostDispatch(action))
    }

    pub fn shutdown(&self) {
        if !self.send(EngineEvent::Shutdown) {
            debug!("Shutdown requested after engine stopped");
        }
    }
}

pub struct Engine<S> {
    pipeline: Pipeline<S>,
    registry: SessionRegistry,
    scheduler: BroadcastScheduler,
    outbound: HashMap<ConnectionId, ConnectionOutlet>,
    recording: Option<Recording<CanonicalState<S>>>,
    record_path: Option<PathBuf>,
    sweep_interval: Duration,

    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: mpsc::UnboundedReceiver<EngineEvent>,
}

impl<S> Engine<S>
where
    S: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(config: &ServerConfig, pipeline: Pipeline<S>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let recording = config
            .record_path
            .as_ref()
            .map(|_| Recording::new((**pipeline.state()).clone(), now_millis()));

        Self {
            pipeline,
            registry: SessionRegistry::new(config.grace_period, config.rate_limit),
            scheduler: BroadcastScheduler::new(config.broadcast_interval),
            outbound: HashMap::new(),
            recording,
            record_path: config.record_path.clone(),
            sweep_interval: config.sweep_interval,
            events_tx,
            events_rx,
        }
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle::from_sender(self.events_tx.clone())
    }

    pub fn state(&self) -> &Snapshot<S> {
        self.pipeline.state()
    }

    /// Runs until a shutdown event arrives.
    pub async fn run(mut self) {
        let mut sweep = interval(self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("Engine started");

        loop {
            let deadline = self.scheduler.deadline();

            tokio::select! {
                event = self.events_rx.recv() => {
                    let Some(event) = event else { break };
                    if !self.handle_event(event) {
                        break;
                    }
                },

                // Trailing-edge state push
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                },

                // Expired grace periods
                _ = sweep.tick() => {
                    self.sweep(Instant::now());
                },
            }
        }

        info!("Engine stopped");
    }

    /// Applies one event. Returns false when the engine should stop.
    fn handle_event(&mut self, event: EngineEvent) -> bool {
        match event {
            EngineEvent::Connected {
                connection_id,
                outlet,
            } => {
                self.registry
                    .register(connection_id, Instant::now().into_std());
                self.outbound.insert(connection_id, outlet);
            }
            EngineEvent::Message {
                connection_id,
                message,
            } => self.handle_message(connection_id, message),
            EngineEvent::IdentityDerived { ticket, identity } => {
                self.finish_join(ticket, identity)
            }
            EngineEvent::Disconnected { connection_id } => self.disconnect(connection_id),
            EngineEvent::HostDispatch(mut action) => {
                if action.timestamp.is_none() {
                    action.timestamp = Some(now_millis());
                }
                self.dispatch(action);
            }
            EngineEvent::Shutdown => {
                self.shutdown();
                return false;
            }
        }
        true
    }

    fn handle_message(&mut self, connection_id: ConnectionId, message: SessionMessage) {
        let now = Instant::now();
        self.registry.touch(connection_id, now.into_std());

        match message {
            SessionMessage::Join(request) => self.start_join(connection_id, request),
            SessionMessage::Action(request) => self.handle_action(connection_id, request, now),
            SessionMessage::AssetsLoaded(loaded) => {
                self.registry.mark_assets_loaded(connection_id, loaded);
                if loaded && self.registry.all_assets_loaded() {
                    info!("All joined players have loaded their assets");
                }
            }
        }
    }

    fn start_join(&mut self, connection_id: ConnectionId, request: JoinRequest) {
        match self
            .registry
            .begin_join(connection_id, &request.secret, request.profile())
        {
            Ok(ticket) => {
                // Hashing stays off the engine task.
                let events = self.events_tx.clone();
                tokio::task::spawn_blocking(move || {
                    let identity = identity::derive(&ticket.secret);
                    if events
                        .send(EngineEvent::IdentityDerived { ticket, identity })
                        .is_err()
                    {
                        debug!("Engine stopped before an identity was derived");
                    }
                });
            }
            Err(RegistryError::InvalidSecret) => {
                warn!("Connection {} sent a malformed secret", connection_id);
                self.send(
                    connection_id,
                    &ServerMessage::error(
                        ErrorCode::InvalidSecret,
                        "secret must be 8-128 characters of A-Z, a-z, 0-9, '-' or '_'",
                    ),
                );
            }
            Err(e) => {
                warn!("Rejected join from connection {}: {}", connection_id, e);
                self.send(
                    connection_id,
                    &ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()),
                );
            }
        }
    }

    fn finish_join(&mut self, ticket: JoinTicket, identity: DerivedIdentity) {
        let state = Arc::clone(self.pipeline.state());
        let outcome = match self
            .registry
            .complete_join(&ticket, &identity, |id| state.players.contains_key(id))
        {
            Ok(outcome) => outcome,
            // The socket is still open but another connection took the
            // secret while this one was deriving.
            Err(RegistryError::StaleJoin(connection_id))
                if self.registry.session(connection_id).is_some() =>
            {
                info!(
                    "Connection {} lost a join race for its secret, closing",
                    connection_id
                );
                self.send_raw(connection_id, Outbound::Close(CLOSE_SUPERSEDED));
                return;
            }
            Err(e) => {
                debug!("Discarding join: {}", e);
                return;
            }
        };
        let connection_id = ticket.connection_id;

        if let Some(old) = outcome.superseded {
            info!(
                "Connection {} replaced connection {} for player {}",
                connection_id, old, outcome.player_id
            );
            self.send_raw(old, Outbound::Close(CLOSE_SUPERSEDED));
        }

        let kind = if outcome.is_reconnect {
            InternalAction::PlayerReconnected
        } else {
            InternalAction::PlayerJoined
        };
        let mut action = Action::internal(kind)
            .from_player(outcome.player_id.clone())
            .at(now_millis());
        match serde_json::to_value(&ticket.profile) {
            Ok(profile) => action.payload = Some(profile),
            Err(e) => warn!("Failed to encode profile for {}: {}", outcome.player_id, e),
        }

        let state = self.dispatch(action);
        let state = match serde_json::to_value(state.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode state for a joining player: {}", e);
                return;
            }
        };

        let reply = if outcome.is_reconnect {
            ServerMessage::Reconnected(Reconnected {
                player_id: outcome.player_id,
                state,
            })
        } else {
            ServerMessage::Welcome(Welcome {
                player_id: outcome.player_id,
                state,
                server_time: now_millis(),
            })
        };
        self.send(connection_id, &reply);
    }

    fn handle_action(&mut self, connection_id: ConnectionId, request: ActionRequest, now: Instant) {
        let Some(player_id) = self.registry.resolve(connection_id).cloned() else {
            self.send(
                connection_id,
                &ServerMessage::error(ErrorCode::ForbiddenAction, "join before sending actions"),
            );
            return;
        };

        if !self.registry.check_rate(connection_id, now.into_std()) {
            debug!("Rate limited player {}", player_id);
            self.send(
                connection_id,
                &ServerMessage::error(ErrorCode::RateLimited, "too many actions"),
            );
            return;
        }

        if is_reserved_type(&request.kind) {
            warn!(
                "Player {} tried to dispatch reserved action {}",
                player_id, request.kind
            );
            self.send(
                connection_id,
                &ServerMessage::error(
                    ErrorCode::ForbiddenAction,
                    format!("{} is reserved", request.kind),
                ),
            );
            return;
        }

        let mut action = Action::new(request.kind)
            .from_player(player_id)
            .at(now_millis());
        action.payload = request.payload;
        self.dispatch(action);
    }

    fn disconnect(&mut self, connection_id: ConnectionId) {
        self.outbound.remove(&connection_id);

        match self.registry.release(connection_id, Instant::now().into_std()) {
            ReleaseOutcome::Left(player_id) => {
                self.dispatch(
                    Action::internal(InternalAction::PlayerLeft)
                        .from_player(player_id)
                        .at(now_millis()),
                );
            }
            ReleaseOutcome::Superseded(player_id) => {
                debug!("Stale connection {} for {} closed", connection_id, player_id);
            }
            ReleaseOutcome::Anonymous | ReleaseOutcome::NotRegistered => {
                debug!(
                    "Connection {} closed, {} still open",
                    connection_id,
                    self.registry.len()
                );
            }
        }
    }

    fn sweep(&mut self, now: Instant) {
        for player_id in self.registry.expire(now.into_std()) {
            self.dispatch(
                Action::internal(InternalAction::PlayerRemoved)
                    .from_player(player_id)
                    .at(now_millis()),
            );
        }
    }

    /// Runs the action through the pipeline and queues the state push.
    fn dispatch(&mut self, action: Action) -> Snapshot<S> {
        let result = self.pipeline.dispatch(action.clone());

        if result.applied {
            if let Some(recording) = self.recording.as_mut() {
                let timestamp = action.timestamp.unwrap_or_else(now_millis);
                recording.record(action.clone(), timestamp);
            }
            self.scheduler.schedule(action, Instant::now());
        }
        result.state
    }

    /// Sends the latest state, tagged with what changed it, to everyone.
    fn flush(&mut self) {
        let actions = self.scheduler.take();
        let state = match serde_json::to_value(self.pipeline.state().as_ref()) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to encode state for broadcast: {}", e);
                return;
            }
        };

        let update = ServerMessage::StateUpdate(StateUpdate::new(state, now_millis(), actions));
        let text: Arc<str> = match serde_json::to_string(&update) {
            Ok(text) => text.into(),
            Err(e) => {
                error!("Failed to serialize state update: {}", e);
                return;
            }
        };

        debug!(
            "Broadcasting {} bytes to {} connections",
            text.len(),
            self.outbound.len()
        );
        let backlogged: Vec<ConnectionId> = self
            .outbound
            .iter()
            .filter(|(_, outlet)| !outlet.push(Outbound::Text(Arc::clone(&text))))
            .map(|(connection_id, _)| *connection_id)
            .collect();
        for connection_id in backlogged {
            self.outbound.remove(&connection_id);
        }
    }

    fn shutdown(&mut self) {
        info!("Engine shutting down");
        self.scheduler.cancel();

        if !self.registry.is_empty() {
            info!("Closing {} connections", self.registry.len());
        }
        for outlet in self.outbound.values() {
            outlet.push(Outbound::Close(CLOSE_GOING_AWAY));
        }

        if let (Some(mut recording), Some(path)) = (self.recording.take(), self.record_path.as_ref())
        {
            recording.finish(now_millis());
            match recording.save(path) {
                Ok(()) => info!(
                    "Saved {} recorded actions to {}",
                    recording.actions.len(),
                    path.display()
                ),
                Err(e) => error!("Failed to save recording to {}: {}", path.display(), e),
            }
        }
    }

    fn send(&mut self, connection_id: ConnectionId, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_raw(connection_id, Outbound::Text(text.into())),
            Err(e) => error!(
                "Failed to serialize message for connection {}: {}",
                connection_id, e
            ),
        }
    }

    fn send_raw(&mut self, connection_id: ConnectionId, outbound: Outbound) {
        match self.outbound.get(&connection_id) {
            Some(outlet) => {
                if !outlet.push(outbound) {
                    self.outbound.remove(&connection_id);
                }
            }
            None => debug!("No writer registered for connection {}", connection_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RateLimit;
    use serde::Deserialize;
    use serde_json::json;
    use shared::PlayerId;
    use tokio::time::timeout;

    const SECRET: &str = "engine-test-secret";

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        value: i64,
    }

    fn counter(state: &Snapshot<Counter>, action: &Action) -> Snapshot<Counter> {
        match action.kind.as_str() {
            "INCREMENT" => {
                let mut next = (**state).clone();
                next.app.value += 1;
                Arc::new(next)
            }
            _ => Arc::clone(state),
        }
    }

    fn engine_with(config: ServerConfig) -> Engine<Counter> {
        Engine::new(&config, Pipeline::new(CanonicalState::default(), counter))
    }

    fn engine() -> Engine<Counter> {
        engine_with(ServerConfig::default())
    }

    fn connect_with_capacity(
        engine: &mut Engine<Counter>,
        connection_id: ConnectionId,
        capacity: usize,
    ) -> (mpsc::Receiver<Outbound>, Arc<Notify>) {
        let (tx, rx) = mpsc::channel(capacity);
        let overflow = Arc::new(Notify::new());
        engine.handle_event(EngineEvent::Connected {
            connection_id,
            outlet: ConnectionOutlet::new(connection_id, tx, Arc::clone(&overflow)),
        });
        (rx, overflow)
    }

    fn connect(engine: &mut Engine<Counter>, connection_id: ConnectionId) -> mpsc::Receiver<Outbound> {
        connect_with_capacity(engine, connection_id, 128).0
    }

    fn send_message(engine: &mut Engine<Counter>, connection_id: ConnectionId, message: SessionMessage) {
        engine.handle_event(EngineEvent::Message {
            connection_id,
            message,
        });
    }

    fn join_request(name: &str) -> SessionMessage {
        SessionMessage::Join(JoinRequest {
            name: name.to_string(),
            avatar: None,
            secret: SECRET.to_string(),
        })
    }

    /// Feeds the next derived identity back into the engine.
    async fn derive_next(engine: &mut Engine<Counter>) {
        let event = engine.events_rx.recv().await.unwrap();
        assert!(matches!(event, EngineEvent::IdentityDerived { .. }));
        engine.handle_event(event);
    }

    /// Sends JOIN and feeds the derived identity back in.
    async fn join(engine: &mut Engine<Counter>, connection_id: ConnectionId, name: &str) {
        send_message(engine, connection_id, join_request(name));
        derive_next(engine).await;
    }

    fn action(kind: &str) -> SessionMessage {
        SessionMessage::Action(ActionRequest {
            kind: kind.to_string(),
            payload: None,
        })
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            out.push(message);
        }
        out
    }

    fn messages(rx: &mut mpsc::Receiver<Outbound>) -> Vec<ServerMessage> {
        drain(rx)
            .into_iter()
            .filter_map(|outbound| match outbound {
                Outbound::Text(text) => serde_json::from_str(&text).ok(),
                _ => None,
            })
            .collect()
    }

    fn error_code(message: &ServerMessage) -> Option<ErrorCode> {
        match message {
            ServerMessage::Error(payload) => Some(payload.code),
            _ => None,
        }
    }

    #[tokio::test]
    async fn test_join_sends_welcome() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);

        join(&mut engine, 1, "Ada").await;

        let replies = messages(&mut rx);
        assert_eq!(replies.len(), 1);
        match &replies[0] {
            ServerMessage::Welcome(welcome) => {
                assert_eq!(welcome.player_id, identity::derive(SECRET).current);
                let player = &welcome.state["players"][welcome.player_id.as_str()];
                assert_eq!(player["name"], "Ada");
                assert_eq!(player["isHost"], true);
            }
            other => panic!("Unexpected reply: {:?}", other),
        }
        assert_eq!(engine.scheduler.pending_len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_secret() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);

        send_message(
            &mut engine,
            1,
            SessionMessage::Join(JoinRequest {
                name: "Eve".to_string(),
                avatar: None,
                secret: "nope".to_string(),
            }),
        );

        let replies = messages(&mut rx);
        assert_eq!(error_code(&replies[0]), Some(ErrorCode::InvalidSecret));
        assert!(engine.state().players.is_empty());
    }

    #[tokio::test]
    async fn test_action_requires_join() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);

        send_message(&mut engine, 1, action("INCREMENT"));

        let replies = messages(&mut rx);
        assert_eq!(error_code(&replies[0]), Some(ErrorCode::ForbiddenAction));
        assert_eq!(engine.state().app.value, 0);
    }

    #[tokio::test]
    async fn test_reserved_action_is_forbidden() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        drain(&mut rx);

        send_message(&mut engine, 1, action(InternalAction::PlayerRemoved.as_str()));

        let replies = messages(&mut rx);
        assert_eq!(error_code(&replies[0]), Some(ErrorCode::ForbiddenAction));
        assert_eq!(engine.state().players.len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_actions() {
        let mut engine = engine_with(ServerConfig {
            rate_limit: RateLimit {
                max_actions: 2,
                window: Duration::from_secs(60),
            },
            ..ServerConfig::default()
        });
        let mut rx = connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        drain(&mut rx);

        for _ in 0..3 {
            send_message(&mut engine, 1, action("INCREMENT"));
        }

        let replies = messages(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(error_code(&replies[0]), Some(ErrorCode::RateLimited));
        assert_eq!(engine.state().app.value, 2);
    }

    #[tokio::test]
    async fn test_default_rate_limit_allows_sixty_per_second() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        drain(&mut rx);

        for _ in 0..61 {
            send_message(&mut engine, 1, action("INCREMENT"));
        }

        let replies = messages(&mut rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(error_code(&replies[0]), Some(ErrorCode::RateLimited));
        assert_eq!(engine.state().app.value, 60);
    }

    #[tokio::test]
    async fn test_flush_broadcasts_queued_actions() {
        let mut engine = engine();
        let mut rx1 = connect(&mut engine, 1);
        let mut rx2 = connect(&mut engine, 2);
        join(&mut engine, 1, "Ada").await;
        send_message(&mut engine, 1, action("INCREMENT"));
        drain(&mut rx1);

        engine.flush();

        for rx in [&mut rx1, &mut rx2] {
            let updates = messages(rx);
            assert_eq!(updates.len(), 1);
            let ServerMessage::StateUpdate(update) = &updates[0] else {
                panic!("Expected a state update, got {:?}", updates[0]);
            };
            assert_eq!(update.new_state["value"], 1);
            let kinds: Vec<&str> = update.dispatched().iter().map(|a| a.kind.as_str()).collect();
            assert_eq!(kinds, vec![InternalAction::PlayerJoined.as_str(), "INCREMENT"]);
        }
        assert_eq!(engine.scheduler.deadline(), None);
    }

    #[tokio::test]
    async fn test_duplicate_session_supersedes_old_connection() {
        let mut engine = engine();
        let mut old = connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        drain(&mut old);

        let mut new = connect(&mut engine, 2);
        join(&mut engine, 2, "Ada").await;

        assert_eq!(drain(&mut old), vec![Outbound::Close(CLOSE_SUPERSEDED)]);
        assert!(matches!(
            messages(&mut new)[0],
            ServerMessage::Reconnected(_)
        ));

        // The stale socket closing must not mark the player as gone.
        engine.handle_event(EngineEvent::Disconnected { connection_id: 1 });
        let id = identity::derive(SECRET).current;
        assert!(engine.state().players[&id].connected);
    }

    #[tokio::test]
    async fn test_losing_join_race_closes_connection() {
        let mut engine = engine();
        let mut first = connect(&mut engine, 1);
        let mut second = connect(&mut engine, 2);

        // Both sockets present the secret before either identity is ready.
        send_message(&mut engine, 1, join_request("Ada"));
        send_message(&mut engine, 2, join_request("Ada"));
        derive_next(&mut engine).await;
        derive_next(&mut engine).await;

        assert_eq!(drain(&mut first), vec![Outbound::Close(CLOSE_SUPERSEDED)]);
        let replies = messages(&mut second);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], ServerMessage::Welcome(_)));
        assert_eq!(engine.state().players.len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_takeover_keeps_player_on_original_connection() {
        let mut engine = engine();
        connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        let id = identity::derive(SECRET).current;

        // A second socket starts a join for the same secret and dies first.
        connect(&mut engine, 2);
        send_message(&mut engine, 2, join_request("Ada"));
        engine.handle_event(EngineEvent::Disconnected { connection_id: 2 });
        derive_next(&mut engine).await;
        assert!(engine.state().players[&id].connected);

        engine.handle_event(EngineEvent::Disconnected { connection_id: 1 });
        assert!(!engine.state().players[&id].connected);

        engine.sweep(Instant::now() + Duration::from_secs(31));
        assert!(engine.state().players.is_empty());
    }

    #[tokio::test]
    async fn test_backlogged_connection_is_dropped() {
        let mut engine = engine();
        let (mut stuck, overflow) = connect_with_capacity(&mut engine, 1, 2);
        let mut healthy = connect(&mut engine, 2);

        for _ in 0..5 {
            engine.flush();
        }

        timeout(Duration::from_secs(1), overflow.notified())
            .await
            .expect("overflow was not signalled");
        assert!(!engine.outbound.contains_key(&1));
        assert!(engine.outbound.contains_key(&2));
        assert_eq!(drain(&mut stuck).len(), 2);
        assert_eq!(messages(&mut healthy).len(), 5);
    }

    #[tokio::test]
    async fn test_disconnect_then_grace_expiry() {
        let mut engine = engine();
        connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        let id: PlayerId = identity::derive(SECRET).current;

        engine.handle_event(EngineEvent::Disconnected { connection_id: 1 });
        assert!(!engine.state().players[&id].connected);

        engine.sweep(Instant::now());
        assert!(engine.state().players.contains_key(&id));

        engine.sweep(Instant::now() + Duration::from_secs(31));
        assert!(engine.state().players.is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_within_grace() {
        let mut engine = engine();
        connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        engine.handle_event(EngineEvent::Disconnected { connection_id: 1 });

        let mut rx = connect(&mut engine, 2);
        join(&mut engine, 2, "Ada").await;

        assert!(matches!(messages(&mut rx)[0], ServerMessage::Reconnected(_)));
        engine.sweep(Instant::now() + Duration::from_secs(31));
        assert_eq!(engine.state().players.len(), 1);
    }

    #[tokio::test]
    async fn test_host_dispatch_allows_reserved_types() {
        let mut engine = engine();

        engine.handle_event(EngineEvent::HostDispatch(
            Action::internal(InternalAction::Hydrate).with_payload(json!({ "value": 9 })),
        ));

        assert_eq!(engine.state().app.value, 9);
    }

    #[tokio::test]
    async fn test_shutdown_closes_without_flushing() {
        let mut engine = engine();
        let mut rx = connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        drain(&mut rx);

        let keep_running = engine.handle_event(EngineEvent::Shutdown);

        assert!(!keep_running);
        assert_eq!(engine.scheduler.deadline(), None);
        assert_eq!(drain(&mut rx), vec![Outbound::Close(CLOSE_GOING_AWAY)]);
    }

    #[tokio::test]
    async fn test_recording_saved_on_shutdown() {
        let path = std::env::temp_dir().join(format!("engine-recording-{}.json", std::process::id()));
        let mut engine = engine_with(ServerConfig {
            record_path: Some(path.clone()),
            ..ServerConfig::default()
        });
        connect(&mut engine, 1);
        join(&mut engine, 1, "Ada").await;
        send_message(&mut engine, 1, action("INCREMENT"));

        engine.handle_event(EngineEvent::Shutdown);

        let recording: Recording<CanonicalState<Counter>> = Recording::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(recording.actions.len(), 2);
        assert!(recording.end_timestamp.is_some());
    }
}
