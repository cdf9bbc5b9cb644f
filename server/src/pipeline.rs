//! The dispatch pipeline: the single owner of canonical state.
//!
//! Every state change is an [`Action`] run through the middleware chain and
//! then the root reducer. The root reducer handles the engine's player
//! lifecycle actions itself and hands everything else to the application.
//!
//! A failing middleware never aborts a dispatch. Its error is logged; if the
//! layer had already forwarded the action, the forwarded result stands,
//! otherwise the action continues to the next layer. Either way the reducer
//! runs at most once per dispatch.

use crate::middleware::{Middleware, MiddlewareApi, Next};
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use shared::{Action, CanonicalState, InternalAction, Player, Snapshot};
use std::cell::RefCell;
use std::sync::Arc;

/// A pure state transition. Returning the input `Arc` means "no change".
pub trait Reducer<S>: Send + Sync {
    fn reduce(&self, state: &Snapshot<S>, action: &Action) -> Snapshot<S>;
}

impl<S, F> Reducer<S> for F
where
    F: Fn(&Snapshot<S>, &Action) -> Snapshot<S> + Send + Sync,
{
    fn reduce(&self, state: &Snapshot<S>, action: &Action) -> Snapshot<S> {
        self(state, action)
    }
}

#[derive(Debug, Deserialize)]
struct LifecyclePayload {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    avatar: Option<String>,
}

impl LifecyclePayload {
    fn from_action(action: &Action) -> Self {
        action
            .payload
            .clone()
            .and_then(|payload| serde_json::from_value(payload).ok())
            .unwrap_or(LifecyclePayload {
                name: None,
                avatar: None,
            })
    }
}

/// Handles lifecycle actions and delegates the rest to `app`.
pub struct RootReducer<S> {
    app: Box<dyn Reducer<S>>,
}

impl<S> RootReducer<S>
where
    S: Clone + DeserializeOwned + Send + Sync,
{
    pub fn new(app: impl Reducer<S> + 'static) -> Self {
        Self { app: Box::new(app) }
    }
}

impl<S> Reducer<S> for RootReducer<S>
where
    S: Clone + DeserializeOwned + Send + Sync,
{
    fn reduce(&self, state: &Snapshot<S>, action: &Action) -> Snapshot<S> {
        match action.internal_kind() {
            Some(kind) => apply_internal(state, kind, action),
            None => self.app.reduce(state, action),
        }
    }
}

pub fn apply_internal<S>(state: &Snapshot<S>, kind: InternalAction, action: &Action) -> Snapshot<S>
where
    S: Clone + DeserializeOwned,
{
    if kind == InternalAction::Hydrate {
        let Some(payload) = action.payload.clone() else {
            warn!("Ignoring hydrate without a payload");
            return Arc::clone(state);
        };
        return match serde_json::from_value::<CanonicalState<S>>(payload) {
            Ok(hydrated) => Arc::new(hydrated),
            Err(e) => {
                warn!("Ignoring hydrate with unreadable state: {}", e);
                Arc::clone(state)
            }
        };
    }

    let Some(player_id) = action.player_id.clone() else {
        warn!("Ignoring {} without a player id", kind.as_str());
        return Arc::clone(state);
    };
    let details = LifecyclePayload::from_action(action);
    let mut next = (**state).clone();

    match kind {
        InternalAction::PlayerJoined => {
            let is_host = next.players.is_empty();
            let player = next
                .players
                .entry(player_id.clone())
                .or_insert_with(|| Player {
                    id: player_id.clone(),
                    name: String::new(),
                    avatar: None,
                    is_host,
                    connected: true,
                });
            player.connected = true;
            if let Some(name) = details.name {
                player.name = name;
            }
            if details.avatar.is_some() {
                player.avatar = details.avatar;
            }
        }
        InternalAction::PlayerReconnected | InternalAction::PlayerLeft => {
            let Some(player) = next.players.get_mut(&player_id) else {
                debug!("{} for unknown player {}", kind.as_str(), player_id);
                return Arc::clone(state);
            };
            player.connected = kind == InternalAction::PlayerReconnected;
        }
        InternalAction::PlayerRemoved => {
            if next.players.remove(&player_id).is_none() {
                return Arc::clone(state);
            }
        }
        InternalAction::Hydrate => unreachable!("hydrate handled above"),
    }

    Arc::new(next)
}

/// Result of one dispatch.
#[derive(Debug)]
pub struct Dispatched<S> {
    pub state: Snapshot<S>,
    /// False when a middleware dropped the action before the reducer.
    pub applied: bool,
}

pub struct Pipeline<S> {
    state: Snapshot<S>,
    reducer: Box<dyn Reducer<S>>,
    middleware: Vec<Box<dyn Middleware<S>>>,
}

impl<S> Pipeline<S>
where
    S: Clone + DeserializeOwned + Send + Sync + 'static,
{
    /// Builds a pipeline whose root reducer wraps `app`.
    pub fn new(initial: CanonicalState<S>, app: impl Reducer<S> + 'static) -> Self {
        Self {
            state: Arc::new(initial),
            reducer: Box::new(RootReducer::new(app)),
            middleware: Vec::new(),
        }
    }

    /// Appends a layer; layers added first run outermost.
    pub fn with_middleware(mut self, layer: impl Middleware<S> + 'static) -> Self {
        self.middleware.push(Box::new(layer));
        self
    }

    pub fn state(&self) -> &Snapshot<S> {
        &self.state
    }

    pub fn dispatch(&mut self, action: Action) -> Dispatched<S> {
        let current = Arc::clone(&self.state);
        let reduced: RefCell<Option<Snapshot<S>>> = RefCell::new(None);
        let reducer = &self.reducer;

        let base = |action: &Action| -> Snapshot<S> {
            let state = reducer.reduce(&current, action);
            *reduced.borrow_mut() = Some(Arc::clone(&state));
            state
        };

        let api = MiddlewareApi::new(&current);
        run_chain(&self.middleware, &api, &action, &base);

        let (state, applied) = match reduced.into_inner() {
            Some(state) => (state, true),
            None if action.internal_kind().is_some() => {
                debug!("{} was not forwarded, applying directly", action.kind);
                (self.reducer.reduce(&current, &action), true)
            }
            None => (current, false),
        };

        self.state = Arc::clone(&state);
        Dispatched { state, applied }
    }
}

fn run_chain<S>(
    layers: &[Box<dyn Middleware<S>>],
    api: &MiddlewareApi<'_, S>,
    action: &Action,
    base: &dyn Fn(&Action) -> Snapshot<S>,
) -> Snapshot<S> {
    let Some((layer, rest)) = layers.split_first() else {
        return base(action);
    };

    let forwarded: RefCell<Option<Snapshot<S>>> = RefCell::new(None);
    let forward = |action: &Action| -> Snapshot<S> {
        let cached = forwarded.borrow().clone();
        if let Some(state) = cached {
            return state;
        }
        let state = run_chain(rest, api, action, base);
        *forwarded.borrow_mut() = Some(Arc::clone(&state));
        state
    };

    match layer.handle(api, action, &Next::new(&forward)) {
        Ok(state) => state,
        Err(e) => {
            warn!("Middleware '{}' failed on {}: {}", layer.name(), action.kind, e);
            let cached = forwarded.borrow().clone();
            match cached {
                Some(state) => state,
                None => forward(action),
            }
        }
    }
}
