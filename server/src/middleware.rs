//! Middleware wrapping the root reducer.
//!
//! A middleware sees every dispatched action before the reducer does. It may
//! forward the action with `next.run`, inspect the resulting state, or drop
//! the action by returning the current state without forwarding. The first
//! middleware registered is the outermost layer.

use log::{debug, log_enabled, warn, Level};
use serde::Serialize;
use shared::{Action, Snapshot};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MiddlewareError {
    #[error("{0}")]
    Failed(String),
    #[error("state serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Read access to the state as it was when the dispatch started.
pub struct MiddlewareApi<'a, S> {
    state: &'a Snapshot<S>,
}

impl<'a, S> MiddlewareApi<'a, S> {
    pub(crate) fn new(state: &'a Snapshot<S>) -> Self {
        Self { state }
    }

    pub fn get_state(&self) -> &Snapshot<S> {
        self.state
    }
}

/// Handle to the rest of the chain.
///
/// Only the first `run` reaches the inner layers; later calls return the
/// same result, so a layer cannot apply an action twice.
pub struct Next<'a, S> {
    run: &'a dyn Fn(&Action) -> Snapshot<S>,
}

impl<'a, S> Next<'a, S> {
    pub(crate) fn new(run: &'a dyn Fn(&Action) -> Snapshot<S>) -> Self {
        Self { run }
    }

    pub fn run(&self, action: &Action) -> Snapshot<S> {
        (self.run)(action)
    }
}

pub trait Middleware<S>: Send + Sync {
    fn name(&self) -> &str;

    fn handle(
        &self,
        api: &MiddlewareApi<'_, S>,
        action: &Action,
        next: &Next<'_, S>,
    ) -> Result<Snapshot<S>, MiddlewareError>;
}

/// Logs each action with the state before and after it at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerMiddleware;

impl<S: Serialize> Middleware<S> for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    fn handle(
        &self,
        api: &MiddlewareApi<'_, S>,
        action: &Action,
        next: &Next<'_, S>,
    ) -> Result<Snapshot<S>, MiddlewareError> {
        if !log_enabled!(Level::Debug) {
            return Ok(next.run(action));
        }

        let previous = serde_json::to_string(api.get_state().as_ref())?;
        let state = next.run(action);
        let current = serde_json::to_string(state.as_ref())?;

        debug!(
            "Action {} from {}: prev={} next={}",
            action.kind,
            action
                .player_id
                .as_ref()
                .map(|id| id.as_str())
                .unwrap_or("host"),
            previous,
            current
        );
        Ok(state)
    }
}

type Rule = Box<dyn Fn(&Action) -> bool + Send + Sync>;

/// Drops actions whose payload fails the rule registered for their type.
///
/// Types without a rule pass through. Internal actions are never checked.
#[derive(Default)]
pub struct SchemaValidator {
    rules: HashMap<String, Rule>,
}

impl SchemaValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(
        mut self,
        kind: impl Into<String>,
        check: impl Fn(&Action) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(kind.into(), Box::new(check));
        self
    }

    pub fn accepts(&self, action: &Action) -> bool {
        if action.is_reserved() {
            return true;
        }
        self.rules
            .get(&action.kind)
            .map_or(true, |check| check(action))
    }
}

impl<S> Middleware<S> for SchemaValidator {
    fn name(&self) -> &str {
        "schema"
    }

    fn handle(
        &self,
        api: &MiddlewareApi<'_, S>,
        action: &Action,
        next: &Next<'_, S>,
    ) -> Result<Snapshot<S>, MiddlewareError> {
        if self.accepts(action) {
            return Ok(next.run(action));
        }

        warn!(
            "Dropped invalid action: type={} player={} payload={}",
            action.kind,
            action
                .player_id
                .as_ref()
                .map(|id| id.as_str())
                .unwrap_or("-"),
            action
                .payload
                .as_ref()
                .map(|payload| payload.to_string())
                .unwrap_or_else(|| "null".to_string())
        );
        Ok(Arc::clone(api.get_state()))
    }
}
