//! Offline, deterministic replay of recorded sessions.
//!
//! A recording is the initial state plus every action in the order it was
//! applied. Replaying it through the same reducer reproduces the exact state
//! sequence; nothing here reads clocks or other ambient input.

use crate::Action;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("recording i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("recording is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedAction {
    pub action: Action,
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recording<T> {
    pub initial_state: Arc<T>,
    #[serde(default)]
    pub actions: Vec<RecordedAction>,
    pub start_timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_timestamp: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl<T> Recording<T> {
    pub fn new(initial_state: T, start_timestamp: u64) -> Self {
        Self {
            initial_state: Arc::new(initial_state),
            actions: Vec::new(),
            start_timestamp,
            end_timestamp: None,
            metadata: None,
        }
    }

    /// Appends an action. Recordings only ever grow.
    pub fn record(&mut self, action: Action, timestamp: u64) {
        self.actions.push(RecordedAction { action, timestamp });
    }

    pub fn finish(&mut self, end_timestamp: u64) {
        self.end_timestamp = Some(end_timestamp);
    }

    /// `end ?? last action ?? start`, minus `start`.
    pub fn duration(&self) -> u64 {
        let end = self
            .end_timestamp
            .or_else(|| self.actions.last().map(|recorded| recorded.timestamp))
            .unwrap_or(self.start_timestamp);
        end.saturating_sub(self.start_timestamp)
    }
}

impl<T: DeserializeOwned> Recording<T> {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

impl<T: Serialize> Recording<T> {
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ReplayError> {
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }
}

/// State after one replayed step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplaySnapshot<T> {
    pub state: Arc<T>,
    pub action: Action,
    pub timestamp: u64,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayResult<T> {
    pub final_state: Arc<T>,
    pub snapshots: Vec<ReplaySnapshot<T>>,
    pub duration: u64,
    pub action_count: usize,
}

/// Re-executes `recording` against `reducer`.
///
/// With no actions, `final_state` is the recording's own initial `Arc`.
pub fn replay<T, R>(recording: &Recording<T>, reducer: R) -> ReplayResult<T>
where
    R: Fn(&Arc<T>, &Action) -> Arc<T>,
{
    let mut state = Arc::clone(&recording.initial_state);
    let mut snapshots = Vec::with_capacity(recording.actions.len());

    for (index, recorded) in recording.actions.iter().enumerate() {
        state = reducer(&state, &recorded.action);
        snapshots.push(ReplaySnapshot {
            state: Arc::clone(&state),
            action: recorded.action.clone(),
            timestamp: recorded.timestamp,
            index,
        });
    }

    ReplayResult {
        final_state: state,
        snapshots,
        duration: recording.duration(),
        action_count: recording.actions.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    struct Tally {
        total: i64,
        history: Vec<i64>,
    }

    fn tally_reducer(state: &Arc<Tally>, action: &Action) -> Arc<Tally> {
        match action.kind.as_str() {
            "ADD" => {
                let amount = action
                    .payload
                    .as_ref()
                    .and_then(|p| p["amount"].as_i64())
                    .unwrap_or(0);
                let mut next = (**state).clone();
                next.total += amount;
                next.history.push(amount);
                Arc::new(next)
            }
            _ => Arc::clone(state),
        }
    }

    fn sample_recording() -> Recording<Tally> {
        let mut recording = Recording::new(Tally::default(), 1_000);
        recording.record(Action::new("ADD").with_payload(json!({ "amount": 5 })), 1_010);
        recording.record(Action::new("NOOP"), 1_020);
        recording.record(Action::new("ADD").with_payload(json!({ "amount": -2 })), 1_045);
        recording
    }

    #[test]
    fn test_replay_applies_in_order() {
        let recording = sample_recording();
        let result = replay(&recording, tally_reducer);

        assert_eq!(result.action_count, 3);
        assert_eq!(result.final_state.total, 3);
        assert_eq!(result.final_state.history, vec![5, -2]);
        assert_eq!(result.duration, 45);

        let indexes: Vec<usize> = result.snapshots.iter().map(|s| s.index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(result.snapshots[1].timestamp, 1_020);
        assert!(Arc::ptr_eq(
            &result.snapshots[0].state,
            &result.snapshots[1].state
        ));
    }

    #[test]
    fn test_replay_is_deterministic() {
        let recording = sample_recording();
        let first = replay(&recording, tally_reducer);
        let second = replay(&recording, tally_reducer);

        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first.snapshots).unwrap(),
            serde_json::to_string(&second.snapshots).unwrap()
        );
    }

    #[test]
    fn test_empty_recording() {
        let recording = Recording::new(Tally::default(), 500);
        let result = replay(&recording, tally_reducer);

        assert!(result.snapshots.is_empty());
        assert_eq!(result.duration, 0);
        assert_eq!(result.action_count, 0);
        assert!(Arc::ptr_eq(&result.final_state, &recording.initial_state));

        let again = replay(&recording, tally_reducer);
        assert_eq!(result, again);
    }

    #[test]
    fn test_end_timestamp_takes_precedence() {
        let mut recording = sample_recording();
        recording.finish(2_000);
        assert_eq!(recording.duration(), 1_000);

        // Clock skew never yields a negative duration.
        recording.finish(10);
        assert_eq!(recording.duration(), 0);
    }

    #[test]
    fn test_recording_file_roundtrip() {
        let mut recording = sample_recording();
        recording.metadata = Some(json!({ "host": "test" }));
        let path = std::env::temp_dir().join(format!("recording-{}.json", std::process::id()));

        recording.save(&path).unwrap();
        let loaded: Recording<Tally> = Recording::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(loaded, recording);
    }

    #[test]
    fn test_recording_wire_format() {
        let raw = json!({
            "initialState": { "total": 1, "history": [] },
            "actions": [{ "action": { "type": "ADD", "payload": { "amount": 2 } }, "timestamp": 7 }],
            "startTimestamp": 5
        });
        let recording: Recording<Tally> = serde_json::from_value(raw).unwrap();
        let result = replay(&recording, tally_reducer);

        assert_eq!(result.final_state.total, 3);
        assert_eq!(result.duration, 2);
    }
}
