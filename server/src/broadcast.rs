//! Trailing-edge debounce for state pushes.
//!
//! Each dispatch pushes the deadline out by one interval and queues its
//! action. When the deadline passes, the engine sends one `STATE_UPDATE`
//! carrying the latest state and every queued action, in dispatch order.

use shared::Action;
use std::time::Duration;
use tokio::time::Instant;

pub struct BroadcastScheduler {
    interval: Duration,
    deadline: Option<Instant>,
    pending: Vec<Action>,
}

impl BroadcastScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            pending: Vec::new(),
        }
    }

    pub fn schedule(&mut self, action: Action, now: Instant) {
        self.pending.push(action);
        self.deadline = Some(now + self.interval);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clears the deadline and hands back the queued actions.
    pub fn take(&mut self) -> Vec<Action> {
        self.deadline = None;
        std::mem::take(&mut self.pending)
    }

    /// Drops the pending push without sending it.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.pending.clear();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_millis(33);

    #[test]
    fn test_deadline_trails_last_dispatch() {
        let mut scheduler = BroadcastScheduler::new(INTERVAL);
        let t0 = Instant::now();
        assert_eq!(scheduler.deadline(), None);

        scheduler.schedule(Action::new("A"), t0);
        scheduler.schedule(Action::new("B"), t0 + Duration::from_millis(20));

        assert_eq!(
            scheduler.deadline(),
            Some(t0 + Duration::from_millis(20) + INTERVAL)
        );
        // The first dispatch alone would have fired at t0 + INTERVAL.
        assert!(scheduler.deadline() > Some(t0 + INTERVAL));
    }

    #[test]
    fn test_take_preserves_order() {
        let mut scheduler = BroadcastScheduler::new(INTERVAL);
        let now = Instant::now();
        for kind in ["A", "B", "C"] {
            scheduler.schedule(Action::new(kind), now);
        }

        let kinds: Vec<String> = scheduler.take().into_iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec!["A", "B", "C"]);
        assert_eq!(scheduler.deadline(), None);
        assert_eq!(scheduler.pending_len(), 0);
    }

    #[test]
    fn test_cancel_discards_pending() {
        let mut scheduler = BroadcastScheduler::new(INTERVAL);
        let now = Instant::now();
        scheduler.schedule(Action::new("A"), now);

        scheduler.cancel();

        assert_eq!(scheduler.deadline(), None);
        assert!(scheduler.take().is_empty());
    }
}
