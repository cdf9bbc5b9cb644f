//! Consumer-side clock synchronization against the host.
//!
//! A client sends `PING{id, timestamp}` probes and the host answers each
//! with its own clock reading. For a reply received at `receive`:
//!
//! ```text
//! rtt    = receive - send
//! offset = server_time + rtt / 2 - receive
//! ```
//!
//! `offset` is what to add to the local clock to estimate host time.

use crate::{Probe, ProbeReply};
use std::collections::VecDeque;

pub const DEFAULT_MAX_PENDING: usize = 16;
pub const DEFAULT_MAX_SAMPLES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockSample {
    pub rtt: f64,
    pub offset: f64,
}

impl ClockSample {
    pub fn compute(send_time: u64, server_time: u64, receive_time: u64) -> Self {
        let rtt = receive_time as f64 - send_time as f64;
        let offset = server_time as f64 + rtt / 2.0 - receive_time as f64;
        Self { rtt, offset }
    }
}

/// Tracks outstanding probes and recent samples.
///
/// Pending probes are bounded; when the bound is hit the oldest probe is
/// forgotten, so lost replies cannot grow the table without limit.
#[derive(Debug)]
pub struct ClockSync {
    next_id: u64,
    pending: VecDeque<Probe>,
    max_pending: usize,
    samples: VecDeque<ClockSample>,
    max_samples: usize,
}

impl Default for ClockSync {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PENDING, DEFAULT_MAX_SAMPLES)
    }
}

impl ClockSync {
    pub fn new(max_pending: usize, max_samples: usize) -> Self {
        Self {
            next_id: 1,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            samples: VecDeque::new(),
            max_samples: max_samples.max(1),
        }
    }

    /// Creates the next probe and remembers when it was sent.
    pub fn begin(&mut self, now: u64) -> Probe {
        let probe = Probe {
            id: self.next_id,
            timestamp: now,
        };
        self.next_id += 1;

        if self.pending.len() == self.max_pending {
            self.pending.pop_front();
        }
        self.pending.push_back(probe);
        probe
    }

    /// Matches a reply to its probe. Replies to unknown or evicted probes
    /// are ignored.
    pub fn complete(&mut self, reply: &ProbeReply, receive_time: u64) -> Option<ClockSample> {
        let index = self.pending.iter().position(|probe| probe.id == reply.id)?;
        let probe = self.pending.remove(index)?;

        let sample = ClockSample::compute(probe.timestamp, reply.server_time, receive_time);
        if self.samples.len() == self.max_samples {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
        Some(sample)
    }

    /// Offset from the lowest-latency recent sample.
    pub fn best_offset(&self) -> Option<f64> {
        self.samples
            .iter()
            .min_by(|a, b| a.rtt.total_cmp(&b.rtt))
            .map(|sample| sample.offset)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn samples(&self) -> impl Iterator<Item = &ClockSample> {
        self.samples.iter()
    }
}
