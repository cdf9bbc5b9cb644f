//! Stateless answers to client clock probes.

use shared::{Probe, ProbeReply};

/// Echoes the probe back with the host's clock reading.
pub fn respond(probe: &Probe, server_time: u64) -> ProbeReply {
    ProbeReply {
        id: probe.id,
        orig_timestamp: probe.timestamp,
        server_time,
    }
}
