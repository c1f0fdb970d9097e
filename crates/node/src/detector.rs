//! Heartbeat bookkeeping and dead-neighbor detection.
//!
//! The detector only answers "who died since the last sweep"; reacting to
//! a death (healing) is the caller's job, see [`healing_targets`].

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

pub struct FailureDetector {
    neighbors: BTreeSet<u16>,
    alive: BTreeSet<u16>,
    last_seen: HashMap<u16, Instant>,
    dead_after: Duration,
}

impl FailureDetector {
    /// Every neighbor starts alive, as if it had just sent a heartbeat.
    pub fn new(neighbors: &[u16], dead_after: Duration, now: Instant) -> Self {
        let neighbors: BTreeSet<u16> = neighbors.iter().copied().collect();
        Self {
            alive: neighbors.clone(),
            last_seen: neighbors.iter().map(|port| (*port, now)).collect(),
            neighbors,
            dead_after,
        }
    }

    /// Records a heartbeat. Ports outside the fixed neighbor set are ignored
    /// so the alive set never grows beyond it.
    pub fn observe(&mut self, port: u16, now: Instant) -> bool {
        if !self.neighbors.contains(&port) {
            return false;
        }
        self.last_seen.insert(port, now);
        self.alive.insert(port)
    }

    /// Removes and returns every alive neighbor silent for longer than the
    /// threshold.
    pub fn sweep(&mut self, now: Instant) -> Vec<u16> {
        let dead: Vec<u16> = self
            .alive
            .iter()
            .copied()
            .filter(|port| {
                let last = self.last_seen.get(port).copied().unwrap_or(now);
                now.saturating_duration_since(last) > self.dead_after
            })
            .collect();
        for port in &dead {
            self.alive.remove(port);
        }
        dead
    }

    pub fn alive(&self) -> Vec<u16> {
        self.alive.iter().copied().collect()
    }

}

/// Peers asked to re-send their inventory after `dead` was declared dead:
/// whoever is still alive. No gap analysis is done.
pub fn healing_targets(detector: &FailureDetector, dead: u16) -> Vec<u16> {
    detector
        .alive()
        .into_iter()
        .filter(|port| *port != dead)
        .collect()
}
