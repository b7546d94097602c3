//! A minimal once-per-interval log gate for noisy steady-state conditions
//! (pool exhaustion, repeated upstream failures) that would otherwise spam
//! `tracing` at line rate. Deliberately `Instant`-based rather than a
//! `governor`-style token bucket — the teacher's stack never reaches for
//! a rate-limiting crate, and one sample a minute is all an operator
//! needs to notice the condition.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const GATE_INTERVAL: Duration = Duration::from_secs(60);

/// Tracks the last time a given log site fired and reports whether it
/// should fire again. One `LogGate` per distinct condition ("kind").
#[derive(Debug, Default)]
pub struct LogGate {
    last_fired: Mutex<Option<Instant>>,
}

impl LogGate {
    pub fn new() -> Self {
        LogGate {
            last_fired: Mutex::new(None),
        }
    }

    /// True at most once per [`GATE_INTERVAL`]; call this immediately
    /// before logging and only log when it returns `true`.
    pub fn fire(&self, now: Instant) -> bool {
        let mut last = self.last_fired.lock().unwrap();
        match *last {
            Some(t) if now.duration_since(t) < GATE_INTERVAL => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
