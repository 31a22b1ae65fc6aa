//! Rate gate for repetitive warnings.
//!
//! A sink whose endpoint is down fails on every delivery; logging each
//! failure drowns the terminal. The gate lets one line through per interval
//! and reports how many were suppressed since.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

pub struct LogGate {
    interval: Duration,
    state: Mutex<GateState>,
}

struct GateState {
    last_emitted: Option<Instant>,
    suppressed: u64,
}

impl LogGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            state: Mutex::new(GateState {
                last_emitted: None,
                suppressed: 0,
            }),
        }
    }

    /// One warning per minute, the collapse interval required for repeated
    /// sink failures.
    pub fn per_minute() -> Self {
        Self::new(Duration::from_secs(60))
    }

    /// Returns `Some(suppressed_count)` when the caller should log now,
    /// `None` when the line should be swallowed.
    pub fn permit(&self) -> Option<u64> {
        let mut state = self.state.lock();
        let now = Instant::now();
        match state.last_emitted {
            Some(last) if now.duration_since(last) < self.interval => {
                state.suppressed += 1;
                None
            }
            _ => {
                let suppressed = state.suppressed;
                state.last_emitted = Some(now);
                state.suppressed = 0;
                Some(suppressed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_always_permits() {
        let gate = LogGate::per_minute();
        assert_eq!(gate.permit(), Some(0));
    }

    #[test]
    fn calls_within_interval_are_suppressed_and_counted() {
        let gate = LogGate::new(Duration::from_secs(60));
        assert!(gate.permit().is_some());
        assert!(gate.permit().is_none());
        assert!(gate.permit().is_none());
        // Force the window open again.
        gate.state.lock().last_emitted = Some(Instant::now() - Duration::from_secs(61));
        assert_eq!(gate.permit(), Some(2));
    }
}
