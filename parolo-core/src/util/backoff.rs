//! Exponential backoff with jitter.
//!
//! One policy object serves every retry site: audio device re-open, cloud
//! reconnect, caption and webhook delivery. Each site picks its own floor
//! and ceiling; the growth factor is fixed at 2.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
            jitter: false,
        }
    }

    /// Randomize each delay within ±50 % to avoid thundering-herd reconnects.
    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// The delay to sleep before the next attempt. Doubles per call up to the
    /// ceiling.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            base.mul_f64(factor).min(self.max)
        } else {
            base
        }
    }

    /// Call after a successful attempt so the next failure starts at the floor.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}
