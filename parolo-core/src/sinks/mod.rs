//! Downstream sinks for committed finals.
//!
//! Every sink owns its own worker, queue, and delivery guarantees; the
//! pipeline only hands events over. Sink failures never propagate — the
//! worst case is a WARN line and a dropped delivery.

pub mod caption;
pub mod discord;
pub mod transcript_log;
