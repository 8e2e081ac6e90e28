//! `elara-events` — live event fan-out to connected observers.
//!
//! Monitoring UIs subscribe to the [`LiveBus`] and receive a
//! [`LiveEvent`] for every job state change and frame batch. The
//! stream is advisory: the database stays the source of truth, so a
//! dropped subscriber just reconnects and re-fetches.

pub mod bus;

pub use bus::{LiveBus, LiveEvent};
