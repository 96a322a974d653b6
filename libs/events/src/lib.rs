//! # fleetsim-events
//!
//! Event type definitions and serialization for the fleet simulator.
//!
//! ## Design Principles
//!
//! - Events are immutable records of applied lifecycle transitions
//! - Every event belongs to exactly one aggregate
//! - Events are versioned for schema evolution
//!
//! Reconciliation controllers consume these events to observe instance
//! loss the same way they would observe a real node failure, so every
//! termination carries its cause (controller request, chaos, boot failure).
//!
//! ## Event Types
//!
//! - Instance events (`instance.*`)
//! - Snapshot events (`snapshot.*`)
//! - Fleet events (`fleet.*`)

mod envelope;
mod types;

pub use envelope::*;
pub use types::*;
