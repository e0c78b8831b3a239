//! Engine of a network-measurement probe.
//!
//! The hard part of contacting a measurement backend from a censored
//! network is establishing the TLS connection at all: DNS may be poisoned,
//! the canonical IP blocked, the canonical SNI filtered. The engine answers
//! with a stream of connection *tactics* (address × SNI × verify-hostname)
//! raced by the dialer, wrapped in a [`Session`] that owns the probe's
//! identity, resolver, transport and backend selection.

pub mod core;

pub use crate::core::errors::EngineError;
pub use crate::core::session::{ExperimentSession, Session, SessionConfig};
