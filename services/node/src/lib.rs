//! Node service library crate.
//!
//! Exposes the node subsystems (config, TCP transport, observability,
//! wiring) for use by the node binary and integration tests.

pub mod config;
pub mod net;
pub mod observability;
pub mod wiring;
