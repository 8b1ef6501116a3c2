//! Anonymous two-party chat relay.
//!
//! Pairs verified WebSocket connections into two-party rooms, relays text
//! and consent-gated photo payloads between partners, and re-queues users
//! on skip.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
mod connection;
/// Error types for relay server operations.
pub mod error;
/// Matchmaking queue and room registry.
pub mod matchmaker;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// JSON wire protocol messages.
pub mod protocol;
mod ratelimit;
/// Accept loop and shared server state.
pub mod server;
/// Human-verification gate collaborator client.
pub mod verify;

pub use server::{run, run_with_shutdown, ServerState};
