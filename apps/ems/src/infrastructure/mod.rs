//! Infrastructure Layer - Adapters and external integrations.
//!
//! Concrete implementations of the application ports plus the daemon's
//! outer surfaces.

/// Broker adapter relays over JSON-RPC sessions.
pub mod brokerd;

/// Client WebSocket server.
pub mod client_server;

/// Environment-driven configuration.
pub mod config;
