//! Application Layer - Routing engine, service loop and port definitions.
//!
//! The engine is synchronous; the service is the single task that owns it
//! and talks to the outside through ports.

/// Port interfaces for clocks and broker adapters.
pub mod ports;

/// Dialog table and routing rules.
pub mod routing;

/// The task owning the routing engine.
pub mod service;

pub use ports::{BrokerdPort, BrokerdPortError, Clock, ManualClock, SystemClock};
pub use routing::{CONNECTION_LOST, Emit, NO_ROUTE, Routes, RoutingEngine};
pub use service::{ClientId, EmsCommand, EmsHandle, EmsService, ServiceStopped};
