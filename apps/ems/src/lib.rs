#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::items_after_statements,
        clippy::needless_pass_by_value
    )
)]

//! EMS - Order Routing Engine
//!
//! Routes client orders to broker adapters ("brokerd") and relays their
//! acks, statuses, fills and positions back to every client as dialog
//! statuses. Dark orders wait inside the ems until their trigger price is
//! crossed.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: message taxonomy and the dialog aggregate
//!   - `messages`: client and brokerd wire records, schema validation
//!   - `dialog`: dialog state machine, fill ledger, dark triggers
//!
//! - **Application**: routing rules and the task that owns them
//!   - `ports`: clock and broker adapter interfaces
//!   - `routing`: the synchronous routing engine
//!   - `service`: the single task applying commands to the engine
//!
//! - **Infrastructure**: adapters and surfaces
//!   - `brokerd`: JSON-RPC relays to broker adapters
//!   - `client_server`: client WebSocket server
//!   - `config`: environment configuration
//!
//! # Data Flow
//!
//! ```text
//! clients ──ws──► client_server ──┐                ┌──► BrokerdRelay ──rpc──► brokerd A
//!                                 ├─► EmsService ──┤
//! clients ◄─ws─── event queues ◄──┘   (engine)     └──► BrokerdRelay ──rpc──► brokerd B
//!                                          ▲                   │
//!                                          └── brokerd_event ──┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Messages and dialogs, no I/O.
pub mod domain;

/// Application layer - Routing engine, service loop and ports.
pub mod application;

/// Infrastructure layer - Broker relays, client server, configuration.
pub mod infrastructure;

/// Tracing subscriber and Prometheus metrics.
pub mod observability;

/// Daemon wiring.
pub mod daemon;

/// Crate-level error.
pub mod error;

// =============================================================================
// Re-exports
// =============================================================================

pub use application::{
    BrokerdPort, BrokerdPortError, ClientId, Clock, EmsCommand, EmsHandle, EmsService, Emit,
    ManualClock, Routes, RoutingEngine, SystemClock,
};
pub use daemon::{RunningEms, start};
pub use domain::dialog::{Dialog, DialogState, RoutingError};
pub use domain::messages::{ClientEvent, ClientInbound, ClientRequest, SchemaError, Status};
pub use error::EmsError;
pub use infrastructure::config::{ConfigError, EmsConfig};
