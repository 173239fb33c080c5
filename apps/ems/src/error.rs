//! Crate-level error.
//!
//! Each layer keeps its own error enum; [`EmsError`] gathers them for
//! callers that drive the whole daemon.

use duplex_transport::RpcError;
use thiserror::Error;

use crate::application::{BrokerdPortError, ServiceStopped};
use crate::domain::dialog::RoutingError;
use crate::domain::messages::SchemaError;
use crate::infrastructure::client_server::ClientServerError;
use crate::infrastructure::config::ConfigError;
use crate::observability::{MetricsError, TelemetryError};

/// Any failure surfaced by the ems crate.
#[derive(Debug, Error)]
pub enum EmsError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A message failed the schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// The routing engine refused an operation.
    #[error(transparent)]
    Routing(#[from] RoutingError),

    /// A broker session failed.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// A broker port refused a request.
    #[error(transparent)]
    Brokerd(#[from] BrokerdPortError),

    /// The client listener failed.
    #[error(transparent)]
    ClientServer(#[from] ClientServerError),

    /// The metrics exporter failed to start.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// Telemetry could not be installed.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    /// The routing service is gone.
    #[error(transparent)]
    ServiceStopped(#[from] ServiceStopped),
}

impl EmsError {
    /// Whether the failure came from configuration rather than runtime.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}
