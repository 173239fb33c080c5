//! Observability: tracing subscriber setup and Prometheus metrics.

pub mod metrics;
pub mod telemetry;

pub use metrics::{MetricsConfig, MetricsError, init_metrics};
pub use telemetry::{TelemetryConfig, TelemetryError, TelemetryGuard};
