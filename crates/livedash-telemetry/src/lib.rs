//! Prometheus metrics and structured logging for livedash.
//!
//! - Prometheus metrics for subscriptions, buffers, the memory governor and
//!   dashboard sync
//! - Structured logging with tracing (JSON in production, pretty otherwise)

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
