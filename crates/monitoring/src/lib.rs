//! Shared observability for the pipeline services: liveness gates, the
//! prometheus metrics route, and tracing/telemetry bootstrap.

mod gates;
mod metrics;
mod telemetry;

pub use gates::{healthz_router, GateFailure, Gates, HealthBody, LivenessArgs};
pub use metrics::metrics_router;
pub use telemetry::{init_tracing, TelemetryArgs};
