//! # dnsgate Telemetry
//!
//! Logging and metrics for the policy engine and its collaborators.

pub mod logging;
pub mod metrics;

pub use logging::EventLogger;
pub use metrics::MetricsRecorder;
