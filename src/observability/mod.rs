//! # Observability
//!
//! Prometheus metrics for the controller. The registry is process-global
//! and exposed by the metrics HTTP server.

pub mod metrics;
