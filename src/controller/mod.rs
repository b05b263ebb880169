//! # Reconcilers
//!
//! The per-resource control loops:
//!
//! - `machine.rs` - reachability probes and hardware scans for `Machine`
//! - `configuration.rs` - the configuration reconcile state machine
//! - `gc.rs` - background sweep of stale checkout directories

pub mod configuration;
pub mod gc;
pub mod machine;
