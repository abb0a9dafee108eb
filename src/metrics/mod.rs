//! Prometheus metrics for the Dex Operator
//!
//! Counters for reconciliations, certificate rotations and filtered watch
//! events, plus the HTTP server exposing them.

pub mod prometheus;

pub use self::prometheus::*;
