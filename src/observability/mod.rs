//! Observability module
//!
//! Tracing setup and log hygiene helpers shared by the synchronizer.

pub mod telemetry;
