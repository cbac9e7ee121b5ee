//! Observability plumbing for the tandem orchestration crates.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: in-process counters and histograms for backend calls,
//!   retries, budget alerts and orchestrations
//! - **Tracing**: trace/span id generation so one orchestration's backend
//!   calls can be correlated in logs

pub mod logging;
pub mod metrics;
pub mod tracing_setup;
