//! Observability for the propai AI layer.
//!
//! - **Logging**: human-readable or JSON output via `tracing-subscriber`,
//!   filtered by `RUST_LOG` with a configurable default level.
//! - **Metrics**: labelled counters, gauges and histograms with Prometheus
//!   text export and a JSON snapshot. The AI service wrapper reports request
//!   outcomes and latencies here; A/B metric events land here too.

pub mod logging;
pub mod metrics;
