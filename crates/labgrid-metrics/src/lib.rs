//! labgrid-metrics — observability for labgrid.
//!
//! Holds gauges and counters in an explicit [`Registry`] created once by the
//! daemon and shared by `Arc`; there is no process-global metric state. The
//! [`MetricsExporter`] periodically refreshes the fleet gauges from the
//! object store, the broker bumps acquisition counters as it serves
//! requests, and [`render_prometheus`] produces the text exposition served
//! on `/metrics`.
//!
//! # Architecture
//!
//! ```text
//! Registry
//!   ├── GaugeVec / CounterVec families (label values → f64)
//!   └── render_prometheus() → text/plain for /metrics endpoint
//!
//! LabgridMetrics (the families labgrid exports)
//!   ├── MetricsExporter::refresh() ← StateStore (problems, workers, environments)
//!   └── acquisitions_total ← assignment broker
//! ```

pub mod error;
pub mod exporter;
pub mod families;
pub mod prometheus;
pub mod registry;

pub use error::{MetricsError, MetricsResult};
pub use exporter::MetricsExporter;
pub use families::LabgridMetrics;
pub use prometheus::render_prometheus;
pub use registry::{CounterVec, GaugeVec, MetricType, Registry};
