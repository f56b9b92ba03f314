//! flowtrace collector library
//!
//! Consumer side of the tracing pipeline: drains reports, stores edge
//! rows, evaluates path queries and exports metrics. Also builds the
//! sampler and relay topology and the synthetic traffic that drives it.

pub mod collector;
pub mod events;
pub mod exporter;
pub mod policy;
pub mod store;
pub mod topology;
pub mod traffic;
pub mod types;

pub use collector::ReportCollector;
pub use events::ReportDrainer;
pub use exporter::{ExporterType, JsonExporter, MetricsExporter};
pub use policy::{PathAnalyzer, Policy};
pub use store::EdgeStore;
pub use topology::{Topology, TopologyLoader};
pub use traffic::TrafficGenerator;
pub use types::*;
