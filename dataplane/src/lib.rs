//! Flowtrace Dataplane Library
//!
//! Flow tracking, streaming packet sampling and in-band hop relaying for a
//! batch-oriented packet pipeline.

pub mod codec;
pub mod config;
pub mod error;
pub mod flowtable;
pub mod helpers;
pub mod marking;
pub mod module;
pub mod relay;
pub mod sampler;
pub mod shared;
pub mod transport;

pub use config::{FlowTableConfig, PipelineConfig, RelayConfig, SamplerConfig, TransportConfig};
pub use error::{DataplaneError, ParseError, Result};
pub use flowtable::{FlowEntry, FlowTable};
pub use marking::{HeaderMarkingChannel, Ipv4IdChannel};
pub use module::{
    ControlRequest, ControlResponse, FlowSpec, Module, Packet, PacketBatch, Pipeline, RelayStats,
    SamplerStats,
};
pub use relay::RelayModule;
pub use sampler::SamplerModule;
pub use shared::SharedFlowTable;
pub use transport::{ReportPool, ReportRing, ReportTransport};
