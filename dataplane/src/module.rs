//! Pipeline module contract
//!
//! A module consumes a batch of packets, may rewrite them in place, and
//! passes the same batch on. Modules are chained into a [`Pipeline`] and
//! driven by one worker at a time; control requests reach a module by
//! stage name.

use crate::error::{DataplaneError, Result};
use bytes::BytesMut;
use flowtrace_common::FlowKey;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One frame, starting at the link layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: BytesMut,
}

impl Packet {
    pub fn new(buf: BytesMut) -> Self {
        Self { buf }
    }

    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

impl From<BytesMut> for Packet {
    fn from(buf: BytesMut) -> Self {
        Self::new(buf)
    }
}

/// Ordered batch of packets handed from stage to stage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketBatch {
    packets: Vec<Packet>,
}

impl PacketBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet) {
        self.packets.push(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Packet> {
        self.packets.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Packet> {
        self.packets.iter_mut()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

impl From<Vec<Packet>> for PacketBatch {
    fn from(packets: Vec<Packet>) -> Self {
        Self { packets }
    }
}

impl FromIterator<Packet> for PacketBatch {
    fn from_iter<I: IntoIterator<Item = Packet>>(iter: I) -> Self {
        Self {
            packets: iter.into_iter().collect(),
        }
    }
}

/// 5-tuple as it appears in control requests
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowSpec {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowSpec {
    pub fn key(&self) -> FlowKey {
        FlowKey::new(
            u32::from(self.src_addr),
            u32::from(self.dst_addr),
            self.src_port,
            self.dst_port,
            self.protocol,
        )
    }
}

impl From<FlowKey> for FlowSpec {
    fn from(key: FlowKey) -> Self {
        Self {
            src_addr: key.src_ip(),
            dst_addr: key.dst_ip(),
            src_port: key.src_port,
            dst_port: key.dst_port,
            protocol: key.protocol,
        }
    }
}

/// Runtime control request
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum ControlRequest {
    SetEnabled { enabled: bool },
    GetStats,
    AddFlow { flow: FlowSpec, gate: u16 },
    DeleteFlow { flow: FlowSpec },
    LookupFlow { flow: FlowSpec },
    Flush,
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::SetEnabled { .. } => "set_enabled",
            ControlRequest::GetStats => "get_stats",
            ControlRequest::AddFlow { .. } => "add_flow",
            ControlRequest::DeleteFlow { .. } => "delete_flow",
            ControlRequest::LookupFlow { .. } => "lookup_flow",
            ControlRequest::Flush => "flush",
        }
    }
}

/// Sampler counters
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    /// Packets seen
    pub packets: u64,
    /// Packets whose flow had a table entry
    pub tracked: u64,
    /// Packets marked
    pub marked: u64,
    /// Packets forwarded untracked because the table was full
    pub untracked: u64,
    /// Frames with no flow key
    pub skipped: u64,
}

/// Relay counters
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq)]
pub struct RelayStats {
    pub hop_id: u8,
    pub enabled: bool,
    /// Packets seen since start
    pub packets: u64,
    /// Marked packets seen since start
    pub marked: u64,
    /// Reports handed to the ring since start
    pub reported: u64,
    /// Reports lost to pool or ring exhaustion since start
    pub dropped: u64,
    /// Reports in the current stats window
    pub window_processed: u64,
    pub window_dropped: u64,
}

/// Reply to a [`ControlRequest`]
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControlResponse {
    Ack,
    SamplerStats(SamplerStats),
    RelayStats(RelayStats),
    Flow { counter: u64, gate: u16 },
}

/// A packet-processing stage
pub trait Module: Send {
    /// Stage name used to route control requests
    fn name(&self) -> &str;

    /// Process a batch in place; the batch keeps its size and order
    fn process_batch(&mut self, batch: &mut PacketBatch);

    /// Handle a control request
    fn query(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        Err(DataplaneError::Unsupported(request.name().to_string()))
    }

    /// Release the module's resources
    fn deinit(&mut self) {}
}

/// Stages applied in order to every batch
#[derive(Default)]
pub struct Pipeline {
    stages: Vec<Box<dyn Module>>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage; names must be unique
    pub fn push(&mut self, stage: Box<dyn Module>) -> Result<()> {
        if self.stages.iter().any(|s| s.name() == stage.name()) {
            return Err(DataplaneError::invalid(format!(
                "stage {} already in pipeline",
                stage.name()
            )));
        }
        debug!("Pipeline stage added: {}", stage.name());
        self.stages.push(stage);
        Ok(())
    }

    pub fn process_batch(&mut self, batch: &mut PacketBatch) {
        for stage in self.stages.iter_mut() {
            stage.process_batch(batch);
        }
    }

    /// Route a control request to the stage called `name`
    pub fn query(&mut self, name: &str, request: &ControlRequest) -> Result<ControlResponse> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or(DataplaneError::NotFound)?;
        stage.query(request)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Tear down every stage in order
    pub fn deinit(&mut self) {
        for stage in self.stages.iter_mut() {
            stage.deinit();
        }
        info!("Pipeline shut down ({} stages)", self.stages.len());
        self.stages.clear();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .finish()
    }
}
