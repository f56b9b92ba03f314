//! Flow-tracking sampler
//!
//! First stage of the pipeline. For every TCP/UDP packet it finds or
//! creates the flow's table entry, decides from the flow's packet count
//! whether the packet is sampled, and marks sampled packets with the
//! origin hop id so relays further down can pick them up.
//!
//! ## Sampling rule
//!
//! With `n` the flow's count before this packet and `K` the sample target,
//! the packet is marked when `n < K`, or when a uniform draw from `[0, n)`
//! falls below `K`. The count is incremented either way.

use crate::codec::parse_flow;
use crate::config::SamplerConfig;
use crate::error::{DataplaneError, Result};
use crate::flowtable::FlowTable;
use crate::helpers::increment_stat;
use crate::marking::{HeaderMarkingChannel, Ipv4IdChannel};
use crate::module::{ControlRequest, ControlResponse, Module, PacketBatch, SamplerStats};
use crate::shared::SharedFlowTable;
use flowtrace_common::constants::*;
use log::{debug, info, trace, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

/// Streaming per-flow inclusion rule
#[derive(Debug, Clone)]
pub struct SamplingRule {
    target: u64,
    rng: SmallRng,
}

impl SamplingRule {
    pub fn new(target: u64, seed: u64) -> Self {
        Self {
            target,
            rng: SmallRng::seed_from_u64(seed),
        }
    }

    /// Whether the packet after `n` earlier ones is sampled
    #[inline(always)]
    pub fn decide(&mut self, n: u64) -> bool {
        n < self.target || self.rng.gen_range(0..n) < self.target
    }

    pub fn target(&self) -> u64 {
        self.target
    }
}

/// Sampling stage
#[derive(Debug)]
pub struct SamplerModule {
    name: String,
    table: Option<SharedFlowTable>,
    channel: Arc<dyn HeaderMarkingChannel>,
    rule: SamplingRule,
    stats: SamplerStats,
}

impl SamplerModule {
    /// Build a sampler with its own flow table
    pub fn new(name: impl Into<String>, config: &SamplerConfig) -> Result<Self> {
        config.validate()?;
        let geometry = config.table.or_defaults();
        let table = FlowTable::new(geometry.size, geometry.bucket_depth)?;
        Self::with_table(name, SharedFlowTable::new(table), config)
    }

    /// Build a sampler on an already attached table
    ///
    /// The table geometry in `config` is ignored.
    pub fn with_table(
        name: impl Into<String>,
        table: SharedFlowTable,
        config: &SamplerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        info!(
            "Sampler {} initialised: K = {}, seed = {}",
            name, config.sample_target, config.rng_seed
        );

        Ok(Self {
            name,
            table: Some(table),
            channel: Arc::new(Ipv4IdChannel),
            rule: SamplingRule::new(config.sample_target, config.rng_seed),
            stats: SamplerStats::default(),
        })
    }

    /// Replace the marking channel
    pub fn with_channel(mut self, channel: Arc<dyn HeaderMarkingChannel>) -> Self {
        self.channel = channel;
        self
    }

    /// Handle to the flow table, for attaching further modules
    pub fn table(&self) -> Option<&SharedFlowTable> {
        self.table.as_ref()
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    fn table_ref(&self) -> Result<&SharedFlowTable> {
        self.table
            .as_ref()
            .ok_or_else(|| DataplaneError::invalid(format!("sampler {} is shut down", self.name)))
    }
}

impl Module for SamplerModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_batch(&mut self, batch: &mut PacketBatch) {
        let Some(shared) = self.table.as_ref() else {
            return;
        };
        let mut table = match shared.lock() {
            Ok(table) => table,
            Err(e) => {
                warn!("Sampler {} passing batch through: {}", self.name, e);
                return;
            }
        };

        let stats = &mut self.stats;
        for packet in batch.iter_mut() {
            increment_stat(&mut stats.packets, 1);

            let parsed = match parse_flow(packet.data()) {
                Ok(parsed) => parsed,
                Err(_) => {
                    increment_stat(&mut stats.skipped, 1);
                    continue;
                }
            };

            let entry = match table.find_or_insert(&parsed.key) {
                Ok(entry) => entry,
                Err(e) => {
                    trace!("Flow {} untracked: {}", parsed.key, e);
                    increment_stat(&mut stats.untracked, 1);
                    continue;
                }
            };
            increment_stat(&mut stats.tracked, 1);

            let sampled = self.rule.decide(entry.counter());
            *entry.counter_mut() += 1;

            if sampled && self.channel.encode(packet.data_mut(), parsed.ip_offset, ORIGIN_HOP_ID) {
                increment_stat(&mut stats.marked, 1);
            }
        }
    }

    fn query(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::GetStats => Ok(ControlResponse::SamplerStats(self.stats)),
            ControlRequest::AddFlow { flow, gate } => {
                if *gate >= INVALID_GATE {
                    return Err(DataplaneError::invalid(format!(
                        "gate {} must be below {}",
                        gate, INVALID_GATE
                    )));
                }
                let key = flow.key();
                let mut table = self.table_ref()?.lock()?;
                table.insert(&key)?;
                table.find_entry(&key)?.set_gate(*gate)?;
                debug!("Sampler {} added flow {} on gate {}", self.name, key, gate);
                Ok(ControlResponse::Ack)
            }
            ControlRequest::DeleteFlow { flow } => {
                self.table_ref()?.lock()?.delete(&flow.key())?;
                Ok(ControlResponse::Ack)
            }
            ControlRequest::LookupFlow { flow } => {
                let table = self.table_ref()?.lock()?;
                let entry = table.get(&flow.key()).ok_or(DataplaneError::NotFound)?;
                Ok(ControlResponse::Flow {
                    counter: entry.counter(),
                    gate: entry.gate(),
                })
            }
            ControlRequest::Flush => {
                self.table_ref()?.lock()?.flush()?;
                info!("Sampler {} flushed its flow table", self.name);
                Ok(ControlResponse::Ack)
            }
            other => Err(DataplaneError::Unsupported(other.name().to_string())),
        }
    }

    fn deinit(&mut self) {
        if let Some(table) = self.table.take() {
            match table.detach() {
                Ok(released) => debug!("Sampler {} detached (released = {})", self.name, released),
                Err(e) => warn!("Sampler {} failed to detach: {}", self.name, e),
            }
        }
    }
}
