//! Relay (probe) module
//!
//! Placed after the sampler, one instance per observation point. Every
//! marked packet produces one report `(flow, previous hop, this hop,
//! timestamp)` and leaves carrying this hop's id, so the next relay can
//! report the edge it just traversed.
//!
//! Reports travel through the shared [`ReportTransport`]. Running out of
//! buffers or ring space costs reports, never packets; the loss is counted
//! and logged once per stats window.

use crate::codec::parse_flow;
use crate::config::RelayConfig;
use crate::error::{DataplaneError, Result};
use crate::helpers::{get_timestamp, hop_id_as_mark, increment_stat};
use crate::marking::{HeaderMarkingChannel, Ipv4IdChannel};
use crate::module::{ControlRequest, ControlResponse, Module, PacketBatch, RelayStats};
use crate::transport::{ReportBuf, ReportTransport};
use flowtrace_common::{constants::*, ReportRecord};
use log::{debug, info, warn};
use std::sync::Arc;

/// Report counters for the current stats window
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct StatsWindow {
    processed: u64,
    dropped: u64,
    start: Option<f64>,
}

/// Relay stage
#[derive(Debug)]
pub struct RelayModule {
    name: String,
    hop_id: u8,
    enabled: bool,
    channel: Arc<dyn HeaderMarkingChannel>,
    transport: Arc<ReportTransport>,
    window: StatsWindow,
    totals: RelayStats,
}

impl RelayModule {
    pub fn new(
        name: impl Into<String>,
        config: &RelayConfig,
        transport: Arc<ReportTransport>,
    ) -> Result<Self> {
        config.validate()?;
        let hop_id = hop_id_as_mark(config.hop_id)
            .ok_or_else(|| DataplaneError::invalid(format!("hop id {} out of range", config.hop_id)))?;
        let name = name.into();

        info!(
            "Relay {} initialised: hop {} ({})",
            name,
            hop_id,
            if config.enabled { "enabled" } else { "disabled" }
        );

        Ok(Self {
            name,
            hop_id,
            enabled: config.enabled,
            channel: Arc::new(Ipv4IdChannel),
            transport,
            window: StatsWindow::default(),
            totals: RelayStats {
                hop_id,
                enabled: config.enabled,
                ..Default::default()
            },
        })
    }

    /// Replace the marking channel
    pub fn with_channel(mut self, channel: Arc<dyn HeaderMarkingChannel>) -> Self {
        self.channel = channel;
        self
    }

    pub fn hop_id(&self) -> u8 {
        self.hop_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        if self.enabled != enabled {
            info!(
                "Relay {} {}",
                self.name,
                if enabled { "enabled" } else { "disabled" }
            );
        }
        self.enabled = enabled;
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            hop_id: self.hop_id,
            enabled: self.enabled,
            window_processed: self.window.processed,
            window_dropped: self.window.dropped,
            ..self.totals
        }
    }

    /// Process a batch with `now` as the report timestamp
    pub fn process_batch_at(&mut self, batch: &mut PacketBatch, now: f64) {
        self.window.start.get_or_insert(now);

        if self.enabled && !batch.is_empty() {
            self.relay(batch, now);
        }

        self.roll_window(now);
    }

    /// Close the stats window once it is at least one second old
    ///
    /// # Returns
    ///
    /// The closed window's `(processed, dropped)` counts
    pub fn roll_window(&mut self, now: f64) -> Option<(u64, u64)> {
        let start = *self.window.start.get_or_insert(now);
        if now - start < STATS_WINDOW_SECS {
            return None;
        }

        let StatsWindow { processed, dropped, .. } = self.window;
        let total = processed + dropped;
        let drop_ratio = if total > 0 {
            dropped as f64 / total as f64
        } else {
            0.0
        };
        info!(
            "Relay {} (hop {}): {} reports, {} dropped ({:.2}% drop) over {:.2}s",
            self.name,
            self.hop_id,
            processed,
            dropped,
            drop_ratio * 100.0,
            now - start
        );

        self.window = StatsWindow {
            processed: 0,
            dropped: 0,
            start: Some(now),
        };
        Some((processed, dropped))
    }

    fn relay(&mut self, batch: &mut PacketBatch, now: f64) {
        // (packet index, ip offset, flow, previous hop) per marked packet
        let mut marked = Vec::new();
        for (idx, packet) in batch.iter().enumerate() {
            increment_stat(&mut self.totals.packets, 1);

            let Ok(parsed) = parse_flow(packet.data()) else {
                continue;
            };
            if let Some(prev_hop) = self.channel.decode(packet.data(), parsed.ip_offset) {
                marked.push((idx, parsed.ip_offset, parsed.key, prev_hop));
            }
        }
        if marked.is_empty() {
            return;
        }
        increment_stat(&mut self.totals.marked, marked.len() as u64);

        let transport = Arc::clone(&self.transport);
        let pool = &transport.pool;
        let ring = &transport.ring;

        let bufs = match pool.acquire_bulk(marked.len()) {
            Some(bufs) => bufs,
            None => {
                // Take back reports the collector has not consumed yet
                let reclaimed = ring.dequeue_burst(marked.len());
                if !reclaimed.is_empty() {
                    debug!(
                        "Relay {} reclaimed {} queued reports",
                        self.name,
                        reclaimed.len()
                    );
                }
                self.count_dropped(reclaimed.len() as u64);
                reclaimed
            }
        };

        let mut spare = bufs.into_iter();
        let mut filled: Vec<ReportBuf> = Vec::with_capacity(marked.len());
        let mut unbuffered = 0u64;
        let mut targets = marked.into_iter().peekable();

        for (idx, packet) in batch.iter_mut().enumerate() {
            let Some(&(_, ip_offset, key, prev_hop)) = targets.peek().filter(|t| t.0 == idx) else {
                continue;
            };
            targets.next();

            self.channel.encode(packet.data_mut(), ip_offset, self.hop_id);

            match spare.next() {
                Some(mut buf) => {
                    *buf = ReportRecord::new(&key, prev_hop as u32, self.hop_id as u32, now);
                    filled.push(buf);
                }
                None => unbuffered += 1,
            }
        }

        pool.release_bulk(spare);
        self.count_dropped(unbuffered);

        let enqueued = ring.enqueue_burst(&mut filled) as u64;
        if !filled.is_empty() {
            self.count_dropped(filled.len() as u64);
            pool.release_bulk(filled);
        }

        increment_stat(&mut self.window.processed, enqueued);
        increment_stat(&mut self.totals.reported, enqueued);
    }

    fn count_dropped(&mut self, n: u64) {
        increment_stat(&mut self.window.dropped, n);
        increment_stat(&mut self.totals.dropped, n);
    }
}

impl Module for RelayModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn process_batch(&mut self, batch: &mut PacketBatch) {
        self.process_batch_at(batch, get_timestamp());
    }

    fn query(&mut self, request: &ControlRequest) -> Result<ControlResponse> {
        match request {
            ControlRequest::SetEnabled { enabled } => {
                self.set_enabled(*enabled);
                Ok(ControlResponse::Ack)
            }
            ControlRequest::GetStats => Ok(ControlResponse::RelayStats(self.stats())),
            other => Err(DataplaneError::Unsupported(other.name().to_string())),
        }
    }

    fn deinit(&mut self) {
        let stats = self.stats();
        if stats.dropped > 0 {
            warn!(
                "Relay {} shut down with {} of {} reports dropped",
                self.name,
                stats.dropped,
                stats.reported + stats.dropped
            );
        } else {
            info!("Relay {} shut down: {} reports", self.name, stats.reported);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{build_frame, ip_id, ipv4_checksum};
    use crate::config::TransportConfig;
    use crate::module::Packet;
    use flowtrace_common::FlowKey;

    fn transport(pool_size: usize, ring_size: usize) -> Arc<ReportTransport> {
        Arc::new(ReportTransport::new(&TransportConfig { pool_size, ring_size }).unwrap())
    }

    fn key() -> FlowKey {
        FlowKey::new(0xc0a8_0001, 0xc0a8_0002, 5000, 6000, IPPROTO_UDP)
    }

    fn marked_batch(prev_hop: u8, len: usize) -> PacketBatch {
        (0..len)
            .map(|_| Packet::new(build_frame(&key(), Ipv4IdChannel::field_value(prev_hop), 4)))
            .collect()
    }

    fn relay(hop: u32, transport: &Arc<ReportTransport>) -> RelayModule {
        RelayModule::new(format!("relay{}", hop), &RelayConfig::new(hop), Arc::clone(transport)).unwrap()
    }

    #[test]
    fn test_relay_chaining() {
        let transport = transport(8, 8);
        let mut relay = relay(5, &transport);
        let mut batch = marked_batch(ORIGIN_HOP_ID, 1);

        relay.process_batch_at(&mut batch, 10.0);

        let packet = batch.iter().next().unwrap();
        assert_eq!(ip_id(packet.data(), ETHER_HDR_LEN), Some(0x05EF));
        assert_eq!(
            ipv4_checksum(&packet.data()[ETHER_HDR_LEN..ETHER_HDR_LEN + IPV4_MIN_HDR_LEN]),
            0
        );

        let reports = transport.ring.dequeue_burst(BURST_SIZE);
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].prev_hop_id, 0);
        assert_eq!(reports[0].this_hop_id, 5);
        assert_eq!(reports[0].timestamp, 10.0);
        assert_eq!(reports[0].flow_key(), key());
        assert_eq!(transport.pool.available(), 7);
    }

    #[test]
    fn test_two_hops_report_each_edge() {
        let transport = transport(8, 8);
        let mut first = relay(1, &transport);
        let mut second = relay(2, &transport);
        let mut batch = marked_batch(ORIGIN_HOP_ID, 1);

        first.process_batch_at(&mut batch, 1.0);
        second.process_batch_at(&mut batch, 1.0);

        let edges: Vec<(u32, u32)> = transport
            .ring
            .dequeue_burst(BURST_SIZE)
            .iter()
            .map(|r| (r.prev_hop_id, r.this_hop_id))
            .collect();
        assert_eq!(edges, vec![(0, 1), (1, 2)]);
    }

    #[test]
    fn test_unmarked_packets_ignored() {
        let transport = transport(8, 8);
        let mut relay = relay(3, &transport);
        let mut batch: PacketBatch = (0..4)
            .map(|_| Packet::new(build_frame(&key(), 0x1234, 0)))
            .collect();

        relay.process_batch_at(&mut batch, 0.0);

        assert!(transport.ring.is_empty());
        assert_eq!(transport.pool.available(), 8);
        assert!(batch.iter().all(|p| ip_id(p.data(), ETHER_HDR_LEN) == Some(0x1234)));
        assert_eq!(relay.stats().packets, 4);
        assert_eq!(relay.stats().marked, 0);
    }

    #[test]
    fn test_disabled_passthrough() {
        let transport = transport(8, 8);
        let mut relay = relay(4, &transport);
        assert_eq!(
            relay.query(&ControlRequest::SetEnabled { enabled: false }),
            Ok(ControlResponse::Ack)
        );

        let mut batch = marked_batch(ORIGIN_HOP_ID, 2);
        let before = batch.clone();
        relay.process_batch_at(&mut batch, 0.0);

        assert_eq!(batch, before);
        assert!(transport.ring.is_empty());
        assert!(!relay.stats().enabled);
    }

    #[test]
    fn test_pool_exhaustion_reclaims_from_ring() {
        let transport = transport(2, 4);
        let mut relay = relay(1, &transport);

        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 2), 0.0);
        assert_eq!(transport.pool.available(), 0);
        assert_eq!(transport.ring.len(), 2);

        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 2), 0.1);
        let stats = relay.stats();
        assert_eq!(stats.reported, 4);
        assert_eq!(stats.dropped, 2);
        assert_eq!(transport.ring.len(), 2);
    }

    #[test]
    fn test_unmarked_batch_leaves_queue_alone() {
        let transport = transport(2, 4);
        let mut relay = relay(1, &transport);

        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 2), 0.0);
        assert_eq!(transport.pool.available(), 0);

        let mut plain: PacketBatch = (0..8)
            .map(|_| Packet::new(build_frame(&key(), 0x1234, 0)))
            .collect();
        relay.process_batch_at(&mut plain, 0.1);

        assert_eq!(transport.ring.len(), 2);
        assert_eq!(relay.stats().dropped, 0);
    }

    #[test]
    fn test_buffers_sized_to_marked_packets() {
        let transport = transport(2, 4);
        let mut relay = relay(1, &transport);

        let mut batch: PacketBatch = (0..6)
            .map(|i| {
                let id = if i == 3 {
                    Ipv4IdChannel::field_value(ORIGIN_HOP_ID)
                } else {
                    0x1234
                };
                Packet::new(build_frame(&key(), id, 0))
            })
            .collect();
        relay.process_batch_at(&mut batch, 0.0);

        let stats = relay.stats();
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.reported, 1);
        assert_eq!(stats.dropped, 0);
        assert_eq!(transport.pool.available(), 1);
        let ids: Vec<Option<u16>> = batch.iter().map(|p| ip_id(p.data(), ETHER_HDR_LEN)).collect();
        assert_eq!(ids[3], Some(0x01EF));
        assert_eq!(ids[0], Some(0x1234));
    }

    #[test]
    fn test_ring_full_counts_drops() {
        let transport = transport(4, 1);
        let mut relay = relay(1, &transport);
        let mut batch = marked_batch(ORIGIN_HOP_ID, 3);

        relay.process_batch_at(&mut batch, 0.0);

        let stats = relay.stats();
        assert_eq!(stats.reported, 1);
        assert_eq!(stats.dropped, 2);
        assert_eq!(transport.pool.available(), 3);
        // Packets are relayed regardless
        assert!(batch.iter().all(|p| ip_id(p.data(), ETHER_HDR_LEN) == Some(0x01EF)));
    }

    #[test]
    fn test_stats_window_rolls_after_one_second() {
        let transport = transport(16, 16);
        let mut relay = relay(1, &transport);

        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 1), 0.0);
        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 1), 0.5);
        assert_eq!(relay.stats().window_processed, 2);

        relay.process_batch_at(&mut marked_batch(ORIGIN_HOP_ID, 1), 1.2);
        assert_eq!(relay.stats().window_processed, 0);
        assert_eq!(relay.stats().reported, 3);

        assert_eq!(relay.roll_window(1.5), None);
        assert_eq!(relay.roll_window(2.5), Some((0, 0)));
    }

    #[test]
    fn test_rejects_bad_hop() {
        let transport = transport(1, 1);
        assert!(RelayModule::new("relay0", &RelayConfig::new(0), Arc::clone(&transport)).is_err());
        assert!(RelayModule::new("relay256", &RelayConfig::new(256), transport).is_err());
    }
}
