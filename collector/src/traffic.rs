//! Synthetic traffic source
//!
//! Generates Ethernet/IPv4 frames over a fixed set of flows. Flow choice
//! is seeded, so a run can be replayed exactly.

use bytes::BytesMut;
use flowtrace_common::{constants::*, FlowKey};
use flowtrace_dataplane::{codec::build_frame, Packet, PacketBatch};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Seeded frame generator
#[derive(Debug, Clone)]
pub struct TrafficGenerator {
    flows: Vec<FlowKey>,
    rng: SmallRng,
    next_ip_id: u16,
    payload_len: usize,
    non_ip_every: u64,
    generated: u64,
}

impl TrafficGenerator {
    /// Create a generator over `flows` distinct flows
    ///
    /// Flows alternate between TCP and UDP and run from 10.0.0.0/16 to
    /// 10.1.0.0/16.
    pub fn new(flows: usize, seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let flows = (0..flows.max(1))
            .map(|i| {
                let protocol = if i % 2 == 0 { IPPROTO_UDP } else { IPPROTO_TCP };
                FlowKey::new(
                    0x0a00_0000 | (i as u32 & 0xffff),
                    0x0a01_0000 | rng.gen_range(1..=0xfffeu32),
                    rng.gen_range(1024..=u16::MAX),
                    [53, 80, 443, 8080][i % 4],
                    protocol,
                )
            })
            .collect();

        Self {
            flows,
            rng,
            next_ip_id: 1,
            payload_len: 64,
            non_ip_every: 0,
            generated: 0,
        }
    }

    /// Bytes of payload after the transport header
    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    /// Emit one non-IPv4 frame every `n` frames (0 disables)
    pub fn with_non_ip_every(mut self, n: u64) -> Self {
        self.non_ip_every = n;
        self
    }

    pub fn flows(&self) -> &[FlowKey] {
        &self.flows
    }

    /// Frames generated so far
    pub fn generated(&self) -> u64 {
        self.generated
    }

    /// Build a batch of `size` frames
    pub fn next_batch(&mut self, size: usize) -> PacketBatch {
        (0..size).map(|_| self.next_packet()).collect()
    }

    pub fn next_packet(&mut self) -> Packet {
        self.generated += 1;

        if self.non_ip_every > 0 && self.generated % self.non_ip_every == 0 {
            return Packet::new(Self::arp_frame());
        }

        let key = self.flows[self.rng.gen_range(0..self.flows.len())];
        let ip_id = self.take_ip_id();
        Packet::new(build_frame(&key, ip_id, self.payload_len))
    }

    /// Next identification value whose low byte is not the mark tag
    fn take_ip_id(&mut self) -> u16 {
        let mut id = self.next_ip_id;
        if id as u8 == MARK_TAG {
            id = id.wrapping_add(1);
        }
        self.next_ip_id = id.wrapping_add(1);
        id
    }

    fn arp_frame() -> BytesMut {
        let mut frame = BytesMut::zeroed(ETHER_HDR_LEN + 28);
        frame[..6].fill(0xff);
        frame[ETHER_TYPE_OFFSET..ETHER_TYPE_OFFSET + 2].copy_from_slice(&0x0806u16.to_be_bytes());
        frame
    }
}
