//! In-band marking channel
//!
//! Sampled packets carry a mark that later observation points recognise,
//! and each relay rewrites the mark with its own hop id so the next relay
//! learns which hop preceded it. No header bytes are added; an existing
//! header field is reused as the channel.
//!
//! ## IPv4 identification encoding
//!
//! ```text
//!   byte 4        byte 5
//! +-------------+-------------+
//! |   hop id    |  tag (0xEF) |
//! +-------------+-------------+
//! ```
//!
//! The sampler writes hop id 0. Unmarked packets whose identification
//! happens to end in the tag byte are indistinguishable from marked ones.

use flowtrace_common::constants::*;
use std::fmt;

/// Encoding of hop marks in a frame's headers
pub trait HeaderMarkingChannel: Send + Sync + fmt::Debug {
    /// Write a mark carrying `hop_id`
    ///
    /// # Arguments
    ///
    /// * `frame` - Frame bytes starting at the link layer
    /// * `ip_offset` - Offset of the IPv4 header
    /// * `hop_id` - Identity of the hop writing the mark
    ///
    /// # Returns
    ///
    /// `false` if the frame is too short to carry the mark
    fn encode(&self, frame: &mut [u8], ip_offset: usize, hop_id: u8) -> bool;

    /// Hop id of the last marker, or `None` if the frame is unmarked
    fn decode(&self, frame: &[u8], ip_offset: usize) -> Option<u8>;
}

/// Marks carried in the IPv4 identification field
#[derive(Debug, Clone, Copy, Default)]
pub struct Ipv4IdChannel;

impl Ipv4IdChannel {
    /// Identification value encoding `hop_id`
    pub const fn field_value(hop_id: u8) -> u16 {
        (hop_id as u16) << 8 | MARK_TAG as u16
    }
}

impl HeaderMarkingChannel for Ipv4IdChannel {
    fn encode(&self, frame: &mut [u8], ip_offset: usize, hop_id: u8) -> bool {
        let id_at = ip_offset + IPV4_ID_OFFSET;
        let csum_at = ip_offset + IPV4_CSUM_OFFSET;
        if frame.len() < csum_at + 2 {
            return false;
        }

        let old = u16::from_be_bytes([frame[id_at], frame[id_at + 1]]);
        let new = Self::field_value(hop_id);
        if old == new {
            return true;
        }

        let csum = u16::from_be_bytes([frame[csum_at], frame[csum_at + 1]]);
        frame[id_at..id_at + 2].copy_from_slice(&new.to_be_bytes());
        frame[csum_at..csum_at + 2].copy_from_slice(&update_checksum(csum, old, new).to_be_bytes());
        true
    }

    fn decode(&self, frame: &[u8], ip_offset: usize) -> Option<u8> {
        let id_at = ip_offset + IPV4_ID_OFFSET;
        let field = frame.get(id_at..id_at + 2)?;
        (field[1] == MARK_TAG).then_some(field[0])
    }
}

/// Incremental internet checksum update for one changed 16-bit word (RFC 1624, eqn. 3)
pub fn update_checksum(csum: u16, old: u16, new: u16) -> u16 {
    let mut sum = (!csum) as u32 + (!old) as u32 + new as u32;
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
