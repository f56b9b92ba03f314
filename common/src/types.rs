//! Shared data structures between the packet path and the collector
//!
//! These structures are repr(C) so the flow table can hash and compare
//! keys as raw words and so reports keep a fixed transport layout.

use core::fmt;
use core::net::Ipv4Addr;

/// Flow identifier (5-tuple)
///
/// Addresses and ports are stored in host byte order. The struct is padded
/// to 16 bytes; the padding must always be zero because table lookups
/// compare and hash the padded representation.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
pub struct FlowKey {
    /// Source IPv4 address
    pub src_addr: u32,
    /// Destination IPv4 address
    pub dst_addr: u32,
    /// Source transport port
    pub src_port: u16,
    /// Destination transport port
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
    /// Padding, always zero
    #[cfg_attr(feature = "userspace", serde(skip))]
    pub _padding: [u8; 3],
}

impl FlowKey {
    /// Build a key with zeroed padding
    pub const fn new(src_addr: u32, dst_addr: u32, src_port: u16, dst_port: u16, protocol: u8) -> Self {
        Self {
            src_addr,
            dst_addr,
            src_port,
            dst_port,
            protocol,
            _padding: [0; 3],
        }
    }

    /// The padded key as two little-endian machine words
    ///
    /// Word 0 holds both addresses; word 1 holds the ports in bits 0..32,
    /// the protocol in bits 32..40 and zero padding above.
    #[inline(always)]
    pub const fn to_words(&self) -> [u64; 2] {
        [
            self.src_addr as u64 | (self.dst_addr as u64) << 32,
            self.src_port as u64 | (self.dst_port as u64) << 16 | (self.protocol as u64) << 32,
        ]
    }

    /// Rebuild a key from its word form, discarding anything above the protocol byte
    #[inline(always)]
    pub const fn from_words(words: [u64; 2]) -> Self {
        Self::new(
            words[0] as u32,
            (words[0] >> 32) as u32,
            words[1] as u16,
            (words[1] >> 16) as u16,
            (words[1] >> 32) as u8,
        )
    }

    /// The 16 padded key bytes, in word order
    #[inline(always)]
    pub fn to_bytes(&self) -> [u8; 16] {
        let words = self.to_words();
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&words[0].to_le_bytes());
        bytes[8..].copy_from_slice(&words[1].to_le_bytes());
        bytes
    }

    pub fn src_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_addr)
    }

    pub fn dst_ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_addr)
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} ({})",
            self.src_ip(),
            self.src_port,
            self.dst_ip(),
            self.dst_port,
            self.protocol
        )
    }
}

/// Path-trace report written by a relay and read once by the collector
///
/// Field widths follow the transport record layout; ports and protocol are
/// widened to 64 bits.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
#[cfg_attr(feature = "userspace", derive(serde::Serialize, serde::Deserialize))]
pub struct ReportRecord {
    /// Source IPv4 address (host byte order)
    pub src_addr: u32,
    /// Destination IPv4 address (host byte order)
    pub dst_addr: u32,
    /// Source transport port
    pub src_port: u64,
    /// Destination transport port
    pub dst_port: u64,
    /// IP protocol number
    pub protocol: u64,
    /// Hop that marked the packet before this one
    pub prev_hop_id: u32,
    /// Hop that wrote this report
    pub this_hop_id: u32,
    /// Monotonic timestamp in seconds
    pub timestamp: f64,
}

impl ReportRecord {
    pub fn new(key: &FlowKey, prev_hop_id: u32, this_hop_id: u32, timestamp: f64) -> Self {
        Self {
            src_addr: key.src_addr,
            dst_addr: key.dst_addr,
            src_port: key.src_port as u64,
            dst_port: key.dst_port as u64,
            protocol: key.protocol as u64,
            prev_hop_id,
            this_hop_id,
            timestamp,
        }
    }

    /// The 5-tuple this report describes
    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            self.src_addr,
            self.dst_addr,
            self.src_port as u16,
            self.dst_port as u16,
            self.protocol as u8,
        )
    }
}

// Compile-time layout checks
// These will fail to compile if the layout drifts
const _: () = {
    assert!(core::mem::size_of::<FlowKey>() == 16);
    assert!(core::mem::align_of::<FlowKey>() == 16);
    assert!(core::mem::size_of::<ReportRecord>() == 48);
    assert!(core::mem::size_of::<ReportRecord>() % core::mem::align_of::<ReportRecord>() == 0);
};
