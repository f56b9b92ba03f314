//! Shared constants for the flowtrace dataplane
//!
//! These constants are used by both the packet-path modules and the
//! collector to ensure consistency in limits and wire encodings.

// ============================================================================
// Flow Table Limits
// ============================================================================

/// Largest accepted number of buckets (hash index space)
pub const MAX_TABLE_SIZE: u64 = 1 << 30;

/// Default number of buckets
pub const DEFAULT_TABLE_SIZE: u64 = 1 << 20;

/// Largest accepted number of slots per bucket
pub const MAX_BUCKET_DEPTH: usize = 4;

/// Default number of slots per bucket
pub const DEFAULT_BUCKET_DEPTH: usize = 4;

/// Reserved for a multi-level displacement search.
/// Insertion currently displaces at most one level deep.
pub const MAX_INSERTION_SEARCH_DEPTH: u32 = 2;

/// Gate ids are 15 bits wide; this value and above are rejected
pub const INVALID_GATE: u16 = 0x7FFF;

// ============================================================================
// Sampling
// ============================================================================

/// Default number of marked packets per flow (in expectation)
pub const DEFAULT_SAMPLE_TARGET: u64 = 2;

/// Default seed for the per-module sampling stream
pub const DEFAULT_RNG_SEED: u64 = 1234;

// ============================================================================
// In-band Marking
// ============================================================================

/// Tag byte carried in the low-order byte of the IPv4 identification field
pub const MARK_TAG: u8 = 0xEF;

/// Hop id written by the sampling module when it first marks a packet
pub const ORIGIN_HOP_ID: u8 = 0;

/// Smallest hop id a relay may use
pub const MIN_RELAY_HOP_ID: u32 = 1;

/// Largest hop id a relay may use (the hop id occupies one byte)
pub const MAX_RELAY_HOP_ID: u32 = 255;

// ============================================================================
// Header Layout
// ============================================================================

/// Ethernet header length (no VLAN tags)
pub const ETHER_HDR_LEN: usize = 14;

/// Offset of the EtherType within the Ethernet header
pub const ETHER_TYPE_OFFSET: usize = 12;

/// EtherType for IPv4
pub const ETHER_TYPE_IPV4: u16 = 0x0800;

/// Minimum IPv4 header length (IHL = 5)
pub const IPV4_MIN_HDR_LEN: usize = 20;

/// Offset of the identification field within the IPv4 header
pub const IPV4_ID_OFFSET: usize = 4;

/// Offset of the protocol field within the IPv4 header
pub const IPV4_PROTO_OFFSET: usize = 9;

/// Offset of the header checksum within the IPv4 header
pub const IPV4_CSUM_OFFSET: usize = 10;

/// Offset of the source address within the IPv4 header
pub const IPV4_SRC_OFFSET: usize = 12;

/// Offset of the destination address within the IPv4 header
pub const IPV4_DST_OFFSET: usize = 16;

/// Bytes of the transport header needed for the port pair
pub const L4_PORTS_LEN: usize = 4;

// ============================================================================
// Protocol Numbers (from linux/in.h)
// ============================================================================

/// TCP protocol number
pub const IPPROTO_TCP: u8 = 6;

/// UDP protocol number
pub const IPPROTO_UDP: u8 = 17;

// ============================================================================
// Report Transport
// ============================================================================

/// Default number of report buffers in the shared pool
pub const DEFAULT_POOL_SIZE: usize = 1 << 16;

/// Default capacity of the report transport ring
pub const DEFAULT_RING_SIZE: usize = 512;

/// Maximum number of reports the collector dequeues at once
pub const BURST_SIZE: usize = 32;

/// Rows buffered by the collector before each commit
pub const DEFAULT_COMMIT_THRESHOLD: usize = 250_000;

/// Relay statistics reporting epoch in seconds
pub const STATS_WINDOW_SECS: f64 = 1.0;
