//! Flow key extraction from raw frames
//!
//! Reads the Ethernet, IPv4 and transport headers at the head of a frame
//! and produces the canonical 5-tuple. Only the first
//! `14 + IHL + 4` bytes of a frame are ever touched.

use crate::error::ParseError;
use bytes::{BufMut, BytesMut};
use flowtrace_common::{constants::*, FlowKey};

/// Result of parsing a frame's headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedFlow {
    /// Canonical 5-tuple
    pub key: FlowKey,
    /// Offset of the IPv4 header within the frame
    pub ip_offset: usize,
}

/// Extract the 5-tuple of an IPv4-over-Ethernet TCP or UDP frame
///
/// # Arguments
///
/// * `frame` - Frame bytes starting at the link layer
///
/// # Returns
///
/// The flow key and IPv4 header offset, or why the frame has none
pub fn parse_flow(frame: &[u8]) -> Result<ParsedFlow, ParseError> {
    if frame.len() < ETHER_HDR_LEN + IPV4_MIN_HDR_LEN {
        return Err(ParseError::Truncated);
    }

    let ether_type = u16::from_be_bytes([frame[ETHER_TYPE_OFFSET], frame[ETHER_TYPE_OFFSET + 1]]);
    if ether_type != ETHER_TYPE_IPV4 {
        return Err(ParseError::NotIpv4);
    }

    let ip = &frame[ETHER_HDR_LEN..];
    if ip[0] >> 4 != 4 {
        return Err(ParseError::NotIpv4);
    }

    let ihl = (ip[0] & 0x0f) as usize * 4;
    if ihl < IPV4_MIN_HDR_LEN {
        return Err(ParseError::NotIpv4);
    }

    let protocol = ip[IPV4_PROTO_OFFSET];
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return Err(ParseError::UnsupportedProtocol(protocol));
    }

    if ip.len() < ihl + L4_PORTS_LEN {
        return Err(ParseError::Truncated);
    }

    let be_u32 = |at: usize| u32::from_be_bytes([ip[at], ip[at + 1], ip[at + 2], ip[at + 3]]);
    let l4 = &ip[ihl..];

    Ok(ParsedFlow {
        key: FlowKey::new(
            be_u32(IPV4_SRC_OFFSET),
            be_u32(IPV4_DST_OFFSET),
            u16::from_be_bytes([l4[0], l4[1]]),
            u16::from_be_bytes([l4[2], l4[3]]),
            protocol,
        ),
        ip_offset: ETHER_HDR_LEN,
    })
}

/// Extract only the flow key
pub fn extract_flow_key(frame: &[u8]) -> Result<FlowKey, ParseError> {
    parse_flow(frame).map(|parsed| parsed.key)
}

/// Internet checksum over an IPv4 header
///
/// A header whose checksum field is already correct sums to zero.
pub fn ipv4_checksum(header: &[u8]) -> u16 {
    let mut sum: u32 = header
        .chunks(2)
        .map(|pair| match pair {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]) as u32,
            [hi] => (*hi as u32) << 8,
            _ => 0,
        })
        .sum();

    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

/// Build a minimal Ethernet/IPv4/{TCP,UDP} frame for `key`
///
/// The IPv4 checksum is valid; transport checksums are left at zero.
/// `payload_len` is clamped so the IPv4 total length fits in 16 bits.
///
/// # Arguments
///
/// * `key` - Flow the frame belongs to
/// * `ip_id` - Value of the IPv4 identification field
/// * `payload_len` - Bytes of zero payload after the transport header
pub fn build_frame(key: &FlowKey, ip_id: u16, payload_len: usize) -> BytesMut {
    let l4_len = if key.protocol == IPPROTO_TCP { 20 } else { 8 };
    let payload_len = payload_len.min(max_payload_len(key.protocol));
    let ip_total = IPV4_MIN_HDR_LEN + l4_len + payload_len;
    let mut frame = BytesMut::with_capacity(ETHER_HDR_LEN + ip_total);

    // Ethernet: locally administered addresses
    frame.put_slice(&[0x02, 0, 0, 0, 0, 0x02]);
    frame.put_slice(&[0x02, 0, 0, 0, 0, 0x01]);
    frame.put_u16(ETHER_TYPE_IPV4);

    // IPv4
    let ip_start = frame.len();
    frame.put_u8(0x45);
    frame.put_u8(0);
    frame.put_u16(ip_total as u16);
    frame.put_u16(ip_id);
    frame.put_u16(0x4000); // don't fragment
    frame.put_u8(64);
    frame.put_u8(key.protocol);
    frame.put_u16(0);
    frame.put_u32(key.src_addr);
    frame.put_u32(key.dst_addr);
    let csum = ipv4_checksum(&frame[ip_start..ip_start + IPV4_MIN_HDR_LEN]);
    frame[ip_start + IPV4_CSUM_OFFSET..ip_start + IPV4_CSUM_OFFSET + 2].copy_from_slice(&csum.to_be_bytes());

    // Transport
    frame.put_u16(key.src_port);
    frame.put_u16(key.dst_port);
    if key.protocol == IPPROTO_TCP {
        frame.put_u32(1); // seq
        frame.put_u32(0); // ack
        frame.put_u8(0x50); // data offset
        frame.put_u8(0x10); // ACK
        frame.put_u16(0xffff);
        frame.put_u16(0);
        frame.put_u16(0);
    } else {
        frame.put_u16((8 + payload_len) as u16);
        frame.put_u16(0);
    }
    frame.put_bytes(0, payload_len);

    frame
}

/// Read the IPv4 identification field of a parsed frame
pub fn ip_id(frame: &[u8], ip_offset: usize) -> Option<u16> {
    let at = ip_offset + IPV4_ID_OFFSET;
    frame.get(at..at + 2).map(|raw| u16::from_be_bytes([raw[0], raw[1]]))
}

/// Largest payload [`build_frame`] can carry for `protocol`
pub fn max_payload_len(protocol: u8) -> usize {
    let l4_len = if protocol == IPPROTO_TCP { 20 } else { 8 };
    u16::MAX as usize - IPV4_MIN_HDR_LEN - l4_len
}
