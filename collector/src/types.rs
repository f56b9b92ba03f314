//! Collector type definitions
//!
//! Defines the rows the collector stores and the metrics it exports.
//!
//! ## Organization
//!
//! - **Wire Types**: report layout shared with the dataplane (from flowtrace_common)
//! - **Collector Types**: rows, summaries and exported metrics

use flowtrace_common::FlowKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::Ipv4Addr;

// ============================================================================
// Wire Types (from the dataplane)
// ============================================================================

pub mod wire {
    //! Types shared between the relay modules and the collector
    //!
    //! Re-exported from the flowtrace-common crate; the report layout is
    //! fixed by the transport.

    pub use flowtrace_common::types::{FlowKey, ReportRecord};
}

pub use flowtrace_dataplane::{RelayStats, SamplerStats};
pub use wire::ReportRecord;

/// One traversed edge, as persisted
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct EdgeRecord {
    pub prev_hop_id: u32,
    pub this_hop_id: u32,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub timestamp: f64,
}

impl EdgeRecord {
    pub fn from_report(report: &ReportRecord) -> Self {
        let key = report.flow_key();
        Self {
            prev_hop_id: report.prev_hop_id,
            this_hop_id: report.this_hop_id,
            src_ip: key.src_ip(),
            dst_ip: key.dst_ip(),
            src_port: key.src_port,
            dst_port: key.dst_port,
            protocol: key.protocol,
            timestamp: report.timestamp,
        }
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(
            u32::from(self.src_ip),
            u32::from(self.dst_ip),
            self.src_port,
            self.dst_port,
            self.protocol,
        )
    }

    pub fn edge(&self) -> EdgeId {
        EdgeId {
            from: self.prev_hop_id,
            to: self.this_hop_id,
        }
    }
}

/// Directed hop pair
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId {
    pub from: u32,
    pub to: u32,
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Aggregated metrics for export
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TraceMetrics {
    /// ISO 8601 timestamp when metrics were collected
    pub timestamp: String,
    /// Duration of collection period in seconds
    pub duration_seconds: u64,
    /// Total number of reports drained
    pub total_reports: u64,
    /// Rows committed to the store
    pub committed_rows: u64,
    /// Number of commits performed
    pub commits: u64,
    /// Distinct flows seen in reports
    pub unique_flows: u64,
    /// Per-edge statistics, ordered by edge
    pub edges: Vec<EdgeSummary>,
    /// Per-hop statistics keyed by hop id
    pub hops: BTreeMap<u32, HopSummary>,
    /// Path queries satisfied during the run
    pub query_matches: Vec<QueryMatch>,
    /// Observed edges missing from the declared topology
    pub unexpected_edges: Vec<EdgeId>,
    /// Sampler counters at shutdown
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sampler: Option<SamplerStats>,
    /// Relay counters at shutdown
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relays: Vec<RelayStats>,
}

/// Statistics for one edge
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct EdgeSummary {
    pub from_hop: u32,
    pub to_hop: u32,
    /// Reports for this edge
    pub reports: u64,
    /// Distinct flows that traversed it
    pub flows: u64,
    pub first_seen: f64,
    pub last_seen: f64,
    /// Per-packet delay since the previous hop's report, in microseconds
    pub transit_us: Percentiles,
}

/// Reports seen at one hop
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct HopSummary {
    /// Reports written by this hop
    pub reports_in: u64,
    /// Reports naming this hop as the previous one
    pub reports_out: u64,
}

/// A path query satisfied by a flow
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct QueryMatch {
    /// Flow as "src:port -> dst:port (proto)"
    pub flow: String,
    /// Hop chain, first hop first
    pub path: Vec<u32>,
    /// Report timestamp that completed the chain
    pub timestamp: f64,
}

/// Transit delay percentiles
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Percentiles {
    /// Number of samples
    pub count: u64,
    /// 50th percentile (median)
    pub p50: f64,
    /// 90th percentile
    pub p90: f64,
    /// 99th percentile
    pub p99: f64,
    /// Largest sample
    pub max: f64,
}

/// Calculate percentiles from a vector of samples
///
/// # Arguments
///
/// * `samples` - Vector of values (will be sorted in place)
///
/// # Returns
///
/// Percentiles structure with p50, p90, p99 and max
pub fn calculate_percentiles(mut samples: Vec<f64>) -> Percentiles {
    if samples.is_empty() {
        return Percentiles::default();
    }

    samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let len = samples.len();

    let percentile = |p: usize| {
        let index = std::cmp::min((len * p / 100).saturating_sub(1), len - 1);
        samples[index]
    };

    Percentiles {
        count: len as u64,
        p50: percentile(50),
        p90: percentile(90),
        p99: percentile(99),
        max: samples[len - 1],
    }
}
