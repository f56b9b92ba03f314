//! Edge row storage
//!
//! Rows are buffered and committed in large batches. A commit appends the
//! batch to a JSON-lines file when one is configured; a bounded number of
//! recent committed rows can also be kept in memory. Per-edge and per-flow
//! summaries are maintained on insert, independent of commits.
//!
//! A failed commit keeps its rows pending and truncates the file back to
//! the last complete batch, so the next commit retries them.

use crate::types::{calculate_percentiles, EdgeId, EdgeRecord, EdgeSummary, Percentiles};
use anyhow::{Context, Result};
use flowtrace_common::FlowKey;
use log::{debug, info, warn};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Transit delays kept per edge for percentile estimates
pub const TRANSIT_SAMPLE_CAP: usize = 4096;

/// Uniform reservoir of transit delays with exact count and max
#[derive(Debug, Default)]
struct TransitReservoir {
    seen: u64,
    max: f64,
    samples: Vec<f64>,
}

impl TransitReservoir {
    fn record(&mut self, delay: f64, rng: &mut SmallRng) {
        self.seen += 1;
        self.max = self.max.max(delay);

        if self.samples.len() < TRANSIT_SAMPLE_CAP {
            self.samples.push(delay);
        } else {
            let slot = rng.gen_range(0..self.seen) as usize;
            if slot < TRANSIT_SAMPLE_CAP {
                self.samples[slot] = delay;
            }
        }
    }

    fn percentiles(&self) -> Percentiles {
        if self.seen == 0 {
            return Percentiles::default();
        }
        Percentiles {
            count: self.seen,
            max: self.max,
            ..calculate_percentiles(self.samples.clone())
        }
    }
}

#[derive(Debug, Default)]
struct EdgeAccumulator {
    reports: u64,
    flows: HashSet<FlowKey>,
    first_seen: f64,
    last_seen: f64,
    transit: TransitReservoir,
}

/// JSON-lines output and the length of its committed prefix
#[derive(Debug)]
struct RowsFile {
    path: PathBuf,
    file: File,
    committed_len: u64,
}

impl RowsFile {
    fn append(&mut self, rows: &[EdgeRecord]) -> Result<()> {
        let mut encoded = Vec::with_capacity(rows.len() * 160);
        for row in rows {
            serde_json::to_writer(&mut encoded, row)
                .with_context(|| format!("Failed to serialize row for {:?}", self.path))?;
            encoded.push(b'\n');
        }

        let written = self
            .file
            .write_all(&encoded)
            .and_then(|_| self.file.flush());
        if let Err(e) = written {
            self.rewind();
            return Err(e).with_context(|| format!("Failed to flush rows to {:?}", self.path));
        }

        self.committed_len += encoded.len() as u64;
        Ok(())
    }

    /// Drop a partially written batch
    fn rewind(&mut self) {
        let len = self.committed_len;
        let rewound = self
            .file
            .set_len(len)
            .and_then(|_| self.file.seek(SeekFrom::Start(len)));
        if let Err(e) = rewound {
            warn!("Could not truncate {:?} to {} bytes: {}", self.path, len, e);
        }
    }
}

/// Batched edge row store
#[derive(Debug)]
pub struct EdgeStore {
    pending: Vec<EdgeRecord>,
    recent: VecDeque<EdgeRecord>,
    row_limit: usize,
    commit_threshold: usize,
    /// Pending size that triggers the next commit attempt
    next_commit_at: usize,
    committed_rows: u64,
    commits: u64,
    output: Option<RowsFile>,
    edges: BTreeMap<EdgeId, EdgeAccumulator>,
    flows: HashMap<FlowKey, u64>,
    /// Last report time per (flow, hop), for transit delays
    last_at_hop: HashMap<(FlowKey, u32), f64>,
    rng: SmallRng,
}

impl EdgeStore {
    /// Store that keeps summaries only; committed rows are discarded
    pub fn new(commit_threshold: usize) -> Self {
        let commit_threshold = commit_threshold.max(1);
        Self {
            pending: Vec::new(),
            recent: VecDeque::new(),
            row_limit: 0,
            commit_threshold,
            next_commit_at: commit_threshold,
            committed_rows: 0,
            commits: 0,
            output: None,
            edges: BTreeMap::new(),
            flows: HashMap::new(),
            last_at_hop: HashMap::new(),
            rng: SmallRng::seed_from_u64(0x5eed),
        }
    }

    /// Store that appends committed rows to `path` as JSON lines
    pub fn with_output(commit_threshold: usize, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)
            .with_context(|| format!("Failed to create rows file {:?}", path))?;
        info!("Writing edge rows to {:?}", path);

        let mut store = Self::new(commit_threshold);
        store.output = Some(RowsFile {
            path,
            file,
            committed_len: 0,
        });
        Ok(store)
    }

    /// Keep up to `limit` of the most recent committed rows in memory
    pub fn with_row_limit(mut self, limit: usize) -> Self {
        self.row_limit = limit;
        self
    }

    /// Add one row; commits when the pending batch reaches the threshold
    ///
    /// The row is stored even when the commit fails.
    pub fn insert(&mut self, row: EdgeRecord) -> Result<()> {
        let key = row.flow_key();
        let edge = row.edge();

        *self.flows.entry(key).or_insert(0) += 1;

        let transit = self
            .last_at_hop
            .get(&(key, row.prev_hop_id))
            .map(|prev| (row.timestamp - prev) * 1e6)
            .filter(|delay| *delay >= 0.0);
        self.last_at_hop.insert((key, row.this_hop_id), row.timestamp);

        let acc = self.edges.entry(edge).or_default();
        if acc.reports == 0 {
            acc.first_seen = row.timestamp;
        }
        acc.reports += 1;
        acc.first_seen = acc.first_seen.min(row.timestamp);
        acc.last_seen = acc.last_seen.max(row.timestamp);
        acc.flows.insert(key);
        if let Some(delay) = transit {
            acc.transit.record(delay, &mut self.rng);
        }

        self.pending.push(row);
        if self.pending.len() >= self.next_commit_at {
            self.commit()?;
        }
        Ok(())
    }

    /// Commit every pending row
    ///
    /// On failure the rows stay pending and the next automatic attempt
    /// waits for another threshold's worth of rows.
    ///
    /// # Returns
    ///
    /// Number of rows committed
    pub fn commit(&mut self) -> Result<usize> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        if let Some(output) = self.output.as_mut() {
            if let Err(e) = output.append(&self.pending) {
                self.next_commit_at = self.pending.len() + self.commit_threshold;
                return Err(e);
            }
        }

        let rows = std::mem::take(&mut self.pending);
        let n = rows.len();
        self.keep_recent(rows);
        self.next_commit_at = self.commit_threshold;

        self.committed_rows += n as u64;
        self.commits += 1;
        info!("Committed {} rows ({} total)", n, self.committed_rows);
        Ok(n)
    }

    fn keep_recent(&mut self, rows: Vec<EdgeRecord>) {
        if self.row_limit == 0 {
            return;
        }
        let skip = rows.len().saturating_sub(self.row_limit);
        self.recent.extend(rows.into_iter().skip(skip));
        while self.recent.len() > self.row_limit {
            self.recent.pop_front();
        }
    }

    /// Recent committed rows kept in memory, oldest first
    pub fn rows(&self) -> impl Iterator<Item = &EdgeRecord> {
        self.recent.iter()
    }

    /// Recent committed rows for one flow
    pub fn rows_for_flow(&self, key: &FlowKey) -> Vec<&EdgeRecord> {
        self.recent
            .iter()
            .filter(|row| row.flow_key() == *key)
            .collect()
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.len()
    }

    pub fn committed_rows(&self) -> u64 {
        self.committed_rows
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    /// Rows inserted, committed or not
    pub fn total_rows(&self) -> u64 {
        self.committed_rows + self.pending.len() as u64
    }

    /// Rows seen for `key`
    pub fn flow_rows(&self, key: &FlowKey) -> u64 {
        self.flows.get(key).copied().unwrap_or(0)
    }

    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Per-edge summaries, ordered by edge
    pub fn edge_summaries(&self) -> Vec<EdgeSummary> {
        self.edges
            .iter()
            .map(|(edge, acc)| EdgeSummary {
                from_hop: edge.from,
                to_hop: edge.to,
                reports: acc.reports,
                flows: acc.flows.len() as u64,
                first_seen: acc.first_seen,
                last_seen: acc.last_seen,
                transit_us: acc.transit.percentiles(),
            })
            .collect()
    }

    pub fn output_path(&self) -> Option<&Path> {
        self.output.as_ref().map(|output| output.path.as_path())
    }
}

impl Drop for EdgeStore {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!("Edge store dropped with {} uncommitted rows", self.pending.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::Ipv4Addr;

    fn row(prev: u32, this: u32, src_port: u16, timestamp: f64) -> EdgeRecord {
        EdgeRecord {
            prev_hop_id: prev,
            this_hop_id: this,
            src_ip: Ipv4Addr::new(10, 0, 0, 1),
            dst_ip: Ipv4Addr::new(10, 0, 0, 2),
            src_port,
            dst_port: 80,
            protocol: 6,
            timestamp,
        }
    }

    #[test]
    fn test_commit_threshold() {
        let mut store = EdgeStore::new(3).with_row_limit(10);
        store.insert(row(0, 1, 1, 0.0)).unwrap();
        store.insert(row(0, 1, 2, 0.1)).unwrap();
        assert_eq!(store.committed_rows(), 0);
        assert_eq!(store.pending_rows(), 2);

        store.insert(row(0, 1, 3, 0.2)).unwrap();
        assert_eq!(store.committed_rows(), 3);
        assert_eq!(store.commits(), 1);
        assert_eq!(store.pending_rows(), 0);

        store.insert(row(1, 2, 3, 0.3)).unwrap();
        assert_eq!(store.commit().unwrap(), 1);
        assert_eq!(store.commit().unwrap(), 0);
        assert_eq!(store.rows().count(), 4);
        assert_eq!(store.rows_for_flow(&row(0, 0, 3, 0.0).flow_key()).len(), 2);
    }

    #[test]
    fn test_row_limit_keeps_most_recent() {
        let mut store = EdgeStore::new(4).with_row_limit(3);
        for port in 0..10 {
            store.insert(row(0, 1, port, port as f64)).unwrap();
        }
        store.commit().unwrap();

        let ports: Vec<u16> = store.rows().map(|r| r.src_port).collect();
        assert_eq!(ports, vec![7, 8, 9]);
        assert_eq!(store.committed_rows(), 10);

        let mut unbounded = EdgeStore::new(4);
        for port in 0..10 {
            unbounded.insert(row(0, 1, port, 0.0)).unwrap();
        }
        assert_eq!(unbounded.rows().count(), 0);
        assert_eq!(unbounded.total_rows(), 10);
    }

    #[test]
    fn test_edge_summaries_and_transit() {
        let mut store = EdgeStore::new(100);
        store.insert(row(0, 1, 7, 1.000)).unwrap();
        store.insert(row(1, 2, 7, 1.002)).unwrap();
        store.insert(row(0, 1, 8, 2.000)).unwrap();

        let summaries = store.edge_summaries();
        assert_eq!(summaries.len(), 2);

        let first = &summaries[0];
        assert_eq!((first.from_hop, first.to_hop), (0, 1));
        assert_eq!(first.reports, 2);
        assert_eq!(first.flows, 2);
        assert_eq!(first.first_seen, 1.0);
        assert_eq!(first.last_seen, 2.0);
        assert_eq!(first.transit_us.count, 0);

        let second = &summaries[1];
        assert_eq!(second.transit_us.count, 1);
        assert!((second.transit_us.p50 - 2000.0).abs() < 1e-6);

        assert_eq!(store.flow_count(), 2);
        assert_eq!(store.flow_rows(&row(0, 0, 7, 0.0).flow_key()), 2);
    }

    #[test]
    fn test_transit_samples_bounded() {
        let mut store = EdgeStore::new(1000);
        let edge = EdgeId { from: 1, to: 2 };

        for i in 0..10_000u32 {
            let t = i as f64;
            let delay = if i == 9_999 { 0.005 } else { 0.001 };
            store.insert(row(0, 1, 9, t)).unwrap();
            store.insert(row(1, 2, 9, t + delay)).unwrap();
        }

        assert_eq!(store.edges[&edge].transit.samples.len(), TRANSIT_SAMPLE_CAP);

        let transit = &store.edge_summaries()[1].transit_us;
        assert_eq!(transit.count, 10_000);
        assert!((transit.max - 5000.0).abs() < 1e-3);
        assert!((transit.p50 - 1000.0).abs() < 1e-3);
    }

    #[test]
    fn test_rows_written_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rows.jsonl");

        let mut store = EdgeStore::with_output(2, &path).unwrap();
        store.insert(row(0, 1, 1, 0.5)).unwrap();
        store.insert(row(1, 2, 1, 0.6)).unwrap();
        store.insert(row(2, 3, 1, 0.7)).unwrap();
        store.commit().unwrap();

        let lines: Vec<String> = BufReader::new(File::open(&path).unwrap())
            .lines()
            .map(|l| l.unwrap())
            .collect();
        assert_eq!(lines.len(), 3);

        let parsed: EdgeRecord = serde_json::from_str(&lines[2]).unwrap();
        assert_eq!(parsed, row(2, 3, 1, 0.7));
        assert_eq!(store.rows().count(), 0);
        assert_eq!(store.committed_rows(), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_commit_keeps_rows() {
        let mut store = EdgeStore::with_output(2, "/dev/full").unwrap();
        store.insert(row(0, 1, 1, 0.1)).unwrap();
        assert!(store.insert(row(1, 2, 1, 0.2)).is_err());

        assert_eq!(store.pending_rows(), 2);
        assert_eq!(store.committed_rows(), 0);
        assert_eq!(store.commits(), 0);
        assert_eq!(store.total_rows(), 2);

        // Next automatic attempt waits for another threshold of rows
        store.insert(row(0, 1, 2, 0.3)).unwrap();
        assert!(store.insert(row(1, 2, 2, 0.4)).is_err());
        assert!(store.commit().is_err());
        assert_eq!(store.total_rows(), 4);
        assert_eq!(store.edge_count(), 2);
    }
}
