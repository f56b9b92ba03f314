//! Report collection and aggregation
//!
//! Drains reports from the transport ring, turns them into edge rows,
//! feeds the path analyzer and hands every consumed buffer back to the
//! pool.

use crate::policy::PathAnalyzer;
use crate::store::EdgeStore;
use crate::types::*;
use anyhow::Result;
use flowtrace_common::constants::BURST_SIZE;
use flowtrace_dataplane::ReportTransport;
use log::{debug, info};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Consumer side of the report transport
#[derive(Debug)]
pub struct ReportCollector {
    transport: Arc<ReportTransport>,
    store: EdgeStore,
    analyzer: PathAnalyzer,
    /// Reports per hop id: (as this hop, as previous hop)
    hops: BTreeMap<u32, HopSummary>,
    total_reports: u64,
}

impl ReportCollector {
    /// Create a new collector
    ///
    /// # Arguments
    ///
    /// * `transport` - Transport shared with the relays
    /// * `store` - Destination for edge rows
    /// * `analyzer` - Path-query evaluation
    pub fn new(transport: Arc<ReportTransport>, store: EdgeStore, analyzer: PathAnalyzer) -> Self {
        Self {
            transport,
            store,
            analyzer,
            hops: BTreeMap::new(),
            total_reports: 0,
        }
    }

    /// Drain one burst of up to [`BURST_SIZE`] reports
    ///
    /// A store failure is returned after the whole burst is accounted for.
    ///
    /// # Returns
    ///
    /// Number of reports consumed
    pub fn drain_once(&mut self) -> Result<usize> {
        let reports = self.transport.ring.dequeue_burst(BURST_SIZE);
        if reports.is_empty() {
            return Ok(0);
        }

        let rows: Vec<EdgeRecord> = reports.iter().map(|r| EdgeRecord::from_report(r)).collect();
        self.transport.pool.release_bulk(reports);

        let n = rows.len();
        let mut failed = None;
        for row in rows {
            self.hops.entry(row.this_hop_id).or_default().reports_in += 1;
            self.hops.entry(row.prev_hop_id).or_default().reports_out += 1;
            self.analyzer.observe(&row);
            // The store keeps the row even when its commit fails
            if let Err(e) = self.store.insert(row) {
                if failed.is_none() {
                    failed = Some(e);
                }
            }
        }

        self.total_reports += n as u64;
        debug!("Drained {} reports", n);
        match failed {
            Some(e) => Err(e),
            None => Ok(n),
        }
    }

    /// Drain until the ring is empty
    pub fn drain_all(&mut self) -> Result<usize> {
        let mut total = 0;
        loop {
            let n = self.drain_once()?;
            if n == 0 {
                return Ok(total);
            }
            total += n;
        }
    }

    /// Drain what is left and commit every pending row
    pub fn finish(&mut self) -> Result<()> {
        let drained = self.drain_all()?;
        let committed = self.store.commit()?;
        info!(
            "Collector finished: {} late reports drained, {} rows committed",
            drained, committed
        );
        Ok(())
    }

    /// Generate aggregated metrics
    ///
    /// # Arguments
    ///
    /// * `elapsed_secs` - Duration of collection period in seconds
    ///
    /// # Returns
    ///
    /// TraceMetrics with aggregated statistics
    pub fn generate_metrics(&self, elapsed_secs: u64) -> TraceMetrics {
        TraceMetrics {
            timestamp: chrono::Utc::now().to_rfc3339(),
            duration_seconds: elapsed_secs,
            total_reports: self.total_reports,
            committed_rows: self.store.committed_rows(),
            commits: self.store.commits(),
            unique_flows: self.store.flow_count() as u64,
            edges: self.store.edge_summaries(),
            hops: self.hops.clone(),
            query_matches: self.analyzer.matches().to_vec(),
            unexpected_edges: self.analyzer.unexpected_edges(),
            sampler: None,
            relays: Vec::new(),
        }
    }

    /// Get current report count
    pub fn report_count(&self) -> u64 {
        self.total_reports
    }

    /// Get number of unique flows
    pub fn flow_count(&self) -> usize {
        self.store.flow_count()
    }

    pub fn store(&self) -> &EdgeStore {
        &self.store
    }

    pub fn analyzer(&self) -> &PathAnalyzer {
        &self.analyzer
    }
}
