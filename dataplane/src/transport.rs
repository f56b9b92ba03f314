//! Report buffer pool and transport ring
//!
//! Relays take report buffers from a bounded pool, fill them and push them
//! onto a bounded ring; the collector pops them and hands them back to the
//! pool. Buffers are boxed and moved, so a released report can no longer be
//! referenced by its previous owner.
//!
//! All operations are bulk and non-blocking: they either succeed, partially
//! succeed, or fail immediately. Backpressure shows up as failure, never as
//! waiting.

use crate::config::TransportConfig;
use crate::error::{DataplaneError, Result};
use crossbeam_queue::ArrayQueue;
use flowtrace_common::ReportRecord;
use log::{debug, info};

/// A report buffer drawn from the pool
pub type ReportBuf = Box<ReportRecord>;

/// Bounded pool of preallocated report buffers
#[derive(Debug)]
pub struct ReportPool {
    free: ArrayQueue<ReportBuf>,
}

impl ReportPool {
    /// Preallocate `capacity` buffers
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DataplaneError::invalid("report pool needs at least one buffer"));
        }
        let free = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = free.push(Box::default());
        }
        Ok(Self { free })
    }

    /// Take exactly `n` buffers, or none at all
    pub fn acquire_bulk(&self, n: usize) -> Option<Vec<ReportBuf>> {
        let mut taken = Vec::with_capacity(n);
        while taken.len() < n {
            match self.free.pop() {
                Some(buf) => taken.push(buf),
                None => {
                    self.release_bulk(taken);
                    return None;
                }
            }
        }
        Some(taken)
    }

    /// Return buffers to the pool
    pub fn release_bulk(&self, bufs: impl IntoIterator<Item = ReportBuf>) {
        for buf in bufs {
            if self.free.push(buf).is_err() {
                // Buffer did not come from this pool
                debug!("Report pool full, dropping foreign buffer");
            }
        }
    }

    /// Buffers currently available
    pub fn available(&self) -> usize {
        self.free.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }
}

/// Bounded multi-producer ring of filled reports
#[derive(Debug)]
pub struct ReportRing {
    queue: ArrayQueue<ReportBuf>,
}

impl ReportRing {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DataplaneError::invalid("report ring needs at least one slot"));
        }
        Ok(Self {
            queue: ArrayQueue::new(capacity),
        })
    }

    /// Push reports in order until the ring is full
    ///
    /// Enqueued reports are drained from `reports`; whatever remains in it
    /// afterwards did not fit and still belongs to the caller.
    ///
    /// # Returns
    ///
    /// Number of reports enqueued
    pub fn enqueue_burst(&self, reports: &mut Vec<ReportBuf>) -> usize {
        let mut pending = std::mem::take(reports).into_iter();
        let mut enqueued = 0;

        for report in pending.by_ref() {
            if let Err(report) = self.queue.push(report) {
                reports.push(report);
                break;
            }
            enqueued += 1;
        }

        reports.extend(pending);
        enqueued
    }

    /// Pop up to `max` reports, oldest first
    pub fn dequeue_burst(&self, max: usize) -> Vec<ReportBuf> {
        let mut out = Vec::with_capacity(max.min(self.queue.len()));
        while out.len() < max {
            match self.queue.pop() {
                Some(report) => out.push(report),
                None => break,
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }
}

/// Pool and ring shared by every relay and the collector
#[derive(Debug)]
pub struct ReportTransport {
    pub pool: ReportPool,
    pub ring: ReportRing,
}

impl ReportTransport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Report transport ready: {} buffers, ring of {}",
            config.pool_size, config.ring_size
        );
        Ok(Self {
            pool: ReportPool::new(config.pool_size)?,
            ring: ReportRing::new(config.ring_size)?,
        })
    }
}
