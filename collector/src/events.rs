//! Report draining tasks
//!
//! Polls the transport ring from a tokio task and periodically reports
//! collection progress.

use crate::collector::ReportCollector;
use log::{info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, sleep},
};

/// Drives a [`ReportCollector`] from async tasks
pub struct ReportDrainer {
    collector: Arc<Mutex<ReportCollector>>,
    poll_interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl ReportDrainer {
    /// Create a new drainer
    ///
    /// # Arguments
    ///
    /// * `collector` - Shared collector
    /// * `poll_interval` - Pause after a poll that found the ring empty
    pub fn new(collector: Arc<Mutex<ReportCollector>>, poll_interval: Duration) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            collector,
            poll_interval,
            stop_tx,
        }
    }

    /// Spawn the drain loop
    ///
    /// Each iteration drains one burst; an empty ring parks the task for
    /// the poll interval. The task exits after [`ReportDrainer::stop`].
    pub fn spawn_drain_task(&self) -> JoinHandle<()> {
        let collector = Arc::clone(&self.collector);
        let poll_interval = self.poll_interval;
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            info!("Report drain task started");
            loop {
                if *stop_rx.borrow() {
                    break;
                }

                let drained = {
                    let mut collector = collector.lock().await;
                    match collector.drain_once() {
                        Ok(n) => n,
                        Err(e) => {
                            warn!("Failed to store reports: {:#}", e);
                            0
                        }
                    }
                };

                if drained == 0 {
                    tokio::select! {
                        _ = sleep(poll_interval) => {}
                        changed = stop_rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                    }
                } else {
                    tokio::task::yield_now().await;
                }
            }
            info!("Report drain task stopped");
        })
    }

    /// Spawn progress reporter
    ///
    /// Creates a task that periodically reports collection progress.
    ///
    /// # Arguments
    ///
    /// * `interval_secs` - Reporting interval in seconds
    pub fn spawn_progress_reporter(&self, interval_secs: u64) -> JoinHandle<()> {
        let collector = Arc::clone(&self.collector);
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(interval_secs.max(1)));
            // First tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = stop_rx.changed() => break,
                }

                let collector = collector.lock().await;
                info!(
                    "Progress: {} reports collected, {} flows, {} edges",
                    collector.report_count(),
                    collector.flow_count(),
                    collector.store().edge_count()
                );
            }
        })
    }

    /// Signal every spawned task to exit
    pub fn stop(&self) {
        self.stop_tx.send_replace(true);
    }
}
