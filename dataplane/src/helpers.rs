//! Helper functions for the packet path
//!
//! Clock access and small utilities shared by the pipeline modules.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Seconds elapsed on the process-wide monotonic clock
///
/// The epoch is fixed on first use, so readings taken by different relays
/// are directly comparable.
#[inline(always)]
pub fn get_timestamp() -> f64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Whether `hop_id` fits the one-byte mark field
#[inline(always)]
pub fn hop_id_as_mark(hop_id: u32) -> Option<u8> {
    u8::try_from(hop_id).ok()
}

/// Increment a statistics counter
#[inline(always)]
pub fn increment_stat(counter: &mut u64, by: u64) {
    *counter = counter.saturating_add(by);
}
