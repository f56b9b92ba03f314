//! Shared types and constants for the flowtrace dataplane
//!
//! This crate provides the fixed-layout data structures and numeric limits
//! shared between the packet-path modules and the report collector.

#![no_std]

pub mod constants;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use types::{FlowKey, ReportRecord};
