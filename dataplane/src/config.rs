//! Module configuration
//!
//! All parameters are validated once, when a module is built. A module
//! that fails validation is not created; nothing else is affected.

use crate::error::{DataplaneError, Result};
use flowtrace_common::constants::*;
use serde::{Deserialize, Serialize};

/// Flow table geometry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct FlowTableConfig {
    /// Number of buckets (power of two, 1..=2^30)
    pub size: u64,
    /// Slots per bucket (power of two, 1..=4)
    pub bucket_depth: usize,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_TABLE_SIZE,
            bucket_depth: DEFAULT_BUCKET_DEPTH,
        }
    }
}

impl FlowTableConfig {
    /// Replace zero values with the defaults
    pub fn or_defaults(&self) -> Self {
        Self {
            size: if self.size == 0 { DEFAULT_TABLE_SIZE } else { self.size },
            bucket_depth: if self.bucket_depth == 0 {
                DEFAULT_BUCKET_DEPTH
            } else {
                self.bucket_depth
            },
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.size == 0 || self.size > MAX_TABLE_SIZE || !self.size.is_power_of_two() {
            return Err(DataplaneError::invalid(format!(
                "table size {} must be a power of two in 1..={}",
                self.size, MAX_TABLE_SIZE
            )));
        }

        if self.bucket_depth == 0
            || self.bucket_depth > MAX_BUCKET_DEPTH
            || !self.bucket_depth.is_power_of_two()
        {
            return Err(DataplaneError::invalid(format!(
                "bucket depth {} must be a power of two in 1..={}",
                self.bucket_depth, MAX_BUCKET_DEPTH
            )));
        }

        Ok(())
    }
}

/// Sampling module parameters
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct SamplerConfig {
    pub table: FlowTableConfig,
    /// Expected marked packets per flow
    pub sample_target: u64,
    /// Seed of the per-instance sampling stream
    pub rng_seed: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            table: FlowTableConfig::default(),
            sample_target: DEFAULT_SAMPLE_TARGET,
            rng_seed: DEFAULT_RNG_SEED,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        self.table.or_defaults().validate()?;

        if self.sample_target == 0 {
            return Err(DataplaneError::invalid("sample target must be >= 1"));
        }

        Ok(())
    }
}

/// Relay (probe) module parameters
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Identity written into relayed packets (1..=255)
    pub hop_id: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl RelayConfig {
    pub fn new(hop_id: u32) -> Self {
        Self {
            hop_id,
            enabled: true,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(MIN_RELAY_HOP_ID..=MAX_RELAY_HOP_ID).contains(&self.hop_id) {
            return Err(DataplaneError::invalid(format!(
                "hop id {} must be in {}..={}",
                self.hop_id, MIN_RELAY_HOP_ID, MAX_RELAY_HOP_ID
            )));
        }
        Ok(())
    }
}

/// Report pool and ring capacities
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TransportConfig {
    pub pool_size: usize,
    pub ring_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            pool_size: DEFAULT_POOL_SIZE,
            ring_size: DEFAULT_RING_SIZE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(DataplaneError::invalid("pool size must be >= 1"));
        }
        if self.ring_size == 0 {
            return Err(DataplaneError::invalid("ring size must be >= 1"));
        }
        Ok(())
    }
}

/// A sampler followed by zero or more relays sharing one transport
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub sampler: SamplerConfig,
    pub relays: Vec<RelayConfig>,
    pub transport: TransportConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        self.transport.validate()?;

        let mut seen = std::collections::BTreeSet::new();
        for relay in &self.relays {
            relay.validate()?;
            if !seen.insert(relay.hop_id) {
                return Err(DataplaneError::invalid(format!(
                    "hop id {} configured twice",
                    relay.hop_id
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_config_bounds() {
        assert!(FlowTableConfig::default().validate().is_ok());
        assert!(FlowTableConfig { size: 1, bucket_depth: 1 }.validate().is_ok());
        assert!(FlowTableConfig { size: 3, bucket_depth: 4 }.validate().is_err());
        assert!(FlowTableConfig { size: MAX_TABLE_SIZE * 2, bucket_depth: 4 }.validate().is_err());
        assert!(FlowTableConfig { size: 1024, bucket_depth: 3 }.validate().is_err());
        assert!(FlowTableConfig { size: 1024, bucket_depth: 8 }.validate().is_err());
    }

    #[test]
    fn test_zero_selects_defaults() {
        let config = FlowTableConfig { size: 0, bucket_depth: 0 }.or_defaults();
        assert_eq!(config, FlowTableConfig::default());
    }

    #[test]
    fn test_relay_hop_range() {
        assert!(RelayConfig::new(0).validate().is_err());
        assert!(RelayConfig::new(1).validate().is_ok());
        assert!(RelayConfig::new(255).validate().is_ok());
        assert!(RelayConfig::new(256).validate().is_err());
    }

    #[test]
    fn test_pipeline_from_json() {
        let json = r#"{
            "sampler": { "table": { "size": 4096 }, "rng_seed": 7 },
            "relays": [ { "hop_id": 1 }, { "hop_id": 2, "enabled": false } ]
        }"#;
        let config: PipelineConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.sampler.table.size, 4096);
        assert_eq!(config.sampler.table.bucket_depth, DEFAULT_BUCKET_DEPTH);
        assert_eq!(config.sampler.sample_target, DEFAULT_SAMPLE_TARGET);
        assert_eq!(config.sampler.rng_seed, 7);
        assert!(config.relays[0].enabled);
        assert!(!config.relays[1].enabled);
        assert_eq!(config.transport, TransportConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_hops_rejected() {
        let config = PipelineConfig {
            relays: vec![RelayConfig::new(3), RelayConfig::new(3)],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
