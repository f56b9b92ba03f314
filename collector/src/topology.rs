//! Pipeline topology loader
//!
//! Reads the pipeline configuration and builds the sampler, the relays
//! and the transport they share.

use anyhow::{Context, Result};
use flowtrace_dataplane::{
    ControlRequest, ControlResponse, PacketBatch, Pipeline, PipelineConfig, RelayConfig,
    RelayModule, RelayStats, ReportTransport, SamplerModule, SamplerStats,
};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

/// Stage name of the sampler
pub const SAMPLER_STAGE: &str = "sampler";

/// Stage name of the relay with `hop_id`
pub fn relay_stage(hop_id: u32) -> String {
    format!("relay{}", hop_id)
}

/// Pipeline configuration loader
#[derive(Debug, Clone, Default)]
pub struct TopologyLoader {
    config: PipelineConfig,
}

impl TopologyLoader {
    /// Load the configuration from a JSON file, or use defaults
    ///
    /// # Arguments
    ///
    /// * `path` - Optional path to a JSON pipeline configuration
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                info!("Loading pipeline configuration from: {:?}", path);
                let data = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read config file: {:?}", path))?;
                serde_json::from_str(&data)
                    .with_context(|| format!("Failed to parse config file: {:?}", path))?
            }
            None => {
                info!("Using default pipeline configuration");
                PipelineConfig::default()
            }
        };

        Ok(Self { config })
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut PipelineConfig {
        &mut self.config
    }

    /// Add relays with hop ids `1..=count` when none are configured
    pub fn with_default_relays(mut self, count: u32) -> Self {
        if self.config.relays.is_empty() {
            self.config.relays = (1..=count).map(RelayConfig::new).collect();
        }
        self
    }

    /// Build the pipeline
    ///
    /// # Returns
    ///
    /// Topology with the sampler first and relays in configuration order
    pub fn build(&self) -> Result<Topology> {
        self.config
            .validate()
            .context("Invalid pipeline configuration")?;

        let transport = Arc::new(
            ReportTransport::new(&self.config.transport)
                .context("Failed to create report transport")?,
        );

        let mut pipeline = Pipeline::new();

        let sampler = SamplerModule::new(SAMPLER_STAGE, &self.config.sampler)
            .context("Failed to initialise sampler")?;
        pipeline.push(Box::new(sampler))?;
        info!("  ✓ Added stage {}", SAMPLER_STAGE);

        let mut relays = Vec::with_capacity(self.config.relays.len());
        for relay in &self.config.relays {
            let name = relay_stage(relay.hop_id);
            let module = RelayModule::new(name.clone(), relay, Arc::clone(&transport))
                .with_context(|| format!("Failed to initialise relay for hop {}", relay.hop_id))?;
            pipeline.push(Box::new(module))?;
            info!("  ✓ Added stage {}", name);
            relays.push(name);
        }

        if relays.is_empty() {
            warn!("No relays configured; no reports will be produced");
        }

        Ok(Topology {
            pipeline,
            transport,
            relays,
        })
    }
}

/// A built pipeline and its transport
#[derive(Debug)]
pub struct Topology {
    pipeline: Pipeline,
    transport: Arc<ReportTransport>,
    relays: Vec<String>,
}

impl Topology {
    pub fn transport(&self) -> Arc<ReportTransport> {
        Arc::clone(&self.transport)
    }

    pub fn process_batch(&mut self, batch: &mut PacketBatch) {
        self.pipeline.process_batch(batch);
    }

    /// Route a control request to a stage by name
    pub fn query(&mut self, stage: &str, request: &ControlRequest) -> Result<ControlResponse> {
        self.pipeline
            .query(stage, request)
            .with_context(|| format!("Request {} to stage {} failed", request.name(), stage))
    }

    pub fn sampler_stats(&mut self) -> Option<SamplerStats> {
        match self.pipeline.query(SAMPLER_STAGE, &ControlRequest::GetStats) {
            Ok(ControlResponse::SamplerStats(stats)) => Some(stats),
            _ => None,
        }
    }

    pub fn relay_stats(&mut self) -> Vec<RelayStats> {
        let mut stats = Vec::with_capacity(self.relays.len());
        for name in &self.relays {
            if let Ok(ControlResponse::RelayStats(s)) =
                self.pipeline.query(name, &ControlRequest::GetStats)
            {
                stats.push(s);
            }
        }
        stats
    }

    pub fn relay_names(&self) -> &[String] {
        &self.relays
    }

    /// Tear down every stage
    pub fn shutdown(&mut self) {
        self.pipeline.deinit();
    }
}
