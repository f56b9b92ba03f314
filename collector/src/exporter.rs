//! Metrics exporters
//!
//! Provides different exporters for trace metrics (JSON, Prometheus, InfluxDB)

use crate::types::TraceMetrics;
use anyhow::{Context, Result};
use std::{
    fmt::Write as _,
    fs::File,
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

/// Trait for metrics exporters
pub trait MetricsExporter {
    /// Export metrics
    ///
    /// # Arguments
    ///
    /// * `metrics` - Aggregated metrics to export
    ///
    /// # Returns
    ///
    /// Result indicating success or failure
    fn export(&self, metrics: &TraceMetrics) -> Result<()>;
}

/// Export format type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterType {
    /// JSON format
    Json,
    /// Prometheus format
    Prometheus,
    /// InfluxDB line protocol
    Influx,
}

impl FromStr for ExporterType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(ExporterType::Json),
            "prometheus" | "prom" => Ok(ExporterType::Prometheus),
            "influx" | "influxdb" => Ok(ExporterType::Influx),
            _ => anyhow::bail!("Unsupported format: {}. Use json, prometheus, or influx", s),
        }
    }
}

impl ExporterType {
    /// Build the exporter for this format
    pub fn exporter(self, output_path: PathBuf) -> Box<dyn MetricsExporter> {
        match self {
            ExporterType::Json => Box::new(JsonExporter::new(output_path, true)),
            ExporterType::Prometheus => Box::new(PrometheusExporter::new(output_path)),
            ExporterType::Influx => Box::new(InfluxExporter::new(output_path, "flowtrace".to_string())),
        }
    }
}

fn write_file(path: &Path, data: &str) -> Result<()> {
    let mut file =
        File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?;

    file.write_all(data.as_bytes())
        .with_context(|| format!("Failed to write to output file: {:?}", path))?;

    Ok(())
}

/// JSON exporter
pub struct JsonExporter {
    output_path: PathBuf,
    pretty: bool,
}

impl JsonExporter {
    /// Create a new JSON exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `pretty` - Enable pretty-printing
    pub fn new(output_path: PathBuf, pretty: bool) -> Self {
        Self {
            output_path,
            pretty,
        }
    }
}

impl MetricsExporter for JsonExporter {
    fn export(&self, metrics: &TraceMetrics) -> Result<()> {
        let json = if self.pretty {
            serde_json::to_string_pretty(metrics)?
        } else {
            serde_json::to_string(metrics)?
        };

        write_file(&self.output_path, &json)
    }
}

/// Prometheus exporter
pub struct PrometheusExporter {
    output_path: PathBuf,
}

impl PrometheusExporter {
    /// Create a new Prometheus exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    pub fn new(output_path: PathBuf) -> Self {
        Self { output_path }
    }

    /// Convert metrics to Prometheus format
    fn to_prometheus_format(metrics: &TraceMetrics) -> String {
        let mut output = String::new();

        // Totals
        output.push_str("# HELP flowtrace_reports_total Total number of reports collected\n");
        output.push_str("# TYPE flowtrace_reports_total counter\n");
        let _ = writeln!(output, "flowtrace_reports_total {}", metrics.total_reports);
        output.push('\n');

        output.push_str("# HELP flowtrace_rows_committed_total Edge rows committed to the store\n");
        output.push_str("# TYPE flowtrace_rows_committed_total counter\n");
        let _ = writeln!(output, "flowtrace_rows_committed_total {}", metrics.committed_rows);
        output.push('\n');

        output.push_str("# HELP flowtrace_duration_seconds Duration of collection period\n");
        output.push_str("# TYPE flowtrace_duration_seconds gauge\n");
        let _ = writeln!(output, "flowtrace_duration_seconds {}", metrics.duration_seconds);
        output.push('\n');

        output.push_str("# HELP flowtrace_flows Distinct flows seen in reports\n");
        output.push_str("# TYPE flowtrace_flows gauge\n");
        let _ = writeln!(output, "flowtrace_flows {}", metrics.unique_flows);
        output.push('\n');

        // Edges
        output.push_str("# HELP flowtrace_edge_reports_total Reports per traversed edge\n");
        output.push_str("# TYPE flowtrace_edge_reports_total counter\n");
        for edge in &metrics.edges {
            let _ = writeln!(
                output,
                "flowtrace_edge_reports_total{{from=\"{}\",to=\"{}\"}} {}",
                edge.from_hop, edge.to_hop, edge.reports
            );
        }
        output.push('\n');

        output.push_str("# HELP flowtrace_edge_transit_microseconds Transit delay percentiles per edge\n");
        output.push_str("# TYPE flowtrace_edge_transit_microseconds gauge\n");
        for edge in metrics.edges.iter().filter(|e| e.transit_us.count > 0) {
            for (quantile, value) in [
                ("0.50", edge.transit_us.p50),
                ("0.90", edge.transit_us.p90),
                ("0.99", edge.transit_us.p99),
            ] {
                let _ = writeln!(
                    output,
                    "flowtrace_edge_transit_microseconds{{from=\"{}\",to=\"{}\",quantile=\"{}\"}} {}",
                    edge.from_hop, edge.to_hop, quantile, value
                );
            }
        }
        output.push('\n');

        // Queries
        output.push_str("# HELP flowtrace_query_matches_total Path queries satisfied\n");
        output.push_str("# TYPE flowtrace_query_matches_total counter\n");
        let _ = writeln!(output, "flowtrace_query_matches_total {}", metrics.query_matches.len());
        output.push('\n');

        output.push_str("# HELP flowtrace_unexpected_edges Observed edges missing from the topology\n");
        output.push_str("# TYPE flowtrace_unexpected_edges gauge\n");
        let _ = writeln!(output, "flowtrace_unexpected_edges {}", metrics.unexpected_edges.len());
        output.push('\n');

        // Relays
        if !metrics.relays.is_empty() {
            output.push_str("# HELP flowtrace_relay_dropped_total Reports lost per relay\n");
            output.push_str("# TYPE flowtrace_relay_dropped_total counter\n");
            for relay in &metrics.relays {
                let _ = writeln!(
                    output,
                    "flowtrace_relay_dropped_total{{hop=\"{}\"}} {}",
                    relay.hop_id, relay.dropped
                );
            }
            output.push('\n');
        }

        output
    }
}

impl MetricsExporter for PrometheusExporter {
    fn export(&self, metrics: &TraceMetrics) -> Result<()> {
        write_file(&self.output_path, &Self::to_prometheus_format(metrics))
    }
}

/// InfluxDB line protocol exporter
pub struct InfluxExporter {
    output_path: PathBuf,
    measurement: String,
}

impl InfluxExporter {
    /// Create a new InfluxDB exporter
    ///
    /// # Arguments
    ///
    /// * `output_path` - Path to output file
    /// * `measurement` - Measurement name for InfluxDB
    pub fn new(output_path: PathBuf, measurement: String) -> Self {
        Self {
            output_path,
            measurement,
        }
    }

    /// Convert metrics to InfluxDB line protocol
    fn to_influx_format(metrics: &TraceMetrics, measurement: &str) -> String {
        let mut output = String::new();
        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0);

        // Global metrics
        let _ = writeln!(
            output,
            "{},type=summary total_reports={}i,committed_rows={}i,duration_seconds={}i,flows={}i,query_matches={}i,unexpected_edges={}i {}",
            measurement,
            metrics.total_reports,
            metrics.committed_rows,
            metrics.duration_seconds,
            metrics.unique_flows,
            metrics.query_matches.len(),
            metrics.unexpected_edges.len(),
            timestamp
        );

        // Per edge
        for edge in &metrics.edges {
            let _ = writeln!(
                output,
                "{},type=edge,from={},to={} reports={}i,flows={}i,transit_p50={},transit_p99={} {}",
                measurement,
                edge.from_hop,
                edge.to_hop,
                edge.reports,
                edge.flows,
                edge.transit_us.p50,
                edge.transit_us.p99,
                timestamp
            );
        }

        // Per relay
        for relay in &metrics.relays {
            let _ = writeln!(
                output,
                "{},type=relay,hop={} packets={}i,marked={}i,reported={}i,dropped={}i {}",
                measurement,
                relay.hop_id,
                relay.packets,
                relay.marked,
                relay.reported,
                relay.dropped,
                timestamp
            );
        }

        output
    }
}

impl MetricsExporter for InfluxExporter {
    fn export(&self, metrics: &TraceMetrics) -> Result<()> {
        write_file(
            &self.output_path,
            &Self::to_influx_format(metrics, &self.measurement),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use std::collections::BTreeMap;

    fn create_test_metrics() -> TraceMetrics {
        TraceMetrics {
            timestamp: "2025-01-01T00:00:00Z".to_string(),
            duration_seconds: 60,
            total_reports: 1000,
            committed_rows: 1000,
            commits: 1,
            unique_flows: 12,
            edges: vec![EdgeSummary {
                from_hop: 1,
                to_hop: 2,
                reports: 500,
                flows: 12,
                first_seen: 0.5,
                last_seen: 59.5,
                transit_us: Percentiles {
                    count: 500,
                    p50: 12.5,
                    p90: 20.0,
                    p99: 31.0,
                    max: 40.0,
                },
            }],
            hops: BTreeMap::new(),
            query_matches: Vec::new(),
            unexpected_edges: vec![EdgeId { from: 2, to: 9 }],
            sampler: None,
            relays: vec![RelayStats {
                hop_id: 2,
                enabled: true,
                packets: 900,
                marked: 500,
                reported: 495,
                dropped: 5,
                ..Default::default()
            }],
        }
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = create_test_metrics();
        let prometheus = PrometheusExporter::to_prometheus_format(&metrics);

        assert!(prometheus.contains("flowtrace_reports_total 1000"));
        assert!(prometheus.contains("flowtrace_duration_seconds 60"));
        assert!(prometheus.contains("flowtrace_edge_reports_total{from=\"1\",to=\"2\"} 500"));
        assert!(prometheus.contains("quantile=\"0.50\"} 12.5"));
        assert!(prometheus.contains("flowtrace_unexpected_edges 1"));
        assert!(prometheus.contains("flowtrace_relay_dropped_total{hop=\"2\"} 5"));
    }

    #[test]
    fn test_influx_format() {
        let metrics = create_test_metrics();
        let influx = InfluxExporter::to_influx_format(&metrics, "flowtrace");

        assert!(influx.contains("flowtrace,type=summary"));
        assert!(influx.contains("total_reports=1000i"));
        assert!(influx.contains("flowtrace,type=edge,from=1,to=2 reports=500i"));
        assert!(influx.contains("transit_p50=12.5"));
        assert!(influx.contains("flowtrace,type=relay,hop=2"));
    }

    #[test]
    fn test_json_export_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        ExporterType::Json.exporter(path.clone()).export(&create_test_metrics()).unwrap();

        let parsed: TraceMetrics =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.total_reports, 1000);
        assert_eq!(parsed.edges[0].transit_us.p99, 31.0);
        assert_eq!(parsed.relays.len(), 1);
    }

    #[test]
    fn test_format_names() {
        assert_eq!("JSON".parse::<ExporterType>().unwrap(), ExporterType::Json);
        assert_eq!("prom".parse::<ExporterType>().unwrap(), ExporterType::Prometheus);
        assert_eq!("influxdb".parse::<ExporterType>().unwrap(), ExporterType::Influx);
        assert!("csv".parse::<ExporterType>().is_err());
    }
}
