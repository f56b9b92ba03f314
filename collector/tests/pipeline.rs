//! End-to-end run: traffic through a sampler and two relays, drained by
//! the collector.

use flowtrace_collector::{
    EdgeId, EdgeStore, PathAnalyzer, Policy, ReportCollector, TopologyLoader, TrafficGenerator,
};
use flowtrace_dataplane::{ControlRequest, FlowTableConfig, PipelineConfig};
use std::sync::Arc;

const POLICY: &str = "
    1 -> 2

    (10.0.0.0/16, 0.0.0.0/0, 0, 0, 0): 0 -> 1 -> 2
";

fn config() -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.sampler.table = FlowTableConfig {
        size: 1024,
        bucket_depth: 4,
    };
    config.sampler.sample_target = 4;
    config.transport.pool_size = 1024;
    config.transport.ring_size = 256;
    config
}

#[test]
fn test_reports_flow_through_relay_chain() {
    let mut topology = TopologyLoader::from_config(config())
        .with_default_relays(2)
        .build()
        .unwrap();
    let transport = topology.transport();

    let policy: Policy = POLICY.parse().unwrap();
    let mut collector = ReportCollector::new(
        Arc::clone(&transport),
        EdgeStore::new(100),
        PathAnalyzer::new(policy),
    );

    let mut traffic = TrafficGenerator::new(8, 42);
    for _ in 0..20 {
        let mut batch = traffic.next_batch(32);
        topology.process_batch(&mut batch);
        collector.drain_all().unwrap();
    }
    collector.finish().unwrap();

    let sampler = topology.sampler_stats().unwrap();
    assert_eq!(sampler.packets, 640);
    assert_eq!(sampler.tracked, 640);
    assert!(sampler.marked >= 8 * 4);

    let relays = topology.relay_stats();
    assert_eq!(relays.len(), 2);
    for relay in &relays {
        assert_eq!(relay.marked, sampler.marked);
        assert_eq!(relay.reported, sampler.marked);
        assert_eq!(relay.dropped, 0);
    }

    let metrics = collector.generate_metrics(1);
    assert_eq!(metrics.total_reports, 2 * sampler.marked);
    assert_eq!(metrics.committed_rows, 2 * sampler.marked);
    assert_eq!(metrics.unique_flows, 8);

    let edges: Vec<(u32, u32)> = metrics.edges.iter().map(|e| (e.from_hop, e.to_hop)).collect();
    assert_eq!(edges, vec![(0, 1), (1, 2)]);
    assert!(metrics.unexpected_edges.is_empty());

    // One match per flow for the full chain
    assert_eq!(metrics.query_matches.len(), 8);
    assert!(metrics.query_matches.iter().all(|m| m.path == vec![0, 1, 2]));

    // Every buffer is back in the pool
    assert_eq!(transport.pool.available(), transport.pool.capacity());
    assert!(transport.ring.is_empty());

    topology.shutdown();
}

#[test]
fn test_disabled_relay_reports_unexpected_edge() {
    let mut topology = TopologyLoader::from_config(config())
        .with_default_relays(3)
        .build()
        .unwrap();
    topology
        .query("relay2", &ControlRequest::SetEnabled { enabled: false })
        .unwrap();

    let transport = topology.transport();
    let mut collector = ReportCollector::new(
        Arc::clone(&transport),
        EdgeStore::new(100),
        PathAnalyzer::new("1 -> 2\n2 -> 3\n(0.0.0.0/0, 0.0.0.0/0, 0, 0, 0): 3".parse().unwrap()),
    );

    let mut traffic = TrafficGenerator::new(1, 7);
    let mut batch = traffic.next_batch(16);
    topology.process_batch(&mut batch);
    collector.finish().unwrap();

    // relay2 passes packets through untouched, so relay3 sees hop 1
    assert_eq!(
        collector.analyzer().unexpected_edges(),
        vec![EdgeId { from: 1, to: 3 }]
    );
    assert_eq!(collector.analyzer().matches().len(), 1);
    assert_eq!(transport.pool.available(), transport.pool.capacity());
}
