use std::{
    collections::HashMap,
    sync::atomic::{AtomicU16, Ordering},
};

use crate::{
    config::{NodeConfig, NodesConfig},
    sys::{LogicalModulesRef, NodeID, Sys},
    util::test_tracing_start,
};

// each cluster takes its own port block, so concurrently running
// tests never share a router entry
static NEXT_PORT: AtomicU16 = AtomicU16::new(2600);

/// one coordinator plus two workers, alive for as long as the test
/// holds the cluster; module tasks run on the test's own runtime
pub struct TestCluster {
    pub nodes: Vec<(Sys, LogicalModulesRef)>,
}

impl TestCluster {
    pub fn node(&self, i: usize) -> LogicalModulesRef {
        self.nodes[i].1.clone()
    }
    pub fn coord(&self) -> LogicalModulesRef {
        self.node(0)
    }
}

pub async fn start_test_cluster() -> TestCluster {
    test_tracing_start();

    let base = NEXT_PORT.fetch_add(3, Ordering::Relaxed);
    let mut all: HashMap<NodeID, NodeConfig> = HashMap::new();
    for (i, spec) in ["coord", "worker", "worker"].iter().enumerate() {
        let addr = format!("127.0.0.1:{}", base + i as u16).parse().unwrap();
        let _ = all.insert(
            i as NodeID + 1,
            NodeConfig::new(addr, [spec.to_string()].into_iter().collect()),
        );
    }

    let mut systems = vec![];
    for id in 1..=3 as NodeID {
        let mut peers = all.clone();
        let this = peers.remove(&id).unwrap();
        tracing::info!("creating test sys {}", id);
        systems.push(Sys::new(NodesConfig {
            peers,
            this: (id, this),
            file_dir: format!("test_temp_dir{}", id).into(),
        }));
    }

    let mut nodes = vec![];
    for sys in systems {
        let modules_ref = sys.test_start_all().await;
        nodes.push((sys, modules_ref));
    }
    TestCluster { nodes }
}
