//! Helpers shared by the multi-node integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use syncmesh::config::ClusterConfig;
use syncmesh::{
    ClusterFacade, ClusterNode, ClusterStore, FilterDescriptor, LocalHub, MemoryStateSink,
    ResourceKey, StateManager,
};

pub struct TestNode {
    pub node: Arc<ClusterNode>,
    pub facade: ClusterFacade,
    pub state: Arc<StateManager>,
    pub sink: Arc<MemoryStateSink>,
}

impl TestNode {
    pub fn id(&self) -> String {
        self.node.id().to_string()
    }
}

pub fn cluster_config(minimum_nodes: usize) -> ClusterConfig {
    ClusterConfig {
        minimum_nodes,
        retry_join: 30,
        ..ClusterConfig::default()
    }
}

pub fn shared_store() -> Arc<ClusterStore> {
    Arc::new(ClusterStore::embedded().expect("embedded store"))
}

pub async fn start_node(
    hub: &LocalHub,
    store: &Arc<ClusterStore>,
    name: &str,
    config: &ClusterConfig,
) -> TestNode {
    let sink = Arc::new(MemoryStateSink::new());
    let state = Arc::new(StateManager::new(Arc::clone(store), sink.clone()));
    let transport = Arc::new(hub.transport(name));
    let node = Arc::new(
        ClusterNode::start(config, Arc::clone(store), transport, Arc::clone(&state))
            .await
            .expect("node start"),
    );
    let facade = ClusterFacade::new(Arc::clone(&node), Arc::clone(&state));
    TestNode {
        node,
        facade,
        state,
        sink,
    }
}

pub fn filter(resource: &ResourceKey) -> FilterDescriptor {
    FilterDescriptor {
        index: resource.index.clone(),
        collection: resource.collection.clone(),
        filters: serde_json::json!([[{"equals": {"status": "open"}}]]),
    }
}
