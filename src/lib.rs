//! Cluster membership and versioned state replication for multi-node
//! real-time services.
//!
//! Nodes find each other through a discovery set kept in a shared atomic
//! store, form a full publish/subscribe mesh, detect failures with
//! heartbeats and gate readiness on a minimum cluster size. Replicated
//! subscription state lives in the store behind per-resource version
//! counters; nodes broadcast small sync pointers and pull the authoritative
//! snapshot when told something changed.

pub mod cluster;
pub mod config;
pub mod error;
pub mod state;
pub mod store;
pub mod transport;

pub use cluster::{ClusterFacade, ClusterNode, ClusterStatus, NodeDescriptor, SyncEvent};
pub use config::Config;
pub use error::{ClusterError, Result};
pub use state::{MemoryStateSink, StateManager, StateSink};
pub use store::{ClusterStore, FilterDescriptor, ResourceKey};
pub use transport::{LocalHub, TcpTransport, Transport};
