//! Cluster membership and the application hook surface.
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              ClusterFacade                  │
//! │  (hooks, status / health / reset)          │
//! └─────────────────────────────────────────────┘
//!          │ store writes          │ sync pointers
//!          ▼                       ▼
//! ┌──────────────────┐   ┌──────────────────────┐
//! │   ClusterStore   │   │   ClusterNode actor  │
//! │  (atomic Lua)    │   │  pool, heartbeats,   │
//! └──────────────────┘   │  join, removal       │
//!          ▲             └──────────────────────┘
//!          │ pull                  │ Transport
//! ┌──────────────────┐             ▼
//! │  StateManager    │◀──── peers' publications
//! └──────────────────┘
//! ```

mod facade;
mod membership;
mod node;
mod protocol;

pub use facade::ClusterFacade;
pub use membership::{ClusterStatus, JoinOutcome, Membership, NodeDescriptor, Phase, ReadyAnnouncement};
pub use node::ClusterNode;
pub use protocol::{
    Notification, Publication, RouterReply, RouterRequest, SubscriptionPost, SyncEvent,
    TOPIC_HEARTBEAT, TOPIC_NOTIFY, TOPIC_READY, TOPIC_REMOVE, TOPIC_SYNC,
};
