//! Message transport between cluster nodes.
//!
//! Each node owns two endpoints:
//!
//! - a **publish** endpoint, fanning every published frame out to all
//!   connected subscribers (fire-and-forget, no delivery guarantee);
//! - a **router** endpoint, answering request/reply exchanges.
//!
//! A node subscribes to a peer by connecting to the peer's publish
//! endpoint. Inbound traffic of both kinds is delivered through channels so
//! the membership engine can drain it from a single task.

mod local;
mod tcp;

pub use self::local::{LocalHub, LocalTransport};
pub use self::tcp::TcpTransport;

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

/// A request received on the router endpoint.
#[derive(Debug)]
pub struct InboundRequest {
    pub payload: Bytes,
    pub reply: oneshot::Sender<Bytes>,
}

/// Receivers for everything a node gets from the network.
#[derive(Debug)]
pub struct Inbound {
    /// Frames published by the peers this node subscribed to.
    pub publications: mpsc::UnboundedReceiver<Bytes>,
    /// Requests sent to this node's router endpoint.
    pub requests: mpsc::UnboundedReceiver<InboundRequest>,
}

/// Result of binding a transport.
#[derive(Debug)]
pub struct Bound {
    /// Actual publish endpoint (resolved port when bound to port 0).
    pub publish: String,
    /// Actual router endpoint.
    pub router: String,
    pub inbound: Inbound,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bind the publish and router endpoints. Must be called once, before
    /// any other method.
    async fn bind(&self) -> Result<Bound>;

    /// Publish a frame to every connected subscriber.
    fn publish(&self, frame: Bytes);

    /// Subscribe to the frames published at `publish_endpoint`. Connecting
    /// twice to the same endpoint is a no-op.
    async fn connect(&self, publish_endpoint: &str) -> Result<()>;

    /// Stop receiving frames from `publish_endpoint`.
    async fn disconnect(&self, publish_endpoint: &str);

    /// Send a request to a router endpoint and wait for its reply.
    async fn request(&self, router_endpoint: &str, payload: Bytes) -> Result<Bytes>;

    /// Release every socket.
    async fn close(&self);
}
