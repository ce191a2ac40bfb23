use super::{Bound, Inbound, InboundRequest, Transport};
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Default)]
struct HubState {
    /// Subscribers of each publish endpoint, keyed by subscriber publish endpoint.
    subscribers: HashMap<String, HashMap<String, mpsc::UnboundedSender<Bytes>>>,
    routers: HashMap<String, mpsc::UnboundedSender<InboundRequest>>,
    /// Publish endpoints of isolated nodes.
    isolated: HashSet<String>,
}

/// In-process network shared by several [`LocalTransport`]s.
///
/// Endpoints are plain names (`local://<node>/pub`, `local://<node>/router`),
/// and delivery is immediate. Nodes can be cut off to simulate a network
/// failure.
#[derive(Clone, Default)]
pub struct LocalHub {
    state: Arc<Mutex<HubState>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the transport of node `name`.
    pub fn transport(&self, name: &str) -> LocalTransport {
        LocalTransport {
            hub: self.clone(),
            publish: format!("local://{}/pub", name),
            router: format!("local://{}/router", name),
            publications_tx: Mutex::new(None),
        }
    }

    /// Cut a node off: its publications are dropped and requests to its
    /// router fail.
    pub fn isolate(&self, publish_endpoint: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.isolated.insert(publish_endpoint.to_string());
        }
    }

    pub fn restore(&self, publish_endpoint: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.isolated.remove(publish_endpoint);
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HubState>> {
        self.state
            .lock()
            .map_err(|e| ClusterError::Transport(format!("Lock error: {}", e)))
    }
}

pub struct LocalTransport {
    hub: LocalHub,
    publish: String,
    router: String,
    publications_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

impl LocalTransport {
    fn router_owner(router_endpoint: &str) -> String {
        match router_endpoint.strip_suffix("/router") {
            Some(base) => format!("{}/pub", base),
            None => router_endpoint.to_string(),
        }
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn bind(&self) -> Result<Bound> {
        let (publications_tx, publications) = mpsc::unbounded_channel();
        let (requests_tx, requests) = mpsc::unbounded_channel();

        {
            let mut state = self.hub.lock()?;
            if state.routers.contains_key(&self.router) {
                return Err(ClusterError::Transport(format!(
                    "Endpoint already bound: {}",
                    self.router
                )));
            }
            state.routers.insert(self.router.clone(), requests_tx);
            state.subscribers.entry(self.publish.clone()).or_default();
        }
        *self
            .publications_tx
            .lock()
            .map_err(|e| ClusterError::Transport(format!("Lock error: {}", e)))? =
            Some(publications_tx);

        Ok(Bound {
            publish: self.publish.clone(),
            router: self.router.clone(),
            inbound: Inbound {
                publications,
                requests,
            },
        })
    }

    fn publish(&self, frame: Bytes) {
        let Ok(mut state) = self.hub.state.lock() else {
            return;
        };
        if state.isolated.contains(&self.publish) {
            return;
        }
        if let Some(subscribers) = state.subscribers.get_mut(&self.publish) {
            subscribers.retain(|_, tx| tx.send(frame.clone()).is_ok());
        }
    }

    async fn connect(&self, publish_endpoint: &str) -> Result<()> {
        let tx = self
            .publications_tx
            .lock()
            .map_err(|e| ClusterError::Transport(format!("Lock error: {}", e)))?
            .clone()
            .ok_or_else(|| ClusterError::Transport("Transport is not bound".to_string()))?;

        // Like a TCP subscriber, connecting to an endpoint nobody bound yet
        // is allowed.
        let mut state = self.hub.lock()?;
        state
            .subscribers
            .entry(publish_endpoint.to_string())
            .or_default()
            .entry(self.publish.clone())
            .or_insert(tx);
        debug!(from = %self.publish, to = publish_endpoint, "Subscribed");
        Ok(())
    }

    async fn disconnect(&self, publish_endpoint: &str) {
        if let Ok(mut state) = self.hub.state.lock() {
            if let Some(subscribers) = state.subscribers.get_mut(publish_endpoint) {
                subscribers.remove(&self.publish);
            }
        }
    }

    async fn request(&self, router_endpoint: &str, payload: Bytes) -> Result<Bytes> {
        let router = {
            let state = self.hub.lock()?;
            if state.isolated.contains(&Self::router_owner(router_endpoint)) {
                None
            } else {
                state.routers.get(router_endpoint).cloned()
            }
        };
        let router = router.ok_or_else(|| {
            ClusterError::Transport(format!("Connection refused: {}", router_endpoint))
        })?;

        let (reply_tx, reply_rx) = oneshot::channel();
        router
            .send(InboundRequest {
                payload,
                reply: reply_tx,
            })
            .map_err(|_| {
                ClusterError::Transport(format!("Connection refused: {}", router_endpoint))
            })?;
        reply_rx.await.map_err(|_| {
            ClusterError::Transport(format!("{} closed the connection", router_endpoint))
        })
    }

    async fn close(&self) {
        if let Ok(mut state) = self.hub.state.lock() {
            state.routers.remove(&self.router);
            state.subscribers.remove(&self.publish);
            for subscribers in state.subscribers.values_mut() {
                subscribers.remove(&self.publish);
            }
        }
    }
}
