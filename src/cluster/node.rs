//! The membership engine.
//!
//! A node is a single task owning the [`Membership`] state. Everything that
//! mutates the pool goes through it: inbound publications, router requests,
//! heartbeat expiry and commands from the [`ClusterNode`] handle. Slow work
//! (join passes, state pulls, peer cleanup) runs in spawned tasks that
//! report back through the command channel.

use super::membership::{ClusterStatus, JoinOutcome, Membership, NodeDescriptor, ReadyAnnouncement};
use super::protocol::{Publication, RouterReply, RouterRequest, SubscriptionPost, SyncEvent};
use crate::config::{ClusterConfig, TimersConfig};
use crate::error::{ClusterError, Result};
use crate::state::StateManager;
use crate::store::{ClusterStore, ResourceKey};
use crate::transport::{Inbound, InboundRequest, Transport};
use bytes::Bytes;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

enum Command {
    Broadcast(Publication),
    Status(oneshot::Sender<ClusterStatus>),
    /// Start join attempt `attempt` unless already ready.
    Join { attempt: u32 },
    /// Add discovered peers; replies with the whole pool.
    MergePeers {
        peers: Vec<NodeDescriptor>,
        reply: oneshot::Sender<Vec<NodeDescriptor>>,
    },
    JoinFinished {
        attempt: u32,
        unreachable: Vec<String>,
        result: Result<()>,
    },
    Shutdown(oneshot::Sender<()>),
}

/// Handle on a running cluster node.
pub struct ClusterNode {
    descriptor: NodeDescriptor,
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Receiver<bool>,
    cancel: CancellationToken,
    task: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
}

impl ClusterNode {
    /// Bind the transport, register in the discovery set, start
    /// heartbeating and joining. Returns once the first join pass is over,
    /// whatever its outcome.
    pub async fn start(
        config: &ClusterConfig,
        store: Arc<ClusterStore>,
        transport: Arc<dyn Transport>,
        state: Arc<StateManager>,
    ) -> Result<Self> {
        let bound = transport.bind().await?;
        let descriptor = NodeDescriptor::new(bound.publish, bound.router);
        store.register_node(&descriptor).await?;
        info!(
            publish = %descriptor.publish,
            router = %descriptor.router,
            minimum_nodes = config.minimum_nodes,
            "Cluster node registered"
        );

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (first_pass_tx, first_pass_rx) = oneshot::channel();
        let cancel = CancellationToken::new();

        let actor = NodeActor {
            membership: Membership::new(
                descriptor.clone(),
                config.minimum_nodes,
                config.retry_join,
                config.timers.heartbeat_expiry(),
            ),
            timers: config.timers.clone(),
            store,
            transport,
            state,
            commands: commands_tx.clone(),
            ready: ready_tx,
            join_in_flight: false,
            rejoin_pending: false,
            first_pass: Some(first_pass_tx),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run(bound.inbound, commands_rx));

        // Err only when the actor died before finishing a pass; the error
        // is reported by `finished`.
        let _ = first_pass_rx.await;

        Ok(Self {
            descriptor,
            commands: commands_tx,
            ready: ready_rx,
            cancel,
            task: tokio::sync::Mutex::new(Some(task)),
        })
    }

    /// Identity and endpoints of this node.
    pub fn descriptor(&self) -> &NodeDescriptor {
        &self.descriptor
    }

    pub fn id(&self) -> &str {
        self.descriptor.id()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the node is ready.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|r| *r)
            .await
            .map(|_| ())
            .map_err(|_| stopped())
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await.map_err(|_| stopped())
    }

    /// Publish to every peer. Fire-and-forget.
    pub fn broadcast(&self, publication: Publication) -> Result<()> {
        self.send(Command::Broadcast(publication))
    }

    /// Leave the cluster: announce the departure, unregister from the
    /// discovery set and stop the node.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        let _ = rx.await;
        self.finished().await
    }

    /// Wait for the node task to end. Fails if it stopped on a fatal error.
    pub async fn finished(&self) -> Result<()> {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| ClusterError::Protocol(format!("Node task failed: {}", e)))?,
            None => Ok(()),
        }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| stopped())
    }
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn stopped() -> ClusterError {
    ClusterError::Transport("Cluster node is stopped".to_string())
}

struct NodeActor {
    membership: Membership,
    timers: TimersConfig,
    store: Arc<ClusterStore>,
    transport: Arc<dyn Transport>,
    state: Arc<StateManager>,
    commands: mpsc::UnboundedSender<Command>,
    ready: watch::Sender<bool>,
    join_in_flight: bool,
    /// A join was requested while another was running.
    rejoin_pending: bool,
    first_pass: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
}

impl NodeActor {
    async fn run(
        mut self,
        mut inbound: Inbound,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) -> Result<()> {
        let mut heartbeat = tokio::time::interval(self.timers.heartbeat());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.start_join(1);

        let result = loop {
            let deadline = self.membership.next_deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                _ = heartbeat.tick() => {
                    let id = self.membership.id().to_string();
                    self.publish(&Publication::Heartbeat(id));
                }
                Some(command) = commands.recv() => {
                    if let Command::Shutdown(reply) = command {
                        self.leave().await;
                        let _ = reply.send(());
                        break Ok(());
                    }
                    self.handle_command(command).await;
                }
                Some(frame) = inbound.publications.recv() => {
                    if let Err(e) = self.handle_publication(&frame).await {
                        break Err(e);
                    }
                }
                Some(request) = inbound.requests.recv() => {
                    self.handle_request(request).await;
                }
                _ = sleep_until(deadline) => {
                    self.expire_peers().await;
                }
            }
            self.publish_readiness();
        };

        self.membership.demote();
        self.publish_readiness();
        self.cancel.cancel();
        if let Err(e) = &result {
            error!(node = %self.membership.id(), "Cluster node stopped: {}", e);
        } else {
            info!(node = %self.membership.id(), "Cluster node stopped");
        }
        result
    }

    fn publish_readiness(&self) {
        let ready = self.membership.is_ready();
        self.ready.send_if_modified(|current| {
            if *current != ready {
                *current = ready;
                true
            } else {
                false
            }
        });
    }

    fn publish(&self, publication: &Publication) {
        match publication.encode() {
            Ok(frame) => self.transport.publish(frame),
            Err(e) => error!(topic = publication.topic(), "Failed to encode publication: {}", e),
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Broadcast(publication) => self.publish(&publication),
            Command::Status(reply) => {
                let _ = reply.send(self.membership.status());
            }
            Command::Join { attempt } => self.request_join(attempt),
            Command::MergePeers { peers, reply } => {
                for peer in peers {
                    self.add_peer(peer).await;
                }
                let _ = reply.send(self.membership.peers());
            }
            Command::JoinFinished {
                attempt,
                unreachable,
                result,
            } => self.on_join_finished(attempt, unreachable, result).await,
            Command::Shutdown(_) => {}
        }
    }

    async fn handle_publication(&mut self, frame: &[u8]) -> Result<()> {
        let publication = match Publication::decode(frame) {
            Ok(publication) => publication,
            Err(e @ ClusterError::UnknownSyncEvent(_)) => return Err(e),
            Err(e) => {
                warn!("Dropping publication: {}", e);
                return Ok(());
            }
        };

        match publication {
            Publication::Heartbeat(id) => {
                trace!(peer = %id, "heartbeat");
                self.membership.heartbeat(&id, Instant::now());
            }
            Publication::Ready(descriptor) => self.on_peer_ready(descriptor).await,
            Publication::Remove(id) => {
                debug!(peer = %id, "Peer left the cluster");
                self.remove_node(&id).await;
            }
            Publication::Sync(event) => {
                trace!(event = event.name(), "sync");
                let state = Arc::clone(&self.state);
                tokio::spawn(async move {
                    let name = event.name();
                    if let Err(e) = apply_sync_event(&state, event).await {
                        warn!(event = name, "Failed to apply sync event: {}", e);
                    }
                });
            }
            Publication::Notify(notification) => {
                trace!(channels = ?notification.channels, "notify");
                self.state.sink().dispatch_notification(&notification);
            }
        }
        Ok(())
    }

    async fn handle_request(&mut self, request: InboundRequest) {
        match RouterRequest::decode(&request.payload) {
            Ok(RouterRequest::RemoteSub(descriptor)) => {
                debug!(peer = %descriptor.publish, "remoteSub");
                self.add_peer(descriptor).await;
                match RouterReply::RemoteSub(true).encode() {
                    Ok(reply) => {
                        let _ = request.reply.send(reply);
                    }
                    Err(e) => error!("Failed to encode remoteSub reply: {}", e),
                }
            }
            Err(e) => warn!("Dropping router request: {}", e),
        }
    }

    async fn add_peer(&mut self, descriptor: NodeDescriptor) {
        let publish = descriptor.publish.clone();
        if !self.membership.add_peer(descriptor, Instant::now()) {
            return;
        }
        info!(peer = %publish, "Peer added");
        if let Err(e) = self.transport.connect(&publish).await {
            warn!(peer = %publish, "Failed to subscribe: {}", e);
        }
    }

    async fn on_peer_ready(&mut self, descriptor: NodeDescriptor) {
        let publish = descriptor.publish.clone();
        match self.membership.peer_ready(descriptor, Instant::now()) {
            ReadyAnnouncement::Own => {}
            ReadyAnnouncement::Known => debug!(peer = %publish, "Peer ready"),
            ReadyAnnouncement::Unknown => {
                warn!(peer = %publish, "Unknown node ready, re-joining");
                if let Err(e) = self.transport.connect(&publish).await {
                    warn!(peer = %publish, "Failed to subscribe: {}", e);
                }
                if self.join_in_flight {
                    self.rejoin_pending = true;
                } else {
                    let max_jitter = self.timers.rejoin_delay_ms / 2;
                    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
                    let delay = self.timers.rejoin_delay() + Duration::from_millis(jitter);
                    self.schedule_join(1, delay);
                }
            }
        }
    }

    async fn expire_peers(&mut self) {
        for id in self.membership.expired(Instant::now()) {
            warn!(peer = %id, "No heartbeat received in time, removing node");
            self.remove_node(&id).await;
        }
    }

    /// Drop a peer, purge what it left in the store and re-check quorum.
    async fn remove_node(&mut self, id: &str) {
        if self.membership.remove_peer(id).is_none() {
            return;
        }
        self.transport.disconnect(id).await;
        info!(peer = %id, "Peer removed");

        tokio::spawn(clean_departed_node(
            Arc::clone(&self.state),
            Arc::clone(&self.transport),
            id.to_string(),
        ));

        if !self.membership.has_quorum() {
            warn!(
                pool = self.membership.pool_len(),
                "Not enough nodes to run, leaving the cluster and re-joining"
            );
            self.membership.demote();
            self.publish(&Publication::Remove(self.membership.id().to_string()));
            self.request_join(1);
        }
    }

    fn request_join(&mut self, attempt: u32) {
        if self.membership.is_ready() {
            debug!("Already joined, skipping join");
        } else if self.join_in_flight {
            self.rejoin_pending = true;
        } else {
            self.start_join(attempt);
        }
    }

    fn start_join(&mut self, attempt: u32) {
        self.membership.begin_join();
        self.join_in_flight = true;
        debug!(attempt, "Join attempt");

        let pass = JoinPass {
            me: self.membership.descriptor().clone(),
            store: Arc::clone(&self.store),
            transport: Arc::clone(&self.transport),
            state: Arc::clone(&self.state),
            commands: self.commands.clone(),
            handshake_timeout: self.timers.discover_timeout(),
        };
        tokio::spawn(pass.run(attempt));
    }

    fn schedule_join(&self, attempt: u32, delay: Duration) {
        let commands = self.commands.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = commands.send(Command::Join { attempt });
                }
            }
        });
    }

    async fn on_join_finished(&mut self, attempt: u32, unreachable: Vec<String>, result: Result<()>) {
        self.join_in_flight = false;

        for id in unreachable {
            if self.membership.remove_peer(&id).is_some() {
                self.transport.disconnect(&id).await;
                debug!(peer = %id, "Dropped unreachable peer");
            }
        }

        if self.rejoin_pending {
            self.rejoin_pending = false;
            self.membership.demote();
            self.start_join(1);
        } else {
            let outcome = match result {
                Ok(()) => self.membership.complete_join(attempt),
                Err(e) => {
                    warn!(attempt, "Join attempt failed: {}", e);
                    self.membership.abort_join(attempt)
                }
            };

            match outcome {
                JoinOutcome::Ready => {
                    info!(
                        node = %self.membership.id(),
                        peers = self.membership.pool_len(),
                        "Joined the cluster"
                    );
                    self.publish(&Publication::Ready(self.membership.descriptor().clone()));
                }
                JoinOutcome::Retry { next_attempt } => {
                    debug!(
                        attempt,
                        peers = self.membership.pool_len(),
                        "Quorum not reached, retrying"
                    );
                    self.schedule_join(next_attempt, self.timers.join_attempt_interval());
                }
                JoinOutcome::GaveUp => {
                    error!(attempt, "Could not join the cluster, giving up");
                }
            }
        }

        self.publish_readiness();
        if let Some(first_pass) = self.first_pass.take() {
            let _ = first_pass.send(());
        }
    }

    async fn leave(&mut self) {
        info!(node = %self.membership.id(), "Leaving the cluster");
        self.publish(&Publication::Remove(self.membership.id().to_string()));
        if let Err(e) = self.store.unregister_node(self.membership.descriptor()).await {
            warn!("Failed to unregister from discovery: {}", e);
        }
        self.transport.close().await;
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// One join pass, run outside the actor.
struct JoinPass {
    me: NodeDescriptor,
    store: Arc<ClusterStore>,
    transport: Arc<dyn Transport>,
    state: Arc<StateManager>,
    commands: mpsc::UnboundedSender<Command>,
    handshake_timeout: Duration,
}

impl JoinPass {
    async fn run(self, attempt: u32) {
        let (unreachable, result) = match self.pass().await {
            Ok(unreachable) => (unreachable, Ok(())),
            Err(e) => (Vec::new(), Err(e)),
        };
        let _ = self.commands.send(Command::JoinFinished {
            attempt,
            unreachable,
            result,
        });
    }

    /// Returns the peers that did not answer the handshake.
    async fn pass(&self) -> Result<Vec<String>> {
        let discovered = self.store.discover().await?;

        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::MergePeers {
                peers: discovered,
                reply: tx,
            })
            .map_err(|_| stopped())?;
        let peers = rx.await.map_err(|_| stopped())?;

        let request = RouterRequest::RemoteSub(self.me.clone()).encode()?;
        let handshakes = peers
            .iter()
            .map(|peer| self.remote_sub(peer, request.clone()));
        let unreachable = futures::future::join_all(handshakes)
            .await
            .into_iter()
            .flatten()
            .collect();

        self.state.sync_all(false).await?;
        Ok(unreachable)
    }

    async fn remote_sub(&self, peer: &NodeDescriptor, request: Bytes) -> Option<String> {
        let exchange = self.transport.request(&peer.router, request);
        let failure = match tokio::time::timeout(self.handshake_timeout, exchange).await {
            Ok(Ok(reply)) => match RouterReply::decode(&reply) {
                Ok(RouterReply::RemoteSub(true)) => return None,
                Ok(RouterReply::RemoteSub(false)) => "handshake refused".to_string(),
                Err(e) => e.to_string(),
            },
            Ok(Err(e)) => e.to_string(),
            Err(_) => ClusterError::Timeout(format!("no reply within {:?}", self.handshake_timeout))
                .to_string(),
        };
        warn!(peer = %peer.publish, "remoteSub failed: {}", failure);
        Some(peer.publish.clone())
    }
}

/// Purge a departed node's subscriptions from every resource, then pull
/// the resources it touched.
async fn clean_departed_node(state: Arc<StateManager>, transport: Arc<dyn Transport>, node_id: String) {
    let resources = match state.store().collections().await {
        Ok(resources) => resources,
        Err(e) => {
            warn!(peer = %node_id, "Failed to list resources for cleanup: {}", e);
            return;
        }
    };

    for resource in resources {
        match state.store().clean_node(&resource, &node_id).await {
            Ok(cleanup) => {
                debug!(
                    peer = %node_id,
                    %resource,
                    version = cleanup.version,
                    deleted_rooms = ?cleanup.deleted_rooms,
                    "Purged departed node"
                );
                // Stale versions are skipped here and on the receiving side.
                if let Err(e) = state.sync(&resource, false).await {
                    warn!(%resource, "Failed to sync after cleanup: {}", e);
                }
                announce_cleanup(transport.as_ref(), &resource);
            }
            Err(e) => warn!(peer = %node_id, %resource, "Failed to purge departed node: {}", e),
        }
    }
}

fn announce_cleanup(transport: &dyn Transport, resource: &ResourceKey) {
    let event = SyncEvent::Subscriptions {
        index: Some(resource.index.clone()),
        collection: Some(resource.collection.clone()),
        room_id: None,
        post: Some(SubscriptionPost::Clean),
    };
    match Publication::Sync(event).encode() {
        Ok(frame) => transport.publish(frame),
        Err(e) => error!("Failed to encode cleanup pointer: {}", e),
    }
}

/// Apply a sync event received from a peer.
pub(crate) async fn apply_sync_event(state: &StateManager, event: SyncEvent) -> Result<()> {
    let sink = state.sink();
    match event {
        SyncEvent::AutoRefresh { index, value } => sink.set_auto_refresh(&index, value),
        SyncEvent::IndexCacheAdd { index, collection } => sink.add_index_cache(&index, &collection),
        SyncEvent::IndexCacheRemove { index, collection } => {
            sink.remove_index_cache(&index, &collection)
        }
        SyncEvent::IndexCacheReset => sink.reset_index_cache(),
        SyncEvent::Profile { id } => sink.invalidate_profile(&id),
        SyncEvent::Role { id } => sink.invalidate_role(&id),
        SyncEvent::StrategyAdded {
            plugin_name,
            name,
            strategy,
        } => {
            if sink.has_strategy(&name) {
                debug!(strategy = %name, "Strategy already registered, discarding");
            } else {
                sink.register_strategy(&plugin_name, &name, &strategy);
            }
        }
        SyncEvent::StrategyRemoved { plugin_name, name } => {
            if sink.has_strategy(&name) {
                sink.unregister_strategy(&plugin_name, &name);
            } else {
                debug!(strategy = %name, "Strategy not found, discarding");
            }
        }
        SyncEvent::Subscriptions {
            index: Some(index),
            collection: Some(collection),
            ..
        } => {
            state.sync(&ResourceKey::new(index, collection), false).await?;
        }
        SyncEvent::Subscriptions { .. } => state.sync_all(false).await?,
        SyncEvent::Validators => sink.refresh_validators(),
        SyncEvent::StateReset => {
            state.reset_versions()?;
            state.sync_all(true).await?;
        }
    }
    Ok(())
}
