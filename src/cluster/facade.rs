//! Application-facing side of the cluster.
//!
//! Hooks translate local events into store writes and sync pointers. Every
//! hook is a no-op (with a warning) while the node is not ready.

use super::membership::ClusterStatus;
use super::node::ClusterNode;
use super::protocol::{Notification, Publication, SubscriptionPost, SyncEvent};
use crate::error::{ClusterError, Result};
use crate::state::StateManager;
use crate::store::{FilterDescriptor, ResourceKey, StrategyRecord};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

pub struct ClusterFacade {
    node: Arc<ClusterNode>,
    state: Arc<StateManager>,
}

impl ClusterFacade {
    pub fn new(node: Arc<ClusterNode>, state: Arc<StateManager>) -> Self {
        Self { node, state }
    }

    fn connected(&self, action: &str) -> bool {
        if self.node.is_ready() {
            return true;
        }
        warn!(
            node = %self.node.id(),
            "Could not broadcast \"{}\" action: node not connected to cluster",
            action
        );
        false
    }

    fn sync(&self, event: SyncEvent) -> Result<()> {
        self.node.broadcast(Publication::Sync(event))
    }

    /// A room is about to be created locally: protect it from being
    /// deleted by a concurrent sync until `subscription_added` is done.
    pub fn room_being_created(&self, room_id: &str) -> Result<()> {
        if !self.node.is_ready() {
            return Ok(());
        }
        self.state.lock_create(room_id)
    }

    /// A connection subscribed to a new room.
    pub async fn subscription_added(
        &self,
        room_id: &str,
        connection_id: &str,
        filter: &FilterDescriptor,
    ) -> Result<()> {
        if !self.connected("subscription added") {
            // the room may have been locked before quorum was lost
            return self.state.unlock_create(room_id);
        }

        let resource = filter.resource();
        let written = self
            .state
            .store()
            .subscription_add(&resource, self.node.id(), room_id, connection_id, Some(filter))
            .await;
        self.state.unlock_create(room_id)?;
        let update = written?;
        debug!(
            %resource,
            room = room_id,
            connection = connection_id,
            version = update.version,
            count = update.count,
            "Subscription added"
        );
        trace!(debug = ?update.debug, "subscribe script");

        self.sync(SyncEvent::subscriptions(
            &resource.index,
            &resource.collection,
            room_id,
            SubscriptionPost::Add,
        ))
    }

    /// A connection joined an existing room.
    pub async fn subscription_joined(
        &self,
        resource: &ResourceKey,
        room_id: &str,
        connection_id: &str,
    ) -> Result<()> {
        if !self.connected("subscription joined") {
            return Ok(());
        }

        let update = self
            .state
            .store()
            .subscription_add(resource, self.node.id(), room_id, connection_id, None)
            .await?;
        debug!(
            %resource,
            room = room_id,
            connection = connection_id,
            version = update.version,
            count = update.count,
            "Subscription joined"
        );

        self.sync(SyncEvent::subscriptions(
            &resource.index,
            &resource.collection,
            room_id,
            SubscriptionPost::Join,
        ))
    }

    /// A connection left a room.
    pub async fn subscription_off(
        &self,
        resource: &ResourceKey,
        room_id: &str,
        connection_id: &str,
    ) -> Result<()> {
        if !self.connected("subscription off") {
            return Ok(());
        }

        self.state.lock_delete(room_id)?;
        let removed = self
            .state
            .store()
            .subscription_remove(resource, self.node.id(), room_id, connection_id)
            .await;
        self.state.unlock_delete(room_id)?;
        let update = removed?;
        debug!(
            %resource,
            room = room_id,
            connection = connection_id,
            version = update.version,
            count = update.count,
            "Subscription off"
        );

        self.sync(SyncEvent::subscriptions(
            &resource.index,
            &resource.collection,
            room_id,
            SubscriptionPost::Off,
        ))
    }

    pub fn index_cache_added(&self, index: &str, collection: &str) -> Result<()> {
        if !self.connected("index cache added") {
            return Ok(());
        }
        self.sync(SyncEvent::IndexCacheAdd {
            index: index.to_string(),
            collection: collection.to_string(),
        })
    }

    pub fn index_cache_removed(&self, index: &str, collection: &str) -> Result<()> {
        if !self.connected("index cache removed") {
            return Ok(());
        }
        self.sync(SyncEvent::IndexCacheRemove {
            index: index.to_string(),
            collection: collection.to_string(),
        })
    }

    pub fn index_cache_reset(&self) -> Result<()> {
        if !self.connected("index cache reset") {
            return Ok(());
        }
        self.sync(SyncEvent::IndexCacheReset)
    }

    pub fn profile_updated(&self, id: &str) -> Result<()> {
        if !self.connected("profile update") {
            return Ok(());
        }
        self.sync(SyncEvent::Profile { id: id.to_string() })
    }

    pub fn role_updated(&self, id: &str) -> Result<()> {
        if !self.connected("role update") {
            return Ok(());
        }
        self.sync(SyncEvent::Role { id: id.to_string() })
    }

    pub async fn strategy_added(&self, plugin: &str, name: &str, strategy: &Value) -> Result<()> {
        if !self.connected("strategy added") {
            return Ok(());
        }
        let record = StrategyRecord {
            plugin: plugin.to_string(),
            strategy: strategy.clone(),
        };
        let version = self.state.store().add_strategy(name, &record).await?;
        debug!(strategy = name, plugin, version, "Strategy stored");

        self.sync(SyncEvent::StrategyAdded {
            plugin_name: plugin.to_string(),
            name: name.to_string(),
            strategy: strategy.clone(),
        })
    }

    pub async fn strategy_removed(&self, plugin: &str, name: &str) -> Result<()> {
        if !self.connected("strategy removed") {
            return Ok(());
        }
        let version = self.state.store().remove_strategy(name).await?;
        debug!(strategy = name, plugin, version, "Strategy removed from store");

        self.sync(SyncEvent::StrategyRemoved {
            plugin_name: plugin.to_string(),
            name: name.to_string(),
        })
    }

    pub async fn auto_refresh_updated(&self, index: &str, value: bool) -> Result<()> {
        if !self.connected("autoRefresh updated") {
            return Ok(());
        }
        let version = self.state.store().set_auto_refresh(index, value).await?;
        debug!(index, value, version, "Auto-refresh stored");

        self.sync(SyncEvent::AutoRefresh {
            index: index.to_string(),
            value,
        })
    }

    pub fn specifications_refreshed(&self) -> Result<()> {
        if !self.connected("refresh specifications") {
            return Ok(());
        }
        self.sync(SyncEvent::Validators)
    }

    /// Relay a real-time notification to the other nodes.
    pub fn notify(&self, notification: Notification) -> Result<()> {
        if !self.connected("notify") {
            return Ok(());
        }
        self.node.broadcast(Publication::Notify(notification))
    }

    /// Cluster members, or [`ClusterError::NotReady`].
    pub async fn status(&self) -> Result<ClusterStatus> {
        if !self.node.is_ready() {
            return Err(ClusterError::NotReady);
        }
        self.node.status().await
    }

    pub fn health(&self) -> Result<()> {
        if self.node.is_ready() {
            Ok(())
        } else {
            Err(ClusterError::NotReady)
        }
    }

    /// Wipe the replicated state everywhere.
    pub async fn reset(&self) -> Result<()> {
        if !self.node.is_ready() {
            return Err(ClusterError::NotReady);
        }
        self.state.reset().await?;
        self.state.sync_all(true).await?;
        self.sync(SyncEvent::StateReset)?;
        info!(node = %self.node.id(), "Cluster reset broadcast");
        Ok(())
    }
}
