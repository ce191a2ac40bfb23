//! Wire messages exchanged between nodes.
//!
//! Every frame is a JSON array `[topic, payload]`. Publications travel on
//! the publish/subscribe mesh; the router endpoint only understands
//! `remoteSub`.

use super::membership::NodeDescriptor;
use crate::error::{ClusterError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const TOPIC_HEARTBEAT: &str = "cluster:heartbeat";
pub const TOPIC_READY: &str = "cluster:ready";
pub const TOPIC_REMOVE: &str = "cluster:remove";
pub const TOPIC_SYNC: &str = "cluster:sync";
pub const TOPIC_NOTIFY: &str = "cluster:notify";

pub const ACTION_REMOTE_SUB: &str = "remoteSub";

/// What happened to a subscription, carried by `subscriptions` sync events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionPost {
    Add,
    Join,
    Off,
    /// A dead node's subscriptions were purged from the store.
    Clean,
}

/// A sync pointer: names what changed, rarely carries the state itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum SyncEvent {
    #[serde(rename = "autorefresh")]
    AutoRefresh { index: String, value: bool },

    #[serde(rename = "indexCache:add")]
    IndexCacheAdd { index: String, collection: String },

    #[serde(rename = "indexCache:remove")]
    IndexCacheRemove { index: String, collection: String },

    #[serde(rename = "indexCache:reset")]
    IndexCacheReset,

    #[serde(rename = "profile")]
    Profile { id: String },

    #[serde(rename = "role")]
    Role { id: String },

    #[serde(rename = "strategy:added", rename_all = "camelCase")]
    StrategyAdded {
        plugin_name: String,
        name: String,
        strategy: Value,
    },

    #[serde(rename = "strategy:removed", rename_all = "camelCase")]
    StrategyRemoved { plugin_name: String, name: String },

    /// Without index and collection, every resource is re-pulled.
    #[serde(rename = "subscriptions", rename_all = "camelCase")]
    Subscriptions {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        collection: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post: Option<SubscriptionPost>,
    },

    #[serde(rename = "validators")]
    Validators,

    #[serde(rename = "state:reset")]
    StateReset,
}

impl SyncEvent {
    /// Wire names of every event this node understands.
    pub const NAMES: [&'static str; 11] = [
        "autorefresh",
        "indexCache:add",
        "indexCache:remove",
        "indexCache:reset",
        "profile",
        "role",
        "strategy:added",
        "strategy:removed",
        "subscriptions",
        "validators",
        "state:reset",
    ];

    pub fn is_known(name: &str) -> bool {
        Self::NAMES.contains(&name)
    }

    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::AutoRefresh { .. } => "autorefresh",
            SyncEvent::IndexCacheAdd { .. } => "indexCache:add",
            SyncEvent::IndexCacheRemove { .. } => "indexCache:remove",
            SyncEvent::IndexCacheReset => "indexCache:reset",
            SyncEvent::Profile { .. } => "profile",
            SyncEvent::Role { .. } => "role",
            SyncEvent::StrategyAdded { .. } => "strategy:added",
            SyncEvent::StrategyRemoved { .. } => "strategy:removed",
            SyncEvent::Subscriptions { .. } => "subscriptions",
            SyncEvent::Validators => "validators",
            SyncEvent::StateReset => "state:reset",
        }
    }

    /// Pointer to a subscription change on one resource.
    pub fn subscriptions(
        index: &str,
        collection: &str,
        room_id: &str,
        post: SubscriptionPost,
    ) -> Self {
        SyncEvent::Subscriptions {
            index: Some(index.to_string()),
            collection: Some(collection.to_string()),
            room_id: Some(room_id.to_string()),
            post: Some(post),
        }
    }
}

/// Real-time notification relayed to the subscribers of other nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub channels: Vec<String>,
    pub notification: Value,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Publication {
    /// Sender identity.
    Heartbeat(String),
    Ready(NodeDescriptor),
    /// Identity of the node leaving the cluster.
    Remove(String),
    Sync(SyncEvent),
    Notify(Notification),
}

impl Publication {
    pub fn topic(&self) -> &'static str {
        match self {
            Publication::Heartbeat(_) => TOPIC_HEARTBEAT,
            Publication::Ready(_) => TOPIC_READY,
            Publication::Remove(_) => TOPIC_REMOVE,
            Publication::Sync(_) => TOPIC_SYNC,
            Publication::Notify(_) => TOPIC_NOTIFY,
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            Publication::Heartbeat(id) | Publication::Remove(id) => serde_json::to_value(id)?,
            Publication::Ready(descriptor) => serde_json::to_value(descriptor)?,
            Publication::Sync(event) => serde_json::to_value(event)?,
            Publication::Notify(notification) => serde_json::to_value(notification)?,
        };
        Ok(Bytes::from(serde_json::to_vec(&(self.topic(), payload))?))
    }

    /// Decode a frame.
    ///
    /// A `cluster:sync` payload naming an event outside [`SyncEvent::NAMES`]
    /// yields [`ClusterError::UnknownSyncEvent`]. Any other malformed frame,
    /// including a known event with a bad body, yields
    /// [`ClusterError::Protocol`].
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (topic, payload): (String, Value) = serde_json::from_slice(frame)
            .map_err(|e| ClusterError::Protocol(format!("Malformed frame: {}", e)))?;

        let malformed =
            |e: serde_json::Error| ClusterError::Protocol(format!("Malformed {} payload: {}", topic, e));

        match topic.as_str() {
            TOPIC_HEARTBEAT => Ok(Publication::Heartbeat(
                serde_json::from_value(payload).map_err(malformed)?,
            )),
            TOPIC_READY => Ok(Publication::Ready(
                serde_json::from_value(payload).map_err(malformed)?,
            )),
            TOPIC_REMOVE => Ok(Publication::Remove(
                serde_json::from_value(payload).map_err(malformed)?,
            )),
            TOPIC_NOTIFY => Ok(Publication::Notify(
                serde_json::from_value(payload).map_err(malformed)?,
            )),
            TOPIC_SYNC => {
                let name = payload.get("event").and_then(Value::as_str).map(str::to_owned);
                match name {
                    Some(name) if SyncEvent::is_known(&name) => serde_json::from_value(payload)
                        .map(Publication::Sync)
                        .map_err(malformed),
                    Some(name) => Err(ClusterError::UnknownSyncEvent(name)),
                    None => Err(ClusterError::Protocol(format!(
                        "Sync payload without an event name: {}",
                        payload
                    ))),
                }
            }
            other => Err(ClusterError::Protocol(format!("Unknown topic: {}", other))),
        }
    }
}

/// Request sent to a router endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum RouterRequest {
    /// Ask the receiver to subscribe back to the sender.
    RemoteSub(NodeDescriptor),
}

impl RouterRequest {
    pub fn encode(&self) -> Result<Bytes> {
        let RouterRequest::RemoteSub(descriptor) = self;
        Ok(Bytes::from(serde_json::to_vec(&(ACTION_REMOTE_SUB, descriptor))?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (action, payload): (String, Value) = serde_json::from_slice(frame)
            .map_err(|e| ClusterError::Protocol(format!("Malformed router request: {}", e)))?;
        match action.as_str() {
            ACTION_REMOTE_SUB => Ok(RouterRequest::RemoteSub(
                serde_json::from_value(payload).map_err(|e| {
                    ClusterError::Protocol(format!("Malformed remoteSub payload: {}", e))
                })?,
            )),
            other => Err(ClusterError::Protocol(format!("Unknown router action: {}", other))),
        }
    }
}

/// Reply to a [`RouterRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterReply {
    RemoteSub(bool),
}

impl RouterReply {
    pub fn encode(&self) -> Result<Bytes> {
        let RouterReply::RemoteSub(ack) = self;
        Ok(Bytes::from(serde_json::to_vec(&(ACTION_REMOTE_SUB, ack))?))
    }

    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (action, ack): (String, Value) = serde_json::from_slice(frame)
            .map_err(|e| ClusterError::Protocol(format!("Malformed router reply: {}", e)))?;
        match (action.as_str(), ack) {
            (ACTION_REMOTE_SUB, Value::Bool(ack)) => Ok(RouterReply::RemoteSub(ack)),
            (action, _) => Err(ClusterError::Protocol(format!(
                "Unexpected router reply: {}",
                action
            ))),
        }
    }
}
