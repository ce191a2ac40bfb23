//! Shared atomic store.
//!
//! Every cross-node read-modify-write goes through a Lua script so it runs
//! atomically on the store side. The same scripts are executed either by a
//! Redis server ([`RedisRunner`]) or by the in-process engine
//! ([`EmbeddedRunner`]), which understands the subset of Redis commands the
//! scripts use.
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │   ClusterStore (typed contract)          │
//! │   register / subscribe / state / reset   │
//! └──────────────────────────────────────────┘
//!                      │ Script + KEYS + ARGV
//!                      ▼
//! ┌───────────────────┐   ┌──────────────────┐
//! │  EmbeddedRunner   │   │   RedisRunner    │
//! │  mlua + Keyspace  │   │   EVALSHA/EVAL   │
//! └───────────────────┘   └──────────────────┘
//! ```

mod embedded;
mod keyspace;
mod remote;
mod reply;

pub use self::embedded::EmbeddedRunner;
pub use self::keyspace::Keyspace;
pub use self::remote::RedisRunner;
pub use self::reply::Reply;

use crate::cluster::NodeDescriptor;
use crate::error::{ClusterError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Prefix shared by every key the cluster owns.
pub const KEY_PREFIX: &str = "cluster:";
pub const DISCOVERY_KEY: &str = "cluster:discovery";
pub const COLLECTIONS_KEY: &str = "cluster:collections";
pub const AUTO_REFRESH_KEY: &str = "cluster:autorefresh";
pub const STRATEGIES_KEY: &str = "cluster:strategies";
pub const WILDCARD_VERSION_KEY: &str = "cluster:version:*";

const WILDCARD: &str = "*";

/// An `(index, collection)` pair identifying one independently versioned
/// slice of replicated state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub index: String,
    pub collection: String,
}

impl ResourceKey {
    pub fn new(index: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            collection: collection.into(),
        }
    }

    /// The `("*", "*")` pair holding cluster-wide settings.
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD)
    }

    pub fn is_wildcard(&self) -> bool {
        self.index == WILDCARD && self.collection == WILDCARD
    }

    /// `index/collection`, as stored in the collections registry.
    pub fn tag(&self) -> String {
        format!("{}/{}", self.index, self.collection)
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        tag.split_once('/')
            .map(|(index, collection)| Self::new(index, collection))
    }

    fn version_key(&self) -> String {
        format!("{}version:{{{}}}", KEY_PREFIX, self.tag())
    }

    fn filters_key(&self) -> String {
        format!("{}filters:{{{}}}", KEY_PREFIX, self.tag())
    }

    fn subscribers_prefix(&self) -> String {
        format!("{}subs:{{{}}}:", KEY_PREFIX, self.tag())
    }

    fn subscribers_key(&self, room_id: &str) -> String {
        format!("{}{}", self.subscribers_prefix(), room_id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.collection)
    }
}

/// Normalized real-time filter attached to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    pub index: String,
    pub collection: String,
    pub filters: serde_json::Value,
}

impl FilterDescriptor {
    pub fn resource(&self) -> ResourceKey {
        ResourceKey::new(&self.index, &self.collection)
    }
}

/// One room as recorded in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub id: String,
    /// `None` when the room was only ever joined, never created, through the store.
    pub filter: Option<FilterDescriptor>,
    pub count: i64,
}

/// Authoritative state of one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceState {
    pub version: i64,
    pub rooms: Vec<RoomSnapshot>,
}

/// Result of an atomic subscription write.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionUpdate {
    pub version: i64,
    pub count: i64,
    pub debug: Vec<String>,
}

/// Result of purging a departed node from one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeCleanup {
    pub version: i64,
    pub deleted_rooms: Vec<String>,
}

/// A registered authentication strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub plugin: String,
    pub strategy: serde_json::Value,
}

/// Cluster-wide settings attached to the wildcard resource.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WildcardState {
    pub version: i64,
    pub auto_refresh: BTreeMap<String, bool>,
    pub strategies: BTreeMap<String, StrategyRecord>,
}

/// A Lua script and its SHA1 digest.
#[derive(Debug, Clone)]
pub struct Script {
    name: &'static str,
    source: &'static str,
    sha1: String,
}

impl Script {
    pub fn new(name: &'static str, source: &'static str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(source.as_bytes());
        Self {
            name,
            source,
            sha1: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn source(&self) -> &'static str {
        self.source
    }

    pub fn sha1(&self) -> &str {
        &self.sha1
    }
}

/// Executes scripts atomically against a key-value store.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn eval(&self, script: &Script, keys: &[String], args: &[String]) -> Result<Reply>;
}

struct Scripts {
    discovery: Script,
    subscribe: Script,
    unsubscribe: Script,
    state: Script,
    clean_node: Script,
    collections: Script,
    settings: Script,
    reset: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            discovery: Script::new("discovery", include_str!("scripts/discovery.lua")),
            subscribe: Script::new("subscribe", include_str!("scripts/subscribe.lua")),
            unsubscribe: Script::new("unsubscribe", include_str!("scripts/unsubscribe.lua")),
            state: Script::new("state", include_str!("scripts/state.lua")),
            clean_node: Script::new("clean_node", include_str!("scripts/clean_node.lua")),
            collections: Script::new("collections", include_str!("scripts/collections.lua")),
            settings: Script::new("settings", include_str!("scripts/settings.lua")),
            reset: Script::new("reset", include_str!("scripts/reset.lua")),
        }
    }
}

/// Typed client for the cluster's atomic store.
pub struct ClusterStore {
    runner: Arc<dyn ScriptRunner>,
    scripts: Scripts,
}

impl ClusterStore {
    pub fn new(runner: Arc<dyn ScriptRunner>) -> Self {
        Self {
            runner,
            scripts: Scripts::load(),
        }
    }

    /// Store backed by a fresh in-process keyspace.
    pub fn embedded() -> Result<Self> {
        Ok(Self::new(Arc::new(EmbeddedRunner::new()?)))
    }

    /// Store backed by the Redis server at `url`.
    pub async fn redis(url: &str) -> Result<Self> {
        Ok(Self::new(Arc::new(RedisRunner::connect(url).await?)))
    }

    async fn eval(&self, script: &Script, keys: Vec<String>, args: Vec<String>) -> Result<Reply> {
        trace!(script = script.name(), ?keys, ?args, "eval");
        self.runner.eval(script, &keys, &args).await
    }

    /// Add a node to the discovery set.
    pub async fn register_node(&self, node: &NodeDescriptor) -> Result<()> {
        let serialized = serde_json::to_string(&node.discoverable())?;
        self.eval(
            &self.scripts.discovery,
            vec![DISCOVERY_KEY.to_string()],
            vec!["add".to_string(), serialized],
        )
        .await?;
        Ok(())
    }

    pub async fn unregister_node(&self, node: &NodeDescriptor) -> Result<()> {
        let serialized = serde_json::to_string(&node.discoverable())?;
        self.eval(
            &self.scripts.discovery,
            vec![DISCOVERY_KEY.to_string()],
            vec!["remove".to_string(), serialized],
        )
        .await?;
        Ok(())
    }

    /// Nodes currently registered in the discovery set.
    pub async fn discover(&self) -> Result<Vec<NodeDescriptor>> {
        let members = self
            .eval(
                &self.scripts.discovery,
                vec![DISCOVERY_KEY.to_string()],
                vec!["members".to_string()],
            )
            .await?
            .into_strings()?;

        members
            .iter()
            .map(|m| serde_json::from_str(m).map_err(ClusterError::from))
            .collect()
    }

    /// Record `connection_id` (hosted on `node_id`) as a subscriber of
    /// `room_id`, bumping the resource version.
    ///
    /// `filter` is `None` when joining a room that already exists.
    pub async fn subscription_add(
        &self,
        resource: &ResourceKey,
        node_id: &str,
        room_id: &str,
        connection_id: &str,
        filter: Option<&FilterDescriptor>,
    ) -> Result<SubscriptionUpdate> {
        let serialized_filter = match filter {
            Some(f) => serde_json::to_string(f)?,
            None => "none".to_string(),
        };
        let reply = self
            .eval(
                &self.scripts.subscribe,
                vec![
                    COLLECTIONS_KEY.to_string(),
                    resource.version_key(),
                    resource.filters_key(),
                    resource.subscribers_key(room_id),
                ],
                vec![
                    resource.tag(),
                    room_id.to_string(),
                    subscriber(node_id, connection_id),
                    serialized_filter,
                ],
            )
            .await?;
        decode_subscription_update(reply)
    }

    pub async fn subscription_remove(
        &self,
        resource: &ResourceKey,
        node_id: &str,
        room_id: &str,
        connection_id: &str,
    ) -> Result<SubscriptionUpdate> {
        let reply = self
            .eval(
                &self.scripts.unsubscribe,
                vec![
                    COLLECTIONS_KEY.to_string(),
                    resource.version_key(),
                    resource.filters_key(),
                    resource.subscribers_key(room_id),
                ],
                vec![
                    resource.tag(),
                    room_id.to_string(),
                    subscriber(node_id, connection_id),
                ],
            )
            .await?;
        decode_subscription_update(reply)
    }

    /// Current version and rooms of one resource.
    pub async fn fetch_state(&self, resource: &ResourceKey) -> Result<ResourceState> {
        let reply = self
            .eval(
                &self.scripts.state,
                vec![resource.version_key(), resource.filters_key()],
                vec![resource.subscribers_prefix()],
            )
            .await?;

        let mut parts = reply.into_array()?.into_iter();
        let version = next_part(&mut parts, "version")?.into_integer()?;
        let mut rooms = Vec::new();
        for room in next_part(&mut parts, "rooms")?.into_array()? {
            let mut fields = room.into_array()?.into_iter();
            let id = next_part(&mut fields, "room id")?.into_string()?;
            let filter = match next_part(&mut fields, "room filter")?.into_opt_string()? {
                Some(raw) if raw != "none" => Some(serde_json::from_str(&raw)?),
                _ => None,
            };
            let count = next_part(&mut fields, "room count")?.into_integer()?;
            rooms.push(RoomSnapshot { id, filter, count });
        }

        Ok(ResourceState { version, rooms })
    }

    /// Purge every subscription `node_id` contributed to `resource`.
    pub async fn clean_node(&self, resource: &ResourceKey, node_id: &str) -> Result<NodeCleanup> {
        let reply = self
            .eval(
                &self.scripts.clean_node,
                vec![
                    COLLECTIONS_KEY.to_string(),
                    resource.version_key(),
                    resource.filters_key(),
                ],
                vec![
                    resource.tag(),
                    resource.subscribers_prefix(),
                    subscriber(node_id, ""),
                ],
            )
            .await?;

        let mut parts = reply.into_array()?.into_iter();
        let version = next_part(&mut parts, "version")?.into_integer()?;
        let deleted_rooms = next_part(&mut parts, "deleted rooms")?.into_strings()?;
        Ok(NodeCleanup {
            version,
            deleted_rooms,
        })
    }

    /// Resources with at least one live room.
    pub async fn collections(&self) -> Result<Vec<ResourceKey>> {
        let tags = self
            .eval(
                &self.scripts.collections,
                vec![COLLECTIONS_KEY.to_string()],
                Vec::new(),
            )
            .await?
            .into_strings()?;
        Ok(tags.iter().filter_map(|t| ResourceKey::from_tag(t)).collect())
    }

    fn settings_keys() -> Vec<String> {
        vec![
            WILDCARD_VERSION_KEY.to_string(),
            AUTO_REFRESH_KEY.to_string(),
            STRATEGIES_KEY.to_string(),
        ]
    }

    /// Persist an index auto-refresh flag. Returns the new wildcard version.
    pub async fn set_auto_refresh(&self, index: &str, value: bool) -> Result<i64> {
        self.eval(
            &self.scripts.settings,
            Self::settings_keys(),
            vec!["autorefresh".to_string(), index.to_string(), value.to_string()],
        )
        .await?
        .into_integer()
    }

    pub async fn add_strategy(&self, name: &str, record: &StrategyRecord) -> Result<i64> {
        self.eval(
            &self.scripts.settings,
            Self::settings_keys(),
            vec![
                "strategy_add".to_string(),
                name.to_string(),
                serde_json::to_string(record)?,
            ],
        )
        .await?
        .into_integer()
    }

    pub async fn remove_strategy(&self, name: &str) -> Result<i64> {
        self.eval(
            &self.scripts.settings,
            Self::settings_keys(),
            vec!["strategy_remove".to_string(), name.to_string()],
        )
        .await?
        .into_integer()
    }

    pub async fn fetch_wildcard(&self) -> Result<WildcardState> {
        let reply = self
            .eval(
                &self.scripts.settings,
                Self::settings_keys(),
                vec!["fetch".to_string()],
            )
            .await?;

        let mut parts = reply.into_array()?.into_iter();
        let version = next_part(&mut parts, "version")?.into_integer()?;
        let auto_refresh = next_part(&mut parts, "auto-refresh")?
            .into_pairs()?
            .into_iter()
            .map(|(index, value)| (index, value == "true"))
            .collect();
        let mut strategies = BTreeMap::new();
        for (name, raw) in next_part(&mut parts, "strategies")?.into_pairs()? {
            strategies.insert(name, serde_json::from_str(&raw)?);
        }

        Ok(WildcardState {
            version,
            auto_refresh,
            strategies,
        })
    }

    /// Delete every cluster key except the discovery set. Returns the
    /// number of deleted keys.
    pub async fn reset_all(&self) -> Result<i64> {
        self.eval(
            &self.scripts.reset,
            Vec::new(),
            vec![format!("{}*", KEY_PREFIX), DISCOVERY_KEY.to_string()],
        )
        .await?
        .into_integer()
    }
}

fn subscriber(node_id: &str, connection_id: &str) -> String {
    format!("{}#{}", node_id, connection_id)
}

fn next_part(parts: &mut impl Iterator<Item = Reply>, what: &str) -> Result<Reply> {
    parts
        .next()
        .ok_or_else(|| ClusterError::Store(format!("Missing {} in script reply", what)))
}

fn decode_subscription_update(reply: Reply) -> Result<SubscriptionUpdate> {
    let mut parts = reply.into_array()?.into_iter();
    let version = next_part(&mut parts, "version")?.into_integer()?;
    let count = next_part(&mut parts, "count")?.into_integer()?;
    let debug = match parts.next() {
        Some(d) => d.into_strings()?,
        None => Vec::new(),
    };
    Ok(SubscriptionUpdate {
        version,
        count,
        debug,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(port: u16) -> NodeDescriptor {
        NodeDescriptor::new(
            format!("tcp://127.0.0.1:{}", port),
            format!("tcp://127.0.0.1:{}", port + 1),
        )
    }

    fn filter(resource: &ResourceKey) -> FilterDescriptor {
        FilterDescriptor {
            index: resource.index.clone(),
            collection: resource.collection.clone(),
            filters: json!([[{"equals": {"foo": "bar"}}]]),
        }
    }

    #[test]
    fn test_resource_key_tag() {
        let key = ResourceKey::new("i", "c");
        assert_eq!(key.tag(), "i/c");
        assert_eq!(ResourceKey::from_tag("i/c"), Some(key.clone()));
        assert_eq!(ResourceKey::from_tag("nocollection"), None);
        assert_eq!(key.version_key(), "cluster:version:{i/c}");
        assert_eq!(key.subscribers_key("r1"), "cluster:subs:{i/c}:r1");
        assert!(ResourceKey::wildcard().is_wildcard());
        assert!(!key.is_wildcard());
    }

    #[test]
    fn test_script_sha1() {
        let script = Script::new("ret", "return 1");
        assert_eq!(script.sha1(), "e0e1f9fabfc9d4800c877a703b823ac0578ff8db");
    }

    #[tokio::test]
    async fn test_register_and_discover() {
        let store = ClusterStore::embedded().unwrap();
        let a = node(7000);
        let b = node(7100);

        store.register_node(&a).await.unwrap();
        store.register_node(&b).await.unwrap();
        // registering twice is a no-op
        store.register_node(&a).await.unwrap();

        let mut found = store.discover().await.unwrap();
        found.sort_by(|x, y| x.publish.cmp(&y.publish));
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].publish, a.publish);
        assert!(!found[0].ready);

        store.unregister_node(&a).await.unwrap();
        let found = store.discover().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].publish, b.publish);
    }

    #[tokio::test]
    async fn test_discoverable_ignores_ready_flag() {
        let store = ClusterStore::embedded().unwrap();
        let mut a = node(7000);
        store.register_node(&a).await.unwrap();

        a.ready = true;
        store.unregister_node(&a).await.unwrap();
        assert!(store.discover().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscription_round_trip() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");
        let f = filter(&resource);

        let update = store
            .subscription_add(&resource, "node-a", "room-1", "conn-1", Some(&f))
            .await
            .unwrap();
        assert_eq!(update.version, 1);
        assert_eq!(update.count, 1);
        assert!(!update.debug.is_empty());

        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.version, 1);
        assert_eq!(state.rooms.len(), 1);
        assert_eq!(state.rooms[0].id, "room-1");
        assert_eq!(state.rooms[0].count, 1);
        assert_eq!(state.rooms[0].filter.as_ref(), Some(&f));

        let update = store
            .subscription_add(&resource, "node-b", "room-1", "conn-2", None)
            .await
            .unwrap();
        assert_eq!(update.version, 2);
        assert_eq!(update.count, 2);

        // joining without a filter keeps the stored one
        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.rooms[0].count, 2);
        assert_eq!(state.rooms[0].filter.as_ref(), Some(&f));
        assert_eq!(store.collections().await.unwrap(), vec![resource.clone()]);
    }

    #[tokio::test]
    async fn test_subscription_remove_deletes_empty_room() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");
        let f = filter(&resource);

        store
            .subscription_add(&resource, "node-a", "room-1", "conn-1", Some(&f))
            .await
            .unwrap();
        store
            .subscription_add(&resource, "node-a", "room-1", "conn-2", None)
            .await
            .unwrap();

        let update = store
            .subscription_remove(&resource, "node-a", "room-1", "conn-1")
            .await
            .unwrap();
        assert_eq!(update.version, 3);
        assert_eq!(update.count, 1);

        let update = store
            .subscription_remove(&resource, "node-a", "room-1", "conn-2")
            .await
            .unwrap();
        assert_eq!(update.version, 4);
        assert_eq!(update.count, 0);

        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.version, 4);
        assert!(state.rooms.is_empty());
        assert!(store.collections().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_unknown_resource() {
        let store = ClusterStore::embedded().unwrap();
        let state = store.fetch_state(&ResourceKey::new("x", "y")).await.unwrap();
        assert_eq!(state.version, 1);
        assert!(state.rooms.is_empty());
    }

    #[tokio::test]
    async fn test_room_joined_before_filter_is_known() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");

        store
            .subscription_add(&resource, "node-a", "room-1", "conn-1", None)
            .await
            .unwrap();
        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.rooms[0].filter, None);

        let f = filter(&resource);
        store
            .subscription_add(&resource, "node-b", "room-1", "conn-2", Some(&f))
            .await
            .unwrap();
        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.rooms[0].filter.as_ref(), Some(&f));
    }

    #[tokio::test]
    async fn test_clean_node() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");
        let f = filter(&resource);

        store
            .subscription_add(&resource, "tcp://a:1", "shared", "c1", Some(&f))
            .await
            .unwrap();
        store
            .subscription_add(&resource, "tcp://b:1", "shared", "c2", None)
            .await
            .unwrap();
        store
            .subscription_add(&resource, "tcp://a:1", "only-a", "c3", Some(&f))
            .await
            .unwrap();

        let cleanup = store.clean_node(&resource, "tcp://a:1").await.unwrap();
        assert_eq!(cleanup.version, 4);
        assert_eq!(cleanup.deleted_rooms, vec!["only-a".to_string()]);

        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.rooms.len(), 1);
        assert_eq!(state.rooms[0].id, "shared");
        assert_eq!(state.rooms[0].count, 1);

        // nothing left to purge: version unchanged
        let cleanup = store.clean_node(&resource, "tcp://a:1").await.unwrap();
        assert_eq!(cleanup.version, 4);
        assert!(cleanup.deleted_rooms.is_empty());
    }

    #[tokio::test]
    async fn test_clean_node_does_not_match_longer_ids() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");
        let f = filter(&resource);

        store
            .subscription_add(&resource, "tcp://a:10", "room", "c1", Some(&f))
            .await
            .unwrap();
        let cleanup = store.clean_node(&resource, "tcp://a:1").await.unwrap();
        assert!(cleanup.deleted_rooms.is_empty());
        assert_eq!(store.fetch_state(&resource).await.unwrap().rooms.len(), 1);
    }

    #[tokio::test]
    async fn test_wildcard_settings() {
        let store = ClusterStore::embedded().unwrap();

        let empty = store.fetch_wildcard().await.unwrap();
        assert_eq!(empty.version, 0);
        assert!(empty.auto_refresh.is_empty());

        assert_eq!(store.set_auto_refresh("index", true).await.unwrap(), 1);
        let record = StrategyRecord {
            plugin: "auth-plugin".to_string(),
            strategy: json!({"config": {"authenticator": "local"}}),
        };
        assert_eq!(store.add_strategy("local", &record).await.unwrap(), 2);

        let state = store.fetch_wildcard().await.unwrap();
        assert_eq!(state.version, 2);
        assert_eq!(state.auto_refresh.get("index"), Some(&true));
        assert_eq!(state.strategies.get("local"), Some(&record));

        assert_eq!(store.remove_strategy("local").await.unwrap(), 3);
        assert!(store.fetch_wildcard().await.unwrap().strategies.is_empty());
    }

    #[tokio::test]
    async fn test_reset_preserves_discovery() {
        let store = ClusterStore::embedded().unwrap();
        let resource = ResourceKey::new("i", "c");
        let f = filter(&resource);

        store.register_node(&node(7000)).await.unwrap();
        store
            .subscription_add(&resource, "node-a", "room-1", "conn-1", Some(&f))
            .await
            .unwrap();
        store.set_auto_refresh("i", true).await.unwrap();

        let deleted = store.reset_all().await.unwrap();
        assert!(deleted > 0);

        assert_eq!(store.discover().await.unwrap().len(), 1);
        assert!(store.collections().await.unwrap().is_empty());
        let state = store.fetch_state(&resource).await.unwrap();
        assert_eq!(state.version, 1);
        assert!(state.rooms.is_empty());
        assert_eq!(store.fetch_wildcard().await.unwrap().version, 0);
    }
}
