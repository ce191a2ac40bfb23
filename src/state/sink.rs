use crate::cluster::Notification;
use crate::store::{FilterDescriptor, ResourceKey};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Mutex;

/// Mutators of the local application state the cluster keeps in sync.
///
/// The real-time engine, the index cache, the security repositories and
/// the plugin manager of the host application sit behind this trait.
pub trait StateSink: Send + Sync {
    /// Rooms known locally for `resource`, filter or count.
    fn room_ids(&self, resource: &ResourceKey) -> Vec<String>;
    fn has_filter(&self, room_id: &str) -> bool;
    fn store_filter(&self, room_id: &str, filter: &FilterDescriptor);
    fn set_room_count(&self, resource: &ResourceKey, room_id: &str, count: i64);
    /// Drop the room, its count and its filter.
    fn remove_room(&self, room_id: &str);

    fn add_index_cache(&self, index: &str, collection: &str);
    fn remove_index_cache(&self, index: &str, collection: &str);
    fn reset_index_cache(&self);
    fn invalidate_profile(&self, id: &str);
    fn invalidate_role(&self, id: &str);

    fn set_auto_refresh(&self, index: &str, value: bool);
    fn has_strategy(&self, name: &str) -> bool;
    fn register_strategy(&self, plugin: &str, name: &str, strategy: &Value);
    fn unregister_strategy(&self, plugin: &str, name: &str);
    fn refresh_validators(&self);

    /// Deliver a notification relayed by another node to local subscribers.
    fn dispatch_notification(&self, notification: &Notification);
}

#[derive(Debug, Clone, PartialEq)]
struct Room {
    resource: ResourceKey,
    count: i64,
}

#[derive(Debug, Default)]
struct MemoryState {
    rooms: HashMap<String, Room>,
    filters: HashMap<String, FilterDescriptor>,
    index_cache: BTreeSet<(String, String)>,
    invalidated_profiles: Vec<String>,
    invalidated_roles: Vec<String>,
    auto_refresh: BTreeMap<String, bool>,
    strategies: BTreeMap<String, (String, Value)>,
    validator_refreshes: usize,
    notifications: Vec<Notification>,
}

/// In-memory [`StateSink`], used by the standalone binary and in tests.
#[derive(Debug, Default)]
pub struct MemoryStateSink {
    state: Mutex<MemoryState>,
}

impl MemoryStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryState) -> R) -> R {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut state)
    }

    /// Subscriber count of a room, `None` if the room is unknown.
    pub fn room_count(&self, room_id: &str) -> Option<i64> {
        self.with(|s| s.rooms.get(room_id).map(|r| r.count))
    }

    pub fn filter(&self, room_id: &str) -> Option<FilterDescriptor> {
        self.with(|s| s.filters.get(room_id).cloned())
    }

    pub fn index_cache(&self) -> BTreeSet<(String, String)> {
        self.with(|s| s.index_cache.clone())
    }

    pub fn invalidated_profiles(&self) -> Vec<String> {
        self.with(|s| s.invalidated_profiles.clone())
    }

    pub fn invalidated_roles(&self) -> Vec<String> {
        self.with(|s| s.invalidated_roles.clone())
    }

    pub fn auto_refresh(&self) -> BTreeMap<String, bool> {
        self.with(|s| s.auto_refresh.clone())
    }

    /// Registered strategies, name to owning plugin.
    pub fn strategies(&self) -> BTreeMap<String, String> {
        self.with(|s| {
            s.strategies
                .iter()
                .map(|(name, (plugin, _))| (name.clone(), plugin.clone()))
                .collect()
        })
    }

    pub fn validator_refreshes(&self) -> usize {
        self.with(|s| s.validator_refreshes)
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.with(|s| s.notifications.clone())
    }
}

impl StateSink for MemoryStateSink {
    fn room_ids(&self, resource: &ResourceKey) -> Vec<String> {
        self.with(|s| {
            let mut ids: BTreeSet<String> = s
                .rooms
                .iter()
                .filter(|(_, room)| &room.resource == resource)
                .map(|(id, _)| id.clone())
                .collect();
            ids.extend(
                s.filters
                    .iter()
                    .filter(|(_, f)| f.index == resource.index && f.collection == resource.collection)
                    .map(|(id, _)| id.clone()),
            );
            ids.into_iter().collect()
        })
    }

    fn has_filter(&self, room_id: &str) -> bool {
        self.with(|s| s.filters.contains_key(room_id))
    }

    fn store_filter(&self, room_id: &str, filter: &FilterDescriptor) {
        self.with(|s| {
            s.filters.insert(room_id.to_string(), filter.clone());
        })
    }

    fn set_room_count(&self, resource: &ResourceKey, room_id: &str, count: i64) {
        self.with(|s| {
            s.rooms.insert(
                room_id.to_string(),
                Room {
                    resource: resource.clone(),
                    count,
                },
            );
        })
    }

    fn remove_room(&self, room_id: &str) {
        self.with(|s| {
            s.rooms.remove(room_id);
            s.filters.remove(room_id);
        })
    }

    fn add_index_cache(&self, index: &str, collection: &str) {
        self.with(|s| {
            s.index_cache
                .insert((index.to_string(), collection.to_string()));
        })
    }

    fn remove_index_cache(&self, index: &str, collection: &str) {
        self.with(|s| {
            s.index_cache
                .remove(&(index.to_string(), collection.to_string()));
        })
    }

    fn reset_index_cache(&self) {
        self.with(|s| s.index_cache.clear())
    }

    fn invalidate_profile(&self, id: &str) {
        self.with(|s| s.invalidated_profiles.push(id.to_string()))
    }

    fn invalidate_role(&self, id: &str) {
        self.with(|s| s.invalidated_roles.push(id.to_string()))
    }

    fn set_auto_refresh(&self, index: &str, value: bool) {
        self.with(|s| {
            if value {
                s.auto_refresh.insert(index.to_string(), true);
            } else {
                s.auto_refresh.remove(index);
            }
        })
    }

    fn has_strategy(&self, name: &str) -> bool {
        self.with(|s| s.strategies.contains_key(name))
    }

    fn register_strategy(&self, plugin: &str, name: &str, strategy: &Value) {
        self.with(|s| {
            s.strategies
                .insert(name.to_string(), (plugin.to_string(), strategy.clone()));
        })
    }

    fn unregister_strategy(&self, _plugin: &str, name: &str) {
        self.with(|s| {
            s.strategies.remove(name);
        })
    }

    fn refresh_validators(&self) {
        self.with(|s| s.validator_refreshes += 1)
    }

    fn dispatch_notification(&self, notification: &Notification) {
        self.with(|s| s.notifications.push(notification.clone()))
    }
}
