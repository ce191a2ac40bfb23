//! Versioned state reconciliation.
//!
//! Every resource has a version counter in the store, bumped by each
//! subscription write. A node caches the last version it applied and, when
//! told a resource changed, pulls the whole resource snapshot and applies
//! it as a set difference against its local rooms. Two lock sets protect
//! rooms in the middle of a local creation or deletion from a concurrent
//! pass.

mod sink;

pub use self::sink::{MemoryStateSink, StateSink};

use crate::error::{ClusterError, Result};
use crate::store::{ClusterStore, ResourceKey};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, trace};

/// Version assumed for a resource never pulled.
const DEFAULT_VERSION: i64 = 0;
/// Wildcard bootstrap: the first stored wildcard version (0 or more) must
/// always be applied.
const WILDCARD_BOOTSTRAP_VERSION: i64 = -1;

#[derive(Debug, Default)]
struct PendingRooms {
    create: HashSet<String>,
    delete: HashSet<String>,
}

/// Local side of the replicated state.
pub struct StateManager {
    store: Arc<ClusterStore>,
    sink: Arc<dyn StateSink>,
    versions: Mutex<HashMap<ResourceKey, i64>>,
    /// One apply lock per resource: version check and apply never
    /// interleave for the same key.
    apply_locks: Mutex<HashMap<ResourceKey, Arc<tokio::sync::Mutex<()>>>>,
    pending: Mutex<PendingRooms>,
}

impl StateManager {
    pub fn new(store: Arc<ClusterStore>, sink: Arc<dyn StateSink>) -> Self {
        Self {
            store,
            sink,
            versions: Mutex::new(HashMap::new()),
            apply_locks: Mutex::new(HashMap::new()),
            pending: Mutex::new(PendingRooms::default()),
        }
    }

    pub fn store(&self) -> &Arc<ClusterStore> {
        &self.store
    }

    pub fn sink(&self) -> &Arc<dyn StateSink> {
        &self.sink
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|e| ClusterError::Store(format!("Lock error: {}", e)))
    }

    /// Last version applied for `resource`.
    pub fn version(&self, resource: &ResourceKey) -> Result<i64> {
        let versions = Self::lock(&self.versions)?;
        Ok(match versions.get(resource) {
            Some(v) => *v,
            None if resource.is_wildcard() => WILDCARD_BOOTSTRAP_VERSION,
            None => DEFAULT_VERSION,
        })
    }

    pub fn set_version(&self, resource: &ResourceKey, version: i64) -> Result<()> {
        Self::lock(&self.versions)?.insert(resource.clone(), version);
        Ok(())
    }

    /// Put every cached version back to its bootstrap value. The keys are
    /// kept so the next `sync_all` still visits those resources.
    pub fn reset_versions(&self) -> Result<()> {
        for (resource, version) in Self::lock(&self.versions)?.iter_mut() {
            *version = if resource.is_wildcard() {
                WILDCARD_BOOTSTRAP_VERSION
            } else {
                DEFAULT_VERSION
            };
        }
        Ok(())
    }

    pub fn lock_create(&self, room_id: &str) -> Result<()> {
        Self::lock(&self.pending)?.create.insert(room_id.to_string());
        Ok(())
    }

    pub fn unlock_create(&self, room_id: &str) -> Result<()> {
        Self::lock(&self.pending)?.create.remove(room_id);
        Ok(())
    }

    pub fn lock_delete(&self, room_id: &str) -> Result<()> {
        Self::lock(&self.pending)?.delete.insert(room_id.to_string());
        Ok(())
    }

    pub fn unlock_delete(&self, room_id: &str) -> Result<()> {
        Self::lock(&self.pending)?.delete.remove(room_id);
        Ok(())
    }

    pub fn is_create_locked(&self, room_id: &str) -> Result<bool> {
        Ok(Self::lock(&self.pending)?.create.contains(room_id))
    }

    pub fn is_delete_locked(&self, room_id: &str) -> Result<bool> {
        Ok(Self::lock(&self.pending)?.delete.contains(room_id))
    }

    fn apply_lock(&self, resource: &ResourceKey) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = Self::lock(&self.apply_locks)?;
        Ok(Arc::clone(locks.entry(resource.clone()).or_default()))
    }

    /// Pull `resource` from the store and apply it locally.
    ///
    /// Returns false when the pulled snapshot was stale. `forced` applies
    /// the snapshot whatever its version (used after a reset).
    pub async fn sync(&self, resource: &ResourceKey, forced: bool) -> Result<bool> {
        if resource.is_wildcard() {
            return self.sync_wildcard(forced).await;
        }

        let apply_lock = self.apply_lock(resource)?;
        let _guard = apply_lock.lock().await;

        let state = self.store.fetch_state(resource).await?;
        let cached = self.version(resource)?;
        if !forced && state.version != 1 && state.version <= cached {
            debug!(%resource, version = state.version, cached, "No new state version, skipping");
            return Ok(false);
        }
        trace!(%resource, version = state.version, cached, forced, "Applying state");
        self.set_version(resource, state.version.max(cached))?;

        let mut current: BTreeSet<String> = self.sink.room_ids(resource).into_iter().collect();
        for room in &state.rooms {
            current.remove(&room.id);

            if self.is_delete_locked(&room.id)? {
                debug!(room = %room.id, "Room being deleted, skipping update");
                continue;
            }
            self.sink.set_room_count(resource, &room.id, room.count);
            if let Some(filter) = &room.filter {
                if !self.sink.has_filter(&room.id) {
                    debug!(%resource, room = %room.id, "Registering filter");
                    self.sink.store_filter(&room.id, filter);
                }
            }
        }

        for room_id in current {
            if self.is_create_locked(&room_id)? {
                debug!(room = %room_id, "Room being created, skipping delete");
            } else {
                debug!(%resource, room = %room_id, "Deleting room");
                self.sink.remove_room(&room_id);
            }
        }

        Ok(true)
    }

    /// Reconcile cluster-wide settings: auto-refresh flags and registered
    /// authentication strategies.
    pub async fn sync_wildcard(&self, forced: bool) -> Result<bool> {
        let wildcard = ResourceKey::wildcard();
        let apply_lock = self.apply_lock(&wildcard)?;
        let _guard = apply_lock.lock().await;

        let state = self.store.fetch_wildcard().await?;
        let cached = self.version(&wildcard)?;
        if !forced && state.version <= cached {
            debug!(version = state.version, cached, "No new settings version, skipping");
            return Ok(false);
        }
        self.set_version(&wildcard, state.version.max(cached))?;

        for (index, value) in &state.auto_refresh {
            self.sink.set_auto_refresh(index, *value);
        }
        for (name, record) in &state.strategies {
            if !self.sink.has_strategy(name) {
                debug!(strategy = %name, plugin = %record.plugin, "Registering strategy");
                self.sink
                    .register_strategy(&record.plugin, name, &record.strategy);
            }
        }

        Ok(true)
    }

    /// Sync every resource the store knows about, plus the ones cached
    /// locally, then the cluster-wide settings.
    pub async fn sync_all(&self, forced: bool) -> Result<()> {
        let mut resources: BTreeSet<ResourceKey> =
            self.store.collections().await?.into_iter().collect();
        {
            let versions = Self::lock(&self.versions)?;
            resources.extend(versions.keys().filter(|k| !k.is_wildcard()).cloned());
        }

        let syncs = resources.iter().map(|resource| self.sync(resource, forced));
        for result in futures::future::join_all(syncs).await {
            result?;
        }

        self.sync_wildcard(forced).await?;
        Ok(())
    }

    /// Wipe the cluster keys from the store and restart version tracking.
    pub async fn reset(&self) -> Result<()> {
        let deleted = self.store.reset_all().await?;
        self.reset_versions()?;
        info!(deleted, "Cluster state reset");
        Ok(())
    }
}
