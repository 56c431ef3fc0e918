//! cao store: the shared, watch-fed mirror of cluster objects.
//!
//! One [`SharedStateCache`] serves every controller. Watch events are applied
//! per kind in arrival order and gated on resource version, so a stale event
//! never overwrites newer state. Each applied change is fanned out to the
//! subscriptions registered for that kind through bounded channels.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use cao_core::{Backoff, CachedObject, ObjectKey, Reason, ResourceKind};
use cao_kubehub::{ClientError, ClusterClient};
use cao_schema::{KindCodec, TypeRegistry};
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

mod watcher;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("not found: {0}")]
    NotFound(ObjectKey),
    #[error("kind not registered: {0}")]
    UnknownKind(ResourceKind),
    #[error("kind not watched: {0}")]
    NotWatching(ResourceKind),
    #[error("watch already started: {0}")]
    AlreadyWatching(ResourceKind),
    #[error("watch for {kind} failed permanently: {source}")]
    Fatal { kind: ResourceKind, source: ClientError },
    #[error("cache shut down before {0} synced")]
    Closed(ResourceKind),
}

/// A change applied to the cache, as delivered to subscribers.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub key: ObjectKey,
    pub reason: Reason,
    /// State after the change; for deletions, the last known state.
    pub object: Arc<CachedObject>,
}

pub type Filter = Arc<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

/// Accept every event.
pub fn accept_all() -> Filter {
    Arc::new(|_| true)
}

struct Subscriber {
    kind: ResourceKind,
    filter: Filter,
    tx: mpsc::Sender<ChangeEvent>,
}

/// Single-consumer stream of change notifications for one kind.
pub struct Subscription {
    kind: ResourceKind,
    rx: mpsc::Receiver<ChangeEvent>,
}

impl Subscription {
    pub fn kind(&self) -> &ResourceKind { &self.kind }

    /// Next notification; `None` once the cache has been dropped.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Restrict namespaced kinds to one namespace; `None` watches all.
    pub namespace: Option<String>,
    /// Capacity of each subscription channel.
    pub channel_capacity: usize,
    /// Periodic full relist; `None` disables it.
    pub resync_period: Option<Duration>,
    /// Delay policy between failed list/watch attempts.
    pub watch_backoff: Backoff,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            channel_capacity: 1024,
            resync_period: None,
            watch_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(30), 0.1),
        }
    }
}

/// Watch-fed cache of every watched kind, shared read-only by controllers.
pub struct SharedStateCache {
    registry: Arc<TypeRegistry>,
    client: Arc<dyn ClusterClient>,
    opts: CacheOptions,
    objects: RwLock<FxHashMap<ObjectKey, Arc<CachedObject>>>,
    subscribers: Mutex<Vec<Subscriber>>,
    synced: Mutex<FxHashMap<ResourceKind, watch::Sender<bool>>>,
}

impl SharedStateCache {
    pub fn new(registry: Arc<TypeRegistry>, client: Arc<dyn ClusterClient>, opts: CacheOptions) -> Arc<Self> {
        Arc::new(Self {
            registry,
            client,
            opts,
            objects: RwLock::new(FxHashMap::default()),
            subscribers: Mutex::new(Vec::new()),
            synced: Mutex::new(FxHashMap::default()),
        })
    }

    pub fn registry(&self) -> &Arc<TypeRegistry> { &self.registry }

    pub fn client(&self) -> &Arc<dyn ClusterClient> { &self.client }

    pub fn options(&self) -> &CacheOptions { &self.opts }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<ObjectKey, Arc<CachedObject>>> {
        self.objects.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<ObjectKey, Arc<CachedObject>>> {
        self.objects.write().unwrap_or_else(|p| p.into_inner())
    }

    fn subs(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn synced_map(&self) -> MutexGuard<'_, FxHashMap<ResourceKind, watch::Sender<bool>>> {
        self.synced.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, key: &ObjectKey) -> Result<Arc<CachedObject>, CacheError> {
        self.read().get(key).cloned().ok_or_else(|| CacheError::NotFound(key.clone()))
    }

    /// All cached objects of a kind, in key order.
    pub fn list(&self, kind: &ResourceKind) -> Vec<Arc<CachedObject>> {
        let mut out: Vec<_> = self.read().values().filter(|o| &o.key.kind == kind).cloned().collect();
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    pub fn len(&self) -> usize { self.read().len() }

    pub fn is_empty(&self) -> bool { self.read().is_empty() }

    /// Subscribe to changes of `kind` that pass `filter`. Events of other kinds
    /// are never delivered to this subscription.
    pub fn subscribe(&self, kind: &ResourceKind, filter: Filter) -> Result<Subscription, CacheError> {
        if !self.registry.contains(kind) {
            return Err(CacheError::UnknownKind(kind.clone()));
        }
        let (tx, rx) = mpsc::channel(self.opts.channel_capacity.max(1));
        self.subs().push(Subscriber { kind: kind.clone(), filter, tx });
        debug!(kind = %kind, "subscription registered");
        Ok(Subscription { kind: kind.clone(), rx })
    }

    /// Resolves once the initial list of every kind in `kinds` has been applied.
    pub async fn wait_for_sync(&self, kinds: &[ResourceKind]) -> Result<(), CacheError> {
        for kind in kinds {
            let mut rx = self
                .synced_map()
                .get(kind)
                .map(|tx| tx.subscribe())
                .ok_or_else(|| CacheError::NotWatching(kind.clone()))?;
            while !*rx.borrow_and_update() {
                rx.changed().await.map_err(|_| CacheError::Closed(kind.clone()))?;
            }
        }
        Ok(())
    }

    pub fn has_synced(&self, kind: &ResourceKind) -> bool {
        self.synced_map().get(kind).map(|tx| *tx.borrow()).unwrap_or(false)
    }

    fn in_scope(&self, codec: &KindCodec, key: &ObjectKey) -> bool {
        match (&self.opts.namespace, codec.namespaced()) {
            (Some(ns), true) => key.namespace.as_deref() == Some(ns.as_str()),
            _ => true,
        }
    }

    /// Insert or update one object. Stale or duplicate versions are rejected.
    pub(crate) fn apply_upsert(&self, obj: CachedObject) -> Option<ChangeEvent> {
        let mut objects = self.write();
        let reason = match objects.get(&obj.key) {
            None => Reason::Created,
            Some(old) if obj.supersedes(old) => Reason::Updated,
            Some(old) => {
                metrics::counter!("cao_cache_stale_rejected_total", 1u64, "kind" => obj.key.kind.gvk_key());
                debug!(key = %obj.key, cached_rv = old.resource_version, event_rv = obj.resource_version, "rejected stale update");
                return None;
            }
        };
        let obj = Arc::new(obj);
        objects.insert(obj.key.clone(), Arc::clone(&obj));
        Some(ChangeEvent { key: obj.key.clone(), reason, object: obj })
    }

    /// Remove one object unless the cached state is newer than the deletion.
    pub(crate) fn apply_delete(&self, obj: CachedObject) -> Option<ChangeEvent> {
        let mut objects = self.write();
        let newer_cached = match objects.get(&obj.key) {
            None => return None,
            Some(old) => old.resource_version != 0 && obj.resource_version != 0 && old.resource_version > obj.resource_version,
        };
        if newer_cached {
            metrics::counter!("cao_cache_stale_rejected_total", 1u64, "kind" => obj.key.kind.gvk_key());
            debug!(key = %obj.key, "rejected stale delete");
            return None;
        }
        objects.remove(&obj.key);
        Some(ChangeEvent { key: obj.key.clone(), reason: Reason::Deleted, object: Arc::new(obj) })
    }

    /// Replace the cached view of one kind with a fresh list. Objects missing
    /// from the list are deleted; unchanged ones are reported as resynced only
    /// when `report_unchanged` is set.
    pub(crate) fn apply_list(&self, codec: &KindCodec, items: Vec<CachedObject>, report_unchanged: bool) -> Vec<ChangeEvent> {
        let mut objects = self.write();
        let mut seen: FxHashSet<ObjectKey> = FxHashSet::default();
        let mut events = Vec::with_capacity(items.len());
        for obj in items {
            seen.insert(obj.key.clone());
            let reason = match objects.get(&obj.key) {
                None => Reason::Created,
                Some(old) if obj.supersedes(old) => Reason::Updated,
                Some(old) if old.resource_version == obj.resource_version => {
                    if report_unchanged {
                        events.push(ChangeEvent { key: obj.key.clone(), reason: Reason::Resynced, object: Arc::clone(old) });
                    }
                    continue;
                }
                Some(_) => continue,
            };
            let obj = Arc::new(obj);
            objects.insert(obj.key.clone(), Arc::clone(&obj));
            events.push(ChangeEvent { key: obj.key.clone(), reason, object: obj });
        }
        let gone: Vec<ObjectKey> = objects
            .keys()
            .filter(|k| &k.kind == codec.kind() && !seen.contains(*k) && self.in_scope(codec, k))
            .cloned()
            .collect();
        for key in gone {
            if let Some(old) = objects.remove(&key) {
                events.push(ChangeEvent { key, reason: Reason::Deleted, object: old });
            }
        }
        let count = objects.keys().filter(|k| &k.kind == codec.kind()).count();
        metrics::gauge!("cao_cache_objects", count as f64, "kind" => codec.kind().gvk_key());
        events
    }

    /// Deliver events to matching subscribers, in order. Waiting on a full
    /// channel is the back-pressure on the watch.
    pub(crate) async fn publish(&self, events: Vec<ChangeEvent>) {
        for ev in events {
            let targets: Vec<mpsc::Sender<ChangeEvent>> = self
                .subs()
                .iter()
                .filter(|s| s.kind == ev.key.kind && (s.filter)(&ev))
                .map(|s| s.tx.clone())
                .collect();
            let mut closed = false;
            for tx in targets {
                if tx.send(ev.clone()).await.is_err() {
                    closed = true;
                }
            }
            if closed {
                let mut subs = self.subs();
                let before = subs.len();
                subs.retain(|s| !s.tx.is_closed());
                warn!(dropped = before - subs.len(), kind = %ev.key.kind, "removed closed subscriptions");
            }
        }
    }

    fn mark_synced(&self, kind: &ResourceKind) {
        if let Some(tx) = self.synced_map().get(kind) {
            tx.send_replace(true);
        }
    }
}

pub use watcher::WatchHandle;

#[cfg(test)]
mod tests {
    use super::*;
    use cao_kubehub::MemoryCluster;
    use cao_schema::RegistryBuilder;

    fn setup() -> (Arc<SharedStateCache>, Arc<KindCodec>) {
        let mut b = RegistryBuilder::new();
        let codec = b
            .register(KindCodec::new(ResourceKind::new("apps", "v1", "Deployment"), "deployments", true))
            .expect("register");
        let cache = SharedStateCache::new(b.build(), Arc::new(MemoryCluster::new()), CacheOptions::default());
        (cache, codec)
    }

    fn obj(codec: &KindCodec, name: &str, rv: u64) -> CachedObject {
        codec
            .decode(serde_json::json!({"metadata": {"name": name, "namespace": "ns", "resourceVersion": rv.to_string()}}))
            .expect("decode")
    }

    #[test]
    fn upsert_rejects_stale_and_duplicate_versions() {
        let (cache, codec) = setup();
        assert_eq!(cache.apply_upsert(obj(&codec, "a", 5)).map(|e| e.reason), Some(Reason::Created));
        assert!(cache.apply_upsert(obj(&codec, "a", 4)).is_none());
        assert!(cache.apply_upsert(obj(&codec, "a", 5)).is_none());
        assert_eq!(cache.apply_upsert(obj(&codec, "a", 6)).map(|e| e.reason), Some(Reason::Updated));
        assert_eq!(cache.get(&codec.key(Some("ns"), "a")).expect("cached").resource_version, 6);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn delete_older_than_cache_is_ignored() {
        let (cache, codec) = setup();
        cache.apply_upsert(obj(&codec, "a", 7));
        assert!(cache.apply_delete(obj(&codec, "a", 6)).is_none());
        assert!(cache.get(&codec.key(Some("ns"), "a")).is_ok());
        assert_eq!(cache.apply_delete(obj(&codec, "a", 8)).map(|e| e.reason), Some(Reason::Deleted));
        assert!(matches!(cache.get(&codec.key(Some("ns"), "a")), Err(CacheError::NotFound(_))));
        assert!(cache.apply_delete(obj(&codec, "a", 9)).is_none());
    }

    #[test]
    fn list_replaces_kind_view() {
        let (cache, codec) = setup();
        cache.apply_upsert(obj(&codec, "kept", 1));
        cache.apply_upsert(obj(&codec, "gone", 2));
        cache.apply_upsert(obj(&codec, "bumped", 3));
        let events = cache.apply_list(&codec, vec![obj(&codec, "kept", 1), obj(&codec, "bumped", 9), obj(&codec, "new", 10)], true);
        let mut summary: Vec<(String, Reason)> = events.iter().map(|e| (e.key.name.clone(), e.reason)).collect();
        summary.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            summary,
            vec![
                ("bumped".to_string(), Reason::Updated),
                ("gone".to_string(), Reason::Deleted),
                ("kept".to_string(), Reason::Resynced),
                ("new".to_string(), Reason::Created),
            ]
        );
        let names: Vec<_> = cache.list(codec.kind()).iter().map(|o| o.key.name.clone()).collect();
        assert_eq!(names, vec!["bumped", "kept", "new"]);
    }

    #[test]
    fn reconnect_relist_stays_quiet_for_unchanged_objects() {
        let (cache, codec) = setup();
        cache.apply_upsert(obj(&codec, "kept", 1));
        assert!(cache.apply_list(&codec, vec![obj(&codec, "kept", 1)], false).is_empty());
    }

    #[test]
    fn subscribe_to_unregistered_kind_fails() {
        let (cache, _) = setup();
        let kind = ResourceKind::new("", "v1", "Pod");
        assert!(matches!(cache.subscribe(&kind, accept_all()), Err(CacheError::UnknownKind(_))));
    }

    #[tokio::test]
    async fn wait_for_sync_requires_a_watch() {
        let (cache, codec) = setup();
        assert!(matches!(cache.wait_for_sync(&[codec.kind().clone()]).await, Err(CacheError::NotWatching(_))));
    }
}
