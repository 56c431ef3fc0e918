use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use futures::StreamExt;
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tracing::debug;

use cao_core::{ObjectKey, ResourceKind};
use cao_schema::KindCodec;

use crate::{meta_str, ClientError, ClusterClient, ObjectList, WatchEvent, WatchStream};

/// Cluster API operations, used to script failures and inspect writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    List,
    Watch,
    Get,
    Create,
    Replace,
    Delete,
}

struct Watcher {
    kind: ResourceKind,
    namespace: Option<String>,
    tx: mpsc::UnboundedSender<Result<WatchEvent, ClientError>>,
}

impl Watcher {
    fn wants(&self, key: &ObjectKey) -> bool {
        key.kind == self.kind && (self.namespace.is_none() || self.namespace == key.namespace)
    }
}

#[derive(Default)]
struct State {
    rv: u64,
    uid_seq: u64,
    objects: BTreeMap<ObjectKey, serde_json::Value>,
    /// Event log replayed to watches resuming from an older version.
    history: Vec<(u64, ObjectKey, WatchEvent)>,
    compacted_rv: u64,
    watchers: Vec<Watcher>,
    failures: FxHashMap<Op, VecDeque<ClientError>>,
    calls: FxHashMap<Op, usize>,
    writes: Vec<(Op, ObjectKey)>,
}

impl State {
    fn take_failure(&mut self, op: Op) -> Result<(), ClientError> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn next_rv(&mut self) -> u64 {
        self.rv += 1;
        self.rv
    }

    fn publish(&mut self, rv: u64, key: ObjectKey, ev: WatchEvent) {
        self.watchers.retain(|w| !w.wants(&key) || w.tx.send(Ok(ev.clone())).is_ok());
        self.history.push((rv, key, ev));
    }

    /// Store `obj` under a fresh resource version and notify watchers.
    fn store(&mut self, key: ObjectKey, mut obj: serde_json::Value) -> serde_json::Value {
        let rv = self.next_rv();
        let existed = self.objects.contains_key(&key);
        let meta = obj
            .as_object_mut()
            .map(|m| m.entry("metadata").or_insert_with(|| serde_json::json!({})));
        if let Some(meta) = meta.and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), serde_json::Value::String(rv.to_string()));
            if !meta.contains_key("uid") {
                self.uid_seq += 1;
                meta.insert("uid".into(), serde_json::Value::String(format!("uid-{}", self.uid_seq)));
            }
        }
        self.objects.insert(key.clone(), obj.clone());
        let ev = if existed { WatchEvent::Modified(obj.clone()) } else { WatchEvent::Added(obj.clone()) };
        self.publish(rv, key, ev);
        obj
    }

    fn remove(&mut self, key: &ObjectKey) -> Option<serde_json::Value> {
        let mut obj = self.objects.remove(key)?;
        let rv = self.next_rv();
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), serde_json::Value::String(rv.to_string()));
        }
        self.publish(rv, key.clone(), WatchEvent::Deleted(obj.clone()));
        Some(obj)
    }
}

/// In-process cluster with real resource-version semantics: optimistic
/// concurrency on replace, watch resumption from a version, compaction (410),
/// plus hooks to inject failures and drop watch connections.
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn key_of(codec: &KindCodec, obj: &serde_json::Value) -> Result<ObjectKey, ClientError> {
        let name = meta_str(obj, "name").ok_or_else(|| ClientError::Decode("object missing metadata.name".into()))?;
        Ok(codec.key(meta_str(obj, "namespace"), name))
    }

    /// Create or overwrite an object as an external actor would, bypassing conflict checks.
    pub fn apply(&self, codec: &KindCodec, obj: serde_json::Value) -> serde_json::Value {
        let name = meta_str(&obj, "name").unwrap_or_default().to_string();
        let key = codec.key(meta_str(&obj, "namespace"), &name);
        self.lock().store(key, obj)
    }

    /// Delete an object as an external actor would.
    pub fn remove(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Option<serde_json::Value> {
        self.lock().remove(&codec.key(namespace, name))
    }

    /// Delete an object without telling any watcher, simulating a missed event.
    pub fn remove_silently(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) {
        let mut st = self.lock();
        st.objects.remove(&codec.key(namespace, name));
        st.rv += 1;
    }

    pub fn object(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Option<serde_json::Value> {
        self.lock().objects.get(&codec.key(namespace, name)).cloned()
    }

    /// Close every open watch stream, as an apiserver restart would.
    pub fn disconnect_watches(&self) {
        let mut st = self.lock();
        debug!(count = st.watchers.len(), "disconnecting watches");
        st.watchers.clear();
    }

    /// Forget history up to now; watches resuming from older versions get `Gone`.
    pub fn compact(&self) {
        let mut st = self.lock();
        st.compacted_rv = st.rv;
        st.history.clear();
    }

    /// Make the next call of `op` fail with `err`. Queued failures are consumed in order.
    pub fn fail_next(&self, op: Op, err: ClientError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    pub fn calls(&self, op: Op) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Successful writes made through the [`ClusterClient`] surface.
    pub fn writes(&self) -> Vec<(Op, ObjectKey)> {
        self.lock().writes.clone()
    }

    pub fn open_watches(&self) -> usize {
        let mut st = self.lock();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.len()
    }
}

#[async_trait::async_trait]
impl ClusterClient for MemoryCluster {
    async fn list(&self, codec: &KindCodec, namespace: Option<&str>) -> Result<ObjectList, ClientError> {
        let mut st = self.lock();
        st.take_failure(Op::List)?;
        let items = st
            .objects
            .iter()
            .filter(|(k, _)| &k.kind == codec.kind())
            .filter(|(k, _)| !codec.namespaced() || namespace.is_none() || k.namespace.as_deref() == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        Ok(ObjectList { resource_version: st.rv.to_string(), items })
    }

    async fn watch(&self, codec: &KindCodec, namespace: Option<&str>, resource_version: &str) -> Result<WatchStream, ClientError> {
        let mut st = self.lock();
        st.take_failure(Op::Watch)?;
        let from: u64 = resource_version.parse().unwrap_or(0);
        let (tx, rx) = mpsc::unbounded_channel();
        if from < st.compacted_rv {
            let _ = tx.send(Err(ClientError::Gone(format!("too old resource version: {}", from))));
        } else {
            let watcher = Watcher {
                kind: codec.kind().clone(),
                namespace: if codec.namespaced() { namespace.map(|s| s.to_string()) } else { None },
                tx,
            };
            for (rv, key, ev) in st.history.iter() {
                if *rv > from && watcher.wants(key) {
                    let _ = watcher.tx.send(Ok(ev.clone()));
                }
            }
            st.watchers.push(watcher);
        }
        let events = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        Ok(events.boxed())
    }

    async fn get(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<serde_json::Value, ClientError> {
        let mut st = self.lock();
        st.take_failure(Op::Get)?;
        let key = codec.key(namespace, name);
        st.objects.get(&key).cloned().ok_or_else(|| ClientError::NotFound(key.to_string()))
    }

    async fn create(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let key = Self::key_of(codec, obj)?;
        let mut st = self.lock();
        st.take_failure(Op::Create)?;
        if st.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(key.to_string()));
        }
        let stored = st.store(key.clone(), obj.clone());
        st.writes.push((Op::Create, key));
        Ok(stored)
    }

    async fn replace(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError> {
        let key = Self::key_of(codec, obj)?;
        let mut st = self.lock();
        st.take_failure(Op::Replace)?;
        let current = st.objects.get(&key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        let current_rv = meta_str(current, "resourceVersion").unwrap_or_default();
        let given_rv = meta_str(obj, "resourceVersion").unwrap_or_default();
        if current_rv != given_rv {
            return Err(ClientError::Conflict(format!("{}: resourceVersion {} is stale (current {})", key, given_rv, current_rv)));
        }
        let stored = st.store(key.clone(), obj.clone());
        st.writes.push((Op::Replace, key));
        Ok(stored)
    }

    async fn delete(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        let mut st = self.lock();
        st.take_failure(Op::Delete)?;
        let key = codec.key(namespace, name);
        st.remove(&key).ok_or_else(|| ClientError::NotFound(key.to_string()))?;
        st.writes.push((Op::Delete, key));
        Ok(())
    }
}
