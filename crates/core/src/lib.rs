//! cao core types: resource kinds, object keys, cached objects and work items.

#![forbid(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

mod backoff;

pub use backoff::Backoff;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid gvk key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidGvkKey(String),
    #[error("object missing metadata.{0}")]
    MissingField(&'static str),
}

/// Group/version/kind triple identifying a resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKind {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl ResourceKind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    /// Parse "v1/Kind" or "group/v1/Kind".
    pub fn parse(key: &str) -> Result<Self, CoreError> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new("", version, kind)),
            [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(Self::new(group, version, kind)),
            _ => Err(CoreError::InvalidGvkKey(key.to_string())),
        }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    /// The `apiVersion` string objects of this kind carry.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.gvk_key())
    }
}

/// Addressable identity of one live object: kind plus namespace/name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: &str) -> Self {
        Self { kind, namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }

    /// Extract the key of a raw object of the given kind.
    pub fn from_raw(kind: &ResourceKind, raw: &serde_json::Value) -> Result<Self, CoreError> {
        let meta = raw.get("metadata").ok_or(CoreError::MissingField("name"))?;
        let name = meta.get("name").and_then(|v| v.as_str()).ok_or(CoreError::MissingField("name"))?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty());
        Ok(Self::new(kind.clone(), namespace, name))
    }

    /// "namespace/name", or just "name" for cluster-scoped objects.
    pub fn ns_name(&self) -> String {
        match &self.namespace {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.ns_name())
    }
}

/// Parse a resource version. Kubernetes treats these as opaque, but every
/// apiserver in practice hands out etcd revisions, which are integers.
pub fn parse_resource_version(rv: &str) -> Option<u64> {
    rv.parse::<u64>().ok()
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Last observed state of one object, as held by the shared cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedObject {
    pub key: ObjectKey,
    /// 0 when the apiserver handed out a non-numeric version.
    pub resource_version: u64,
    pub raw: serde_json::Value,
}

impl CachedObject {
    pub fn from_raw(kind: &ResourceKind, mut raw: serde_json::Value) -> Result<Self, CoreError> {
        let key = ObjectKey::from_raw(kind, &raw)?;
        let resource_version = raw
            .get("metadata")
            .and_then(|m| m.get("resourceVersion"))
            .and_then(|v| v.as_str())
            .and_then(parse_resource_version)
            .unwrap_or(0);
        if cfg!(feature = "strip-managed-fields") {
            strip_managed_fields(&mut raw);
        }
        Ok(Self { key, resource_version, raw })
    }

    /// Whether this state should replace `existing`. Unordered versions always win.
    pub fn supersedes(&self, existing: &CachedObject) -> bool {
        match (self.resource_version, existing.resource_version) {
            (0, _) | (_, 0) => true,
            (new, old) => new > old,
        }
    }

    pub fn uid(&self) -> Option<&str> {
        self.raw.get("metadata").and_then(|m| m.get("uid")).and_then(|v| v.as_str())
    }

    pub fn owner_references(&self) -> Vec<OwnerRef> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("ownerReferences"))
            .and_then(|v| serde_json::from_value::<Vec<OwnerRef>>(v.clone()).ok())
            .unwrap_or_default()
    }
}

/// Subset of `metadata.ownerReferences[]` needed to map children to owners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub controller: Option<bool>,
}

/// Why an item was enqueued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    Created,
    Updated,
    Deleted,
    Resynced,
}

impl Reason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Created => "created",
            Reason::Updated => "updated",
            Reason::Deleted => "deleted",
            Reason::Resynced => "resynced",
        }
    }
}

/// One pending unit of reconciliation work in a controller queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ObjectKey,
    pub reason: Option<Reason>,
    /// Consecutive failed attempts; reset once a reconcile succeeds.
    pub requeues: u32,
}

impl WorkItem {
    pub fn new(key: ObjectKey, reason: Option<Reason>) -> Self {
        Self { key, reason, requeues: 0 }
    }

    /// Fold a newer notification for the same key into this item.
    pub fn coalesce(&mut self, newer: WorkItem) {
        if newer.reason.is_some() {
            self.reason = newer.reason;
        }
        self.requeues = self.requeues.max(newer.requeues);
    }
}

/// Scheduling decision returned by a successful reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Done until the next change notification.
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    pub fn requeue(after: Duration) -> Self {
        Self { requeue_after: Some(after) }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Outcome of one reconciler invocation.
pub type ReconcileResult = anyhow::Result<Action>;

/// Process-wide lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OperatorState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

impl OperatorState {
    pub fn can_transition_to(self, next: OperatorState) -> bool {
        next > self
    }
}

impl fmt::Display for OperatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperatorState::Initializing => "initializing",
            OperatorState::Running => "running",
            OperatorState::Draining => "draining",
            OperatorState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

pub mod prelude {
    pub use super::{Action, Backoff, CachedObject, ObjectKey, OperatorState, Reason, ReconcileResult, ResourceKind, WorkItem};
}
