//! cao kubehub: the cluster API contract the operator core relies on.
//!
//! [`ClusterClient`] is the already-authenticated read/write surface per
//! resource kind. [`KubeClusterClient`] talks to a real apiserver through
//! kube-rs; [`MemoryCluster`] is an in-process cluster for tests and demos.

#![forbid(unsafe_code)]

use cao_schema::KindCodec;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

mod kube_client;
mod memory;

pub use kube_client::KubeClusterClient;
pub use memory::{MemoryCluster, Op};

/// Errors from the cluster API. `Conflict` is kept distinct so writers can
/// retry on a stale resource version instead of clobbering newer state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("resource version expired: {0}")]
    Gone(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("client configuration: {0}")]
    Config(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("api error {code}: {message}")]
    Api { code: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl ClientError {
    /// Map an apiserver `Status` to an error.
    pub fn from_status(code: u16, reason: &str, message: &str) -> Self {
        let message = message.to_string();
        match code {
            401 => ClientError::Unauthorized(message),
            403 => ClientError::Forbidden(message),
            404 => ClientError::NotFound(message),
            409 if reason == "AlreadyExists" => ClientError::AlreadyExists(message),
            409 => ClientError::Conflict(message),
            410 => ClientError::Gone(message),
            _ => ClientError::Api { code, message },
        }
    }

    /// Errors that retrying cannot fix: bad credentials, missing RBAC, bad config.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ClientError::Unauthorized(_) | ClientError::Forbidden(_) | ClientError::Config(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }
}

/// Change notification from a watch, carrying raw apiserver objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent {
    Added(serde_json::Value),
    Modified(serde_json::Value),
    Deleted(serde_json::Value),
    /// Progress marker: only advances the resource version to resume from.
    Bookmark(String),
}

/// Result of a list call: the items plus the collection version to watch from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectList {
    pub resource_version: String,
    pub items: Vec<serde_json::Value>,
}

pub type WatchStream = BoxStream<'static, Result<WatchEvent, ClientError>>;

/// Authenticated per-kind access to the cluster API.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// List objects of a kind; `namespace` scopes namespaced kinds.
    async fn list(&self, codec: &KindCodec, namespace: Option<&str>) -> Result<ObjectList, ClientError>;

    /// Watch changes after `resource_version`. The stream ends when the server closes it.
    async fn watch(&self, codec: &KindCodec, namespace: Option<&str>, resource_version: &str) -> Result<WatchStream, ClientError>;

    async fn get(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<serde_json::Value, ClientError>;

    async fn create(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError>;

    /// Replace an object. Fails with `Conflict` when `metadata.resourceVersion` is stale.
    async fn replace(&self, codec: &KindCodec, obj: &serde_json::Value) -> Result<serde_json::Value, ClientError>;

    async fn delete(&self, codec: &KindCodec, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;
}

pub(crate) fn meta_str<'a>(obj: &'a serde_json::Value, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}
