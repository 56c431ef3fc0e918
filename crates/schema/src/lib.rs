//! cao schema: the type registry mapping resource kinds to their codecs.
//!
//! The registry is assembled once through [`RegistryBuilder`] during startup and
//! frozen into an immutable [`TypeRegistry`] that every component shares via `Arc`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use cao_core::{CachedObject, CoreError, ObjectKey, ResourceKind};
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

pub mod apis;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("kind already registered: {0}")]
    DuplicateKind(ResourceKind),
    #[error("unknown kind: {0}")]
    UnknownKind(ResourceKind),
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("expected {expected}, object declares {found}")]
    KindMismatch { expected: String, found: String },
    #[error(transparent)]
    Identity(#[from] CoreError),
    #[error("decoding {kind}: {source}")]
    Decode { kind: ResourceKind, source: serde_json::Error },
    #[error("encoding {kind}: {source}")]
    Encode { kind: ResourceKind, source: serde_json::Error },
}

/// (De)serialization and identity rules for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindCodec {
    kind: ResourceKind,
    plural: String,
    namespaced: bool,
}

impl KindCodec {
    pub fn new(kind: ResourceKind, plural: &str, namespaced: bool) -> Self {
        Self { kind, plural: plural.to_string(), namespaced }
    }

    /// Codec for a built-in kind described by k8s-openapi.
    pub fn of<K: k8s_openapi::Resource>(namespaced: bool) -> Self {
        Self::new(ResourceKind::new(K::GROUP, K::VERSION, K::KIND), K::URL_PATH_SEGMENT, namespaced)
    }

    pub fn kind(&self) -> &ResourceKind { &self.kind }
    pub fn plural(&self) -> &str { &self.plural }
    pub fn namespaced(&self) -> bool { self.namespaced }

    /// Key for an object of this kind; the namespace is dropped for cluster-scoped kinds.
    pub fn key(&self, namespace: Option<&str>, name: &str) -> ObjectKey {
        let ns = if self.namespaced { namespace } else { None };
        ObjectKey::new(self.kind.clone(), ns, name)
    }

    /// Decode a raw apiserver object into the cache representation.
    pub fn decode(&self, raw: serde_json::Value) -> Result<CachedObject, CodecError> {
        self.check_type_meta(&raw)?;
        let mut obj = CachedObject::from_raw(&self.kind, raw)?;
        if !self.namespaced {
            obj.key.namespace = None;
        }
        Ok(obj)
    }

    /// Deserialize a cached object into a typed view.
    pub fn decode_typed<T: DeserializeOwned>(&self, obj: &CachedObject) -> Result<T, CodecError> {
        self.decode_value(obj.raw.clone())
    }

    /// Deserialize a raw object into a typed view. List items may lack type
    /// meta, which k8s-openapi types insist on, so it is filled in first.
    pub fn decode_value<T: DeserializeOwned>(&self, mut raw: serde_json::Value) -> Result<T, CodecError> {
        if let Some(map) = raw.as_object_mut() {
            map.entry("apiVersion").or_insert_with(|| serde_json::Value::String(self.kind.api_version()));
            map.entry("kind").or_insert_with(|| serde_json::Value::String(self.kind.kind.clone()));
        }
        serde_json::from_value(raw).map_err(|source| CodecError::Decode { kind: self.kind.clone(), source })
    }

    /// Serialize a typed value, stamping apiVersion and kind.
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<serde_json::Value, CodecError> {
        let mut raw = serde_json::to_value(value).map_err(|source| CodecError::Encode { kind: self.kind.clone(), source })?;
        if let Some(map) = raw.as_object_mut() {
            map.insert("apiVersion".to_string(), serde_json::Value::String(self.kind.api_version()));
            map.insert("kind".to_string(), serde_json::Value::String(self.kind.kind.clone()));
        }
        Ok(raw)
    }

    fn check_type_meta(&self, raw: &serde_json::Value) -> Result<(), CodecError> {
        // List items come back without type meta; only reject what is explicitly wrong.
        let api_version = raw.get("apiVersion").and_then(|v| v.as_str());
        let kind = raw.get("kind").and_then(|v| v.as_str());
        if let (Some(av), Some(k)) = (api_version, kind) {
            if av != self.kind.api_version() || k != self.kind.kind {
                return Err(CodecError::KindMismatch { expected: self.kind.gvk_key(), found: format!("{}/{}", av, k) });
            }
        }
        Ok(())
    }
}

/// Mutable registry used only while the operator is initializing.
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    kinds: FxHashMap<ResourceKind, Arc<KindCodec>>,
}

impl RegistryBuilder {
    pub fn new() -> Self { Self::default() }

    /// Register a codec. The first registration of a kind wins; later ones fail.
    pub fn register(&mut self, codec: KindCodec) -> Result<Arc<KindCodec>, RegistryError> {
        if self.kinds.contains_key(codec.kind()) {
            return Err(RegistryError::DuplicateKind(codec.kind().clone()));
        }
        debug!(kind = %codec.kind(), plural = codec.plural(), namespaced = codec.namespaced(), "registered kind");
        let codec = Arc::new(codec);
        self.kinds.insert(codec.kind().clone(), Arc::clone(&codec));
        Ok(codec)
    }

    pub fn lookup(&self, kind: &ResourceKind) -> Result<Arc<KindCodec>, RegistryError> {
        self.kinds.get(kind).cloned().ok_or_else(|| RegistryError::UnknownKind(kind.clone()))
    }

    /// Freeze into the shared, read-only registry.
    pub fn build(self) -> Arc<TypeRegistry> {
        Arc::new(TypeRegistry { kinds: self.kinds })
    }
}

/// Read-only table of registered kinds, shared by every controller.
#[derive(Debug)]
pub struct TypeRegistry {
    kinds: FxHashMap<ResourceKind, Arc<KindCodec>>,
}

impl TypeRegistry {
    pub fn lookup(&self, kind: &ResourceKind) -> Result<Arc<KindCodec>, RegistryError> {
        self.kinds.get(kind).cloned().ok_or_else(|| RegistryError::UnknownKind(kind.clone()))
    }

    pub fn contains(&self, kind: &ResourceKind) -> bool { self.kinds.contains_key(kind) }

    pub fn len(&self) -> usize { self.kinds.len() }

    pub fn is_empty(&self) -> bool { self.kinds.is_empty() }

    /// Registered kinds in stable order.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut out: Vec<_> = self.kinds.keys().cloned().collect();
        out.sort();
        out
    }
}
