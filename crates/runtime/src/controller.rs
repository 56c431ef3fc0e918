//! Controller definition: a primary kind, optional secondary watches mapped
//! onto primary keys, and the reconciler that handles them.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use cao_core::{Backoff, ObjectKey, ResourceKind, WorkItem};
use cao_schema::KindCodec;
use cao_store::{accept_all, ChangeEvent, Filter, Subscription};

use crate::lifecycle::{Manager, RegistrationError};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;

/// Maps a change notification to the primary keys it should trigger.
pub type Mapper = Arc<dyn Fn(&ChangeEvent) -> Vec<ObjectKey> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Concurrent reconcile workers; the same key never runs on two at once.
    pub workers: usize,
    pub backoff: Backoff,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self { workers: 1, backoff: Backoff::default() }
    }
}

pub(crate) struct Watch {
    pub(crate) kind: ResourceKind,
    pub(crate) filter: Filter,
    pub(crate) mapper: Mapper,
}

pub struct Controller {
    pub(crate) name: String,
    pub(crate) primary: ResourceKind,
    pub(crate) watches: Vec<Watch>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) opts: ControllerOptions,
}

impl Controller {
    pub fn new(name: &str, primary: ResourceKind, reconciler: impl Reconciler) -> Self {
        let watches = vec![Watch { kind: primary.clone(), filter: accept_all(), mapper: Arc::new(|ev: &ChangeEvent| vec![ev.key.clone()]) }];
        Self { name: name.to_string(), primary, watches, reconciler: Arc::new(reconciler), opts: ControllerOptions::default() }
    }

    /// Only enqueue primary-kind changes accepted by `filter`.
    pub fn with_filter(mut self, filter: Filter) -> Self {
        if let Some(primary) = self.watches.first_mut() {
            primary.filter = filter;
        }
        self
    }

    pub fn with_options(mut self, opts: ControllerOptions) -> Self {
        self.opts = opts;
        self
    }

    /// Also watch `kind`, enqueueing the primary keys `mapper` returns.
    pub fn watches(mut self, kind: ResourceKind, mapper: impl Fn(&ChangeEvent) -> Vec<ObjectKey> + Send + Sync + 'static) -> Self {
        self.watches.push(Watch { kind, filter: accept_all(), mapper: Arc::new(mapper) });
        self
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn primary(&self) -> &ResourceKind { &self.primary }

    /// Every kind this controller needs watched, primary first.
    pub fn kinds(&self) -> Vec<ResourceKind> {
        let mut kinds: Vec<ResourceKind> = Vec::with_capacity(self.watches.len());
        for w in &self.watches {
            if !kinds.contains(&w.kind) {
                kinds.push(w.kind.clone());
            }
        }
        kinds
    }

    pub fn add_to_manager(self, manager: &mut Manager) -> Result<(), RegistrationError> {
        manager.add(self)
    }
}

/// Mapper sending an object's events to the owner of kind `owner`, found
/// through `metadata.ownerReferences`. Cluster-scoped owners get no namespace.
pub fn map_to_owner(owner: &KindCodec) -> impl Fn(&ChangeEvent) -> Vec<ObjectKey> + Send + Sync + 'static {
    let owner = owner.clone();
    move |ev: &ChangeEvent| {
        let api_version = owner.kind().api_version();
        ev.object
            .owner_references()
            .into_iter()
            .filter(|r| r.api_version == api_version && r.kind == owner.kind().kind)
            .map(|r| owner.key(ev.key.namespace.as_deref(), &r.name))
            .collect()
    }
}

/// Feed one subscription into a controller queue until cancelled or the
/// cache goes away.
pub(crate) async fn pump_events(mut sub: Subscription, mapper: Mapper, queue: Arc<WorkQueue>, cancel: CancellationToken) {
    loop {
        let ev = tokio::select! {
            _ = cancel.cancelled() => break,
            ev = sub.next() => match ev {
                Some(ev) => ev,
                None => break,
            },
        };
        let keys = mapper(&ev);
        trace!(controller = %queue.name(), key = %ev.key, reason = ev.reason.as_str(), mapped = keys.len(), "event");
        for key in keys {
            queue.add(WorkItem::new(key, Some(ev.reason)));
        }
    }
    debug!(controller = %queue.name(), kind = %sub.kind(), "event pump stopped");
}
