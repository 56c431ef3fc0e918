use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cao_core::{CachedObject, ObjectKey, Reason, ReconcileResult};

/// One reconciliation request handed to a [`Reconciler`].
#[derive(Debug, Clone)]
pub struct Request {
    pub key: ObjectKey,
    /// Cached state at dispatch time; `None` when the object no longer exists.
    pub object: Option<Arc<CachedObject>>,
    pub reason: Option<Reason>,
    /// Consecutive failures before this attempt.
    pub attempt: u32,
    /// Cancelled when the operator starts draining.
    pub cancel: CancellationToken,
}

impl Request {
    pub fn is_not_found(&self) -> bool { self.object.is_none() }
}

/// Per-kind business logic. Must be idempotent: it may be invoked any number
/// of times for the same observed state.
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self, req: Request) -> ReconcileResult;
}

#[async_trait::async_trait]
impl<R: Reconciler + ?Sized> Reconciler for Arc<R> {
    async fn reconcile(&self, req: Request) -> ReconcileResult {
        (**self).reconcile(req).await
    }
}
