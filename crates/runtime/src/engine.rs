//! Reconcile workers: dequeue, look up cached state, reconcile, schedule.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use cao_core::{Backoff, WorkItem};
use cao_store::SharedStateCache;

use crate::queue::WorkQueue;
use crate::reconciler::{Reconciler, Request};

pub(crate) struct Engine {
    pub(crate) name: String,
    pub(crate) queue: Arc<WorkQueue>,
    pub(crate) reconciler: Arc<dyn Reconciler>,
    pub(crate) cache: Arc<SharedStateCache>,
    pub(crate) backoff: Backoff,
}

impl Engine {
    /// Process items until the queue shuts down. `cancel` is handed to every
    /// reconcile so in-flight work can wind down once draining starts.
    pub(crate) async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        debug!(controller = %self.name, worker, "worker started");
        while let Some(item) = self.queue.get().await {
            self.process(item, &cancel).await;
        }
        debug!(controller = %self.name, worker, "worker stopped");
    }

    async fn process(&self, item: WorkItem, cancel: &CancellationToken) {
        let key = item.key.clone();
        let req = Request {
            key: key.clone(),
            object: self.cache.get(&key).ok(),
            reason: item.reason,
            attempt: item.requeues,
            cancel: cancel.clone(),
        };
        let not_found = req.is_not_found();
        let span = info_span!("reconcile", controller = %self.name, key = %key, attempt = item.requeues);
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.reconciler.reconcile(req).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(anyhow::anyhow!("reconciler panicked")));
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("cao_reconcile_ms", elapsed_ms, "controller" => self.name.clone());

        match outcome {
            Ok(action) => {
                metrics::counter!("cao_reconcile_total", 1u64, "controller" => self.name.clone(), "result" => "success");
                match action.requeue_after() {
                    Some(after) => {
                        let after_ms = after.as_millis() as u64;
                        if self.queue.add_after(WorkItem::new(key.clone(), item.reason), after) {
                            metrics::counter!("cao_requeue_total", 1u64, "controller" => self.name.clone(), "cause" => "requested");
                            debug!(controller = %self.name, key = %key, not_found, after_ms, "reconciled; requeue requested");
                        } else {
                            warn!(controller = %self.name, key = %key, after_ms, "reconciled while shutting down; requested requeue dropped");
                        }
                    }
                    None => debug!(controller = %self.name, key = %key, not_found, elapsed_ms, "reconciled"),
                }
            }
            Err(e) => {
                metrics::counter!("cao_reconcile_total", 1u64, "controller" => self.name.clone(), "result" => "error");
                let attempt = item.requeues.saturating_add(1);
                let delay = self.backoff.delay(attempt);
                if self.queue.add_after(WorkItem { key: key.clone(), reason: item.reason, requeues: attempt }, delay) {
                    metrics::counter!("cao_requeue_total", 1u64, "controller" => self.name.clone(), "cause" => "error");
                    warn!(controller = %self.name, key = %key, attempt, delay_ms = delay.as_millis() as u64, error = %format!("{e:#}"), "reconcile failed; retrying");
                } else {
                    warn!(controller = %self.name, key = %key, attempt, error = %format!("{e:#}"), "reconcile failed while shutting down; not retried");
                }
            }
        }
        self.queue.done(&key);
    }
}
