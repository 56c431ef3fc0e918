//! List+watch loop feeding the cache for one kind.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cao_core::{CachedObject, ResourceKind};
use cao_kubehub::{ClientError, WatchEvent};
use cao_schema::KindCodec;

use crate::{CacheError, SharedStateCache};

/// Running watch task for one kind.
pub struct WatchHandle {
    pub kind: ResourceKind,
    pub task: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    List,
    Watch,
}

enum Restart {
    /// Events may have been missed, or a periodic resync is due; relist.
    Relist { resync: bool },
    Stop,
}

impl SharedStateCache {
    /// Start the list+watch loop for `kind`. The loop reconnects on its own,
    /// relisting after any error so missed events are repaired. Only fatal
    /// errors (credentials, RBAC, unserved kind) end it, reported on `fatal`.
    pub fn start_watch(
        self: &Arc<Self>,
        kind: &ResourceKind,
        cancel: CancellationToken,
        fatal: mpsc::Sender<CacheError>,
    ) -> Result<WatchHandle, CacheError> {
        let codec = self.registry.lookup(kind).map_err(|_| CacheError::UnknownKind(kind.clone()))?;
        {
            let mut synced = self.synced_map();
            if synced.contains_key(kind) {
                return Err(CacheError::AlreadyWatching(kind.clone()));
            }
            synced.insert(kind.clone(), watch::channel(false).0);
        }
        let cache = Arc::clone(self);
        let task = tokio::spawn(async move {
            cache.run_watch(&codec, cancel, fatal).await;
        });
        Ok(WatchHandle { kind: kind.clone(), task })
    }

    async fn run_watch(&self, codec: &KindCodec, cancel: CancellationToken, fatal: mpsc::Sender<CacheError>) {
        let kind = codec.kind().clone();
        let ns = if codec.namespaced() { self.opts.namespace.clone() } else { None };
        let mut failures: u32 = 0;
        let mut report_unchanged = false;
        info!(kind = %kind, ns = ?ns, "watch started");

        'relist: loop {
            let listed = tokio::select! {
                _ = cancel.cancelled() => break 'relist,
                r = self.client.list(codec, ns.as_deref()) => r,
            };
            let list = match listed {
                Ok(list) => list,
                Err(e) => match self.on_error(&kind, e, Phase::List, &mut failures, &cancel, &fatal).await {
                    Restart::Stop => break 'relist,
                    Restart::Relist { .. } => {
                        report_unchanged = false;
                        continue 'relist;
                    }
                },
            };
            let items = self.decode_all(codec, list.items);
            let events = self.apply_list(codec, items, report_unchanged);
            debug!(kind = %kind, events = events.len(), rv = %list.resource_version, "relisted");
            self.publish(events).await;
            self.mark_synced(&kind);

            let mut rv = list.resource_version;
            let resync_at = self.opts.resync_period.map(|p| Instant::now() + p);
            match self.watch_once(codec, ns.as_deref(), &mut rv, resync_at, &mut failures, &cancel, &fatal).await {
                Restart::Relist { resync } => {
                    if !resync {
                        metrics::counter!("cao_watch_restarts_total", 1u64, "kind" => kind.gvk_key());
                    }
                    report_unchanged = resync;
                }
                Restart::Stop => break 'relist,
            }
        }
        info!(kind = %kind, "watch stopped");
    }

    #[allow(clippy::too_many_arguments)]
    async fn watch_once(
        &self,
        codec: &KindCodec,
        ns: Option<&str>,
        rv: &mut String,
        resync_at: Option<Instant>,
        failures: &mut u32,
        cancel: &CancellationToken,
        fatal: &mpsc::Sender<CacheError>,
    ) -> Restart {
        let kind = codec.kind();
        let opened = tokio::select! {
            _ = cancel.cancelled() => return Restart::Stop,
            r = self.client.watch(codec, ns, rv) => r,
        };
        let mut stream = match opened {
            Ok(s) => s,
            Err(e) => return self.on_error(kind, e, Phase::Watch, failures, cancel, fatal).await,
        };
        loop {
            let resync = async {
                match resync_at {
                    Some(at) => sleep_until(at).await,
                    None => futures::future::pending::<()>().await,
                }
            };
            let next = tokio::select! {
                _ = cancel.cancelled() => return Restart::Stop,
                _ = resync => {
                    debug!(kind = %kind, "periodic resync");
                    return Restart::Relist { resync: true };
                }
                next = stream.next() => next,
            };
            match next {
                None => {
                    info!(kind = %kind, rv = %rv, "watch disconnected; relisting");
                    return Restart::Relist { resync: false };
                }
                Some(Ok(ev)) => {
                    *failures = 0;
                    self.apply_event(codec, ev, rv).await;
                }
                Some(Err(e)) => return self.on_error(kind, e, Phase::Watch, failures, cancel, fatal).await,
            }
        }
    }

    async fn apply_event(&self, codec: &KindCodec, ev: WatchEvent, rv: &mut String) {
        let (raw, deleted) = match ev {
            WatchEvent::Bookmark(next) => {
                *rv = next;
                return;
            }
            WatchEvent::Added(raw) | WatchEvent::Modified(raw) => (raw, false),
            WatchEvent::Deleted(raw) => (raw, true),
        };
        let obj = match codec.decode(raw) {
            Ok(obj) => obj,
            Err(e) => {
                warn!(kind = %codec.kind(), error = %e, "dropping undecodable watch event");
                return;
            }
        };
        if obj.resource_version != 0 {
            *rv = obj.resource_version.to_string();
        }
        if !self.in_scope(codec, &obj.key) {
            return;
        }
        let applied = if deleted { self.apply_delete(obj) } else { self.apply_upsert(obj) };
        if let Some(ev) = applied {
            debug!(key = %ev.key, reason = ev.reason.as_str(), "applied");
            self.publish(vec![ev]).await;
        }
    }

    fn decode_all(&self, codec: &KindCodec, items: Vec<serde_json::Value>) -> Vec<CachedObject> {
        items
            .into_iter()
            .filter_map(|raw| match codec.decode(raw) {
                Ok(obj) if self.in_scope(codec, &obj.key) => Some(obj),
                Ok(_) => None,
                Err(e) => {
                    warn!(kind = %codec.kind(), error = %e, "skipping undecodable list item");
                    None
                }
            })
            .collect()
    }

    /// Classify a list/watch error: fatal ones stop the loop and are reported,
    /// `Gone` from a watch relists at once, anything else relists after backoff.
    async fn on_error(
        &self,
        kind: &ResourceKind,
        e: ClientError,
        phase: Phase,
        failures: &mut u32,
        cancel: &CancellationToken,
        fatal: &mpsc::Sender<CacheError>,
    ) -> Restart {
        if e.is_fatal() || e.is_not_found() {
            error!(kind = %kind, error = %e, "watch failed permanently");
            let _ = fatal.send(CacheError::Fatal { kind: kind.clone(), source: e }).await;
            return Restart::Stop;
        }
        if phase == Phase::Watch && matches!(e, ClientError::Gone(_)) {
            info!(kind = %kind, error = %e, "watch expired; relisting");
            return Restart::Relist { resync: false };
        }
        *failures = failures.saturating_add(1);
        let delay = self.opts.watch_backoff.delay(*failures);
        warn!(kind = %kind, error = %e, attempt = *failures, delay_ms = delay.as_millis() as u64, "watch error; relisting after backoff");
        tokio::select! {
            _ = cancel.cancelled() => Restart::Stop,
            _ = sleep(delay) => Restart::Relist { resync: false },
        }
    }
}
