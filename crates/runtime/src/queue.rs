//! Coalescing work queue with delayed requeue and per-key exclusivity.
//!
//! A key is in at most one of three places: the ready order (waiting for a
//! worker), the processing set (handed out, not yet `done`), or the delayed
//! table (waiting for its timer). Adds for a key that is already pending fold
//! into the pending item. Adds for a key that is being processed are parked
//! as dirty and become ready only when the worker calls [`WorkQueue::done`],
//! so the same key is never handed to two workers at once.
//!
//! Delayed entries share one timer task per queue, started on the first
//! delayed add and stopped by [`WorkQueue::shut_down`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::StreamExt;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, warn};

use cao_core::{ObjectKey, WorkItem};

#[derive(Default)]
struct State {
    order: VecDeque<ObjectKey>,
    /// Pending items: ready (listed in `order`) or parked behind `processing`.
    dirty: FxHashMap<ObjectKey, WorkItem>,
    processing: FxHashSet<ObjectKey>,
    delayed: FxHashMap<ObjectKey, (Instant, WorkItem)>,
    timer: Option<mpsc::UnboundedSender<(ObjectKey, Instant)>>,
    shutting_down: bool,
}

pub struct WorkQueue {
    name: String,
    state: Mutex<State>,
    ready: Notify,
}

impl WorkQueue {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self { name: name.to_string(), state: Mutex::new(State::default()), ready: Notify::new() })
    }

    pub fn name(&self) -> &str { &self.name }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue for immediate processing. Supersedes a pending delayed entry
    /// for the same key, keeping its requeue count. Returns `false` if the
    /// queue is shutting down and the item was dropped.
    pub fn add(&self, item: WorkItem) -> bool {
        let mut st = self.lock();
        self.add_locked(&mut st, item)
    }

    fn add_locked(&self, st: &mut State, mut item: WorkItem) -> bool {
        if st.shutting_down {
            debug!(controller = %self.name, key = %item.key, "queue shutting down; item dropped");
            return false;
        }
        metrics::counter!("cao_queue_adds_total", 1u64, "controller" => self.name.clone());
        if let Some((_, delayed)) = st.delayed.remove(&item.key) {
            item.requeues = item.requeues.max(delayed.requeues);
        }
        if let Some(pending) = st.dirty.get_mut(&item.key) {
            pending.coalesce(item);
            metrics::counter!("cao_queue_coalesced_total", 1u64, "controller" => self.name.clone());
            return true;
        }
        let key = item.key.clone();
        st.dirty.insert(key.clone(), item);
        if !st.processing.contains(&key) {
            st.order.push_back(key);
            self.ready.notify_one();
        }
        self.record_depth(st);
        true
    }

    /// Enqueue once `delay` has elapsed. An earlier pending deadline for the
    /// same key wins; a key already waiting to run only takes the requeue count.
    /// Returns `false` if the queue is shutting down and the item was dropped.
    pub fn add_after(self: &Arc<Self>, item: WorkItem, delay: Duration) -> bool {
        if delay.is_zero() {
            return self.add(item);
        }
        let deadline = Instant::now() + delay;
        let mut st = self.lock();
        if st.shutting_down {
            debug!(controller = %self.name, key = %item.key, "queue shutting down; delayed item dropped");
            return false;
        }
        if let Some(pending) = st.dirty.get_mut(&item.key) {
            pending.requeues = pending.requeues.max(item.requeues);
            return true;
        }
        let mut item = item;
        if let Some((at, existing)) = st.delayed.get_mut(&item.key) {
            if *at <= deadline {
                existing.coalesce(item);
                return true;
            }
            item.requeues = item.requeues.max(existing.requeues);
        }
        let key = item.key.clone();
        st.delayed.insert(key.clone(), (deadline, item));
        let timer = st.timer.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_timers(Arc::downgrade(self), rx));
            tx
        });
        if timer.send((key, deadline)).is_err() {
            warn!(controller = %self.name, "delay timer stopped; delayed item not scheduled");
            return false;
        }
        true
    }

    /// Move a delayed entry to the ready queue, unless it was superseded.
    fn promote(&self, key: &ObjectKey, deadline: Instant) {
        let mut st = self.lock();
        match st.delayed.get(key) {
            Some((at, _)) if *at == deadline => {}
            _ => return,
        }
        if let Some((_, item)) = st.delayed.remove(key) {
            self.add_locked(&mut st, item);
        }
    }

    /// Wait for the next ready item and mark its key as processing.
    /// Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<WorkItem> {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.shutting_down {
                    return None;
                }
                while let Some(key) = st.order.pop_front() {
                    let Some(item) = st.dirty.remove(&key) else { continue };
                    st.processing.insert(key);
                    if !st.order.is_empty() {
                        self.ready.notify_one();
                    }
                    self.record_depth(&st);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release a key handed out by [`get`](Self::get). If it was re-added
    /// meanwhile, it becomes ready again.
    pub fn done(&self, key: &ObjectKey) {
        let mut st = self.lock();
        st.processing.remove(key);
        if st.dirty.contains_key(key) && !st.shutting_down {
            st.order.push_back(key.clone());
            self.ready.notify_one();
        }
    }

    /// Stop handing out work. Waiting workers get `None`.
    pub fn shut_down(&self) {
        let mut st = self.lock();
        if st.shutting_down {
            return;
        }
        st.shutting_down = true;
        st.timer = None;
        let pending = st.dirty.len() + st.delayed.len();
        if pending > 0 {
            warn!(controller = %self.name, pending, in_flight = st.processing.len(), "queue shut down with pending items");
        } else {
            debug!(controller = %self.name, in_flight = st.processing.len(), "queue shut down");
        }
        drop(st);
        self.ready.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool { self.lock().shutting_down }

    /// Items waiting to be processed, excluding delayed ones.
    pub fn len(&self) -> usize { self.lock().dirty.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn delayed_len(&self) -> usize { self.lock().delayed.len() }

    pub fn in_flight(&self) -> usize { self.lock().processing.len() }

    fn record_depth(&self, st: &State) {
        metrics::gauge!("cao_queue_depth", st.dirty.len() as f64, "controller" => self.name.clone());
    }
}

/// Fire delayed entries for `queue`. A newer deadline for a key replaces its
/// timer. Exits when the queue drops its sender or is itself dropped.
async fn run_timers(queue: Weak<WorkQueue>, mut rx: mpsc::UnboundedReceiver<(ObjectKey, Instant)>) {
    let mut timers: DelayQueue<(ObjectKey, Instant)> = DelayQueue::new();
    let mut scheduled: FxHashMap<ObjectKey, delay_queue::Key> = FxHashMap::default();
    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some((key, deadline)) = msg else { break };
                if let Some(old) = scheduled.remove(&key) {
                    timers.remove(&old);
                }
                let entry = timers.insert_at((key.clone(), deadline), deadline);
                scheduled.insert(key, entry);
            }
            Some(expired) = timers.next() => {
                let (key, deadline) = expired.into_inner();
                scheduled.remove(&key);
                let Some(queue) = queue.upgrade() else { break };
                queue.promote(&key, deadline);
            }
        }
    }
}
