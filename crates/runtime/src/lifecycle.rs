//! The operator lifecycle: Initializing, Running, Draining, Stopped.
//!
//! [`Manager`] owns the shared cache and every registered controller. During
//! `Initializing` controllers are added and subscribed; [`Manager::start`]
//! then starts one watch per kind, waits for the caches to sync, runs the
//! workers until a stop signal or a fatal watch error, and drains.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cao_core::{Backoff, OperatorState, ResourceKind};
use cao_kubehub::ClusterClient;
use cao_schema::TypeRegistry;
use cao_store::{CacheError, CacheOptions, SharedStateCache, Subscription};

use crate::controller::{pump_events, Controller, Mapper};
use crate::engine::Engine;
use crate::queue::WorkQueue;

#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("controller {controller}: kind {kind} is not registered")]
    UnknownKind { controller: String, kind: ResourceKind },
    #[error("controllers can only be added while initializing (state: {0})")]
    NotInitializing(OperatorState),
    #[error("controller already registered: {0}")]
    DuplicateController(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("startup failed: {0}")]
    Startup(#[source] CacheError),
    #[error("fatal component error: {0}")]
    Fatal(#[source] CacheError),
    #[error("invalid lifecycle transition {from} -> {to}")]
    InvalidTransition { from: OperatorState, to: OperatorState },
}

/// How draining ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every in-flight reconcile finished within the drain timeout.
    Clean,
    /// The drain timeout elapsed and remaining workers were aborted.
    Forced,
}

impl DrainOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            DrainOutcome::Clean => 0,
            DrainOutcome::Forced => 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Restrict namespaced kinds to one namespace; `None` watches all.
    pub namespace: Option<String>,
    pub drain_timeout: Duration,
    pub channel_capacity: usize,
    pub resync_period: Option<Duration>,
    pub watch_backoff: Backoff,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        let cache = CacheOptions::default();
        Self {
            namespace: None,
            drain_timeout: Duration::from_secs(30),
            channel_capacity: cache.channel_capacity,
            resync_period: cache.resync_period,
            watch_backoff: cache.watch_backoff,
        }
    }
}

struct Registered {
    name: String,
    kinds: Vec<ResourceKind>,
    workers: usize,
    engine: Arc<Engine>,
    pumps: Vec<(Subscription, Mapper)>,
}

pub struct Manager {
    cache: Arc<SharedStateCache>,
    opts: ManagerOptions,
    state: watch::Sender<OperatorState>,
    controllers: Vec<Registered>,
}

impl Manager {
    pub fn new(client: Arc<dyn ClusterClient>, registry: Arc<TypeRegistry>, opts: ManagerOptions) -> Self {
        let cache_opts = CacheOptions {
            namespace: opts.namespace.clone(),
            channel_capacity: opts.channel_capacity,
            resync_period: opts.resync_period,
            watch_backoff: opts.watch_backoff,
        };
        let cache = SharedStateCache::new(registry, client, cache_opts);
        let (state, _) = watch::channel(OperatorState::Initializing);
        Self { cache, opts, state, controllers: Vec::new() }
    }

    pub fn cache(&self) -> &Arc<SharedStateCache> { &self.cache }

    pub fn registry(&self) -> &Arc<TypeRegistry> { self.cache.registry() }

    pub fn client(&self) -> &Arc<dyn ClusterClient> { self.cache.client() }

    pub fn options(&self) -> &ManagerOptions { &self.opts }

    pub fn state(&self) -> OperatorState { *self.state.borrow() }

    /// Observe lifecycle transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<OperatorState> { self.state.subscribe() }

    pub fn controller_names(&self) -> Vec<&str> { self.controllers.iter().map(|c| c.name.as_str()).collect() }

    fn transition(&self, next: OperatorState) -> Result<(), ManagerError> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(ManagerError::InvalidTransition { from, to: next });
        }
        self.state.send_replace(next);
        info!(from = %from, to = %next, "lifecycle transition");
        Ok(())
    }

    /// Register a controller and subscribe its watches. Only valid while initializing.
    pub fn add(&mut self, controller: Controller) -> Result<(), RegistrationError> {
        let state = self.state();
        if state != OperatorState::Initializing {
            return Err(RegistrationError::NotInitializing(state));
        }
        if self.controllers.iter().any(|c| c.name == controller.name) {
            return Err(RegistrationError::DuplicateController(controller.name));
        }
        let kinds = controller.kinds();
        if let Some(kind) = kinds.iter().find(|k| !self.cache.registry().contains(k)) {
            return Err(RegistrationError::UnknownKind { controller: controller.name.clone(), kind: kind.clone() });
        }

        let mut pumps = Vec::with_capacity(controller.watches.len());
        for w in controller.watches {
            let sub = self.cache.subscribe(&w.kind, w.filter).map_err(|_| RegistrationError::UnknownKind {
                controller: controller.name.clone(),
                kind: w.kind.clone(),
            })?;
            pumps.push((sub, w.mapper));
        }
        let queue = WorkQueue::new(&controller.name);
        let engine = Arc::new(Engine {
            name: controller.name.clone(),
            queue,
            reconciler: controller.reconciler,
            cache: Arc::clone(&self.cache),
            backoff: controller.opts.backoff,
        });
        let workers = controller.opts.workers.max(1);
        info!(controller = %controller.name, primary = %controller.primary, watches = pumps.len(), workers, "controller registered");
        self.controllers.push(Registered { name: controller.name, kinds, workers, engine, pumps });
        Ok(())
    }

    /// Run until `shutdown` is cancelled or a watch fails fatally, then drain.
    /// A fatal error is returned after draining; otherwise the drain outcome.
    pub async fn start(mut self, shutdown: CancellationToken) -> Result<DrainOutcome, ManagerError> {
        if self.state() != OperatorState::Initializing {
            return Err(ManagerError::InvalidTransition { from: self.state(), to: OperatorState::Running });
        }
        let watch_cancel = CancellationToken::new();
        let work_cancel = CancellationToken::new();
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<CacheError>(16);

        let mut kinds: Vec<ResourceKind> = Vec::new();
        for kind in self.controllers.iter().flat_map(|c| c.kinds.iter()) {
            if !kinds.contains(kind) {
                kinds.push(kind.clone());
            }
        }
        // Pumps start before the sync gate, workers only after it.
        let controllers: Vec<Registered> = self.controllers.drain(..).collect();
        let mut queues: Vec<Arc<WorkQueue>> = Vec::with_capacity(controllers.len());
        let mut engines: Vec<(Arc<Engine>, usize)> = Vec::with_capacity(controllers.len());
        for c in controllers {
            for (sub, mapper) in c.pumps {
                tokio::spawn(pump_events(sub, mapper, Arc::clone(&c.engine.queue), work_cancel.clone()));
            }
            queues.push(Arc::clone(&c.engine.queue));
            engines.push((c.engine, c.workers));
        }
        let abandon = |queues: &[Arc<WorkQueue>]| {
            watch_cancel.cancel();
            work_cancel.cancel();
            for q in queues {
                q.shut_down();
            }
        };

        for kind in &kinds {
            if let Err(e) = self.cache.start_watch(kind, watch_cancel.clone(), fatal_tx.clone()) {
                error!(kind = %kind, error = %e, "failed to start watch");
                abandon(&queues);
                self.transition(OperatorState::Stopped)?;
                return Err(ManagerError::Startup(e));
            }
        }

        let synced = tokio::select! {
            r = self.cache.wait_for_sync(&kinds) => r.map_err(ManagerError::Startup),
            Some(e) = fatal_rx.recv() => Err(ManagerError::Fatal(e)),
            _ = shutdown.cancelled() => {
                info!("stop requested before caches synced");
                self.transition(OperatorState::Draining)?;
                abandon(&queues);
                self.transition(OperatorState::Stopped)?;
                return Ok(DrainOutcome::Clean);
            }
        };
        if let Err(e) = synced {
            error!(error = %e, "caches failed to sync");
            abandon(&queues);
            self.transition(OperatorState::Stopped)?;
            return Err(e);
        }
        info!(kinds = kinds.len(), "caches synced");

        let mut workers: Vec<JoinHandle<()>> = Vec::new();
        for (engine, count) in &engines {
            for id in 0..*count {
                workers.push(tokio::spawn(Arc::clone(engine).run_worker(id, work_cancel.clone())));
            }
        }
        self.transition(OperatorState::Running)?;
        info!(controllers = queues.len(), workers = workers.len(), "operator running");

        let fatal = tokio::select! {
            _ = shutdown.cancelled() => None,
            Some(e) = fatal_rx.recv() => Some(e),
        };
        self.transition(OperatorState::Draining)?;
        match &fatal {
            Some(e) => error!(error = %e, "fatal component error; draining"),
            None => info!(timeout_ms = self.opts.drain_timeout.as_millis() as u64, "stop requested; draining"),
        }
        work_cancel.cancel();
        for q in &queues {
            q.shut_down();
        }
        let aborts: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
        let outcome = match tokio::time::timeout(self.opts.drain_timeout, futures::future::join_all(workers)).await {
            Ok(results) => {
                for r in results.into_iter().filter_map(Result::err) {
                    warn!(error = %r, "worker ended abnormally");
                }
                DrainOutcome::Clean
            }
            Err(_) => {
                let in_flight: usize = queues.iter().map(|q| q.in_flight()).sum();
                warn!(in_flight, "drain timeout elapsed; aborting workers");
                for a in aborts {
                    a.abort();
                }
                DrainOutcome::Forced
            }
        };
        watch_cancel.cancel();
        self.transition(OperatorState::Stopped)?;
        info!(outcome = ?outcome, "operator stopped");
        match fatal {
            Some(e) => Err(ManagerError::Fatal(e)),
            None => Ok(outcome),
        }
    }
}
