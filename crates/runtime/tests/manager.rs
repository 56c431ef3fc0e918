#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cao_core::{Action, Backoff, ObjectKey, OperatorState, ReconcileResult, ResourceKind};
use cao_kubehub::{ClientError, MemoryCluster, Op};
use cao_runtime::{Controller, ControllerOptions, DrainOutcome, Manager, ManagerError, ManagerOptions, Reconciler, RegistrationError, Request};
use cao_schema::{KindCodec, RegistryBuilder, TypeRegistry};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct Call {
    key: ObjectKey,
    rv: Option<u64>,
    attempt: u32,
    at: Instant,
}

enum Plan {
    Done,
    Requeue(Duration),
    Fail,
}

struct Recorder {
    plan: Box<dyn Fn(&Request) -> Plan + Send + Sync>,
    work: Duration,
    honor_cancel: bool,
    calls: mpsc::UnboundedSender<Call>,
    active: Mutex<HashSet<ObjectKey>>,
    overlap: AtomicBool,
}

impl Recorder {
    fn new(plan: impl Fn(&Request) -> Plan + Send + Sync + 'static) -> (Self, mpsc::UnboundedReceiver<Call>) {
        let (calls, rx) = mpsc::unbounded_channel();
        let r = Self {
            plan: Box::new(plan),
            work: Duration::ZERO,
            honor_cancel: true,
            calls,
            active: Mutex::new(HashSet::new()),
            overlap: AtomicBool::new(false),
        };
        (r, rx)
    }

    fn working(mut self, work: Duration, honor_cancel: bool) -> Self {
        self.work = work;
        self.honor_cancel = honor_cancel;
        self
    }
}

#[async_trait::async_trait]
impl Reconciler for Recorder {
    async fn reconcile(&self, req: Request) -> ReconcileResult {
        if !self.active.lock().expect("lock").insert(req.key.clone()) {
            self.overlap.store(true, Ordering::SeqCst);
        }
        let _ = self.calls.send(Call {
            key: req.key.clone(),
            rv: req.object.as_ref().map(|o| o.resource_version),
            attempt: req.attempt,
            at: Instant::now(),
        });
        if !self.work.is_zero() {
            if self.honor_cancel {
                tokio::select! {
                    _ = sleep(self.work) => {}
                    _ = req.cancel.cancelled() => {}
                }
            } else {
                sleep(self.work).await;
            }
        }
        self.active.lock().expect("lock").remove(&req.key);
        match (self.plan)(&req) {
            Plan::Done => Ok(Action::await_change()),
            Plan::Requeue(d) => Ok(Action::requeue(d)),
            Plan::Fail => Err(anyhow::anyhow!("simulated failure")),
        }
    }
}

struct Env {
    cluster: Arc<MemoryCluster>,
    registry: Arc<TypeRegistry>,
    alpha: Arc<KindCodec>,
    beta: Arc<KindCodec>,
}

impl Env {
    fn new() -> Self {
        let mut b = RegistryBuilder::new();
        let alpha = b.register(KindCodec::new(ResourceKind::new("test.cao.io", "v1", "Alpha"), "alphas", true)).expect("alpha");
        let beta = b.register(KindCodec::new(ResourceKind::new("test.cao.io", "v1", "Beta"), "betas", true)).expect("beta");
        Self { cluster: Arc::new(MemoryCluster::new()), registry: b.build(), alpha, beta }
    }

    fn manager(&self, opts: ManagerOptions) -> Manager {
        Manager::new(self.cluster.clone(), Arc::clone(&self.registry), opts)
    }

    fn put(&self, codec: &KindCodec, name: &str, n: i64) {
        self.cluster.apply(codec, serde_json::json!({"metadata": {"name": name, "namespace": "ns"}, "spec": {"n": n}}));
    }
}

fn options(workers: usize, backoff: Backoff) -> ControllerOptions {
    ControllerOptions { workers, backoff }
}

fn run(mgr: Manager) -> (CancellationToken, JoinHandle<Result<DrainOutcome, ManagerError>>) {
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(mgr.start(shutdown.clone()));
    (shutdown, handle)
}

async fn next_call(rx: &mut mpsc::UnboundedReceiver<Call>) -> Call {
    timeout(Duration::from_secs(600), rx.recv()).await.expect("reconcile in time").expect("recorder alive")
}

async fn assert_no_call(rx: &mut mpsc::UnboundedReceiver<Call>, within: Duration) {
    if let Ok(Some(call)) = timeout(within, rx.recv()).await {
        panic!("unexpected reconcile: {:?}", call);
    }
}

#[tokio::test(start_paused = true)]
async fn updates_during_a_reconcile_collapse_into_one_pass_on_latest_state() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = rec.working(Duration::from_secs(1), false);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    let first = next_call(&mut calls).await;
    assert_eq!(first.rv, Some(1));
    for n in 1..=3 {
        env.put(&env.alpha, "a", n);
    }
    let second = next_call(&mut calls).await;
    assert_eq!(second.key, first.key);
    assert_eq!(second.rv, Some(4));
    assert_no_call(&mut calls, Duration::from_secs(30)).await;

    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("clean"), DrainOutcome::Clean);
}

#[tokio::test(start_paused = true)]
async fn same_key_never_runs_on_two_workers() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = Arc::new(rec.working(Duration::from_millis(100), false));
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), Arc::clone(&rec))
        .with_options(options(4, Backoff::default()))
        .add_to_manager(&mut mgr)
        .expect("register");
    let (shutdown, handle) = run(mgr);

    for n in 0..20 {
        env.put(&env.alpha, "hot", n);
        env.put(&env.alpha, &format!("cold-{}", n % 3), n);
        sleep(Duration::from_millis(30)).await;
    }
    sleep(Duration::from_secs(5)).await;
    shutdown.cancel();
    handle.await.expect("join").expect("clean");

    let mut hot = 0;
    while let Ok(call) = calls.try_recv() {
        if call.key.name == "hot" {
            hot += 1;
        }
    }
    assert!(!rec.overlap.load(Ordering::SeqCst), "a key was reconciled concurrently");
    assert!(hot >= 2 && hot < 20, "hot key reconciled {} times", hot);
}

#[tokio::test(start_paused = true)]
async fn requeue_after_is_honored() {
    let env = Env::new();
    let passes = AtomicUsize::new(0);
    let (rec, mut calls) =
        Recorder::new(move |_| if passes.fetch_add(1, Ordering::SeqCst) == 0 { Plan::Requeue(Duration::from_secs(10)) } else { Plan::Done });
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    let first = next_call(&mut calls).await;
    let second = next_call(&mut calls).await;
    assert!(second.at - first.at >= Duration::from_secs(10), "requeued after {:?}", second.at - first.at);
    assert_eq!(second.attempt, 0);
    assert_no_call(&mut calls, Duration::from_secs(60)).await;
    shutdown.cancel();
    handle.await.expect("join").expect("clean");
}

#[tokio::test(start_paused = true)]
async fn failures_back_off_without_decreasing_then_recover() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|req| if req.attempt < 4 { Plan::Fail } else { Plan::Done });
    let backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(500), 0.5);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec)
        .with_options(options(1, backoff))
        .add_to_manager(&mut mgr)
        .expect("register");
    env.put(&env.alpha, "flaky", 0);
    let (shutdown, handle) = run(mgr);

    let mut seen = vec![next_call(&mut calls).await];
    for _ in 0..4 {
        seen.push(next_call(&mut calls).await);
    }
    let attempts: Vec<u32> = seen.iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![0, 1, 2, 3, 4]);
    let gaps: Vec<Duration> = seen.windows(2).map(|w| w[1].at - w[0].at).collect();
    for (i, gap) in gaps.iter().enumerate() {
        assert!(*gap >= backoff.nominal(i as u32 + 1), "gap {} was {:?}", i, gap);
        assert!(*gap <= Duration::from_millis(500) + Duration::from_millis(1));
    }
    assert!(gaps.windows(2).all(|w| w[1] >= w[0]), "gaps decreased: {:?}", gaps);
    assert_no_call(&mut calls, Duration::from_secs(60)).await;

    shutdown.cancel();
    handle.await.expect("join").expect("clean");
}

#[tokio::test(start_paused = true)]
async fn deleted_objects_are_still_reconciled() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    assert!(next_call(&mut calls).await.rv.is_some());
    env.cluster.remove(&env.alpha, Some("ns"), "a");
    let gone = next_call(&mut calls).await;
    assert_eq!(gone.key.name, "a");
    assert_eq!(gone.rv, None);

    shutdown.cancel();
    handle.await.expect("join").expect("clean");
}

#[tokio::test(start_paused = true)]
async fn drain_waits_for_in_flight_reconciles() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = rec.working(Duration::from_secs(5), false);
    let mut mgr = env.manager(ManagerOptions { drain_timeout: Duration::from_secs(30), ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let mut state = mgr.subscribe_state();
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    let started = next_call(&mut calls).await.at;
    shutdown.cancel();
    state.wait_for(|s| *s >= OperatorState::Draining).await.expect("draining");
    assert_eq!(handle.await.expect("join").expect("drained"), DrainOutcome::Clean);
    assert!(started.elapsed() >= Duration::from_secs(5));
    assert_eq!(*state.borrow(), OperatorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn drain_timeout_forces_exit() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = rec.working(Duration::from_secs(600), false);
    let mut mgr = env.manager(ManagerOptions { drain_timeout: Duration::from_secs(2), ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "stuck", 0);
    let (shutdown, handle) = run(mgr);

    next_call(&mut calls).await;
    let stop = Instant::now();
    shutdown.cancel();
    let outcome = handle.await.expect("join").expect("drained");
    assert_eq!(outcome, DrainOutcome::Forced);
    assert_eq!(outcome.exit_code(), 1);
    let waited = stop.elapsed();
    assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(600), "waited {:?}", waited);
}

#[tokio::test(start_paused = true)]
async fn reconcilers_observing_cancellation_drain_promptly() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = rec.working(Duration::from_secs(600), true);
    let mut mgr = env.manager(ManagerOptions { drain_timeout: Duration::from_secs(30), ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    next_call(&mut calls).await;
    let stop = Instant::now();
    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("drained"), DrainOutcome::Clean);
    assert!(stop.elapsed() < Duration::from_secs(30));
}

#[tokio::test]
async fn registration_rejects_unknown_kinds_and_duplicate_names() {
    let env = Env::new();
    let mut mgr = env.manager(ManagerOptions::default());
    let unknown = ResourceKind::new("test.cao.io", "v1", "Gamma");

    let (rec, _) = Recorder::new(|_| Plan::Done);
    let err = Controller::new("gamma", unknown.clone(), rec).add_to_manager(&mut mgr).unwrap_err();
    assert!(matches!(err, RegistrationError::UnknownKind { ref kind, .. } if *kind == unknown));

    let (rec, _) = Recorder::new(|_| Plan::Done);
    let err = Controller::new("alpha", env.alpha.kind().clone(), rec)
        .watches(unknown.clone(), |_| Vec::new())
        .add_to_manager(&mut mgr)
        .unwrap_err();
    assert!(matches!(err, RegistrationError::UnknownKind { .. }));

    let (rec, _) = Recorder::new(|_| Plan::Done);
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("first");
    let (rec, _) = Recorder::new(|_| Plan::Done);
    let err = Controller::new("alpha", env.beta.kind().clone(), rec).add_to_manager(&mut mgr).unwrap_err();
    assert!(matches!(err, RegistrationError::DuplicateController(ref n) if n == "alpha"));
    assert_eq!(mgr.controller_names(), vec!["alpha"]);
    assert_eq!(mgr.state(), OperatorState::Initializing);
}

#[tokio::test(start_paused = true)]
async fn controllers_only_see_their_own_kind() {
    let env = Env::new();
    let (rec_a, mut calls_a) = Recorder::new(|_| Plan::Done);
    let (rec_b, mut calls_b) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec_a).add_to_manager(&mut mgr).expect("alpha");
    Controller::new("beta", env.beta.kind().clone(), rec_b).add_to_manager(&mut mgr).expect("beta");
    let mut state = mgr.subscribe_state();
    let (shutdown, handle) = run(mgr);
    state.wait_for(|s| *s == OperatorState::Running).await.expect("running");

    env.put(&env.alpha, "shared-name", 0);
    assert_eq!(next_call(&mut calls_a).await.key.kind, *env.alpha.kind());
    assert_no_call(&mut calls_b, Duration::from_secs(10)).await;

    env.put(&env.beta, "shared-name", 0);
    assert_eq!(next_call(&mut calls_b).await.key.kind, *env.beta.kind());
    assert_no_call(&mut calls_a, Duration::from_secs(10)).await;

    shutdown.cancel();
    handle.await.expect("join").expect("clean");
}

#[tokio::test(start_paused = true)]
async fn secondary_watches_map_to_primary_keys() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let alpha = Arc::clone(&env.alpha);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec)
        .watches(env.beta.kind().clone(), move |ev| vec![alpha.key(ev.key.namespace.as_deref(), "owner")])
        .add_to_manager(&mut mgr)
        .expect("register");
    let (shutdown, handle) = run(mgr);

    env.put(&env.beta, "child", 0);
    let call = next_call(&mut calls).await;
    assert_eq!(call.key, env.alpha.key(Some("ns"), "owner"));
    assert_eq!(call.rv, None);

    shutdown.cancel();
    handle.await.expect("join").expect("clean");
}

#[tokio::test(start_paused = true)]
async fn fatal_watch_error_during_startup_aborts() {
    let env = Env::new();
    env.cluster.fail_next(Op::List, ClientError::Unauthorized("token expired".into()));
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let state = mgr.subscribe_state();
    let (_shutdown, handle) = run(mgr);

    let err = handle.await.expect("join").unwrap_err();
    assert!(matches!(err, ManagerError::Fatal(_)), "{err}");
    assert_eq!(*state.borrow(), OperatorState::Stopped);
    assert!(calls.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn fatal_watch_error_while_running_drains_and_fails() {
    let env = Env::new();
    let (rec, _calls) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let mut state = mgr.subscribe_state();
    let (_shutdown, handle) = run(mgr);
    state.wait_for(|s| *s == OperatorState::Running).await.expect("running");

    env.cluster.fail_next(Op::List, ClientError::Forbidden("rbac revoked".into()));
    env.cluster.disconnect_watches();
    let err = timeout(Duration::from_secs(60), handle).await.expect("in time").expect("join").unwrap_err();
    assert!(matches!(err, ManagerError::Fatal(_)));
    assert_eq!(*state.borrow(), OperatorState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn stop_before_sync_exits_cleanly() {
    let env = Env::new();
    env.cluster.fail_next(Op::List, ClientError::Transport("apiserver unavailable".into()));
    let (rec, _calls) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions::default());
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let state = mgr.subscribe_state();
    let (shutdown, handle) = run(mgr);

    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("clean"), DrainOutcome::Clean);
    assert_eq!(*state.borrow(), OperatorState::Stopped);
}

async fn collect_names(rx: &mut mpsc::UnboundedReceiver<Call>, n: usize) -> HashSet<String> {
    let mut names = HashSet::new();
    while names.len() < n {
        names.insert(next_call(rx).await.key.name);
    }
    names
}

#[tokio::test(start_paused = true)]
async fn initial_list_larger_than_channel_capacity_still_syncs() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let mut mgr = env.manager(ManagerOptions { channel_capacity: 2, ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let mut state = mgr.subscribe_state();
    for n in 0..5 {
        env.put(&env.alpha, &format!("a-{n}"), n);
    }
    let (shutdown, handle) = run(mgr);

    timeout(Duration::from_secs(60), state.wait_for(|s| *s == OperatorState::Running))
        .await
        .expect("synced in time")
        .expect("running");
    let names = collect_names(&mut calls, 5).await;
    assert_eq!(names, (0..5).map(|n| format!("a-{n}")).collect::<HashSet<_>>());

    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("clean"), DrainOutcome::Clean);
}

#[tokio::test(start_paused = true)]
async fn bursts_larger_than_channel_capacity_are_all_reconciled() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Done);
    let rec = rec.working(Duration::from_millis(50), false);
    let mut mgr = env.manager(ManagerOptions { channel_capacity: 2, ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    let mut state = mgr.subscribe_state();
    let (shutdown, handle) = run(mgr);
    state.wait_for(|s| *s == OperatorState::Running).await.expect("running");

    for n in 0..6 {
        env.put(&env.alpha, &format!("b-{n}"), n);
    }
    let names = collect_names(&mut calls, 6).await;
    assert_eq!(names.len(), 6);

    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("clean"), DrainOutcome::Clean);
}

#[tokio::test(start_paused = true)]
async fn requeue_requested_while_draining_is_dropped() {
    let env = Env::new();
    let (rec, mut calls) = Recorder::new(|_| Plan::Requeue(Duration::from_secs(1)));
    let rec = rec.working(Duration::from_secs(1), true);
    let mut mgr = env.manager(ManagerOptions { drain_timeout: Duration::from_secs(30), ..ManagerOptions::default() });
    Controller::new("alpha", env.alpha.kind().clone(), rec).add_to_manager(&mut mgr).expect("register");
    env.put(&env.alpha, "a", 0);
    let (shutdown, handle) = run(mgr);

    next_call(&mut calls).await;
    let stop = Instant::now();
    shutdown.cancel();
    assert_eq!(handle.await.expect("join").expect("drained"), DrainOutcome::Clean);
    assert!(stop.elapsed() < Duration::from_secs(1));
    assert_no_call(&mut calls, Duration::from_secs(10)).await;
}
