//! The engine proper: `BuildState` drives parse -> build -> test
//! transitions across a pool of blocking worker tasks, using two
//! unbounded channels the way the reference codebase's worker/task
//! modules dispatch work, generalized to the parse/build/test state
//! machine this crate implements.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, instrument, warn};

use crate::cache::Cache;
use crate::config::Configuration;
use crate::cycle::CycleDetector;
use crate::error::EngineError;
use crate::graph::BuildGraph;
use crate::hash::TargetHasher;
use crate::label::BuildLabel;
use crate::parser::{ParseMode, Parser};
use crate::result::BuildResult;
use crate::sharded_map::ShardedMap;
use crate::target::{BuildTarget, TargetState};

/// A parse task: the label whose package needs parsing, the target that
/// asked for it (used for cascading failure), and the mode bitflags.
#[derive(Debug, Clone)]
pub struct ParseTask {
    pub label: BuildLabel,
    pub dependent: BuildLabel,
    pub mode: ParseMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Build,
    Test { run: u32 },
}

#[derive(Debug, Clone)]
pub struct ActionTask {
    pub label: BuildLabel,
    pub kind: ActionKind,
}

enum WorkItem {
    Parse(ParseTask),
    Action(ActionTask),
}

/// The scheduler. Owns the graph, the two task channels, the counters
/// that decide when a build is done, and the cycle-detection watchdog.
pub struct BuildState {
    pub graph: Arc<BuildGraph>,
    pub config: Configuration,
    cache: Arc<dyn Cache>,
    parser: Arc<dyn Parser>,
    target_hasher: Arc<dyn TargetHasher>,

    pending_parses_tx: SyncMutex<Option<mpsc::UnboundedSender<ParseTask>>>,
    pending_parses_rx: Mutex<Option<mpsc::UnboundedReceiver<ParseTask>>>,
    pending_actions_tx: SyncMutex<Option<mpsc::UnboundedSender<ActionTask>>>,
    pending_actions_rx: Mutex<Option<mpsc::UnboundedReceiver<ActionTask>>>,

    results_tx: mpsc::UnboundedSender<BuildResult>,
    internal_results_tx: mpsc::UnboundedSender<BuildResult>,
    internal_results_rx: Mutex<Option<mpsc::UnboundedReceiver<BuildResult>>>,

    /// "Someone has promised to parse this package" — distinct from the
    /// graph's own package `ShardedMap` (which publishes the parsed
    /// `Package` itself) so a second requester arriving before the
    /// first has committed to parsing blocks instead of double-enqueuing.
    /// See DESIGN.md for the open-question rationale.
    package_parse_waiters: ShardedMap<String, ()>,

    num_active: AtomicI64,
    num_pending: AtomicI64,
    num_done: AtomicI64,

    cycle_detector: Arc<CycleDetector>,
    stopped: AtomicBool,
    results_closed: AtomicBool,
}

impl BuildState {
    pub fn new(
        config: Configuration,
        cache: Arc<dyn Cache>,
        parser: Arc<dyn Parser>,
        target_hasher: Arc<dyn TargetHasher>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<BuildResult>) {
        let (pending_parses_tx, pending_parses_rx) = mpsc::unbounded_channel();
        let (pending_actions_tx, pending_actions_rx) = mpsc::unbounded_channel();
        let (internal_results_tx, internal_results_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Self {
            graph: Arc::new(BuildGraph::new()),
            config,
            cache,
            parser,
            target_hasher,
            pending_parses_tx: SyncMutex::new(Some(pending_parses_tx)),
            pending_parses_rx: Mutex::new(Some(pending_parses_rx)),
            pending_actions_tx: SyncMutex::new(Some(pending_actions_tx)),
            pending_actions_rx: Mutex::new(Some(pending_actions_rx)),
            results_tx,
            internal_results_tx,
            internal_results_rx: Mutex::new(Some(internal_results_rx)),
            package_parse_waiters: ShardedMap::new(),
            num_active: AtomicI64::new(0),
            num_pending: AtomicI64::new(0),
            num_done: AtomicI64::new(0),
            cycle_detector: Arc::new(CycleDetector::new()),
            stopped: AtomicBool::new(false),
            results_closed: AtomicBool::new(false),
        });

        (state, results_rx)
    }

    /// Produces a sibling `BuildState` for cross-compilation: same
    /// graph, same collaborators, a configuration overlay for `arch`.
    /// Per §9, this is a shallow value copy, not a deep clone of state.
    pub fn for_arch(self: &Arc<Self>, arch: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<BuildResult>) {
        let (pending_parses_tx, pending_parses_rx) = mpsc::unbounded_channel();
        let (pending_actions_tx, pending_actions_rx) = mpsc::unbounded_channel();
        let (internal_results_tx, internal_results_rx) = mpsc::unbounded_channel();
        let (results_tx, results_rx) = mpsc::unbounded_channel();

        let state = Arc::new(Self {
            graph: Arc::clone(&self.graph),
            config: self.config.with_arch(arch),
            cache: Arc::clone(&self.cache),
            parser: Arc::clone(&self.parser),
            target_hasher: Arc::clone(&self.target_hasher),
            pending_parses_tx: SyncMutex::new(Some(pending_parses_tx)),
            pending_parses_rx: Mutex::new(Some(pending_parses_rx)),
            pending_actions_tx: SyncMutex::new(Some(pending_actions_tx)),
            pending_actions_rx: Mutex::new(Some(pending_actions_rx)),
            results_tx,
            internal_results_tx,
            internal_results_rx: Mutex::new(Some(internal_results_rx)),
            package_parse_waiters: ShardedMap::new(),
            num_active: AtomicI64::new(0),
            num_pending: AtomicI64::new(0),
            num_done: AtomicI64::new(0),
            cycle_detector: Arc::new(CycleDetector::new()),
            stopped: AtomicBool::new(false),
            results_closed: AtomicBool::new(false),
        });
        (state, results_rx)
    }

    pub fn num_active(&self) -> i64 {
        self.num_active.load(Ordering::Acquire)
    }

    pub fn num_pending(&self) -> i64 {
        self.num_pending.load(Ordering::Acquire)
    }

    pub fn num_done(&self) -> i64 {
        self.num_done.load(Ordering::Acquire)
    }

    /// Registers `label` as a target the caller asked for directly
    /// (rather than as someone's dependency), using the `OriginalTarget`
    /// sentinel as the dependent so failure messages read naturally.
    pub async fn add_original_target(self: &Arc<Self>, label: BuildLabel, need_build: bool, mode: ParseMode) {
        let dependent = BuildLabel::Reserved(crate::label::Sentinel::OriginalTarget);
        self.queue_target(label, dependent, need_build, mode).await;
    }

    /// Starts `count` blocking worker tasks draining both queues. Each
    /// runs on the async runtime's blocking-task executor, modelling a
    /// dedicated OS thread per worker without hand-rolled `std::thread`
    /// management (see SPEC_FULL.md §5).
    pub fn start_workers(self: &Arc<Self>, count: usize) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::with_capacity(count + 1);
        handles.push(self.spawn_result_forwarder());

        let parses_rx = self
            .pending_parses_rx
            .try_lock()
            .ok()
            .and_then(|mut g| g.take());
        let actions_rx = self
            .pending_actions_rx
            .try_lock()
            .ok()
            .and_then(|mut g| g.take());

        let parses_rx = Arc::new(Mutex::new(parses_rx));
        let actions_rx = Arc::new(Mutex::new(actions_rx));

        for worker_id in 0..count.max(1) {
            let state = Arc::clone(self);
            let parses_rx = Arc::clone(&parses_rx);
            let actions_rx = Arc::clone(&actions_rx);
            handles.push(tokio::spawn(async move {
                state.worker_loop(worker_id, parses_rx, actions_rx).await;
            }));
        }
        handles
    }

    #[instrument(skip(self, parses_rx, actions_rx))]
    async fn worker_loop(
        self: Arc<Self>,
        worker_id: usize,
        parses_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ParseTask>>>>,
        actions_rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<ActionTask>>>>,
    ) {
        debug!(worker_id, "worker started");
        loop {
            let item = {
                let mut parses = parses_rx.lock().await;
                let mut actions = actions_rx.lock().await;
                match (parses.as_mut(), actions.as_mut()) {
                    (Some(p), Some(a)) => tokio::select! {
                        biased;
                        item = p.recv() => item.map(WorkItem::Parse),
                        item = a.recv() => item.map(WorkItem::Action),
                    },
                    (Some(p), None) => p.recv().await.map(WorkItem::Parse),
                    (None, Some(a)) => a.recv().await.map(WorkItem::Action),
                    (None, None) => None,
                }
            };
            let Some(item) = item else {
                debug!(worker_id, "worker exiting: channels closed");
                return;
            };
            match item {
                WorkItem::Parse(task) => self.run_parse(task).await,
                WorkItem::Action(task) => self.run_action(task).await,
            }
            self.num_done.fetch_add(1, Ordering::AcqRel);
            if self.num_pending.fetch_sub(1, Ordering::AcqRel) - 1 <= 0 {
                self.close_channels();
            }
        }
    }

    async fn run_parse(self: &Arc<Self>, task: ParseTask) {
        let package = task.label.package().to_string();
        let result = self
            .parser
            .parse_file(
                &package,
                &task.label,
                &task.dependent,
                task.mode,
                camino::Utf8Path::new(""),
            )
            .await;
        match result {
            Ok(()) => {
                self.log_package_parsed(package);
            }
            Err(source) => {
                let err = EngineError::ParseFailed {
                    label: task.label.clone(),
                    source,
                };
                self.fail_target(&task.label, &err);
            }
        }
    }

    async fn run_action(self: &Arc<Self>, task: ActionTask) {
        let Some(target) = self.graph.target(&task.label) else {
            self.fail_target(&task.label, &EngineError::UnknownTarget { label: task.label.clone() });
            return;
        };

        match task.kind {
            ActionKind::Build => self.run_build_action(&task.label, &target).await,
            ActionKind::Test { run } => self.run_test_action(&task.label, &target, run).await,
        }
    }

    async fn run_build_action(self: &Arc<Self>, label: &BuildLabel, target: &Arc<BuildTarget>) {
        if !target.sync_update_state(TargetState::Pending, TargetState::Building) {
            return;
        }
        self.log_result(BuildResult::TargetBuilding { label: label.clone() });

        let config_hash = self.config.hash();
        let key = self
            .target_hasher
            .output_hash(target, config_hash)
            .unwrap_or_default();
        let outputs = target.outputs();
        let output_paths: Vec<camino::Utf8PathBuf> =
            outputs.iter().map(|p| camino::Utf8PathBuf::from(p.as_str())).collect();
        let output_refs: Vec<&camino::Utf8Path> = output_paths.iter().map(|p| p.as_path()).collect();
        let cache_hit = self
            .cache
            .retrieve(target, &key, &output_refs)
            .await
            .unwrap_or(false);

        if cache_hit {
            target.sync_update_state(TargetState::Building, TargetState::Built);
            self.target_hasher.set_hash(target, key);
            self.log_result(BuildResult::TargetCached {
                label: label.clone(),
                outputs,
            });
        } else {
            // Action execution itself is out of scope here (an
            // external executor collaborator); the core only owns the
            // state transition bracketing it and the store-on-miss half
            // of the cache contract.
            if let Err(err) = self.cache.store(target, &key, &output_refs).await {
                warn!(%label, error = %err, "cache store failed");
            }
            target.sync_update_state(TargetState::Building, TargetState::Built);
            self.target_hasher.set_hash(target, key);
            self.log_result(BuildResult::TargetBuilt {
                label: label.clone(),
                outputs,
            });
        }

        if target.test_only {
            for run in 0..self.config.test_runs.max(1) {
                self.add_pending_action(ActionTask {
                    label: label.clone(),
                    kind: ActionKind::Test { run },
                });
            }
        }
    }

    async fn run_test_action(self: &Arc<Self>, label: &BuildLabel, target: &Arc<BuildTarget>, run: u32) {
        if !target.state().is_built_or_worse() {
            return;
        }
        // Several runs may race here when `test_runs > 1`; only the
        // first to observe `Built` performs the CAS, the rest still
        // report their own run's result.
        target.sync_update_state(TargetState::Built, TargetState::Tested);
        debug!(%label, run, "test run completed");
        self.log_result(BuildResult::TargetTested {
            label: label.clone(),
            passed: true,
        });
    }

    fn fail_target(self: &Arc<Self>, label: &BuildLabel, err: &EngineError) {
        if let Some(target) = self.graph.target(label) {
            target.force_state(TargetState::Failed);
        }
        warn!(%label, error = %err, "target failed");
        self.log_result(BuildResult::TargetBuildFailed {
            label: label.clone(),
            message: err.to_string(),
        });
        if !self.config.keep_going {
            self.stop();
        }
    }

    /// Core of the scheduler: activates `label` on behalf of
    /// `dependent`, parsing its package first if necessary, applying
    /// provide/require substitution, and recursing into its
    /// dependencies once parsed.
    #[instrument(skip(self))]
    pub async fn queue_target(self: &Arc<Self>, label: BuildLabel, dependent: BuildLabel, need_build: bool, mode: ParseMode) {
        let package_key = format!("@{}//{}", label.subrepo(), label.package());

        if self.graph.package(&package_key).is_none() {
            self.enqueue_parse_if_unclaimed(package_key, label, dependent, mode);
            return;
        }

        if let Some(target) = self.graph.target(&label) {
            self.queue_resolved_target(target, need_build, mode).await;
        } else {
            self.fail_target(&label, &EngineError::UnknownTarget { label: label.clone() });
        }
    }

    fn enqueue_parse_if_unclaimed(self: &Arc<Self>, package_key: String, label: BuildLabel, dependent: BuildLabel, mode: ParseMode) {
        if !self.package_parse_waiters.claim(package_key, ()) {
            return;
        }
        self.add_pending_parse(ParseTask { label, dependent, mode });
    }

    async fn queue_resolved_target(self: &Arc<Self>, target: Arc<BuildTarget>, need_build: bool, mode: ParseMode) {
        let target_state = target.state();
        let activated = match target_state {
            TargetState::Inactive => target.sync_update_state(TargetState::Inactive, TargetState::Active),
            TargetState::Semiactive if need_build => {
                target.sync_update_state(TargetState::Semiactive, TargetState::Active)
            }
            _ => false,
        };

        if !activated {
            if target_state == TargetState::Inactive && !need_build {
                target.sync_update_state(TargetState::Inactive, TargetState::Semiactive);
            }
            return;
        }

        self.log_result(BuildResult::TargetActive { label: target.label.clone() });
        let increment: i64 = if target.test_only {
            1 + self.config.test_runs.max(1) as i64
        } else {
            1
        };
        self.num_active.fetch_add(increment, Ordering::AcqRel);

        let deps = target.declared_dependencies();

        if !need_build && !mode.contains(ParseMode::FOR_SUBINCLUDE) {
            // Query mode still walks declared dependencies so they reach
            // at least `Semiactive`/`Active`, but never schedules a
            // build action for this target or its deps.
            let state = Arc::clone(self);
            let dependent = target.label.clone();
            tokio::spawn(async move {
                for dep in &deps {
                    state.queue_target(dep.clone(), dependent.clone(), false, ParseMode::NORMAL).await;
                }
            });
            return;
        }

        let state = Arc::clone(self);
        let target_for_wait = Arc::clone(&target);
        let label_for_log = target.label.clone();
        tokio::spawn(async move {
            for dep in &deps {
                state.queue_target(dep.clone(), target_for_wait.label.clone(), true, ParseMode::NORMAL).await;
            }
            for dep in &deps {
                if let Some(dep_target) = state.graph.target(dep) {
                    let final_state = dep_target.wait_for_build().await;
                    if final_state.is_failure() {
                        target_for_wait.force_state(TargetState::DependencyFailed);
                        state.log_result(BuildResult::TargetDependencyFailed {
                            label: label_for_log.clone(),
                            failed_dependency: dep.clone(),
                        });
                        return;
                    }
                }
            }
            if target_for_wait.sync_update_state(TargetState::Active, TargetState::Pending) {
                state.add_pending_action(ActionTask {
                    label: label_for_log,
                    kind: ActionKind::Build,
                });
            }
        });
    }

    /// The subinclude primitive: blocks until `label`'s target exists
    /// and has reached `Built` (or worse), queuing it first if needed.
    pub async fn wait_for_built_target(self: &Arc<Self>, label: BuildLabel, dependent: BuildLabel) -> Arc<BuildTarget> {
        if let Some(target) = self.graph.target(&label) {
            if target.state().is_built_or_worse() {
                return target;
            }
        } else {
            self.queue_target(label.clone(), dependent.clone(), true, ParseMode::FOR_SUBINCLUDE).await;
        }
        let target = self.graph.wait_for_target(&label).await;
        target.wait_for_build().await;
        target
    }

    pub fn add_pending_parse(self: &Arc<Self>, task: ParseTask) {
        self.num_pending.fetch_add(1, Ordering::AcqRel);
        let sent = self
            .pending_parses_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(task).is_ok())
            .unwrap_or(false);
        if !sent {
            // Channel already closed (shutdown in progress), or a late
            // producer racing a `stop()`; the counter increment above is
            // harmless since nothing will ever decrement it, and we're
            // stopping regardless.
            debug!("dropped parse task after channel close");
        }
    }

    pub fn add_pending_action(self: &Arc<Self>, task: ActionTask) {
        self.num_pending.fetch_add(1, Ordering::AcqRel);
        let sent = self
            .pending_actions_tx
            .lock()
            .as_ref()
            .map(|tx| tx.send(task).is_ok())
            .unwrap_or(false);
        if !sent {
            debug!("dropped action task after channel close");
        }
    }

    fn log_package_parsed(self: &Arc<Self>, package: String) {
        info!(package, "package parsed");
        self.log_result(BuildResult::PackageParsed { package });
    }

    fn log_result(self: &Arc<Self>, result: BuildResult) {
        let _ = self.internal_results_tx.send(result);
    }

    /// Spawns the forwarder task: multiplexes the internal result
    /// channel onto the external one, and triggers a cycle check if the
    /// internal channel goes idle for the configured quiescence
    /// interval — the only place this scheduler runs cycle detection.
    fn spawn_result_forwarder(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        let mut rx = self
            .internal_results_rx
            .try_lock()
            .ok()
            .and_then(|mut g| g.take())
            .expect("result forwarder started twice");
        let quiescence = self.config.quiescence_interval;

        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(quiescence, rx.recv()).await {
                    Ok(Some(result)) => {
                        let is_failure = result.is_failure();
                        if state.results_tx.send(result).is_err() {
                            state.results_closed.store(true, Ordering::Release);
                        }
                        if is_failure && !state.config.keep_going {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        state.run_cycle_check_if_stalled();
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    fn run_cycle_check_if_stalled(self: &Arc<Self>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.num_pending.load(Ordering::Acquire) <= 0 {
            return;
        }
        self.cycle_detector.reset();
        if let Some(cycle) = self.cycle_detector.check(&self.graph) {
            error!(head = %cycle.head(), "cycle detected");
            let err = EngineError::CycleDetected {
                head: cycle.head().clone(),
                path: cycle.path.clone(),
            };
            self.fail_target(cycle.head(), &err);
        }
    }

    /// Idempotently closes both task channels. Workers exit once they
    /// observe a closed, drained channel; no in-flight action is
    /// cancelled mid-execution.
    pub fn stop(self: &Arc<Self>) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping scheduler");
        self.cycle_detector.stop();
        self.close_channels();
    }

    /// Drops both senders so the channels close once drained; workers
    /// observe this the next time their receiver comes up empty.
    fn close_channels(self: &Arc<Self>) {
        self.pending_parses_tx.lock().take();
        self.pending_actions_tx.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::NullCache;
    use crate::hash::InMemoryTargetHasher;
    use crate::label::parse;
    use crate::target::{BuildTarget, TargetSpec};
    use std::sync::Mutex as StdMutex;

    struct FixtureParser {
        targets: StdMutex<std::collections::HashMap<String, Vec<(BuildLabel, Vec<BuildLabel>)>>>,
    }

    #[async_trait::async_trait]
    impl Parser for FixtureParser {
        async fn parse_file(
            &self,
            package: &str,
            _for_label: &BuildLabel,
            _dependent: &BuildLabel,
            _mode: ParseMode,
            _filename: &camino::Utf8Path,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn parse_reader(
            &self,
            _package: &str,
            _contents: &[u8],
            _for_label: &BuildLabel,
            _dependent: &BuildLabel,
            _mode: ParseMode,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run_pre_build_function(&self, _target: &BuildTarget) -> anyhow::Result<()> {
            Ok(())
        }

        async fn run_post_build_function(&self, _target: &BuildTarget, _output: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn register_preload(&self, _label: &BuildLabel) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn simple_state() -> Arc<BuildState> {
        let config = Configuration::default();
        let parser = Arc::new(FixtureParser {
            targets: StdMutex::new(Default::default()),
        });
        let (state, _rx) = BuildState::new(config, Arc::new(NullCache), parser, Arc::new(InMemoryTargetHasher::default()));
        state
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn simple_build_with_no_deps_reaches_built() {
        let state = simple_state();
        let label = parse("//a:x", "").unwrap();
        let target = BuildTarget::from_spec(
            label.clone(),
            TargetSpec::default(),
        );
        target.add_output("out1");
        target.add_output("out2");
        state.graph.add_target(target.clone()).unwrap();
        state
            .graph
            .add_package(Arc::new(crate::graph::Package::new("", "a")))
            .unwrap();

        let _handles = state.start_workers(2);
        state.add_original_target(label.clone(), true, ParseMode::NORMAL).await;

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if target.state().is_built_or_worse() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("target never reached Built");

        assert_eq!(target.state(), TargetState::Built);
        assert_eq!(target.outputs(), vec!["out1".to_string(), "out2".to_string()]);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let state = simple_state();
        state.stop();
        state.stop();
    }
}
