//! The task scheduler
//!
//! One logical thread of control owns all scheduler state. Everything that
//! blocks (staging, execs, keepalives, cluster allocation) runs in
//! spawned tasks that report back over the event channel, so the loop never
//! holds its state across an RPC.

use crate::stats::{Stats, StatsSnapshot};
use crate::task::{Task, TaskState};
use oxbow_core::blob::Mux;
use oxbow_core::retry::RetryPolicy;
use oxbow_core::{
    Digest, Error, ErrorKind, ExecKind, ExecResult, File, Fileset, Repository, Requirements,
    Resources, Result,
};
use oxbow_pool::{keepalive_loop, Alloc, Cluster, KeepalivePolicy};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Retries of a lost task before it is failed for good.
const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Consecutive no-progress retry rounds before a direct transfer aborts.
const DIRECT_STALL_ROUNDS: usize = 3;
/// Wait before re-requesting an alloc after a cluster error.
const REREQUEST_DELAY: Duration = Duration::from_millis(500);

enum Event {
    /// An exec path finished (successfully or not) on an alloc.
    TaskDone { task: Task, alloc_id: String, result: ExecResult },
    /// An alloc's keepalive gave up.
    AllocDead { alloc_id: String, err: Error },
    /// A direct transfer attempt concluded.
    DirectDone { task: Task, outcome: DirectOutcome },
    /// Re-examine pending work (delayed after a cluster error).
    Poke,
}

enum DirectOutcome {
    Done(Fileset),
    /// Not transferable directly; route through an alloc.
    Fallback(Error),
    Failed(Error),
}

struct AllocState {
    alloc: Arc<dyn Alloc>,
    free: Resources,
    tasks: HashMap<Digest, (Task, JoinHandle<()>)>,
    keepalive: JoinHandle<()>,
}

/// Accepts submitted tasks and drives them to completion against the
/// cluster's allocs.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

struct Inner {
    cluster: Arc<dyn Cluster>,
    mux: Mux,
    keepalive: KeepalivePolicy,
    labels: BTreeMap<String, String>,
    max_attempts: u32,
    stats: Arc<Stats>,
    submit_tx: mpsc::UnboundedSender<Task>,
    submit_rx: Mutex<Option<mpsc::UnboundedReceiver<Task>>>,
}

impl Scheduler {
    pub fn new(cluster: Arc<dyn Cluster>) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                cluster,
                mux: Mux::new(),
                keepalive: KeepalivePolicy::default(),
                labels: BTreeMap::new(),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                stats: Arc::new(Stats::default()),
                submit_tx,
                submit_rx: Mutex::new(Some(submit_rx)),
            }),
        }
    }

    /// The blob mux used for direct transfers. With the default empty mux,
    /// every direct transfer reports `NotSupported` and externs take the
    /// alloc path.
    pub fn with_mux(mut self, mux: Mux) -> Self {
        self.inner_mut().mux = mux;
        self
    }

    pub fn with_keepalive(mut self, policy: KeepalivePolicy) -> Self {
        self.inner_mut().keepalive = policy;
        self
    }

    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.inner_mut().labels = labels;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.inner_mut().max_attempts = max_attempts.max(1);
        self
    }

    fn inner_mut(&mut self) -> &mut Inner {
        Arc::get_mut(&mut self.inner).expect("configure the scheduler before cloning it")
    }

    /// Queue tasks for execution.
    pub fn submit(&self, tasks: impl IntoIterator<Item = Task>) {
        for task in tasks {
            let _ = self.inner.submit_tx.send(task);
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    /// Drive the scheduler until `shutdown` fires (or its sender drops).
    /// May be called once.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut submit_rx = {
            let mut slot = self.inner.submit_rx.lock().unwrap();
            slot.take().ok_or_else(|| Error::fatal("scheduler already running"))?
        };
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();
        let (alloc_tx, mut alloc_rx) = mpsc::unbounded_channel::<Result<Arc<dyn Alloc>>>();

        let mut pending: Vec<Task> = Vec::new();
        let mut allocs: BTreeMap<String, AllocState> = BTreeMap::new();
        let mut request_inflight = false;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                submitted = submit_rx.recv() => {
                    let Some(task) = submitted else { break };
                    self.handle_submit(task, &mut pending, &event_tx);
                    // Drain whatever arrived with it.
                    while let Ok(task) = submit_rx.try_recv() {
                        self.handle_submit(task, &mut pending, &event_tx);
                    }
                }
                arrival = alloc_rx.recv() => {
                    request_inflight = false;
                    match arrival {
                        Some(Ok(alloc)) => self.add_alloc(alloc, &mut allocs, &event_tx),
                        Some(Err(err)) => {
                            warn!(error = %err, "cluster allocation failed");
                            let event_tx = event_tx.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(REREQUEST_DELAY).await;
                                let _ = event_tx.send(Event::Poke);
                            });
                        }
                        None => break,
                    }
                }
                event = event_rx.recv() => {
                    let Some(event) = event else { break };
                    self.handle_event(event, &mut pending, &mut allocs, &event_tx);
                }
            }
            self.assign(&mut pending, &mut allocs, &event_tx);
            if !pending.is_empty() && !request_inflight {
                request_inflight = true;
                let req = requirements(&pending);
                debug!(req = %req, pending = pending.len(), "requesting alloc");
                let cluster = self.inner.cluster.clone();
                let labels = self.inner.labels.clone();
                let alloc_tx = alloc_tx.clone();
                tokio::spawn(async move {
                    let result = cluster.allocate(req, labels).await;
                    let _ = alloc_tx.send(result);
                });
            }
        }

        for (_, state) in allocs {
            state.keepalive.abort();
            for (_, (_, handle)) in state.tasks {
                handle.abort();
            }
            let alloc = state.alloc;
            tokio::spawn(async move {
                if let Err(err) = alloc.free().await {
                    debug!(alloc = %alloc.id(), error = %err, "free on shutdown");
                }
            });
        }
        Ok(())
    }

    fn transition(&self, task: &Task, state: TaskState) {
        // Stats first: anyone woken by the state change sees them current.
        self.inner.stats.task_state(task.id(), state);
        task.set_state(state);
    }

    fn handle_submit(&self, task: Task, pending: &mut Vec<Task>, event_tx: &mpsc::UnboundedSender<Event>) {
        self.inner.stats.task_submitted(task.id());

        // Extern tasks try a direct blob transfer before consuming any
        // cluster capacity.
        if task.kind() == ExecKind::Extern && !task.non_direct_transfer() {
            let mux = self.inner.mux.clone();
            let event_tx = event_tx.clone();
            let this = self.clone();
            let t = task.clone();
            tokio::spawn(async move {
                this.transition(&t, TaskState::Running);
                let outcome = direct_transfer(&t, &mux).await;
                let _ = event_tx.send(Event::DirectDone { task: t, outcome });
            });
            return;
        }

        if let Err(err) = self.inner.cluster.can_allocate(task.resources()) {
            // Too big for any instance type: fail fast, no cluster request.
            task.set_err(err);
            self.transition(&task, TaskState::Done);
            return;
        }
        pending.push(task);
    }

    fn add_alloc(
        &self,
        alloc: Arc<dyn Alloc>,
        allocs: &mut BTreeMap<String, AllocState>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        let alloc_id = alloc.id();
        debug!(alloc = %alloc_id, resources = %alloc.resources(), "alloc acquired");
        self.inner.stats.alloc_added(&alloc_id);
        let keepalive = {
            let alloc = alloc.clone();
            let policy = self.inner.keepalive.clone();
            let event_tx = event_tx.clone();
            let alloc_id = alloc_id.clone();
            tokio::spawn(async move {
                let err = keepalive_loop(alloc, policy).await;
                let _ = event_tx.send(Event::AllocDead { alloc_id, err });
            })
        };
        allocs.insert(
            alloc_id,
            AllocState {
                free: alloc.resources(),
                alloc,
                tasks: HashMap::new(),
                keepalive,
            },
        );
    }

    fn handle_event(
        &self,
        event: Event,
        pending: &mut Vec<Task>,
        allocs: &mut BTreeMap<String, AllocState>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        match event {
            Event::Poke => {}
            Event::TaskDone { task, alloc_id, result } => {
                // An alloc that died out from under the exec has already
                // put its tasks back in the queue.
                let Some(state) = allocs.get_mut(&alloc_id) else { return };
                state.tasks.remove(&task.id());
                state.free.add(task.resources());
                match result.err {
                    None => {
                        task.set_result(result);
                        self.transition(&task, TaskState::Done);
                    }
                    Some(err)
                        if matches!(
                            err.kind(),
                            ErrorKind::Network | ErrorKind::Canceled | ErrorKind::Unavailable
                        ) =>
                    {
                        self.lose_task(&task, &alloc_id, err, pending);
                    }
                    Some(err) => {
                        // Fatal and unclassified errors are not retried.
                        task.set_err(err);
                        self.transition(&task, TaskState::Done);
                    }
                }
            }
            Event::AllocDead { alloc_id, err } => {
                let Some(state) = allocs.remove(&alloc_id) else { return };
                warn!(alloc = %alloc_id, error = %err, "alloc lost");
                state.keepalive.abort();
                for (_, (task, handle)) in state.tasks {
                    handle.abort();
                    self.lose_task(&task, &alloc_id, err.clone(), pending);
                }
            }
            Event::DirectDone { task, outcome } => match outcome {
                DirectOutcome::Done(fileset) => {
                    task.set_result(ExecResult::ok(fileset));
                    self.transition(&task, TaskState::Done);
                }
                DirectOutcome::Fallback(err) => {
                    debug!(task = %task.id().short(), error = %err, "direct transfer not possible, using alloc path");
                    task.set_err(err);
                    task.mark_non_direct();
                    self.transition(&task, TaskState::Lost);
                    // Re-submission: the task runs the normal alloc path
                    // (and is counted again).
                    self.handle_submit(task, pending, event_tx);
                }
                DirectOutcome::Failed(err) => {
                    task.set_result(ExecResult::error(err.clone()));
                    task.set_err(err);
                    self.transition(&task, TaskState::Done);
                }
            },
        }
    }

    fn lose_task(&self, task: &Task, alloc_id: &str, err: Error, pending: &mut Vec<Task>) {
        let attempt = task.bump_attempt();
        if attempt >= self.inner.max_attempts {
            task.set_err(Error::wrap(ErrorKind::Other, format!("task lost {attempt} times"), err));
            self.transition(task, TaskState::Done);
            return;
        }
        debug!(task = %task.id().short(), attempt, error = %err, "task lost, retrying");
        task.set_last_alloc(alloc_id);
        self.transition(task, TaskState::Lost);
        self.transition(task, TaskState::Init);
        pending.push(task.clone());
    }

    /// Pack pending tasks into free alloc capacity: priority first (lower
    /// values are more urgent), then smallest resource vector, then id.
    fn assign(
        &self,
        pending: &mut Vec<Task>,
        allocs: &mut BTreeMap<String, AllocState>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) {
        if pending.is_empty() || allocs.is_empty() {
            return;
        }
        pending.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.resources().cmp_size(b.resources()))
                .then_with(|| a.id().cmp(&b.id()))
        });
        let mut unplaced = Vec::new();
        for task in pending.drain(..) {
            // A retried task must land on a different alloc than the one
            // that lost it.
            let excluded = task.last_alloc();
            let slot = allocs.iter_mut().find(|(id, state)| {
                Some(id.as_str()) != excluded.as_deref() && state.free.available(task.resources())
            });
            match slot {
                Some((_, state)) => {
                    state.free.sub(task.resources());
                    let handle = self.spawn_task(task.clone(), state.alloc.clone(), event_tx);
                    state.tasks.insert(task.id(), (task, handle));
                }
                None => unplaced.push(task),
            }
        }
        *pending = unplaced;
    }

    fn spawn_task(
        &self,
        task: Task,
        alloc: Arc<dyn Alloc>,
        event_tx: &mpsc::UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let alloc_id = alloc.id();
            let result = this.run_task(&task, alloc).await;
            let _ = event_tx.send(Event::TaskDone { task, alloc_id, result });
        })
    }

    /// Stage inputs, run the exec, and copy outputs back. Refcounts taken
    /// by loading are released before returning, whatever the outcome.
    async fn run_task(&self, task: &Task, alloc: Arc<dyn Alloc>) -> ExecResult {
        self.transition(task, TaskState::Staging);
        let repo = task.repository();

        let mut loaded: Vec<Fileset> = Vec::new();
        let mut config = task.config().clone();
        for arg in &mut config.args {
            let Some(fileset) = &arg.fileset else { continue };
            match alloc.load(fileset, repo.as_ref()).await {
                Ok(resolved) => {
                    loaded.push(resolved.clone());
                    arg.fileset = Some(resolved);
                }
                Err(err) => {
                    // Roll back what made it in before the failure.
                    for fs in &loaded {
                        if let Err(uerr) = alloc.unload(fs).await {
                            warn!(error = %uerr, "unload after failed staging");
                        }
                    }
                    return ExecResult::error(Error::wrap(
                        err.kind(),
                        "staging inputs",
                        err,
                    ));
                }
            }
        }

        self.transition(task, TaskState::Running);
        let mut result = match self.execute(task, &alloc, config).await {
            Ok(result) => result,
            Err(err) => ExecResult::error(err),
        };

        if result.err.is_none() {
            if let Err(err) = self.deliver_outputs(task, &alloc, &result.fileset).await {
                result = ExecResult::error(err);
            } else if let Err(err) = alloc.unload(&result.fileset).await {
                warn!(error = %err, "unload outputs");
            }
        }
        for fs in &loaded {
            if let Err(err) = alloc.unload(fs).await {
                warn!(error = %err, "unload inputs");
            }
        }
        result
    }

    async fn execute(
        &self,
        task: &Task,
        alloc: &Arc<dyn Alloc>,
        config: oxbow_core::ExecConfig,
    ) -> Result<ExecResult> {
        alloc.put_exec(task.id(), config).await?;
        alloc.wait_exec(task.id()).await
    }

    /// Copy the result fileset from the alloc's repository into the
    /// caller's.
    async fn deliver_outputs(
        &self,
        task: &Task,
        alloc: &Arc<dyn Alloc>,
        fileset: &Fileset,
    ) -> Result<()> {
        let src = alloc.repository();
        let dst = task.repository();
        for file in fileset.files() {
            if !file.is_resolved() {
                continue;
            }
            let data = src.get(file.id).await?;
            dst.put(data).await?;
        }
        Ok(())
    }
}

/// Aggregate requirements over `tasks`: `min` is the element-wise maximum,
/// and the width counts how many extra `min`-sized slices the set needs
/// beyond the first, by first-fit-decreasing packing (floored at 1).
pub fn requirements(tasks: &[Task]) -> Requirements {
    let mut min = Resources::new();
    for task in tasks {
        min.max_with(task.resources());
    }
    let mut sizes: Vec<&Resources> = tasks.iter().map(|t| t.resources()).collect();
    sizes.sort_by(|a, b| b.cmp_size(a));
    let mut bins: Vec<Resources> = Vec::new();
    for size in sizes {
        match bins.iter_mut().find(|free| free.available(size)) {
            Some(free) => free.sub(size),
            None => {
                let mut free = min.clone();
                free.sub(size);
                bins.push(free);
            }
        }
    }
    Requirements::new(min, bins.len().saturating_sub(1).max(1))
}

/// Transfer an extern task's filesets straight from their blob locations
/// to the destination URL, bypassing allocs.
async fn direct_transfer(task: &Task, mux: &Mux) -> DirectOutcome {
    let Some(dst_base) = task.config().url.clone() else {
        return DirectOutcome::Fallback(Error::not_supported("extern task has no destination url"));
    };
    if !mux.supports(&dst_base) {
        return DirectOutcome::Fallback(Error::not_supported(format!(
            "destination {dst_base:?} not reachable by blob mux"
        )));
    }
    let repo = task.repository();
    let Some(locator) = repo.blob_locator() else {
        return DirectOutcome::Fallback(Error::not_supported(format!(
            "repository {} does not locate blobs",
            repo.url()
        )));
    };

    struct Entry {
        name: String,
        src: String,
        id: Digest,
    }
    let mut remaining = Vec::new();
    for arg in &task.config().args {
        let Some(fileset) = &arg.fileset else { continue };
        for (name, file) in &fileset.map {
            let src = if file.is_resolved() {
                match locator.location(file.id) {
                    Some(loc) => loc,
                    None => {
                        return DirectOutcome::Fallback(Error::not_supported(format!(
                            "no blob location for {}",
                            file.id.short()
                        )))
                    }
                }
            } else {
                match &file.source {
                    Some(src) => src.clone(),
                    None => {
                        return DirectOutcome::Failed(Error::other(format!(
                            "file {name} has neither id nor source"
                        )))
                    }
                }
            };
            if !mux.supports(&src) {
                return DirectOutcome::Fallback(Error::not_supported(format!(
                    "source {src:?} not reachable by blob mux"
                )));
            }
            remaining.push(Entry { name: name.clone(), src, id: file.id });
        }
    }

    let dst_base = dst_base.trim_end_matches('/').to_string();
    let retry = RetryPolicy::exponential(Duration::from_millis(20), Duration::from_secs(2), 2.0)
        .with_jitter(0.2);
    let mut done = Fileset::new();
    let mut stalled_rounds = 0usize;
    let mut round = 0usize;
    while !remaining.is_empty() {
        let mut next = Vec::new();
        let mut progressed = false;
        for entry in remaining {
            let dst = format!("{}/{}", dst_base, entry.name);
            match mux.transfer(&dst, &entry.src).await {
                Ok(()) => {
                    let size = mux.stat(&entry.src).await.unwrap_or(0);
                    done.insert(
                        entry.name.clone(),
                        File { id: entry.id, size, source: Some(dst) },
                    );
                    progressed = true;
                }
                Err(err) if err.is(ErrorKind::Temporary) => {
                    debug!(name = %entry.name, error = %err, "direct transfer retry");
                    next.push(entry);
                }
                Err(err) => return DirectOutcome::Failed(err),
            }
        }
        remaining = next;
        if remaining.is_empty() {
            break;
        }
        if progressed {
            stalled_rounds = 0;
        } else {
            stalled_rounds += 1;
            if stalled_rounds >= DIRECT_STALL_ROUNDS {
                return DirectOutcome::Failed(Error::temporary(format!(
                    "direct transfer: progress stalled for retryable errors ({} files left)",
                    remaining.len()
                )));
            }
        }
        if let Some(wait) = retry.wait(round) {
            tokio::time::sleep(wait).await;
        }
        round += 1;
    }
    DirectOutcome::Done(done)
}
