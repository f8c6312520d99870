//! In-memory cluster and alloc fakes for scheduler tests.

use async_trait::async_trait;
use oxbow_core::{
    Digest, Error, ExecConfig, ExecResult, File, Fileset, InmemoryRepository, Repository,
    Requirements, Resources, Result,
};
use oxbow_pool::{Alloc, AllocInspect, AllocMeta, Cluster, KeepalivePolicy};
use oxbow_sched::{Scheduler, Task, TaskState};
use rand::RngCore;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Notify};

pub const GIB: f64 = (1u64 << 30) as f64;

/// An allocation request captured by the test cluster; reply to serve it.
pub struct TestClusterRequest {
    pub req: Requirements,
    pub reply: oneshot::Sender<Result<Arc<dyn Alloc>>>,
}

/// A `Cluster` that hands every allocation request to the test body.
pub struct TestCluster {
    max: Resources,
    req_tx: mpsc::UnboundedSender<TestClusterRequest>,
    req_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TestClusterRequest>>,
}

impl TestCluster {
    pub fn new() -> Arc<Self> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            max: Resources::cpu_mem(64.0, 128.0 * GIB),
            req_tx,
            req_rx: tokio::sync::Mutex::new(req_rx),
        })
    }

    /// The next allocation request, within a deadline.
    pub async fn next_req(&self) -> TestClusterRequest {
        tokio::time::timeout(Duration::from_secs(5), async {
            self.req_rx.lock().await.recv().await.expect("cluster request")
        })
        .await
        .expect("timed out waiting for a cluster request")
    }

    /// A request, if one is already queued.
    pub fn try_req(&self) -> Option<TestClusterRequest> {
        self.req_rx.try_lock().ok()?.try_recv().ok()
    }
}

#[async_trait]
impl Cluster for TestCluster {
    fn can_allocate(&self, resources: &Resources) -> Result<()> {
        if self.max.available(resources) {
            Ok(())
        } else {
            Err(Error::resources_exhausted(format!(
                "requested resources {resources} exceed largest type {}",
                self.max
            )))
        }
    }

    async fn allocate(
        &self,
        req: Requirements,
        _labels: BTreeMap<String, String>,
    ) -> Result<Arc<dyn Alloc>> {
        let (reply, rx) = oneshot::channel();
        self.req_tx
            .send(TestClusterRequest { req, reply })
            .map_err(|_| Error::canceled("test cluster gone"))?;
        rx.await.unwrap_or_else(|_| Err(Error::canceled("request dropped")))
    }
}

struct ExecEntry {
    tx: Arc<watch::Sender<Option<ExecResult>>>,
}

/// Handle to one registered exec; complete it to finish the task.
pub struct TestExec {
    tx: Arc<watch::Sender<Option<ExecResult>>>,
}

impl TestExec {
    pub fn complete(&self, result: ExecResult) {
        self.tx.send_replace(Some(result));
    }
}

/// An in-memory alloc with a refcounting repository and externally
/// completed execs.
pub struct TestAlloc {
    id: String,
    resources: Resources,
    repo: Arc<InmemoryRepository>,
    remotes: Mutex<Vec<Arc<InmemoryRepository>>>,
    refcounts: Mutex<HashMap<Digest, i64>>,
    execs: Mutex<HashMap<Digest, ExecEntry>>,
    exec_registered: Notify,
    keepalive_err: Mutex<Option<Error>>,
}

static NEXT_ALLOC: AtomicUsize = AtomicUsize::new(0);

impl TestAlloc {
    pub fn new(resources: Resources) -> Arc<Self> {
        let n = NEXT_ALLOC.fetch_add(1, Ordering::SeqCst);
        Self::with_id(&format!("testalloc-{n}"), resources)
    }

    pub fn with_id(id: &str, resources: Resources) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            resources,
            repo: Arc::new(InmemoryRepository::new(format!("alloc-{id}"))),
            remotes: Mutex::new(Vec::new()),
            refcounts: Mutex::new(HashMap::new()),
            execs: Mutex::new(HashMap::new()),
            exec_registered: Notify::new(),
            keepalive_err: Mutex::new(None),
        })
    }

    /// Register a repository that source URLs may refer to.
    pub fn add_remote(&self, repo: Arc<InmemoryRepository>) {
        self.remotes.lock().unwrap().push(repo);
    }

    /// Make every subsequent keepalive fail with `err`.
    pub fn fail_keepalive(&self, err: Error) {
        *self.keepalive_err.lock().unwrap() = Some(err);
    }

    /// Wait until the scheduler has started `task` here and return its
    /// exec handle.
    pub async fn exec(&self, task: Digest) -> TestExec {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                // Arm the notification before checking, so a registration
                // racing the check still wakes this waiter.
                let registered = self.exec_registered.notified();
                if let Some(entry) = self.execs.lock().unwrap().get(&task) {
                    return TestExec { tx: entry.tx.clone() };
                }
                registered.await;
            }
        })
        .await
        .expect("timed out waiting for exec")
    }

    pub fn has_exec(&self, task: Digest) -> bool {
        self.execs.lock().unwrap().contains_key(&task)
    }

    pub fn alloc_repo(&self) -> Arc<InmemoryRepository> {
        self.repo.clone()
    }

    pub fn refcount_total(&self) -> i64 {
        self.refcounts.lock().unwrap().values().sum()
    }

    async fn fetch_source(&self, source: &str) -> Result<Vec<u8>> {
        let (prefix, digest) = source
            .rsplit_once('/')
            .ok_or_else(|| Error::other(format!("malformed source {source:?}")))?;
        let id: Digest = digest
            .parse()
            .map_err(|_| Error::other(format!("malformed source digest {source:?}")))?;
        let remotes = self.remotes.lock().unwrap().clone();
        for repo in remotes {
            if repo.url() == prefix {
                return repo.get(id).await;
            }
        }
        Err(Error::not_exist(format!("no repository serves {source:?}")))
    }
}

#[async_trait]
impl Alloc for TestAlloc {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn resources(&self) -> Resources {
        self.resources.clone()
    }

    fn repository(&self) -> Arc<dyn Repository> {
        self.repo.clone()
    }

    async fn load(&self, fileset: &Fileset, src: &dyn Repository) -> Result<Fileset> {
        let mut resolved = Fileset::new();
        let mut taken: Vec<Digest> = Vec::new();
        for (name, file) in &fileset.map {
            let fetched = if file.is_resolved() {
                src.get(file.id).await
            } else {
                match &file.source {
                    Some(source) => self.fetch_source(source).await,
                    None => Err(Error::other(format!("file {name} has no id and no source"))),
                }
            };
            let data = match fetched {
                Ok(data) => data,
                Err(err) => {
                    // A load is all-or-nothing: roll back this call's
                    // refcounts before reporting.
                    let mut counts = self.refcounts.lock().unwrap();
                    for id in taken {
                        *counts.entry(id).or_insert(0) -= 1;
                    }
                    return Err(err);
                }
            };
            let size = data.len() as u64;
            let id = self.repo.put(data).await?;
            *self.refcounts.lock().unwrap().entry(id).or_insert(0) += 1;
            taken.push(id);
            resolved.insert(name.clone(), File::resolved(id, size));
        }
        Ok(resolved)
    }

    async fn unload(&self, fileset: &Fileset) -> Result<()> {
        let mut counts = self.refcounts.lock().unwrap();
        for file in fileset.files() {
            if !file.is_resolved() {
                continue;
            }
            let count = counts.entry(file.id).or_insert(0);
            if *count > 0 {
                *count -= 1;
            }
            if *count == 0 {
                self.repo.remove(file.id);
            }
        }
        Ok(())
    }

    async fn put_exec(&self, task: Digest, _config: ExecConfig) -> Result<()> {
        let (tx, _) = watch::channel(None);
        self.execs.lock().unwrap().insert(task, ExecEntry { tx: Arc::new(tx) });
        self.exec_registered.notify_waiters();
        Ok(())
    }

    async fn wait_exec(&self, task: Digest) -> Result<ExecResult> {
        let tx = {
            let execs = self.execs.lock().unwrap();
            execs
                .get(&task)
                .map(|e| e.tx.clone())
                .ok_or_else(|| Error::not_exist(format!("exec {}", task.short())))?
        };
        let mut rx = tx.subscribe();
        let result = rx
            .wait_for(|r| r.is_some())
            .await
            .map_err(|_| Error::canceled("exec dropped"))?;
        Ok(result.clone().unwrap())
    }

    async fn keepalive(&self, interval: Duration) -> Result<Duration> {
        if let Some(err) = self.keepalive_err.lock().unwrap().clone() {
            return Err(err);
        }
        Ok(interval)
    }

    async fn free(&self) -> Result<()> {
        Ok(())
    }

    async fn inspect(&self) -> Result<AllocInspect> {
        Ok(AllocInspect {
            id: self.id.clone(),
            resources: self.resources.clone(),
            expires: chrono::Utc::now(),
            last_keepalive: chrono::Utc::now(),
            meta: AllocMeta::default(),
        })
    }
}

/// A fileset of three random files stored in `repo`.
pub async fn random_fileset(repo: &InmemoryRepository) -> Fileset {
    let mut fs = Fileset::new();
    let mut rng = rand::thread_rng();
    for i in 0..3 {
        let mut data = vec![0u8; 64 + i * 17];
        rng.fill_bytes(&mut data);
        let size = data.len() as u64;
        let id = repo.put(data).await.unwrap();
        fs.insert(format!("file{i}"), File::resolved(id, size));
    }
    fs
}

/// Every file of `fs` is present in `repo`.
pub async fn expect_exists(repo: &dyn Repository, fs: &Fileset) {
    let missing = oxbow_core::repository::missing(repo, &fs.files()).await.unwrap();
    assert!(missing.is_empty(), "missing files: {missing:?}");
}

/// No file of `fs` is present in `repo`.
pub async fn expect_not_exists(repo: &dyn Repository, fs: &Fileset) {
    let missing = oxbow_core::repository::missing(repo, &fs.files()).await.unwrap();
    assert_eq!(missing.len(), fs.len(), "unexpected files present in {}", repo.url());
}

/// A task with the given cpu/mem requirement and priority, owning `repo`.
pub fn new_task(cpu: f64, mem: f64, priority: i32, repo: Arc<InmemoryRepository>) -> Task {
    let config = ExecConfig { resources: Resources::cpu_mem(cpu, mem), ..ExecConfig::default() };
    Task::new(config, repo, priority)
}

/// A scheduler wired to a fresh test cluster, running until the returned
/// guard drops.
pub fn new_scheduler() -> (Scheduler, Arc<TestCluster>, SchedulerGuard) {
    new_scheduler_with(|s| s)
}

pub fn new_scheduler_with(
    configure: impl FnOnce(Scheduler) -> Scheduler,
) -> (Scheduler, Arc<TestCluster>, SchedulerGuard) {
    let cluster = TestCluster::new();
    let keepalive = KeepalivePolicy {
        interval: Duration::from_millis(20),
        retry: oxbow_core::retry::RetryPolicy::exponential(
            Duration::from_millis(5),
            Duration::from_millis(20),
            1.5,
        )
        .with_max_tries(2),
    };
    let cluster_handle: Arc<dyn Cluster> = cluster.clone();
    let scheduler = configure(Scheduler::new(cluster_handle).with_keepalive(keepalive));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let runner = scheduler.clone();
    let handle = tokio::spawn(async move { runner.run(shutdown_rx).await });
    (scheduler, cluster, SchedulerGuard { shutdown_tx: Some(shutdown_tx), handle: Some(handle) })
}

/// Stops the scheduler when dropped.
pub struct SchedulerGuard {
    shutdown_tx: Option<watch::Sender<bool>>,
    handle: Option<tokio::task::JoinHandle<Result<()>>>,
}

impl SchedulerGuard {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for SchedulerGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(true);
        }
    }
}

/// Wait (bounded) for `task` to reach at least `state`.
pub async fn wait_state(task: &Task, state: TaskState) {
    tokio::time::timeout(Duration::from_secs(5), task.wait(state))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {state:?}, task is {:?}", task.state()));
}

/// Wait (bounded) until `pred` holds.
pub async fn wait_until(mut pred: impl FnMut() -> bool) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !pred() {
        assert!(std::time::Instant::now() < deadline, "condition never held");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
