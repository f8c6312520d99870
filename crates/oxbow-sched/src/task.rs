//! Tasks
//!
//! A [`Task`] is one resource-tagged unit of work travelling through the
//! scheduler:
//!
//! ```text
//! init -> staging -> running -> done
//!   ^        |          |
//!   +--------+--- lost -+        (retry, attempt += 1)
//! ```
//!
//! Progression is monotone except for two back-edges: `lost -> init` on
//! retry, and `running -> init` exactly once when an extern task falls back
//! from direct transfer to the alloc path.

use oxbow_core::{Digest, Error, ExecConfig, ExecKind, ExecResult, Repository, Resources};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

/// Scheduler-visible task states.
///
/// `Init`, `Staging`, `Running`, and `Done` form the forward progression;
/// `Lost` is the retry detour off that ladder. A task can become lost from
/// any non-terminal state (a staging failure loses a task that never ran),
/// so `Lost` carries no progression rank of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Init,
    Staging,
    Running,
    Lost,
    Done,
}

impl TaskState {
    /// Position on the forward progression; `None` for the lost detour.
    fn rank(self) -> Option<u8> {
        match self {
            TaskState::Init => Some(0),
            TaskState::Staging => Some(1),
            TaskState::Running => Some(2),
            TaskState::Done => Some(3),
            TaskState::Lost => None,
        }
    }

    /// Whether a task currently in `self` satisfies a wait for `target`.
    ///
    /// Progression targets are satisfied by their own state or anything
    /// past it on the ladder; `Done` therefore releases every waiter.
    /// `Lost` satisfies only a wait for `Lost` itself: a task that was
    /// lost before running has not run.
    pub fn reaches(self, target: TaskState) -> bool {
        if target == TaskState::Lost {
            return self == TaskState::Lost;
        }
        match (self.rank(), target.rank()) {
            (Some(cur), Some(want)) => cur >= want,
            _ => false,
        }
    }
}

#[derive(Default)]
struct TaskMut {
    attempt: u32,
    result: ExecResult,
    err: Option<Error>,
    non_direct_transfer: bool,
    last_alloc: Option<String>,
}

struct TaskInner {
    id: Digest,
    config: ExecConfig,
    priority: i32,
    repo: Arc<dyn Repository>,
    state: watch::Sender<TaskState>,
    mu: Mutex<TaskMut>,
}

/// A handle to one scheduled task. Cheap to clone; all clones observe the
/// same state.
#[derive(Clone)]
pub struct Task {
    inner: Arc<TaskInner>,
}

impl Task {
    /// A new task owning `repo` as the repository its inputs come from and
    /// its outputs return to. Lower `priority` values are more urgent;
    /// the default is 0.
    pub fn new(config: ExecConfig, repo: Arc<dyn Repository>, priority: i32) -> Self {
        let (state, _) = watch::channel(TaskState::Init);
        Self {
            inner: Arc::new(TaskInner {
                id: Digest::random(),
                config,
                priority,
                repo,
                state,
                mu: Mutex::new(TaskMut::default()),
            }),
        }
    }

    pub fn id(&self) -> Digest {
        self.inner.id
    }

    pub fn config(&self) -> &ExecConfig {
        &self.inner.config
    }

    pub fn kind(&self) -> ExecKind {
        self.inner.config.kind
    }

    pub fn priority(&self) -> i32 {
        self.inner.priority
    }

    pub fn resources(&self) -> &Resources {
        &self.inner.config.resources
    }

    pub fn repository(&self) -> Arc<dyn Repository> {
        self.inner.repo.clone()
    }

    pub fn state(&self) -> TaskState {
        *self.inner.state.borrow()
    }

    /// Wait until the task's state satisfies `state` per
    /// [`TaskState::reaches`]: progression states resolve at or past the
    /// target, `Lost` resolves only while the task is actually lost.
    pub async fn wait(&self, state: TaskState) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in self, so the channel cannot close.
        let _ = rx.wait_for(|s| s.reaches(state)).await;
    }

    /// How many times this task has been retried after loss.
    pub fn attempt(&self) -> u32 {
        self.inner.mu.lock().unwrap().attempt
    }

    pub fn err(&self) -> Option<Error> {
        self.inner.mu.lock().unwrap().err.clone()
    }

    pub fn result(&self) -> ExecResult {
        self.inner.mu.lock().unwrap().result.clone()
    }

    /// Whether an extern task has already failed its direct transfer and
    /// must go through an alloc.
    pub fn non_direct_transfer(&self) -> bool {
        self.inner.mu.lock().unwrap().non_direct_transfer
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.inner.state.send_replace(state);
    }

    pub(crate) fn bump_attempt(&self) -> u32 {
        let mut mu = self.inner.mu.lock().unwrap();
        mu.attempt += 1;
        mu.attempt
    }

    pub(crate) fn set_err(&self, err: Error) {
        self.inner.mu.lock().unwrap().err = Some(err);
    }

    pub(crate) fn set_result(&self, result: ExecResult) {
        self.inner.mu.lock().unwrap().result = result;
    }

    pub(crate) fn mark_non_direct(&self) {
        self.inner.mu.lock().unwrap().non_direct_transfer = true;
    }

    pub(crate) fn set_last_alloc(&self, alloc_id: &str) {
        self.inner.mu.lock().unwrap().last_alloc = Some(alloc_id.to_string());
    }

    pub(crate) fn last_alloc(&self) -> Option<String> {
        self.inner.mu.lock().unwrap().last_alloc.clone()
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id.short())
            .field("state", &self.state())
            .field("resources", self.resources())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxbow_core::InmemoryRepository;

    fn task() -> Task {
        let config = ExecConfig {
            resources: Resources::cpu_mem(1.0, 1.0),
            ..ExecConfig::default()
        };
        Task::new(config, Arc::new(InmemoryRepository::new("t")), 0)
    }

    #[tokio::test]
    async fn wait_resolves_at_or_past_the_state() {
        let t = task();
        t.set_state(TaskState::Running);
        t.wait(TaskState::Staging).await;
        t.wait(TaskState::Running).await;
        assert_eq!(t.state(), TaskState::Running);
    }

    #[tokio::test]
    async fn loss_before_running_does_not_release_running_waiters() {
        let t = task();
        // A staging failure loses the task before it ever runs.
        t.set_state(TaskState::Staging);
        t.set_state(TaskState::Lost);
        let premature = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            t.wait(TaskState::Running),
        )
        .await;
        assert!(premature.is_err(), "wait(Running) resolved for a task that never ran");
        // The lost state itself is waitable.
        t.wait(TaskState::Lost).await;
        // The retry back-edge and a real run release the waiter.
        t.set_state(TaskState::Init);
        t.set_state(TaskState::Staging);
        t.set_state(TaskState::Running);
        t.wait(TaskState::Running).await;
        assert_eq!(t.state(), TaskState::Running);
    }

    #[tokio::test]
    async fn done_releases_every_progression_waiter() {
        let t = task();
        // Failed before running: terminal state still releases waiters.
        t.set_state(TaskState::Done);
        t.wait(TaskState::Staging).await;
        t.wait(TaskState::Running).await;
        t.wait(TaskState::Done).await;
        assert!(!TaskState::Done.reaches(TaskState::Lost));
        assert!(!TaskState::Lost.reaches(TaskState::Done));
    }

    #[test]
    fn attempts_count_retries() {
        let t = task();
        assert_eq!(t.attempt(), 0);
        assert_eq!(t.bump_attempt(), 1);
        assert_eq!(t.attempt(), 1);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(task().id(), task().id());
    }
}
