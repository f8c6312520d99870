//! Scheduler statistics

use crate::task::TaskState;
use oxbow_core::Digest;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// Totals over the scheduler's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverallStats {
    pub total_tasks: u64,
    pub total_allocs: u64,
}

/// A point-in-time snapshot.
#[derive(Debug, Clone, Default)]
pub struct StatsSnapshot {
    /// Last observed state per submitted task.
    pub tasks: HashMap<Digest, TaskState>,
    /// Allocs the scheduler has ever held.
    pub allocs: usize,
    pub overall: OverallStats,
}

#[derive(Default)]
struct StatsMut {
    tasks: HashMap<Digest, TaskState>,
    allocs: HashSet<String>,
    overall: OverallStats,
}

/// Shared scheduler statistics. Every submission counts, including extern
/// re-submissions after a failed direct transfer.
#[derive(Default)]
pub struct Stats {
    mu: Mutex<StatsMut>,
}

impl Stats {
    pub(crate) fn task_submitted(&self, id: Digest) {
        let mut mu = self.mu.lock().unwrap();
        mu.overall.total_tasks += 1;
        mu.tasks.insert(id, TaskState::Init);
    }

    pub(crate) fn task_state(&self, id: Digest, state: TaskState) {
        self.mu.lock().unwrap().tasks.insert(id, state);
    }

    pub(crate) fn alloc_added(&self, id: &str) {
        let mut mu = self.mu.lock().unwrap();
        if mu.allocs.insert(id.to_string()) {
            mu.overall.total_allocs += 1;
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let mu = self.mu.lock().unwrap();
        StatsSnapshot {
            tasks: mu.tasks.clone(),
            allocs: mu.allocs.len(),
            overall: mu.overall,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totals_accumulate() {
        let stats = Stats::default();
        let id = Digest::random();
        stats.task_submitted(id);
        stats.task_state(id, TaskState::Running);
        stats.alloc_added("a");
        stats.alloc_added("a");
        stats.alloc_added("b");
        let snap = stats.snapshot();
        assert_eq!(snap.overall, OverallStats { total_tasks: 1, total_allocs: 2 });
        assert_eq!(snap.tasks[&id], TaskState::Running);
        assert_eq!(snap.allocs, 2);
    }
}
