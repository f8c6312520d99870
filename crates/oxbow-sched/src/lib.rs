//! Oxbow task scheduler
//!
//! Receives resource-tagged tasks, groups them into allocation requests for
//! the cluster, binds tasks to allocs with priority-then-smallest-fit
//! packing, stages input data (directly between blob stores when possible),
//! and handles loss and retry.

pub mod scheduler;
pub mod stats;
pub mod task;

pub use scheduler::{requirements, Scheduler};
pub use stats::{OverallStats, Stats, StatsSnapshot};
pub use task::{Task, TaskState};
