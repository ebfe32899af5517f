//! A small dependency-ordered task graph.
//!
//! Deployments are expressed as graphs: parse the local APKs while the
//! device is dumped, diff once both are done, and so on. Each step is a
//! [`Task`] submitted to a [`TaskRunner`] together with the tasks it depends
//! on. The runner executes ready tasks on a fixed pool of OS threads and
//! hands each task the results of its upstream tasks.
//!
//! Errors are typed by the caller's [`FailureKind`]: whatever kind a task
//! function raises is the kind every dependent task reports from
//! [`Task::get`].

pub mod error;
mod runner;
mod task;

pub use crate::runner::{METRICS_LIMIT, TaskMetric, TaskRunner, TaskStatus};
pub use crate::task::{Failure, Task, TaskId, Upstream};

/// Error kinds that can travel through a task graph.
pub trait FailureKind: std::error::Error + Clone + Send + Sync + 'static {
    /// The kind reported for a task function that panicked.
    fn panicked() -> Self;
}
