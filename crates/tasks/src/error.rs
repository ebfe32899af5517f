//! Task Error Types
//!
//! These kinds never surface on their own. They sit underneath the
//! [`FailureKind`](crate::FailureKind) of the task that failed, so that a
//! caller sees the original kind while the report still shows where in the
//! graph it happened.

use derive_more::{Display, Error};

#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[display("task {task} failed: {report}")]
    Failed { task: String, report: String },
    /// The task never ran because one of its ancestors failed.
    #[display("task {task} skipped: upstream task {upstream} failed")]
    Skipped { task: String, upstream: String },
    #[display("task panicked: {_0}")]
    Panicked(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}
