use derive_more::Display;
use exn::Exn;
use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::FailureKind;
use crate::error::ErrorKind;
use crate::runner::Shared;

/// Identifies a task within its runner. Allocated in submission order.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display("#{_0}")]
pub struct TaskId(pub(crate) u64);

/// What made a task fail, shared by the task and every descendant it took down.
#[derive(Debug)]
pub struct Failure<K> {
    pub(crate) origin: TaskId,
    pub(crate) task: Arc<str>,
    pub(crate) kind: K,
    pub(crate) cause: Cause,
}

#[derive(Debug)]
pub(crate) enum Cause {
    /// Debug rendering of the error the task function returned.
    Error(String),
    Panic(String),
}

impl<K> Failure<K> {
    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn kind(&self) -> &K {
        &self.kind
    }
}

pub(crate) type Outcome<T, K> = std::result::Result<T, Arc<Failure<K>>>;
pub(crate) type Slot<T, K> = Arc<OnceLock<Outcome<T, K>>>;

/// Handle to the eventual result of a submitted task.
pub struct Task<T, K: FailureKind> {
    pub(crate) id: TaskId,
    pub(crate) name: Arc<str>,
    pub(crate) slot: Slot<T, K>,
    pub(crate) shared: Arc<Shared<K>>,
}

impl<T, K: FailureKind> Clone for Task<T, K> {
    fn clone(&self) -> Self {
        Self { id: self.id, name: self.name.clone(), slot: self.slot.clone(), shared: self.shared.clone() }
    }
}

impl<T, K: FailureKind> fmt::Debug for Task<T, K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("settled", &self.slot.get().is_some())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static, K: FailureKind> Task<T, K> {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Blocks until this task settles and returns a copy of its result.
    ///
    /// While waiting, the calling thread runs other ready tasks itself, so
    /// waiting from inside a task function cannot starve the pool.
    ///
    /// A failure carries the kind the failing task raised. Underneath it sits
    /// a [`ErrorKind::Failed`] frame naming that task, and for descendants a
    /// [`ErrorKind::Skipped`] frame naming this one.
    pub fn get(&self) -> Result<T, Exn<K>> {
        self.shared.help_until(|_| self.slot.get().is_some());
        match self.slot.get() {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(failure)) => Err(self.raise(failure)),
            None => Err(Exn::new(ErrorKind::Panicked(format!("task {} never settled", self.name))).raise(K::panicked())),
        }
    }

    fn raise(&self, failure: &Failure<K>) -> Exn<K> {
        let root = match &failure.cause {
            Cause::Error(report) => {
                Exn::new(ErrorKind::Failed { task: failure.task.to_string(), report: report.clone() })
            }
            Cause::Panic(message) => Exn::new(ErrorKind::Panicked(message.clone()))
                .raise(ErrorKind::Failed { task: failure.task.to_string(), report: message.clone() }),
        };
        let root = if failure.origin == self.id {
            root
        } else {
            root.raise(ErrorKind::Skipped { task: self.name.to_string(), upstream: failure.task.to_string() })
        };
        root.raise(failure.kind.clone())
    }
}

mod sealed {
    pub trait Sealed {}
}

/// The upstream tasks of a submission, whose results become the inputs of
/// the task function: `()` for none, `&task` for one, and tuples of task
/// references for up to six.
pub trait Upstream<K: FailureKind>: sealed::Sealed {
    type Values: Send + 'static;

    #[doc(hidden)]
    fn dependencies(&self) -> Vec<TaskId>;

    /// Reads the upstream results. Only called once every upstream task has
    /// succeeded, so `None` means the graph lost track of a result.
    #[doc(hidden)]
    fn reader(&self) -> Box<dyn FnOnce() -> Option<Self::Values> + Send>;

    /// The failure of the first upstream task that has already failed.
    #[doc(hidden)]
    fn failure(&self) -> Option<Arc<Failure<K>>>;
}

impl sealed::Sealed for () {}

impl<K: FailureKind> Upstream<K> for () {
    type Values = ();

    fn dependencies(&self) -> Vec<TaskId> {
        Vec::new()
    }

    fn reader(&self) -> Box<dyn FnOnce() -> Option<()> + Send> {
        Box::new(|| Some(()))
    }

    fn failure(&self) -> Option<Arc<Failure<K>>> {
        None
    }
}

fn read<T: Clone, K>(slot: &Slot<T, K>) -> Option<T> {
    match slot.get() {
        Some(Ok(value)) => Some(value.clone()),
        _ => None,
    }
}

fn failed<T, K>(slot: &Slot<T, K>) -> Option<Arc<Failure<K>>> {
    match slot.get() {
        Some(Err(failure)) => Some(failure.clone()),
        _ => None,
    }
}

impl<T, K: FailureKind> sealed::Sealed for &Task<T, K> {}

impl<T: Clone + Send + Sync + 'static, K: FailureKind> Upstream<K> for &Task<T, K> {
    type Values = T;

    fn dependencies(&self) -> Vec<TaskId> {
        vec![self.id]
    }

    fn reader(&self) -> Box<dyn FnOnce() -> Option<T> + Send> {
        let slot = self.slot.clone();
        Box::new(move || read(&slot))
    }

    fn failure(&self) -> Option<Arc<Failure<K>>> {
        failed(&self.slot)
    }
}

macro_rules! upstream_tuple {
    ($($value:ident $index:tt),+) => {
        impl<$($value,)+ K: FailureKind> sealed::Sealed for ($(&Task<$value, K>,)+) {}

        impl<$($value: Clone + Send + Sync + 'static,)+ K: FailureKind> Upstream<K> for ($(&Task<$value, K>,)+) {
            type Values = ($($value,)+);

            fn dependencies(&self) -> Vec<TaskId> {
                vec![$(self.$index.id),+]
            }

            fn reader(&self) -> Box<dyn FnOnce() -> Option<Self::Values> + Send> {
                let slots = ($(self.$index.slot.clone(),)+);
                Box::new(move || Some(($(read(&slots.$index)?,)+)))
            }

            fn failure(&self) -> Option<Arc<Failure<K>>> {
                None$(.or_else(|| failed(&self.$index.slot)))+
            }
        }
    };
}

upstream_tuple!(A 0);
upstream_tuple!(A 0, B 1);
upstream_tuple!(A 0, B 1, C 2);
upstream_tuple!(A 0, B 1, C 2, D 3);
upstream_tuple!(A 0, B 1, C 2, D 3, E 4);
upstream_tuple!(A 0, B 1, C 2, D 3, E 4, F 5);
