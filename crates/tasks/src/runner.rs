use derive_more::Display;
use exn::Exn;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::FailureKind;
use crate::task::{Cause, Failure, Task, TaskId, Upstream};

/// Runs the task, stores its outcome in its slot and reports whether it failed.
type Job<K> = Box<dyn FnOnce() -> Result<(), Arc<Failure<K>>> + Send>;
/// Settles the slot of a task that will never run.
type Skip<K> = Box<dyn FnOnce(Arc<Failure<K>>) + Send>;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
    Skipped,
}

/// Number of [`TaskMetric`]s a runner keeps; older ones are dropped first.
pub const METRICS_LIMIT: usize = 1024;

/// How one settled task went.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskMetric {
    pub id: TaskId,
    pub name: String,
    pub status: TaskStatus,
    /// Time spent running the task function; zero for skipped tasks.
    pub duration: Duration,
}

struct Node<K> {
    name: Arc<str>,
    waiting_on: usize,
    dependents: Vec<TaskId>,
    // Moved to the ready queue once nothing is waited on.
    job: Option<Job<K>>,
    skip: Skip<K>,
}

pub(crate) struct Graph<K> {
    next_id: u64,
    // Tasks that have not settled yet, including running ones.
    nodes: HashMap<TaskId, Node<K>>,
    ready: BTreeMap<TaskId, (Arc<str>, Job<K>)>,
    // Failures live in the task slots only, so settled tasks cost nothing here.
    metrics: VecDeque<TaskMetric>,
    shutdown: bool,
}

pub(crate) struct Shared<K> {
    graph: Mutex<Graph<K>>,
    // Signalled whenever a task becomes ready or settles.
    changed: Condvar,
}

impl<K: FailureKind> Shared<K> {
    /// Runs ready tasks on the calling thread until `done` holds.
    pub(crate) fn help_until(&self, done: impl Fn(&Graph<K>) -> bool) {
        let mut graph = self.graph.lock();
        loop {
            if done(&graph) {
                return;
            }
            match graph.ready.pop_first() {
                Some((id, (name, job))) => self.execute(&mut graph, id, &name, job),
                None => self.changed.wait(&mut graph),
            }
        }
    }

    fn work(&self) {
        let mut graph = self.graph.lock();
        loop {
            match graph.ready.pop_first() {
                Some((id, (name, job))) => self.execute(&mut graph, id, &name, job),
                None if graph.shutdown => return,
                None => self.changed.wait(&mut graph),
            }
        }
    }

    /// Runs `job` with the lock released, then settles the task.
    fn execute(&self, graph: &mut MutexGuard<'_, Graph<K>>, id: TaskId, name: &str, job: Job<K>) {
        let span = tracing::debug_span!("task", task = %name, id = %id);
        let started = Instant::now();
        let outcome = MutexGuard::unlocked(graph, || span.in_scope(job));
        let duration = started.elapsed();
        match &outcome {
            Ok(()) => {
                tracing::debug!(task = %name, elapsed_ms = duration.as_millis() as u64, "Task succeeded");
            }
            Err(failure) => {
                tracing::warn!(task = %name, kind = %failure.kind, elapsed_ms = duration.as_millis() as u64, "Task failed");
            }
        }
        graph.settle(id, outcome, duration);
        self.changed.notify_all();
    }
}

impl<K: FailureKind> Graph<K> {
    fn allocate(&mut self) -> TaskId {
        self.next_id += 1;
        TaskId(self.next_id)
    }

    fn record(&mut self, metric: TaskMetric) {
        if self.metrics.len() == METRICS_LIMIT {
            self.metrics.pop_front();
        }
        self.metrics.push_back(metric);
    }

    fn settle(&mut self, id: TaskId, outcome: Result<(), Arc<Failure<K>>>, duration: Duration) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        let status = if outcome.is_ok() { TaskStatus::Succeeded } else { TaskStatus::Failed };
        self.record(TaskMetric { id, name: node.name.to_string(), status, duration });
        match outcome {
            Ok(()) => {
                for dependent in node.dependents {
                    self.release(dependent);
                }
            }
            Err(failure) => {
                self.skip_all(node.dependents, &failure);
            }
        }
    }

    /// One dependency of `id` succeeded.
    fn release(&mut self, id: TaskId) {
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        node.waiting_on = node.waiting_on.saturating_sub(1);
        if node.waiting_on == 0
            && let Some(job) = node.job.take()
        {
            let name = node.name.clone();
            self.ready.insert(id, (name, job));
        }
    }

    /// Fails every task reachable from `roots` without running it.
    fn skip_all(&mut self, roots: Vec<TaskId>, failure: &Arc<Failure<K>>) {
        let mut pending = roots;
        while let Some(id) = pending.pop() {
            // Already settled through another path.
            let Some(node) = self.nodes.remove(&id) else {
                continue;
            };
            tracing::debug!(task = %node.name, upstream = %failure.task, "Skipping task");
            (node.skip)(failure.clone());
            self.record(TaskMetric {
                id,
                name: node.name.to_string(),
                status: TaskStatus::Skipped,
                duration: Duration::ZERO,
            });
            pending.extend(node.dependents);
        }
    }
}

/// Executes a graph of dependent tasks on a fixed pool of worker threads.
///
/// A task runs once every upstream task has succeeded, receiving their
/// results as inputs. Tasks waiting on dependencies are parked in the graph
/// and never occupy a worker. With a single worker, tasks that are ready at
/// the same time run in submission order.
///
/// When a task fails, every task downstream of it fails with the same kind
/// without running. Unrelated branches carry on.
///
/// Dropping the runner waits for every submitted task to settle.
pub struct TaskRunner<K: FailureKind> {
    shared: Arc<Shared<K>>,
    workers: Vec<JoinHandle<()>>,
}

impl<K: FailureKind> fmt::Debug for TaskRunner<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("workers", &self.workers.len())
            .field("pending", &self.pending_tasks())
            .finish()
    }
}

impl<K: FailureKind> TaskRunner<K> {
    /// Starts `workers` threads (at least one).
    pub fn new(workers: usize) -> Self {
        let shared = Arc::new(Shared {
            graph: Mutex::new(Graph {
                next_id: 0,
                nodes: HashMap::new(),
                ready: BTreeMap::new(),
                metrics: VecDeque::new(),
                shutdown: false,
            }),
            changed: Condvar::new(),
        });
        let workers = (0..workers.max(1))
            .filter_map(|i| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("task-worker-{i}"))
                    .spawn(move || shared.work())
                    .inspect_err(|e| tracing::error!(error = %e, "Could not start task worker"))
                    .ok()
            })
            .collect();
        Self { shared, workers }
    }

    /// Wraps an already available value as a settled task.
    pub fn submit_value<T: Clone + Send + Sync + 'static>(&self, value: T) -> Task<T, K> {
        let id = self.shared.graph.lock().allocate();
        Task { id, name: Arc::from("value"), slot: Arc::new(OnceLock::from(Ok(value))), shared: self.shared.clone() }
    }

    /// Schedules `f` to run once every task in `upstream` has succeeded.
    ///
    /// Returns immediately. `f` receives the upstream results in the order
    /// they are listed: `()` for no upstream, the value itself for a single
    /// task, and a tuple otherwise.
    pub fn submit<U, R, F>(&self, name: impl fmt::Display, upstream: U, f: F) -> Task<R, K>
    where
        U: Upstream<K>,
        R: Clone + Send + Sync + 'static,
        F: FnOnce(U::Values) -> Result<R, Exn<K>> + Send + 'static,
    {
        let name: Arc<str> = Arc::from(name.to_string());
        let slot = Arc::new(OnceLock::new());
        let dependencies = upstream.dependencies();
        let read = upstream.reader();

        let mut graph = self.shared.graph.lock();
        let id = graph.allocate();

        let job: Job<K> = {
            let (name, slot) = (name.clone(), slot.clone());
            Box::new(move || {
                let outcome = match read() {
                    Some(values) => run(f, values),
                    None => Err((K::panicked(), Cause::Panic("upstream result missing".into()))),
                };
                match outcome {
                    Ok(value) => {
                        _ = slot.set(Ok(value));
                        Ok(())
                    }
                    Err((kind, cause)) => {
                        let failure = Arc::new(Failure { origin: id, task: name, kind, cause });
                        _ = slot.set(Err(failure.clone()));
                        Err(failure)
                    }
                }
            })
        };
        let skip: Skip<K> = {
            let slot = slot.clone();
            Box::new(move |failure| {
                _ = slot.set(Err(failure));
            })
        };

        let mut waiting_on = 0;
        for dependency in dependencies {
            if let Some(node) = graph.nodes.get_mut(&dependency) {
                node.dependents.push(id);
                waiting_on += 1;
            }
        }
        // A slot is set before its task leaves the graph, so any dependency
        // that is no longer a node has its outcome readable here.
        let failed = upstream.failure();

        let task = Task { id, name: name.clone(), slot, shared: self.shared.clone() };
        if let Some(failure) = failed {
            tracing::debug!(task = %name, upstream = %failure.task, "Skipping task");
            // Dependencies still pending may later release or skip it again;
            // it is no longer a node, so both are no-ops.
            skip(failure);
            graph.record(TaskMetric {
                id,
                name: name.to_string(),
                status: TaskStatus::Skipped,
                duration: Duration::ZERO,
            });
        } else if waiting_on == 0 {
            graph.nodes.insert(id, Node { name: name.clone(), waiting_on, dependents: Vec::new(), job: None, skip });
            graph.ready.insert(id, (name, job));
            drop(graph);
            self.shared.changed.notify_all();
        } else {
            graph.nodes.insert(id, Node { name, waiting_on, dependents: Vec::new(), job: Some(job), skip });
        }
        task
    }

    /// Number of submitted tasks that have not settled yet.
    pub fn pending_tasks(&self) -> usize {
        self.shared.graph.lock().nodes.len()
    }

    /// Blocks until every submitted task has settled, helping to run them.
    pub fn join(&self) {
        self.shared.help_until(|graph| graph.nodes.is_empty());
    }

    /// The last [`METRICS_LIMIT`] settled tasks, in the order they settled.
    pub fn metrics(&self) -> Vec<TaskMetric> {
        self.shared.graph.lock().metrics.iter().cloned().collect()
    }
}

impl<K: FailureKind> Drop for TaskRunner<K> {
    fn drop(&mut self) {
        self.join();
        self.shared.graph.lock().shutdown = true;
        self.shared.changed.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("Task worker panicked");
            }
        }
    }
}

fn run<V, R, K: FailureKind>(
    f: impl FnOnce(V) -> Result<R, Exn<K>>,
    values: V,
) -> Result<R, (K, Cause)> {
    match catch_unwind(AssertUnwindSafe(|| f(values))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(((*err).clone(), Cause::Error(format!("{err:?}")))),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err((K::panicked(), Cause::Panic(message)))
        }
    }
}
