//! Background job scheduler.
//!
//! A single dispatcher thread owns all scheduling state and is driven by
//! messages. Jobs name the resources they touch ([`JobKey`]); jobs sharing a
//! key run strictly in submission order, jobs over disjoint keys run
//! concurrently on a bounded rayon pool. Each job reports its outcome on its
//! own [`JobHandle`]; barriers ([`Scheduler::when_all`]) collect outcomes of
//! everything tracked when they were requested.

use rayon::ThreadPool;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, SendError, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{DbError, JobError, Result};
use crate::model::LibraryLocation;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    LoadLibrary,
    UnloadLibrary,
    SyncFeatures,
    CatchUpFeature,
    RebuildFeature,
    Load,
    Refresh,
    Unload,
    RebuildFeatures,
    AwaitBackgroundJobs,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobKind::LoadLibrary => "load_library",
            JobKind::UnloadLibrary => "unload_library",
            JobKind::SyncFeatures => "sync_features",
            JobKind::CatchUpFeature => "catch_up_feature",
            JobKind::RebuildFeature => "rebuild_feature",
            JobKind::Load => "load",
            JobKind::Refresh => "refresh",
            JobKind::Unload => "unload",
            JobKind::RebuildFeatures => "rebuild_features",
            JobKind::AwaitBackgroundJobs => "await_background_jobs",
        };
        f.write_str(name)
    }
}

/// Resource a job needs exclusive, ordered access to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JobKey {
    Library(LibraryLocation),
    Feature(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailure {
    pub id: JobId,
    pub kind: JobKind,
    pub error: JobError,
}

/// Outcome of a barrier: every job it covered, and the ones that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AwaitReport {
    pub jobs: Vec<JobId>,
    pub failures: Vec<JobFailure>,
}

impl AwaitReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

struct SlotInner<T> {
    state: JobState,
    result: Option<std::result::Result<T, JobError>>,
    started_at: Option<Instant>,
    finished_at: Option<Instant>,
}

struct Slot<T> {
    inner: Mutex<SlotInner<T>>,
    cond: Condvar,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                state: JobState::Pending,
                result: None,
                started_at: None,
                finished_at: None,
            }),
            cond: Condvar::new(),
        }
    }

    fn start(&self) {
        let mut inner = sync::lock(&self.inner);
        if inner.state == JobState::Pending {
            inner.state = JobState::Running;
            inner.started_at = Some(Instant::now());
        }
    }

    fn finish(&self, result: std::result::Result<T, JobError>) {
        let mut inner = sync::lock(&self.inner);
        if inner.state.is_terminal() {
            return;
        }
        inner.state = if result.is_ok() {
            JobState::Succeeded
        } else {
            JobState::Failed
        };
        inner.finished_at = Some(Instant::now());
        inner.result = Some(result);
        drop(inner);
        self.cond.notify_all();
    }
}

/// Typed completion handle of one background job (or of a composite
/// operation built from several).
pub struct JobHandle<T> {
    id: JobId,
    kind: JobKind,
    slot: Arc<Slot<T>>,
}

impl<T> Clone for JobHandle<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for JobHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn state(&self) -> JobState {
        sync::lock(&self.slot.inner).state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn started_at(&self) -> Option<Instant> {
        sync::lock(&self.slot.inner).started_at
    }

    pub fn finished_at(&self) -> Option<Instant> {
        sync::lock(&self.slot.inner).finished_at
    }
}

impl<T: Clone> JobHandle<T> {
    /// The result if the job has finished, without blocking.
    pub fn try_result(&self) -> Option<Result<T>> {
        self.outcome().map(|r| self.lift(r))
    }

    pub fn wait(&self) -> Result<T> {
        let mut inner = sync::lock(&self.slot.inner);
        loop {
            if let Some(result) = inner.result.clone() {
                return self.lift(result);
            }
            inner = self
                .slot
                .cond
                .wait(inner)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    /// `None` when the job is still unfinished after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        let deadline = Instant::now() + timeout;
        let mut inner = sync::lock(&self.slot.inner);
        loop {
            if let Some(result) = inner.result.clone() {
                return Some(self.lift(result));
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self
                .slot
                .cond
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .0;
        }
    }

    pub(crate) fn outcome(&self) -> Option<std::result::Result<T, JobError>> {
        sync::lock(&self.slot.inner).result.clone()
    }

    fn lift(&self, result: std::result::Result<T, JobError>) -> Result<T> {
        result.map_err(|source| DbError::JobFailed {
            id: self.id,
            kind: self.kind,
            source,
        })
    }
}

/// Write side of a handle whose result is produced outside the pool.
/// Dropping it unfinished fails the handle with `Cancelled`.
pub struct Completer<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completer<T> {
    pub fn new(id: JobId, kind: JobKind) -> (JobHandle<T>, Completer<T>) {
        let slot = Arc::new(Slot::new());
        (
            JobHandle {
                id,
                kind,
                slot: Arc::clone(&slot),
            },
            Completer { slot },
        )
    }

    pub fn start(&self) {
        self.slot.start();
    }

    pub fn complete(self, result: std::result::Result<T, JobError>) {
        self.slot.finish(result);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        self.slot.finish(Err(JobError::Cancelled));
    }
}

/// Passed to running work; lets it observe cooperative cancellation.
#[derive(Debug, Clone)]
pub struct JobContext {
    id: JobId,
    kind: JobKind,
    cancel: Arc<AtomicBool>,
}

impl JobContext {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Call between units of work.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(DbError::Cancelled);
        }
        Ok(())
    }
}

trait Runnable: Send {
    fn run(self: Box<Self>, ctx: &JobContext) -> Option<JobError>;
    fn abandon(self: Box<Self>, error: JobError);
}

struct TypedJob<T, F> {
    work: F,
    completer: Completer<T>,
}

impl<T, F> Runnable for TypedJob<T, F>
where
    T: Send + 'static,
    F: FnOnce(&JobContext) -> Result<T> + Send + 'static,
{
    fn run(self: Box<Self>, ctx: &JobContext) -> Option<JobError> {
        let TypedJob { work, completer } = *self;
        completer.start();
        let result = match catch_unwind(AssertUnwindSafe(|| work(ctx))) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(JobError::from(err)),
            Err(panic) => Err(JobError::Panicked {
                message: panic_message(panic.as_ref()),
            }),
        };
        let failure = result.as_ref().err().cloned();
        completer.complete(result);
        failure
    }

    fn abandon(self: Box<Self>, error: JobError) {
        self.completer.complete(Err(error));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct QueuedJob {
    id: JobId,
    kind: JobKind,
    keys: Vec<JobKey>,
    job: Box<dyn Runnable>,
}

type BarrierCallback = Box<dyn FnOnce(AwaitReport) + Send>;

enum Message {
    Submit(QueuedJob),
    Done {
        id: JobId,
        failure: Option<JobError>,
    },
    Barrier {
        scope: Option<Vec<JobId>>,
        on_done: BarrierCallback,
    },
    Cancel,
    Shutdown,
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerStats {
    pub pending: Arc<AtomicUsize>,
    pub running: Arc<AtomicUsize>,
    pub succeeded: Arc<AtomicU64>,
    pub failed: Arc<AtomicU64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SchedulerCounts {
    pub pending: usize,
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
}

impl SchedulerStats {
    pub fn snapshot(&self) -> SchedulerCounts {
        SchedulerCounts {
            pending: self.pending.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable submission side of the scheduler.
#[derive(Clone)]
pub struct Scheduler {
    tx: Sender<Message>,
    next_id: Arc<AtomicU64>,
    cancel: Arc<AtomicBool>,
    stats: SchedulerStats,
}

/// Owns the dispatcher thread.
pub struct SchedulerRuntime {
    handle: Option<JoinHandle<()>>,
}

impl SchedulerRuntime {
    /// Waits for the dispatcher to drain and exit. Call after
    /// [`Scheduler::shutdown`].
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Scheduler {
    pub fn start(workers: usize) -> Result<(Scheduler, SchedulerRuntime)> {
        let workers = workers.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("classdb-worker-{i}"))
            .build()
            .map_err(|e| DbError::Scheduler(e.to_string()))?;
        let (tx, rx) = std::sync::mpsc::channel::<Message>();
        let scheduler = Scheduler {
            tx: tx.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            cancel: Arc::new(AtomicBool::new(false)),
            stats: SchedulerStats::default(),
        };
        let dispatcher = Dispatcher {
            pool,
            capacity: workers,
            done_tx: tx,
            cancel: Arc::clone(&scheduler.cancel),
            stats: scheduler.stats.clone(),
            waiting: VecDeque::new(),
            queues: HashMap::new(),
            tracked: HashMap::new(),
            running: 0,
            barriers: Vec::new(),
            accepting: true,
        };
        let handle = std::thread::Builder::new()
            .name("classdb-dispatcher".to_string())
            .spawn(move || dispatcher.run(rx))
            .map_err(|e| DbError::Scheduler(e.to_string()))?;
        Ok((
            scheduler,
            SchedulerRuntime {
                handle: Some(handle),
            },
        ))
    }

    /// Reserves an id for a composite handle that is completed outside the pool.
    pub fn next_id(&self) -> JobId {
        JobId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    pub fn submit<T, F>(&self, kind: JobKind, keys: Vec<JobKey>, work: F) -> JobHandle<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(&JobContext) -> Result<T> + Send + 'static,
    {
        let id = self.next_id();
        let (handle, completer) = Completer::new(id, kind);
        let queued = QueuedJob {
            id,
            kind,
            keys,
            job: Box::new(TypedJob { work, completer }),
        };
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        if let Err(SendError(Message::Submit(queued))) = self.tx.send(Message::Submit(queued)) {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            queued.job.abandon(JobError::Cancelled);
        }
        handle
    }

    /// Runs `on_done` once every job in `scope` (or every job tracked right
    /// now, for `None`) is terminal. Jobs that already finished count as done.
    pub fn when_all(
        &self,
        scope: Option<Vec<JobId>>,
        on_done: impl FnOnce(AwaitReport) + Send + 'static,
    ) {
        let message = Message::Barrier {
            scope,
            on_done: Box::new(on_done),
        };
        if let Err(SendError(Message::Barrier { scope, on_done })) = self.tx.send(message) {
            on_done(AwaitReport {
                jobs: scope.unwrap_or_default(),
                failures: Vec::new(),
            });
        }
    }

    /// Handle resolving when every job submitted before this call is terminal.
    pub fn await_all(&self) -> JobHandle<AwaitReport> {
        let (handle, completer) = Completer::new(self.next_id(), JobKind::AwaitBackgroundJobs);
        completer.start();
        self.when_all(None, move |report| completer.complete(Ok(report)));
        handle
    }

    /// Cancels queued jobs and asks running ones to stop at their next
    /// checkpoint. The flag stays set: later jobs are cancelled too.
    pub fn cancel_all(&self) {
        self.cancel.store(true, Ordering::SeqCst);
        let _ = self.tx.send(Message::Cancel);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Stops accepting work; the dispatcher exits once everything queued has
    /// drained.
    pub fn shutdown(&self) {
        let _ = self.tx.send(Message::Shutdown);
    }

    pub fn stats(&self) -> SchedulerCounts {
        self.stats.snapshot()
    }
}

struct Barrier {
    jobs: Vec<JobId>,
    remaining: HashSet<JobId>,
    failures: Vec<JobFailure>,
    on_done: BarrierCallback,
}

struct Dispatcher {
    pool: ThreadPool,
    capacity: usize,
    done_tx: Sender<Message>,
    cancel: Arc<AtomicBool>,
    stats: SchedulerStats,
    waiting: VecDeque<QueuedJob>,
    queues: HashMap<JobKey, VecDeque<JobId>>,
    tracked: HashMap<JobId, (JobKind, Vec<JobKey>)>,
    running: usize,
    barriers: Vec<Barrier>,
    accepting: bool,
}

impl Dispatcher {
    fn run(mut self, rx: Receiver<Message>) {
        while let Ok(message) = rx.recv() {
            match message {
                Message::Submit(job) => self.accept(job),
                Message::Done { id, failure } => {
                    self.running -= 1;
                    self.stats.running.fetch_sub(1, Ordering::Relaxed);
                    self.finish(id, failure);
                }
                Message::Barrier { scope, on_done } => self.add_barrier(scope, on_done),
                Message::Cancel => self.cancel_waiting(),
                Message::Shutdown => {
                    self.accepting = false;
                }
            }
            self.dispatch();
            if !self.accepting && self.waiting.is_empty() && self.running == 0 {
                break;
            }
        }
        for barrier in self.barriers.drain(..) {
            (barrier.on_done)(AwaitReport {
                jobs: barrier.jobs,
                failures: barrier.failures,
            });
        }
        tracing::debug!("dispatcher stopped");
    }

    fn accept(&mut self, queued: QueuedJob) {
        self.stats.pending.fetch_sub(1, Ordering::Relaxed);
        if !self.accepting {
            tracing::debug!(job = %queued.id, kind = %queued.kind, "rejected after shutdown");
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            queued.job.abandon(JobError::Cancelled);
            return;
        }
        for key in &queued.keys {
            self.queues.entry(key.clone()).or_default().push_back(queued.id);
        }
        self.tracked
            .insert(queued.id, (queued.kind, queued.keys.clone()));
        self.stats.pending.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(job = %queued.id, kind = %queued.kind, "queued");
        self.waiting.push_back(queued);
    }

    fn is_ready(&self, job: &QueuedJob) -> bool {
        job.keys.iter().all(|key| {
            self.queues
                .get(key)
                .and_then(|q| q.front())
                .is_some_and(|front| *front == job.id)
        })
    }

    fn dispatch(&mut self) {
        let mut idx = 0;
        while idx < self.waiting.len() && self.running < self.capacity {
            if !self.is_ready(&self.waiting[idx]) {
                idx += 1;
                continue;
            }
            let Some(queued) = self.waiting.remove(idx) else {
                break;
            };
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            if self.cancel.load(Ordering::SeqCst) {
                queued.job.abandon(JobError::Cancelled);
                self.finish(queued.id, Some(JobError::Cancelled));
                // Finishing may have made an earlier job ready.
                idx = 0;
                continue;
            }
            self.running += 1;
            self.stats.running.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(job = %queued.id, kind = %queued.kind, "running");

            let ctx = JobContext {
                id: queued.id,
                kind: queued.kind,
                cancel: Arc::clone(&self.cancel),
            };
            let done_tx = self.done_tx.clone();
            let job = queued.job;
            self.pool.spawn(move || {
                let failure = job.run(&ctx);
                let _ = done_tx.send(Message::Done {
                    id: ctx.id,
                    failure,
                });
            });
        }
    }

    fn finish(&mut self, id: JobId, failure: Option<JobError>) {
        let Some((kind, keys)) = self.tracked.remove(&id) else {
            return;
        };
        for key in &keys {
            if let Some(queue) = self.queues.get_mut(key) {
                queue.retain(|queued| *queued != id);
                if queue.is_empty() {
                    self.queues.remove(key);
                }
            }
        }
        match &failure {
            Some(error) => {
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %id, %kind, %error, "failed");
            }
            None => {
                self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %id, %kind, "succeeded");
            }
        }

        let mut idx = 0;
        while idx < self.barriers.len() {
            let barrier = &mut self.barriers[idx];
            if barrier.remaining.remove(&id)
                && let Some(error) = failure.clone()
            {
                barrier.failures.push(JobFailure { id, kind, error });
            }
            if barrier.remaining.is_empty() {
                let barrier = self.barriers.swap_remove(idx);
                complete_barrier(barrier);
            } else {
                idx += 1;
            }
        }
    }

    fn add_barrier(&mut self, scope: Option<Vec<JobId>>, on_done: BarrierCallback) {
        let mut jobs: Vec<JobId> = match scope {
            Some(ids) => ids,
            None => self.tracked.keys().copied().collect(),
        };
        jobs.sort();
        let remaining: HashSet<JobId> = jobs
            .iter()
            .filter(|id| self.tracked.contains_key(id))
            .copied()
            .collect();
        let barrier = Barrier {
            jobs,
            remaining,
            failures: Vec::new(),
            on_done,
        };
        if barrier.remaining.is_empty() {
            complete_barrier(barrier);
        } else {
            self.barriers.push(barrier);
        }
    }

    fn cancel_waiting(&mut self) {
        let cancelled: Vec<QueuedJob> = self.waiting.drain(..).collect();
        for queued in cancelled {
            self.stats.pending.fetch_sub(1, Ordering::Relaxed);
            let id = queued.id;
            queued.job.abandon(JobError::Cancelled);
            self.finish(id, Some(JobError::Cancelled));
        }
    }
}

fn complete_barrier(mut barrier: Barrier) {
    barrier.failures.sort_by_key(|f| f.id);
    (barrier.on_done)(AwaitReport {
        jobs: barrier.jobs,
        failures: barrier.failures,
    });
}
