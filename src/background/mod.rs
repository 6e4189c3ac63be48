//! # Background Work Queue
//!
//! Deferred execution of operations that would otherwise block the
//! request path: closing files, syncing files to disk, and freeing
//! large values whose destructors walk millions of elements.
//!
//! ## Model
//!
//! One worker thread per job kind. Each kind owns a FIFO queue guarded
//! by a mutex and two condition variables: `new_job` wakes the worker
//! when work arrives, `step_done` wakes waiters when a job completes.
//! The kind set is closed — no dynamic registration.
//!
//! ## Contract
//!
//! - [`BackgroundWorkers::submit`] appends to the kind's queue, signals
//!   the worker, and returns immediately. There is no completion
//!   callback.
//! - [`BackgroundWorkers::pending`] counts queued **plus in-flight**
//!   jobs of a kind. Observing zero implies every side effect of
//!   previously submitted jobs of that kind is visible.
//! - [`BackgroundWorkers::wait_one`] blocks until at least one job of
//!   the kind completes (or the queue is already empty), then returns
//!   the remaining pending count.
//! - Completion order equals submission order within a kind; there is
//!   no ordering across kinds.
//!
//! ## Failure policy
//!
//! Workers cannot propagate errors: a failed sync is logged and the
//! worker continues. Jobs are fire-and-forget by design.
//!
//! ## Shutdown
//!
//! Dropping [`BackgroundWorkers`] performs a drain-then-join: each
//! worker finishes every queued job of its kind before exiting, and the
//! drop blocks until all three have terminated.

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------


// ------------------------------------------------------------------------------------------------
// Includes
// ------------------------------------------------------------------------------------------------

use std::any::Any;
use std::collections::VecDeque;
use std::fs::File;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, error, trace, warn};

use crate::dict::Dict;
use crate::object::{Bytes, Object};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by queue operations.
#[derive(Debug, Error)]
pub enum BackgroundError {
    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Jobs
// ------------------------------------------------------------------------------------------------

/// The fixed set of job kinds, each served by its own worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Close a file descriptor.
    CloseFile = 0,
    /// Synchronize a file's contents to stable storage.
    SyncFile = 1,
    /// Run the destructor of a detached value, database, or index.
    LazyFree = 2,
}

/// Number of job kinds (and worker threads).
pub const KIND_COUNT: usize = 3;

const ALL_KINDS: [JobKind; KIND_COUNT] = [JobKind::CloseFile, JobKind::SyncFile, JobKind::LazyFree];

/// What a lazy-free job destroys.
pub enum FreePayload {
    /// A single detached object.
    Value(Box<Object>),

    /// A whole database's dictionary pair, swapped out by an
    /// asynchronous flush.
    Database {
        main: Dict<Bytes, Object>,
        expires: Dict<Bytes, u64>,
    },

    /// An opaque ordered index (or any other large structure) whose
    /// drop should not run on the request thread.
    Index(Box<dyn Any + Send>),
}

impl std::fmt::Debug for FreePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FreePayload::Value(obj) => f.debug_tuple("Value").field(&obj.value.type_name()).finish(),
            FreePayload::Database { main, expires } => f
                .debug_struct("Database")
                .field("keys", &main.len())
                .field("expires", &expires.len())
                .finish(),
            FreePayload::Index(_) => f.write_str("Index"),
        }
    }
}

/// One unit of deferred work.
#[derive(Debug)]
pub enum Job {
    CloseFile(File),
    SyncFile(Arc<File>),
    Free(FreePayload),
}

impl Job {
    /// The queue this job belongs to.
    pub fn kind(&self) -> JobKind {
        match self {
            Job::CloseFile(_) => JobKind::CloseFile,
            Job::SyncFile(_) => JobKind::SyncFile,
            Job::Free(_) => JobKind::LazyFree,
        }
    }
}

/// A job plus its submission timestamp, for completion-latency logging.
struct QueuedJob {
    job: Job,
    created_at: Instant,
}

// ------------------------------------------------------------------------------------------------
// Per-kind queue
// ------------------------------------------------------------------------------------------------

struct QueueInner {
    jobs: VecDeque<QueuedJob>,
    /// Queued plus in-flight jobs of this kind.
    pending: usize,
    /// Monotonic count of completed jobs, for spurious-wakeup-proof
    /// waiting.
    completed: u64,
    shutdown: bool,
}

struct KindQueue {
    inner: Mutex<QueueInner>,
    new_job: Condvar,
    step_done: Condvar,
}

impl KindQueue {
    fn new() -> Self {
        KindQueue {
            inner: Mutex::new(QueueInner {
                jobs: VecDeque::new(),
                pending: 0,
                completed: 0,
                shutdown: false,
            }),
            new_job: Condvar::new(),
            step_done: Condvar::new(),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Worker pool
// ------------------------------------------------------------------------------------------------

/// Handle to the three background workers.
///
/// Dropping the handle drains every queue and joins the workers.
pub struct BackgroundWorkers {
    queues: [Arc<KindQueue>; KIND_COUNT],
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundWorkers {
    /// Spawns one worker thread per job kind.
    pub fn start() -> Result<Self, BackgroundError> {
        let queues: [Arc<KindQueue>; KIND_COUNT] = std::array::from_fn(|_| Arc::new(KindQueue::new()));
        let mut handles = Vec::with_capacity(KIND_COUNT);

        for kind in ALL_KINDS {
            let queue = Arc::clone(&queues[kind as usize]);
            let name = match kind {
                JobKind::CloseFile => "bg-close-file",
                JobKind::SyncFile => "bg-sync-file",
                JobKind::LazyFree => "bg-lazy-free",
            };
            let handle = std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || worker_loop(kind, &queue))
                .map_err(|e| BackgroundError::Internal(format!("spawning {name}: {e}")))?;
            handles.push(handle);
        }

        debug!("background workers started");
        Ok(BackgroundWorkers { queues, handles })
    }

    /// Appends a job to its kind's queue and wakes the worker. Returns
    /// as soon as the job is enqueued; blocks at most for the worker's
    /// short critical section on the kind mutex.
    pub fn submit(&self, job: Job) -> Result<(), BackgroundError> {
        let kind = job.kind();
        let queue = &self.queues[kind as usize];
        let mut inner = lock(&queue.inner)?;
        inner.jobs.push_back(QueuedJob {
            job,
            created_at: Instant::now(),
        });
        inner.pending += 1;
        trace!(?kind, pending = inner.pending, "job submitted");
        drop(inner);
        queue.new_job.notify_one();
        Ok(())
    }

    /// Queued plus in-flight jobs of `kind`.
    pub fn pending(&self, kind: JobKind) -> Result<usize, BackgroundError> {
        Ok(lock(&self.queues[kind as usize].inner)?.pending)
    }

    /// Blocks until at least one job of `kind` completes. Returns the
    /// remaining pending count (immediately zero when the queue is
    /// already empty).
    pub fn wait_one(&self, kind: JobKind) -> Result<usize, BackgroundError> {
        let queue = &self.queues[kind as usize];
        let mut inner = lock(&queue.inner)?;
        if inner.pending == 0 {
            return Ok(0);
        }
        let target = inner.completed + 1;
        while inner.pending > 0 && inner.completed < target {
            inner = queue
                .step_done
                .wait(inner)
                .map_err(|_| BackgroundError::Internal("queue mutex poisoned".into()))?;
        }
        Ok(inner.pending)
    }
}

impl Drop for BackgroundWorkers {
    fn drop(&mut self) {
        for queue in &self.queues {
            match queue.inner.lock() {
                Ok(mut inner) => inner.shutdown = true,
                Err(poisoned) => poisoned.into_inner().shutdown = true,
            }
            queue.new_job.notify_all();
        }
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                error!("background worker panicked during shutdown");
            }
        }
        debug!("background workers stopped");
    }
}

fn lock<'a>(
    mutex: &'a Mutex<QueueInner>,
) -> Result<std::sync::MutexGuard<'a, QueueInner>, BackgroundError> {
    mutex
        .lock()
        .map_err(|_| BackgroundError::Internal("queue mutex poisoned".into()))
}

// ------------------------------------------------------------------------------------------------
// Worker loop
// ------------------------------------------------------------------------------------------------

fn worker_loop(kind: JobKind, queue: &KindQueue) {
    loop {
        // Wait for work. The job stays counted in `pending` while it
        // executes, so observers cannot see zero mid-flight.
        let queued = {
            let mut inner = match queue.inner.lock() {
                Ok(guard) => guard,
                Err(_) => {
                    error!(?kind, "queue mutex poisoned, worker exiting");
                    return;
                }
            };
            loop {
                if let Some(job) = inner.jobs.pop_front() {
                    break job;
                }
                if inner.shutdown {
                    return;
                }
                inner = match queue.new_job.wait(inner) {
                    Ok(guard) => guard,
                    Err(_) => {
                        error!(?kind, "queue mutex poisoned, worker exiting");
                        return;
                    }
                };
            }
        };

        execute(queued.job);
        trace!(?kind, elapsed_us = queued.created_at.elapsed().as_micros() as u64, "job done");

        let mut inner = match queue.inner.lock() {
            Ok(guard) => guard,
            Err(_) => {
                error!(?kind, "queue mutex poisoned, worker exiting");
                return;
            }
        };
        inner.pending -= 1;
        inner.completed += 1;
        drop(inner);
        queue.step_done.notify_all();
    }
}

/// Runs one job. Never propagates errors: log and continue.
fn execute(job: Job) {
    match job {
        Job::CloseFile(file) => {
            // Dropping the handle closes the descriptor.
            drop(file);
        }
        Job::SyncFile(file) => {
            if let Err(e) = file.sync_all() {
                warn!(error = %e, "background file sync failed");
            }
        }
        Job::Free(payload) => {
            if let FreePayload::Database { main, expires } = &payload {
                debug!(keys = main.len(), expires = expires.len(), "freeing database in background");
            }
            drop(payload);
        }
    }
}
