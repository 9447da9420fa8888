//! [`RenderWorker`], the message-loop actor that owns a graphics context.
//!
//! The worker runs on one dedicated, long-lived thread. Its state `S` (the
//! graphics context plus anything bound to it) is built by `prepare` on that
//! thread, handed by `&mut` to each job in submission order, and consumed by
//! `finalize` on that same thread. Nothing outside the worker can reach `S`,
//! so `S` needs neither `Send` nor `Sync`.
//!
//! Jobs are queued on an unbounded multi-producer channel. There is no
//! backpressure: callers are expected to pace themselves with the
//! begin/end protocol.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, trace, warn};

use crate::handle::{AsyncHandle, Completed, JobError, JobResult, Latch};

/// Boxed unit of work executed against the worker-owned state.
pub type WorkItem<S> = Box<dyn FnOnce(&mut S) -> Result<()> + Send + 'static>;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Worker thread settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name given to the dedicated worker thread.
    pub thread_name: String,
    /// Longest time the loop waits for a job before re-checking the stop
    /// flag. An enqueue wakes the loop immediately.
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            thread_name: "offgl-render".to_string(),
            idle_poll: Duration::from_millis(1),
        }
    }
}

/// Worker-side half of a handle: the work item and the latch to signal.
struct QueuedJob<S> {
    id: u64,
    work: Option<WorkItem<S>>,
    latch: Arc<Latch>,
}

impl<S> QueuedJob<S> {
    fn run(mut self, state: &mut S) {
        let Some(work) = self.work.take() else {
            return;
        };
        trace!(job = self.id, "running job");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| work(state))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(job = self.id, "render job failed: {err:#}");
                Err(JobError::Failed(format!("{err:#}")))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job = self.id, "render job panicked: {message}");
                Err(JobError::Panicked(message))
            }
        };
        self.latch.signal(outcome);
    }
}

impl<S> Drop for QueuedJob<S> {
    fn drop(&mut self) {
        // A job that never ran still releases its waiter.
        if !self.latch.is_set() {
            trace!(job = self.id, "job abandoned");
            self.latch.signal(Err(JobError::Abandoned));
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Single-threaded job executor owning a non-thread-safe state `S`.
pub struct RenderWorker<S: 'static> {
    id: u64,
    next_job: AtomicU64,
    sender: Sender<QueuedJob<S>>,
    /// Kept so `stop` can drain whatever the loop never dequeued.
    receiver: Receiver<QueuedJob<S>>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl<S: 'static> RenderWorker<S> {
    /// Spawn the worker thread and run `prepare` on it.
    ///
    /// Blocks until `prepare` has finished so that a context that cannot be
    /// created is reported here instead of on the first frame. On success
    /// the message loop is running. `finalize` runs on the worker thread
    /// after the loop exits and consumes the state.
    pub fn start<P, F>(config: WorkerConfig, prepare: P, finalize: F) -> Result<Self>
    where
        P: FnOnce() -> Result<S> + Send + 'static,
        F: FnOnce(S) + Send + 'static,
    {
        let id = NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = crossbeam_channel::unbounded::<QueuedJob<S>>();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<Result<()>>(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let loop_rx = receiver.clone();
        let loop_cancel = cancel.clone();
        let idle_poll = config.idle_poll;

        let thread = std::thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let mut state = match prepare() {
                    Ok(state) => {
                        let _ = ready_tx.send(Ok(()));
                        state
                    }
                    Err(err) => {
                        error!(worker = id, "worker prepare failed: {err:#}");
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                debug!(worker = id, "render worker loop started");
                message_loop(&mut state, &loop_rx, &loop_cancel, idle_poll);
                debug!(worker = id, "render worker loop exited");
                finalize(state);
            })
            .context("failed to spawn render worker thread")?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = thread.join();
                return Err(err.context("render worker failed to prepare"));
            }
            Err(_) => {
                // The thread died without reporting, i.e. `prepare` panicked.
                let _ = thread.join();
                return Err(anyhow!("render worker thread exited during prepare"));
            }
        }

        Ok(Self {
            id,
            next_job: AtomicU64::new(0),
            sender,
            receiver,
            cancel,
            thread: Some(thread),
        })
    }

    /// Identifier stamped on every handle this worker issues.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue `work` and return its handle immediately. Never blocks.
    ///
    /// Work submitted after [`stop`](Self::stop) is never run; its handle
    /// completes with [`JobError::Abandoned`].
    pub fn submit<W>(&self, work: W) -> AsyncHandle
    where
        W: FnOnce(&mut S) -> Result<()> + Send + 'static,
    {
        let job_id = self.next_job.fetch_add(1, Ordering::Relaxed);
        let latch = Arc::new(Latch::new());
        let job = QueuedJob {
            id: job_id,
            work: Some(Box::new(work)),
            latch: latch.clone(),
        };
        if self.is_running() {
            trace!(worker = self.id, job = job_id, "job queued");
            // The receiver lives as long as `self`, so this cannot fail.
            let _ = self.sender.send(job);
        } else {
            warn!(worker = self.id, job = job_id, "job submitted to a stopped worker");
            drop(job);
        }
        AsyncHandle::new(job_id, self.id, latch)
    }

    /// Submit `work` and block until it has run.
    pub fn submit_and_wait<W>(&self, work: W) -> JobResult
    where
        W: FnOnce(&mut S) -> Result<()> + Send + 'static,
    {
        self.submit(work).wait()
    }

    /// `true` if `handle` was issued by this worker.
    pub fn owns<P>(&self, handle: &AsyncHandle<P>) -> bool {
        handle.owner() == self.id
    }

    /// Block until `handle` is signaled and consume it.
    ///
    /// Returns `None` without waiting if the handle belongs to another
    /// worker.
    pub fn await_handle<P>(&self, handle: AsyncHandle<P>) -> Option<Completed<P>> {
        if !self.owns(&handle) {
            warn!(
                worker = self.id,
                owner = handle.owner(),
                "ignoring handle issued by another worker"
            );
            return None;
        }
        let outcome = handle.wait();
        Some(Completed::from_handle(handle, outcome))
    }

    /// Jobs queued but not yet dequeued.
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the loop, wait for the current job and `finalize`, then discard
    /// every job still queued. Returns how many jobs were discarded.
    ///
    /// A job that is already executing is not interrupted.
    pub fn stop(&mut self) -> usize {
        let Some(thread) = self.thread.take() else {
            debug!(worker = self.id, "stop called on a stopped render worker");
            return 0;
        };
        self.cancel.store(true, Ordering::Release);
        if thread.join().is_err() {
            error!(worker = self.id, "render worker thread panicked outside a job");
        }

        let mut discarded = 0;
        while let Ok(job) = self.receiver.try_recv() {
            drop(job);
            discarded += 1;
        }
        if discarded > 0 {
            warn!(worker = self.id, discarded, "discarded queued render jobs on stop");
        }
        debug!(worker = self.id, "render worker stopped");
        discarded
    }
}

impl<S: 'static> Drop for RenderWorker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn message_loop<S>(
    state: &mut S,
    queue: &Receiver<QueuedJob<S>>,
    cancel: &AtomicBool,
    idle_poll: Duration,
) {
    while !cancel.load(Ordering::Acquire) {
        match queue.recv_timeout(idle_poll) {
            Ok(job) => job.run(state),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}
