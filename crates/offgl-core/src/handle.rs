//! [`AsyncHandle`], the single-use completion token returned by
//! [`RenderWorker::submit`](crate::RenderWorker::submit).
//!
//! A handle pairs a one-way latch with an optional caller-side payload. The
//! worker signals the latch exactly once, after the job's work item has
//! finished (or has been abandoned), and stores the job's outcome with it.
//! Dropping the handle releases the latch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Why a job did not complete normally.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The work item returned an error.
    #[error("render job failed: {0}")]
    Failed(String),
    /// The work item panicked. The worker caught the panic and kept running.
    #[error("render job panicked: {0}")]
    Panicked(String),
    /// The worker stopped before the job was dequeued; the work item never ran.
    #[error("render job abandoned: worker stopped before it ran")]
    Abandoned,
}

/// Outcome stored in a signaled latch.
pub type JobResult = Result<(), JobError>;

/// Manual-reset, one-way latch carrying the job outcome.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    outcome: Mutex<Option<JobResult>>,
    signaled: Condvar,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Only the first call has an effect.
    pub(crate) fn signal(&self, result: JobResult) {
        let mut outcome = self.outcome.lock();
        if outcome.is_some() {
            debug_assert!(false, "latch signaled twice");
            return;
        }
        *outcome = Some(result);
        self.signaled.notify_all();
    }

    pub(crate) fn is_set(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub(crate) fn peek(&self) -> Option<JobResult> {
        self.outcome.lock().clone()
    }

    pub(crate) fn wait(&self) -> JobResult {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.signaled.wait(&mut outcome);
        }
    }

    pub(crate) fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.outcome.lock();
        while outcome.is_none() {
            if self.signaled.wait_until(&mut outcome, deadline).timed_out() {
                break;
            }
        }
        outcome.clone()
    }
}

/// Single-use completion token for one queued job.
///
/// `P` is an opaque payload stamped by the submitting component (for
/// example the destination buffer a frame job writes into). The payload
/// lives on the caller's side only; the worker never touches it.
#[derive(Debug)]
pub struct AsyncHandle<P = ()> {
    id: u64,
    owner: u64,
    latch: Arc<Latch>,
    payload: Option<P>,
}

impl AsyncHandle<()> {
    pub(crate) fn new(id: u64, owner: u64, latch: Arc<Latch>) -> Self {
        Self {
            id,
            owner,
            latch,
            payload: None,
        }
    }
}

impl<P> AsyncHandle<P> {
    /// Submission sequence number, unique per worker.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Identifier of the worker that issued this handle.
    pub fn owner(&self) -> u64 {
        self.owner
    }

    /// Non-blocking poll.
    pub fn is_completed(&self) -> bool {
        self.latch.is_set()
    }

    /// The job outcome if the latch is already set.
    pub fn outcome(&self) -> Option<JobResult> {
        self.latch.peek()
    }

    /// Block until the latch is set. Returns immediately if it already is.
    pub fn wait(&self) -> JobResult {
        self.latch.wait()
    }

    /// Block for at most `timeout`. Returns `None` if the job is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<JobResult> {
        self.latch.wait_timeout(timeout)
    }

    /// Replace the payload type, stamping `payload` onto the handle.
    pub fn with_payload<Q>(self, payload: Q) -> AsyncHandle<Q> {
        AsyncHandle {
            id: self.id,
            owner: self.owner,
            latch: self.latch,
            payload: Some(payload),
        }
    }

    pub fn payload(&self) -> Option<&P> {
        self.payload.as_ref()
    }

    pub fn take_payload(&mut self) -> Option<P> {
        self.payload.take()
    }
}

/// A consumed handle: the job outcome plus whatever payload was stamped.
#[derive(Debug)]
pub struct Completed<P> {
    pub id: u64,
    pub outcome: JobResult,
    pub payload: Option<P>,
}

impl<P> Completed<P> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub(crate) fn from_handle(mut handle: AsyncHandle<P>, outcome: JobResult) -> Self {
        Self {
            id: handle.id,
            outcome,
            payload: handle.payload.take(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn handle() -> (AsyncHandle, Arc<Latch>) {
        let latch = Arc::new(Latch::new());
        (AsyncHandle::new(1, 7, latch.clone()), latch)
    }

    #[test]
    fn starts_unsignaled() {
        let (handle, _latch) = handle();
        assert!(!handle.is_completed());
        assert_eq!(handle.outcome(), None);
        assert_eq!(handle.wait_timeout(Duration::from_millis(5)), None);
    }

    #[test]
    fn wait_returns_immediately_once_signaled() {
        let (handle, latch) = handle();
        latch.signal(Err(JobError::Failed("boom".into())));
        assert!(handle.is_completed());
        assert_eq!(handle.wait(), Err(JobError::Failed("boom".into())));
        // Polling again does not reset a manual-reset latch.
        assert!(handle.is_completed());
    }

    #[test]
    fn wait_blocks_until_signal_from_another_thread() {
        let (handle, latch) = handle();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            latch.signal(Ok(()));
        });
        let start = Instant::now();
        assert_eq!(handle.wait(), Ok(()));
        assert!(start.elapsed() >= Duration::from_millis(25));
        signaler.join().unwrap();
    }

    #[test]
    fn payload_survives_retyping() {
        let (handle, latch) = handle();
        let handle = handle.with_payload(String::from("buffer"));
        assert_eq!(handle.payload().map(String::as_str), Some("buffer"));
        latch.signal(Ok(()));
        let done = Completed::from_handle(handle, Ok(()));
        assert!(done.is_ok());
        assert_eq!(done.payload.as_deref(), Some("buffer"));
    }

    #[test]
    fn taken_payload_is_not_completed_twice() {
        let (handle, _latch) = handle();
        let mut handle = handle.with_payload(3u32);
        assert_eq!(handle.take_payload(), Some(3));
        assert_eq!(handle.payload(), None);
        let done = Completed::from_handle(handle, Ok(()));
        assert_eq!(done.payload, None);
    }
}
