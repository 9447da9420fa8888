//! Thread and completion primitives for off-screen GL rendering.
//!
//! - [`RenderWorker`] owns one graphics context on a dedicated thread and
//!   executes queued jobs against it in submission order.
//! - [`AsyncHandle`] is the one-shot completion token returned for each
//!   job; callers poll it or block on it from the UI thread.
//! - [`Size`] / [`PixelRect`] describe output dimensions.
//!
//! Nothing in this crate touches a graphics API; see `offgl-readback` for
//! the GL side and `offgl` for the begin/end frame façade.

pub mod handle;
pub mod size;
pub mod worker;

pub use handle::{AsyncHandle, Completed, JobError, JobResult};
pub use size::{PixelRect, Size, BYTES_PER_PIXEL};
pub use worker::{RenderWorker, WorkItem, WorkerConfig};
