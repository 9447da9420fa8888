//! Off-thread OpenGL rendering for UI toolkits that own their main thread.
//!
//! A [`FrameSource`] owns a dedicated render worker with its own GL context.
//! The UI thread calls [`begin_render`](FrameSource::begin_render) with a
//! draw callback and a destination buffer, keeps polling, and collects the
//! finished buffer with [`end_render`](FrameSource::end_render). The context
//! never leaves the worker thread.
//!
//! ```no_run
//! use offgl::{CpuBitmap, FrameSource, FrameSourceConfig};
//! use offgl_readback::{SoftContext, SoftGl};
//!
//! # fn main() -> anyhow::Result<()> {
//! let source = FrameSource::spawn(FrameSourceConfig::default(), || {
//!     Ok((SoftContext::new(), SoftGl::new()))
//! })?;
//! let mut back: Option<CpuBitmap> = None;
//! let frame = source.begin_render(|gl: &mut SoftGl| gl.clear(0xFFFF0000), &mut back)?;
//! back = source.end_render(frame).into_buffer();
//! # let _ = back;
//! # Ok(())
//! # }
//! ```
//!
//! [`SharedFrameSource`] is the variant that draws straight into a surface
//! shared with a second graphics API.

pub mod buffer;
pub mod config;
pub mod shared;
pub mod source;
pub mod target;

pub use buffer::{CpuBitmap, PixelBuffer, PixelLoan};
pub use config::{FrameSourceConfig, DEFAULT_SIZE};
pub use shared::{SharedFrameHandle, SharedFrameSource, SharedTarget, SurfaceOutcome};
pub use source::{FrameHandle, FrameOutcome, FrameSource, FrameSourceBuilder, GlHook};
pub use target::WorkerGl;

pub use offgl_core::{AsyncHandle, JobError, PixelRect, Size, WorkerConfig};
pub use offgl_readback::ReadbackMode;
