//! Offscreen render targets and GPU-to-CPU pixel readback.
//!
//! The pipeline is written against the [`GlApi`] capability trait. [`RawGl`]
//! drives the system OpenGL driver; [`SoftGl`] is an in-memory stand-in used
//! for headless runs and tests. [`SurfaceManager`] owns the framebuffer,
//! renderbuffers and pixel-pack buffers and performs the readback.

pub mod api;
pub mod context;
pub mod raw;
pub mod soft;
pub mod surface;

pub use api::{Attachment, FramebufferStatus, GlApi, ObjectId, RenderbufferFormat};
pub use context::GlContext;
#[cfg(target_os = "windows")]
pub use context::WglContext;
pub use raw::RawGl;
pub use soft::{ContextProbe, SoftContext, SoftGl, SoftGlStats};
pub use surface::{ReadbackMode, SurfaceManager};
