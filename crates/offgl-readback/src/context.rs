//! The worker-owned graphics context.

use anyhow::Result;

/// A graphics context that can be made current on the calling thread.
///
/// The render worker creates its context on its own thread and keeps it for
/// the rest of that thread's life, so implementations need not be `Send`.
pub trait GlContext {
    fn make_current(&mut self) -> Result<()>;

    /// `true` if this context is the one current on the calling thread.
    fn is_current(&self) -> bool;

    /// Leave no context current on the calling thread.
    fn make_not_current(&mut self);
}

#[cfg(target_os = "windows")]
pub use wgl::WglContext;

#[cfg(target_os = "windows")]
mod wgl {
    use anyhow::{Context as _, Result};
    use tracing::{debug, warn};
    use windows::Win32::Graphics::Gdi::HDC;
    use windows::Win32::Graphics::OpenGL::{
        wglDeleteContext, wglGetCurrentContext, wglMakeCurrent, HGLRC,
    };

    use super::GlContext;

    /// A WGL rendering context bound to a device context.
    ///
    /// Owns the `HGLRC` and deletes it on drop.
    pub struct WglContext {
        hdc: HDC,
        hglrc: HGLRC,
    }

    impl WglContext {
        /// # Safety
        ///
        /// `hglrc` must be a valid rendering context compatible with `hdc`,
        /// owned by the caller and not current on any other thread. The
        /// returned value takes ownership of `hglrc`.
        pub unsafe fn from_raw(hdc: HDC, hglrc: HGLRC) -> Self {
            Self { hdc, hglrc }
        }

        pub fn hdc(&self) -> HDC {
            self.hdc
        }
    }

    impl GlContext for WglContext {
        fn make_current(&mut self) -> Result<()> {
            unsafe { wglMakeCurrent(self.hdc, self.hglrc) }.context("wglMakeCurrent failed")?;
            debug!("WGL context made current");
            Ok(())
        }

        fn is_current(&self) -> bool {
            unsafe { wglGetCurrentContext() == self.hglrc }
        }

        fn make_not_current(&mut self) {
            if let Err(err) = unsafe { wglMakeCurrent(HDC::default(), HGLRC::default()) } {
                warn!("failed to release WGL context: {err}");
            }
        }
    }

    impl Drop for WglContext {
        fn drop(&mut self) {
            if self.is_current() {
                self.make_not_current();
            }
            if let Err(err) = unsafe { wglDeleteContext(self.hglrc) } {
                warn!("wglDeleteContext failed: {err}");
            }
        }
    }
}
