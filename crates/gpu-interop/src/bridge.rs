//! Common interface for sharing a GL render target with a second graphics API.

use anyhow::Result;
use gl::types::GLuint;
use offgl_core::Size;

/// Opaque registration handle for one shared render target.
///
/// Handles are only meaningful to the bridge that issued them. A handle that
/// outlived its registration (for example across a device reset) is ignored
/// by [`SharedSurfaceBridge::unregister`] and rejected by `lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SharedHandle(u64);

impl SharedHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Why a finished frame could not be handed to the presentation API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PresentError {
    /// The presentation device was lost and has been recreated. Every shared
    /// target is gone; the next frame re-registers at the requested size.
    #[error("presentation device was reset")]
    DeviceReset,
    #[error("present failed: {0}")]
    Failed(String),
}

/// Register / lock / unlock / unregister protocol for a render target that
/// both OpenGL and a second graphics API address.
///
/// Implementations exist for DX11 (Windows via `WGL_NV_DX_interop2`). All
/// methods must be called on the thread whose GL context created the
/// bridge. GL drawing into [`framebuffer`](Self::framebuffer) is only valid
/// between [`lock`](Self::lock) and [`unlock`](Self::unlock).
pub trait SharedSurfaceBridge {
    /// What [`present`](Self::present) hands to the presentation pipeline.
    type Surface: Clone + Send + 'static;

    /// Allocate a render target of `size` through the second API and
    /// register it with GL.
    fn register_shared_target(&mut self, size: Size) -> Result<SharedHandle>;

    /// Give GL exclusive access to the target.
    fn lock(&mut self, handle: SharedHandle) -> Result<()>;

    /// Return the target to the second API.
    fn unlock(&mut self, handle: SharedHandle) -> Result<()>;

    /// Unregister and free the target. Unknown handles are ignored.
    fn unregister(&mut self, handle: SharedHandle);

    /// Unregister `current` (if any), reallocate at `size` and register again.
    fn resize_shared_target(
        &mut self,
        current: Option<SharedHandle>,
        size: Size,
    ) -> Result<SharedHandle> {
        if let Some(handle) = current {
            self.unregister(handle);
        }
        self.register_shared_target(size)
    }

    /// GL framebuffer whose color attachment is the shared target.
    fn framebuffer(&self) -> GLuint;

    /// Flush the second API and hand over the finished surface. On device
    /// loss the bridge resets its device before returning
    /// [`PresentError::DeviceReset`].
    fn present(&mut self) -> std::result::Result<Self::Surface, PresentError>;

    /// Size of the registered target, `0x0` when none is registered.
    fn dimensions(&self) -> Size;

    /// Release every GPU resource.
    fn cleanup(&mut self);
}
