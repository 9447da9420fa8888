//! The GL capability surface the readback pipeline is written against.

use anyhow::Result;
use offgl_core::{PixelRect, Size};

/// Object name as handed out by the GL implementation. `0` is never a valid
/// object and, for binds, selects the default target.
pub type ObjectId = u32;

/// Internal storage format of a renderbuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderbufferFormat {
    /// 8 bits per channel, 4 channels.
    Rgba8,
    /// 24-bit depth.
    Depth24,
}

/// Framebuffer attachment point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Color0,
    Depth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FramebufferStatus {
    Complete,
    /// Raw status code reported by the implementation.
    Incomplete(u32),
}

/// Framebuffer, renderbuffer and pixel-pack buffer entry points.
///
/// Every method acts on the context that is current on the calling thread,
/// so an implementation must only be used on the thread that owns that
/// context. Implementations are deliberately not required to be `Send`.
pub trait GlApi {
    /// Generate a framebuffer object and bind it.
    fn create_framebuffer(&mut self) -> Result<ObjectId>;

    fn delete_framebuffer(&mut self, id: ObjectId);

    /// Bind `id` as the draw and read framebuffer. `0` restores the default.
    fn bind_framebuffer(&mut self, id: ObjectId);

    /// Generate a renderbuffer with storage for `size` pixels.
    fn create_renderbuffer(&mut self, format: RenderbufferFormat, size: Size) -> Result<ObjectId>;

    /// Attach a renderbuffer to the bound framebuffer.
    fn attach_renderbuffer(&mut self, attachment: Attachment, id: ObjectId);

    fn delete_renderbuffer(&mut self, id: ObjectId);

    /// Completeness of the bound framebuffer.
    fn framebuffer_status(&mut self) -> FramebufferStatus;

    /// Generate a pixel-pack buffer of `len` bytes, allocated for streaming
    /// reads. Leaves no pack buffer bound.
    fn create_pack_buffer(&mut self, len: usize) -> Result<ObjectId>;

    fn delete_buffer(&mut self, id: ObjectId);

    /// Bind `id` to the pixel-pack target. `0` unbinds.
    fn bind_pack_buffer(&mut self, id: ObjectId);

    /// Queue a read of `rect` from color attachment 0 of the bound
    /// framebuffer into the bound pack buffer at offset 0, as tightly packed
    /// BGRA bytes. Returns without waiting for the transfer.
    fn read_pixels(&mut self, rect: PixelRect) -> Result<()>;

    /// Map the bound pack buffer read-only, hand its bytes to `sink`, then
    /// unmap. Mapping waits for any transfer still targeting the buffer.
    fn read_pack_buffer(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<()>;

    /// Block until every previously issued command has completed.
    fn finish(&mut self);

    /// Discard error flags left pending by earlier commands, including ones
    /// issued by caller code on this context. Returns how many were pending.
    fn clear_errors(&mut self) -> usize;
}
