//! In-memory [`GlApi`] and [`GlContext`] implementations.
//!
//! `SoftGl` keeps framebuffers, renderbuffers and pack buffers as plain
//! memory so the readback pipeline can run without a GPU. It follows the
//! same binding rules as a real driver (reads go to the bound pack buffer,
//! drawing goes to the bound framebuffer) and counts live objects so leaks
//! and recreation are observable.

use std::cell::Cell;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use anyhow::{bail, Context as _, Result};
use offgl_core::{PixelRect, Size, BYTES_PER_PIXEL};
use parking_lot::Mutex;
use tracing::trace;

use crate::api::{Attachment, FramebufferStatus, GlApi, ObjectId, RenderbufferFormat};
use crate::context::GlContext;

/// `GL_OUT_OF_MEMORY`
const OUT_OF_MEMORY: u32 = 0x0505;
/// `GL_FRAMEBUFFER_INCOMPLETE_ATTACHMENT`
const INCOMPLETE_ATTACHMENT: u32 = 0x8CD6;
/// `GL_FRAMEBUFFER_INCOMPLETE_MISSING_ATTACHMENT`
const INCOMPLETE_MISSING_ATTACHMENT: u32 = 0x8CD7;

/// Running totals of the calls a [`SoftGl`] has served.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftGlStats {
    pub framebuffers_created: usize,
    pub renderbuffers_created: usize,
    pub pack_buffers_created: usize,
    pub read_pixels: usize,
    pub maps: usize,
    pub finishes: usize,
}

#[derive(Debug, Default)]
struct SoftFramebuffer {
    color: Option<ObjectId>,
    depth: Option<ObjectId>,
}

#[derive(Debug)]
struct SoftRenderbuffer {
    format: RenderbufferFormat,
    size: Size,
    /// Color texels as little-endian BGRA words. Empty for depth storage.
    texels: Vec<u32>,
}

/// Software GL. Pixels are BGRA words: `0xAARRGGBB`.
#[derive(Debug)]
pub struct SoftGl {
    next_id: ObjectId,
    framebuffers: HashMap<ObjectId, SoftFramebuffer>,
    renderbuffers: HashMap<ObjectId, SoftRenderbuffer>,
    pack_buffers: HashMap<ObjectId, Vec<u8>>,
    bound_framebuffer: ObjectId,
    bound_pack: ObjectId,
    force_incomplete: bool,
    out_of_memory: bool,
    /// Sticky error flag, reported by the next checked call until cleared.
    pending_error: Option<u32>,
    stats: SoftGlStats,
    _thread_bound: PhantomData<*const ()>,
}

impl Default for SoftGl {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftGl {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            framebuffers: HashMap::new(),
            renderbuffers: HashMap::new(),
            pack_buffers: HashMap::new(),
            bound_framebuffer: 0,
            bound_pack: 0,
            force_incomplete: false,
            out_of_memory: false,
            pending_error: None,
            stats: SoftGlStats::default(),
            _thread_bound: PhantomData,
        }
    }

    fn next_name(&mut self) -> ObjectId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Make every framebuffer report itself incomplete, as a driver without
    /// support for the requested formats would.
    pub fn set_force_incomplete(&mut self, incomplete: bool) {
        self.force_incomplete = incomplete;
    }

    /// Make renderbuffer and pack buffer storage fail with
    /// `GL_OUT_OF_MEMORY`.
    pub fn set_out_of_memory(&mut self, exhausted: bool) {
        self.out_of_memory = exhausted;
    }

    /// Leave `code` pending, as a command with bad arguments would on a
    /// real driver. Allocations and reads report it until it is cleared.
    pub fn raise_error(&mut self, code: u32) {
        self.pending_error.get_or_insert(code);
    }

    pub fn pending_error(&self) -> Option<u32> {
        self.pending_error
    }

    /// Report a pending error after a checked call, like `glGetError`.
    fn check_error(&mut self, what: &str) -> Result<()> {
        if let Some(code) = self.pending_error.take() {
            bail!("{what} raised GL error 0x{code:04X}");
        }
        Ok(())
    }

    pub fn stats(&self) -> SoftGlStats {
        self.stats
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.renderbuffers.len()
    }

    pub fn live_pack_buffers(&self) -> usize {
        self.pack_buffers.len()
    }

    /// Total number of live objects of any kind.
    pub fn live_objects(&self) -> usize {
        self.live_framebuffers() + self.live_renderbuffers() + self.live_pack_buffers()
    }

    pub fn bound_framebuffer(&self) -> ObjectId {
        self.bound_framebuffer
    }

    pub fn bound_pack_buffer(&self) -> ObjectId {
        self.bound_pack
    }

    /// Size of the color attachment of the bound framebuffer.
    pub fn target_size(&self) -> Option<Size> {
        let fb = self.framebuffers.get(&self.bound_framebuffer)?;
        self.renderbuffers.get(&fb.color?).map(|rb| rb.size)
    }

    fn color_target(&mut self) -> Result<&mut SoftRenderbuffer> {
        let fb = self
            .framebuffers
            .get(&self.bound_framebuffer)
            .context("no framebuffer is bound")?;
        let color = fb.color.context("bound framebuffer has no color attachment")?;
        self.renderbuffers
            .get_mut(&color)
            .context("color attachment was deleted")
    }

    /// Fill the bound color target with one value.
    pub fn clear(&mut self, bgra: u32) -> Result<()> {
        self.color_target()?.texels.fill(bgra);
        Ok(())
    }

    /// Set every texel of the bound color target to `shade(x, y)`.
    pub fn fill(&mut self, shade: impl Fn(i32, i32) -> u32) -> Result<()> {
        let target = self.color_target()?;
        let width = target.size.width;
        for (i, texel) in target.texels.iter_mut().enumerate() {
            let i = i as i32;
            *texel = shade(i % width, i / width);
        }
        Ok(())
    }

    pub fn set_pixel(&mut self, x: i32, y: i32, bgra: u32) -> Result<()> {
        let target = self.color_target()?;
        let size = target.size;
        if x < 0 || y < 0 || x >= size.width || y >= size.height {
            bail!("pixel ({x}, {y}) is outside the {size} target");
        }
        target.texels[(y * size.width + x) as usize] = bgra;
        Ok(())
    }

    /// Read one texel of the bound color target.
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        let fb = self.framebuffers.get(&self.bound_framebuffer)?;
        let target = self.renderbuffers.get(&fb.color?)?;
        let size = target.size;
        if x < 0 || y < 0 || x >= size.width || y >= size.height {
            return None;
        }
        target.texels.get((y * size.width + x) as usize).copied()
    }
}

impl GlApi for SoftGl {
    fn create_framebuffer(&mut self) -> Result<ObjectId> {
        let id = self.next_name();
        self.framebuffers.insert(id, SoftFramebuffer::default());
        self.bound_framebuffer = id;
        self.stats.framebuffers_created += 1;
        Ok(id)
    }

    fn delete_framebuffer(&mut self, id: ObjectId) {
        self.framebuffers.remove(&id);
        if self.bound_framebuffer == id {
            self.bound_framebuffer = 0;
        }
    }

    fn bind_framebuffer(&mut self, id: ObjectId) {
        self.bound_framebuffer = id;
    }

    fn create_renderbuffer(&mut self, format: RenderbufferFormat, size: Size) -> Result<ObjectId> {
        if size.is_empty() {
            bail!("renderbuffer storage of {size} is invalid");
        }
        let texels = match format {
            RenderbufferFormat::Rgba8 => vec![0; size.width as usize * size.height as usize],
            RenderbufferFormat::Depth24 => Vec::new(),
        };
        let id = self.next_name();
        self.renderbuffers.insert(
            id,
            SoftRenderbuffer {
                format,
                size,
                texels,
            },
        );
        self.stats.renderbuffers_created += 1;
        if self.out_of_memory {
            self.raise_error(OUT_OF_MEMORY);
        }
        if let Err(err) = self.check_error("glRenderbufferStorage") {
            self.renderbuffers.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn attach_renderbuffer(&mut self, attachment: Attachment, id: ObjectId) {
        let Some(fb) = self.framebuffers.get_mut(&self.bound_framebuffer) else {
            return;
        };
        match attachment {
            Attachment::Color0 => fb.color = Some(id),
            Attachment::Depth => fb.depth = Some(id),
        }
    }

    fn delete_renderbuffer(&mut self, id: ObjectId) {
        self.renderbuffers.remove(&id);
    }

    fn framebuffer_status(&mut self) -> FramebufferStatus {
        let Some(fb) = self.framebuffers.get(&self.bound_framebuffer) else {
            return FramebufferStatus::Incomplete(INCOMPLETE_MISSING_ATTACHMENT);
        };
        if self.force_incomplete {
            return FramebufferStatus::Incomplete(INCOMPLETE_ATTACHMENT);
        }
        let color_ok = fb
            .color
            .and_then(|id| self.renderbuffers.get(&id))
            .is_some_and(|rb| rb.format == RenderbufferFormat::Rgba8);
        let depth_ok = fb
            .depth
            .map_or(true, |id| self.renderbuffers.contains_key(&id));
        if color_ok && depth_ok {
            FramebufferStatus::Complete
        } else {
            FramebufferStatus::Incomplete(INCOMPLETE_ATTACHMENT)
        }
    }

    fn create_pack_buffer(&mut self, len: usize) -> Result<ObjectId> {
        let id = self.next_name();
        self.pack_buffers.insert(id, vec![0; len]);
        self.bound_pack = 0;
        self.stats.pack_buffers_created += 1;
        if self.out_of_memory {
            self.raise_error(OUT_OF_MEMORY);
        }
        if let Err(err) = self.check_error("glBufferData") {
            self.pack_buffers.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    fn delete_buffer(&mut self, id: ObjectId) {
        self.pack_buffers.remove(&id);
        if self.bound_pack == id {
            self.bound_pack = 0;
        }
    }

    fn bind_pack_buffer(&mut self, id: ObjectId) {
        self.bound_pack = id;
    }

    fn read_pixels(&mut self, rect: PixelRect) -> Result<()> {
        let fb = self
            .framebuffers
            .get(&self.bound_framebuffer)
            .context("glReadPixels without a bound framebuffer")?;
        let color = fb.color.context("glReadPixels without a color attachment")?;
        let source = self
            .renderbuffers
            .get(&color)
            .context("color attachment was deleted")?;
        let pack = self
            .pack_buffers
            .get_mut(&self.bound_pack)
            .context("glReadPixels without a pack buffer bound")?;

        let size = source.size;
        if rect.x < 0
            || rect.y < 0
            || rect.x + rect.width > size.width
            || rect.y + rect.height > size.height
        {
            bail!("read rectangle {rect:?} exceeds the {size} framebuffer");
        }
        let needed = rect.width as usize * rect.height as usize * BYTES_PER_PIXEL;
        if pack.len() < needed {
            bail!("pack buffer holds {} bytes, read needs {needed}", pack.len());
        }

        let mut out = pack.chunks_exact_mut(BYTES_PER_PIXEL);
        for y in rect.y..rect.y + rect.height {
            let row = (y * size.width) as usize;
            for x in rect.x..rect.x + rect.width {
                if let Some(dst) = out.next() {
                    dst.copy_from_slice(&source.texels[row + x as usize].to_le_bytes());
                }
            }
        }
        trace!(?rect, pack = self.bound_pack, "soft read_pixels");
        self.stats.read_pixels += 1;
        self.check_error("glReadPixels")
    }

    fn read_pack_buffer(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        let pack = self
            .pack_buffers
            .get(&self.bound_pack)
            .context("no pack buffer is bound")?;
        self.stats.maps += 1;
        sink(pack.as_slice());
        Ok(())
    }

    fn finish(&mut self) {
        self.stats.finishes += 1;
    }

    fn clear_errors(&mut self) -> usize {
        usize::from(self.pending_error.take().is_some())
    }
}

thread_local! {
    static CURRENT_CONTEXT: Cell<u64> = const { Cell::new(0) };
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Observations of a [`SoftContext`] that remain readable from other threads.
#[derive(Debug, Default)]
pub struct ContextProbe {
    thread: Mutex<Option<ThreadId>>,
    activations: AtomicUsize,
    released: AtomicBool,
}

impl ContextProbe {
    /// Thread the context was last made current on.
    pub fn thread(&self) -> Option<ThreadId> {
        *self.thread.lock()
    }

    /// How many times `make_current` has been called.
    pub fn activations(&self) -> usize {
        self.activations.load(Ordering::SeqCst)
    }

    /// `true` once the context has been made not current.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

/// A context that is "current" per thread, tracked in a thread-local.
#[derive(Debug)]
pub struct SoftContext {
    id: u64,
    probe: Option<Arc<ContextProbe>>,
    _thread_bound: PhantomData<*const ()>,
}

impl Default for SoftContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftContext {
    pub fn new() -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            probe: None,
            _thread_bound: PhantomData,
        }
    }

    /// A context that reports what happens to it through `probe`.
    pub fn with_probe(probe: Arc<ContextProbe>) -> Self {
        Self {
            probe: Some(probe),
            ..Self::new()
        }
    }
}

impl GlContext for SoftContext {
    fn make_current(&mut self) -> Result<()> {
        CURRENT_CONTEXT.with(|current| current.set(self.id));
        if let Some(probe) = &self.probe {
            *probe.thread.lock() = Some(thread::current().id());
            probe.activations.fetch_add(1, Ordering::SeqCst);
            probe.released.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_current(&self) -> bool {
        CURRENT_CONTEXT.with(|current| current.get() == self.id)
    }

    fn make_not_current(&mut self) {
        CURRENT_CONTEXT.with(|current| {
            if current.get() == self.id {
                current.set(0);
            }
        });
        if let Some(probe) = &self.probe {
            probe.released.store(true, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(gl: &mut SoftGl, size: Size) -> ObjectId {
        let fb = gl.create_framebuffer().unwrap();
        let color = gl
            .create_renderbuffer(RenderbufferFormat::Rgba8, size)
            .unwrap();
        gl.attach_renderbuffer(Attachment::Color0, color);
        fb
    }

    #[test]
    fn read_pixels_writes_bgra_bytes_into_the_bound_pack_buffer() {
        let mut gl = SoftGl::new();
        target(&mut gl, Size::new(2, 2));
        gl.clear(0xFFFF0000).unwrap();
        gl.set_pixel(1, 1, 0x80112233).unwrap();

        let pack = gl.create_pack_buffer(16).unwrap();
        gl.bind_pack_buffer(pack);
        gl.read_pixels(PixelRect::new(0, 1, 2, 1)).unwrap();

        let mut seen = Vec::new();
        gl.read_pack_buffer(&mut |bytes| seen.extend_from_slice(bytes))
            .unwrap();
        assert_eq!(&seen[..8], &[0x00, 0x00, 0xFF, 0xFF, 0x33, 0x22, 0x11, 0x80]);
        assert_eq!(gl.stats().read_pixels, 1);
        assert_eq!(gl.stats().maps, 1);
    }

    #[test]
    fn read_without_pack_buffer_is_an_error() {
        let mut gl = SoftGl::new();
        target(&mut gl, Size::new(4, 4));
        assert!(gl.read_pixels(PixelRect::new(0, 0, 4, 4)).is_err());
    }

    #[test]
    fn completeness_needs_a_color_attachment() {
        let mut gl = SoftGl::new();
        gl.create_framebuffer().unwrap();
        assert!(matches!(
            gl.framebuffer_status(),
            FramebufferStatus::Incomplete(_)
        ));

        let mut gl = SoftGl::new();
        target(&mut gl, Size::new(4, 4));
        assert_eq!(gl.framebuffer_status(), FramebufferStatus::Complete);
        gl.set_force_incomplete(true);
        assert_eq!(
            gl.framebuffer_status(),
            FramebufferStatus::Incomplete(INCOMPLETE_ATTACHMENT)
        );
    }

    #[test]
    fn drawing_needs_a_bound_target() {
        let mut gl = SoftGl::new();
        assert!(gl.clear(0).is_err());
        let fb = target(&mut gl, Size::new(3, 2));
        gl.fill(|x, y| (y * 10 + x) as u32).unwrap();
        assert_eq!(gl.pixel(2, 1), Some(12));
        gl.delete_framebuffer(fb);
        assert_eq!(gl.bound_framebuffer(), 0);
        assert_eq!(gl.pixel(2, 1), None);
    }

    #[test]
    fn context_is_current_only_on_its_thread() {
        let probe = Arc::new(ContextProbe::default());
        let mut context = SoftContext::with_probe(probe.clone());
        assert!(!context.is_current());
        context.make_current().unwrap();
        assert!(context.is_current());
        assert_eq!(probe.thread(), Some(thread::current().id()));

        let elsewhere = thread::spawn(|| CURRENT_CONTEXT.with(Cell::get))
            .join()
            .unwrap();
        assert_eq!(elsewhere, 0);

        let other = SoftContext::new();
        assert!(!other.is_current());

        context.make_not_current();
        assert!(!context.is_current());
        assert!(probe.released());
        assert_eq!(probe.activations(), 1);
    }
}
