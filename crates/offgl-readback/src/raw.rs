//! [`GlApi`] over the system OpenGL driver.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::ptr;

use anyhow::{bail, Result};
use gl::types::{GLenum, GLsizei, GLsizeiptr, GLuint};
use offgl_core::{PixelRect, Size};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::api::{Attachment, FramebufferStatus, GlApi, ObjectId, RenderbufferFormat};

/// Serializes writes to the process-wide `gl` function pointer table.
static GL_LOAD: Mutex<()> = Mutex::new(());

/// A lost context keeps reporting an error, so draining has to stop.
const MAX_PENDING_ERRORS: usize = 32;

/// Real OpenGL entry points, loaded through `gl_loader`.
///
/// Holds no context of its own: every call goes to whatever context is
/// current on the calling thread. `!Send`, because that context is bound to
/// the thread that created this value.
#[derive(Debug)]
pub struct RawGl {
    /// Sizes of the pack buffers this instance created, for mapping.
    pack_lengths: HashMap<GLuint, usize>,
    bound_pack: GLuint,
    _thread_bound: PhantomData<*const ()>,
}

impl RawGl {
    /// Load GL function pointers and wrap them.
    ///
    /// Pointers are resolved against the context current on the calling
    /// thread. A load attempted with no context current fails and is retried
    /// by the next call, so the context factory passed to
    /// `FrameSource::spawn` must make its context current before calling
    /// this (or use `FrameSourceBuilder::spawn_with`, which loads GL after
    /// the worker has made the context current).
    ///
    /// # Safety
    ///
    /// A GL context supporting framebuffer and pixel buffer objects must be
    /// current on the calling thread, and every later call through the
    /// returned value must happen on this thread with that context current.
    pub unsafe fn load() -> Result<Self> {
        {
            let _guard = GL_LOAD.lock();
            if !entry_points_loaded() {
                gl_loader::init_gl();
                gl::load_with(|s| gl_loader::get_proc_address(s).cast());
            }
        }

        if !entry_points_loaded() {
            bail!(
                "OpenGL framebuffer or buffer mapping entry points are unavailable \
                 (is a context current on this thread?)"
            );
        }
        debug!("OpenGL entry points loaded");

        Ok(Self {
            pack_lengths: HashMap::new(),
            bound_pack: 0,
            _thread_bound: PhantomData,
        })
    }

    fn check_error(what: &str) -> Result<()> {
        let code = unsafe { gl::GetError() };
        if code != gl::NO_ERROR {
            bail!("{what} raised GL error 0x{code:04X}");
        }
        Ok(())
    }
}

fn entry_points_loaded() -> bool {
    gl::GenFramebuffers::is_loaded() && gl::MapBuffer::is_loaded()
}

impl GlApi for RawGl {
    fn create_framebuffer(&mut self) -> Result<ObjectId> {
        let mut id: GLuint = 0;
        unsafe {
            gl::GenFramebuffers(1, &mut id);
            gl::BindFramebuffer(gl::FRAMEBUFFER, id);
        }
        if id == 0 {
            bail!("glGenFramebuffers returned no name");
        }
        Ok(id)
    }

    fn delete_framebuffer(&mut self, id: ObjectId) {
        unsafe { gl::DeleteFramebuffers(1, &id) };
    }

    fn bind_framebuffer(&mut self, id: ObjectId) {
        unsafe { gl::BindFramebuffer(gl::FRAMEBUFFER, id) };
    }

    fn create_renderbuffer(&mut self, format: RenderbufferFormat, size: Size) -> Result<ObjectId> {
        let internal: GLenum = match format {
            RenderbufferFormat::Rgba8 => gl::RGBA8,
            RenderbufferFormat::Depth24 => gl::DEPTH_COMPONENT24,
        };
        let mut id: GLuint = 0;
        unsafe {
            gl::GenRenderbuffers(1, &mut id);
            gl::BindRenderbuffer(gl::RENDERBUFFER, id);
            gl::RenderbufferStorage(
                gl::RENDERBUFFER,
                internal,
                size.width as GLsizei,
                size.height as GLsizei,
            );
            gl::BindRenderbuffer(gl::RENDERBUFFER, 0);
        }
        if id == 0 {
            bail!("glGenRenderbuffers returned no name");
        }
        if let Err(err) = Self::check_error("glRenderbufferStorage") {
            unsafe { gl::DeleteRenderbuffers(1, &id) };
            return Err(err);
        }
        Ok(id)
    }

    fn attach_renderbuffer(&mut self, attachment: Attachment, id: ObjectId) {
        let point = match attachment {
            Attachment::Color0 => gl::COLOR_ATTACHMENT0,
            Attachment::Depth => gl::DEPTH_ATTACHMENT,
        };
        unsafe { gl::FramebufferRenderbuffer(gl::FRAMEBUFFER, point, gl::RENDERBUFFER, id) };
    }

    fn delete_renderbuffer(&mut self, id: ObjectId) {
        unsafe { gl::DeleteRenderbuffers(1, &id) };
    }

    fn framebuffer_status(&mut self) -> FramebufferStatus {
        let status = unsafe { gl::CheckFramebufferStatus(gl::FRAMEBUFFER) };
        if status == gl::FRAMEBUFFER_COMPLETE {
            FramebufferStatus::Complete
        } else {
            FramebufferStatus::Incomplete(status)
        }
    }

    fn create_pack_buffer(&mut self, len: usize) -> Result<ObjectId> {
        let mut id: GLuint = 0;
        unsafe {
            gl::GenBuffers(1, &mut id);
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, id);
            gl::BufferData(
                gl::PIXEL_PACK_BUFFER,
                len as GLsizeiptr,
                ptr::null(),
                gl::STREAM_READ,
            );
            gl::BindBuffer(gl::PIXEL_PACK_BUFFER, 0);
        }
        self.bound_pack = 0;
        if id == 0 {
            bail!("glGenBuffers returned no name");
        }
        if let Err(err) = Self::check_error("glBufferData") {
            unsafe { gl::DeleteBuffers(1, &id) };
            return Err(err);
        }
        self.pack_lengths.insert(id, len);
        Ok(id)
    }

    fn delete_buffer(&mut self, id: ObjectId) {
        unsafe { gl::DeleteBuffers(1, &id) };
        self.pack_lengths.remove(&id);
        if self.bound_pack == id {
            self.bound_pack = 0;
        }
    }

    fn bind_pack_buffer(&mut self, id: ObjectId) {
        unsafe { gl::BindBuffer(gl::PIXEL_PACK_BUFFER, id) };
        self.bound_pack = id;
    }

    fn read_pixels(&mut self, rect: PixelRect) -> Result<()> {
        if self.bound_pack == 0 {
            bail!("glReadPixels issued without a pack buffer bound");
        }
        trace!(?rect, pack = self.bound_pack, "glReadPixels");
        unsafe {
            gl::ReadBuffer(gl::COLOR_ATTACHMENT0);
            // With a pack buffer bound the pointer is an offset into it.
            gl::ReadPixels(
                rect.x,
                rect.y,
                rect.width,
                rect.height,
                gl::BGRA,
                gl::UNSIGNED_BYTE,
                ptr::null_mut(),
            );
        }
        Self::check_error("glReadPixels")
    }

    fn read_pack_buffer(&mut self, sink: &mut dyn FnMut(&[u8])) -> Result<()> {
        let Some(&len) = self.pack_lengths.get(&self.bound_pack) else {
            bail!("no mappable pack buffer is bound");
        };
        let mapped = unsafe { gl::MapBuffer(gl::PIXEL_PACK_BUFFER, gl::READ_ONLY) };
        if mapped.is_null() {
            Self::check_error("glMapBuffer")?;
            bail!("glMapBuffer returned null for pack buffer {}", self.bound_pack);
        }
        // SAFETY: the mapping covers the whole buffer, which was allocated
        // with `len` bytes, and stays valid until `UnmapBuffer` below.
        let bytes = unsafe { std::slice::from_raw_parts(mapped as *const u8, len) };
        sink(bytes);
        let intact = unsafe { gl::UnmapBuffer(gl::PIXEL_PACK_BUFFER) };
        if intact == gl::FALSE {
            bail!("pack buffer {} was corrupted while mapped", self.bound_pack);
        }
        Ok(())
    }

    fn finish(&mut self) {
        unsafe { gl::Finish() };
    }

    fn clear_errors(&mut self) -> usize {
        let mut drained = 0;
        while drained < MAX_PENDING_ERRORS && unsafe { gl::GetError() } != gl::NO_ERROR {
            drained += 1;
        }
        drained
    }
}
