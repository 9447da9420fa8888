//! CPU-visible destination buffers.

use std::ptr::NonNull;

use anyhow::{bail, Context as _, Result};
use offgl_core::{PixelRect, Size, BYTES_PER_PIXEL};

/// A lockable BGRA pixel buffer owned by the UI side.
///
/// While locked, the buffer's memory is on loan to the render worker, which
/// writes through the [`PixelLoan`] returned by [`lock`](Self::lock). The
/// memory must stay at the same address until [`unlock`](Self::unlock).
pub trait PixelBuffer: Sized {
    /// A zeroed buffer of `size` pixels.
    fn allocate(size: Size) -> Result<Self>;

    fn size(&self) -> Size;

    /// Take exclusive write access and expose the backing memory.
    fn lock(&mut self) -> Result<PixelLoan>;

    /// Record that `rect` changed while locked.
    fn add_dirty_rect(&mut self, rect: PixelRect);

    fn unlock(&mut self);
}

/// Raw, sendable view of a locked buffer's memory.
#[derive(Debug)]
pub struct PixelLoan {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: a loan is only created from a locked buffer whose owner guarantees
// the memory stays valid and untouched until unlock, and exactly one job
// writes through it.
unsafe impl Send for PixelLoan {}

impl PixelLoan {
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of `len` bytes, and nothing
    /// else may access that memory until the buffer that issued the loan is
    /// unlocked.
    pub unsafe fn new(ptr: NonNull<u8>, len: usize) -> Self {
        Self { ptr, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The issuing buffer must still be locked.
    pub(crate) unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
    }
}

/// Heap-backed [`PixelBuffer`].
#[derive(Debug)]
pub struct CpuBitmap {
    size: Size,
    pixels: Box<[u8]>,
    locked: bool,
    dirty: Option<PixelRect>,
}

impl CpuBitmap {
    /// Tightly packed BGRA rows, row 0 first.
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Pixel at `(x, y)` as a little-endian BGRA word (`0xAARRGGBB`).
    pub fn pixel(&self, x: i32, y: i32) -> Option<u32> {
        if x < 0 || y < 0 || x >= self.size.width || y >= self.size.height {
            return None;
        }
        let at = (y as usize * self.size.width as usize + x as usize) * BYTES_PER_PIXEL;
        let bytes = self.pixels.get(at..at + BYTES_PER_PIXEL)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Accumulated dirty region since the last call.
    pub fn take_dirty(&mut self) -> Option<PixelRect> {
        self.dirty.take()
    }
}

impl PixelBuffer for CpuBitmap {
    fn allocate(size: Size) -> Result<Self> {
        if size.is_empty() {
            bail!("cannot allocate a {size} bitmap");
        }
        Ok(Self {
            size,
            pixels: vec![0; size.byte_len()].into_boxed_slice(),
            locked: false,
            dirty: None,
        })
    }

    fn size(&self) -> Size {
        self.size
    }

    fn lock(&mut self) -> Result<PixelLoan> {
        if self.locked {
            bail!("bitmap is already locked");
        }
        let ptr = NonNull::new(self.pixels.as_mut_ptr()).context("bitmap has no storage")?;
        self.locked = true;
        // SAFETY: the boxed slice never moves or reallocates, and `locked`
        // keeps a second loan from being issued until `unlock`.
        Ok(unsafe { PixelLoan::new(ptr, self.pixels.len()) })
    }

    fn add_dirty_rect(&mut self, rect: PixelRect) {
        self.dirty = Some(match self.dirty {
            Some(dirty) => dirty.union(&rect),
            None => rect,
        });
    }

    fn unlock(&mut self) {
        self.locked = false;
    }
}
