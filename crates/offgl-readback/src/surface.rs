//! GPU render targets and pixel readback.
//!
//! [`SurfaceManager`] owns one framebuffer with a color and a depth
//! renderbuffer, plus the pixel-pack buffers used to move the color
//! attachment into CPU memory. Everything is sized for one [`Size`] and is
//! recreated as a unit whenever a different size is bound.
//!
//! In [`ReadbackMode::Double`] the image is split at `height >> 1`
//! scanlines: both halves are queued into their own pack buffer before the
//! first one is mapped, so the second transfer proceeds while the first is
//! copied out.

use anyhow::{bail, Result};
use offgl_core::{PixelRect, Size};
use tracing::{debug, error, trace, warn};

use crate::api::{Attachment, FramebufferStatus, GlApi, ObjectId, RenderbufferFormat};

/// How many pack buffers a readback goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadbackMode {
    /// One pack buffer holding the whole image.
    Single,
    /// Two pack buffers, one per half of the scanlines.
    #[default]
    Double,
}

/// Scanlines `first_row..first_row + rows` staged through one pack buffer.
#[derive(Debug, Clone, Copy)]
struct PackChunk {
    buffer: ObjectId,
    first_row: i32,
    rows: i32,
}

#[derive(Debug)]
struct SurfaceSet {
    size: Size,
    framebuffer: ObjectId,
    color: ObjectId,
    depth: ObjectId,
    chunks: Vec<PackChunk>,
    /// Status reported when the framebuffer failed its completeness check.
    incomplete: Option<u32>,
}

impl SurfaceSet {
    fn empty(size: Size) -> Self {
        Self {
            size,
            framebuffer: 0,
            color: 0,
            depth: 0,
            chunks: Vec::new(),
            incomplete: None,
        }
    }

    fn populate(&mut self, gl: &mut dyn GlApi, mode: ReadbackMode) -> Result<()> {
        let size = self.size;
        let stale = gl.clear_errors();
        if stale > 0 {
            debug!(stale, "discarded GL errors raised before building the render target");
        }
        self.framebuffer = gl.create_framebuffer()?;
        gl.bind_framebuffer(self.framebuffer);

        self.color = gl.create_renderbuffer(RenderbufferFormat::Rgba8, size)?;
        gl.attach_renderbuffer(Attachment::Color0, self.color);
        self.depth = gl.create_renderbuffer(RenderbufferFormat::Depth24, size)?;
        gl.attach_renderbuffer(Attachment::Depth, self.depth);

        if let FramebufferStatus::Incomplete(status) = gl.framebuffer_status() {
            self.incomplete = Some(status);
            bail!("framebuffer for {size} is incomplete (status 0x{status:04X})");
        }

        for (first_row, rows) in row_ranges(mode, size) {
            let buffer = gl.create_pack_buffer(size.rows_byte_len(rows))?;
            self.chunks.push(PackChunk {
                buffer,
                first_row,
                rows,
            });
        }
        Ok(())
    }

    /// Delete every object this set created. Safe on a partially built set.
    fn destroy(&mut self, gl: &mut dyn GlApi) {
        gl.bind_pack_buffer(0);
        for chunk in self.chunks.drain(..) {
            gl.delete_buffer(chunk.buffer);
        }
        gl.bind_framebuffer(0);
        if self.framebuffer != 0 {
            gl.delete_framebuffer(self.framebuffer);
            self.framebuffer = 0;
        }
        if self.color != 0 {
            gl.delete_renderbuffer(self.color);
            self.color = 0;
        }
        if self.depth != 0 {
            gl.delete_renderbuffer(self.depth);
            self.depth = 0;
        }
    }
}

/// Row ranges `(first_row, rows)` to stage through separate pack buffers.
/// Empty halves (a one-row image split in two) are left out.
fn row_ranges(mode: ReadbackMode, size: Size) -> Vec<(i32, i32)> {
    match mode {
        ReadbackMode::Single => vec![(0, size.height)],
        ReadbackMode::Double => {
            let (top, bottom) = size.split_rows();
            [(0, top), (top, bottom)]
                .into_iter()
                .filter(|&(_, rows)| rows > 0)
                .collect()
        }
    }
}

/// Lazily (re)created render target plus readback staging.
///
/// Must only be driven from the thread that owns the GL context.
#[derive(Debug)]
pub struct SurfaceManager {
    mode: ReadbackMode,
    surfaces: Option<SurfaceSet>,
    generation: u64,
    /// Set once construction has failed; the manager refuses further work.
    poisoned: Option<String>,
}

impl SurfaceManager {
    pub fn new(mode: ReadbackMode) -> Self {
        Self {
            mode,
            surfaces: None,
            generation: 0,
            poisoned: None,
        }
    }

    pub fn mode(&self) -> ReadbackMode {
        self.mode
    }

    /// Size the current objects were created for.
    pub fn current_size(&self) -> Option<Size> {
        self.surfaces.as_ref().map(|set| set.size)
    }

    /// Incremented every time the object set is (re)created.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn framebuffer(&self) -> Option<ObjectId> {
        self.surfaces.as_ref().map(|set| set.framebuffer)
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.is_some()
    }

    /// Make sure objects sized for `size` exist and bind the framebuffer.
    ///
    /// Returns `Ok(false)` without touching the GPU when `size` is empty. A
    /// framebuffer that turns out incomplete is fatal for this manager:
    /// every object is deleted and this and all later calls fail. Any other
    /// allocation failure only fails this call; the next one retries.
    pub fn bind(&mut self, gl: &mut dyn GlApi, size: Size) -> Result<bool> {
        if let Some(reason) = &self.poisoned {
            bail!("render target unusable after failed construction: {reason}");
        }
        if size.is_empty() {
            trace!(%size, "skipping bind for empty size");
            return Ok(false);
        }

        let framebuffer = match &self.surfaces {
            Some(set) if set.size == size => set.framebuffer,
            _ => self.recreate(gl, size)?,
        };
        gl.bind_framebuffer(framebuffer);
        Ok(true)
    }

    fn recreate(&mut self, gl: &mut dyn GlApi, size: Size) -> Result<ObjectId> {
        let previous = self.current_size();
        self.release(gl);

        let mut set = SurfaceSet::empty(size);
        if let Err(err) = set.populate(gl, self.mode) {
            set.destroy(gl);
            if set.incomplete.is_some() {
                error!(%size, "render target is unusable: {err:#}");
                self.poisoned = Some(format!("{err:#}"));
            } else {
                warn!(%size, "failed to create render target: {err:#}");
            }
            return Err(err);
        }

        self.generation += 1;
        debug!(
            ?previous,
            %size,
            mode = ?self.mode,
            generation = self.generation,
            "render target created"
        );
        let framebuffer = set.framebuffer;
        self.surfaces = Some(set);
        Ok(framebuffer)
    }

    /// Copy the color attachment into `dst` as tightly packed BGRA rows,
    /// framebuffer row 0 first.
    ///
    /// Expects drawing to have completed (callers issue
    /// [`GlApi::finish`] first) and `size` to be the size last bound.
    /// Returns `Ok(false)` for an empty size.
    pub fn readback(&mut self, gl: &mut dyn GlApi, size: Size, dst: &mut [u8]) -> Result<bool> {
        if size.is_empty() {
            return Ok(false);
        }
        let Some(set) = &self.surfaces else {
            bail!("readback of {size} before any render target was bound");
        };
        if set.size != size {
            bail!("readback of {size} but the render target is {}", set.size);
        }
        if dst.len() < size.byte_len() {
            bail!(
                "destination holds {} bytes, {size} needs {}",
                dst.len(),
                size.byte_len()
            );
        }

        let result = transfer(gl, size, &set.chunks, dst);
        gl.bind_pack_buffer(0);
        result.map(|()| true)
    }

    /// Delete all GPU objects. The next [`bind`](Self::bind) recreates them.
    pub fn release(&mut self, gl: &mut dyn GlApi) {
        if let Some(mut set) = self.surfaces.take() {
            debug!(size = %set.size, "releasing render target");
            set.destroy(gl);
        }
    }
}

fn transfer(gl: &mut dyn GlApi, size: Size, chunks: &[PackChunk], dst: &mut [u8]) -> Result<()> {
    // Errors left by the draw callback are not the readback's.
    let stale = gl.clear_errors();
    if stale > 0 {
        trace!(stale, "discarded GL errors raised while drawing");
    }

    // Queue every transfer before mapping any buffer.
    for chunk in chunks {
        gl.bind_pack_buffer(chunk.buffer);
        gl.read_pixels(PixelRect::new(0, chunk.first_row, size.width, chunk.rows))?;
    }

    for chunk in chunks {
        let offset = size.rows_byte_len(chunk.first_row);
        let len = size.rows_byte_len(chunk.rows);
        let out = &mut dst[offset..offset + len];
        gl.bind_pack_buffer(chunk.buffer);
        gl.read_pack_buffer(&mut |bytes| {
            let n = bytes.len().min(out.len());
            out[..n].copy_from_slice(&bytes[..n]);
        })?;
        trace!(first_row = chunk.first_row, rows = chunk.rows, "pack buffer copied out");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::soft::SoftGl;

    fn pattern(x: i32, y: i32) -> u32 {
        0xFF00_0000 | ((y as u32 & 0xFFF) << 12) | (x as u32 & 0xFFF)
    }

    fn render(gl: &mut SoftGl, surfaces: &mut SurfaceManager, size: Size) -> Vec<u8> {
        assert!(surfaces.bind(gl, size).unwrap());
        gl.fill(pattern).unwrap();
        gl.finish();
        let mut dst = vec![0u8; size.byte_len()];
        assert!(surfaces.readback(gl, size, &mut dst).unwrap());
        dst
    }

    fn texel(dst: &[u8], size: Size, x: i32, y: i32) -> u32 {
        let i = ((y * size.width + x) * 4) as usize;
        u32::from_le_bytes([dst[i], dst[i + 1], dst[i + 2], dst[i + 3]])
    }

    fn assert_pattern(dst: &[u8], size: Size) {
        for y in 0..size.height {
            for x in 0..size.width {
                assert_eq!(texel(dst, size, x, y), pattern(x, y), "texel ({x}, {y}) of {size}");
            }
        }
    }

    #[test]
    fn double_readback_reassembles_both_halves() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        for size in [Size::new(16, 16), Size::new(5, 7), Size::new(3, 2)] {
            let dst = render(&mut gl, &mut surfaces, size);
            assert_pattern(&dst, size);
            // Last row of the top half and first row of the bottom half.
            let split = size.height >> 1;
            assert_eq!(texel(&dst, size, 0, split - 1), pattern(0, split - 1));
            assert_eq!(texel(&dst, size, 0, split), pattern(0, split));
        }
        assert_eq!(gl.bound_pack_buffer(), 0);
    }

    #[test]
    fn single_readback_uses_one_pack_buffer() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Single);
        let size = Size::new(9, 6);
        let dst = render(&mut gl, &mut surfaces, size);
        assert_pattern(&dst, size);
        assert_eq!(gl.live_pack_buffers(), 1);
        assert_eq!(gl.stats().read_pixels, 1);
        assert_eq!(gl.stats().maps, 1);
    }

    #[test]
    fn double_readback_queues_both_reads_before_mapping() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        render(&mut gl, &mut surfaces, Size::new(4, 4));
        assert_eq!(gl.live_pack_buffers(), 2);
        assert_eq!(gl.stats().read_pixels, 2);
        assert_eq!(gl.stats().maps, 2);
    }

    #[test]
    fn single_row_and_single_column_targets() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);

        let row = Size::new(64, 1);
        assert_pattern(&render(&mut gl, &mut surfaces, row), row);
        // The empty top half gets no pack buffer.
        assert_eq!(gl.live_pack_buffers(), 1);

        let column = Size::new(1, 64);
        assert_pattern(&render(&mut gl, &mut surfaces, column), column);
        assert_eq!(gl.live_pack_buffers(), 2);
    }

    #[test]
    fn same_size_reuses_objects() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        let size = Size::new(8, 8);
        render(&mut gl, &mut surfaces, size);
        render(&mut gl, &mut surfaces, size);
        assert_eq!(surfaces.generation(), 1);
        assert_eq!(gl.stats().framebuffers_created, 1);
    }

    #[test]
    fn resize_recreates_everything_without_leaking() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        let sizes = [Size::new(32, 32), Size::new(8, 4), Size::new(32, 32)];
        let mut framebuffers = Vec::new();
        for (i, size) in sizes.into_iter().enumerate() {
            let dst = render(&mut gl, &mut surfaces, size);
            assert_pattern(&dst, size);
            assert_eq!(surfaces.generation(), i as u64 + 1);
            assert_eq!(surfaces.current_size(), Some(size));
            // One framebuffer, color + depth, two pack buffers.
            assert_eq!(gl.live_objects(), 5);
            framebuffers.extend(surfaces.framebuffer());
        }
        // Growing back to an earlier size still built fresh objects.
        framebuffers.dedup();
        assert_eq!(framebuffers.len(), 3);

        surfaces.release(&mut gl);
        assert_eq!(gl.live_objects(), 0);
        assert_eq!(surfaces.current_size(), None);
    }

    #[test]
    fn empty_size_touches_nothing() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        assert!(!surfaces.bind(&mut gl, Size::new(0, 64)).unwrap());
        assert!(!surfaces.readback(&mut gl, Size::new(0, 64), &mut []).unwrap());
        assert_eq!(gl.stats().framebuffers_created, 0);
        assert_eq!(gl.live_objects(), 0);
        assert_eq!(surfaces.generation(), 0);
    }

    #[test]
    fn incomplete_framebuffer_poisons_the_manager() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        gl.set_force_incomplete(true);

        let err = surfaces.bind(&mut gl, Size::new(8, 8)).unwrap_err();
        assert!(format!("{err:#}").contains("incomplete"));
        assert!(surfaces.is_poisoned());
        assert_eq!(gl.live_objects(), 0);

        // Not retried, even once the driver would cooperate.
        gl.set_force_incomplete(false);
        assert!(surfaces.bind(&mut gl, Size::new(8, 8)).is_err());
        assert_eq!(gl.stats().framebuffers_created, 1);
    }

    #[test]
    fn error_left_by_earlier_commands_does_not_poison_bind() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        // GL_INVALID_ENUM from a setup hook that ran before the first frame.
        gl.raise_error(0x0500);

        let size = Size::new(8, 6);
        let dst = render(&mut gl, &mut surfaces, size);
        assert_pattern(&dst, size);
        assert!(!surfaces.is_poisoned());
        assert_eq!(gl.pending_error(), None);
    }

    #[test]
    fn error_left_by_drawing_does_not_fail_readback() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        let size = Size::new(5, 5);
        assert!(surfaces.bind(&mut gl, size).unwrap());
        gl.fill(pattern).unwrap();
        gl.raise_error(0x0502);
        gl.finish();

        let mut dst = vec![0u8; size.byte_len()];
        assert!(surfaces.readback(&mut gl, size, &mut dst).unwrap());
        assert_pattern(&dst, size);
    }

    #[test]
    fn allocation_failure_is_retried_on_the_next_bind() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        gl.set_out_of_memory(true);

        let err = surfaces.bind(&mut gl, Size::new(8, 8)).unwrap_err();
        assert!(format!("{err:#}").contains("0x0505"));
        assert!(!surfaces.is_poisoned());
        assert_eq!(gl.live_objects(), 0);
        assert_eq!(surfaces.current_size(), None);

        gl.set_out_of_memory(false);
        let size = Size::new(8, 8);
        assert_pattern(&render(&mut gl, &mut surfaces, size), size);
        assert_eq!(surfaces.generation(), 1);
    }

    #[test]
    fn readback_rejects_mismatched_requests() {
        let mut gl = SoftGl::new();
        let mut surfaces = SurfaceManager::new(ReadbackMode::Double);
        let mut dst = vec![0u8; 64];
        assert!(surfaces.readback(&mut gl, Size::new(4, 4), &mut dst).is_err());

        surfaces.bind(&mut gl, Size::new(4, 4)).unwrap();
        assert!(surfaces.readback(&mut gl, Size::new(2, 2), &mut dst).is_err());
        let mut short = vec![0u8; 8];
        assert!(surfaces.readback(&mut gl, Size::new(4, 4), &mut short).is_err());
    }
}
