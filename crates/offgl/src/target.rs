//! GL state owned by the render worker.

use anyhow::{Context as _, Result};
use offgl_core::Size;
use offgl_readback::{GlApi, GlContext, ReadbackMode, SurfaceManager};
use tracing::{trace, warn};

use crate::buffer::PixelLoan;

/// Everything the render worker owns: the context, the GL entry points and
/// the render target. Only reachable from jobs running on the worker.
#[derive(Debug)]
pub struct WorkerGl<C, G> {
    context: C,
    gl: G,
    surfaces: SurfaceManager,
}

impl<C: GlContext, G: GlApi> WorkerGl<C, G> {
    pub(crate) fn new(context: C, gl: G, readback: ReadbackMode) -> Self {
        Self {
            context,
            gl,
            surfaces: SurfaceManager::new(readback),
        }
    }

    pub fn gl(&mut self) -> &mut G {
        &mut self.gl
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn surfaces(&self) -> &SurfaceManager {
        &self.surfaces
    }

    /// Make the owned context current if something else replaced it.
    pub fn ensure_current(&mut self) -> Result<()> {
        if !self.context.is_current() {
            trace!("re-activating render context");
            self.context
                .make_current()
                .context("failed to make the render context current")?;
        }
        Ok(())
    }

    /// Bind the target for `size`, run `draw`, wait for the GPU and copy the
    /// pixels into `loan`.
    pub(crate) fn render_frame<F>(&mut self, size: Size, draw: F, loan: &mut PixelLoan) -> Result<()>
    where
        F: FnOnce(&mut G) -> Result<()>,
    {
        self.ensure_current()?;
        if !self.surfaces.bind(&mut self.gl, size)? {
            return Ok(());
        }
        draw(&mut self.gl).context("draw callback failed")?;
        self.gl.finish();
        // SAFETY: the buffer behind the loan stays locked until the frame
        // handle is consumed, which waits for this job first.
        let dst = unsafe { loan.as_mut_slice() };
        self.surfaces.readback(&mut self.gl, size, dst)?;
        trace!(%size, "frame read back");
        Ok(())
    }

    /// Free the render target and leave no context current.
    pub(crate) fn shutdown(mut self) {
        if let Err(err) = self.ensure_current() {
            warn!("releasing render target without a current context: {err:#}");
        }
        self.surfaces.release(&mut self.gl);
        self.context.make_not_current();
    }
}
