//! [`SharedFrameSource`]: frames delivered as a surface shared with a second
//! graphics API instead of being read back to the CPU.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use gpu_interop::{PresentError, SharedHandle, SharedSurfaceBridge};
use offgl_core::{AsyncHandle, JobError, RenderWorker, Size};
use offgl_readback::{GlApi, GlContext};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::config::FrameSourceConfig;

/// Worker-owned state of a [`SharedFrameSource`].
pub struct SharedTarget<C, G, B> {
    context: C,
    gl: G,
    bridge: B,
    handle: Option<SharedHandle>,
}

impl<C: GlContext, G: GlApi, B: SharedSurfaceBridge> SharedTarget<C, G, B> {
    pub fn gl(&mut self) -> &mut G {
        &mut self.gl
    }

    pub fn bridge(&mut self) -> &mut B {
        &mut self.bridge
    }

    fn ensure_current(&mut self) -> Result<()> {
        if !self.context.is_current() {
            self.context
                .make_current()
                .context("failed to make the render context current")?;
        }
        Ok(())
    }

    /// Draw one frame into the shared target and present it. A failed
    /// present drops the frame and yields `Ok(None)`.
    fn render_frame<F>(&mut self, size: Size, draw: F) -> Result<Option<B::Surface>>
    where
        F: FnOnce(&mut G) -> Result<()>,
    {
        self.ensure_current()?;

        let handle = match self.handle {
            Some(handle) if self.bridge.dimensions() == size => handle,
            current => {
                debug!(from = %self.bridge.dimensions(), to = %size, "resizing shared target");
                self.handle = None;
                let handle = self.bridge.resize_shared_target(current, size)?;
                self.handle = Some(handle);
                handle
            }
        };

        self.bridge.lock(handle)?;
        self.gl.bind_framebuffer(self.bridge.framebuffer());
        let drawn = draw(&mut self.gl);
        self.gl.finish();
        self.gl.bind_framebuffer(0);
        let unlocked = self.bridge.unlock(handle);
        drawn.context("draw callback failed")?;
        unlocked?;

        match self.bridge.present() {
            Ok(surface) => Ok(Some(surface)),
            Err(err) => {
                warn!("present failed, dropping frame: {err}");
                if err == PresentError::DeviceReset {
                    self.handle = None;
                }
                Ok(None)
            }
        }
    }

    fn shutdown(mut self) {
        if let Err(err) = self.ensure_current() {
            warn!("releasing shared target without a current context: {err:#}");
        }
        if let Some(handle) = self.handle.take() {
            self.bridge.unregister(handle);
        }
        self.bridge.cleanup();
        self.context.make_not_current();
    }
}

type SurfaceSlot<S> = Arc<Mutex<Option<S>>>;

/// An in-flight shared-surface frame.
#[derive(Debug)]
pub struct SharedFrameHandle<S> {
    inner: AsyncHandle<SurfaceSlot<S>>,
}

impl<S> SharedFrameHandle<S> {
    pub fn is_completed(&self) -> bool {
        self.inner.is_completed()
    }
}

/// What [`SharedFrameSource::end_render`] produced.
#[derive(Debug)]
pub enum SurfaceOutcome<S> {
    /// No handle, or a handle from another source.
    Skipped,
    Presented(S),
    /// Drawing finished but presentation failed; the frame was dropped.
    Dropped,
    Failed(JobError),
}

impl<S> SurfaceOutcome<S> {
    pub fn into_surface(self) -> Option<S> {
        match self {
            SurfaceOutcome::Presented(surface) => Some(surface),
            _ => None,
        }
    }
}

/// Renders frames on a dedicated worker straight into a render target shared
/// with a second graphics API through a [`SharedSurfaceBridge`].
pub struct SharedFrameSource<C: 'static, G: 'static, B: 'static> {
    worker: RenderWorker<SharedTarget<C, G, B>>,
    size: Size,
}

impl<C, G, B> SharedFrameSource<C, G, B>
where
    C: GlContext + 'static,
    G: GlApi + 'static,
    B: SharedSurfaceBridge + 'static,
{
    /// Start the worker. `factory` runs on the worker thread and builds the
    /// context, the GL entry points and the bridge. With [`RawGl`] the
    /// factory has to make its context current before calling
    /// [`RawGl::load`].
    ///
    /// [`RawGl`]: offgl_readback::RawGl
    /// [`RawGl::load`]: offgl_readback::RawGl::load
    pub fn spawn<Factory>(config: FrameSourceConfig, factory: Factory) -> Result<Self>
    where
        Factory: FnOnce() -> Result<(C, G, B)> + Send + 'static,
    {
        let prepare = move || -> Result<SharedTarget<C, G, B>> {
            let (mut context, gl, bridge) =
                factory().context("failed to create the shared render context")?;
            context
                .make_current()
                .context("failed to make the render context current")?;
            Ok(SharedTarget {
                context,
                gl,
                bridge,
                handle: None,
            })
        };
        let worker =
            RenderWorker::start(config.worker, prepare, SharedTarget::<C, G, B>::shutdown)?;
        Ok(Self {
            worker,
            size: config.size,
        })
    }

    pub fn size(&self) -> Size {
        self.size
    }

    pub fn set_size(&mut self, size: impl Into<Size>) {
        self.size = size.into();
    }

    /// Queue one frame. Returns `None` without queueing when the size is
    /// empty.
    pub fn begin_render<F>(&self, draw: F) -> Option<SharedFrameHandle<B::Surface>>
    where
        F: FnOnce(&mut G) -> Result<()> + Send + 'static,
    {
        let size = self.size;
        if size.is_empty() {
            trace!(%size, "skipping shared frame for empty size");
            return None;
        }

        let slot: SurfaceSlot<B::Surface> = Arc::new(Mutex::new(None));
        let out = slot.clone();
        let handle = self
            .worker
            .submit(move |target: &mut SharedTarget<C, G, B>| {
                *out.lock() = target.render_frame(size, draw)?;
                Ok(())
            });
        Some(SharedFrameHandle {
            inner: handle.with_payload(slot),
        })
    }

    /// Wait for `handle`'s frame and return the presented surface.
    pub fn end_render(
        &self,
        handle: Option<SharedFrameHandle<B::Surface>>,
    ) -> SurfaceOutcome<B::Surface> {
        let Some(frame) = handle else {
            return SurfaceOutcome::Skipped;
        };
        let Some(done) = self.worker.await_handle(frame.inner) else {
            return SurfaceOutcome::Skipped;
        };
        if let Err(error) = done.outcome {
            return SurfaceOutcome::Failed(error);
        }
        match done.payload.and_then(|slot| slot.lock().take()) {
            Some(surface) => SurfaceOutcome::Presented(surface),
            None => SurfaceOutcome::Dropped,
        }
    }

    /// Run `task` on the worker with the context current.
    pub fn submit_task<F>(&self, task: F) -> AsyncHandle
    where
        F: FnOnce(&mut SharedTarget<C, G, B>) -> Result<()> + Send + 'static,
    {
        self.worker.submit(move |target: &mut SharedTarget<C, G, B>| {
            target.ensure_current()?;
            task(target)
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Stop the worker and release the shared target. Also runs on drop.
    pub fn shutdown(&mut self) -> usize {
        self.worker.stop()
    }
}
