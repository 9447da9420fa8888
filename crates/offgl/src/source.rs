//! [`FrameSource`], the begin/end render façade for a polling UI loop.
//!
//! ```text
//! UI thread                         render worker
//! ---------                         -------------
//! begin_render ──lock buffer──┐
//!              submit job ────┼──▶  make context current
//!                             │     bind target (recreate on resize)
//!                             │     draw(gl)
//!                             │     finish + read back into loan
//! end_render ◀──wait──────────┴──   signal
//!   mark dirty, unlock, return buffer
//! ```

use std::marker::PhantomData;

use anyhow::{Context as _, Result};
use offgl_core::{AsyncHandle, JobError, RenderWorker, Size};
use offgl_readback::{GlApi, GlContext};
use tracing::{debug, trace, warn};

use crate::buffer::PixelBuffer;
use crate::config::FrameSourceConfig;
use crate::target::WorkerGl;

/// One-shot setup or teardown callback run on the render worker.
pub type GlHook<G> = Box<dyn FnOnce(&mut G) -> Result<()> + Send + 'static>;

/// An in-flight frame. Pair it with [`FrameSource::end_render`].
///
/// The destination buffer travels inside the handle. Dropping the handle
/// without ending it blocks until the worker is done writing into the
/// buffer, then unlocks and frees it.
#[derive(Debug)]
pub struct FrameHandle<B: PixelBuffer> {
    inner: Option<AsyncHandle<B>>,
    size: Size,
}

impl<B: PixelBuffer> FrameHandle<B> {
    /// Non-blocking poll.
    pub fn is_completed(&self) -> bool {
        self.inner.as_ref().map_or(true, AsyncHandle::is_completed)
    }

    /// Size this frame was submitted with.
    pub fn size(&self) -> Size {
        self.size
    }
}

impl<B: PixelBuffer> Drop for FrameHandle<B> {
    fn drop(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            trace!(job = inner.id(), "frame handle dropped before end_render");
            let _ = inner.wait();
            if let Some(mut buffer) = inner.take_payload() {
                buffer.unlock();
            }
        }
    }
}

/// What [`FrameSource::end_render`] produced.
#[derive(Debug)]
pub enum FrameOutcome<B: PixelBuffer> {
    /// No frame to present this tick.
    Skipped,
    /// The handle was issued by another source. It is handed back untouched
    /// so it can be ended there; nothing was waited on.
    Foreign(FrameHandle<B>),
    /// The buffer holds the new frame, marked dirty and unlocked.
    Presented(B),
    /// The job did not complete. The buffer is unlocked but not marked dirty.
    Failed { buffer: B, error: JobError },
}

impl<B: PixelBuffer> FrameOutcome<B> {
    pub fn is_presented(&self) -> bool {
        matches!(self, FrameOutcome::Presented(_))
    }

    /// The buffer to reuse for the next frame, whatever happened to this one.
    ///
    /// A [`Foreign`](FrameOutcome::Foreign) handle is dropped here, which
    /// waits for its job on the other source.
    pub fn into_buffer(self) -> Option<B> {
        match self {
            FrameOutcome::Skipped | FrameOutcome::Foreign(_) => None,
            FrameOutcome::Presented(buffer) | FrameOutcome::Failed { buffer, .. } => Some(buffer),
        }
    }
}

/// Builder for a [`FrameSource`] with optional worker hooks.
pub struct FrameSourceBuilder<C, G> {
    config: FrameSourceConfig,
    on_prepare: Option<GlHook<G>>,
    on_finalize: Option<GlHook<G>>,
    _context: PhantomData<fn() -> C>,
}

impl<C: GlContext + 'static, G: GlApi + 'static> FrameSourceBuilder<C, G> {
    /// Run `hook` once on the worker after the context is current and
    /// before the first job. An error aborts [`spawn`](Self::spawn).
    pub fn on_prepare<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut G) -> Result<()> + Send + 'static,
    {
        self.on_prepare = Some(Box::new(hook));
        self
    }

    /// Run `hook` once on the worker after the last job, before the render
    /// target and context are released. Errors are logged.
    pub fn on_finalize<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&mut G) -> Result<()> + Send + 'static,
    {
        self.on_finalize = Some(Box::new(hook));
        self
    }

    /// Start the render worker. `factory` runs on the worker thread and
    /// creates the context and GL entry points it will own.
    ///
    /// The worker makes the context current only after `factory` returns,
    /// so a factory that loads GL function pointers (such as
    /// `RawGl::load`) must make its context current first. Use
    /// [`spawn_with`](Self::spawn_with) to have the worker do that.
    pub fn spawn<Factory>(self, factory: Factory) -> Result<FrameSource<C, G>>
    where
        Factory: FnOnce() -> Result<(C, G)> + Send + 'static,
    {
        self.start(move || {
            let (mut context, gl) = factory().context("failed to create the render context")?;
            context
                .make_current()
                .context("failed to make the render context current")?;
            Ok((context, gl))
        })
    }

    /// Start the render worker, creating the context with `create_context`
    /// and then, once the worker has made it current, the GL entry points
    /// with `load_gl`. Both run on the worker thread.
    pub fn spawn_with<CreateContext, LoadGl>(
        self,
        create_context: CreateContext,
        load_gl: LoadGl,
    ) -> Result<FrameSource<C, G>>
    where
        CreateContext: FnOnce() -> Result<C> + Send + 'static,
        LoadGl: FnOnce() -> Result<G> + Send + 'static,
    {
        self.start(move || {
            let mut context = create_context().context("failed to create the render context")?;
            context
                .make_current()
                .context("failed to make the render context current")?;
            let gl = load_gl().context("failed to load OpenGL entry points")?;
            Ok((context, gl))
        })
    }

    /// `build` runs on the worker and returns a context that is current.
    fn start<Build>(self, build: Build) -> Result<FrameSource<C, G>>
    where
        Build: FnOnce() -> Result<(C, G)> + Send + 'static,
    {
        let FrameSourceBuilder {
            config,
            on_prepare,
            on_finalize,
            ..
        } = self;
        let readback = config.readback;

        let prepare = move || -> Result<WorkerGl<C, G>> {
            let (context, gl) = build()?;
            let mut target = WorkerGl::new(context, gl, readback);
            if let Some(hook) = on_prepare {
                hook(target.gl()).context("prepare hook failed")?;
            }
            debug!(?readback, "render context ready");
            Ok(target)
        };

        let finalize = move |mut target: WorkerGl<C, G>| {
            if let Some(hook) = on_finalize {
                let result = target.ensure_current().and_then(|()| hook(target.gl()));
                if let Err(err) = result {
                    warn!("finalize hook failed: {err:#}");
                }
            }
            target.shutdown();
        };

        let worker = RenderWorker::start(config.worker, prepare, finalize)?;
        Ok(FrameSource {
            worker,
            size: config.size,
        })
    }
}

/// Renders frames on a dedicated worker and reads them back into
/// UI-owned [`PixelBuffer`]s.
pub struct FrameSource<C: 'static, G: 'static> {
    worker: RenderWorker<WorkerGl<C, G>>,
    size: Size,
}

impl<C: GlContext + 'static, G: GlApi + 'static> FrameSource<C, G> {
    pub fn builder(config: FrameSourceConfig) -> FrameSourceBuilder<C, G> {
        FrameSourceBuilder {
            config,
            on_prepare: None,
            on_finalize: None,
            _context: PhantomData,
        }
    }

    /// Start without hooks. See [`FrameSourceBuilder::spawn`].
    pub fn spawn<Factory>(config: FrameSourceConfig, factory: Factory) -> Result<Self>
    where
        Factory: FnOnce() -> Result<(C, G)> + Send + 'static,
    {
        Self::builder(config).spawn(factory)
    }

    pub fn size(&self) -> Size {
        self.size
    }

    /// Takes effect at the next [`begin_render`](Self::begin_render). Frames
    /// already submitted keep the size they were submitted with.
    pub fn set_size(&mut self, size: impl Into<Size>) {
        self.size = size.into();
    }

    /// Queue one frame and return immediately.
    ///
    /// The buffer in `backbuffer` is reused if it already has the current
    /// size; otherwise a new one is allocated. It is locked and moved into
    /// the returned handle, leaving `backbuffer` empty until
    /// [`end_render`](Self::end_render) hands it back.
    ///
    /// Returns `Ok(None)` without touching `backbuffer` or queueing anything
    /// when the current size is empty.
    pub fn begin_render<B, F>(
        &self,
        draw: F,
        backbuffer: &mut Option<B>,
    ) -> Result<Option<FrameHandle<B>>>
    where
        B: PixelBuffer,
        F: FnOnce(&mut G) -> Result<()> + Send + 'static,
    {
        let size = self.size;
        if size.is_empty() {
            trace!(%size, "skipping frame for empty size");
            return Ok(None);
        }

        let mut buffer = match backbuffer.take() {
            Some(buffer) if buffer.size() == size => buffer,
            stale => {
                if let Some(old) = stale {
                    debug!(from = %old.size(), to = %size, "reallocating back buffer");
                }
                B::allocate(size)?
            }
        };
        let mut loan = match buffer.lock() {
            Ok(loan) => loan,
            Err(err) => {
                *backbuffer = Some(buffer);
                return Err(err);
            }
        };

        let handle = self
            .worker
            .submit(move |target: &mut WorkerGl<C, G>| target.render_frame(size, draw, &mut loan));
        trace!(job = handle.id(), %size, "frame submitted");

        Ok(Some(FrameHandle {
            inner: Some(handle.with_payload(buffer)),
            size,
        }))
    }

    /// Wait for `handle`'s frame and hand its buffer back.
    ///
    /// `None` yields [`FrameOutcome::Skipped`]. A handle issued by another
    /// source is returned as [`FrameOutcome::Foreign`] without waiting.
    pub fn end_render<B: PixelBuffer>(&self, handle: Option<FrameHandle<B>>) -> FrameOutcome<B> {
        let Some(mut frame) = handle else {
            trace!("end_render without a frame");
            return FrameOutcome::Skipped;
        };
        let Some(inner) = frame.inner.take() else {
            return FrameOutcome::Skipped;
        };
        if !self.worker.owns(&inner) {
            warn!(
                owner = inner.owner(),
                "end_render given a frame from another source"
            );
            frame.inner = Some(inner);
            return FrameOutcome::Foreign(frame);
        }

        let Some(done) = self.worker.await_handle(inner) else {
            return FrameOutcome::Skipped;
        };
        let Some(mut buffer) = done.payload else {
            return FrameOutcome::Skipped;
        };
        match done.outcome {
            Ok(()) => {
                buffer.add_dirty_rect(buffer.size().full_rect());
                buffer.unlock();
                FrameOutcome::Presented(buffer)
            }
            Err(error) => {
                buffer.unlock();
                warn!(job = done.id, "frame not rendered: {error}");
                FrameOutcome::Failed { buffer, error }
            }
        }
    }

    /// Run `task` on the worker with the context current.
    pub fn submit_task<F>(&self, task: F) -> AsyncHandle
    where
        F: FnOnce(&mut WorkerGl<C, G>) -> Result<()> + Send + 'static,
    {
        self.worker.submit(move |target: &mut WorkerGl<C, G>| {
            target.ensure_current()?;
            task(target)
        })
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Frames and tasks queued but not yet started.
    pub fn pending(&self) -> usize {
        self.worker.pending()
    }

    /// Stop the worker, release the render target and the context. Returns
    /// how many queued jobs were discarded. Also runs on drop.
    pub fn shutdown(&mut self) -> usize {
        self.worker.stop()
    }
}
