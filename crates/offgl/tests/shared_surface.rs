use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use gpu_interop::{PresentError, SharedHandle, SharedSurfaceBridge};
use offgl::{FrameSourceConfig, JobError, SharedFrameSource, Size, SurfaceOutcome};
use offgl_readback::{SoftContext, SoftGl};
use parking_lot::Mutex;

const BRIDGE_FBO: u32 = 42;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Event {
    Register(Size),
    Lock,
    Draw(u32),
    Unlock,
    Present,
    Unregister,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct MockSurface {
    size: Size,
    serial: u64,
}

type Log = Arc<Mutex<Vec<Event>>>;

/// Records every bridge call and fails presents on request.
struct MockBridge {
    log: Log,
    failures: Arc<Mutex<VecDeque<PresentError>>>,
    registered: Option<(SharedHandle, Size)>,
    locked: bool,
    next_handle: u64,
    presented: u64,
}

impl SharedSurfaceBridge for MockBridge {
    type Surface = MockSurface;

    fn register_shared_target(&mut self, size: Size) -> Result<SharedHandle> {
        self.log.lock().push(Event::Register(size));
        self.next_handle += 1;
        let handle = SharedHandle::new(self.next_handle);
        self.registered = Some((handle, size));
        Ok(handle)
    }

    fn lock(&mut self, handle: SharedHandle) -> Result<()> {
        match self.registered {
            Some((registered, _)) if registered == handle => {}
            _ => bail!("lock on unknown handle {}", handle.id()),
        }
        if self.locked {
            bail!("already locked");
        }
        self.locked = true;
        self.log.lock().push(Event::Lock);
        Ok(())
    }

    fn unlock(&mut self, _handle: SharedHandle) -> Result<()> {
        if !self.locked {
            bail!("unlock without lock");
        }
        self.locked = false;
        self.log.lock().push(Event::Unlock);
        Ok(())
    }

    fn unregister(&mut self, handle: SharedHandle) {
        if matches!(self.registered, Some((registered, _)) if registered == handle) {
            self.registered = None;
            self.log.lock().push(Event::Unregister);
        }
    }

    fn framebuffer(&self) -> u32 {
        BRIDGE_FBO
    }

    fn present(&mut self) -> Result<MockSurface, PresentError> {
        self.log.lock().push(Event::Present);
        if let Some(failure) = self.failures.lock().pop_front() {
            if failure == PresentError::DeviceReset {
                self.registered = None;
            }
            return Err(failure);
        }
        self.presented += 1;
        Ok(MockSurface {
            size: self.dimensions(),
            serial: self.presented,
        })
    }

    fn dimensions(&self) -> Size {
        self.registered.map_or_else(Size::default, |(_, size)| size)
    }

    fn cleanup(&mut self) {
        self.registered = None;
        self.log.lock().push(Event::Cleanup);
    }
}

struct Harness {
    source: SharedFrameSource<SoftContext, SoftGl, MockBridge>,
    log: Log,
    failures: Arc<Mutex<VecDeque<PresentError>>>,
}

impl Harness {
    fn new(size: Size) -> Self {
        let log = Log::default();
        let failures = Arc::new(Mutex::new(VecDeque::new()));
        let bridge_log = log.clone();
        let bridge_failures = failures.clone();
        let config = FrameSourceConfig {
            size,
            ..FrameSourceConfig::default()
        };
        let source = SharedFrameSource::spawn(config, move || {
            let bridge = MockBridge {
                log: bridge_log,
                failures: bridge_failures,
                registered: None,
                locked: false,
                next_handle: 0,
                presented: 0,
            };
            Ok((SoftContext::new(), SoftGl::new(), bridge))
        })
        .unwrap();
        Self {
            source,
            log,
            failures,
        }
    }

    fn frame(&self) -> SurfaceOutcome<MockSurface> {
        let log = self.log.clone();
        let handle = self.source.begin_render(move |gl: &mut SoftGl| {
            log.lock().push(Event::Draw(gl.bound_framebuffer()));
            Ok(())
        });
        self.source.end_render(handle)
    }

    fn take_events(&self) -> Vec<Event> {
        std::mem::take(&mut *self.log.lock())
    }
}

#[test]
fn frame_follows_register_lock_draw_unlock_present() {
    let harness = Harness::new(Size::new(64, 32));
    let surface = harness.frame().into_surface().unwrap();
    assert_eq!(
        surface,
        MockSurface {
            size: Size::new(64, 32),
            serial: 1
        }
    );
    assert_eq!(
        harness.take_events(),
        vec![
            Event::Register(Size::new(64, 32)),
            Event::Lock,
            Event::Draw(BRIDGE_FBO),
            Event::Unlock,
            Event::Present,
        ]
    );
}

#[test]
fn same_size_does_not_reregister() {
    let harness = Harness::new(Size::new(16, 16));
    harness.frame();
    harness.take_events();
    let second = harness.frame().into_surface().unwrap();
    assert_eq!(second.serial, 2);
    assert_eq!(
        harness.take_events(),
        vec![Event::Lock, Event::Draw(BRIDGE_FBO), Event::Unlock, Event::Present]
    );
}

#[test]
fn resize_replaces_the_registration() {
    let mut harness = Harness::new(Size::new(16, 16));
    harness.frame();
    harness.take_events();

    harness.source.set_size(Size::new(40, 20));
    let surface = harness.frame().into_surface().unwrap();
    assert_eq!(surface.size, Size::new(40, 20));
    assert_eq!(
        harness.take_events()[..2],
        [Event::Unregister, Event::Register(Size::new(40, 20))]
    );
}

#[test]
fn empty_size_queues_nothing() {
    let mut harness = Harness::new(Size::new(16, 16));
    harness.source.set_size(Size::new(0, 16));
    let handle = harness.source.begin_render(|_: &mut SoftGl| Ok(()));
    assert!(handle.is_none());
    assert!(matches!(
        harness.source.end_render(handle),
        SurfaceOutcome::Skipped
    ));
    assert!(harness.take_events().is_empty());
}

#[test]
fn frames_from_another_source_are_skipped() {
    let a = Harness::new(Size::new(8, 8));
    let b = Harness::new(Size::new(8, 8));
    let handle = a.source.begin_render(|_: &mut SoftGl| Ok(()));
    assert!(handle.is_some());

    assert!(matches!(b.source.end_render(handle), SurfaceOutcome::Skipped));
    assert!(b.take_events().is_empty());

    // The frame still ran on its own source.
    let later = a.frame().into_surface().unwrap();
    assert_eq!(later.serial, 2);
}

#[test]
fn device_reset_drops_the_frame_and_reregisters() {
    let harness = Harness::new(Size::new(8, 8));
    harness.frame();
    harness.failures.lock().push_back(PresentError::DeviceReset);

    assert!(matches!(harness.frame(), SurfaceOutcome::Dropped));
    harness.take_events();

    let surface = harness.frame().into_surface().unwrap();
    assert_eq!(surface.size, Size::new(8, 8));
    assert_eq!(
        harness.take_events(),
        vec![
            Event::Register(Size::new(8, 8)),
            Event::Lock,
            Event::Draw(BRIDGE_FBO),
            Event::Unlock,
            Event::Present,
        ]
    );
}

#[test]
fn failed_present_keeps_the_registration() {
    let harness = Harness::new(Size::new(8, 8));
    harness
        .failures
        .lock()
        .push_back(PresentError::Failed("swap chain busy".into()));

    assert!(matches!(harness.frame(), SurfaceOutcome::Dropped));
    harness.take_events();
    assert!(harness.frame().into_surface().is_some());
    assert_eq!(harness.take_events()[0], Event::Lock);
}

#[test]
fn draw_error_still_unlocks() {
    let harness = Harness::new(Size::new(8, 8));
    let handle = harness
        .source
        .begin_render(|_: &mut SoftGl| Err(anyhow!("out of texture units")));
    match harness.source.end_render(handle) {
        SurfaceOutcome::Failed(JobError::Failed(reason)) => {
            assert!(reason.contains("out of texture units"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(
        harness.take_events(),
        vec![Event::Register(Size::new(8, 8)), Event::Lock, Event::Unlock]
    );

    // The target is usable again.
    assert!(harness.frame().into_surface().is_some());
}

#[test]
fn shutdown_releases_the_bridge() {
    let mut harness = Harness::new(Size::new(8, 8));
    harness.frame();
    harness.take_events();

    assert_eq!(harness.source.shutdown(), 0);
    assert!(!harness.source.is_running());
    assert_eq!(
        harness.take_events(),
        vec![Event::Unregister, Event::Cleanup]
    );
}

#[test]
fn tasks_reach_the_bridge_on_the_worker() {
    let harness = Harness::new(Size::new(8, 8));
    let (tx, rx) = crossbeam_channel::bounded(1);
    harness
        .source
        .submit_task(move |target| {
            tx.send(target.bridge().dimensions()).unwrap();
            Ok(())
        })
        .wait()
        .unwrap();
    // Nothing registered before the first frame.
    assert_eq!(rx.recv().unwrap(), Size::default());
}
