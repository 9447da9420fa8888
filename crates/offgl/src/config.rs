use offgl_core::{Size, WorkerConfig};
use offgl_readback::ReadbackMode;

/// Output size used until the first [`set_size`](crate::FrameSource::set_size).
pub const DEFAULT_SIZE: Size = Size::new(100, 100);

/// Settings for a [`FrameSource`](crate::FrameSource) or
/// [`SharedFrameSource`](crate::SharedFrameSource).
#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    /// Initial output size.
    pub size: Size,
    /// Pack-buffer layout for CPU readback. Ignored by the shared-surface
    /// source.
    pub readback: ReadbackMode,
    pub worker: WorkerConfig,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            size: DEFAULT_SIZE,
            readback: ReadbackMode::Double,
            worker: WorkerConfig::default(),
        }
    }
}
