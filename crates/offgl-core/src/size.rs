//! Pixel dimensions shared by the worker, the readback layer and the façade.

/// Bytes per pixel of every destination buffer (BGRA, 8 bits per channel).
pub const BYTES_PER_PIXEL: usize = 4;

/// Output dimensions in pixels.
///
/// Signed so that a host UI can hand over whatever it measured; any
/// dimension `<= 0` makes the size [empty](Size::is_empty) and rendering
/// for that request is skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Size {
    pub width: i32,
    pub height: i32,
}

impl Size {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    /// `true` when there is nothing to render.
    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Number of bytes a tightly packed BGRA image of this size occupies.
    /// Empty sizes occupy zero bytes.
    pub fn byte_len(&self) -> usize {
        self.rows_byte_len(self.height)
    }

    /// Number of bytes occupied by `rows` full scanlines.
    pub fn rows_byte_len(&self, rows: i32) -> usize {
        if self.is_empty() || rows <= 0 {
            return 0;
        }
        self.width as usize * rows as usize * BYTES_PER_PIXEL
    }

    /// Split the scanlines into the two halves used by double-buffered
    /// readback: `(height >> 1, height - (height >> 1))`.
    pub fn split_rows(&self) -> (i32, i32) {
        let top = self.height.max(0) >> 1;
        (top, self.height.max(0) - top)
    }

    /// Rectangle covering the whole image.
    pub fn full_rect(&self) -> PixelRect {
        PixelRect::new(0, 0, self.width.max(0), self.height.max(0))
    }
}

impl From<(i32, i32)> for Size {
    fn from((width, height): (i32, i32)) -> Self {
        Self { width, height }
    }
}

impl From<(u32, u32)> for Size {
    fn from((width, height): (u32, u32)) -> Self {
        Self {
            width: i32::try_from(width).unwrap_or(i32::MAX),
            height: i32::try_from(height).unwrap_or(i32::MAX),
        }
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// An axis-aligned pixel rectangle, origin at framebuffer row 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PixelRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl PixelRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Smallest rectangle containing both `self` and `other`.
    pub fn union(&self, other: &PixelRect) -> PixelRect {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        let x0 = self.x.min(other.x);
        let y0 = self.y.min(other.y);
        let x1 = (self.x + self.width).max(other.x + other.width);
        let y1 = (self.y + self.height).max(other.y + other.height);
        PixelRect::new(x0, y0, x1 - x0, y1 - y0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sizes() {
        assert!(Size::new(0, 64).is_empty());
        assert!(Size::new(64, 0).is_empty());
        assert!(Size::new(-3, 10).is_empty());
        assert!(!Size::new(1, 1).is_empty());
        assert_eq!(Size::new(0, 64).byte_len(), 0);
    }

    #[test]
    fn split_rows_matches_shift() {
        assert_eq!(Size::new(8, 64).split_rows(), (32, 32));
        assert_eq!(Size::new(8, 7).split_rows(), (3, 4));
        assert_eq!(Size::new(8, 1).split_rows(), (0, 1));
    }

    #[test]
    fn byte_lengths() {
        let size = Size::new(64, 7);
        assert_eq!(size.byte_len(), 64 * 7 * 4);
        let (top, bottom) = size.split_rows();
        assert_eq!(
            size.rows_byte_len(top) + size.rows_byte_len(bottom),
            size.byte_len()
        );
    }

    #[test]
    fn rect_union() {
        let a = PixelRect::new(0, 0, 4, 4);
        let b = PixelRect::new(2, 3, 4, 4);
        assert_eq!(a.union(&b), PixelRect::new(0, 0, 6, 7));
        assert_eq!(PixelRect::default().union(&b), b);
    }
}
