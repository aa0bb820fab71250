use std::sync::Arc;

use parking_lot::Mutex;

use crate::fps::{FpsMeter, TickSource};
use crate::Bitmap;

/// Drawable target obtained from [`DisplaySurface::lock_canvas`].
pub trait Canvas {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn draw_bitmap(&mut self, bitmap: &Bitmap, x: i32, y: i32);
    fn draw_text(&mut self, text: &str, x: i32, y: i32);
}

/// Display backend that receives one rendered bitmap per processed frame.
pub trait DisplaySurface: Send {
    type Canvas: Canvas;

    /// Returns `None` when the surface is not ready; the frame is then skipped.
    fn lock_canvas(&mut self) -> Option<Self::Canvas>;
    fn unlock_and_post(&mut self, canvas: Self::Canvas);
}

/// Draws `bitmap` centred on the surface with the fps string above it.
/// Returns whether anything was posted.
pub fn present<S, T>(surface: &mut S, bitmap: &Bitmap, fps: &FpsMeter<T>) -> bool
where
    S: DisplaySurface,
    T: TickSource,
{
    let Some(mut canvas) = surface.lock_canvas() else {
        tracing::trace!("no canvas available, skipping render");
        return false;
    };

    let x = centred(canvas.width(), bitmap.width());
    let y = centred(canvas.height(), bitmap.height());
    canvas.draw_bitmap(bitmap, x, y);
    fps.render(&mut canvas, x, 0);
    surface.unlock_and_post(canvas);
    true
}

fn centred(outer: u32, inner: u32) -> i32 {
    (i64::from(outer) - i64::from(inner)).div_euclid(2) as i32
}

/// Operation recorded by [`MemoryCanvas`].
#[derive(Debug, Clone, PartialEq)]
pub enum DrawOp {
    Bitmap { x: i32, y: i32, width: u32, height: u32 },
    Text { text: String, x: i32, y: i32 },
}

#[derive(Debug)]
pub struct MemoryCanvas {
    width: u32,
    height: u32,
    ops: Vec<DrawOp>,
}

impl Canvas for MemoryCanvas {
    fn width(&self) -> u32 {
        self.width
    }

    fn height(&self) -> u32 {
        self.height
    }

    fn draw_bitmap(&mut self, bitmap: &Bitmap, x: i32, y: i32) {
        self.ops.push(DrawOp::Bitmap {
            x,
            y,
            width: bitmap.width(),
            height: bitmap.height(),
        });
    }

    fn draw_text(&mut self, text: &str, x: i32, y: i32) {
        self.ops.push(DrawOp::Text {
            text: text.to_string(),
            x,
            y,
        });
    }
}

/// What a [`MemorySurface`] has been asked to display so far.
#[derive(Debug, Default, Clone)]
pub struct SurfaceLog {
    pub posted: u64,
    pub skipped: u64,
    pub last_ops: Vec<DrawOp>,
}

impl SurfaceLog {
    pub fn last_text(&self) -> Option<&str> {
        self.last_ops.iter().rev().find_map(|op| match op {
            DrawOp::Text { text, .. } => Some(text.as_str()),
            _ => None,
        })
    }
}

/// Headless display surface that records what would have been drawn.
#[derive(Debug)]
pub struct MemorySurface {
    width: u32,
    height: u32,
    unavailable_every: Option<u64>,
    locks: u64,
    log: Arc<Mutex<SurfaceLog>>,
}

impl MemorySurface {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            unavailable_every: None,
            locks: 0,
            log: Arc::default(),
        }
    }

    /// Makes every `n`th lock return no canvas.
    pub fn unavailable_every(mut self, n: u64) -> Self {
        self.unavailable_every = Some(n.max(1));
        self
    }

    pub fn log(&self) -> Arc<Mutex<SurfaceLog>> {
        self.log.clone()
    }
}

impl DisplaySurface for MemorySurface {
    type Canvas = MemoryCanvas;

    fn lock_canvas(&mut self) -> Option<MemoryCanvas> {
        self.locks += 1;
        if let Some(n) = self.unavailable_every {
            if self.locks % n == 0 {
                self.log.lock().skipped += 1;
                return None;
            }
        }

        Some(MemoryCanvas {
            width: self.width,
            height: self.height,
            ops: Vec::new(),
        })
    }

    fn unlock_and_post(&mut self, canvas: MemoryCanvas) {
        let mut log = self.log.lock();
        log.posted += 1;
        log.last_ops = canvas.ops;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fps::MonotonicTicks;

    #[test]
    fn centres_bitmap_on_canvas() {
        let mut surface = MemorySurface::new(800, 600);
        let log = surface.log();
        let bitmap = Bitmap::new(640, 480);
        let fps = FpsMeter::new(MonotonicTicks::new(), 20);

        assert!(present(&mut surface, &bitmap, &fps));

        let log = log.lock();
        assert_eq!(log.posted, 1);
        assert_eq!(
            log.last_ops,
            vec![DrawOp::Bitmap {
                x: 80,
                y: 60,
                width: 640,
                height: 480
            }]
        );
    }

    #[test]
    fn missing_canvas_skips_the_frame() {
        let mut surface = MemorySurface::new(100, 100).unavailable_every(2);
        let log = surface.log();
        let bitmap = Bitmap::new(10, 10);
        let fps = FpsMeter::new(MonotonicTicks::new(), 20);

        assert!(present(&mut surface, &bitmap, &fps));
        assert!(!present(&mut surface, &bitmap, &fps));
        assert!(present(&mut surface, &bitmap, &fps));

        let log = log.lock();
        assert_eq!(log.posted, 2);
        assert_eq!(log.skipped, 1);
    }
}
