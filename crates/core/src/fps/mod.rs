use std::time::Instant;

use crate::render::Canvas;

const TEXT_OFFSET_X: i32 = 20;
const TEXT_OFFSET_Y: i32 = 60;

/// Monotonic counter used for elapsed-time measurement.
pub trait TickSource: Send {
    fn ticks(&self) -> u64;
    /// Ticks per second.
    fn frequency(&self) -> f64;
}

/// Nanosecond ticks since construction.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicTicks {
    origin: Instant,
}

impl MonotonicTicks {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn ticks(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }

    fn frequency(&self) -> f64 {
        1e9
    }
}

/// Rolling frames-per-second counter.
///
/// The rate is recomputed once every `window` frames and always reflects the
/// most recently completed window, never a single frame interval.
#[derive(Debug)]
pub struct FpsMeter<T: TickSource = MonotonicTicks> {
    clock: T,
    window: u32,
    frames: u64,
    frequency: f64,
    window_start: u64,
    fps: Option<f64>,
    text: String,
}

impl<T: TickSource> FpsMeter<T> {
    pub fn new(clock: T, window: u32) -> Self {
        let mut meter = Self {
            clock,
            window: window.max(1),
            frames: 0,
            frequency: 0.0,
            window_start: 0,
            fps: None,
            text: String::new(),
        };
        meter.init();
        meter
    }

    /// Resets the counters and starts a new window at the current tick.
    pub fn init(&mut self) {
        self.frames = 0;
        self.fps = None;
        self.text.clear();
        self.frequency = self.clock.frequency();
        self.window_start = self.clock.ticks();
    }

    /// Counts one processed frame.
    pub fn measure(&mut self) {
        self.frames += 1;
        if self.frames % u64::from(self.window) != 0 {
            return;
        }

        let now = self.clock.ticks();
        let elapsed = now.saturating_sub(self.window_start);
        self.window_start = now;
        if elapsed == 0 {
            tracing::debug!(window = self.window, "fps window completed in zero ticks");
            return;
        }

        let fps = f64::from(self.window) * self.frequency / elapsed as f64;
        self.fps = Some(fps);
        self.text = format!("{fps:.2} FPS");
        tracing::debug!(fps = %self.text, "fps window completed");
    }

    /// Rate over the last completed window.
    pub fn fps(&self) -> Option<f64> {
        self.fps
    }

    /// Formatted rate, empty until the first window completes.
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn render<C: Canvas + ?Sized>(&self, canvas: &mut C, x: i32, y: i32) {
        if self.text.is_empty() {
            return;
        }
        canvas.draw_text(&self.text, x + TEXT_OFFSET_X, y + TEXT_OFFSET_Y);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::render::{DisplaySurface, DrawOp, MemorySurface};

    #[derive(Clone, Default)]
    struct ManualTicks(Arc<AtomicU64>);

    impl ManualTicks {
        fn advance(&self, ticks: u64) {
            self.0.fetch_add(ticks, Ordering::SeqCst);
        }
    }

    impl TickSource for ManualTicks {
        fn ticks(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }

        fn frequency(&self) -> f64 {
            1_000.0
        }
    }

    #[test]
    fn reports_rate_over_a_full_window() {
        let clock = ManualTicks::default();
        let mut meter = FpsMeter::new(clock.clone(), 20);

        clock.advance(3_000);
        for _ in 0..20 {
            meter.measure();
        }

        let fps = meter.fps().unwrap();
        assert!((fps - 20.0 * 1_000.0 / 3_000.0).abs() < 1e-12);
        assert_eq!(meter.text(), "6.67 FPS");
    }

    #[test]
    fn ignores_partial_windows() {
        let clock = ManualTicks::default();
        let mut meter = FpsMeter::new(clock.clone(), 20);

        clock.advance(500);
        for _ in 0..19 {
            meter.measure();
        }
        assert_eq!(meter.fps(), None);
        assert_eq!(meter.text(), "");

        meter.measure();
        assert_eq!(meter.text(), "40.00 FPS");

        clock.advance(2_000);
        for _ in 0..19 {
            meter.measure();
        }
        assert_eq!(meter.text(), "40.00 FPS");
        meter.measure();
        assert_eq!(meter.text(), "10.00 FPS");
    }

    #[test]
    fn init_restarts_the_window() {
        let clock = ManualTicks::default();
        let mut meter = FpsMeter::new(clock.clone(), 4);
        clock.advance(10_000);
        meter.init();
        clock.advance(100);
        for _ in 0..4 {
            meter.measure();
        }
        assert_eq!(meter.text(), "40.00 FPS");
    }

    #[test]
    fn render_draws_nothing_before_the_first_window() {
        let clock = ManualTicks::default();
        let mut meter = FpsMeter::new(clock.clone(), 2);
        let mut surface = MemorySurface::new(10, 10);

        let mut canvas = surface.lock_canvas().unwrap();
        meter.render(&mut canvas, 5, 0);
        clock.advance(1_000);
        meter.measure();
        meter.measure();
        meter.render(&mut canvas, 5, 0);
        surface.unlock_and_post(canvas);

        let log = surface.log();
        let log = log.lock();
        assert_eq!(
            log.last_ops,
            vec![DrawOp::Text {
                text: "2.00 FPS".to_string(),
                x: 25,
                y: 60
            }]
        );
    }
}
