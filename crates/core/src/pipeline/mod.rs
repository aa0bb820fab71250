//! The consumer side of the feedback loop.
//!
//! A [`ProcessingLoop`] owns one thread that parks on the [`FrameExchange`],
//! hands each frame to a [`FrameProcessor`], updates the fps meter and posts
//! the result to a [`DisplaySurface`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::analysis::{FrameAnalyzer, ScratchBuffers};
use crate::audio::SoundEngine;
use crate::fps::{FpsMeter, MonotonicTicks, TickSource};
use crate::frame::convert_frame;
use crate::mode::{Mode, ModeSwitch};
use crate::render::{self, DisplaySurface};
use crate::{Bitmap, EchoError, Frame, FrameExchange, GrayImage, Result};

/// Per-frame work done by the processing loop.
pub trait FrameProcessor: Send {
    /// Called before the first frame and whenever the frame size changes.
    fn surface_changed(&mut self, width: u32, height: u32);
    /// Returns the image to display, or `None` to skip rendering this frame.
    fn process_frame(&mut self, frame: &Frame, mode: Mode) -> Option<&Bitmap>;
    /// Called once on the loop thread after the last frame.
    fn release(&mut self) {}
}

/// Converts frames for display and, in [`Mode::Analyze`], turns the measured
/// distance into a tone.
pub struct ToneFeedbackProcessor<A: FrameAnalyzer> {
    analyzer: A,
    sound: Arc<SoundEngine>,
    rgba: Bitmap,
    gray: GrayImage,
    scratch: ScratchBuffers,
    last_distance: Option<f64>,
    analysis_failures: u64,
}

impl<A: FrameAnalyzer> ToneFeedbackProcessor<A> {
    pub fn new(analyzer: A, sound: Arc<SoundEngine>) -> Self {
        Self {
            analyzer,
            sound,
            rgba: Bitmap::default(),
            gray: GrayImage::default(),
            scratch: ScratchBuffers::default(),
            last_distance: None,
            analysis_failures: 0,
        }
    }

    pub fn last_distance(&self) -> Option<f64> {
        self.last_distance
    }

    pub fn analysis_failures(&self) -> u64 {
        self.analysis_failures
    }

    pub fn scratch(&self) -> &ScratchBuffers {
        &self.scratch
    }

    fn silence(&self) {
        if let Err(err) = self.sound.stop() {
            tracing::debug!(%err, "could not stop tone");
        }
    }
}

impl<A: FrameAnalyzer> FrameProcessor for ToneFeedbackProcessor<A> {
    fn surface_changed(&mut self, width: u32, height: u32) {
        self.rgba.resize(width, height);
        self.gray.resize(width, height);
        self.scratch.ensure(width, height);
    }

    fn process_frame(&mut self, frame: &Frame, mode: Mode) -> Option<&Bitmap> {
        if let Err(err) = convert_frame(frame, &mut self.rgba, &mut self.gray) {
            tracing::warn!(%err, "skipping frame that could not be converted");
            return None;
        }

        match mode {
            Mode::PassThrough => {
                self.last_distance = None;
                self.silence();
            }
            Mode::Analyze => {
                match self
                    .analyzer
                    .analyze(&mut self.rgba, &mut self.gray, &mut self.scratch)
                {
                    Ok(distance) => {
                        self.last_distance = Some(distance);
                        if let Err(err) = self.sound.start_from(distance) {
                            tracing::debug!(%err, distance, "could not request tone");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(%err, "no distance for this frame");
                        self.last_distance = None;
                        self.analysis_failures += 1;
                        self.silence();
                    }
                }
            }
        }

        Some(&self.rgba)
    }

    fn release(&mut self) {
        self.scratch = ScratchBuffers::default();
        tracing::debug!(failures = self.analysis_failures, "released analysis buffers");
    }
}

/// Lifecycle of a [`ProcessingLoop`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Counters from a finished loop.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoopReport {
    pub frames_processed: u64,
    /// Frames the processor declined to render.
    pub frames_skipped: u64,
    pub frames_rendered: u64,
    pub fps_text: String,
}

#[derive(Debug)]
struct LoopShared {
    state: AtomicCell<LoopState>,
    stop_requested: AtomicBool,
    processed: AtomicU64,
    skipped: AtomicU64,
    rendered: AtomicU64,
    fps_text: Mutex<String>,
}

impl LoopShared {
    fn advance(&self, from: LoopState, to: LoopState) -> bool {
        self.state.compare_exchange(from, to).is_ok()
    }

    fn report(&self) -> LoopReport {
        LoopReport {
            frames_processed: self.processed.load(Ordering::SeqCst),
            frames_skipped: self.skipped.load(Ordering::SeqCst),
            frames_rendered: self.rendered.load(Ordering::SeqCst),
            fps_text: self.fps_text.lock().clone(),
        }
    }
}

pub struct ProcessingLoop<P, S, T = MonotonicTicks>
where
    P: FrameProcessor,
    S: DisplaySurface,
    T: TickSource,
{
    exchange: Arc<FrameExchange>,
    mode: Arc<ModeSwitch>,
    processor: P,
    surface: S,
    fps: FpsMeter<T>,
    frame_size: Option<(u32, u32)>,
    shared: Arc<LoopShared>,
}

impl<P, S, T> ProcessingLoop<P, S, T>
where
    P: FrameProcessor + 'static,
    S: DisplaySurface + 'static,
    T: TickSource + 'static,
{
    pub fn new(
        exchange: Arc<FrameExchange>,
        mode: Arc<ModeSwitch>,
        processor: P,
        surface: S,
        fps: FpsMeter<T>,
    ) -> Self {
        Self {
            exchange,
            mode,
            processor,
            surface,
            fps,
            frame_size: None,
            shared: Arc::new(LoopShared {
                state: AtomicCell::new(LoopState::Idle),
                stop_requested: AtomicBool::new(false),
                processed: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
                rendered: AtomicU64::new(0),
                fps_text: Mutex::new(String::new()),
            }),
        }
    }

    pub fn state(&self) -> LoopState {
        self.shared.state.load()
    }

    /// Moves the loop onto its own thread.
    pub fn spawn(self) -> Result<ProcessingHandle> {
        let shared = self.shared.clone();
        let exchange = self.exchange.clone();
        let thread = thread::Builder::new()
            .name("echosight-processing".into())
            .spawn(move || self.run())?;

        Ok(ProcessingHandle {
            shared,
            exchange,
            thread: Some(thread),
        })
    }

    fn run(mut self) {
        self.fps.init();
        if self.shared.advance(LoopState::Idle, LoopState::Running) {
            tracing::info!("processing loop running");
        }

        loop {
            let Some(frame) = self.exchange.take_blocking() else {
                if !self.shared.stop_requested.load(Ordering::SeqCst) {
                    tracing::warn!(err = %EchoError::Interrupted, "frame exchange closed underneath the loop");
                }
                break;
            };
            if self.shared.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            self.step(&frame);
        }

        self.shared.advance(LoopState::Running, LoopState::Stopping);
        self.processor.release();
        self.shared.state.store(LoopState::Stopped);
        tracing::info!(frames = self.fps.frames(), "processing loop stopped");
    }

    fn step(&mut self, frame: &Frame) {
        let size = (frame.width(), frame.height());
        if self.frame_size != Some(size) {
            tracing::debug!(width = size.0, height = size.1, "frame size changed");
            self.processor.surface_changed(size.0, size.1);
            self.frame_size = Some(size);
        }

        let mode = self.mode.get();
        match self.processor.process_frame(frame, mode) {
            Some(bitmap) => {
                self.fps.measure();
                if self.fps.frames() % u64::from(self.fps.window()) == 0 {
                    self.shared.fps_text.lock().replace_range(.., self.fps.text());
                }
                if render::present(&mut self.surface, bitmap, &self.fps) {
                    self.shared.rendered.fetch_add(1, Ordering::SeqCst);
                }
            }
            None => {
                self.shared.skipped.fetch_add(1, Ordering::SeqCst);
            }
        }

        // Counted last: every side effect of the frame is visible once this moves.
        self.shared.processed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Owner-side handle of a running [`ProcessingLoop`].
#[derive(Debug)]
pub struct ProcessingHandle {
    shared: Arc<LoopShared>,
    exchange: Arc<FrameExchange>,
    thread: Option<JoinHandle<()>>,
}

impl ProcessingHandle {
    pub fn state(&self) -> LoopState {
        self.shared.state.load()
    }

    pub fn frames_processed(&self) -> u64 {
        self.shared.processed.load(Ordering::SeqCst)
    }

    pub fn report(&self) -> LoopReport {
        self.shared.report()
    }

    /// Raises the stop flag, wakes the consumer and joins it. Safe to call
    /// more than once.
    pub fn stop(&mut self) -> LoopReport {
        self.shared.stop_requested.store(true, Ordering::SeqCst);
        self.shared.advance(LoopState::Running, LoopState::Stopping);
        self.exchange.shutdown();

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("processing thread panicked");
                self.shared.state.store(LoopState::Stopped);
            }
        }
        self.shared.report()
    }
}

impl Drop for ProcessingHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::audio::{AudioOutputSpec, MemoryDevice, SoundState};
    use crate::camera::synthetic_frame;
    use crate::config::ToneConfig;
    use crate::render::MemorySurface;
    use crate::PixelFormat;

    const WAIT: Duration = Duration::from_secs(10);

    struct ScriptedAnalyzer {
        distances: VecDeque<Result<f64>>,
    }

    impl ScriptedAnalyzer {
        fn new(distances: impl IntoIterator<Item = Result<f64>>) -> Self {
            Self {
                distances: distances.into_iter().collect(),
            }
        }
    }

    impl FrameAnalyzer for ScriptedAnalyzer {
        fn analyze(&mut self, _: &mut Bitmap, _: &mut GrayImage, _: &mut ScratchBuffers) -> Result<f64> {
            self.distances
                .pop_front()
                .unwrap_or_else(|| Err(EchoError::Analysis("script exhausted".into())))
        }
    }

    struct Rig {
        exchange: Arc<FrameExchange>,
        mode: Arc<ModeSwitch>,
        sound: Arc<SoundEngine>,
        surface_log: Arc<Mutex<render::SurfaceLog>>,
        handle: ProcessingHandle,
    }

    impl Rig {
        fn start(mode: Mode, analyzer: ScriptedAnalyzer) -> Self {
            let exchange = Arc::new(FrameExchange::new());
            let mode = Arc::new(ModeSwitch::new(mode));
            let device = MemoryDevice::open(AudioOutputSpec::for_tone(&ToneConfig::default()));
            let sound = Arc::new(SoundEngine::spawn(ToneConfig::default(), Box::new(device)).unwrap());
            let surface = MemorySurface::new(200, 200);
            let surface_log = surface.log();

            let processing = ProcessingLoop::new(
                exchange.clone(),
                mode.clone(),
                ToneFeedbackProcessor::new(analyzer, sound.clone()),
                surface,
                FpsMeter::new(MonotonicTicks::new(), 2),
            );
            assert_eq!(processing.state(), LoopState::Idle);
            let handle = processing.spawn().unwrap();

            Self {
                exchange,
                mode,
                sound,
                surface_log,
                handle,
            }
        }

        /// Deposits a frame and waits until the loop has taken it.
        fn feed(&self, frame: Frame) {
            let before = self.handle.frames_processed();
            self.exchange.deposit(frame);
            let deadline = Instant::now() + WAIT;
            while self.handle.frames_processed() == before {
                assert!(Instant::now() < deadline, "frame was never processed");
                thread::sleep(Duration::from_millis(1));
            }
        }
    }

    fn frame() -> Frame {
        synthetic_frame(64, 48, 20)
    }

    #[test]
    fn pass_through_renders_without_sound() {
        let mut rig = Rig::start(Mode::PassThrough, ScriptedAnalyzer::new([]));
        for _ in 0..4 {
            rig.feed(frame());
        }
        let report = rig.handle.stop();

        assert_eq!(report.frames_processed, 4);
        assert_eq!(report.frames_rendered, 4);
        assert!(rig.sound.wait_idle(WAIT));
        assert_eq!(rig.sound.state(), SoundState::Stopped);
        assert_eq!(rig.sound.stats().tones_written, 0);
        assert_eq!(rig.handle.state(), LoopState::Stopped);
    }

    #[test]
    fn analyze_follows_the_latest_distance() {
        let script = [500.0, 300.0, 150.0, 50.0].map(Ok);
        let mut rig = Rig::start(Mode::Analyze, ScriptedAnalyzer::new(script));
        for _ in 0..4 {
            rig.feed(frame());
        }

        assert!(rig.sound.wait_idle(WAIT));
        assert_eq!(rig.sound.state(), SoundState::Playing);
        assert_eq!(rig.sound.stats().last_frequency_hz, Some(100.0));

        let report = rig.handle.stop();
        assert_eq!(report.frames_processed, 4);
        assert!(report.fps_text.ends_with(" FPS"));
    }

    #[test]
    fn analysis_failure_still_renders_and_silences() {
        let script = [Ok(300.0), Err(EchoError::Analysis("no objects".into()))];
        let mut rig = Rig::start(Mode::Analyze, ScriptedAnalyzer::new(script));
        rig.feed(frame());
        rig.feed(frame());
        let report = rig.handle.stop();

        assert_eq!(report.frames_rendered, 2);
        assert_eq!(rig.surface_log.lock().posted, 2);
        assert_eq!(rig.sound.state(), SoundState::Stopped);
    }

    #[test]
    fn unconvertible_frames_are_skipped() {
        let mut rig = Rig::start(Mode::PassThrough, ScriptedAnalyzer::new([]));
        rig.feed(Frame::new(vec![0_u8; 10], 64, 48, PixelFormat::Gray8));
        rig.feed(frame());
        let report = rig.handle.stop();

        assert_eq!(report.frames_processed, 2);
        assert_eq!(report.frames_skipped, 1);
        assert_eq!(report.frames_rendered, 1);
    }

    #[test]
    fn mode_is_read_every_frame() {
        let mut rig = Rig::start(Mode::PassThrough, ScriptedAnalyzer::new([Ok(250.0)]));
        rig.feed(frame());
        assert!(rig.sound.wait_idle(WAIT));
        assert_eq!(rig.sound.state(), SoundState::Stopped);

        rig.mode.set(Mode::Analyze);
        rig.feed(frame());
        assert!(rig.sound.wait_idle(WAIT));
        assert_eq!(rig.sound.stats().last_frequency_hz, Some(250.0));
        rig.handle.stop();
    }

    #[test]
    fn stop_wakes_an_idle_consumer() {
        let mut rig = Rig::start(Mode::PassThrough, ScriptedAnalyzer::new([]));
        let started = Instant::now();
        let report = rig.handle.stop();

        assert!(started.elapsed() < WAIT);
        assert_eq!(report.frames_processed, 0);
        assert_eq!(rig.handle.state(), LoopState::Stopped);
        assert!(rig.exchange.is_shutdown());
        rig.handle.stop();
    }

    #[test]
    fn scratch_follows_frame_size_changes() {
        let exchange = Arc::new(FrameExchange::new());
        let device = MemoryDevice::open(AudioOutputSpec::for_tone(&ToneConfig::default()));
        let sound = Arc::new(SoundEngine::spawn(ToneConfig::default(), Box::new(device)).unwrap());
        let mut processing = ProcessingLoop::new(
            exchange,
            Arc::new(ModeSwitch::new(Mode::PassThrough)),
            ToneFeedbackProcessor::new(ScriptedAnalyzer::new([]), sound),
            MemorySurface::new(100, 100),
            FpsMeter::new(MonotonicTicks::new(), 20),
        );

        processing.step(&synthetic_frame(64, 48, 20));
        processing.step(&synthetic_frame(64, 48, 30));
        assert_eq!(processing.processor.scratch().allocations(), 1);
        processing.step(&synthetic_frame(32, 24, 10));
        assert_eq!(processing.processor.scratch().allocations(), 2);
        assert_eq!(processing.processor.scratch().size(), (32, 24));
    }
}
