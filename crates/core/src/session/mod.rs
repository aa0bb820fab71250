use std::sync::Arc;

use serde::Serialize;

use crate::analysis::FrameAnalyzer;
use crate::audio::{AudioDevice, SoundEngine};
use crate::camera::{CameraService, CaptureSession, PreviewSize};
use crate::fps::{FpsMeter, MonotonicTicks};
use crate::mode::{Mode, ModeSwitch};
use crate::pipeline::{ProcessingHandle, ProcessingLoop, ToneFeedbackProcessor};
use crate::render::DisplaySurface;
use crate::{AppConfig, FrameExchange, Result};

/// Summary returned by [`Session::shutdown`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub frames_processed: u64,
    /// Frames replaced in the exchange before the loop could take them.
    pub frames_dropped: u64,
    pub frames_skipped: u64,
    pub frames_rendered: u64,
    pub tones_written: u64,
    pub superseded_tones: u64,
    pub fps_text: String,
}

/// A running camera → processing loop → sound engine pipeline.
pub struct Session<C: CameraService> {
    // Field order is teardown order.
    capture: CaptureSession<C>,
    processing: ProcessingHandle,
    sound: Arc<SoundEngine>,
    exchange: Arc<FrameExchange>,
    mode: Arc<ModeSwitch>,
}

impl<C: CameraService> Session<C> {
    pub fn start<A, S>(
        config: &AppConfig,
        camera: C,
        analyzer: A,
        device: Box<dyn AudioDevice>,
        surface: S,
        mode: Mode,
    ) -> Result<Self>
    where
        A: FrameAnalyzer + 'static,
        S: DisplaySurface + 'static,
    {
        config.validate()?;

        let sound = Arc::new(SoundEngine::spawn(config.tone.clone(), device)?);
        let exchange = Arc::new(FrameExchange::new());
        let mode = Arc::new(ModeSwitch::new(mode));

        let processing = ProcessingLoop::new(
            exchange.clone(),
            mode.clone(),
            ToneFeedbackProcessor::new(analyzer, sound.clone()),
            surface,
            FpsMeter::new(MonotonicTicks::new(), config.fps.window),
        )
        .spawn()?;

        let requested = PreviewSize::new(config.preview.width, config.preview.height);
        let capture = CaptureSession::start(camera, exchange.clone(), requested)?;

        tracing::info!(mode = ?mode.get(), "session started");
        Ok(Self {
            capture,
            processing,
            sound,
            exchange,
            mode,
        })
    }

    /// The shared mode flag, for the UI layer to write.
    pub fn mode(&self) -> &Arc<ModeSwitch> {
        &self.mode
    }

    pub fn sound(&self) -> &SoundEngine {
        &self.sound
    }

    pub fn preview_size(&self) -> Option<PreviewSize> {
        self.capture.preview_size()
    }

    pub fn frames_processed(&self) -> u64 {
        self.processing.frames_processed()
    }

    /// Stops capture, then the processing loop, then the sound engine.
    pub fn shutdown(mut self) -> SessionReport {
        tracing::info!("shutting down session");
        self.capture.stop();
        let processed = self.processing.stop();
        self.sound.shutdown();

        let stats = self.sound.stats();
        let report = SessionReport {
            frames_processed: processed.frames_processed,
            frames_dropped: self.exchange.dropped_frames(),
            frames_skipped: processed.frames_skipped,
            frames_rendered: processed.frames_rendered,
            tones_written: stats.tones_written,
            superseded_tones: stats.superseded,
            fps_text: processed.fps_text,
        };
        tracing::info!(?report, "session finished");
        report
    }
}
