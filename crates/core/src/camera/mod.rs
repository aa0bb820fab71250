use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{EchoError, Frame, FrameExchange, PixelFormat, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSize {
    pub width: u32,
    pub height: u32,
}

impl PreviewSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

pub type FrameCallback = Box<dyn FnMut(Frame) + Send>;

/// Source of live preview frames.
pub trait CameraService: Send {
    fn open(&mut self) -> Result<()>;
    fn supported_preview_sizes(&self) -> Vec<PreviewSize>;
    fn set_preview_size(&mut self, size: PreviewSize) -> Result<()>;
    /// Installs (or with `None`, removes) the per-frame callback. The callback
    /// runs on the camera's thread and must not block.
    fn set_frame_callback(&mut self, callback: Option<FrameCallback>);
    fn start_preview(&mut self) -> Result<()>;
    fn stop_preview(&mut self);
    fn release(&mut self);
}

/// Picks the supported size whose height is closest to the requested one.
/// The first candidate wins ties.
pub fn negotiate_preview_size(requested: PreviewSize, supported: &[PreviewSize]) -> Result<PreviewSize> {
    supported
        .iter()
        .copied()
        .min_by_key(|size| size.height.abs_diff(requested.height))
        .ok_or_else(|| EchoError::Camera("camera reports no preview sizes".to_string()))
}

/// Camera wired to a [`FrameExchange`].
pub struct CaptureSession<C: CameraService> {
    camera: C,
    preview: Option<PreviewSize>,
    stopped: bool,
}

impl<C: CameraService> CaptureSession<C> {
    /// Opens the camera and starts delivering frames into `exchange`.
    ///
    /// Failing to open is returned to the caller. A failed preview
    /// negotiation is only logged: the session exists but never delivers
    /// frames.
    pub fn start(mut camera: C, exchange: Arc<FrameExchange>, requested: PreviewSize) -> Result<Self> {
        if let Err(err) = camera.open() {
            tracing::error!(%err, "failed to open camera");
            return Err(err);
        }

        camera.set_frame_callback(Some(Box::new(move |frame| exchange.deposit(frame))));

        let preview = match start_preview(&mut camera, requested) {
            Ok(size) => {
                tracing::info!(width = size.width, height = size.height, "camera preview started");
                Some(size)
            }
            Err(err) => {
                tracing::error!(%err, "preview negotiation failed, preview not started");
                None
            }
        };

        Ok(Self {
            camera,
            preview,
            stopped: false,
        })
    }

    /// Negotiated preview size, `None` when the preview never started.
    pub fn preview_size(&self) -> Option<PreviewSize> {
        self.preview
    }

    pub fn camera(&self) -> &C {
        &self.camera
    }

    /// Stops the preview, detaches the callback and releases the camera.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.preview.is_some() {
            self.camera.stop_preview();
        }
        self.camera.set_frame_callback(None);
        self.camera.release();
        tracing::info!("camera released");
    }
}

impl<C: CameraService> Drop for CaptureSession<C> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn start_preview<C: CameraService>(camera: &mut C, requested: PreviewSize) -> Result<PreviewSize> {
    let size = negotiate_preview_size(requested, &camera.supported_preview_sizes())?;
    camera.set_preview_size(size)?;
    camera.start_preview()?;
    Ok(size)
}

/// Builds an NV21 frame with two dark squares `separation` pixels apart
/// (centre to centre) on a light grey background.
pub fn synthetic_frame(width: u32, height: u32, separation: u32) -> Frame {
    let (w, h) = (width as usize, height as usize);
    let mut data = vec![128_u8; PixelFormat::Nv21.frame_len(width, height)];
    data[..w * h].fill(200);

    let side = (h / 8).max(2);
    let top = h.saturating_sub(side) / 2;
    let half = separation as usize / 2;
    let centres = [(w / 2).saturating_sub(half), (w / 2 + half).min(w.saturating_sub(1))];

    for centre in centres {
        let left = centre.saturating_sub(side / 2);
        for y in top..(top + side).min(h) {
            let row = y * w;
            for x in left..(left + side).min(w) {
                data[row + x] = 10;
            }
        }
    }

    Frame::new(data, width, height, PixelFormat::Nv21)
}

/// Software camera producing [`synthetic_frame`]s at a fixed rate on its own
/// thread. The object separation sweeps back and forth so the tone changes.
pub struct SyntheticCamera {
    sizes: Vec<PreviewSize>,
    frame_rate: u32,
    fail_open: bool,
    opened: bool,
    preview: Option<PreviewSize>,
    callback: Arc<Mutex<Option<FrameCallback>>>,
    running: Arc<AtomicBool>,
    emitted: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl SyntheticCamera {
    pub fn new(frame_rate: u32) -> Self {
        Self {
            sizes: vec![
                PreviewSize::new(320, 240),
                PreviewSize::new(640, 480),
                PreviewSize::new(1280, 720),
            ],
            frame_rate: frame_rate.max(1),
            fail_open: false,
            opened: false,
            preview: None,
            callback: Arc::default(),
            running: Arc::default(),
            emitted: Arc::default(),
            thread: None,
        }
    }

    pub fn with_supported_sizes(mut self, sizes: Vec<PreviewSize>) -> Self {
        self.sizes = sizes;
        self
    }

    /// Makes [`CameraService::open`] fail, as when the device is in use.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn frames_emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    pub fn is_previewing(&self) -> bool {
        self.thread.is_some()
    }
}

impl CameraService for SyntheticCamera {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(EchoError::Camera("camera is in use".to_string()));
        }
        self.opened = true;
        Ok(())
    }

    fn supported_preview_sizes(&self) -> Vec<PreviewSize> {
        self.sizes.clone()
    }

    fn set_preview_size(&mut self, size: PreviewSize) -> Result<()> {
        if !self.sizes.contains(&size) {
            return Err(EchoError::Camera(format!(
                "unsupported preview size {}x{}",
                size.width, size.height
            )));
        }
        self.preview = Some(size);
        Ok(())
    }

    fn set_frame_callback(&mut self, callback: Option<FrameCallback>) {
        *self.callback.lock() = callback;
    }

    fn start_preview(&mut self) -> Result<()> {
        if !self.opened {
            return Err(EchoError::Camera("camera is not open".to_string()));
        }
        let size = self
            .preview
            .ok_or_else(|| EchoError::Camera("preview size not set".to_string()))?;
        if self.thread.is_some() {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let interval = Duration::from_secs_f64(1.0 / f64::from(self.frame_rate));
        let callback = self.callback.clone();
        let running = self.running.clone();
        let emitted = self.emitted.clone();

        let handle = thread::Builder::new()
            .name("echosight-camera".into())
            .spawn(move || {
                let sweep = size.width / 2;
                let mut index: u64 = 0;
                while running.load(Ordering::SeqCst) {
                    let phase = (index as f64 * 0.05).sin() * 0.5 + 0.5;
                    let separation = size.width / 8 + (phase * f64::from(sweep)) as u32;
                    let frame = synthetic_frame(size.width, size.height, separation);
                    if let Some(callback) = callback.lock().as_mut() {
                        callback(frame);
                    }
                    emitted.fetch_add(1, Ordering::Relaxed);
                    index += 1;
                    thread::sleep(interval);
                }
            })?;

        self.thread = Some(handle);
        Ok(())
    }

    fn stop_preview(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("synthetic camera thread panicked");
            }
        }
    }

    fn release(&mut self) {
        self.stop_preview();
        self.opened = false;
        self.preview = None;
    }
}

impl Drop for SyntheticCamera {
    fn drop(&mut self) {
        self.stop_preview();
    }
}

impl std::fmt::Debug for SyntheticCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyntheticCamera")
            .field("frame_rate", &self.frame_rate)
            .field("preview", &self.preview)
            .field("emitted", &self.frames_emitted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_the_closest_height() {
        let sizes = [
            PreviewSize::new(320, 240),
            PreviewSize::new(800, 480),
            PreviewSize::new(640, 480),
            PreviewSize::new(1280, 720),
        ];
        let chosen = negotiate_preview_size(PreviewSize::new(1000, 500), &sizes).unwrap();
        assert_eq!(chosen, PreviewSize::new(800, 480));
        assert!(negotiate_preview_size(PreviewSize::new(1, 1), &[]).is_err());
    }

    #[test]
    fn session_feeds_the_exchange() {
        let exchange = Arc::new(FrameExchange::new());
        let mut session = CaptureSession::start(
            SyntheticCamera::new(200),
            exchange.clone(),
            PreviewSize::new(320, 240),
        )
        .unwrap();

        assert_eq!(session.preview_size(), Some(PreviewSize::new(320, 240)));
        let frame = exchange.take_blocking().unwrap();
        assert_eq!((frame.width(), frame.height()), (320, 240));
        assert_eq!(frame.format(), PixelFormat::Nv21);

        session.stop();
        assert!(!session.camera().is_previewing());
    }

    #[test]
    fn open_failure_is_fatal() {
        let exchange = Arc::new(FrameExchange::new());
        let result = CaptureSession::start(
            SyntheticCamera::new(30).failing_open(),
            exchange,
            PreviewSize::new(640, 480),
        );
        assert!(matches!(result, Err(EchoError::Camera(_))));
    }

    #[test]
    fn negotiation_failure_is_not_fatal() {
        let exchange = Arc::new(FrameExchange::new());
        let session = CaptureSession::start(
            SyntheticCamera::new(30).with_supported_sizes(Vec::new()),
            exchange.clone(),
            PreviewSize::new(640, 480),
        )
        .unwrap();

        assert_eq!(session.preview_size(), None);
        assert!(!session.camera().is_previewing());
        assert_eq!(session.camera().frames_emitted(), 0);
    }

    #[test]
    fn synthetic_frames_hold_two_objects() {
        let frame = synthetic_frame(160, 120, 60);
        let luma = &frame.data()[..160 * 120];
        let row = 60 * 160;
        assert_eq!(luma[row + 50], 10);
        assert_eq!(luma[row + 110], 10);
        assert_eq!(luma[row + 80], 200);
    }
}
