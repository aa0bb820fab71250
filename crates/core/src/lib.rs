//! Core library for the EchoSight feedback loop.
//!
//! Camera frames flow through a single-slot [`FrameExchange`] into a
//! [`ProcessingLoop`], which converts and optionally analyses each frame,
//! keeps a rolling fps figure and drives a [`SoundEngine`] whose tone pitch
//! follows the measured distance. Each module owns one stage of that path;
//! [`Session`] wires them together.

pub mod analysis;
pub mod audio;
pub mod camera;
pub mod config;
pub mod error;
pub mod fps;
pub mod frame;
pub mod mailbox;
pub mod mode;
pub mod pipeline;
pub mod render;
pub mod session;
pub mod spectrum;
pub mod tone;

pub use analysis::{BlobDistanceAnalyzer, FrameAnalyzer, ScratchBuffers};
pub use audio::{
    AudioDevice, AudioOutputSpec, MemoryDevice, RawPcmFileDevice, SoundEngine, SoundState,
    SoundStats,
};
pub use camera::{CameraService, CaptureSession, PreviewSize, SyntheticCamera};
pub use config::{AppConfig, FpsConfig, PreviewConfig, ToneConfig, Waveform};
pub use error::{EchoError, Result};
pub use fps::{FpsMeter, MonotonicTicks, TickSource};
pub use frame::{convert_frame, Bitmap, Frame, FrameExchange, GrayImage, PixelFormat};
pub use mailbox::{Deposit, Mailbox};
pub use mode::{Mode, ModeSwitch};
pub use pipeline::{
    FrameProcessor, LoopReport, LoopState, ProcessingHandle, ProcessingLoop, ToneFeedbackProcessor,
};
pub use render::{Canvas, DisplaySurface, MemorySurface};
pub use session::{Session, SessionReport};
pub use spectrum::SpectrumProbe;
pub use tone::{PcmBuffer, ToneGenerator, ToneParameters};
