use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::mailbox::{Deposit, Mailbox};
use crate::{EchoError, Result};

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar with interleaved V/U, the usual camera preview
    /// format.
    Nv21,
    Rgba8,
    Gray8,
}

impl PixelFormat {
    /// Number of bytes a `width` x `height` frame occupies in this format.
    pub fn frame_len(self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Nv21 => pixels + 2 * (width as usize).div_ceil(2) * (height as usize).div_ceil(2),
            PixelFormat::Rgba8 => pixels * 4,
            PixelFormat::Gray8 => pixels,
        }
    }
}

/// Immutable pixel buffer handed from the capture service to the processing
/// loop.
#[derive(Clone)]
pub struct Frame {
    data: Arc<[u8]>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Frame {
    pub fn new(data: impl Into<Arc<[u8]>>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: data.into(),
            width,
            height,
            format,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(EchoError::InvalidInput("frame has no pixels"));
        }
        if self.data.len() < self.format.frame_len(self.width, self.height) {
            return Err(EchoError::InvalidInput("frame buffer is shorter than its geometry"));
        }
        Ok(())
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .finish()
    }
}

/// Displayable RGBA8 image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bitmap {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        let px = &self.pixels[offset..offset + 4];
        Some([px[0], px[1], px[2], px[3]])
    }

    pub fn set_pixel(&mut self, x: u32, y: u32, rgba: [u8; 4]) {
        if x >= self.width || y >= self.height {
            return;
        }
        let offset = (y as usize * self.width as usize + x as usize) * 4;
        self.pixels[offset..offset + 4].copy_from_slice(&rgba);
    }

    /// Changes the geometry, reallocating only when the size differs.
    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize * 4];
    }
}

/// Single-channel 8-bit image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GrayImage {
    width: u32,
    height: u32,
    pixels: Vec<u8>,
}

impl GrayImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.pixels
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.width == width && self.height == height {
            return;
        }
        self.width = width;
        self.height = height;
        self.pixels = vec![0; width as usize * height as usize];
    }

    pub fn fill(&mut self, value: u8) {
        self.pixels.fill(value);
    }
}

/// Converts a captured frame into a displayable RGBA image plus its luma
/// plane. Both outputs are resized to the frame geometry if needed.
pub fn convert_frame(frame: &Frame, rgba: &mut Bitmap, gray: &mut GrayImage) -> Result<()> {
    frame.validate()?;
    let (width, height) = (frame.width, frame.height);
    rgba.resize(width, height);
    gray.resize(width, height);

    let pixels = width as usize * height as usize;
    let data = frame.data();
    match frame.format {
        PixelFormat::Nv21 => {
            gray.pixels.copy_from_slice(&data[..pixels]);
            let chroma = &data[pixels..];
            let chroma_stride = 2 * (width as usize).div_ceil(2);
            for y in 0..height as usize {
                for x in 0..width as usize {
                    let luma = f32::from(data[y * width as usize + x]);
                    let uv = (y / 2) * chroma_stride + (x & !1);
                    let v = f32::from(chroma[uv]) - 128.0;
                    let u = f32::from(chroma[uv + 1]) - 128.0;

                    let offset = (y * width as usize + x) * 4;
                    rgba.pixels[offset] = clamp_channel(luma + 1.402 * v);
                    rgba.pixels[offset + 1] = clamp_channel(luma - 0.344 * u - 0.714 * v);
                    rgba.pixels[offset + 2] = clamp_channel(luma + 1.772 * u);
                    rgba.pixels[offset + 3] = 255;
                }
            }
        }
        PixelFormat::Rgba8 => {
            rgba.pixels.copy_from_slice(&data[..pixels * 4]);
            for (luma, px) in gray.pixels.iter_mut().zip(data.chunks_exact(4)) {
                *luma = luma_of(px[0], px[1], px[2]);
            }
        }
        PixelFormat::Gray8 => {
            gray.pixels.copy_from_slice(&data[..pixels]);
            for (px, &luma) in rgba.pixels.chunks_exact_mut(4).zip(&data[..pixels]) {
                px.copy_from_slice(&[luma, luma, luma, 255]);
            }
        }
    }

    Ok(())
}

fn clamp_channel(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

fn luma_of(r: u8, g: u8, b: u8) -> u8 {
    ((77 * u32::from(r) + 150 * u32::from(g) + 29 * u32::from(b)) >> 8) as u8
}

/// Single-slot mailbox between the capture callback and the processing loop.
///
/// A frame that arrives while the previous one is still unread replaces it:
/// feedback depends on recency, not completeness.
#[derive(Debug, Default)]
pub struct FrameExchange {
    slot: Mailbox<Frame>,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Producer side. Never waits for the consumer.
    pub fn deposit(&self, frame: Frame) {
        match self.slot.deposit(frame) {
            Deposit::Stored => {}
            Deposit::Replaced => tracing::trace!("dropped stale frame"),
            Deposit::Closed => tracing::trace!("frame arrived after shutdown"),
        }
    }

    /// Consumer side. Parks until a frame has been deposited since the last
    /// take; `None` means the exchange was shut down.
    pub fn take_blocking(&self) -> Option<Frame> {
        self.slot.take_blocking()
    }

    /// Wakes the consumer without a frame and refuses further deposits.
    pub fn shutdown(&self) {
        self.slot.close();
    }

    pub fn is_shutdown(&self) -> bool {
        self.slot.is_closed()
    }

    /// Frames overwritten before the consumer could take them.
    pub fn dropped_frames(&self) -> u64 {
        self.slot.dropped()
    }
}
