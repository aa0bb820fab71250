//! Image-analysis boundary.
//!
//! The processing loop hands each converted frame to a [`FrameAnalyzer`]
//! together with a set of [`ScratchBuffers`] that is allocated once per
//! preview resolution and reused for every frame.

use crate::{Bitmap, EchoError, GrayImage, Result};

const DARK_THRESHOLD: u8 = 45;
const SKIN_MAX_HUE: u8 = 18;
const SKIN_MIN_SATURATION: u8 = 50;
const SKIN_MIN_VALUE: u8 = 80;
const MIN_OBJECT_AREA: u32 = 2;
/// Half-width of the square structuring element used to open the mask.
const OPENING_RADIUS: usize = 3;
const MARKER_RADIUS: i64 = 5;
const MARKER_COLOUR: [u8; 4] = [0, 255, 0, 255];

/// Produces a distance scalar from a converted frame.
pub trait FrameAnalyzer: Send {
    /// `rgba` may be annotated in place; it is what gets displayed.
    fn analyze(
        &mut self,
        rgba: &mut Bitmap,
        gray: &mut GrayImage,
        scratch: &mut ScratchBuffers,
    ) -> Result<f64>;
}

impl<A: FrameAnalyzer + ?Sized> FrameAnalyzer for Box<A> {
    fn analyze(
        &mut self,
        rgba: &mut Bitmap,
        gray: &mut GrayImage,
        scratch: &mut ScratchBuffers,
    ) -> Result<f64> {
        (**self).analyze(rgba, gray, scratch)
    }
}

/// Connected region found by the reference analyzer.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Blob {
    pub area: u32,
    sum_x: u64,
    sum_y: u64,
}

impl Blob {
    /// Centroid with coordinates truncated to whole pixels.
    pub fn centroid(&self) -> (i64, i64) {
        let area = u64::from(self.area.max(1));
        ((self.sum_x / area) as i64, (self.sum_y / area) as i64)
    }
}

/// Working images sized to the preview resolution.
#[derive(Debug, Default)]
pub struct ScratchBuffers {
    width: u32,
    height: u32,
    allocations: u32,
    pub plane_h: GrayImage,
    pub plane_s: GrayImage,
    pub plane_v: GrayImage,
    pub skin: GrayImage,
    pub mask: GrayImage,
    work: GrayImage,
    labels: Vec<u32>,
    stack: Vec<u32>,
    blobs: Vec<Blob>,
}

impl ScratchBuffers {
    pub fn new(width: u32, height: u32) -> Self {
        let mut scratch = Self::default();
        scratch.ensure(width, height);
        scratch
    }

    /// Reallocates every buffer if the resolution changed. Returns whether an
    /// allocation happened.
    pub fn ensure(&mut self, width: u32, height: u32) -> bool {
        if self.allocations > 0 && self.width == width && self.height == height {
            return false;
        }

        let pixels = width as usize * height as usize;
        self.width = width;
        self.height = height;
        self.plane_h = GrayImage::new(width, height);
        self.plane_s = GrayImage::new(width, height);
        self.plane_v = GrayImage::new(width, height);
        self.skin = GrayImage::new(width, height);
        self.mask = GrayImage::new(width, height);
        self.work = GrayImage::new(width, height);
        self.labels = vec![0; pixels];
        self.stack = Vec::with_capacity(pixels);
        self.blobs = Vec::with_capacity(64);
        self.allocations += 1;
        tracing::debug!(width, height, "allocated analysis scratch buffers");
        true
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// How many times the buffers have been (re)allocated.
    pub fn allocations(&self) -> u32 {
        self.allocations
    }

    pub fn blobs(&self) -> &[Blob] {
        &self.blobs
    }
}

/// Finds the two largest dark, non-skin regions in view and reports the
/// distance between their centroids in pixels. The centroids are marked on
/// the displayed image.
///
/// Luma is smoothed with a 3x3 box blur before thresholding, and the mask is
/// opened with a 7x7 square so specks narrower than that never count as
/// objects.
#[derive(Debug, Clone, Default)]
pub struct BlobDistanceAnalyzer;

impl BlobDistanceAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl FrameAnalyzer for BlobDistanceAnalyzer {
    fn analyze(
        &mut self,
        rgba: &mut Bitmap,
        gray: &mut GrayImage,
        scratch: &mut ScratchBuffers,
    ) -> Result<f64> {
        let (width, height) = (gray.width(), gray.height());
        if rgba.width() != width || rgba.height() != height {
            return Err(EchoError::Analysis(
                "colour and grey images differ in size".to_string(),
            ));
        }
        if scratch.size() != (width, height) {
            return Err(EchoError::Analysis(
                "scratch buffers do not match the frame size".to_string(),
            ));
        }

        split_hsv(rgba, scratch);
        build_mask(gray, scratch);
        open_mask(scratch);
        label_blobs(scratch);

        let (first, second) = two_largest(&scratch.blobs).ok_or_else(|| {
            EchoError::Analysis(format!(
                "need two objects in view, found {}",
                scratch.blobs.len()
            ))
        })?;

        let (x1, y1) = first.centroid();
        let (x2, y2) = second.centroid();
        draw_marker(rgba, x1, y1);
        draw_marker(rgba, x2, y2);

        let (dx, dy) = ((x1 - x2) as f64, (y1 - y2) as f64);
        Ok((dx * dx + dy * dy).sqrt())
    }
}

fn split_hsv(rgba: &Bitmap, scratch: &mut ScratchBuffers) {
    let planes = scratch
        .plane_h
        .pixels_mut()
        .iter_mut()
        .zip(scratch.plane_s.pixels_mut().iter_mut())
        .zip(scratch.plane_v.pixels_mut().iter_mut());

    for (((h, s), v), px) in planes.zip(rgba.pixels().chunks_exact(4)) {
        let (hue, saturation, value) = rgb_to_hsv(px[0], px[1], px[2]);
        *h = hue;
        *s = saturation;
        *v = value;
    }
}

/// 8-bit HSV with hue in `[0, 180)`.
fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = f32::from(max - min);
    if max == 0 {
        return (0, 0, 0);
    }

    let saturation = (255.0 * delta / f32::from(max)).round() as u8;
    if delta == 0.0 {
        return (0, saturation, max);
    }

    let (r, g, b) = (f32::from(r), f32::from(g), f32::from(b));
    let mut hue = if max as f32 == r {
        60.0 * (g - b) / delta
    } else if max as f32 == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    (((hue / 2.0).round() as u16 % 180) as u8, saturation, max)
}

fn build_mask(gray: &GrayImage, scratch: &mut ScratchBuffers) {
    let ScratchBuffers {
        plane_h,
        plane_s,
        plane_v,
        skin,
        mask,
        work,
        ..
    } = scratch;

    box_blur(gray, work);

    for (i, out) in skin.pixels_mut().iter_mut().enumerate() {
        let is_skin = plane_h.pixels()[i] <= SKIN_MAX_HUE
            && plane_s.pixels()[i] >= SKIN_MIN_SATURATION
            && plane_v.pixels()[i] >= SKIN_MIN_VALUE;
        *out = if is_skin { 255 } else { 0 };
    }

    for ((out, &luma), &skin_px) in mask
        .pixels_mut()
        .iter_mut()
        .zip(work.pixels())
        .zip(skin.pixels())
    {
        *out = if luma < DARK_THRESHOLD && skin_px == 0 { 255 } else { 0 };
    }
}

/// 3x3 mean with edge pixels replicated, rounded to nearest.
fn box_blur(src: &GrayImage, dst: &mut GrayImage) {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let input = src.pixels();
    let output = dst.pixels_mut();

    for y in 0..height {
        let rows = [y.saturating_sub(1), y, (y + 1).min(height - 1)];
        for x in 0..width {
            let cols = [x.saturating_sub(1), x, (x + 1).min(width - 1)];
            let sum: u32 = rows
                .iter()
                .flat_map(|&row| cols.iter().map(move |&col| u32::from(input[row * width + col])))
                .sum();
            output[y * width + x] = ((sum + 4) / 9) as u8;
        }
    }
}

/// Erosion then dilation with a square element, each done as a row pass into
/// `work` and a column pass back into `mask`.
fn open_mask(scratch: &mut ScratchBuffers) {
    let ScratchBuffers { mask, work, .. } = scratch;
    rank_pass(mask, work, OPENING_RADIUS, true, u8::min);
    rank_pass(work, mask, OPENING_RADIUS, false, u8::min);
    rank_pass(mask, work, OPENING_RADIUS, true, u8::max);
    rank_pass(work, mask, OPENING_RADIUS, false, u8::max);
}

/// One axis of a min or max filter. Samples past the image edge are ignored.
fn rank_pass(
    src: &GrayImage,
    dst: &mut GrayImage,
    radius: usize,
    horizontal: bool,
    pick: fn(u8, u8) -> u8,
) {
    let (width, height) = (src.width() as usize, src.height() as usize);
    let input = src.pixels();
    let output = dst.pixels_mut();

    for y in 0..height {
        for x in 0..width {
            let (lo, hi, origin, stride) = if horizontal {
                (x.saturating_sub(radius), (x + radius).min(width - 1), y * width, 1)
            } else {
                (y.saturating_sub(radius), (y + radius).min(height - 1), x, width)
            };
            output[y * width + x] = (lo..=hi)
                .map(|i| input[origin + i * stride])
                .fold(input[origin + lo * stride], pick);
        }
    }
}

/// 4-connected labelling of the mask into `scratch.blobs`.
fn label_blobs(scratch: &mut ScratchBuffers) {
    let (width, height) = (scratch.width as usize, scratch.height as usize);
    scratch.labels.fill(0);
    scratch.blobs.clear();

    for start in 0..width * height {
        if scratch.mask.pixels()[start] == 0 || scratch.labels[start] != 0 {
            continue;
        }

        let label = scratch.blobs.len() as u32 + 1;
        let mut blob = Blob::default();
        scratch.stack.clear();
        scratch.stack.push(start as u32);
        scratch.labels[start] = label;

        while let Some(index) = scratch.stack.pop() {
            let index = index as usize;
            let (x, y) = (index % width, index / width);
            blob.area += 1;
            blob.sum_x += x as u64;
            blob.sum_y += y as u64;

            let neighbours = [
                (x > 0).then(|| index - 1),
                (x + 1 < width).then(|| index + 1),
                (y > 0).then(|| index - width),
                (y + 1 < height).then(|| index + width),
            ];
            for next in neighbours.into_iter().flatten() {
                if scratch.mask.pixels()[next] != 0 && scratch.labels[next] == 0 {
                    scratch.labels[next] = label;
                    scratch.stack.push(next as u32);
                }
            }
        }

        scratch.blobs.push(blob);
    }

    scratch.blobs.retain(|blob| blob.area >= MIN_OBJECT_AREA);
}

fn two_largest(blobs: &[Blob]) -> Option<(Blob, Blob)> {
    let mut first: Option<Blob> = None;
    let mut second: Option<Blob> = None;
    for &blob in blobs {
        if first.map_or(true, |f| blob.area > f.area) {
            second = first;
            first = Some(blob);
        } else if second.map_or(true, |s| blob.area > s.area) {
            second = Some(blob);
        }
    }
    Some((first?, second?))
}

fn draw_marker(rgba: &mut Bitmap, cx: i64, cy: i64) {
    for dy in -MARKER_RADIUS..=MARKER_RADIUS {
        for dx in -MARKER_RADIUS..=MARKER_RADIUS {
            if dx * dx + dy * dy > MARKER_RADIUS * MARKER_RADIUS {
                continue;
            }
            let (x, y) = (cx + dx, cy + dy);
            if x >= 0 && y >= 0 {
                rgba.set_pixel(x as u32, y as u32, MARKER_COLOUR);
            }
        }
    }
}
