use crate::ValidationError;
use image::{imageops, imageops::FilterType, Rgb, RgbImage};
use log::debug;
use serde::{Deserialize, Serialize};

/// Fixed output raster size targeted by the display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
}

impl Canvas {
    /// Create a canvas, rejecting zero dimensions
    pub fn new(width: u32, height: u32) -> Result<Self, ValidationError> {
        if width == 0 || height == 0 {
            return Err(ValidationError::EmptyCanvas { width, height });
        }
        Ok(Self { width, height })
    }

    /// Number of pixels on the canvas
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

impl Default for Canvas {
    fn default() -> Self {
        Self {
            width: crate::DEFAULT_CANVAS_WIDTH,
            height: crate::DEFAULT_CANVAS_HEIGHT,
        }
    }
}

/// Normalized rectangle with every component in `[0, 1]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

impl NormRect {
    pub const FULL: NormRect = NormRect { x: 0.0, y: 0.0, w: 1.0, h: 1.0 };

    pub fn new(x: f64, y: f64, w: f64, h: f64) -> Self {
        Self { x, y, w, h }
    }

    /// Reject non-finite or negative-sized rectangles
    pub fn validate(&self) -> Result<(), ValidationError> {
        let parts = [self.x, self.y, self.w, self.h];
        if parts.iter().any(|v| !v.is_finite()) {
            return Err(ValidationError::InvalidRect(format!("non-finite component in {:?}", self)));
        }
        if self.w < 0.0 || self.h < 0.0 {
            return Err(ValidationError::InvalidRect(format!("negative size in {:?}", self)));
        }
        Ok(())
    }

    /// Intersect with the unit square
    pub fn clamped(&self) -> NormRect {
        let x0 = self.x.clamp(0.0, 1.0);
        let y0 = self.y.clamp(0.0, 1.0);
        let x1 = (self.x + self.w).clamp(0.0, 1.0);
        let y1 = (self.y + self.h).clamp(0.0, 1.0);
        NormRect {
            x: x0,
            y: y0,
            w: (x1 - x0).max(0.0),
            h: (y1 - y0).max(0.0),
        }
    }

    /// Pixel rectangle on a canvas, edges rounded to the nearest pixel
    pub fn to_pixels(&self, canvas: Canvas) -> PixelRect {
        let r = self.clamped();
        let to_px = |v: f64, extent: u32| (v * extent as f64).round().clamp(0.0, extent as f64) as u32;
        let x0 = to_px(r.x, canvas.width);
        let y0 = to_px(r.y, canvas.height);
        let x1 = to_px(r.x + r.w, canvas.width);
        let y1 = to_px(r.y + r.h, canvas.height);
        PixelRect {
            x: x0,
            y: y0,
            width: x1.saturating_sub(x0),
            height: y1.saturating_sub(y0),
        }
    }
}

/// Integer rectangle in canvas pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, px: u32, py: u32) -> bool {
        px >= self.x && py >= self.y && px < self.x + self.width && py < self.y + self.height
    }
}

/// Fit-inside, centered, letterboxed mapping from a source resolution onto a canvas.
///
/// Animation and motion-JPEG frames are placed with [`FitTransform::content_pixels`]
/// and region crops with [`FitTransform::map_rect`]; both round through
/// [`NormRect::to_pixels`], so every artifact agrees on where content sits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitTransform {
    pub source_width: u32,
    pub source_height: u32,
    pub canvas: Canvas,
    pub scale: f64,
    pub scaled_width: f64,
    pub scaled_height: f64,
    pub pad_left: f64,
    pub pad_top: f64,
}

impl FitTransform {
    /// Compute the transform. Callers must reject zero-size sources first.
    pub fn new(source_width: u32, source_height: u32, canvas: Canvas) -> Self {
        let cw = canvas.width as f64;
        let ch = canvas.height as f64;
        let scale = (cw / source_width as f64).min(ch / source_height as f64);
        let scaled_width = source_width as f64 * scale;
        let scaled_height = source_height as f64 * scale;

        Self {
            source_width,
            source_height,
            canvas,
            scale,
            scaled_width,
            scaled_height,
            pad_left: (cw - scaled_width) / 2.0,
            pad_top: (ch - scaled_height) / 2.0,
        }
    }

    /// Same as [`FitTransform::new`] but rejects degenerate sources
    pub fn checked(source_width: u32, source_height: u32, canvas: Canvas) -> Result<Self, ValidationError> {
        if source_width == 0 || source_height == 0 {
            return Err(ValidationError::InvalidConfig(format!(
                "source dimensions must be non-zero, got {}x{}",
                source_width, source_height
            )));
        }
        Ok(Self::new(source_width, source_height, canvas))
    }

    /// Map a source-normalized rectangle into canvas-normalized space
    pub fn map_rect(&self, rect: NormRect) -> NormRect {
        let cw = self.canvas.width as f64;
        let ch = self.canvas.height as f64;
        NormRect {
            x: (self.pad_left + rect.x * self.scaled_width) / cw,
            y: (self.pad_top + rect.y * self.scaled_height) / ch,
            w: rect.w * self.scaled_width / cw,
            h: rect.h * self.scaled_height / ch,
        }
    }

    /// Pixel area the scaled content occupies on the canvas.
    ///
    /// Rounded through [`NormRect::to_pixels`], the same path region crops take.
    pub fn content_pixels(&self) -> PixelRect {
        self.map_rect(NormRect::FULL).to_pixels(self.canvas)
    }

    /// Scale a source raster into a background-filled canvas raster
    pub fn fit_frame(&self, source: &RgbImage, background: Rgb<u8>) -> RgbImage {
        let content = self.content_pixels();
        let mut canvas = RgbImage::from_pixel(self.canvas.width, self.canvas.height, background);

        if source.width() == 0 || source.height() == 0 || content.is_empty() {
            return canvas;
        }

        if source.dimensions() != (self.source_width, self.source_height) {
            debug!(
                "Source raster is {}x{}, transform expects {}x{}",
                source.width(), source.height(), self.source_width, self.source_height
            );
        }

        if source.dimensions() == (content.width, content.height) {
            imageops::replace(&mut canvas, source, content.x as i64, content.y as i64);
        } else {
            let resized = imageops::resize(source, content.width, content.height, FilterType::Triangle);
            imageops::replace(&mut canvas, &resized, content.x as i64, content.y as i64);
        }

        canvas
    }
}
