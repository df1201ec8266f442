use crate::geometry::Canvas;
use crate::{Result, ValidationError, FRAME_BUDGET};
use image::Rgb;
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Compiler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CompilerConfig {
    /// Device canvas width in pixels
    pub canvas_width: u32,
    /// Device canvas height in pixels
    pub canvas_height: u32,
    /// Letterbox fill color (RGB)
    pub background: [u8; 3],
    /// Playback rate of the compiled animation; defaults to the clip's sample rate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback_fps: Option<f64>,
    /// Quality for motion-JPEG frames (1-100)
    pub jpeg_quality: u8,
    /// Per-side growth applied to regions that may contain motion
    pub region_margin: f64,
    /// Rounded-corner radius as a fraction of the shorter rectangle side
    pub corner_radius_fraction: f64,
    /// Soft ceiling on total timeline frames
    pub frame_budget: usize,
    /// Extra attempts for transient frame tool failures
    pub extract_retries: u32,
    /// ffmpeg binary name or path
    pub ffmpeg_bin: String,
    /// ffprobe binary name or path
    pub ffprobe_bin: String,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            canvas_width: crate::DEFAULT_CANVAS_WIDTH,
            canvas_height: crate::DEFAULT_CANVAS_HEIGHT,
            background: [0, 0, 0],
            playback_fps: None,
            jpeg_quality: 85,
            region_margin: crate::regions::DEFAULT_MARGIN,
            corner_radius_fraction: crate::regions::DEFAULT_CORNER_RADIUS_FRACTION,
            frame_budget: FRAME_BUDGET,
            extract_retries: 2,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }
}

impl CompilerConfig {
    /// Load a JSON config file; fields it omits keep their defaults
    pub fn load(path: &Path) -> Result<Self> {
        debug!("Loading config from {}", path.display());
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> std::result::Result<(), ValidationError> {
        let invalid = |msg: String| Err(ValidationError::InvalidConfig(msg));

        self.canvas()?;
        for (field, value) in [("canvasWidth", self.canvas_width), ("canvasHeight", self.canvas_height)] {
            if value > u16::MAX as u32 {
                return Err(ValidationError::FieldOverflow { field, value: value as usize });
            }
        }

        if let Some(fps) = self.playback_fps {
            if !fps.is_finite() || fps <= 0.0 {
                return Err(ValidationError::InvalidFps(fps));
            }
        }

        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!("jpegQuality must be 1-100, got {}", self.jpeg_quality));
        }

        if !self.region_margin.is_finite() || !(0.0..1.0).contains(&self.region_margin) {
            return invalid(format!("regionMargin must be in [0, 1), got {}", self.region_margin));
        }

        if !self.corner_radius_fraction.is_finite() || !(0.0..=0.5).contains(&self.corner_radius_fraction) {
            return invalid(format!(
                "cornerRadiusFraction must be in [0, 0.5], got {}",
                self.corner_radius_fraction
            ));
        }

        Ok(())
    }

    pub fn canvas(&self) -> std::result::Result<Canvas, ValidationError> {
        Canvas::new(self.canvas_width, self.canvas_height)
    }

    pub fn background(&self) -> Rgb<u8> {
        Rgb(self.background)
    }
}
