//! Emotion Compiler - turns a short source clip plus an authored timeline into
//! the byte streams a nightlight display consumes
//!
//! This crate provides the fit-and-pad geometry shared by every artifact, a
//! frame source abstraction over the external extraction tool, the timeline
//! model, the frame compiler, the palette-indexed RLE animation codec, a
//! motion-JPEG packager and the region overlay extractor used by the editor.

pub mod anim;
pub mod cli;
pub mod compiler;
pub mod config;
#[cfg(feature = "ffmpeg-lib")]
pub mod decoder;
pub mod geometry;
pub mod mjpeg;
pub mod palette;
pub mod regions;
pub mod source;
pub mod timeline;

pub use anim::{decode_animation, encode_animation, inspect_header, AnimHeader, DecodedAnimation};
pub use cli::{Cli, Command, OutputFormat};
pub use compiler::{compile_timeline, CompiledAnimation, CompiledFrame};
pub use config::CompilerConfig;
pub use geometry::{Canvas, FitTransform, NormRect};
pub use mjpeg::{package_mjpeg, split_frames, MjpegPackage};
pub use palette::{Palette, Rgb565};
pub use regions::{expand, extract_regions, extract_transparent, CornerStyle, Region, RegionArtifact};
pub use source::{ClipMetadata, FfmpegCliSource, FrameSource, ImageSequenceSource, RetryingSource};
pub use timeline::{FrameAction, FrameBudgetWarning, Phase, Timeline, TimelineFrame, TimelineSummary};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default device canvas width in pixels
pub const DEFAULT_CANVAS_WIDTH: u32 = 240;

/// Default device canvas height in pixels
pub const DEFAULT_CANVAS_HEIGHT: u32 = 280;

/// Soft ceiling on total timeline frames (about 6 s at 10 fps)
pub const FRAME_BUDGET: usize = 60;

/// Malformed caller input: timelines, rectangles, dimensions, configuration
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("{field} is {value}, which exceeds the 16-bit header limit of 65535")]
    FieldOverflow { field: &'static str, value: usize },

    #[error("Canvas dimensions must be non-zero, got {width}x{height}")]
    EmptyCanvas { width: u32, height: u32 },

    #[error("Frame {index} is {width}x{height} but the canvas is {canvas_width}x{canvas_height}")]
    FrameSizeMismatch {
        index: usize,
        width: u32,
        height: u32,
        canvas_width: u32,
        canvas_height: u32,
    },

    #[error("Invalid rectangle: {0}")]
    InvalidRect(String),

    #[error("Invalid frame rate: {0}")]
    InvalidFps(f64),

    #[error("Invalid timeline: {0}")]
    InvalidTimeline(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why the external frame tool could not deliver a frame or metadata
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ExtractionFailure {
    #[error("frame tool is unavailable: {0}")]
    ToolUnavailable(String),

    #[error("frame tool failed: {0}")]
    ToolFailed(String),

    #[error("index is out of range for a clip of {frame_count} frames")]
    OutOfRange { frame_count: u64 },

    #[error("unexpected tool output: {0}")]
    BadOutput(String),
}

impl ExtractionFailure {
    /// Whether retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ToolFailed(_))
    }
}

/// External frame tool failure, tagged with the failing frame when known
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("Extraction failed{}: {failure}", frame_suffix(.frame_index))]
pub struct ExtractionError {
    pub frame_index: Option<u32>,
    pub failure: ExtractionFailure,
}

fn frame_suffix(frame_index: &Option<u32>) -> String {
    match frame_index {
        Some(index) => format!(" for source frame {}", index),
        None => String::new(),
    }
}

impl ExtractionError {
    /// Failure while extracting a specific source frame
    pub fn at_frame(frame_index: u32, failure: ExtractionFailure) -> Self {
        Self { frame_index: Some(frame_index), failure }
    }

    /// Failure not tied to a frame (probing, tool startup)
    pub fn general(failure: ExtractionFailure) -> Self {
        Self { frame_index: None, failure }
    }
}

/// Malformed artifact bytes on the read-back path
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FormatError {
    #[error("Bad magic: expected \"ANIM\", found {0:02x?}")]
    BadMagic(Vec<u8>),

    #[error("Truncated {section}: needed {needed} bytes at offset {offset}, buffer is {len} bytes")]
    Truncated {
        section: &'static str,
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("Short payload in frame {frame}: runs cover {covered} of {pixel_count} pixels")]
    ShortPayload {
        frame: usize,
        covered: usize,
        pixel_count: usize,
    },

    #[error("Malformed JPEG stream at offset {offset}: {reason}")]
    BadJpeg { offset: usize, reason: &'static str },
}

/// Error types used throughout the crate
#[derive(thiserror::Error, Debug)]
pub enum CompilerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for this crate
pub type Result<T> = std::result::Result<T, CompilerError>;

/// Utility functions
pub mod utils {
    use super::*;

    /// Format duration in a human-readable way
    pub fn format_duration(seconds: f64) -> String {
        let total_millis = (seconds * 1000.0).round() as u64;
        let minutes = total_millis / 60_000;
        let secs = (total_millis % 60_000) / 1000;
        let millis = total_millis % 1000;

        format!("{}:{:02}.{:03}", minutes, secs, millis)
    }

    /// Parse a `WIDTHxHEIGHT` canvas string such as `240x280`
    pub fn parse_canvas(value: &str) -> std::result::Result<Canvas, String> {
        let (w, h) = value
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got '{}'", value))?;
        let width = w.trim().parse::<u32>().map_err(|e| format!("bad width '{}': {}", w, e))?;
        let height = h.trim().parse::<u32>().map_err(|e| format!("bad height '{}': {}", h, e))?;
        Canvas::new(width, height).map_err(|e| e.to_string())
    }
}

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        decode_animation, encode_animation, inspect_header, compile_timeline,
        package_mjpeg, split_frames, expand, extract_regions, extract_transparent,
        AnimHeader, Canvas, ClipMetadata, CompiledAnimation, CompiledFrame, CompilerConfig,
        CompilerError, CornerStyle, DecodedAnimation, ExtractionError, ExtractionFailure,
        FitTransform, FormatError, FrameAction, FrameBudgetWarning, FrameSource,
        ImageSequenceSource, MjpegPackage, NormRect, Palette, Phase, Region, RegionArtifact,
        Result, Rgb565, Timeline, TimelineFrame, TimelineSummary, ValidationError,
        utils::*,
    };
}
