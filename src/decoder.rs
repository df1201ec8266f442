//! In-process frame source backed by libav through `ffmpeg-next`.
//!
//! Only built with the `ffmpeg-lib` feature. Each call opens its own demuxer
//! and decoder, so the source stays `Send + Sync` for parallel extraction.

use crate::source::{ClipMetadata, FrameSource};
use crate::{ExtractionError, ExtractionFailure};
use ffmpeg_next as ffmpeg;
use image::RgbImage;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Once;

static INIT: Once = Once::new();

fn init_ffmpeg() {
    INIT.call_once(|| match ffmpeg::init() {
        Ok(()) => debug!("FFmpeg initialized successfully"),
        // not fatal; opening the input reports the real problem
        Err(e) => debug!("FFmpeg init error: {:?}", e),
    });
}

fn rational_to_f64(r: ffmpeg::Rational) -> Option<f64> {
    if r.denominator() == 0 || r.numerator() <= 0 {
        None
    } else {
        Some(r.numerator() as f64 / r.denominator() as f64)
    }
}

/// Frame source that decodes the clip with libav in-process
#[derive(Debug, Clone)]
pub struct LibavSource {
    path: PathBuf,
}

/// An opened input with its best video stream and decoder
struct OpenClip {
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    time_base: f64,
    decoder: ffmpeg::codec::decoder::Video,
}

impl LibavSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        init_ffmpeg();
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<OpenClip, ExtractionFailure> {
        debug!("Opening video file: {}", self.path.display());
        let input = ffmpeg::format::input(&self.path).map_err(|e| {
            ExtractionFailure::ToolFailed(format!("failed to open '{}': {}", self.path.display(), e))
        })?;

        let stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| ExtractionFailure::BadOutput(format!("no video stream in '{}'", self.path.display())))?;
        let stream_index = stream.index();
        let time_base = rational_to_f64(stream.time_base()).unwrap_or(0.0);

        let decoder = ffmpeg::codec::context::Context::from_parameters(stream.parameters())
            .and_then(|ctx| ctx.decoder().video())
            .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to create video decoder: {}", e)))?;

        Ok(OpenClip {
            input,
            stream_index,
            time_base,
            decoder,
        })
    }
}

impl OpenClip {
    /// Decode forward from the last keyframe before `target` to the first frame at or after it
    fn frame_at(&mut self, target: f64, tolerance: f64) -> Result<ffmpeg::frame::Video, ExtractionFailure> {
        // container seeks are expressed in AV_TIME_BASE units
        let ts = (target * ffmpeg::ffi::AV_TIME_BASE as f64) as i64;
        self.input
            .seek(ts, ..ts)
            .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to seek to {:.6}s: {}", target, e)))?;
        self.decoder.flush();

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut last: Option<ffmpeg::frame::Video> = None;

        for (stream, packet) in self.input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }
            self.decoder
                .send_packet(&packet)
                .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to send packet: {}", e)))?;

            while self.decoder.receive_frame(&mut decoded).is_ok() {
                let at = decoded.timestamp().map(|pts| pts as f64 * self.time_base);
                match at {
                    Some(t) if t + tolerance < target => last = Some(decoded.clone()),
                    _ => return Ok(decoded),
                }
            }
        }

        // drain buffered frames at end of stream
        self.decoder
            .send_eof()
            .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to send EOF: {}", e)))?;
        while self.decoder.receive_frame(&mut decoded).is_ok() {
            let at = decoded.timestamp().map(|pts| pts as f64 * self.time_base);
            if at.map_or(true, |t| t + tolerance >= target) {
                return Ok(decoded);
            }
            last = Some(decoded.clone());
        }

        last.ok_or_else(|| ExtractionFailure::BadOutput(format!("no frame decoded at {:.6}s", target)))
    }
}

fn to_rgb_image(frame: &ffmpeg::frame::Video) -> Result<RgbImage, ExtractionFailure> {
    let width = frame.width();
    let height = frame.height();

    let mut scaler = ffmpeg::software::scaling::Context::get(
        frame.format(),
        width,
        height,
        ffmpeg::format::Pixel::RGB24,
        width,
        height,
        ffmpeg::software::scaling::Flags::BILINEAR,
    )
    .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to create scaling context: {}", e)))?;

    let mut rgb = ffmpeg::frame::Video::empty();
    scaler
        .run(frame, &mut rgb)
        .map_err(|e| ExtractionFailure::ToolFailed(format!("failed to scale frame: {}", e)))?;

    // rows may be padded past width * 3
    let stride = rgb.stride(0);
    let row_len = width as usize * 3;
    let data = rgb.data(0);
    let mut pixels = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let line = data
            .get(start..start + row_len)
            .ok_or_else(|| ExtractionFailure::BadOutput("short RGB plane".to_string()))?;
        pixels.extend_from_slice(line);
    }

    RgbImage::from_raw(width, height, pixels)
        .ok_or_else(|| ExtractionFailure::BadOutput("RGB buffer does not match frame size".to_string()))
}

impl FrameSource for LibavSource {
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
        let clip = self.open().map_err(ExtractionError::general)?;
        let stream = clip
            .input
            .stream(clip.stream_index)
            .ok_or_else(|| ExtractionError::general(ExtractionFailure::BadOutput("video stream vanished".into())))?;

        let fps = rational_to_f64(stream.avg_frame_rate())
            .or_else(|| rational_to_f64(stream.rate()))
            .ok_or_else(|| ExtractionError::general(ExtractionFailure::BadOutput("invalid frame rate".into())))?;

        let duration_seconds = if stream.duration() != ffmpeg::ffi::AV_NOPTS_VALUE && clip.time_base > 0.0 {
            stream.duration() as f64 * clip.time_base
        } else if clip.input.duration() != ffmpeg::ffi::AV_NOPTS_VALUE {
            clip.input.duration() as f64 / ffmpeg::ffi::AV_TIME_BASE as f64
        } else {
            0.0
        };

        let meta = ClipMetadata {
            duration_seconds,
            fps,
            width: clip.decoder.width(),
            height: clip.decoder.height(),
        };
        info!(
            "Clip '{}': {}x{}, {:.3} FPS, {:.3}s",
            self.path.display(),
            meta.width,
            meta.height,
            meta.fps,
            meta.duration_seconds
        );
        Ok(meta)
    }

    fn extract_frame(&self, frame_index: u32, fps: f64) -> Result<RgbImage, ExtractionError> {
        let at = |failure: ExtractionFailure| ExtractionError::at_frame(frame_index, failure);
        let target = ClipMetadata::frame_time(frame_index, fps);
        debug!("Decoding frame {} (t={:.6}s) from '{}'", frame_index, target, self.path.display());

        let mut clip = self.open().map_err(at)?;
        let frame = clip.frame_at(target, 0.5 / fps).map_err(at)?;
        to_rgb_image(&frame).map_err(at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_file() {
        let source = LibavSource::new("nonexistent.mp4");
        let err = source.probe_metadata().unwrap_err();
        assert!(matches!(err.failure, ExtractionFailure::ToolFailed(_)));

        let err = source.extract_frame(3, 10.0).unwrap_err();
        assert_eq!(err.frame_index, Some(3));
    }

    #[test]
    fn test_rational_conversion() {
        assert_eq!(rational_to_f64(ffmpeg::Rational::new(30, 1)), Some(30.0));
        assert_eq!(rational_to_f64(ffmpeg::Rational::new(0, 0)), None);
    }

    #[test]
    fn test_sample_clip_when_available() {
        let path = PathBuf::from("tests/assets/sample.mp4");
        if path.exists() {
            let source = LibavSource::new(&path);
            let meta = source.probe_metadata().unwrap();
            let frame = source.extract_frame(0, meta.fps).unwrap();
            assert_eq!(frame.dimensions(), (meta.width, meta.height));
        }
    }
}
