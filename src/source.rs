use crate::{ExtractionError, ExtractionFailure};
use image::RgbImage;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Clip properties reported by the frame tool
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipMetadata {
    pub duration_seconds: f64,
    /// Actual sample rate of the clip, which frame indices are counted in
    pub fps: f64,
    pub width: u32,
    pub height: u32,
}

impl ClipMetadata {
    /// Number of addressable frames, or `None` when the duration is unknown
    pub fn frame_count(&self) -> Option<u64> {
        if self.duration_seconds > 0.0 && self.fps > 0.0 && self.fps.is_finite() {
            Some((self.duration_seconds * self.fps).round() as u64)
        } else {
            None
        }
    }

    /// Presentation time of `frame_index` in seconds
    pub fn frame_time(frame_index: u32, fps: f64) -> f64 {
        frame_index as f64 / fps
    }
}

/// Boundary to the external frame extraction and probing tool.
///
/// Implementations must be shareable across threads: the compiler extracts
/// distinct frame indices in parallel.
pub trait FrameSource: Send + Sync {
    /// Duration, sample rate and native dimensions of the clip
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError>;

    /// Frame `frame_index` at the clip's sample rate `fps`, as RGB
    fn extract_frame(&self, frame_index: u32, fps: f64) -> Result<RgbImage, ExtractionError>;
}

impl<T: FrameSource + ?Sized> FrameSource for Box<T> {
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
        (**self).probe_metadata()
    }

    fn extract_frame(&self, frame_index: u32, fps: f64) -> Result<RgbImage, ExtractionError> {
        (**self).extract_frame(frame_index, fps)
    }
}

/// Frame source that shells out to the `ffmpeg` and `ffprobe` binaries
#[derive(Debug, Clone)]
pub struct FfmpegCliSource {
    path: PathBuf,
    ffmpeg_bin: String,
    ffprobe_bin: String,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeOut {
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

/// Parse an ffmpeg `num/den` rate, rejecting zero denominators and zero rates
pub fn parse_ff_ratio(value: &str) -> Option<f64> {
    let (num, den) = value.split_once('/').unwrap_or((value, "1"));
    let num = num.trim().parse::<f64>().ok()?;
    let den = den.trim().parse::<f64>().ok()?;
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}

fn spawn_failure(bin: &str, err: std::io::Error) -> ExtractionFailure {
    match err.kind() {
        ErrorKind::NotFound => ExtractionFailure::ToolUnavailable(format!("'{}' not found on PATH", bin)),
        _ => ExtractionFailure::ToolUnavailable(format!("failed to run '{}': {}", bin, err)),
    }
}

impl FfmpegCliSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
        }
    }

    /// Override the tool binaries (names on PATH or absolute paths)
    pub fn with_binaries(mut self, ffmpeg_bin: impl Into<String>, ffprobe_bin: impl Into<String>) -> Self {
        self.ffmpeg_bin = ffmpeg_bin.into();
        self.ffprobe_bin = ffprobe_bin.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSource for FfmpegCliSource {
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
        debug!("Probing '{}' with {}", self.path.display(), self.ffprobe_bin);
        let out = Command::new(&self.ffprobe_bin)
            .args(["-v", "error", "-print_format", "json", "-show_streams", "-show_format"])
            .arg(&self.path)
            .output()
            .map_err(|e| ExtractionError::general(spawn_failure(&self.ffprobe_bin, e)))?;

        if !out.status.success() {
            return Err(ExtractionError::general(ExtractionFailure::ToolFailed(format!(
                "ffprobe failed for '{}': {}",
                self.path.display(),
                String::from_utf8_lossy(&out.stderr).trim()
            ))));
        }

        let bad = |msg: &str| ExtractionError::general(ExtractionFailure::BadOutput(msg.to_string()));

        let parsed: ProbeOut = serde_json::from_slice(&out.stdout)
            .map_err(|e| bad(&format!("ffprobe json parse failed: {}", e)))?;
        let stream = parsed
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("video"))
            .ok_or_else(|| bad("no video stream found"))?;

        let width = stream.width.ok_or_else(|| bad("missing video width"))?;
        let height = stream.height.ok_or_else(|| bad("missing video height"))?;

        // avg_frame_rate reflects the real sample rate; r_frame_rate is the nominal one
        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_ff_ratio)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_ff_ratio))
            .ok_or_else(|| bad("invalid frame rate"))?;

        let duration_seconds = stream
            .duration
            .as_deref()
            .or(parsed.format.as_ref().and_then(|f| f.duration.as_deref()))
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);

        let meta = ClipMetadata { duration_seconds, fps, width, height };
        info!(
            "Clip '{}': {}x{}, {:.3} FPS, {:.3}s",
            self.path.display(), width, height, fps, duration_seconds
        );
        Ok(meta)
    }

    fn extract_frame(&self, frame_index: u32, fps: f64) -> Result<RgbImage, ExtractionError> {
        let at = |failure: ExtractionFailure| ExtractionError::at_frame(frame_index, failure);
        let t = ClipMetadata::frame_time(frame_index, fps);
        debug!("Extracting frame {} (t={:.6}s) from '{}'", frame_index, t, self.path.display());

        let out = Command::new(&self.ffmpeg_bin)
            .args(["-v", "error", "-ss", &format!("{:.6}", t)])
            .arg("-i")
            .arg(&self.path)
            .args(["-frames:v", "1", "-f", "image2pipe", "-vcodec", "png", "pipe:1"])
            .output()
            .map_err(|e| at(spawn_failure(&self.ffmpeg_bin, e)))?;

        if !out.status.success() {
            return Err(at(ExtractionFailure::ToolFailed(format!(
                "ffmpeg failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ))));
        }
        if out.stdout.is_empty() {
            return Err(at(ExtractionFailure::BadOutput(format!("no frame decoded at {:.6}s", t))));
        }

        image::load_from_memory(&out.stdout)
            .map(|img| img.to_rgb8())
            .map_err(|e| at(ExtractionFailure::BadOutput(format!("undecodable frame: {}", e))))
    }
}

/// Frames already extracted to a directory of numbered PNG files
/// (`frame_0001.png`, `12.png`, ...), ordered by their trailing number
#[derive(Debug, Clone)]
pub struct ImageSequenceSource {
    dir: PathBuf,
    fps: f64,
    frames: Vec<PathBuf>,
}

fn trailing_number(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    let digits: String = stem
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}

impl ImageSequenceSource {
    /// Scan `dir` for numbered PNG frames played back at `fps`
    pub fn open(dir: impl Into<PathBuf>, fps: f64) -> Result<Self, ExtractionError> {
        let dir = dir.into();
        let unavailable = |msg: String| ExtractionError::general(ExtractionFailure::ToolUnavailable(msg));

        if !fps.is_finite() || fps <= 0.0 {
            return Err(unavailable(format!("frame rate must be positive, got {}", fps)));
        }

        let entries = std::fs::read_dir(&dir)
            .map_err(|e| unavailable(format!("cannot read '{}': {}", dir.display(), e)))?;

        let mut numbered: Vec<(u64, PathBuf)> = Vec::new();
        for entry in entries {
            let path = entry
                .map_err(|e| unavailable(format!("cannot read '{}': {}", dir.display(), e)))?
                .path();
            let is_png = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("png"));
            if !is_png {
                continue;
            }
            if let Some(n) = trailing_number(&path) {
                numbered.push((n, path));
            }
        }
        numbered.sort();

        debug!("Found {} numbered frames in '{}'", numbered.len(), dir.display());
        Ok(Self {
            dir,
            fps,
            frames: numbered.into_iter().map(|(_, p)| p).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
        let first = self.frames.first().ok_or_else(|| {
            ExtractionError::general(ExtractionFailure::BadOutput(format!(
                "no numbered PNG frames in '{}'",
                self.dir.display()
            )))
        })?;
        let (width, height) = image::image_dimensions(first).map_err(|e| {
            ExtractionError::general(ExtractionFailure::BadOutput(format!("{}: {}", first.display(), e)))
        })?;

        Ok(ClipMetadata {
            duration_seconds: self.frames.len() as f64 / self.fps,
            fps: self.fps,
            width,
            height,
        })
    }

    fn extract_frame(&self, frame_index: u32, _fps: f64) -> Result<RgbImage, ExtractionError> {
        let path = self.frames.get(frame_index as usize).ok_or_else(|| {
            ExtractionError::at_frame(
                frame_index,
                ExtractionFailure::OutOfRange { frame_count: self.frames.len() as u64 },
            )
        })?;

        image::open(path).map(|img| img.to_rgb8()).map_err(|e| {
            ExtractionError::at_frame(
                frame_index,
                ExtractionFailure::BadOutput(format!("{}: {}", path.display(), e)),
            )
        })
    }
}

/// Retries transient tool failures; out-of-range and bad-output errors pass through
#[derive(Debug, Clone)]
pub struct RetryingSource<S> {
    inner: S,
    retries: u32,
}

impl<S: FrameSource> RetryingSource<S> {
    pub fn new(inner: S, retries: u32) -> Self {
        Self { inner, retries }
    }

    fn retry<T>(&self, what: &str, mut op: impl FnMut() -> Result<T, ExtractionError>) -> Result<T, ExtractionError> {
        let mut attempt = 0;
        loop {
            match op() {
                Err(e) if e.failure.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!("{} failed (attempt {}/{}): {}", what, attempt, self.retries + 1, e);
                }
                other => return other,
            }
        }
    }
}

impl<S: FrameSource> FrameSource for RetryingSource<S> {
    fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
        self.retry("probe", || self.inner.probe_metadata())
    }

    fn extract_frame(&self, frame_index: u32, fps: f64) -> Result<RgbImage, ExtractionError> {
        self.retry(&format!("frame {}", frame_index), || self.inner.extract_frame(frame_index, fps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    #[test]
    fn test_parse_ff_ratio() {
        assert_eq!(parse_ff_ratio("30000/1001"), Some(30000.0 / 1001.0));
        assert_eq!(parse_ff_ratio("10/1"), Some(10.0));
        assert_eq!(parse_ff_ratio("25"), Some(25.0));
        assert_eq!(parse_ff_ratio("0/0"), None);
        assert_eq!(parse_ff_ratio("abc"), None);
    }

    #[test]
    fn test_frame_count_from_metadata() {
        let meta = ClipMetadata { duration_seconds: 2.0, fps: 12.0, width: 4, height: 4 };
        assert_eq!(meta.frame_count(), Some(24));

        let unknown = ClipMetadata { duration_seconds: 0.0, ..meta };
        assert_eq!(unknown.frame_count(), None);
    }

    #[test]
    fn test_image_sequence_orders_numerically() {
        let dir = tempdir().unwrap();
        for (n, shade) in [(10u32, 30u8), (2, 20), (1, 10)] {
            RgbImage::from_pixel(4, 3, Rgb([shade, 0, 0]))
                .save(dir.path().join(format!("frame_{}.png", n)))
                .unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let source = ImageSequenceSource::open(dir.path(), 10.0).unwrap();
        assert_eq!(source.len(), 3);

        let meta = source.probe_metadata().unwrap();
        assert_eq!((meta.width, meta.height), (4, 3));
        assert_eq!(meta.frame_count(), Some(3));

        assert_eq!(source.extract_frame(0, 10.0).unwrap().get_pixel(0, 0)[0], 10);
        assert_eq!(source.extract_frame(2, 10.0).unwrap().get_pixel(0, 0)[0], 30);

        let err = source.extract_frame(3, 10.0).unwrap_err();
        assert_eq!(err.frame_index, Some(3));
        assert!(matches!(err.failure, ExtractionFailure::OutOfRange { frame_count: 3 }));
    }

    #[test]
    fn test_missing_tool_is_unavailable() {
        let source = FfmpegCliSource::new("clip.mp4").with_binaries("no-such-ffmpeg-bin", "no-such-ffprobe-bin");
        let err = source.probe_metadata().unwrap_err();
        assert!(matches!(err.failure, ExtractionFailure::ToolUnavailable(_)));

        let err = source.extract_frame(4, 10.0).unwrap_err();
        assert_eq!(err.frame_index, Some(4));
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FrameSource for Flaky {
        fn probe_metadata(&self) -> Result<ClipMetadata, ExtractionError> {
            Ok(ClipMetadata { duration_seconds: 1.0, fps: 10.0, width: 2, height: 2 })
        }

        fn extract_frame(&self, frame_index: u32, _fps: f64) -> Result<RgbImage, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if frame_index > 9 {
                return Err(ExtractionError::at_frame(frame_index, ExtractionFailure::OutOfRange { frame_count: 10 }));
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(ExtractionError::at_frame(frame_index, ExtractionFailure::ToolFailed("busy".into())));
            }
            Ok(RgbImage::new(2, 2))
        }
    }

    #[test]
    fn test_retry_recovers_transient_failures() {
        let source = RetryingSource::new(
            Flaky { failures_left: AtomicU32::new(2), calls: AtomicU32::new(0) },
            2,
        );
        assert!(source.extract_frame(1, 10.0).is_ok());
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_retry_gives_up_and_skips_permanent_errors() {
        let source = RetryingSource::new(
            Flaky { failures_left: AtomicU32::new(5), calls: AtomicU32::new(0) },
            1,
        );
        assert!(source.extract_frame(1, 10.0).is_err());
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 2);

        source.inner.calls.store(0, Ordering::SeqCst);
        assert!(source.extract_frame(11, 10.0).is_err());
        assert_eq!(source.inner.calls.load(Ordering::SeqCst), 1);
    }
}
