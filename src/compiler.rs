use crate::config::CompilerConfig;
use crate::geometry::{Canvas, FitTransform};
use crate::source::{ClipMetadata, FrameSource};
use crate::timeline::{FrameAction, FrameBudgetWarning, Phase, Timeline, TimelineSummary};
use crate::{ExtractionError, ExtractionFailure, Result};
use image::RgbImage;
use log::{debug, info};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;

/// One canvas-sized frame of the compiled sequence
#[derive(Debug, Clone)]
pub struct CompiledFrame {
    pub phase: Phase,
    pub source_frame_index: u32,
    /// Passed through unchanged for the firmware to render at playback time
    pub actions: Vec<FrameAction>,
    pub image: RgbImage,
}

/// Ordered canvas frames for intro, loop and exit, plus what produced them
#[derive(Debug, Clone)]
pub struct CompiledAnimation {
    pub canvas: Canvas,
    pub fps: f64,
    pub clip: ClipMetadata,
    pub transform: FitTransform,
    pub summary: TimelineSummary,
    pub frames: Vec<CompiledFrame>,
}

impl CompiledAnimation {
    /// Raster frames in presentation order
    pub fn rasters(&self) -> Vec<RgbImage> {
        self.frames.iter().map(|f| f.image.clone()).collect()
    }

    pub fn budget_warning(&self) -> Option<FrameBudgetWarning> {
        self.summary.budget_warning
    }

    /// Sidecar description of the materialized artifacts
    pub fn manifest(&self, anim_bytes: Option<usize>, mjpeg_bytes: Option<usize>) -> Manifest {
        Manifest {
            canvas: self.canvas,
            fps: self.fps,
            total_frames: self.summary.total_frames,
            duration_seconds: self.summary.duration_seconds,
            budget_warning: self.summary.budget_warning,
            anim_bytes,
            mjpeg_bytes,
            frames: self
                .frames
                .iter()
                .map(|f| ManifestFrame {
                    phase: f.phase,
                    source_frame_index: f.source_frame_index,
                    actions: f.actions.clone(),
                })
                .collect(),
        }
    }
}

/// JSON sidecar written next to `.anim`/`.mjpeg` artifacts.
///
/// The binary format has no room for per-frame actions, so they travel here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub canvas: Canvas,
    pub fps: f64,
    pub total_frames: usize,
    pub duration_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_warning: Option<FrameBudgetWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub anim_bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mjpeg_bytes: Option<usize>,
    pub frames: Vec<ManifestFrame>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFrame {
    pub phase: Phase,
    pub source_frame_index: u32,
    pub actions: Vec<FrameAction>,
}

/// Expand a timeline into canvas frames, intro then loop then exit.
///
/// Each distinct source index is extracted and fitted once, in parallel. Any
/// out-of-range index or extraction failure aborts the whole compilation.
pub fn compile_timeline<S>(timeline: &Timeline, source: &S, config: &CompilerConfig) -> Result<CompiledAnimation>
where
    S: FrameSource + ?Sized,
{
    config.validate()?;
    let canvas = config.canvas()?;
    let background = config.background();

    let clip = source.probe_metadata()?;
    let transform = FitTransform::checked(clip.width, clip.height, canvas)?;
    let fps = config.playback_fps.unwrap_or(clip.fps);
    let summary = timeline.summary(fps, config.frame_budget)?;

    let distinct = timeline.distinct_source_indices();
    if let (Some(frame_count), Some(&highest)) = (clip.frame_count(), distinct.last()) {
        if highest as u64 >= frame_count {
            return Err(ExtractionError::at_frame(highest, ExtractionFailure::OutOfRange { frame_count }).into());
        }
    }

    debug!(
        "Extracting {} distinct source frames for {} timeline frames",
        distinct.len(),
        summary.total_frames
    );

    // collect every result, then report the lowest failing index
    let extracted: Vec<std::result::Result<(u32, RgbImage), ExtractionError>> = distinct
        .par_iter()
        .map(|&index| {
            source
                .extract_frame(index, clip.fps)
                .map(|raw| (index, transform.fit_frame(&raw, background)))
        })
        .collect();

    let mut fitted: BTreeMap<u32, RgbImage> = BTreeMap::new();
    for result in extracted {
        let (index, image) = result?;
        fitted.insert(index, image);
    }

    let mut frames = Vec::with_capacity(summary.total_frames);
    for (phase, frame) in timeline.frames() {
        let image = fitted
            .get(&frame.source_frame_index)
            .cloned()
            .ok_or_else(|| {
                ExtractionError::at_frame(
                    frame.source_frame_index,
                    ExtractionFailure::BadOutput("frame missing after extraction".to_string()),
                )
            })?;
        frames.push(CompiledFrame {
            phase,
            source_frame_index: frame.source_frame_index,
            actions: frame.actions.clone(),
            image,
        });
    }

    info!(
        "Compiled {} frames ({:.2}s at {:.2} FPS) onto {}x{} canvas",
        frames.len(),
        summary.duration_seconds,
        fps,
        canvas.width,
        canvas.height
    );

    Ok(CompiledAnimation {
        canvas,
        fps,
        clip,
        transform,
        summary,
        frames,
    })
}
