use crate::config::CompilerConfig;
use crate::geometry::{Canvas, FitTransform, NormRect, PixelRect};
use crate::source::FrameSource;
use crate::{ExtractionError, ExtractionFailure, Result};
use image::{ImageFormat, Rgba, RgbaImage, RgbImage};
use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Cursor;

/// Default per-side growth for regions expected to contain motion
pub const DEFAULT_MARGIN: f64 = 0.08;

/// Default corner radius as a fraction of the shorter rectangle side
pub const DEFAULT_CORNER_RADIUS_FRACTION: f64 = 0.25;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Mask shape applied to an extracted region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CornerStyle {
    Rounded,
    #[default]
    Square,
}

/// An authored rectangle in source-clip normalized coordinates
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub frame_index: u32,
    /// Semantic key such as `left-eye`, `right-eye`, `mouth`, or any artifact name
    pub key: String,
    #[serde(flatten)]
    pub rect: NormRect,
    #[serde(default)]
    pub corner: CornerStyle,
    /// Grow by the configured margin before cropping
    #[serde(default)]
    pub expand: bool,
}

/// A full-canvas RGBA overlay for one region
#[derive(Debug, Clone)]
pub struct RegionArtifact {
    pub key: String,
    pub frame_index: u32,
    /// Where the region ended up, in canvas-normalized coordinates
    pub canvas_rect: NormRect,
    pub image: RgbaImage,
}

impl RegionArtifact {
    /// PNG encoding of the overlay
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.image.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)?;
        Ok(out)
    }
}

/// Grow `rect` by `margin` of its own size on each side, clamped to the unit square
pub fn expand(rect: NormRect, margin: f64) -> NormRect {
    let dx = rect.w * margin;
    let dy = rect.h * margin;
    NormRect::new(rect.x - dx, rect.y - dy, rect.w + 2.0 * dx, rect.h + 2.0 * dy).clamped()
}

/// Isolate `rect` (canvas-normalized) from `frame` on an otherwise transparent canvas
pub fn extract_transparent(frame: &RgbImage, rect: NormRect, corner: CornerStyle) -> RgbaImage {
    extract_transparent_with(frame, rect, corner, DEFAULT_CORNER_RADIUS_FRACTION)
}

/// [`extract_transparent`] with an explicit corner radius fraction (capped at 0.5)
pub fn extract_transparent_with(
    frame: &RgbImage,
    rect: NormRect,
    corner: CornerStyle,
    radius_fraction: f64,
) -> RgbaImage {
    let (width, height) = frame.dimensions();
    let canvas = Canvas { width, height };
    let px = rect.to_pixels(canvas);

    if px.is_empty() {
        debug!("Degenerate region {:?}, emitting transparent canvas", rect);
        return RgbaImage::from_pixel(width, height, TRANSPARENT);
    }

    let radius = match corner {
        CornerStyle::Square => 0.0,
        CornerStyle::Rounded => radius_fraction.clamp(0.0, 0.5) * px.width.min(px.height) as f64,
    };

    RgbaImage::from_fn(width, height, |x, y| {
        if inside(&px, radius, x, y) {
            let p = frame.get_pixel(x, y);
            Rgba([p[0], p[1], p[2], 255])
        } else {
            TRANSPARENT
        }
    })
}

fn inside(rect: &PixelRect, radius: f64, x: u32, y: u32) -> bool {
    if !rect.contains(x, y) {
        return false;
    }
    if radius <= 0.0 {
        return true;
    }

    // distance from the pixel center to the rounded rectangle's inner core
    let cx = x as f64 + 0.5;
    let cy = y as f64 + 0.5;
    let left = rect.x as f64 + radius;
    let right = (rect.x + rect.width) as f64 - radius;
    let top = rect.y as f64 + radius;
    let bottom = (rect.y + rect.height) as f64 - radius;

    let dx = cx - cx.clamp(left, right);
    let dy = cy - cy.clamp(top, bottom);
    dx * dx + dy * dy <= radius * radius
}

/// Produce one overlay per region, each aligned with the compiled animation frames
pub fn extract_regions<S>(source: &S, regions: &[Region], config: &CompilerConfig) -> Result<Vec<RegionArtifact>>
where
    S: FrameSource + ?Sized,
{
    config.validate()?;
    for region in regions {
        region.rect.validate()?;
    }

    let canvas = config.canvas()?;
    let clip = source.probe_metadata()?;
    let transform = FitTransform::checked(clip.width, clip.height, canvas)?;

    let mut indices: Vec<u32> = regions.iter().map(|r| r.frame_index).collect();
    indices.sort_unstable();
    indices.dedup();

    if let (Some(frame_count), Some(&highest)) = (clip.frame_count(), indices.last()) {
        if highest as u64 >= frame_count {
            return Err(ExtractionError::at_frame(highest, ExtractionFailure::OutOfRange { frame_count }).into());
        }
    }

    let extracted: Vec<std::result::Result<(u32, RgbImage), ExtractionError>> = indices
        .par_iter()
        .map(|&index| {
            source
                .extract_frame(index, clip.fps)
                .map(|raw| (index, transform.fit_frame(&raw, config.background())))
        })
        .collect();

    let mut frames: BTreeMap<u32, RgbImage> = BTreeMap::new();
    for result in extracted {
        let (index, image) = result?;
        frames.insert(index, image);
    }

    let mut artifacts = Vec::with_capacity(regions.len());
    for region in regions {
        let Some(frame) = frames.get(&region.frame_index) else {
            continue;
        };
        let source_rect = if region.expand {
            expand(region.rect, config.region_margin)
        } else {
            region.rect.clamped()
        };
        let canvas_rect = transform.map_rect(source_rect);

        artifacts.push(RegionArtifact {
            key: region.key.clone(),
            frame_index: region.frame_index,
            canvas_rect,
            image: extract_transparent_with(frame, canvas_rect, region.corner, config.corner_radius_fraction),
        });
    }

    info!("Extracted {} region overlays from {} frames", artifacts.len(), frames.len());
    Ok(artifacts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ClipMetadata;
    use image::Rgb;

    fn solid(width: u32, height: u32) -> RgbImage {
        RgbImage::from_pixel(width, height, Rgb([200, 100, 50]))
    }

    #[test]
    fn test_expand_grows_symmetrically() {
        let r = expand(NormRect::new(0.4, 0.4, 0.2, 0.1), DEFAULT_MARGIN);
        assert!((r.x - (0.4 - 0.016)).abs() < 1e-12);
        assert!((r.w - 0.232).abs() < 1e-12);
        assert!((r.y - (0.4 - 0.008)).abs() < 1e-12);
        assert!((r.h - 0.116).abs() < 1e-12);
    }

    #[test]
    fn test_expand_clamps_to_unit_square() {
        let r = expand(NormRect::new(0.0, 0.95, 0.5, 0.05), 0.5);
        assert_eq!(r.x, 0.0);
        assert!(r.y + r.h <= 1.0 + 1e-12);
        assert!(r.w > 0.5);
    }

    #[test]
    fn test_square_region_isolated() {
        let frame = solid(100, 100);
        let out = extract_transparent(&frame, NormRect::new(0.2, 0.2, 0.5, 0.5), CornerStyle::Square);

        assert_eq!(out.dimensions(), (100, 100));
        assert_eq!(*out.get_pixel(20, 20), Rgba([200, 100, 50, 255]));
        assert_eq!(*out.get_pixel(69, 69), Rgba([200, 100, 50, 255]));
        assert_eq!(out.get_pixel(70, 70)[3], 0);
        assert_eq!(out.get_pixel(19, 50)[3], 0);
    }

    #[test]
    fn test_rounded_corners_are_cut() {
        let frame = solid(100, 100);
        let out = extract_transparent(&frame, NormRect::new(0.2, 0.2, 0.5, 0.5), CornerStyle::Rounded);

        // radius is 12.5px; the corner pixel falls outside the arc, the edge midpoint stays
        assert_eq!(out.get_pixel(20, 20)[3], 0);
        assert_eq!(out.get_pixel(69, 69)[3], 0);
        assert_eq!(out.get_pixel(45, 20)[3], 255);
        assert_eq!(out.get_pixel(45, 45)[3], 255);
    }

    #[test]
    fn test_degenerate_rect_is_fully_transparent() {
        let frame = solid(40, 30);
        let out = extract_transparent(&frame, NormRect::new(1.2, 0.5, 0.3, 0.2), CornerStyle::Rounded);
        assert_eq!(out.dimensions(), (40, 30));
        assert!(out.pixels().all(|p| p[3] == 0));

        let out = extract_transparent(&frame, NormRect::new(0.5, 0.5, 0.0, 0.2), CornerStyle::Square);
        assert!(out.pixels().all(|p| p[3] == 0));
    }

    struct WideClip;

    impl FrameSource for WideClip {
        fn probe_metadata(&self) -> std::result::Result<ClipMetadata, ExtractionError> {
            Ok(ClipMetadata { duration_seconds: 0.2, fps: 10.0, width: 160, height: 90 })
        }

        fn extract_frame(&self, _frame_index: u32, _fps: f64) -> std::result::Result<RgbImage, ExtractionError> {
            Ok(RgbImage::from_pixel(160, 90, Rgb([255, 255, 255])))
        }
    }

    #[test]
    fn test_regions_follow_letterbox() {
        let config = CompilerConfig { canvas_width: 160, canvas_height: 180, ..Default::default() };
        let regions = vec![Region {
            frame_index: 1,
            key: "mouth".to_string(),
            rect: NormRect::FULL,
            corner: CornerStyle::Square,
            expand: false,
        }];

        let artifacts = extract_regions(&WideClip, &regions, &config).unwrap();
        let art = &artifacts[0];
        let transform = FitTransform::new(160, 90, config.canvas().unwrap());
        let content = transform.content_pixels();

        assert_eq!(art.canvas_rect, transform.map_rect(NormRect::FULL));
        assert_eq!(art.image.get_pixel(80, content.y - 1)[3], 0);
        assert_eq!(art.image.get_pixel(80, content.y)[3], 255);
        assert_eq!(art.image.get_pixel(80, content.y + content.height - 1)[3], 255);
        assert_eq!(art.image.get_pixel(80, content.y + content.height)[3], 0);
        assert!(!art.to_png().unwrap().is_empty());
    }

    struct HdClip;

    impl FrameSource for HdClip {
        fn probe_metadata(&self) -> std::result::Result<ClipMetadata, ExtractionError> {
            Ok(ClipMetadata { duration_seconds: 0.1, fps: 10.0, width: 1280, height: 720 })
        }

        fn extract_frame(&self, _frame_index: u32, _fps: f64) -> std::result::Result<RgbImage, ExtractionError> {
            Ok(RgbImage::from_pixel(1280, 720, Rgb([255, 255, 255])))
        }
    }

    #[test]
    fn test_full_overlay_rows_match_fitted_frame() {
        // 1280x720 on 240x280 puts the content edge at half a pixel
        let config = CompilerConfig::default();
        let regions = vec![Region {
            frame_index: 0,
            key: "artifact".to_string(),
            rect: NormRect::FULL,
            corner: CornerStyle::Square,
            expand: false,
        }];

        let artifacts = extract_regions(&HdClip, &regions, &config).unwrap();
        let overlay = &artifacts[0].image;

        let transform = FitTransform::new(1280, 720, config.canvas().unwrap());
        let fitted = transform.fit_frame(&RgbImage::from_pixel(1280, 720, Rgb([255, 255, 255])), config.background());

        for y in 0..config.canvas_height {
            let painted = fitted.get_pixel(120, y)[0] > 0;
            let opaque = overlay.get_pixel(120, y)[3] == 255;
            assert_eq!(painted, opaque, "row {} disagrees", y);
        }
    }

    #[test]
    fn test_region_out_of_range_frame() {
        let regions = vec![Region {
            frame_index: 2,
            key: "left-eye".to_string(),
            rect: NormRect::new(0.1, 0.1, 0.2, 0.2),
            corner: CornerStyle::Rounded,
            expand: true,
        }];
        let err = extract_regions(&WideClip, &regions, &CompilerConfig::default()).unwrap_err();
        assert!(matches!(err, crate::CompilerError::Extraction(ExtractionError { frame_index: Some(2), .. })));
    }

    #[test]
    fn test_region_json_shape() {
        let json = r#"[{"frameIndex": 3, "key": "right-eye", "x": 0.1, "y": 0.2, "w": 0.3, "h": 0.4, "corner": "rounded", "expand": true}]"#;
        let regions: Vec<Region> = serde_json::from_str(json).unwrap();
        assert_eq!(regions[0].corner, CornerStyle::Rounded);
        assert_eq!(regions[0].rect, NormRect::new(0.1, 0.2, 0.3, 0.4));
        assert!(regions[0].expand);
    }
}
