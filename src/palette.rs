//! Shared 16-bit palette for one animation.
//!
//! Quantization runs in two passes: [`Palette::build`] looks at every frame
//! at once and produces an immutable palette, then [`PaletteMapper`] maps
//! each frame's pixels to indices independently (and in parallel).

use image::{Rgb, RgbImage};
use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Maximum number of entries a palette can hold
pub const MAX_PALETTE_SIZE: usize = 256;

const RGB565_VALUES: usize = 1 << 16;

/// A 5-6-5 packed color cell as stored in the animation header
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rgb565(pub u16);

impl Rgb565 {
    /// Pack 8-bit channels by truncating the low bits
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        let r5 = (r >> 3) as u16;
        let g6 = (g >> 2) as u16;
        let b5 = (b >> 3) as u16;
        Self((r5 << 11) | (g6 << 5) | b5)
    }

    /// Expand back to 8-bit channels, replicating high bits into the low ones
    pub fn to_rgb(self) -> Rgb<u8> {
        let r5 = ((self.0 >> 11) & 0x1f) as u8;
        let g6 = ((self.0 >> 5) & 0x3f) as u8;
        let b5 = (self.0 & 0x1f) as u8;
        Rgb([(r5 << 3) | (r5 >> 2), (g6 << 2) | (g6 >> 4), (b5 << 3) | (b5 >> 2)])
    }
}

impl From<Rgb<u8>> for Rgb565 {
    fn from(pixel: Rgb<u8>) -> Self {
        Self::from_rgb(pixel[0], pixel[1], pixel[2])
    }
}

fn distance_sq(a: Rgb<u8>, b: Rgb<u8>) -> u32 {
    a.0.iter()
        .zip(b.0.iter())
        .map(|(&x, &y)| {
            let d = x as i32 - y as i32;
            (d * d) as u32
        })
        .sum()
}

/// Pixel counts per 16-bit color across a set of frames
struct ColorHistogram {
    counts: Vec<u32>,
}

impl ColorHistogram {
    fn empty() -> Self {
        Self { counts: vec![0; RGB565_VALUES] }
    }

    fn from_frames(frames: &[RgbImage]) -> Self {
        frames
            .par_iter()
            .fold(Self::empty, |mut hist, frame| {
                for pixel in frame.pixels() {
                    let key = Rgb565::from(*pixel).0 as usize;
                    hist.counts[key] = hist.counts[key].saturating_add(1);
                }
                hist
            })
            .reduce(Self::empty, |mut a, b| {
                for (x, y) in a.counts.iter_mut().zip(b.counts) {
                    *x = x.saturating_add(y);
                }
                a
            })
    }

    /// Colors present, in ascending 16-bit order
    fn entries(&self) -> Vec<(Rgb565, u32)> {
        self.counts
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(key, &count)| (Rgb565(key as u16), count))
            .collect()
    }
}

/// Ordered list of at most 256 colors shared by every frame of an animation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Palette {
    colors: Vec<Rgb565>,
}

impl Palette {
    /// Wrap raw cells, truncating anything beyond 256 entries
    pub fn from_cells(mut colors: Vec<Rgb565>) -> Self {
        colors.truncate(MAX_PALETTE_SIZE);
        Self { colors }
    }

    /// Build the shared palette from every frame of the animation.
    ///
    /// When the frames already use no more than `max_colors` distinct 16-bit
    /// colors the palette is exactly that set; otherwise a weighted median cut
    /// reduces it. The result depends only on the pixel data.
    pub fn build(frames: &[RgbImage], max_colors: usize) -> Self {
        let max_colors = max_colors.clamp(1, MAX_PALETTE_SIZE);
        let entries = ColorHistogram::from_frames(frames).entries();

        if entries.is_empty() {
            return Self { colors: vec![Rgb565(0)] };
        }

        if entries.len() <= max_colors {
            debug!("Palette is exact: {} distinct colors", entries.len());
            return Self {
                colors: entries.into_iter().map(|(color, _)| color).collect(),
            };
        }

        debug!("Reducing {} distinct colors to {}", entries.len(), max_colors);
        Self { colors: median_cut(entries, max_colors) }
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.colors.is_empty()
    }

    pub fn cells(&self) -> &[Rgb565] {
        &self.colors
    }

    /// Color at `index`, clamped to the last entry when out of range
    pub fn color_clamped(&self, index: u8) -> Rgb<u8> {
        match self.colors.len() {
            0 => Rgb([0, 0, 0]),
            len => self.colors[(index as usize).min(len - 1)].to_rgb(),
        }
    }

    /// Index of the entry closest to `pixel`; ties go to the lower index
    pub fn nearest(&self, pixel: Rgb<u8>) -> u8 {
        let mut best = 0usize;
        let mut best_dist = u32::MAX;
        for (i, color) in self.colors.iter().enumerate() {
            let dist = distance_sq(pixel, color.to_rgb());
            if dist < best_dist {
                best = i;
                best_dist = dist;
                if dist == 0 {
                    break;
                }
            }
        }
        best as u8
    }

    /// Second pass: freeze the nearest entry of every distinct 24-bit color in `frames`
    pub fn mapper(&self, frames: &[RgbImage]) -> PaletteMapper {
        let distinct: HashSet<[u8; 3]> = frames
            .par_iter()
            .fold(HashSet::new, |mut seen, frame| {
                seen.extend(frame.pixels().map(|p| p.0));
                seen
            })
            .reduce(HashSet::new, |mut a, b| {
                a.extend(b);
                a
            });

        let memo: HashMap<[u8; 3], u8> = distinct
            .into_par_iter()
            .map(|rgb| (rgb, self.nearest(Rgb(rgb))))
            .collect();
        debug!("Palette mapper covers {} distinct colors", memo.len());

        PaletteMapper { palette: self.clone(), memo }
    }
}

/// Immutable pixel-to-index mapping derived from a finished [`Palette`]
pub struct PaletteMapper {
    palette: Palette,
    memo: HashMap<[u8; 3], u8>,
}

impl PaletteMapper {
    /// Nearest palette index by full 24-bit distance
    pub fn index_of(&self, pixel: Rgb<u8>) -> u8 {
        match self.memo.get(&pixel.0) {
            Some(&index) => index,
            None => self.palette.nearest(pixel),
        }
    }

    /// Palette indices of a frame in raster order
    pub fn index_frame(&self, frame: &RgbImage) -> Vec<u8> {
        frame.pixels().map(|p| self.index_of(*p)).collect()
    }

    /// Index every frame, in parallel, preserving frame order
    pub fn index_frames(&self, frames: &[RgbImage]) -> Vec<Vec<u8>> {
        frames.par_iter().map(|frame| self.index_frame(frame)).collect()
    }
}

fn channel_range(entries: &[(Rgb565, u32)]) -> (usize, u8) {
    let mut lo = [u8::MAX; 3];
    let mut hi = [0u8; 3];
    for (color, _) in entries {
        let rgb = color.to_rgb();
        for c in 0..3 {
            lo[c] = lo[c].min(rgb[c]);
            hi[c] = hi[c].max(rgb[c]);
        }
    }
    let mut widest = 0;
    for c in 1..3 {
        if hi[c] - lo[c] > hi[widest] - lo[widest] {
            widest = c;
        }
    }
    (widest, hi[widest] - lo[widest])
}

fn median_cut(entries: Vec<(Rgb565, u32)>, max_colors: usize) -> Vec<Rgb565> {
    let mut boxes = vec![entries];

    while boxes.len() < max_colors {
        // widest box first; ties keep the earliest box
        let mut candidate: Option<(usize, usize, u8)> = None;
        for (i, b) in boxes.iter().enumerate() {
            if b.len() < 2 {
                continue;
            }
            let (channel, range) = channel_range(b);
            if candidate.map_or(true, |(_, _, best)| range > best) {
                candidate = Some((i, channel, range));
            }
        }

        let Some((index, channel, _)) = candidate else {
            break;
        };

        let mut target = std::mem::take(&mut boxes[index]);
        target.sort_by_key(|(color, _)| (color.to_rgb()[channel], color.0));

        let total: u64 = target.iter().map(|(_, n)| *n as u64).sum();
        let mut running = 0u64;
        let mut split = target.len() / 2;
        for (i, (_, n)) in target.iter().enumerate() {
            running += *n as u64;
            if running * 2 >= total {
                split = i + 1;
                break;
            }
        }
        let split = split.clamp(1, target.len() - 1);

        let upper = target.split_off(split);
        boxes[index] = target;
        boxes.insert(index + 1, upper);
    }

    let mut colors: Vec<Rgb565> = Vec::with_capacity(boxes.len());
    for b in &boxes {
        let color = weighted_mean(b);
        if !colors.contains(&color) {
            colors.push(color);
        }
    }
    colors
}

fn weighted_mean(entries: &[(Rgb565, u32)]) -> Rgb565 {
    let mut sums = [0u64; 3];
    let mut total = 0u64;
    for (color, n) in entries {
        let rgb = color.to_rgb();
        for c in 0..3 {
            sums[c] += rgb[c] as u64 * *n as u64;
        }
        total += *n as u64;
    }
    let total = total.max(1);
    let mean = |c: usize| ((sums[c] + total / 2) / total) as u8;
    Rgb565::from_rgb(mean(0), mean(1), mean(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb565_packing() {
        assert_eq!(Rgb565::from_rgb(255, 255, 255).0, 0xffff);
        assert_eq!(Rgb565::from_rgb(0, 0, 0).0, 0);
        assert_eq!(Rgb565::from_rgb(255, 0, 0).0, 0xf800);
        assert_eq!(Rgb565::from_rgb(0, 255, 0).0, 0x07e0);
        assert_eq!(Rgb565::from_rgb(0, 0, 255).0, 0x001f);
    }

    #[test]
    fn test_rgb565_expansion_is_stable() {
        for key in [0u16, 0x1234, 0xf800, 0x07e0, 0xffff, 0x8410] {
            let rgb = Rgb565(key).to_rgb();
            assert_eq!(Rgb565::from(rgb).0, key);
        }
    }

    #[test]
    fn test_exact_palette_when_few_colors() {
        let frame = RgbImage::from_fn(4, 4, |x, _| if x < 2 { Rgb([255, 0, 0]) } else { Rgb([0, 0, 255]) });
        let palette = Palette::build(&[frame], 256);
        assert_eq!(palette.len(), 2);
        // ascending 16-bit order
        assert_eq!(palette.cells(), &[Rgb565(0x001f), Rgb565(0xf800)]);
    }

    #[test]
    fn test_reduction_respects_budget() {
        let frame = RgbImage::from_fn(64, 64, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, ((x + y) * 2) as u8]));
        let palette = Palette::build(&[frame.clone()], 16);
        assert!(palette.len() <= 16);
        assert!(!palette.is_empty());

        let full = Palette::build(&[frame], 256);
        assert!(full.len() <= 256);
    }

    #[test]
    fn test_build_is_deterministic() {
        let frames: Vec<RgbImage> = (0..3)
            .map(|i| RgbImage::from_fn(40, 30, |x, y| Rgb([(x * 6 + i) as u8, (y * 8) as u8, (x * y) as u8])))
            .collect();
        assert_eq!(Palette::build(&frames, 32), Palette::build(&frames, 32));
    }

    #[test]
    fn test_mapper_indices_in_range() {
        let frame = RgbImage::from_fn(50, 50, |x, y| Rgb([(x * 5) as u8, (y * 5) as u8, 128]));
        let palette = Palette::build(&[frame.clone()], 8);
        let mapper = palette.mapper(&[frame.clone()]);
        let indices = mapper.index_frame(&frame);
        assert_eq!(indices.len(), 2500);
        assert!(indices.iter().all(|&i| (i as usize) < palette.len()));
    }

    #[test]
    fn test_mapper_uses_full_color_distance() {
        // (7,7,7) shares a 16-bit cell with (0,4,0) but sits closer to (8,8,8)
        let frame = RgbImage::from_fn(2, 1, |x, _| if x == 0 { Rgb([7, 7, 7]) } else { Rgb([8, 8, 8]) });
        let palette = Palette::build(&[frame.clone()], 256);
        assert_eq!(palette.cells(), &[Rgb565(0x0020), Rgb565(0x0841)]);

        let mapper = palette.mapper(&[frame.clone()]);
        assert_eq!(mapper.index_frame(&frame), vec![1, 1]);
        // colors outside the mapped frames still resolve by distance
        assert_eq!(mapper.index_of(Rgb([1, 5, 1])), 0);
    }

    #[test]
    fn test_nearest_and_clamp() {
        let palette = Palette::from_cells(vec![Rgb565(0), Rgb565(0xffff)]);
        assert_eq!(palette.nearest(Rgb([10, 10, 10])), 0);
        assert_eq!(palette.nearest(Rgb([240, 250, 245])), 1);
        assert_eq!(palette.color_clamped(200), Rgb([255, 255, 255]));
    }

    #[test]
    fn test_empty_input_yields_single_entry() {
        let palette = Palette::build(&[], 256);
        assert_eq!(palette.len(), 1);
    }
}
