//! Motion-JPEG packaging: every compiled frame becomes a standalone baseline
//! JPEG, concatenated in presentation order with no cross-frame coding.
//!
//! This path shares nothing with the `.anim` codec except the compiled frames.

use crate::{FormatError, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, RgbImage};
use log::debug;
use rayon::prelude::*;

const SOI: u8 = 0xd8;
const EOI: u8 = 0xd9;
const SOS: u8 = 0xda;

/// A concatenated JPEG stream plus where each frame lives in it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MjpegPackage {
    pub bytes: Vec<u8>,
    /// `(offset, length)` of each frame in `bytes`
    pub frames: Vec<(usize, usize)>,
}

impl MjpegPackage {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// JPEG bytes of frame `index`
    pub fn frame(&self, index: usize) -> Option<&[u8]> {
        self.frames.get(index).map(|&(offset, len)| &self.bytes[offset..offset + len])
    }
}

fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    {
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality);
        encoder.encode(frame.as_raw(), frame.width(), frame.height(), ExtendedColorType::Rgb8)?;
    }
    Ok(out)
}

/// Encode `frames` as JPEGs (in parallel) and concatenate them in order
pub fn package_mjpeg(frames: &[RgbImage], quality: u8) -> Result<MjpegPackage> {
    let encoded = frames
        .par_iter()
        .map(|frame| encode_jpeg(frame, quality))
        .collect::<Result<Vec<_>>>()?;

    let mut bytes = Vec::with_capacity(encoded.iter().map(Vec::len).sum());
    let mut offsets = Vec::with_capacity(encoded.len());
    for jpeg in encoded {
        offsets.push((bytes.len(), jpeg.len()));
        bytes.extend_from_slice(&jpeg);
    }

    debug!("Packaged {} frames into {} bytes of MJPEG", offsets.len(), bytes.len());
    Ok(MjpegPackage { bytes, frames: offsets })
}

/// Split a concatenated JPEG stream back into per-frame slices.
///
/// Walks marker segments rather than searching for `FFD9`, so marker-like
/// bytes inside tables or stuffed entropy data do not split a frame.
pub fn split_frames(bytes: &[u8]) -> std::result::Result<Vec<&[u8]>, FormatError> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let end = jpeg_end(bytes, pos)?;
        frames.push(&bytes[pos..end]);
        pos = end;
    }

    Ok(frames)
}

/// Offset one past the EOI marker of the JPEG starting at `start`
fn jpeg_end(bytes: &[u8], start: usize) -> std::result::Result<usize, FormatError> {
    let bad = |offset: usize, reason: &'static str| FormatError::BadJpeg { offset, reason };
    let truncated = |offset: usize, needed: usize| FormatError::Truncated {
        section: "jpeg segment",
        offset,
        needed,
        len: bytes.len(),
    };

    if bytes.get(start..start + 2) != Some(&[0xff, SOI][..]) {
        return Err(bad(start, "missing start-of-image marker"));
    }
    let mut pos = start + 2;

    loop {
        if pos + 2 > bytes.len() {
            return Err(truncated(pos, 2));
        }
        if bytes[pos] != 0xff {
            return Err(bad(pos, "expected marker"));
        }
        let marker = bytes[pos + 1];
        match marker {
            0xff => {
                // fill byte
                pos += 1;
                continue;
            }
            EOI => return Ok(pos + 2),
            0xd0..=0xd7 | 0x01 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        let len_bytes = bytes.get(pos + 2..pos + 4).ok_or_else(|| truncated(pos + 2, 2))?;
        let seg_len = u16::from_be_bytes([len_bytes[0], len_bytes[1]]) as usize;
        if seg_len < 2 {
            return Err(bad(pos + 2, "segment length below 2"));
        }
        let seg_end = pos + 2 + seg_len;
        if seg_end > bytes.len() {
            return Err(truncated(pos + 2, seg_len));
        }
        pos = seg_end;

        if marker == SOS {
            // entropy-coded data runs until a marker that is not stuffing or a restart
            loop {
                if pos + 1 >= bytes.len() {
                    return Err(truncated(pos, 2));
                }
                if bytes[pos] == 0xff {
                    match bytes[pos + 1] {
                        0x00 | 0xd0..=0xd7 => pos += 2,
                        0xff => pos += 1,
                        _ => break,
                    }
                } else {
                    pos += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(shift: u32) -> RgbImage {
        RgbImage::from_fn(24, 28, |x, y| Rgb([(x * 10 + shift) as u8, (y * 9) as u8, 200]))
    }

    #[test]
    fn test_frames_in_presentation_order() {
        let frames = vec![gradient(0), RgbImage::from_pixel(24, 28, Rgb([255, 255, 255])), gradient(5)];
        let package = package_mjpeg(&frames, 90).unwrap();

        assert_eq!(package.frame_count(), 3);
        let white = image::load_from_memory(package.frame(1).unwrap()).unwrap().to_rgb8();
        assert_eq!(white.dimensions(), (24, 28));
        assert!(white.pixels().all(|p| p[0] > 245 && p[1] > 245 && p[2] > 245));
    }

    #[test]
    fn test_split_matches_package_offsets() {
        let frames: Vec<RgbImage> = (0..4).map(|i| gradient(i * 7)).collect();
        let package = package_mjpeg(&frames, 80).unwrap();
        let split = split_frames(&package.bytes).unwrap();

        assert_eq!(split.len(), 4);
        for (i, slice) in split.iter().enumerate() {
            assert_eq!(Some(*slice), package.frame(i));
            assert!(image::load_from_memory(slice).is_ok());
        }
    }

    #[test]
    fn test_empty_sequence() {
        let package = package_mjpeg(&[], 85).unwrap();
        assert!(package.bytes.is_empty());
        assert!(split_frames(&package.bytes).unwrap().is_empty());
    }

    #[test]
    fn test_split_rejects_garbage() {
        assert!(matches!(split_frames(b"nope"), Err(FormatError::BadJpeg { offset: 0, .. })));

        let package = package_mjpeg(&[gradient(1)], 85).unwrap();
        let cut = &package.bytes[..package.bytes.len() - 10];
        assert!(matches!(split_frames(cut), Err(FormatError::Truncated { .. })));
    }

    #[test]
    fn test_packaging_is_deterministic() {
        let frames: Vec<RgbImage> = (0..3).map(gradient).collect();
        assert_eq!(package_mjpeg(&frames, 75).unwrap(), package_mjpeg(&frames, 75).unwrap());
    }
}
