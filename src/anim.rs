//! `.anim` container: a 14-byte header, one shared RGB565 palette and one
//! run-length payload per frame. All integers are little-endian.
//!
//! ```text
//! 0   "ANIM"
//! 4   version        u8
//! 5   frame count    u16
//! 7   width          u16
//! 9   height         u16
//! 11  palette size   u8 (0 = 256)
//! 12  reserved       2 bytes, zero
//! 14  palette        size x u16
//! ..  frames         (u32 length, length bytes of (run, index) pairs) x frame count
//! ```

use crate::geometry::Canvas;
use crate::palette::{Palette, Rgb565, MAX_PALETTE_SIZE};
use crate::{FormatError, Result, ValidationError};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use image::RgbImage;
use log::{debug, warn};

pub const MAGIC: &[u8; 4] = b"ANIM";
pub const FORMAT_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;

/// Longest run a single `(run, index)` record can express
pub const MAX_RUN: usize = u8::MAX as usize;

const MAX_FIELD: usize = u16::MAX as usize;

/// Parsed fixed-size header of an `.anim` buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnimHeader {
    pub version: u8,
    pub frame_count: u16,
    pub width: u16,
    pub height: u16,
    /// Number of palette entries, already mapped from the on-disk `0 = 256`
    pub palette_size: usize,
}

impl AnimHeader {
    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Frames reconstructed from an `.anim` buffer
#[derive(Debug, Clone)]
pub struct DecodedAnimation {
    pub header: AnimHeader,
    pub palette: Palette,
    pub frames: Vec<RgbImage>,
}

/// Run-length encode a raster-order index stream, splitting runs at 255
pub fn rle_encode(indices: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = indices.iter().copied();

    let Some(mut current) = iter.next() else {
        return out;
    };
    let mut run = 1usize;

    for index in iter {
        if index == current && run < MAX_RUN {
            run += 1;
        } else {
            out.push(run as u8);
            out.push(current);
            current = index;
            run = 1;
        }
    }
    out.push(run as u8);
    out.push(current);

    out
}

/// Expand `(run, index)` pairs into exactly `pixel_count` indices.
///
/// Indices at or past `palette_size` are clamped to the last entry. Output
/// stops once `pixel_count` pixels exist even if payload remains; a short
/// payload leaves the tail at index 0. A dangling odd byte is ignored.
pub fn rle_decode(payload: &[u8], pixel_count: usize, palette_size: usize) -> Vec<u8> {
    let max_index = palette_size.saturating_sub(1).min(MAX_PALETTE_SIZE - 1) as u8;
    let mut out = Vec::with_capacity(pixel_count);

    for pair in payload.chunks_exact(2) {
        if out.len() >= pixel_count {
            break;
        }
        let run = (pair[0] as usize).min(pixel_count - out.len());
        let index = pair[1].min(max_index);
        out.extend(std::iter::repeat(index).take(run));
    }

    out.resize(pixel_count, 0);
    out
}

fn check_field(field: &'static str, value: usize) -> std::result::Result<u16, ValidationError> {
    u16::try_from(value).map_err(|_| ValidationError::FieldOverflow { field, value })
}

/// Quantize `frames` to one shared palette and serialize them.
///
/// Every frame must match `canvas`. Frame count and both dimensions must fit
/// their 16-bit header fields; nothing is written otherwise.
pub fn encode_animation(frames: &[RgbImage], canvas: Canvas) -> Result<Vec<u8>> {
    let frame_count = check_field("frame count", frames.len())?;
    let width = check_field("canvas width", canvas.width as usize)?;
    let height = check_field("canvas height", canvas.height as usize)?;

    for (index, frame) in frames.iter().enumerate() {
        if frame.dimensions() != (canvas.width, canvas.height) {
            return Err(ValidationError::FrameSizeMismatch {
                index,
                width: frame.width(),
                height: frame.height(),
                canvas_width: canvas.width,
                canvas_height: canvas.height,
            }
            .into());
        }
    }

    // pass 1: one palette for the whole animation
    let palette = Palette::build(frames, MAX_PALETTE_SIZE);
    // pass 2: per-frame index mapping against the frozen palette
    let indexed = palette.mapper(frames).index_frames(frames);

    debug!(
        "Encoding {} frames at {}x{} with {} palette entries",
        frame_count, width, height, palette.len()
    );

    write_container(frame_count, width, height, &palette, &indexed)
}

/// Serialize already-indexed frames. Indices must be below `palette.len()`.
pub fn write_container(
    frame_count: u16,
    width: u16,
    height: u16,
    palette: &Palette,
    indexed_frames: &[Vec<u8>],
) -> Result<Vec<u8>> {
    if palette.is_empty() || palette.len() > MAX_PALETTE_SIZE {
        return Err(ValidationError::FieldOverflow { field: "palette size", value: palette.len() }.into());
    }
    if indexed_frames.len() != frame_count as usize {
        return Err(ValidationError::InvalidTimeline(format!(
            "header declares {} frames but {} were supplied",
            frame_count,
            indexed_frames.len()
        ))
        .into());
    }

    let mut out = Vec::with_capacity(HEADER_LEN + palette.len() * 2);
    out.extend_from_slice(MAGIC);
    out.write_u8(FORMAT_VERSION)?;
    out.write_u16::<LittleEndian>(frame_count)?;
    out.write_u16::<LittleEndian>(width)?;
    out.write_u16::<LittleEndian>(height)?;
    // 256 wraps to 0 by definition of the field
    out.write_u8((palette.len() % 256) as u8)?;
    out.write_u16::<LittleEndian>(0)?;

    for cell in palette.cells() {
        out.write_u16::<LittleEndian>(cell.0)?;
    }

    for indices in indexed_frames {
        debug_assert!(indices.iter().all(|&i| (i as usize) < palette.len()));
        let payload = rle_encode(indices);
        let len = u32::try_from(payload.len())
            .map_err(|_| ValidationError::FieldOverflow { field: "frame payload", value: payload.len() })?;
        out.write_u32::<LittleEndian>(len)?;
        out.extend_from_slice(&payload);
    }

    Ok(out)
}

fn take<'a>(
    bytes: &'a [u8],
    offset: usize,
    needed: usize,
    section: &'static str,
) -> std::result::Result<&'a [u8], FormatError> {
    offset
        .checked_add(needed)
        .and_then(|end| bytes.get(offset..end))
        .ok_or(FormatError::Truncated { section, offset, needed, len: bytes.len() })
}

/// Parse and validate only the fixed header
pub fn inspect_header(bytes: &[u8]) -> std::result::Result<AnimHeader, FormatError> {
    let magic = take(bytes, 0, MAGIC.len(), "magic")?;
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic.to_vec()));
    }

    let header = take(bytes, 0, HEADER_LEN, "header")?;
    let version = header[4];
    if version != FORMAT_VERSION {
        warn!("Reading .anim version {} with a version {} reader", version, FORMAT_VERSION);
    }

    let palette_size = match header[11] {
        0 => MAX_PALETTE_SIZE,
        n => n as usize,
    };

    Ok(AnimHeader {
        version,
        frame_count: LittleEndian::read_u16(&header[5..7]),
        width: LittleEndian::read_u16(&header[7..9]),
        height: LittleEndian::read_u16(&header[9..11]),
        palette_size,
    })
}

/// Reconstruct every frame of an `.anim` buffer.
///
/// Structural damage is an error: bad magic, truncation, or a frame whose runs
/// cover fewer than `width * height` pixels. Out-of-range color indices inside
/// a payload are clamped instead.
pub fn decode_animation(bytes: &[u8]) -> std::result::Result<DecodedAnimation, FormatError> {
    let header = inspect_header(bytes)?;
    let mut offset = HEADER_LEN;

    let palette_bytes = take(bytes, offset, header.palette_size * 2, "palette")?;
    let palette = Palette::from_cells(
        palette_bytes
            .chunks_exact(2)
            .map(|cell| Rgb565(LittleEndian::read_u16(cell)))
            .collect(),
    );
    offset += palette_bytes.len();

    let pixel_count = header.pixel_count();
    let mut frames = Vec::with_capacity(header.frame_count as usize);

    for frame_index in 0..header.frame_count as usize {
        let len = LittleEndian::read_u32(take(bytes, offset, 4, "frame length")?) as usize;
        offset += 4;
        let payload = take(bytes, offset, len, "frame payload")?;
        offset += len;

        // checked before allocating the raster
        let covered: usize = payload.chunks_exact(2).map(|pair| pair[0] as usize).sum();
        if covered < pixel_count {
            return Err(FormatError::ShortPayload { frame: frame_index, covered, pixel_count });
        }

        let indices = rle_decode(payload, pixel_count, palette.len());
        let mut frame = RgbImage::new(header.width as u32, header.height as u32);
        for (pixel, &index) in frame.pixels_mut().zip(indices.iter()) {
            *pixel = palette.color_clamped(index);
        }
        frames.push(frame);
    }

    if offset < bytes.len() {
        debug!("Ignoring {} trailing bytes after last frame", bytes.len() - offset);
    }

    Ok(DecodedAnimation { header, palette, frames })
}
