//! Binary PGM (`P5`) reading and writing.
//!
//! Used for reference backgrounds, image-sequence replay and the image-sequence
//! recorder. 8-bit and 16-bit (big-endian) rasters are read; `f32` images are
//! written clamped to 8 bits.

use crate::types::{ElementType, Image, ImageShape};
use anyhow::{bail, Context};
use std::path::Path;

/// Parse a `P5` raster.
pub fn decode_pgm(bytes: &[u8]) -> anyhow::Result<Image> {
    let mut pos = 0;
    let magic = next_token(bytes, &mut pos).context("empty PGM")?;
    if magic != b"P5" {
        bail!("not a binary PGM (magic {:?})", String::from_utf8_lossy(magic));
    }
    let width = parse_number(bytes, &mut pos, "width")?;
    let height = parse_number(bytes, &mut pos, "height")?;
    let maxval = parse_number(bytes, &mut pos, "maxval")?;
    if width == 0 || height == 0 {
        bail!("PGM has zero size {}x{}", width, height);
    }
    if maxval == 0 || maxval > 65535 {
        bail!("PGM maxval {} out of range", maxval);
    }
    // exactly one whitespace byte separates the header from the raster
    pos += 1;

    let shape = ImageShape::gray(height, width);
    let raster = bytes.get(pos..).unwrap_or_default();
    if maxval < 256 {
        if raster.len() < shape.len() {
            bail!("PGM raster truncated: {} of {} bytes", raster.len(), shape.len());
        }
        Image::from_u8(shape, raster[..shape.len()].to_vec()).context("PGM raster size")
    } else {
        let needed = shape.len() * 2;
        if raster.len() < needed {
            bail!("PGM raster truncated: {} of {} bytes", raster.len(), needed);
        }
        let mut data = Vec::with_capacity(needed);
        for px in raster[..needed].chunks_exact(2) {
            data.extend_from_slice(&u16::from_be_bytes([px[0], px[1]]).to_le_bytes());
        }
        Image::from_bytes(shape, ElementType::U16, data).context("PGM raster size")
    }
}

/// Serialize channel 0 of `image` as a `P5` raster.
pub fn encode_pgm(image: &Image) -> Vec<u8> {
    let (h, w) = (image.height(), image.width());
    let wide = image.element() == ElementType::U16;
    let maxval = if wide { 65535 } else { 255 };
    let mut out = format!("P5\n{} {}\n{}\n", w, h, maxval).into_bytes();
    for row in 0..h {
        for col in 0..w {
            let v = image.at(row, col);
            if wide {
                out.extend_from_slice(&(v as u16).to_be_bytes());
            } else {
                out.push(to_u8(v));
            }
        }
    }
    out
}

pub fn read_pgm(path: &Path) -> anyhow::Result<Image> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {:?}", path))?;
    decode_pgm(&bytes).with_context(|| format!("decoding {:?}", path))
}

pub fn write_pgm(path: &Path, image: &Image) -> anyhow::Result<()> {
    std::fs::write(path, encode_pgm(image)).with_context(|| format!("writing {:?}", path))
}

/// Saturating conversion of a pixel value to 8 bits.
#[inline]
pub fn to_u8(v: f32) -> u8 {
    if v.is_nan() {
        0
    } else {
        v.round().clamp(0.0, 255.0) as u8
    }
}

fn next_token<'a>(bytes: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    loop {
        while *pos < bytes.len() && bytes[*pos].is_ascii_whitespace() {
            *pos += 1;
        }
        if *pos < bytes.len() && bytes[*pos] == b'#' {
            while *pos < bytes.len() && bytes[*pos] != b'\n' {
                *pos += 1;
            }
            continue;
        }
        break;
    }
    let start = *pos;
    while *pos < bytes.len() && !bytes[*pos].is_ascii_whitespace() {
        *pos += 1;
    }
    (*pos > start).then(|| &bytes[start..*pos])
}

fn parse_number(bytes: &[u8], pos: &mut usize, what: &str) -> anyhow::Result<usize> {
    let token = next_token(bytes, pos).with_context(|| format!("PGM header lacks {}", what))?;
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .with_context(|| format!("PGM {} is not a number", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bg.pgm");
        let img = Image::from_u8(ImageShape::gray(2, 3), vec![0, 10, 20, 30, 40, 255]).unwrap();
        write_pgm(&path, &img).unwrap();
        assert_eq!(read_pgm(&path).unwrap(), img);
    }

    #[test]
    fn test_header_comments_and_16_bit() {
        let mut bytes = b"P5\n# written by a camera\n2 1\n# depth\n65535\n".to_vec();
        bytes.extend_from_slice(&[0x01, 0x00, 0xff, 0xff]);
        let img = decode_pgm(&bytes).unwrap();
        assert_eq!(img.element(), ElementType::U16);
        assert_eq!(img.at(0, 0), 256.0);
        assert_eq!(img.at(0, 1), 65535.0);
    }

    #[test]
    fn test_f32_written_clamped() {
        let img = Image::from_f32(ImageShape::gray(1, 3), &[-5.0, 12.4, 300.0]).unwrap();
        let back = decode_pgm(&encode_pgm(&img)).unwrap();
        assert_eq!(back.as_bytes(), &[0, 12, 255]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(decode_pgm(b"P2\n1 1\n255\n0").is_err());
        assert!(decode_pgm(b"P5\n4 4\n255\n\x00\x01").is_err());
        assert!(decode_pgm(b"").is_err());
    }
}
