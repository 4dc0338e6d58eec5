//! Decoder contract and the default `image`-crate implementation.
//!
//! A decoder turns one path (plus decode parameters from the metadata loader)
//! into one RGBA bitmap or one error. It is called from decoder pool threads
//! and must not touch cache state.
//!
//! # Orientation
//!
//! EXIF orientation (1-8) is applied first, then the user rotation in degrees.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use image::{DynamicImage, RgbaImage};
use log::trace;

use super::item::{BYTES_PER_MB, DecodeParams};

/// Decoded full-resolution image
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbaImage,
    icc: Option<Arc<[u8]>>,
}

impl DecodedImage {
    pub fn new(pixels: RgbaImage, icc: Option<Arc<[u8]>>) -> Self {
        Self { pixels, icc }
    }

    /// Transparent image of the given size
    pub fn blank(width: u32, height: u32) -> Self {
        Self::new(RgbaImage::new(width, height), None)
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Color profile carried along for display-side color management
    pub fn icc(&self) -> Option<&[u8]> {
        self.icc.as_deref()
    }

    pub fn mem(&self) -> usize {
        self.pixels.as_raw().len()
    }

    pub fn size_mb(&self) -> f64 {
        self.mem() as f64 / BYTES_PER_MB
    }
}

/// Decode errors
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    Io(String),
    Image(String),
    EmbeddedRange { offset: u64, length: u64, file_len: u64 },
    Cancelled,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Io(e) => write!(f, "IO error: {}", e),
            DecodeError::Image(e) => write!(f, "Image error: {}", e),
            DecodeError::EmbeddedRange { offset, length, file_len } => write!(
                f,
                "Embedded image {}+{} exceeds file length {}",
                offset, length, file_len
            ),
            DecodeError::Cancelled => write!(f, "Decode cancelled"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}

impl From<image::ImageError> for DecodeError {
    fn from(e: image::ImageError) -> Self {
        DecodeError::Image(e.to_string())
    }
}

/// External decode call used by the decoder pool.
pub trait ImageDecoder: Send + Sync {
    fn decode(&self, path: &Path, params: &DecodeParams) -> Result<DecodedImage, DecodeError>;
}

/// Closures work as decoders (handy for tests and embedding).
impl<F> ImageDecoder for F
where
    F: Fn(&Path, &DecodeParams) -> Result<DecodedImage, DecodeError> + Send + Sync,
{
    fn decode(&self, path: &Path, params: &DecodeParams) -> Result<DecodedImage, DecodeError> {
        self(path, params)
    }
}

/// Default decoder backed by the `image` crate
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageCrateDecoder;

impl ImageDecoder for ImageCrateDecoder {
    fn decode(&self, path: &Path, params: &DecodeParams) -> Result<DecodedImage, DecodeError> {
        let img = match (params.offset, params.length) {
            (Some(offset), Some(length)) if length > 0 => {
                let buf = read_embedded(path, offset, length)?;
                image::load_from_memory(&buf)?
            }
            _ => image::open(path)?,
        };

        let img = apply_orientation(img, params.orientation);
        let img = apply_rotation(img, params.rotation);
        trace!("Decoded {} ({}x{})", path.display(), img.width(), img.height());

        Ok(DecodedImage::new(img.to_rgba8(), params.icc.clone()))
    }
}

/// Read an embedded image (e.g. the full-size JPEG inside a RAW file).
fn read_embedded(path: &Path, offset: u64, length: u64) -> Result<Vec<u8>, DecodeError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let in_bounds = offset.checked_add(length).is_some_and(|end| end <= file_len);
    if !in_bounds {
        return Err(DecodeError::EmbeddedRange { offset, length, file_len });
    }

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; length as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Apply an EXIF orientation tag
fn apply_orientation(img: DynamicImage, orientation: u16) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

/// Apply a clockwise rotation in degrees (multiples of 90)
fn apply_rotation(img: DynamicImage, degrees: u16) -> DynamicImage {
    match degrees % 360 {
        90 => img.rotate90(),
        180 => img.rotate180(),
        270 => img.rotate270(),
        _ => img,
    }
}
