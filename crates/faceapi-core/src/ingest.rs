//! Image ingestion: raw upload bytes → dense RGB pixel array.
//!
//! Decoding is pure and deterministic. Any failure rejects the payload; no
//! partial or placeholder image is ever produced.

use image::{DynamicImage, ImageDecoder, ImageFormat, ImageReader, RgbImage};
use std::io::Cursor;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InvalidImageError {
    #[error("uploaded file is empty")]
    Empty,
    #[error("file is not a valid image: unrecognized format")]
    UnknownFormat,
    #[error("file is not a valid image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("file is not a valid image: zero width or height")]
    ZeroSized,
}

/// A decoded colour image (height × width × 3, RGB, 8-bit).
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    /// Wrap an already-decoded RGB buffer.
    pub fn from_rgb(pixels: RgbImage) -> Result<Self, InvalidImageError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(InvalidImageError::ZeroSized);
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// (height, width, channels)
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.pixels.height() as usize, self.pixels.width() as usize, 3)
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.pixels
    }
}

/// Decode an uploaded buffer into an RGB image.
///
/// The format is sniffed from the leading bytes. When sniffing fails, the
/// declared content type is used as a hint (needed for formats without a
/// magic number, such as TGA). EXIF orientation is applied and any alpha or
/// grayscale input is converted to three colour channels.
pub fn decode(bytes: &[u8], content_type: Option<&str>) -> Result<DecodedImage, InvalidImageError> {
    if bytes.is_empty() {
        return Err(InvalidImageError::Empty);
    }

    let format = match image::guess_format(bytes) {
        Ok(format) => format,
        Err(_) => content_type
            .and_then(ImageFormat::from_mime_type)
            .ok_or(InvalidImageError::UnknownFormat)?,
    };

    let reader = ImageReader::with_format(Cursor::new(bytes), format);
    let mut decoder = reader.into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut image = DynamicImage::from_decoder(decoder)?;
    image.apply_orientation(orientation);

    let decoded = DecodedImage::from_rgb(image.into_rgb8())?;
    tracing::debug!(
        ?format,
        content_type,
        width = decoded.width(),
        height = decoded.height(),
        "image decoded"
    );
    Ok(decoded)
}
