// Byte → image decoding and post-decode processing hooks.

pub mod format;

use std::fmt;
use std::sync::Arc;

use image::DynamicImage;
use tracing::debug;

use self::format::detect_format;
use crate::error::ImageError;

/// A decoded bitmap plus the display scale it was decoded for.
///
/// Cloning shares the pixel buffer.
#[derive(Clone)]
pub struct DecodedImage {
    image: Arc<DynamicImage>,
    scale: f32,
}

impl DecodedImage {
    pub fn new(image: DynamicImage, scale: f32) -> Self {
        Self {
            image: Arc::new(image),
            scale: normalize_scale(scale),
        }
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    /// Width and height in pixels.
    pub fn pixel_size(&self) -> (u32, u32) {
        (self.image.width(), self.image.height())
    }

    /// Width and height in points (pixels divided by scale).
    pub fn size(&self) -> (f32, f32) {
        let (w, h) = self.pixel_size();
        (w as f32 / self.scale, h as f32 / self.scale)
    }
}

impl fmt::Debug for DecodedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.pixel_size();
        f.debug_struct("DecodedImage")
            .field("width", &w)
            .field("height", &h)
            .field("scale", &self.scale)
            .finish()
    }
}

fn normalize_scale(scale: f32) -> f32 {
    if scale.is_finite() && scale > 0.0 {
        scale
    } else {
        1.0
    }
}

/// Turns raw bytes into an image. Must be pure: the same bytes are decoded
/// once per waiting caller, each with its own scale.
pub trait Decoder: Send + Sync {
    fn decode(&self, bytes: &[u8], scale: f32) -> Result<DecodedImage, ImageError>;
}

/// Default decoder backed by the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageCrateDecoder;

impl Decoder for ImageCrateDecoder {
    fn decode(&self, bytes: &[u8], scale: f32) -> Result<DecodedImage, ImageError> {
        let format = detect_format(bytes);
        if !format.is_known() {
            debug!("decode rejected: unrecognized header ({} bytes)", bytes.len());
            return Err(ImageError::Decoding);
        }
        let image = image::load_from_memory(bytes).map_err(|e| {
            debug!("decode failed format={:?}: {}", format, e);
            ImageError::Decoding
        })?;
        Ok(DecodedImage::new(image, scale))
    }
}

/// Post-decode transform applied to a caller's copy of an image.
/// The cached bytes are never affected.
pub trait ImageProcessor: Send + Sync {
    fn process(&self, image: DecodedImage) -> DecodedImage;
}

impl<F> ImageProcessor for F
where
    F: Fn(DecodedImage) -> DecodedImage + Send + Sync,
{
    fn process(&self, image: DecodedImage) -> DecodedImage {
        self(image)
    }
}
