use crate::error::RecognitionError;
use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PixelFormat {
    Gray8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Gray8 => 1,
            PixelFormat::Rgb8 => 3,
            PixelFormat::Rgba8 => 4,
        }
    }
}

/// Raw page bitmap handed over by the renderer.
#[derive(Clone)]
pub struct Bitmap {
    width: u32,
    height: u32,
    format: PixelFormat,
    data: Vec<u8>,
    dpi: Option<u32>,
}

impl Bitmap {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
            dpi: None,
        }
    }

    pub fn with_dpi(mut self, dpi: u32) -> Self {
        self.dpi = Some(dpi);
        self
    }

    pub fn from_image(img: DynamicImage) -> Self {
        let (width, height) = (img.width(), img.height());
        match img {
            DynamicImage::ImageLuma8(buf) => Self::new(width, height, PixelFormat::Gray8, buf.into_raw()),
            DynamicImage::ImageRgb8(buf) => Self::new(width, height, PixelFormat::Rgb8, buf.into_raw()),
            other => Self::new(width, height, PixelFormat::Rgba8, other.to_rgba8().into_raw()),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn dpi(&self) -> Option<u32> {
        self.dpi
    }

    pub fn pixel_count(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn validate(&self) -> Result<(), RecognitionError> {
        if self.data.is_empty() {
            return Err(RecognitionError::invalid_input("bitmap has no pixel data"));
        }
        if self.width == 0 || self.height == 0 {
            return Err(RecognitionError::invalid_input(format!(
                "bitmap has zero dimension ({}x{})",
                self.width, self.height
            )));
        }
        let expected = (self.pixel_count() as u128) * self.format.bytes_per_pixel() as u128;
        if expected != self.data.len() as u128 {
            return Err(RecognitionError::invalid_input(format!(
                "{:?} bitmap {}x{} needs {} bytes, got {}",
                self.format,
                self.width,
                self.height,
                expected,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Luma copy of the bitmap. The receiver keeps its own buffer.
    pub fn to_gray(&self) -> Result<GrayImage, RecognitionError> {
        self.validate()?;
        let malformed = || RecognitionError::invalid_input("pixel buffer does not match dimensions");
        let gray = match self.format {
            PixelFormat::Gray8 => GrayImage::from_raw(self.width, self.height, self.data.clone())
                .ok_or_else(malformed)?,
            PixelFormat::Rgb8 => {
                let buf = image::RgbImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(malformed)?;
                DynamicImage::ImageRgb8(buf).to_luma8()
            }
            PixelFormat::Rgba8 => {
                let buf = image::RgbaImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or_else(malformed)?;
                DynamicImage::ImageRgba8(buf).to_luma8()
            }
        };
        Ok(gray)
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("bytes", &self.data.len())
            .field("dpi", &self.dpi)
            .finish()
    }
}
