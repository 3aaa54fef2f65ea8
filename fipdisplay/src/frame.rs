use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};

use crate::error::{FipError, Result};

pub const FRAME_WIDTH: u32 = 320;
pub const FRAME_HEIGHT: u32 = 240;
const BYTES_PER_PIXEL: usize = 3;

// 320 * 240 * 3 = 0x38400
pub const FRAME_SIZE: usize = FRAME_WIDTH as usize * FRAME_HEIGHT as usize * BYTES_PER_PIXEL;

/// Byte layout of a frame as it is handed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PixelOrder {
    /// Top-down rows of R, G, B.
    Rgb,
    /// The whole RGB buffer byte-reversed: bottom-up, right-to-left, B, G, R.
    #[default]
    Reversed,
}

impl FromStr for PixelOrder {
    type Err = FipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rgb" => Ok(PixelOrder::Rgb),
            "reversed" | "bgr" => Ok(PixelOrder::Reversed),
            other => Err(FipError::InvalidArgument(format!(
                "unknown pixel order {other:?}, expected `rgb` or `reversed`"
            ))),
        }
    }
}

impl fmt::Display for PixelOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PixelOrder::Rgb => f.write_str("rgb"),
            PixelOrder::Reversed => f.write_str("reversed"),
        }
    }
}

/// One full-screen image in device byte order. Always `FRAME_SIZE` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
}

impl Frame {
    /// Wraps a buffer that is already in device order.
    pub fn from_device_bytes(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        if data.len() != FRAME_SIZE {
            return Err(FipError::InvalidFrame {
                len: data.len(),
                expected: FRAME_SIZE,
            });
        }
        Ok(Self { data })
    }

    pub fn from_rgb(image: &RgbImage, order: PixelOrder) -> Result<Self> {
        if image.dimensions() != (FRAME_WIDTH, FRAME_HEIGHT) {
            return Err(FipError::InvalidFrame {
                len: image.as_raw().len(),
                expected: FRAME_SIZE,
            });
        }
        Self::from_device_bytes(reorder(image.as_raw(), order))
    }

    /// Resizes (when needed) and converts any decoded image.
    pub fn from_image(image: &DynamicImage, order: PixelOrder, filter: FilterType) -> Result<Self> {
        let rgb = if image.width() == FRAME_WIDTH && image.height() == FRAME_HEIGHT {
            image.to_rgb8()
        } else {
            image
                .resize_exact(FRAME_WIDTH, FRAME_HEIGHT, filter)
                .to_rgb8()
        };
        Self::from_rgb(&rgb, order)
    }

    pub fn solid(r: u8, g: u8, b: u8, order: PixelOrder) -> Self {
        let rgb = RgbImage::from_pixel(FRAME_WIDTH, FRAME_HEIGHT, image::Rgb([r, g, b]));
        Self {
            data: reorder(rgb.as_raw(), order).freeze(),
        }
    }

    /// Decodes the frame back into a top-down RGB image.
    pub fn to_rgb8(&self, order: PixelOrder) -> RgbImage {
        let raw = reorder(&self.data, order).to_vec();
        // the length is checked on construction
        RgbImage::from_raw(FRAME_WIDTH, FRAME_HEIGHT, raw)
            .unwrap_or_else(|| RgbImage::new(FRAME_WIDTH, FRAME_HEIGHT))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame").field("len", &self.data.len()).finish()
    }
}

// Reversal is its own inverse, so the same routine encodes and decodes.
fn reorder(data: &[u8], order: PixelOrder) -> BytesMut {
    match order {
        PixelOrder::Rgb => BytesMut::from(data),
        PixelOrder::Reversed => data.iter().rev().copied().collect(),
    }
}
