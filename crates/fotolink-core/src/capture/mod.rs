//! Image capture
//!
//! A [`CaptureSource`] produces one encoded [`ImageBuffer`] per call, without
//! retrying internally. Two sources exist: [`Camera`], which drives a local
//! sensor behind [`ImageSensor`], and [`UartCameraLink`], which requests a
//! frame from a companion camera computer over a serial line.

pub mod camera;
pub mod uart_link;

use alloc::vec::Vec;
use core::future::Future;

use heapless::String;
use log::warn;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::hardware::HardwareError;

pub use camera::{Camera, Exposure, ImageSensor};
pub use uart_link::UartCameraLink;

pub const MIN_WIDTH: u16 = 320;
pub const MAX_WIDTH: u16 = 4096;
pub const MIN_QUALITY: u8 = 1;
pub const MAX_QUALITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    Jpeg,
    Png,
    Raw,
}

impl Encoding {
    pub const fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Raw => "application/octet-stream",
        }
    }
}

/// Requested frame width and quality (1 = smallest file, 10 = best).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureSettings {
    width: u16,
    quality: u8,
}

impl CaptureSettings {
    /// Settings clamped to the supported range.
    pub fn new(width: u16, quality: u8) -> Self {
        let clamped = Self {
            width: width.clamp(MIN_WIDTH, MAX_WIDTH),
            quality: quality.clamp(MIN_QUALITY, MAX_QUALITY),
        };
        if clamped.width != width {
            warn!("width adjusted from {width} to {}", clamped.width);
        }
        if clamped.quality != quality {
            warn!("quality adjusted from {quality} to {}", clamped.quality);
        }
        clamped
    }

    pub const fn width(&self) -> u16 {
        self.width
    }

    pub const fn quality(&self) -> u8 {
        self.quality
    }

    /// Quality as an encoder percentage.
    pub const fn jpeg_quality(&self) -> u8 {
        self.quality * 10
    }
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: 1024,
            quality: 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u16,
    /// Zero when the source did not report it.
    pub height: u16,
    pub quality: u8,
}

/// Descriptive record of a captured image, for telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub captured_at_ms: u64,
    pub width: u16,
    pub height: u16,
    pub quality: u8,
    pub size: u32,
    pub encoding: Encoding,
}

/// Longest label a frame can carry.
pub const LABEL_CAPACITY: usize = 32;

/// One encoded frame, exclusively owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageBuffer {
    data: Vec<u8>,
    encoding: Encoding,
    captured_at_ms: u64,
    info: FrameInfo,
    label: Option<String<LABEL_CAPACITY>>,
}

impl ImageBuffer {
    pub fn new(data: Vec<u8>, encoding: Encoding, captured_at_ms: u64, info: FrameInfo) -> Self {
        Self {
            data,
            encoding,
            captured_at_ms,
            info,
            label: None,
        }
    }

    /// Attach the source's own name for the frame (e.g. its timestamp).
    pub fn with_label(mut self, label: String<LABEL_CAPACITY>) -> Self {
        self.label = Some(label);
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    pub fn content_type(&self) -> &'static str {
        self.encoding.content_type()
    }

    pub fn captured_at_ms(&self) -> u64 {
        self.captured_at_ms
    }

    pub fn info(&self) -> FrameInfo {
        self.info
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn metadata(&self) -> ImageMetadata {
        ImageMetadata {
            captured_at_ms: self.captured_at_ms,
            width: self.info.width,
            height: self.info.height,
            quality: self.info.quality,
            size: u32::try_from(self.data.len()).unwrap_or(u32::MAX),
            encoding: self.encoding,
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureError {
    #[error("sensor failure: {0}")]
    Sensor(&'static str),
    #[error("cannot allocate {requested} bytes for the frame")]
    OutOfMemory { requested: usize },
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("sensor produced an empty frame")]
    EmptyFrame,
    #[error("camera link failure: {0}")]
    Link(&'static str),
    #[error("capture timed out")]
    Timeout,
    #[error("camera power control: {0}")]
    PowerControl(HardwareError),
}

impl From<HardwareError> for CaptureError {
    fn from(err: HardwareError) -> Self {
        Self::PowerControl(err)
    }
}

/// Anything that can produce one encoded frame on demand.
pub trait CaptureSource {
    fn capture(&mut self) -> impl Future<Output = Result<ImageBuffer, CaptureError>>;
}

/// Allocate a zeroed frame buffer without aborting on exhaustion.
pub(crate) fn allocate_frame(size: usize) -> Result<Vec<u8>, CaptureError> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).map_err(|_| {
        warn!("frame allocation of {size} bytes failed");
        CaptureError::OutOfMemory { requested: size }
    })?;
    data.resize(size, 0);
    Ok(data)
}

/// Width and height from the first start-of-frame marker of a JPEG stream.
pub fn jpeg_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if data.get(..2)? != [0xFF, 0xD8] {
        return None;
    }

    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xFF {
            return None;
        }
        let marker = data[pos + 1];
        let len = usize::from(u16::from_be_bytes([data[pos + 2], data[pos + 3]]));

        // SOF0..SOF15 except DHT (C4), JPG (C8) and DAC (CC)
        if (0xC0..=0xCF).contains(&marker) && !matches!(marker, 0xC4 | 0xC8 | 0xCC) {
            let sof = data.get(pos + 5..pos + 9)?;
            let height = u16::from_be_bytes([sof[0], sof[1]]);
            let width = u16::from_be_bytes([sof[2], sof[3]]);
            return Some((width, height));
        }

        pos += 2 + len;
    }
    None
}
