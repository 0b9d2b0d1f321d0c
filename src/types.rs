//! Core record types carried by the processing DAG
//!
//! # Main Types
//!
//! - [`Image`] - dense 2-D/3-D pixel array with a fixed element type
//! - [`Frame`] - camera frame: `index`, capture `timestamp_ns`, image
//! - [`Crop`] - per-animal cropped frame with its origin in the full frame
//! - [`TrackingRecord`] - tracker output for one animal in one frame
//! - [`Sample`] - scalar record, used for counters and lightweight sources
//!
//! The shape and element type of every record travelling on a ring-buffer queue
//! are fixed when the queue is created (see [`crate::queue::Schema`]).

use serde::{Deserialize, Serialize};

/// Element type of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    /// 8-bit unsigned (camera native)
    #[default]
    U8,
    /// 16-bit unsigned (high bit-depth cameras)
    U16,
    /// 32-bit float (background-subtracted frames)
    F32,
}

impl ElementType {
    /// Size in bytes of one element.
    pub fn size_bytes(&self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 => 4,
        }
    }

    pub(crate) fn tag(&self) -> u8 {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::F32 => 3,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ElementType::U8),
            2 => Some(ElementType::U16),
            3 => Some(ElementType::F32),
            _ => None,
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ElementType::U8 => write!(f, "u8"),
            ElementType::U16 => write!(f, "u16"),
            ElementType::F32 => write!(f, "f32"),
        }
    }
}

/// Height / width / channel count of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageShape {
    pub height: usize,
    pub width: usize,
    pub channels: usize,
}

impl ImageShape {
    pub const fn gray(height: usize, width: usize) -> Self {
        Self {
            height,
            width,
            channels: 1,
        }
    }

    /// Number of elements (not bytes).
    pub fn len(&self) -> usize {
        self.height * self.width * self.channels
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Dense image stored row-major, channels interleaved, little-endian elements.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    shape: ImageShape,
    element: ElementType,
    data: Vec<u8>,
}

impl Image {
    /// Zero-filled image.
    pub fn zeros(shape: ImageShape, element: ElementType) -> Self {
        Self {
            shape,
            element,
            data: vec![0; shape.len() * element.size_bytes()],
        }
    }

    /// Wrap raw little-endian bytes. Returns `None` if the length does not match the shape.
    pub fn from_bytes(shape: ImageShape, element: ElementType, data: Vec<u8>) -> Option<Self> {
        if data.len() != shape.len() * element.size_bytes() {
            return None;
        }
        Some(Self {
            shape,
            element,
            data,
        })
    }

    /// 8-bit grayscale image from pixels.
    pub fn from_u8(shape: ImageShape, pixels: Vec<u8>) -> Option<Self> {
        Self::from_bytes(shape, ElementType::U8, pixels)
    }

    /// Single-precision image from values.
    pub fn from_f32(shape: ImageShape, values: &[f32]) -> Option<Self> {
        if values.len() != shape.len() {
            return None;
        }
        let mut data = Vec::with_capacity(values.len() * 4);
        for v in values {
            data.extend_from_slice(&v.to_le_bytes());
        }
        Some(Self {
            shape,
            element: ElementType::F32,
            data,
        })
    }

    pub fn shape(&self) -> ImageShape {
        self.shape
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn height(&self) -> usize {
        self.shape.height
    }

    pub fn width(&self) -> usize {
        self.shape.width
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Element at flat position `i`, widened to `f32`.
    #[inline]
    pub fn value(&self, i: usize) -> f32 {
        match self.element {
            ElementType::U8 => self.data[i] as f32,
            ElementType::U16 => u16::from_le_bytes([self.data[2 * i], self.data[2 * i + 1]]) as f32,
            ElementType::F32 => f32::from_le_bytes([
                self.data[4 * i],
                self.data[4 * i + 1],
                self.data[4 * i + 2],
                self.data[4 * i + 3],
            ]),
        }
    }

    /// Element at (row, col) of channel 0, widened to `f32`.
    #[inline]
    pub fn at(&self, row: usize, col: usize) -> f32 {
        self.value((row * self.shape.width + col) * self.shape.channels)
    }

    /// All elements widened to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        (0..self.shape.len()).map(|i| self.value(i)).collect()
    }

    /// Copy out the rectangle starting at `origin = (row, col)` with `size = (height, width)`.
    ///
    /// The rectangle is clipped to the image; clipped areas are zero.
    pub fn crop(&self, origin: (usize, usize), size: (usize, usize)) -> Image {
        let shape = ImageShape {
            height: size.0,
            width: size.1,
            channels: self.shape.channels,
        };
        let mut out = Image::zeros(shape, self.element);
        let px = self.shape.channels * self.element.size_bytes();
        let rows = size.0.min(self.shape.height.saturating_sub(origin.0));
        let cols = size.1.min(self.shape.width.saturating_sub(origin.1));
        for r in 0..rows {
            let src = ((origin.0 + r) * self.shape.width + origin.1) * px;
            let dst = r * size.1 * px;
            out.data[dst..dst + cols * px].copy_from_slice(&self.data[src..src + cols * px]);
        }
        out
    }
}

/// Camera frame: the primary payload on camera-adjacent queues.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Monotonically increasing, assigned at the source.
    pub index: i64,
    /// Capture time in nanoseconds.
    pub timestamp_ns: i64,
    pub image: Image,
}

/// Cropped region of a frame belonging to one animal / ROI.
#[derive(Debug, Clone, PartialEq)]
pub struct Crop {
    pub index: i64,
    pub timestamp_ns: i64,
    pub identity: i32,
    /// Top-left (x, y) of the crop in the full frame.
    pub origin: [i32; 2],
    /// (height, width) of the crop.
    pub shape: [i32; 2],
    pub image: Image,
}

/// Eye position and orientation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EyeTracking {
    pub position: [f32; 2],
    pub angle: f32,
}

/// Tracked body, eyes and tail of one animal, in global (full frame) coordinates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Tracking {
    pub centroid: [f32; 2],
    /// First principal axis (unit vector, heading).
    pub pc1: [f32; 2],
    /// Second principal axis, orthogonal to `pc1`.
    pub pc2: [f32; 2],
    /// Left / right eye, present when the tracker runs eye tracking.
    pub eyes: Option<[EyeTracking; 2]>,
    /// Tail skeleton points; length fixed by the queue schema.
    pub tail: Vec<[f32; 2]>,
}

/// Tracker output for one animal in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingRecord {
    pub index: i64,
    pub timestamp_ns: i64,
    pub identity: i32,
    pub origin: [i32; 2],
    pub shape: [i32; 2],
    pub tracking: Tracking,
}

/// Scalar record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub index: i64,
    pub timestamp_ns: i64,
    pub value: f64,
}

/// Nanoseconds since the Unix epoch, used as the capture clock for records.
pub fn now_ns() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
