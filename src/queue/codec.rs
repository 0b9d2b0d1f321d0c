//! Fixed-layout record codec for ring-buffer slots.
//!
//! Every ring buffer is created with a [`Schema`]; every slot of that buffer
//! holds exactly [`Schema::item_size`] bytes. Encoding is little-endian and
//! bitwise reversible, so a record read back from a slot is identical to the
//! one written (NaN payloads included).
//!
//! Slot layouts (all integers little-endian):
//!
//! | schema   | layout |
//! |----------|--------|
//! | frame    | `index i64, timestamp i64, pixels` |
//! | crop     | `index i64, timestamp i64, identity i32, origin 2×i32, shape 2×i32, pixels` |
//! | tracking | `index, timestamp, identity, origin, shape, centroid 2×f32, pc1 2×f32, pc2 2×f32, [eyes 2×(x,y,angle) f32], tail N×(x,y) f32` |
//! | sample   | `index i64, timestamp i64, value f64` |

use crate::pipeline::Packet;
use crate::types::{
    Crop, ElementType, EyeTracking, Frame, Image, ImageShape, Sample, Tracking, TrackingRecord,
};
use serde::{Deserialize, Serialize};
use std::fmt;

const STAMP_BYTES: usize = 16;
const PLACEMENT_BYTES: usize = 4 + 8 + 8;

/// Payload schema of a data queue, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schema {
    Frame {
        shape: ImageShape,
        element: ElementType,
    },
    Crop {
        shape: ImageShape,
        element: ElementType,
    },
    Tracking {
        eyes: bool,
        tail_points: usize,
    },
    Sample,
}

impl Schema {
    pub fn frame(height: usize, width: usize, element: ElementType) -> Self {
        Schema::Frame {
            shape: ImageShape::gray(height, width),
            element,
        }
    }

    pub fn crop(height: usize, width: usize, element: ElementType) -> Self {
        Schema::Crop {
            shape: ImageShape::gray(height, width),
            element,
        }
    }

    pub fn tracking(eyes: bool, tail_points: usize) -> Self {
        Schema::Tracking { eyes, tail_points }
    }

    /// Schema a packet would need to be written to a queue.
    pub fn of(packet: &Packet) -> Self {
        match packet {
            Packet::Frame(f) => Schema::Frame {
                shape: f.image.shape(),
                element: f.image.element(),
            },
            Packet::Crop(c) => Schema::Crop {
                shape: c.image.shape(),
                element: c.image.element(),
            },
            Packet::Tracking(t) => Schema::Tracking {
                eyes: t.tracking.eyes.is_some(),
                tail_points: t.tracking.tail.len(),
            },
            Packet::Sample(_) => Schema::Sample,
        }
    }

    pub fn accepts(&self, packet: &Packet) -> bool {
        Schema::of(packet) == *self
    }

    /// Slot size in bytes.
    pub fn item_size(&self) -> usize {
        match self {
            Schema::Frame { shape, element } => STAMP_BYTES + shape.len() * element.size_bytes(),
            Schema::Crop { shape, element } => {
                STAMP_BYTES + PLACEMENT_BYTES + shape.len() * element.size_bytes()
            }
            Schema::Tracking { eyes, tail_points } => {
                let eyes = if *eyes { 2 * 3 * 4 } else { 0 };
                STAMP_BYTES + PLACEMENT_BYTES + 6 * 4 + eyes + tail_points * 8
            }
            Schema::Sample => STAMP_BYTES + 8,
        }
    }

    /// Stable 64-bit identifier stored in ring headers and checked on attach.
    pub fn fingerprint(&self) -> u64 {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in self.to_string().bytes() {
            hash ^= b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    /// Serialize `packet` into `out`, which must be exactly `item_size()` bytes.
    pub fn encode(&self, packet: &Packet, out: &mut [u8]) -> Result<(), String> {
        if !self.accepts(packet) {
            return Err(format!(
                "{} record does not match schema {}",
                Schema::of(packet),
                self
            ));
        }
        if out.len() != self.item_size() {
            return Err(format!(
                "slot is {} bytes, schema {} needs {}",
                out.len(),
                self,
                self.item_size()
            ));
        }

        let mut w = SlotWriter { buf: out, pos: 0 };
        w.i64(packet.index());
        w.i64(packet.timestamp_ns());
        match packet {
            Packet::Frame(f) => w.bytes(f.image.as_bytes()),
            Packet::Crop(c) => {
                w.i32(c.identity);
                w.i32s(&c.origin);
                w.i32s(&c.shape);
                w.bytes(c.image.as_bytes());
            }
            Packet::Tracking(t) => {
                w.i32(t.identity);
                w.i32s(&t.origin);
                w.i32s(&t.shape);
                w.f32s(&t.tracking.centroid);
                w.f32s(&t.tracking.pc1);
                w.f32s(&t.tracking.pc2);
                if let Some(eyes) = &t.tracking.eyes {
                    for eye in eyes {
                        w.f32s(&eye.position);
                        w.f32(eye.angle);
                    }
                }
                for point in &t.tracking.tail {
                    w.f32s(point);
                }
            }
            Packet::Sample(s) => w.f64(s.value),
        }
        Ok(())
    }

    /// Deserialize one slot into a freshly allocated record.
    pub fn decode(&self, bytes: &[u8]) -> Result<Packet, String> {
        if bytes.len() != self.item_size() {
            return Err(format!(
                "slot is {} bytes, schema {} needs {}",
                bytes.len(),
                self,
                self.item_size()
            ));
        }

        let mut r = SlotReader { buf: bytes, pos: 0 };
        let index = r.i64()?;
        let timestamp_ns = r.i64()?;
        let packet = match self {
            Schema::Frame { shape, element } => {
                let data = r.take(shape.len() * element.size_bytes())?.to_vec();
                let image = Image::from_bytes(*shape, *element, data)
                    .ok_or_else(|| "frame payload length mismatch".to_string())?;
                Packet::Frame(Frame {
                    index,
                    timestamp_ns,
                    image,
                })
            }
            Schema::Crop { shape, element } => {
                let identity = r.i32()?;
                let origin = [r.i32()?, r.i32()?];
                let crop_shape = [r.i32()?, r.i32()?];
                let data = r.take(shape.len() * element.size_bytes())?.to_vec();
                let image = Image::from_bytes(*shape, *element, data)
                    .ok_or_else(|| "crop payload length mismatch".to_string())?;
                Packet::Crop(Crop {
                    index,
                    timestamp_ns,
                    identity,
                    origin,
                    shape: crop_shape,
                    image,
                })
            }
            Schema::Tracking { eyes, tail_points } => {
                let identity = r.i32()?;
                let origin = [r.i32()?, r.i32()?];
                let shape = [r.i32()?, r.i32()?];
                let centroid = [r.f32()?, r.f32()?];
                let pc1 = [r.f32()?, r.f32()?];
                let pc2 = [r.f32()?, r.f32()?];
                let eyes = if *eyes {
                    let mut read_eye = || -> Result<EyeTracking, String> {
                        Ok(EyeTracking {
                            position: [r.f32()?, r.f32()?],
                            angle: r.f32()?,
                        })
                    };
                    let left = read_eye()?;
                    let right = read_eye()?;
                    Some([left, right])
                } else {
                    None
                };
                let mut tail = Vec::with_capacity(*tail_points);
                for _ in 0..*tail_points {
                    tail.push([r.f32()?, r.f32()?]);
                }
                Packet::Tracking(TrackingRecord {
                    index,
                    timestamp_ns,
                    identity,
                    origin,
                    shape,
                    tracking: Tracking {
                        centroid,
                        pc1,
                        pc2,
                        eyes,
                        tail,
                    },
                })
            }
            Schema::Sample => Packet::Sample(Sample {
                index,
                timestamp_ns,
                value: r.f64()?,
            }),
        };
        Ok(packet)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schema::Frame { shape, element } => write!(
                f,
                "frame[{}x{}x{} {}]",
                shape.height, shape.width, shape.channels, element
            ),
            Schema::Crop { shape, element } => write!(
                f,
                "crop[{}x{}x{} {}]",
                shape.height, shape.width, shape.channels, element
            ),
            Schema::Tracking { eyes, tail_points } => write!(
                f,
                "tracking[eyes={} tail={}]",
                eyes, tail_points
            ),
            Schema::Sample => write!(f, "sample"),
        }
    }
}

struct SlotWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl SlotWriter<'_> {
    #[inline]
    fn bytes(&mut self, b: &[u8]) {
        self.buf[self.pos..self.pos + b.len()].copy_from_slice(b);
        self.pos += b.len();
    }

    fn i64(&mut self, v: i64) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    fn f32(&mut self, v: f32) {
        self.bytes(&v.to_le_bytes());
    }

    fn f64(&mut self, v: f64) {
        self.bytes(&v.to_le_bytes());
    }

    fn i32s(&mut self, v: &[i32; 2]) {
        self.i32(v[0]);
        self.i32(v[1]);
    }

    fn f32s(&mut self, v: &[f32; 2]) {
        self.f32(v[0]);
        self.f32(v[1]);
    }
}

struct SlotReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SlotReader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], String> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(format!("slot truncated at byte {}", self.pos));
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], String> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn i64(&mut self) -> Result<i64, String> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn i32(&mut self) -> Result<i32, String> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32, String> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    fn f64(&mut self) -> Result<f64, String> {
        Ok(f64::from_le_bytes(self.array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tracking_record(eyes: bool, tail: usize) -> TrackingRecord {
        TrackingRecord {
            index: 42,
            timestamp_ns: 1_000_000,
            identity: 3,
            origin: [10, 20],
            shape: [64, 48],
            tracking: Tracking {
                centroid: [12.5, 30.25],
                pc1: [1.0, 0.0],
                pc2: [0.0, 1.0],
                eyes: eyes.then(|| {
                    [
                        EyeTracking {
                            position: [1.0, 2.0],
                            angle: 0.5,
                        },
                        EyeTracking {
                            position: [3.0, 4.0],
                            angle: -0.5,
                        },
                    ]
                }),
                tail: (0..tail).map(|i| [i as f32, 2.0 * i as f32]).collect(),
            },
        }
    }

    #[test]
    fn test_item_sizes() {
        assert_eq!(Schema::frame(4, 5, ElementType::U8).item_size(), 16 + 20);
        assert_eq!(Schema::frame(4, 5, ElementType::F32).item_size(), 16 + 80);
        assert_eq!(Schema::crop(2, 2, ElementType::U16).item_size(), 36 + 8);
        assert_eq!(Schema::tracking(false, 0).item_size(), 60);
        assert_eq!(Schema::tracking(true, 3).item_size(), 60 + 24 + 24);
        assert_eq!(Schema::Sample.item_size(), 24);
    }

    #[test]
    fn test_frame_round_trip() {
        let schema = Schema::frame(3, 4, ElementType::U8);
        let frame = Packet::Frame(Frame {
            index: 9,
            timestamp_ns: 123,
            image: Image::from_u8(ImageShape::gray(3, 4), (0..12).collect()).unwrap(),
        });
        let mut slot = vec![0u8; schema.item_size()];
        schema.encode(&frame, &mut slot).unwrap();
        assert_eq!(schema.decode(&slot).unwrap(), frame);
    }

    #[test]
    fn test_tracking_with_eyes_round_trip() {
        let schema = Schema::tracking(true, 4);
        let packet = Packet::Tracking(tracking_record(true, 4));
        let mut slot = vec![0u8; schema.item_size()];
        schema.encode(&packet, &mut slot).unwrap();
        assert_eq!(schema.decode(&slot).unwrap(), packet);
    }

    #[test]
    fn test_nan_is_preserved_bitwise() {
        let schema = Schema::Sample;
        let packet = Packet::Sample(Sample {
            index: 0,
            timestamp_ns: 0,
            value: f64::NAN,
        });
        let mut slot = vec![0u8; schema.item_size()];
        schema.encode(&packet, &mut slot).unwrap();
        let back = schema.decode(&slot).unwrap();
        assert_eq!(
            back.as_sample().unwrap().value.to_bits(),
            f64::NAN.to_bits()
        );
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let schema = Schema::tracking(false, 2);
        let wrong_tail = Packet::Tracking(tracking_record(false, 3));
        let mut slot = vec![0u8; schema.item_size()];
        assert!(schema.encode(&wrong_tail, &mut slot).is_err());

        let with_eyes = Packet::Tracking(tracking_record(true, 2));
        assert!(schema.encode(&with_eyes, &mut slot).is_err());
    }

    #[test]
    fn test_decode_wrong_length() {
        assert!(Schema::Sample.decode(&[0u8; 10]).is_err());
    }

    #[test]
    fn test_fingerprint_distinguishes_schemas() {
        let a = Schema::frame(480, 640, ElementType::U8);
        let b = Schema::frame(480, 640, ElementType::F32);
        let c = Schema::frame(640, 480, ElementType::U8);
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_schema_serde() {
        let schema = Schema::frame(2, 3, ElementType::U16);
        let json = serde_json::to_string(&schema).unwrap();
        assert!(json.contains("\"kind\":\"frame\""));
        let back: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(back, schema);
    }

    proptest! {
        #[test]
        fn prop_tracking_bitwise_round_trip(
            index in any::<i64>(),
            ts in any::<i64>(),
            identity in any::<i32>(),
            centroid in prop::array::uniform2(-1e6f32..1e6f32),
            tail in prop::collection::vec(prop::array::uniform2(-1e3f32..1e3f32), 0..16),
        ) {
            let record = TrackingRecord {
                index,
                timestamp_ns: ts,
                identity,
                origin: [0, 0],
                shape: [1, 1],
                tracking: Tracking {
                    centroid,
                    pc1: [1.0, 0.0],
                    pc2: [0.0, 1.0],
                    eyes: None,
                    tail: tail.clone(),
                },
            };
            let schema = Schema::tracking(false, tail.len());
            let packet = Packet::Tracking(record);
            let mut slot = vec![0u8; schema.item_size()];
            schema.encode(&packet, &mut slot).unwrap();
            prop_assert_eq!(schema.decode(&slot).unwrap(), packet);
        }
    }
}
