//! Records exchanged between nodes.
//!
//! `Packet` is the unit carried on data edges (ring-buffer queues); metadata
//! edges carry free-form JSON values (`MetaValue`). Port readings and node
//! outputs are keyed by port name in a [`PortMap`].

use crate::types::{Crop, Frame, Sample, TrackingRecord};
use std::collections::BTreeMap;

/// Port name → value, ordered so iteration (and hence publishing) is deterministic.
pub type PortMap<T> = BTreeMap<String, T>;

/// Message on a metadata edge.
pub type MetaValue = serde_json::Value;

/// A data record of one of the fixed payload kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Frame(Frame),
    Crop(Crop),
    Tracking(TrackingRecord),
    Sample(Sample),
}

impl Packet {
    pub fn index(&self) -> i64 {
        match self {
            Packet::Frame(f) => f.index,
            Packet::Crop(c) => c.index,
            Packet::Tracking(t) => t.index,
            Packet::Sample(s) => s.index,
        }
    }

    pub fn timestamp_ns(&self) -> i64 {
        match self {
            Packet::Frame(f) => f.timestamp_ns,
            Packet::Crop(c) => c.timestamp_ns,
            Packet::Tracking(t) => t.timestamp_ns,
            Packet::Sample(s) => s.timestamp_ns,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Packet::Frame(_) => "frame",
            Packet::Crop(_) => "crop",
            Packet::Tracking(_) => "tracking",
            Packet::Sample(_) => "sample",
        }
    }

    pub fn as_frame(&self) -> Option<&Frame> {
        match self {
            Packet::Frame(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_crop(&self) -> Option<&Crop> {
        match self {
            Packet::Crop(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_tracking(&self) -> Option<&TrackingRecord> {
        match self {
            Packet::Tracking(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_sample(&self) -> Option<&Sample> {
        match self {
            Packet::Sample(s) => Some(s),
            _ => None,
        }
    }
}

impl From<Frame> for Packet {
    fn from(f: Frame) -> Self {
        Packet::Frame(f)
    }
}

impl From<Crop> for Packet {
    fn from(c: Crop) -> Self {
        Packet::Crop(c)
    }
}

impl From<TrackingRecord> for Packet {
    fn from(t: TrackingRecord) -> Self {
        Packet::Tracking(t)
    }
}

impl From<Sample> for Packet {
    fn from(s: Sample) -> Self {
        Packet::Sample(s)
    }
}

/// Build a one-entry output map.
pub fn single<T>(port: &str, value: T) -> PortMap<T> {
    let mut map = PortMap::new();
    map.insert(port.to_string(), value);
    map
}
