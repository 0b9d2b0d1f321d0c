//! Tracker node.
//!
//! The tracking algorithm sits behind the [`Tracker`] trait. [`MomentTracker`]
//! is the built-in reference: thresholded, intensity weighted image moments.

use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use crate::types::{Crop, Tracking, TrackingRecord};
use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const INPUT_PORT: &str = "crop";
pub const DEFAULT_OUTPUT_PORT: &str = "tracking";

/// Estimates body pose from one crop. Coordinates returned are global (full frame).
pub trait Tracker: Send {
    fn track(&mut self, crop: &Crop) -> anyhow::Result<Tracking>;
}

pub struct MomentTracker {
    threshold: f32,
    tail_points: usize,
}

impl MomentTracker {
    pub fn new(threshold: f32, tail_points: usize) -> Self {
        Self {
            threshold,
            tail_points,
        }
    }
}

impl Tracker for MomentTracker {
    fn track(&mut self, crop: &Crop) -> anyhow::Result<Tracking> {
        let image = &crop.image;
        let (h, w) = (image.height(), image.width());

        let (mut m00, mut m10, mut m01) = (0.0f64, 0.0f64, 0.0f64);
        for y in 0..h {
            for x in 0..w {
                let v = image.at(y, x);
                if v > self.threshold {
                    let v = v as f64;
                    m00 += v;
                    m10 += v * x as f64;
                    m01 += v * y as f64;
                }
            }
        }

        let nan = [f32::NAN; 2];
        let mut tracking = Tracking {
            centroid: nan,
            pc1: nan,
            pc2: nan,
            eyes: None,
            tail: vec![nan; self.tail_points],
        };
        if m00 <= 0.0 {
            return Ok(tracking);
        }

        let (cx, cy) = (m10 / m00, m01 / m00);
        let (mut mu20, mut mu02, mut mu11) = (0.0f64, 0.0f64, 0.0f64);
        for y in 0..h {
            for x in 0..w {
                let v = image.at(y, x);
                if v > self.threshold {
                    let v = v as f64;
                    let (dx, dy) = (x as f64 - cx, y as f64 - cy);
                    mu20 += v * dx * dx;
                    mu02 += v * dy * dy;
                    mu11 += v * dx * dy;
                }
            }
        }
        let theta = 0.5 * (2.0 * mu11).atan2(mu20 - mu02);
        let (sin, cos) = (theta.sin() as f32, theta.cos() as f32);

        tracking.centroid = [
            cx as f32 + crop.origin[0] as f32,
            cy as f32 + crop.origin[1] as f32,
        ];
        tracking.pc1 = [cos, sin];
        tracking.pc2 = [-sin, cos];
        Ok(tracking)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerParams {
    pub threshold: f32,
    pub tail_points: usize,
    /// Ports the record is broadcast on.
    pub outputs: Vec<String>,
}

impl Default for TrackerParams {
    fn default() -> Self {
        Self {
            threshold: 20.0,
            tail_points: 0,
            outputs: vec![DEFAULT_OUTPUT_PORT.to_string()],
        }
    }
}

/// One tracking record per crop, copied to every output port.
pub struct TrackerNode {
    tracker: Box<dyn Tracker>,
    outputs: Vec<String>,
}

impl TrackerNode {
    pub fn new(tracker: Box<dyn Tracker>, outputs: Vec<String>) -> Self {
        Self { tracker, outputs }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        let params: TrackerParams = spec.params_as()?;
        Ok(Self::new(
            Box::new(MomentTracker::new(params.threshold, params.tail_points)),
            params.outputs,
        ))
    }
}

impl WorkerNode for TrackerNode {
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        let Some(inputs) = inputs else {
            return Ok(None);
        };
        let crop = inputs
            .get(INPUT_PORT)
            .and_then(Packet::as_crop)
            .context("expected a crop on 'crop'")?;
        let tracking = self.tracker.track(crop)?;
        let record = TrackingRecord {
            index: crop.index,
            timestamp_ns: crop.timestamp_ns,
            identity: crop.identity,
            origin: crop.origin,
            shape: crop.shape,
            tracking,
        };
        Ok(Some(
            self.outputs
                .iter()
                .map(|port| (port.clone(), Packet::Tracking(record.clone())))
                .collect(),
        ))
    }
}
