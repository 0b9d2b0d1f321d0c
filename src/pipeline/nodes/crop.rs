//! Per-animal crop node: one `roi_<k>` output per ROI.

use crate::config::Roi;
use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use crate::types::{Crop, Frame};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

pub const INPUT_PORT: &str = "frame";

/// Output port carrying the crops of animal `k`.
pub fn roi_port(k: usize) -> String {
    format!("roi_{}", k)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropParams {
    pub rois: Vec<Roi>,
}

pub struct CropNode {
    rois: Vec<Roi>,
    ports: Vec<String>,
}

impl CropNode {
    pub fn new(rois: Vec<Roi>) -> anyhow::Result<Self> {
        if rois.is_empty() {
            bail!("crop node needs at least one ROI");
        }
        let ports = (0..rois.len()).map(roi_port).collect();
        Ok(Self { rois, ports })
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        let params: CropParams = spec.params_as()?;
        Self::new(params.rois)
    }

    pub fn crop(&self, frame: &Frame) -> PortMap<Packet> {
        self.rois
            .iter()
            .zip(&self.ports)
            .enumerate()
            .map(|(k, (roi, port))| {
                let crop = Crop {
                    index: frame.index,
                    timestamp_ns: frame.timestamp_ns,
                    identity: k as i32,
                    origin: [roi.x as i32, roi.y as i32],
                    shape: [roi.h as i32, roi.w as i32],
                    image: frame.image.crop((roi.y, roi.x), (roi.h, roi.w)),
                };
                (port.clone(), Packet::Crop(crop))
            })
            .collect()
    }
}

impl WorkerNode for CropNode {
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        let Some(inputs) = inputs else {
            return Ok(None);
        };
        let frame = inputs
            .get(INPUT_PORT)
            .and_then(Packet::as_frame)
            .context("expected a frame on 'frame'")?;
        Ok(Some(self.crop(frame)))
    }
}
