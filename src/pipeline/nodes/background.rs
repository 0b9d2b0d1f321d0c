//! Background subtraction node.
//!
//! Keeps a running-average background and emits `f32` frames where the animal
//! is positive whatever the polarity. The background starts from the reference
//! image when one is given, otherwise from the first frame.

use super::pgm::read_pgm;
use crate::config::Polarity;
use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{single, Packet, PortMap};
use crate::types::{Frame, Image};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const INPUT_PORT: &str = "frame";
pub const OUTPUT_PORT: &str = "subtracted";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundParams {
    pub polarity: Polarity,
    pub learning_rate: f32,
    pub reference_image: Option<PathBuf>,
}

impl Default for BackgroundParams {
    fn default() -> Self {
        Self {
            polarity: Polarity::DarkOnBright,
            learning_rate: 0.01,
            reference_image: None,
        }
    }
}

pub struct BackgroundSubNode {
    polarity: Polarity,
    learning_rate: f32,
    background: Option<Vec<f32>>,
}

impl BackgroundSubNode {
    pub fn new(polarity: Polarity, learning_rate: f32) -> Self {
        Self {
            polarity,
            learning_rate: learning_rate.clamp(0.0, 1.0),
            background: None,
        }
    }

    pub fn with_reference(mut self, reference: &Image) -> Self {
        self.background = Some(reference.to_f32_vec());
        self
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        let params: BackgroundParams = spec.params_as()?;
        let node = Self::new(params.polarity, params.learning_rate);
        Ok(match &params.reference_image {
            Some(path) => node.with_reference(&read_pgm(path)?),
            None => node,
        })
    }

    pub fn background(&self) -> Option<&[f32]> {
        self.background.as_deref()
    }

    /// Foreground of `image`, then fold it into the background.
    pub fn subtract(&mut self, image: &Image) -> anyhow::Result<Image> {
        let values = image.to_f32_vec();
        let (polarity, a) = (self.polarity, self.learning_rate);
        let background = self.background.get_or_insert_with(|| values.clone());
        if background.len() != values.len() {
            bail!(
                "frame has {} pixels, background has {}",
                values.len(),
                background.len()
            );
        }

        let foreground: Vec<f32> = values
            .iter()
            .zip(background.iter())
            .map(|(&v, &b)| match polarity {
                Polarity::DarkOnBright => (b - v).max(0.0),
                Polarity::BrightOnDark => (v - b).max(0.0),
            })
            .collect();

        if a > 0.0 {
            for (b, &v) in background.iter_mut().zip(values.iter()) {
                *b += a * (v - *b);
            }
        }

        Image::from_f32(image.shape(), &foreground).context("foreground size")
    }
}

impl WorkerNode for BackgroundSubNode {
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
        let image = self.subtract(&frame.image)?;
        let out = Frame {
            index: frame.index,
            timestamp_ns: frame.timestamp_ns,
            image,
        };
        Ok(Some(single(OUTPUT_PORT, out.into())))
    }
}
