//! Camera source node.
//!
//! Frames come from a [`FrameSource`]. Hardware drivers plug in through that
//! trait; two sources are built in: [`SyntheticCamera`] and
//! [`ImageSequenceCamera`].

use super::pgm::read_pgm;
use crate::config::{CameraSource, Roi};
use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{single, Packet, PortMap};
use crate::types::{now_ns, ElementType, Frame, Image, ImageShape};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::f32::consts::TAU;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Output port of the camera node.
pub const FRAME_PORT: &str = "frame";

/// Produces images of a fixed shape.
pub trait FrameSource: Send {
    fn shape(&self) -> ImageShape;

    fn element(&self) -> ElementType {
        ElementType::U8
    }

    /// Next image; `Ok(None)` once the source is exhausted.
    fn grab(&mut self) -> anyhow::Result<Option<Image>>;
}

// ====== Synthetic ======

const BACKGROUND_LEVEL: u8 = 220;
const ANIMAL_LEVEL: u8 = 30;

/// Dark elongated blobs on a bright background, one per ROI, each circling the
/// centre of its ROI once every `period_frames` frames.
pub struct SyntheticCamera {
    shape: ImageShape,
    rois: Vec<Roi>,
    period_frames: f32,
    frame: u64,
}

impl SyntheticCamera {
    pub fn new(height: usize, width: usize, rois: Vec<Roi>, period_frames: f32) -> Self {
        let rois = if rois.is_empty() {
            vec![Roi::new(0, 0, width, height)]
        } else {
            rois
        };
        Self {
            shape: ImageShape::gray(height, width),
            rois,
            period_frames: period_frames.max(1.0),
            frame: 0,
        }
    }

    /// Blob centre (x, y) and heading for `roi` at the current frame.
    pub fn blob_pose(&self, k: usize) -> ([f32; 2], f32) {
        let roi = self.rois[k];
        let phase = TAU * self.frame as f32 / self.period_frames + k as f32;
        let radius = 0.25 * roi.w.min(roi.h) as f32;
        let cx = roi.x as f32 + roi.w as f32 / 2.0 + radius * phase.cos();
        let cy = roi.y as f32 + roi.h as f32 / 2.0 + radius * phase.sin();
        // tangent to the circle
        ([cx, cy], phase + TAU / 4.0)
    }

    fn draw(&self, pixels: &mut [u8]) {
        let (h, w) = (self.shape.height, self.shape.width);
        for k in 0..self.rois.len() {
            let roi = self.rois[k];
            let ([cx, cy], heading) = self.blob_pose(k);
            let a = (0.08 * roi.w.min(roi.h) as f32).max(2.0);
            let b = (a / 2.5).max(1.0);
            let (cos, sin) = (heading.cos(), heading.sin());
            let x0 = (cx - a).floor().max(0.0) as usize;
            let y0 = (cy - a).floor().max(0.0) as usize;
            let x1 = ((cx + a).ceil() as usize).min(w.saturating_sub(1));
            let y1 = ((cy + a).ceil() as usize).min(h.saturating_sub(1));
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let (dx, dy) = (x as f32 - cx, y as f32 - cy);
                    let u = dx * cos + dy * sin;
                    let v = -dx * sin + dy * cos;
                    if (u / a).powi(2) + (v / b).powi(2) <= 1.0 {
                        pixels[y * w + x] = ANIMAL_LEVEL;
                    }
                }
            }
        }
    }
}

impl FrameSource for SyntheticCamera {
    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn grab(&mut self) -> anyhow::Result<Option<Image>> {
        let mut pixels = vec![BACKGROUND_LEVEL; self.shape.len()];
        self.draw(&mut pixels);
        self.frame += 1;
        Ok(Image::from_u8(self.shape, pixels))
    }
}

// ====== Image sequence ======

/// Replays the `.pgm` files of a directory in name order.
pub struct ImageSequenceCamera {
    files: Vec<PathBuf>,
    shape: ImageShape,
    element: ElementType,
    cursor: usize,
    looping: bool,
}

impl ImageSequenceCamera {
    pub fn open(dir: &Path, looping: bool) -> anyhow::Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("listing image directory {:?}", dir))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("pgm"))
            .collect();
        files.sort();
        let first = files
            .first()
            .with_context(|| format!("no .pgm files in {:?}", dir))?;
        let image = read_pgm(first)?;
        Ok(Self {
            shape: image.shape(),
            element: image.element(),
            files,
            cursor: 0,
            looping,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl FrameSource for ImageSequenceCamera {
    fn shape(&self) -> ImageShape {
        self.shape
    }

    fn element(&self) -> ElementType {
        self.element
    }

    fn grab(&mut self) -> anyhow::Result<Option<Image>> {
        if self.cursor == self.files.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }
        let path = &self.files[self.cursor];
        self.cursor += 1;
        let image = read_pgm(path)?;
        if image.shape() != self.shape || image.element() != self.element {
            bail!(
                "{:?} is {}x{} {}, sequence is {}x{} {}",
                path,
                image.height(),
                image.width(),
                image.element(),
                self.shape.height,
                self.shape.width,
                self.element
            );
        }
        Ok(Some(image))
    }
}

// ====== Node ======

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraParams {
    pub source: CameraSource,
    pub width: usize,
    pub height: usize,
    pub framerate: f32,
    pub rois: Vec<Roi>,
    pub image_dir: Option<PathBuf>,
    pub looping: bool,
    /// Stop producing after this many frames.
    pub max_frames: Option<u64>,
}

impl Default for CameraParams {
    fn default() -> Self {
        Self {
            source: CameraSource::Synthetic,
            width: 640,
            height: 480,
            framerate: 100.0,
            rois: Vec::new(),
            image_dir: None,
            looping: true,
            max_frames: None,
        }
    }
}

impl CameraParams {
    pub fn build_source(&self) -> anyhow::Result<Box<dyn FrameSource>> {
        Ok(match self.source {
            CameraSource::Synthetic => Box::new(SyntheticCamera::new(
                self.height,
                self.width,
                self.rois.clone(),
                4.0 * self.framerate,
            )),
            CameraSource::ImageSequence => {
                let dir = self
                    .image_dir
                    .as_deref()
                    .context("image-sequence camera needs image_dir")?;
                Box::new(ImageSequenceCamera::open(dir, self.looping)?)
            }
        })
    }
}

/// Emits one [`Frame`] per period on [`FRAME_PORT`]. A late frame pushes the
/// schedule back rather than producing a burst.
pub struct CameraNode {
    source: Box<dyn FrameSource>,
    period: Duration,
    next_due: Option<Instant>,
    index: i64,
    max_frames: Option<u64>,
    exhausted: bool,
}

impl CameraNode {
    pub fn new(source: Box<dyn FrameSource>, framerate: f32, max_frames: Option<u64>) -> Self {
        let period = if framerate > 0.0 {
            Duration::from_secs_f32(1.0 / framerate)
        } else {
            Duration::ZERO
        };
        Self {
            source,
            period,
            next_due: None,
            index: 0,
            max_frames,
            exhausted: false,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        let params: CameraParams = spec.params_as()?;
        Ok(Self::new(
            params.build_source()?,
            params.framerate,
            params.max_frames,
        ))
    }

    pub fn frames_emitted(&self) -> i64 {
        self.index
    }
}

impl WorkerNode for CameraNode {
    fn initialize(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        let shape = self.source.shape();
        tracing::info!(
            height = shape.height,
            width = shape.width,
            element = %self.source.element(),
            period_us = self.period.as_micros() as u64,
            "camera ready"
        );
        Ok(())
    }

    fn process_data(
        &mut self,
        _inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        let done = self
            .max_frames
            .is_some_and(|max| self.index as u64 >= max);
        if self.exhausted || done {
            ctx.sleep(self.period.max(Duration::from_millis(10)));
            return Ok(None);
        }

        if let Some(due) = self.next_due {
            ctx.sleep(due.saturating_duration_since(Instant::now()));
            if ctx.stop_requested() {
                return Ok(None);
            }
        }
        let now = Instant::now();
        self.next_due = Some(match self.next_due {
            Some(due) if due + self.period > now => due + self.period,
            _ => now + self.period,
        });

        let Some(image) = self.source.grab()? else {
            tracing::info!(frames = self.index, "frame source exhausted");
            self.exhausted = true;
            return Ok(None);
        };
        let frame = Frame {
            index: self.index,
            timestamp_ns: now_ns(),
            image,
        };
        self.index += 1;
        Ok(Some(single(FRAME_PORT, frame.into())))
    }
}
