//! Video recording node.
//!
//! Frames go to a [`FrameEncoder`]; every written frame gets a row in a sidecar
//! CSV (`index,timestamp_ns,camera_timestamp_ns`). Hardware codecs plug in
//! through the trait; two encoders are built in.

use super::pgm::{to_u8, write_pgm};
use crate::config::RecordingMethod;
use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use crate::session::timestamped_path;
use crate::types::{now_ns, ElementType, Frame, Image};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const INPUT_PORT: &str = "frame";
pub const SIDECAR_HEADER: &str = "index,timestamp_ns,camera_timestamp_ns";

/// Appends frames to an on-disk stream.
pub trait FrameEncoder: Send {
    fn write(&mut self, image: &Image) -> anyhow::Result<()>;

    fn finish(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// File or directory holding the recording.
    fn path(&self) -> &Path;
}

/// One PGM file per frame, `frame_00000000.pgm` onwards, in a directory.
pub struct PgmSequenceEncoder {
    dir: PathBuf,
    next: u64,
}

impl PgmSequenceEncoder {
    pub fn create(dir: PathBuf) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&dir).with_context(|| format!("creating {:?}", dir))?;
        Ok(Self { dir, next: 0 })
    }
}

impl FrameEncoder for PgmSequenceEncoder {
    fn write(&mut self, image: &Image) -> anyhow::Result<()> {
        write_pgm(&self.dir.join(format!("frame_{:08}.pgm", self.next)), image)?;
        self.next += 1;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

/// Headerless 8-bit gray stream (`rawvideo`, `gray` pixel format).
pub struct RawVideoEncoder {
    path: PathBuf,
    out: BufWriter<File>,
}

impl RawVideoEncoder {
    pub fn create(path: PathBuf) -> anyhow::Result<Self> {
        let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
        Ok(Self {
            path,
            out: BufWriter::new(file),
        })
    }
}

impl FrameEncoder for RawVideoEncoder {
    fn write(&mut self, image: &Image) -> anyhow::Result<()> {
        if image.element() == ElementType::U8 && image.shape().channels == 1 {
            self.out.write_all(image.as_bytes())?;
        } else {
            let bytes: Vec<u8> = (0..image.height())
                .flat_map(|r| (0..image.width()).map(move |c| (r, c)))
                .map(|(r, c)| to_u8(image.at(r, c)))
                .collect();
            self.out.write_all(&bytes)?;
        }
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoWriterParams {
    pub output_dir: PathBuf,
    pub prefix: String,
    pub method: RecordingMethod,
    /// Keep one frame out of `decimation`.
    pub decimation: usize,
}

impl Default for VideoWriterParams {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            prefix: "recording".to_string(),
            method: RecordingMethod::ImageSequence,
            decimation: 1,
        }
    }
}

impl VideoWriterParams {
    pub fn build_encoder(&self) -> anyhow::Result<Box<dyn FrameEncoder>> {
        Ok(match self.method {
            RecordingMethod::ImageSequence => Box::new(PgmSequenceEncoder::create(
                timestamped_path(&self.output_dir, &self.prefix, "")?,
            )?),
            RecordingMethod::VideoFile => Box::new(RawVideoEncoder::create(timestamped_path(
                &self.output_dir,
                &self.prefix,
                "gray",
            )?)?),
        })
    }
}

pub struct VideoWriterNode {
    params: VideoWriterParams,
    encoder: Option<Box<dyn FrameEncoder>>,
    sidecar: Option<BufWriter<File>>,
    sidecar_path: Option<PathBuf>,
    received: u64,
    written: u64,
}

impl VideoWriterNode {
    pub fn new(params: VideoWriterParams) -> Self {
        Self {
            params,
            encoder: None,
            sidecar: None,
            sidecar_path: None,
            received: 0,
            written: 0,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        Ok(Self::new(spec.params_as()?))
    }

    pub fn frames_written(&self) -> u64 {
        self.written
    }

    pub fn sidecar_path(&self) -> Option<&Path> {
        self.sidecar_path.as_deref()
    }

    pub fn recording_path(&self) -> Option<&Path> {
        self.encoder.as_ref().map(|e| e.path())
    }

    fn open(&mut self) -> anyhow::Result<()> {
        let encoder = self.params.build_encoder()?;
        let sidecar_path = timestamped_path(
            &self.params.output_dir,
            &format!("{}_frames", self.params.prefix),
            "csv",
        )?;
        let file =
            File::create(&sidecar_path).with_context(|| format!("creating {:?}", sidecar_path))?;
        let mut sidecar = BufWriter::new(file);
        writeln!(sidecar, "{}", SIDECAR_HEADER)?;
        tracing::info!(recording = ?encoder.path(), sidecar = ?sidecar_path, "recording started");
        self.encoder = Some(encoder);
        self.sidecar = Some(sidecar);
        self.sidecar_path = Some(sidecar_path);
        Ok(())
    }

    pub fn record(&mut self, frame: &Frame) -> anyhow::Result<bool> {
        let keep = self.received % self.params.decimation.max(1) as u64 == 0;
        self.received += 1;
        if !keep {
            return Ok(false);
        }
        let encoder = self.encoder.as_mut().context("recording is not open")?;
        encoder.write(&frame.image)?;
        if let Some(sidecar) = self.sidecar.as_mut() {
            writeln!(
                sidecar,
                "{},{},{}",
                self.written,
                now_ns(),
                frame.timestamp_ns
            )?;
        }
        self.written += 1;
        Ok(true)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut encoder) = self.encoder.take() {
            encoder.finish()?;
        }
        if let Some(mut sidecar) = self.sidecar.take() {
            sidecar.flush()?;
        }
        Ok(())
    }
}

impl WorkerNode for VideoWriterNode {
    fn initialize(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        self.open()
    }

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
        self.record(frame)?;
        Ok(None)
    }

    fn cleanup(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        self.close()?;
        tracing::info!(
            received = self.received,
            written = self.written,
            "recording closed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageShape;

    fn frame(index: i64, value: u8) -> Frame {
        Frame {
            index,
            timestamp_ns: 1_000 + index,
            image: Image::from_u8(ImageShape::gray(2, 2), vec![value; 4]).unwrap(),
        }
    }

    #[test]
    fn test_image_sequence_with_decimation() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = VideoWriterNode::new(VideoWriterParams {
            output_dir: dir.path().to_path_buf(),
            decimation: 2,
            ..Default::default()
        });
        node.open().unwrap();
        for i in 0..5 {
            node.record(&frame(i, i as u8)).unwrap();
        }
        let recording = node.recording_path().unwrap().to_path_buf();
        let sidecar = node.sidecar_path().unwrap().to_path_buf();
        node.close().unwrap();

        assert_eq!(node.frames_written(), 3);
        assert!(recording.join("frame_00000002.pgm").is_file());
        assert!(!recording.join("frame_00000003.pgm").exists());

        let content = std::fs::read_to_string(sidecar).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines[0], SIDECAR_HEADER);
        assert_eq!(lines.len(), 4);
        assert!(lines[2].starts_with("1,"));
        assert!(lines[2].ends_with(",1002"));
    }

    #[test]
    fn test_raw_video_converts_to_u8() {
        let dir = tempfile::tempdir().unwrap();
        let mut node = VideoWriterNode::new(VideoWriterParams {
            output_dir: dir.path().to_path_buf(),
            method: RecordingMethod::VideoFile,
            ..Default::default()
        });
        node.open().unwrap();
        node.record(&frame(0, 7)).unwrap();
        let float = Frame {
            index: 1,
            timestamp_ns: 0,
            image: Image::from_f32(ImageShape::gray(2, 2), &[1.0, 2.0, 300.0, -1.0]).unwrap(),
        };
        node.record(&float).unwrap();
        let recording = node.recording_path().unwrap().to_path_buf();
        node.close().unwrap();

        assert_eq!(recording.extension().unwrap(), "gray");
        assert_eq!(
            std::fs::read(recording).unwrap(),
            vec![7, 7, 7, 7, 1, 2, 255, 0]
        );
    }
}
