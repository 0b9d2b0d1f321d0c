//! Tracking CSV writer.
//!
//! One row per received tracking record. Absent values (no eye tracking, lost
//! animal) are written as `NaN`.

use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use crate::session::timestamped_path;
use crate::types::{now_ns, TrackingRecord};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub const INPUT_PORT: &str = "tracking";

const FLUSH_EVERY: u64 = 100;

/// Header row for records with `tail_points` tail points.
pub fn csv_header(tail_points: usize) -> String {
    let mut header = String::from(
        "index,timestamp_ns,identity,latency_ms,centroid_x,centroid_y,pc1_x,pc1_y,pc2_x,pc2_y,\
         left_eye_x,left_eye_y,left_eye_angle,right_eye_x,right_eye_y,right_eye_angle",
    );
    for axis in ["x", "y"] {
        for i in 0..tail_points {
            let _ = write!(header, ",tail_point_{:03}_{}", i, axis);
        }
    }
    header
}

/// One CSV row. Tail columns are padded with `NaN` up to `tail_points`.
pub fn format_row(record: &TrackingRecord, latency_ms: f64, tail_points: usize) -> String {
    let t = &record.tracking;
    let mut row = format!(
        "{},{},{},{:.3},{},{},{},{},{},{}",
        record.index,
        record.timestamp_ns,
        record.identity,
        latency_ms,
        t.centroid[0],
        t.centroid[1],
        t.pc1[0],
        t.pc1[1],
        t.pc2[0],
        t.pc2[1],
    );
    match &t.eyes {
        Some([left, right]) => {
            for eye in [left, right] {
                let _ = write!(
                    row,
                    ",{},{},{}",
                    eye.position[0], eye.position[1], eye.angle
                );
            }
        }
        None => row.push_str(",NaN,NaN,NaN,NaN,NaN,NaN"),
    }
    for axis in 0..2 {
        for i in 0..tail_points {
            let v = t.tail.get(i).map_or(f32::NAN, |p| p[axis]);
            let _ = write!(row, ",{}", v);
        }
    }
    row
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSaverParams {
    pub output_dir: PathBuf,
    /// File name prefix; may contain sub-directories.
    pub prefix: String,
    pub tail_points: usize,
}

impl Default for TrackingSaverParams {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            prefix: "tracking".to_string(),
            tail_points: 0,
        }
    }
}

pub struct TrackingSaverNode {
    params: TrackingSaverParams,
    writer: Option<BufWriter<File>>,
    path: Option<PathBuf>,
    rows_written: u64,
}

impl TrackingSaverNode {
    pub fn new(params: TrackingSaverParams) -> Self {
        Self {
            params,
            writer: None,
            path: None,
            rows_written: 0,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        Ok(Self::new(spec.params_as()?))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn open(&mut self) -> anyhow::Result<()> {
        let path = timestamped_path(&self.params.output_dir, &self.params.prefix, "csv")?;
        let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{}", csv_header(self.params.tail_points))?;
        writer.flush()?;
        tracing::info!(path = ?path, "tracking csv opened");
        self.writer = Some(writer);
        self.path = Some(path);
        Ok(())
    }

    pub fn write(&mut self, record: &TrackingRecord) -> anyhow::Result<()> {
        let latency_ms = (now_ns() - record.timestamp_ns) as f64 / 1e6;
        let row = format_row(record, latency_ms, self.params.tail_points);
        let writer = self.writer.as_mut().context("tracking csv is not open")?;
        writeln!(writer, "{}", row)?;
        self.rows_written += 1;
        if self.rows_written % FLUSH_EVERY == 0 {
            writer.flush()?;
        }
        Ok(())
    }
}

impl WorkerNode for TrackingSaverNode {
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
        for packet in inputs.values() {
            let record = packet
                .as_tracking()
                .with_context(|| format!("expected tracking, got {}", packet.kind_name()))?;
            self.write(record)?;
        }
        Ok(None)
    }

    fn cleanup(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        tracing::info!(rows = self.rows_written, path = ?self.path, "tracking csv closed");
        Ok(())
    }
}
