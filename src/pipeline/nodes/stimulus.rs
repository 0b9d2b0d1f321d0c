//! Stimulus node.
//!
//! Rendering itself is external and plugs in through [`StimulusRenderer`]. The
//! node feeds it the latest tracking of every animal (closed loop) and the
//! commands arriving on the `control` metadata port, and appends one JSON line
//! per stimulus change to the stimulus log.

use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{MetaValue, Packet, PortMap};
use crate::session::timestamped_path;
use crate::types::{now_ns, TrackingRecord};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONTROL_PORT: &str = "control";

/// Data input carrying the tracking of animal `k`.
pub fn animal_port(k: usize) -> String {
    format!("animal_{}", k)
}

/// Draws the stimulus.
pub trait StimulusRenderer: Send {
    /// Switch to `stimulus` with `params`.
    fn set_stimulus(&mut self, stimulus: &str, params: &MetaValue) -> anyhow::Result<()>;

    /// Latest tracking, keyed by input port.
    fn update(&mut self, animals: &PortMap<TrackingRecord>) -> anyhow::Result<()>;

    /// Called when no tracking arrived; a windowed renderer pumps its events here.
    fn pump(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Renderer that only keeps count, for headless runs.
#[derive(Debug, Default)]
pub struct NullRenderer {
    pub updates: u64,
    pub current: Option<String>,
}

impl StimulusRenderer for NullRenderer {
    fn set_stimulus(&mut self, stimulus: &str, _params: &MetaValue) -> anyhow::Result<()> {
        self.current = Some(stimulus.to_string());
        Ok(())
    }

    fn update(&mut self, _animals: &PortMap<TrackingRecord>) -> anyhow::Result<()> {
        self.updates += 1;
        Ok(())
    }
}

/// Control message: `{"stimulus": <name>, "params": <any>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusCommand {
    pub stimulus: String,
    #[serde(default)]
    pub params: MetaValue,
}

#[derive(Debug, Serialize)]
struct LogLine<'a> {
    timestamp_ns: i64,
    stimulus: &'a str,
    params: &'a MetaValue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StimulusParams {
    pub output_dir: PathBuf,
    pub prefix: String,
    /// Event pump period when the node has no data inputs.
    pub pump_interval_ms: u64,
}

impl Default for StimulusParams {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            prefix: "stimulus".to_string(),
            pump_interval_ms: 10,
        }
    }
}

pub struct StimulusNode {
    renderer: Box<dyn StimulusRenderer>,
    params: StimulusParams,
    has_data_inputs: bool,
    current: Option<StimulusCommand>,
    log: Option<BufWriter<File>>,
    log_path: Option<PathBuf>,
    changes: u64,
}

impl StimulusNode {
    pub fn with_renderer(
        renderer: Box<dyn StimulusRenderer>,
        params: StimulusParams,
        has_data_inputs: bool,
    ) -> Self {
        Self {
            renderer,
            params,
            has_data_inputs,
            current: None,
            log: None,
            log_path: None,
            changes: 0,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        Ok(Self::with_renderer(
            Box::<NullRenderer>::default(),
            spec.params_as()?,
            !spec.ports.data_inputs.is_empty(),
        ))
    }

    pub fn current(&self) -> Option<&StimulusCommand> {
        self.current.as_ref()
    }

    pub fn changes(&self) -> u64 {
        self.changes
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    fn open_log(&mut self) -> anyhow::Result<()> {
        let path = timestamped_path(&self.params.output_dir, &self.params.prefix, "jsonl")?;
        let file = File::create(&path).with_context(|| format!("creating {:?}", path))?;
        tracing::info!(path = ?path, "stimulus log opened");
        self.log = Some(BufWriter::new(file));
        self.log_path = Some(path);
        Ok(())
    }

    /// Apply a command; logged only when it changes the stimulus state.
    pub fn apply(&mut self, command: StimulusCommand) -> anyhow::Result<bool> {
        if self.current.as_ref() == Some(&command) {
            return Ok(false);
        }
        self.renderer
            .set_stimulus(&command.stimulus, &command.params)?;
        if let Some(log) = self.log.as_mut() {
            let line = LogLine {
                timestamp_ns: now_ns(),
                stimulus: &command.stimulus,
                params: &command.params,
            };
            serde_json::to_writer(&mut *log, &line)?;
            log.write_all(b"\n")?;
            log.flush()?;
        }
        tracing::debug!(stimulus = %command.stimulus, "stimulus changed");
        self.current = Some(command);
        self.changes += 1;
        Ok(true)
    }
}

impl WorkerNode for StimulusNode {
    fn initialize(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        self.open_log()
    }

    fn process_metadata(
        &mut self,
        inputs: PortMap<MetaValue>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<MetaValue>>> {
        if let Some(message) = inputs.get(CONTROL_PORT) {
            let command: StimulusCommand = serde_json::from_value(message.clone())
                .with_context(|| format!("malformed stimulus command {}", message))?;
            self.apply(command)?;
        }
        Ok(None)
    }

    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        match inputs {
            Some(inputs) => {
                let animals: PortMap<TrackingRecord> = inputs
                    .into_iter()
                    .filter_map(|(port, packet)| match packet {
                        Packet::Tracking(t) => Some((port, t)),
                        _ => None,
                    })
                    .collect();
                self.renderer.update(&animals)?;
            }
            None => {
                self.renderer.pump()?;
                if !self.has_data_inputs {
                    ctx.sleep(Duration::from_millis(self.params.pump_interval_ms));
                }
            }
        }
        Ok(None)
    }

    fn cleanup(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        if let Some(mut log) = self.log.take() {
            log.flush()?;
        }
        tracing::info!(changes = self.changes, "stimulus log closed");
        Ok(())
    }
}
