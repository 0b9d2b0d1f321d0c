//! Protocol sequencer.
//!
//! Walks the protocol items `repetitions` times, sending each as a stimulus
//! command on the `stimulus` metadata port and holding it for its duration.
//! A final `blank` command is sent once the protocol is over.

use crate::config::ProtocolItem;
use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::{Duration, Instant};

pub const STIMULUS_PORT: &str = "stimulus";

const IDLE: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerParams {
    pub protocol: Vec<ProtocolItem>,
    pub repetitions: usize,
}

impl Default for SequencerParams {
    fn default() -> Self {
        Self {
            protocol: Vec::new(),
            repetitions: 1,
        }
    }
}

pub struct SequencerNode {
    protocol: Vec<ProtocolItem>,
    repetitions: usize,
    step: usize,
    hold_until: Option<Instant>,
    finished: bool,
}

impl SequencerNode {
    pub fn new(protocol: Vec<ProtocolItem>, repetitions: usize) -> Self {
        Self {
            protocol,
            repetitions,
            step: 0,
            hold_until: None,
            finished: false,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        let params: SequencerParams = spec.params_as()?;
        Ok(Self::new(params.protocol, params.repetitions))
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn total_steps(&self) -> usize {
        self.protocol.len() * self.repetitions
    }
}

impl WorkerNode for SequencerNode {
    fn initialize(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        tracing::info!(
            items = self.protocol.len(),
            repetitions = self.repetitions,
            "protocol loaded"
        );
        Ok(())
    }

    fn process_data(
        &mut self,
        _inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        if self.finished {
            ctx.sleep(IDLE);
            return Ok(None);
        }
        if let Some(until) = self.hold_until {
            let left = until.saturating_duration_since(Instant::now());
            if !left.is_zero() {
                ctx.sleep(left.min(IDLE));
                return Ok(None);
            }
        }

        if self.step >= self.total_steps() {
            if !self.protocol.is_empty() {
                ctx.send_metadata(STIMULUS_PORT, json!({ "stimulus": "blank", "params": null }));
            }
            tracing::info!(steps = self.step, "protocol finished");
            self.finished = true;
            return Ok(None);
        }

        let item_index = self.step % self.protocol.len();
        let repetition = self.step / self.protocol.len();
        let item = &self.protocol[item_index];
        ctx.send_metadata(
            STIMULUS_PORT,
            json!({
                "stimulus": item.stimulus,
                "params": item.params,
                "item": item_index,
                "repetition": repetition,
            }),
        );
        tracing::debug!(stimulus = %item.stimulus, item = item_index, repetition, "protocol step");
        self.hold_until = Some(Instant::now() + Duration::from_secs_f64(item.duration_s.max(0.0)));
        self.step += 1;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::control::ControlBlock;

    fn item(name: &str) -> ProtocolItem {
        ProtocolItem {
            stimulus: name.to_string(),
            duration_s: 0.0,
            params: json!({ "name": name }),
        }
    }

    #[test]
    fn test_walks_protocol_with_repetitions() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlBlock::create(&dir.path().join("control")).unwrap();
        let queues = Default::default();
        let mut ctx = NodeContext::new("sequencer", &queues, &control);

        let mut node = SequencerNode::new(vec![item("a"), item("b")], 2);
        let mut sent = Vec::new();
        for _ in 0..8 {
            node.process_data(None, &mut ctx).unwrap();
            sent.extend(ctx.take_outbox());
        }
        let names: Vec<&str> = sent
            .iter()
            .map(|(port, msg)| {
                assert_eq!(port, STIMULUS_PORT);
                msg["stimulus"].as_str().unwrap()
            })
            .collect();
        assert_eq!(names, vec!["a", "b", "a", "b", "blank"]);
        assert_eq!(sent[2].1["repetition"], 1);
        assert!(node.is_finished());
    }

    #[test]
    fn test_holds_for_duration() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlBlock::create(&dir.path().join("control")).unwrap();
        let queues = Default::default();
        let mut ctx = NodeContext::new("sequencer", &queues, &control);

        let mut long = item("a");
        long.duration_s = 60.0;
        let mut node = SequencerNode::new(vec![long], 1);
        node.process_data(None, &mut ctx).unwrap();
        node.process_data(None, &mut ctx).unwrap();
        assert_eq!(ctx.take_outbox().len(), 1);
        assert!(!node.is_finished());
    }

    #[test]
    fn test_empty_protocol_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlBlock::create(&dir.path().join("control")).unwrap();
        let queues = Default::default();
        let mut ctx = NodeContext::new("sequencer", &queues, &control);

        let mut node = SequencerNode::new(Vec::new(), 3);
        node.process_data(None, &mut ctx).unwrap();
        assert!(ctx.take_outbox().is_empty());
        assert!(node.is_finished());
    }
}
