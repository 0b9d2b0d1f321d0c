//! Common test utilities: small nodes over `Sample` records and a recorder
//! shared with thread-mode workers.

#![allow(dead_code)] // Test utilities may not all be used in every test file

use anyhow::bail;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use vrloop::pipeline::{single, Packet, PortMap};
use vrloop::types::now_ns;
use vrloop::{NodeContext, NodeRegistry, NodeSpec, Sample, Schema, WorkerNode};

pub const COUNTER: &str = "counter";
pub const FORWARD: &str = "forward";
pub const SINK: &str = "sink";
/// Aborts its process on the first record; process mode only.
pub const CRASH: &str = "crash";

/// Indices received by each sink, keyed by node name.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<BTreeMap<String, Vec<i64>>>>);

impl Recorder {
    fn push(&self, node: &str, index: i64) {
        let mut map = self.0.lock().unwrap();
        map.entry(node.to_string()).or_default().push(index);
    }

    pub fn indices(&self, node: &str) -> Vec<i64> {
        self.0.lock().unwrap().get(node).cloned().unwrap_or_default()
    }

    pub fn count(&self, node: &str) -> usize {
        self.0.lock().unwrap().get(node).map_or(0, Vec::len)
    }

    pub fn last(&self, node: &str) -> Option<i64> {
        self.0
            .lock()
            .unwrap()
            .get(node)
            .and_then(|v| v.last().copied())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct CounterParams {
    /// Unlimited when absent.
    count: Option<i64>,
    period_us: u64,
}

/// Emits `Sample { index: 0, 1, .. }` on `out`, one per period.
struct Counter {
    params: CounterParams,
    next: i64,
}

impl WorkerNode for Counter {
    fn process_data(
        &mut self,
        _inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        ctx.sleep(Duration::from_micros(self.params.period_us.max(1)));
        if self.params.count.is_some_and(|n| self.next >= n) {
            return Ok(None);
        }
        let sample = Sample {
            index: self.next,
            timestamp_ns: now_ns(),
            value: self.next as f64,
        };
        self.next += 1;
        Ok(Some(single("out", sample.into())))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ForwardParams {
    /// Fail on every record whose `index % fail_every == fail_every - 1`.
    fail_every: i64,
}

/// Copies `in` to `out`.
struct Forward {
    params: ForwardParams,
}

impl WorkerNode for Forward {
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        let Some(packet) = inputs.and_then(|mut m| m.remove("in")) else {
            return Ok(None);
        };
        let n = self.params.fail_every;
        if n > 0 && packet.index() % n == n - 1 {
            bail!("refusing record {}", packet.index());
        }
        Ok(Some(single("out", packet)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SinkParams {
    delay_us: u64,
}

/// Records the index of everything arriving on `in`.
struct Sink {
    params: SinkParams,
    recorder: Recorder,
}

impl WorkerNode for Sink {
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        if let Some(packet) = inputs.and_then(|mut m| m.remove("in")) {
            self.recorder.push(ctx.name, packet.index());
            if self.params.delay_us > 0 {
                ctx.sleep(Duration::from_micros(self.params.delay_us));
            }
        }
        Ok(None)
    }
}

struct Crash;

impl WorkerNode for Crash {
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        if inputs.is_some() {
            std::process::abort();
        }
        Ok(None)
    }
}

/// Registry with the test kinds; sinks report into `recorder`.
pub fn registry(recorder: &Recorder) -> NodeRegistry {
    let recorder = recorder.clone();
    let mut registry = NodeRegistry::new();
    registry
        .register(COUNTER, |spec| {
            Ok(Box::new(Counter {
                params: spec.params_as()?,
                next: 0,
            }))
        })
        .register(FORWARD, |spec| {
            Ok(Box::new(Forward {
                params: spec.params_as()?,
            }))
        })
        .register(CRASH, |_| Ok(Box::new(Crash)))
        .register(SINK, move |spec| {
            Ok(Box::new(Sink {
                params: spec.params_as()?,
                recorder: recorder.clone(),
            }))
        });
    registry
}

pub fn counter(name: &str, count: Option<i64>, period_us: u64) -> NodeSpec {
    NodeSpec::new(name, COUNTER)
        .typed_output("out", Schema::Sample)
        .with_params(serde_json::json!({ "count": count, "period_us": period_us }))
}

pub fn forward(name: &str, fail_every: i64) -> NodeSpec {
    NodeSpec::new(name, FORWARD)
        .typed_input("in", Schema::Sample)
        .typed_output("out", Schema::Sample)
        .with_params(serde_json::json!({ "fail_every": fail_every }))
}

pub fn sink(name: &str, delay_us: u64) -> NodeSpec {
    NodeSpec::new(name, SINK)
        .typed_input("in", Schema::Sample)
        .with_params(serde_json::json!({ "delay_us": delay_us }))
}

pub fn crash(name: &str) -> NodeSpec {
    NodeSpec::new(name, CRASH).typed_input("in", Schema::Sample)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

pub fn assert_strictly_increasing(indices: &[i64]) {
    assert!(
        indices.windows(2).all(|w| w[0] < w[1]),
        "indices not strictly increasing: {:?}",
        indices
    );
}
