//! Worker side of the DAG: the per-node event loop.
//!
//! A worker is started from a [`WorkerManifest`] (serialized by the
//! orchestrator). It attaches the control block and its queues, builds its node
//! body through the [`NodeRegistry`], reports `Ready`, waits for the release
//! flag and then loops:
//!
//! 1. metadata: receive, `process_metadata`, publish;
//! 2. data: receive (or time out), `process_data`, publish;
//!
//! until the stop flag is set, then runs `cleanup`.
//!
//! Hook errors and panics are transient: logged, counted, and the loop goes on.
//! `fatal_error_threshold` consecutive failing iterations make the node fail.

use crate::error::VrError;
use crate::logging::{self, LogFiles};
use crate::pipeline::control::{ControlBlock, WorkerState};
use crate::pipeline::error::DagError;
use crate::pipeline::node::{NodeContext, NodeRegistry, NodeSpec, WorkerNode};
use crate::pipeline::packet::single;
use crate::pipeline::port::PortPlane;
use crate::pipeline::strategy::{InputTable, OutputTable};
use crate::queue::monitored::DEFAULT_WINDOW;
use crate::queue::{MetadataQueue, MonitoredQueue, QueueHandle, RingBuffer};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything a worker needs, serialized across the process boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerManifest {
    /// Slot in the control block.
    pub slot: usize,
    pub name: String,
    pub control: PathBuf,
    /// Log queue; `None` logs to stderr.
    pub log_queue: Option<QueueHandle>,
    pub log_filter: String,
    pub realtime_priority: Option<i32>,
    pub role: WorkerRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum WorkerRole {
    Node(NodeManifest),
    Logger(LoggerManifest),
}

/// Queue bindings and loop settings of one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeManifest {
    pub spec: NodeSpec,
    pub data_inputs: BTreeMap<String, QueueHandle>,
    pub data_outputs: BTreeMap<String, Vec<QueueHandle>>,
    pub metadata_inputs: BTreeMap<String, QueueHandle>,
    pub metadata_outputs: BTreeMap<String, Vec<QueueHandle>>,
    /// Every queue of the DAG, exposed to the node through its context.
    pub queues: BTreeMap<String, QueueHandle>,
    pub default_timeout: Duration,
    pub fatal_error_threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggerManifest {
    pub queue: QueueHandle,
    pub worker_log: PathBuf,
    pub queue_log: PathBuf,
}

/// Run one worker to completion in the current thread.
pub fn run_worker(manifest: &WorkerManifest, registry: &NodeRegistry) -> crate::Result<()> {
    let control = ControlBlock::open(&manifest.control)?;
    control.set_state(manifest.slot, WorkerState::Spawned);
    control.set_pid(manifest.slot, std::process::id());

    let log_queue = match manifest.log_queue.as_ref().map(QueueHandle::open_metadata) {
        Some(Ok(q)) => Some(Arc::new(q)),
        Some(Err(e)) => {
            control.set_state(manifest.slot, WorkerState::Failed);
            return Err(e.into());
        }
        None => None,
    };
    let dispatch = logging::worker_dispatch(log_queue, &manifest.log_filter, &manifest.name);

    tracing::dispatcher::with_default(&dispatch, || {
        let span = tracing::info_span!("worker", node = %manifest.name);
        let _enter = span.enter();

        apply_realtime_priority(manifest.realtime_priority);

        let result = match &manifest.role {
            WorkerRole::Node(node) => run_node(manifest.slot, node, &control, registry),
            WorkerRole::Logger(logger) => run_logger_worker(manifest.slot, logger, &control),
        };
        if let Err(e) = &result {
            tracing::error!("worker failed: {}", e);
            control.set_state(manifest.slot, WorkerState::Failed);
        }
        result
    })
}

/// Best-effort `SCHED_FIFO` for the calling thread.
pub fn apply_realtime_priority(priority: Option<i32>) {
    let Some(priority) = priority else {
        return;
    };
    #[cfg(target_os = "linux")]
    {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        // SAFETY: pid 0 = calling thread; param is a valid sched_param.
        let rc = unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) };
        if rc == 0 {
            tracing::info!(priority, "SCHED_FIFO enabled");
        } else {
            tracing::warn!(
                priority,
                error = %std::io::Error::last_os_error(),
                "could not raise scheduling priority"
            );
        }
    }
    #[cfg(not(target_os = "linux"))]
    tracing::warn!(priority, "real-time priority is only supported on Linux");
}

fn run_logger_worker(
    slot: usize,
    manifest: &LoggerManifest,
    control: &ControlBlock,
) -> crate::Result<()> {
    let queue = manifest.queue.open_metadata()?;
    let mut files = LogFiles::open(&manifest.worker_log, &manifest.queue_log).map_err(|e| {
        VrError::Artefact(format!(
            "cannot open log files {:?} / {:?}: {}",
            manifest.worker_log, manifest.queue_log, e
        ))
    })?;
    control.set_state(slot, WorkerState::Ready);
    control.set_state(slot, WorkerState::Running);
    let lines = logging::run_logger(&queue, control, &mut files)?;
    tracing::debug!(lines, "logger drained");
    control.set_state(slot, WorkerState::Finished);
    Ok(())
}

type DataIn = InputTable<MonitoredQueue<RingBuffer>>;

struct Bindings {
    data_in: DataIn,
    data_monitors: Vec<Arc<MonitoredQueue<RingBuffer>>>,
    data_out: OutputTable<RingBuffer>,
    meta_in: InputTable<MetadataQueue>,
    meta_out: OutputTable<MetadataQueue>,
}

fn bind_queues(manifest: &NodeManifest) -> crate::Result<Bindings> {
    let spec = &manifest.spec;
    let data_timeout = spec.receive_data_timeout.unwrap_or(manifest.default_timeout);
    let meta_timeout = spec.receive_metadata_timeout.unwrap_or(Duration::ZERO);

    let mut data_in = InputTable::new(spec.strategies.receive_data, data_timeout);
    let mut data_monitors = Vec::new();
    for (port, handle) in &manifest.data_inputs {
        let label = format!("{}->{}.{}", handle.name(), spec.name, port);
        let queue = Arc::new(MonitoredQueue::new(handle.open_ring()?, label, DEFAULT_WINDOW));
        data_monitors.push(queue.clone());
        data_in.bind(port, queue);
    }

    let mut data_out = OutputTable::new(PortPlane::Data);
    for port in &spec.ports.data_outputs {
        data_out.add_port(&port.name, spec.strategies.send_for_data_port(&port.name));
    }
    for (port, handles) in &manifest.data_outputs {
        let strategy = spec.strategies.send_for_data_port(port);
        for handle in handles {
            data_out.connect(port, Arc::new(handle.open_ring()?), strategy);
        }
    }

    let mut meta_in = InputTable::new(spec.strategies.receive_metadata, meta_timeout);
    for (port, handle) in &manifest.metadata_inputs {
        meta_in.bind(port, Arc::new(handle.open_metadata()?));
    }

    let mut meta_out = OutputTable::new(PortPlane::Metadata);
    for port in &spec.ports.metadata_outputs {
        meta_out.add_port(port, spec.strategies.send_metadata);
    }
    for (port, handles) in &manifest.metadata_outputs {
        for handle in handles {
            meta_out.connect(
                port,
                Arc::new(handle.open_metadata()?),
                spec.strategies.send_metadata,
            );
        }
    }

    Ok(Bindings {
        data_in,
        data_monitors,
        data_out,
        meta_in,
        meta_out,
    })
}

fn node_failed(spec: &NodeSpec, message: String) -> VrError {
    VrError::Dag(DagError::NodeFailed {
        node: spec.name.clone(),
        message,
    })
}

fn run_node(
    slot: usize,
    manifest: &NodeManifest,
    control: &ControlBlock,
    registry: &NodeRegistry,
) -> crate::Result<()> {
    let spec = &manifest.spec;
    let mut bindings = bind_queues(manifest)?;
    let mut node = registry
        .create(spec)?
        .map_err(|e| node_failed(spec, format!("construction failed: {:#}", e)))?;

    control.set_state(slot, WorkerState::Ready);
    tracing::debug!(kind = %spec.kind, "ready");
    if !control.wait_for_release() {
        control.set_state(slot, WorkerState::Finished);
        return Ok(());
    }

    let mut ctx = NodeContext::new(&spec.name, &manifest.queues, control);
    if let Err(e) = guarded(|| node.initialize(&mut ctx)) {
        control.set_state(slot, WorkerState::Failed);
        return Err(node_failed(spec, format!("initialize failed: {:#}", e)));
    }
    control.set_state(slot, WorkerState::Running);
    tracing::info!("running");

    let mut profiler = spec.profile.then(Profiler::new);
    let threshold = manifest.fatal_error_threshold;
    let mut consecutive = 0u32;
    let mut fatal = None;

    while !control.stop_requested() {
        let outcome = iterate(node.as_mut(), &mut bindings, &mut ctx, control);
        control.add_iteration(slot, outcome.received, outcome.published);
        ctx.iteration += 1;

        if let Some(p) = profiler.as_mut() {
            p.record(outcome.timings, &bindings.data_monitors);
        }

        if outcome.errors > 0 {
            for _ in 0..outcome.errors {
                control.add_transient_error(slot);
            }
            consecutive += 1;
            if threshold > 0 && consecutive >= threshold {
                fatal = Some(format!(
                    "{} consecutive failing iterations",
                    consecutive
                ));
                break;
            }
        } else {
            consecutive = 0;
        }
    }

    if let Err(e) = guarded(|| node.cleanup(&mut ctx)) {
        tracing::error!("cleanup failed: {:#}", e);
    }

    match fatal {
        Some(message) => {
            tracing::error!("{}; node stopped", message);
            control.set_state(slot, WorkerState::Failed);
            Err(node_failed(spec, message))
        }
        None => {
            tracing::info!(iterations = ctx.iteration, "finished");
            control.set_state(slot, WorkerState::Finished);
            Ok(())
        }
    }
}

struct Outcome {
    received: u64,
    published: u64,
    errors: u32,
    timings: [Duration; 3],
}

fn iterate(
    node: &mut dyn WorkerNode,
    b: &mut Bindings,
    ctx: &mut NodeContext,
    control: &ControlBlock,
) -> Outcome {
    let mut out = Outcome {
        received: 0,
        published: 0,
        errors: 0,
        timings: [Duration::ZERO; 3],
    };

    if !b.meta_in.is_empty() {
        match b.meta_in.receive() {
            Ok(Some(messages)) => {
                out.received += messages.len() as u64;
                match guarded(|| node.process_metadata(messages, ctx)) {
                    Ok(Some(outputs)) if !control.stop_requested() => {
                        match b.meta_out.send(ctx.name, &outputs) {
                            Ok(n) => out.published += n as u64,
                            Err(e) => {
                                tracing::error!("metadata publish failed: {}", e);
                                out.errors += 1;
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("process_metadata failed: {:#}", e);
                        out.errors += 1;
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("metadata receive failed: {}", e);
                out.errors += 1;
            }
        }
    }

    let t0 = Instant::now();
    let inputs = match b.data_in.receive() {
        Ok(inputs) => inputs,
        Err(e) => {
            tracing::error!("data receive failed: {}", e);
            out.errors += 1;
            None
        }
    };
    out.received += inputs.as_ref().map_or(0, |m| m.len() as u64);
    let t1 = Instant::now();

    let result = guarded(|| node.process_data(inputs, ctx));
    let t2 = Instant::now();

    match result {
        // nothing new goes out once stop is set
        Ok(Some(outputs)) if !control.stop_requested() => {
            match b.data_out.send(ctx.name, &outputs) {
                Ok(n) => out.published += n as u64,
                Err(e) => {
                    tracing::error!("data publish failed: {}", e);
                    out.errors += 1;
                }
            }
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("process_data failed: {:#}", e);
            out.errors += 1;
        }
    }

    for (port, message) in ctx.take_outbox() {
        if control.stop_requested() {
            break;
        }
        match b.meta_out.send(ctx.name, &single(&port, message)) {
            Ok(n) => out.published += n as u64,
            Err(e) => {
                tracing::error!("metadata publish failed: {}", e);
                out.errors += 1;
            }
        }
    }

    out.timings = [t1 - t0, t2 - t1, t2.elapsed()];
    out
}

/// Run a hook, turning a panic into an error.
fn guarded<T>(f: impl FnOnce() -> anyhow::Result<T>) -> anyhow::Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(anyhow::anyhow!("panicked: {}", message))
        }
    }
}

const PROFILE_CAPACITY: usize = 256;
const PROFILE_EVERY: Duration = Duration::from_secs(1);

/// Ring of per-iteration timings (receive, work, send), summarised on the
/// `vrloop::profile` target at most once per second.
struct Profiler {
    samples: VecDeque<[Duration; 3]>,
    last_emit: Instant,
}

impl Profiler {
    fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(PROFILE_CAPACITY),
            last_emit: Instant::now(),
        }
    }

    fn record(&mut self, timings: [Duration; 3], inputs: &[Arc<MonitoredQueue<RingBuffer>>]) {
        if self.samples.len() == PROFILE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(timings);
        if self.last_emit.elapsed() < PROFILE_EVERY {
            return;
        }
        self.last_emit = Instant::now();

        let n = self.samples.len().max(1) as f64;
        let mean_us = |k: usize| {
            self.samples.iter().map(|s| s[k].as_secs_f64()).sum::<f64>() / n * 1e6
        };
        let max_work_us = self
            .samples
            .iter()
            .map(|s| s[1].as_secs_f64() * 1e6)
            .fold(0.0, f64::max);
        let in_hz: f64 = inputs.iter().map(|q| q.frequency()).sum();
        tracing::info!(
            target: "vrloop::profile",
            samples = self.samples.len(),
            receive_us = format_args!("{:.1}", mean_us(0)),
            work_us = format_args!("{:.1}", mean_us(1)),
            send_us = format_args!("{:.1}", mean_us(2)),
            max_work_us = format_args!("{:.1}", max_work_us),
            input_hz = format_args!("{:.1}", in_hz),
            "profile"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_catches_panic() {
        let err = guarded::<()>(|| panic!("boom")).unwrap_err();
        assert!(err.to_string().contains("boom"));
        let err = guarded::<()>(|| Err(anyhow::anyhow!("plain"))).unwrap_err();
        assert_eq!(err.to_string(), "plain");
        assert_eq!(guarded(|| Ok(3)).unwrap(), 3);
    }

    #[test]
    fn test_manifest_serde() {
        let manifest = WorkerManifest {
            slot: 2,
            name: "logger".into(),
            control: PathBuf::from("/dev/shm/run/control"),
            log_queue: None,
            log_filter: "info".into(),
            realtime_priority: Some(10),
            role: WorkerRole::Logger(LoggerManifest {
                queue: QueueHandle::Metadata {
                    name: "log".into(),
                    path: PathBuf::from("/dev/shm/run/log.meta"),
                },
                worker_log: PathBuf::from("worker.log"),
                queue_log: PathBuf::from("queue.log"),
            }),
        };
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"role\":\"logger\""));
        let back: WorkerManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
    }
}
