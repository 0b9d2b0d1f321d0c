//! The processing DAG: topology builder and lifecycle coordinator.
//!
//! ```text
//! add_node / create_*_queue / connect_*     (construction, checked per call)
//!        │
//!      start ── compile topology ── control block ── logger ── node workers
//!        │                                                      │ all Ready
//!        │                                              release together
//!      stop ── stop flag ── join (grace) ── terminate stragglers ── logger stop
//! ```
//!
//! Queues are created by the DAG and owned by it; they outlive every worker
//! and are removed when the DAG is dropped.

use super::compiler::{CompiledTopology, TopologyCompiler};
use super::control::{ControlBlock, WorkerCounters, WorkerState, MAX_WORKERS};
use super::error::{DagError, DagResult};
use super::id::{EdgeId, NodeId, QueueId};
use super::node::{NodeRegistry, NodeSpec};
use super::port::{PortDirection, PortPlane};
use super::spawn::{manifest_dir, JoinOutcome, WorkerHandle};
use super::worker::{LoggerManifest, NodeManifest, WorkerManifest, WorkerRole};
use crate::config::RuntimeConfig;
use crate::queue::{MetadataQueue, QueueHandle, QueueSnapshot, QueueStats, RingBuffer, Schema};
use crossbeam_channel::Receiver;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const LOG_QUEUE: &str = "__log";
const LOGGER_NAME: &str = "logger";

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// One connection: `sender.output` ──queue──► `receiver.input`.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    pub id: EdgeId,
    pub plane: PortPlane,
    pub sender: NodeId,
    pub output: String,
    pub receiver: NodeId,
    pub input: String,
    pub queue: QueueId,
}

enum OwnedQueue {
    Ring(RingBuffer),
    Metadata(MetadataQueue),
}

impl OwnedQueue {
    fn stats(&self) -> &dyn QueueStats {
        match self {
            OwnedQueue::Ring(q) => q,
            OwnedQueue::Metadata(q) => q,
        }
    }
}

struct QueueSlot {
    handle: QueueHandle,
    queue: OwnedQueue,
}

struct Running {
    control: ControlBlock,
    workers: Vec<WorkerHandle>,
    logger: Option<WorkerHandle>,
    // kept alive until the logger has drained it
    _log_queue: Option<MetadataQueue>,
    started: Instant,
}

/// Final state of one worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerReport {
    pub name: String,
    pub state: WorkerState,
    pub iterations: u64,
    pub received: u64,
    pub published: u64,
    pub transient_errors: u64,
    /// Killed (process) or detached (thread) after the grace period.
    pub terminated: bool,
}

impl WorkerReport {
    fn new(name: &str, counters: Option<WorkerCounters>, terminated: bool) -> Self {
        let c = counters.unwrap_or(WorkerCounters {
            state: WorkerState::Pending,
            pid: 0,
            transient_errors: 0,
            iterations: 0,
            received: 0,
            published: 0,
        });
        Self {
            name: name.to_string(),
            state: c.state,
            iterations: c.iterations,
            received: c.received,
            published: c.published,
            transient_errors: c.transient_errors,
            terminated,
        }
    }
}

/// Outcome of a run, returned by [`ProcessingDag::stop`].
#[derive(Debug, Clone, Serialize)]
pub struct DagReport {
    pub duration: Duration,
    pub queues: Vec<QueueSnapshot>,
    /// Node workers in insertion order, then the logger.
    pub workers: Vec<WorkerReport>,
    /// Names of workers terminated after the grace period.
    pub terminated: Vec<String>,
}

impl DagReport {
    pub fn queue(&self, name: &str) -> Option<&QueueSnapshot> {
        self.queues.iter().find(|q| q.name == name)
    }

    pub fn worker(&self, name: &str) -> Option<&WorkerReport> {
        self.workers.iter().find(|w| w.name == name)
    }

    pub fn failed(&self) -> Vec<&WorkerReport> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Failed)
            .collect()
    }

    pub fn is_success(&self) -> bool {
        self.failed().is_empty()
    }
}

/// Topology plus lifecycle of all workers.
pub struct ProcessingDag {
    runtime: RuntimeConfig,
    registry: NodeRegistry,
    run_dir: PathBuf,
    nodes: Vec<NodeSpec>,
    node_index: BTreeMap<String, NodeId>,
    queues: Vec<QueueSlot>,
    queue_index: BTreeMap<String, QueueId>,
    edges: Vec<Edge>,
    running: Option<Running>,
}

impl ProcessingDag {
    /// Empty DAG. Creates the run directory under `runtime.shm_dir`.
    pub fn new(runtime: RuntimeConfig, registry: NodeRegistry) -> DagResult<Self> {
        let run_dir = runtime.shm_dir.join(format!(
            "vrloop-{}-{}",
            std::process::id(),
            RUN_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&run_dir)?;
        tracing::debug!(run_dir = ?run_dir, "DAG created");
        Ok(Self {
            runtime,
            registry,
            run_dir,
            nodes: Vec::new(),
            node_index: BTreeMap::new(),
            queues: Vec::new(),
            queue_index: BTreeMap::new(),
            edges: Vec::new(),
            running: None,
        })
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.node_index.get(name).copied()
    }

    pub fn queue_id(&self, name: &str) -> Option<QueueId> {
        self.queue_index.get(name).copied()
    }

    pub fn queue_handle(&self, name: &str) -> Option<&QueueHandle> {
        self.queue_id(name).map(|id| &self.queues[id.index()].handle)
    }

    pub fn queue_handles(&self) -> impl Iterator<Item = &QueueHandle> {
        self.queues.iter().map(|q| &q.handle)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    fn ensure_not_started(&self) -> DagResult<()> {
        if self.running.is_some() {
            Err(DagError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    // ====== Construction ======

    /// Register a node. Names are unique and the kind must be known.
    pub fn add_node(&mut self, spec: NodeSpec) -> DagResult<NodeId> {
        self.ensure_not_started()?;
        if self.node_index.contains_key(&spec.name) {
            return Err(DagError::DuplicateNode(spec.name));
        }
        if !self.registry.contains(&spec.kind) {
            return Err(DagError::UnknownKind {
                node: spec.name,
                kind: spec.kind,
            });
        }
        let id = NodeId(self.nodes.len() as u32);
        self.node_index.insert(spec.name.clone(), id);
        self.nodes.push(spec);
        Ok(id)
    }

    fn insert_queue(&mut self, name: &str, handle: QueueHandle, queue: OwnedQueue) -> QueueId {
        let id = QueueId(self.queues.len() as u32);
        self.queue_index.insert(name.to_string(), id);
        self.queues.push(QueueSlot { handle, queue });
        id
    }

    fn check_queue_name(&self, name: &str) -> DagResult<()> {
        self.ensure_not_started()?;
        if self.queue_index.contains_key(name) || name == LOG_QUEUE {
            return Err(DagError::DuplicateQueue(name.to_string()));
        }
        Ok(())
    }

    /// Create a ring buffer queue for data edges.
    pub fn create_ring_queue(
        &mut self,
        name: &str,
        schema: Schema,
        capacity: usize,
    ) -> DagResult<QueueId> {
        self.check_queue_name(name)?;
        let ring = RingBuffer::create(
            &self.run_dir,
            name,
            schema,
            capacity,
            self.runtime.queue_refresh,
        )?;
        let handle = ring.handle();
        Ok(self.insert_queue(name, handle, OwnedQueue::Ring(ring)))
    }

    /// Create an unbounded queue for metadata edges.
    pub fn create_metadata_queue(&mut self, name: &str) -> DagResult<QueueId> {
        self.check_queue_name(name)?;
        let queue = MetadataQueue::create(&self.run_dir, name)?;
        let handle = queue.handle();
        Ok(self.insert_queue(name, handle, OwnedQueue::Metadata(queue)))
    }

    /// Data edge using the same port name on both ends.
    pub fn connect_data(
        &mut self,
        sender: &str,
        receiver: &str,
        queue: &str,
        port: &str,
    ) -> DagResult<EdgeId> {
        self.connect_data_ports(sender, port, receiver, port, queue)
    }

    /// Data edge `sender.output ──queue──► receiver.input`.
    pub fn connect_data_ports(
        &mut self,
        sender: &str,
        output: &str,
        receiver: &str,
        input: &str,
        queue: &str,
    ) -> DagResult<EdgeId> {
        self.connect(PortPlane::Data, sender, output, receiver, input, queue)
    }

    /// Metadata edge using the same port name on both ends.
    pub fn connect_metadata(
        &mut self,
        sender: &str,
        receiver: &str,
        queue: &str,
        port: &str,
    ) -> DagResult<EdgeId> {
        self.connect_metadata_ports(sender, port, receiver, port, queue)
    }

    pub fn connect_metadata_ports(
        &mut self,
        sender: &str,
        output: &str,
        receiver: &str,
        input: &str,
        queue: &str,
    ) -> DagResult<EdgeId> {
        self.connect(PortPlane::Metadata, sender, output, receiver, input, queue)
    }

    fn connect(
        &mut self,
        plane: PortPlane,
        sender: &str,
        output: &str,
        receiver: &str,
        input: &str,
        queue: &str,
    ) -> DagResult<EdgeId> {
        self.ensure_not_started()?;
        let sender_id = self
            .node_id(sender)
            .ok_or_else(|| DagError::UnknownNode(sender.to_string()))?;
        let receiver_id = self
            .node_id(receiver)
            .ok_or_else(|| DagError::UnknownNode(receiver.to_string()))?;
        let queue_id = self
            .queue_id(queue)
            .ok_or_else(|| DagError::UnknownQueue(queue.to_string()))?;
        let handle = &self.queues[queue_id.index()].handle;

        if handle.is_ring() != (plane == PortPlane::Data) {
            return Err(DagError::WrongQueueKind {
                queue: queue.to_string(),
                plane,
            });
        }

        for (node, port, direction) in [
            (sender_id, output, PortDirection::Output),
            (receiver_id, input, PortDirection::Input),
        ] {
            let spec = &self.nodes[node.index()];
            if !spec.ports.has(plane, direction, port) {
                return Err(DagError::UnknownPort {
                    node: spec.name.clone(),
                    plane,
                    port: port.to_string(),
                });
            }
            if let (Some(declared), Some(carried)) = (
                spec.ports
                    .data_port(direction, port)
                    .and_then(|p| p.schema.as_ref()),
                handle.schema(),
            ) {
                if declared != carried {
                    return Err(DagError::SchemaMismatch {
                        context: format!("{}.{} via {}", spec.name, port, queue),
                        expected: declared.to_string(),
                        actual: carried.to_string(),
                    });
                }
            }
        }

        if let Some(bound) = self.edges.iter().find(|e| {
            e.plane == plane && e.receiver == receiver_id && e.input == input && e.queue != queue_id
        }) {
            return Err(DagError::InputAlreadyBound {
                node: receiver.to_string(),
                port: input.to_string(),
                queue: self.queues[bound.queue.index()].handle.name().to_string(),
            });
        }

        let id = EdgeId(self.edges.len() as u32);
        self.edges.push(Edge {
            id,
            plane,
            sender: sender_id,
            output: output.to_string(),
            receiver: receiver_id,
            input: input.to_string(),
            queue: queue_id,
        });
        Ok(id)
    }

    /// Run the topology checks without starting anything.
    pub fn check(&self) -> DagResult<CompiledTopology> {
        let handles: Vec<QueueHandle> = self.queues.iter().map(|q| q.handle.clone()).collect();
        TopologyCompiler::compile(&self.nodes, &handles, &self.edges)
    }

    // ====== Lifecycle ======

    fn node_manifest(&self, id: NodeId) -> NodeManifest {
        let mut data_inputs = BTreeMap::new();
        let mut data_outputs: BTreeMap<String, Vec<QueueHandle>> = BTreeMap::new();
        let mut metadata_inputs = BTreeMap::new();
        let mut metadata_outputs: BTreeMap<String, Vec<QueueHandle>> = BTreeMap::new();

        for edge in &self.edges {
            let handle = &self.queues[edge.queue.index()].handle;
            let (inputs, outputs) = match edge.plane {
                PortPlane::Data => (&mut data_inputs, &mut data_outputs),
                PortPlane::Metadata => (&mut metadata_inputs, &mut metadata_outputs),
            };
            if edge.receiver == id {
                inputs.insert(edge.input.clone(), handle.clone());
            }
            if edge.sender == id {
                let list = outputs.entry(edge.output.clone()).or_default();
                if !list.contains(handle) {
                    list.push(handle.clone());
                }
            }
        }

        NodeManifest {
            spec: self.nodes[id.index()].clone(),
            data_inputs,
            data_outputs,
            metadata_inputs,
            metadata_outputs,
            queues: self
                .queues
                .iter()
                .map(|q| (q.handle.name().to_string(), q.handle.clone()))
                .collect(),
            default_timeout: self.runtime.default_timeout,
            fatal_error_threshold: self.runtime.fatal_error_threshold,
        }
    }

    fn manifest(
        &self,
        slot: usize,
        name: &str,
        log_queue: Option<&QueueHandle>,
        role: WorkerRole,
    ) -> WorkerManifest {
        WorkerManifest {
            slot,
            name: name.to_string(),
            control: self.run_dir.join("control"),
            log_queue: log_queue.cloned(),
            log_filter: self.runtime.log_filter.clone(),
            realtime_priority: self.runtime.realtime_priority,
            role,
        }
    }

    /// Check the topology, spawn the logger and every node worker, wait until
    /// all are ready and release them together. Returns once released.
    pub fn start(&mut self) -> DagResult<()> {
        self.ensure_not_started()?;
        let compiled = self.check()?;
        let count = self.nodes.len() + 1;
        if count > MAX_WORKERS {
            return Err(DagError::TooManyWorkers {
                count,
                limit: MAX_WORKERS,
            });
        }

        let control = ControlBlock::create(&self.run_dir.join("control"))?;
        let manifests = manifest_dir(&self.run_dir);
        let logger_slot = self.nodes.len();

        let mut running = Running {
            control,
            workers: Vec::new(),
            logger: None,
            _log_queue: None,
            started: Instant::now(),
        };

        let log_handle = match self.runtime.logs.clone() {
            Some(targets) => {
                let queue = MetadataQueue::create(&self.run_dir, LOG_QUEUE)?;
                let handle = queue.handle();
                let manifest = self.manifest(
                    logger_slot,
                    LOGGER_NAME,
                    None,
                    WorkerRole::Logger(LoggerManifest {
                        queue: handle.clone(),
                        worker_log: targets.worker_log,
                        queue_log: targets.queue_log,
                    }),
                );
                running._log_queue = Some(queue);
                running.logger = Some(WorkerHandle::spawn(
                    manifest,
                    &self.runtime,
                    &self.registry,
                    &manifests,
                )?);
                let late = running.control.wait_states(
                    &[logger_slot],
                    self.runtime.startup_timeout,
                    |s| s == WorkerState::Running || s.is_terminal(),
                );
                if !late.is_empty() || running.control.state(logger_slot) == WorkerState::Failed {
                    self.running = Some(running);
                    let _ = self.stop();
                    return Err(DagError::StartupTimeout(LOGGER_NAME.to_string()));
                }
                Some(handle)
            }
            None => None,
        };

        self.running = Some(running);
        for &id in &compiled.order {
            let spec = &self.nodes[id.index()];
            let manifest = self.manifest(
                id.index(),
                &spec.name,
                log_handle.as_ref(),
                WorkerRole::Node(self.node_manifest(id)),
            );
            match WorkerHandle::spawn(manifest, &self.runtime, &self.registry, &manifests) {
                Ok(handle) => {
                    if let Some(r) = self.running.as_mut() {
                        r.workers.push(handle);
                    }
                }
                Err(e) => {
                    let _ = self.stop();
                    return Err(e);
                }
            }
        }

        let slots: Vec<usize> = (0..self.nodes.len()).collect();
        let (late, failed) = match &self.running {
            Some(r) => {
                let late = r.control.wait_states(&slots, self.runtime.startup_timeout, |s| {
                    s == WorkerState::Ready || s.is_terminal()
                });
                let failed = slots
                    .iter()
                    .copied()
                    .find(|&s| r.control.state(s) == WorkerState::Failed);
                (late, failed)
            }
            None => return Err(DagError::NotStarted),
        };

        if let Some(slot) = failed {
            let name = self.nodes[slot].name.clone();
            let _ = self.stop();
            return Err(DagError::NodeFailed {
                node: name,
                message: "failed during startup".to_string(),
            });
        }
        if let Some(&slot) = late.first() {
            let name = self.nodes[slot].name.clone();
            let _ = self.stop();
            return Err(DagError::StartupTimeout(name));
        }

        if let Some(r) = &self.running {
            r.control.release();
        }
        tracing::info!(
            nodes = compiled.stats.nodes,
            queues = compiled.stats.queues,
            data_edges = compiled.stats.data_edges,
            metadata_edges = compiled.stats.metadata_edges,
            "DAG started"
        );
        Ok(())
    }

    /// Name of the first node worker that failed, if any.
    pub fn failed_node(&self) -> Option<&str> {
        let r = self.running.as_ref()?;
        (0..self.nodes.len())
            .find(|&s| r.control.state(s) == WorkerState::Failed)
            .map(|s| self.nodes[s].name.as_str())
    }

    /// Live counters of a node worker.
    pub fn worker_counters(&self, name: &str) -> Option<WorkerCounters> {
        let id = self.node_id(name)?;
        self.running.as_ref()?.control.counters(id.index())
    }

    pub fn queue_snapshots(&self) -> Vec<QueueSnapshot> {
        self.queues
            .iter()
            .map(|q| QueueSnapshot::of(q.queue.stats()))
            .collect()
    }

    /// Set the stop flag, join every node worker within the grace period,
    /// terminate stragglers, then stop the logger.
    pub fn stop(&mut self) -> DagResult<DagReport> {
        let mut running = self.running.take().ok_or(DagError::NotStarted)?;
        running.control.request_stop();

        let deadline = Instant::now() + self.runtime.grace_period;
        let mut terminated = Vec::new();
        let mut reports = Vec::new();
        for (worker, slot) in running.workers.iter_mut().zip(self.spawn_slots()) {
            let left = deadline.saturating_duration_since(Instant::now());
            let killed = match worker.join(left) {
                JoinOutcome::Exited(ok) => {
                    mark_if_crashed(&running.control, slot, worker.name(), ok);
                    false
                }
                JoinOutcome::TimedOut => {
                    worker.terminate();
                    terminated.push(worker.name().to_string());
                    true
                }
            };
            reports.push(WorkerReport::new(
                worker.name(),
                running.control.counters(slot),
                killed,
            ));
        }
        reports.sort_by_key(|r| self.node_id(&r.name).map(|id| id.index()));

        running.control.request_logger_stop();
        if let Some(logger) = running.logger.as_mut() {
            let killed = match logger.join(self.runtime.grace_period) {
                JoinOutcome::Exited(ok) => {
                    mark_if_crashed(&running.control, self.nodes.len(), LOGGER_NAME, ok);
                    false
                }
                JoinOutcome::TimedOut => {
                    logger.terminate();
                    terminated.push(LOGGER_NAME.to_string());
                    true
                }
            };
            reports.push(WorkerReport::new(
                LOGGER_NAME,
                running.control.counters(self.nodes.len()),
                killed,
            ));
        }

        let report = DagReport {
            duration: running.started.elapsed(),
            queues: self.queue_snapshots(),
            workers: reports,
            terminated,
        };
        for q in &report.queues {
            tracing::debug!(
                target: "vrloop::queue",
                queue = %q.name,
                produced = q.produced,
                consumed = q.consumed,
                lost = q.lost,
                in_flight = q.in_flight,
                "final queue counters"
            );
        }
        tracing::info!(
            duration_ms = report.duration.as_millis() as u64,
            failed = report.failed().len(),
            terminated = report.terminated.len(),
            "DAG stopped"
        );
        Ok(report)
    }

    /// First node worker that ended without reaching a terminal state, e.g. a
    /// process killed by a signal. Its slot is marked `Failed`.
    fn exited_node(&mut self) -> Option<String> {
        let slots = self.spawn_slots();
        let r = self.running.as_mut()?;
        for (worker, slot) in r.workers.iter_mut().zip(slots) {
            if let Some(ok) = worker.try_exited() {
                if mark_if_crashed(&r.control, slot, worker.name(), ok) {
                    return Some(worker.name().to_string());
                }
            }
        }
        None
    }

    /// Slots of node workers in spawn (topological) order.
    fn spawn_slots(&self) -> Vec<usize> {
        self.check()
            .map(|c| c.order.iter().map(|id| id.index()).collect())
            .unwrap_or_else(|_| (0..self.nodes.len()).collect())
    }

    /// Start if needed, then block until `limit` elapses, `interrupt` fires or
    /// a node fails; then stop.
    pub fn run(
        &mut self,
        limit: Option<Duration>,
        interrupt: Option<&Receiver<()>>,
    ) -> DagResult<DagReport> {
        if self.running.is_none() {
            self.start()?;
        }
        let started = Instant::now();
        let tick = Duration::from_millis(20);
        loop {
            if let Some(node) = self.exited_node() {
                tracing::error!(node = %node, "worker exited unexpectedly; stopping DAG");
                break;
            }
            if let Some(node) = self.failed_node() {
                tracing::error!(node, "node failed; stopping DAG");
                break;
            }
            if limit.is_some_and(|l| started.elapsed() >= l) {
                break;
            }
            match interrupt {
                Some(rx) => {
                    if rx.recv_timeout(tick).is_ok() {
                        tracing::info!("interrupted; stopping DAG");
                        break;
                    }
                }
                None => std::thread::sleep(tick),
            }
        }
        self.stop()
    }
}

/// Mark `slot` as `Failed` when its worker exited unsuccessfully or without
/// recording a terminal state. Returns whether the slot was changed.
fn mark_if_crashed(control: &ControlBlock, slot: usize, name: &str, ok: bool) -> bool {
    let state = control.state(slot);
    if state == WorkerState::Failed || (ok && state.is_terminal()) {
        return false;
    }
    tracing::error!(worker = %name, state = ?state, success = ok, "worker exited abnormally");
    control.set_state(slot, WorkerState::Failed);
    true
}

impl Drop for ProcessingDag {
    fn drop(&mut self) {
        if self.running.is_some() {
            let _ = self.stop();
        }
        self.queues.clear();
        let _ = std::fs::remove_dir_all(&self.run_dir);
    }
}

impl std::fmt::Debug for ProcessingDag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingDag")
            .field("run_dir", &self.run_dir)
            .field("nodes", &self.nodes.len())
            .field("queues", &self.queues.len())
            .field("edges", &self.edges.len())
            .field("running", &self.running.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::node::{NodeContext, WorkerNode};
    use crate::pipeline::packet::{Packet, PortMap};

    struct Nop;

    impl WorkerNode for Nop {
        fn process_data(
            &mut self,
            _inputs: Option<PortMap<Packet>>,
            ctx: &mut NodeContext,
        ) -> anyhow::Result<Option<PortMap<Packet>>> {
            ctx.sleep(Duration::from_millis(1));
            Ok(None)
        }
    }

    fn dag() -> (tempfile::TempDir, ProcessingDag) {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = NodeRegistry::new();
        registry.register("nop", |_| Ok(Box::new(Nop)));
        let runtime = RuntimeConfig::threaded().with_shm_dir(dir.path());
        (dir, ProcessingDag::new(runtime, registry).unwrap())
    }

    #[test]
    fn test_duplicate_and_unknown_nodes() {
        let (_dir, mut dag) = dag();
        dag.add_node(NodeSpec::new("a", "nop")).unwrap();
        assert!(matches!(
            dag.add_node(NodeSpec::new("a", "nop")),
            Err(DagError::DuplicateNode(_))
        ));
        assert!(matches!(
            dag.add_node(NodeSpec::new("b", "missing")),
            Err(DagError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_connect_checks() {
        let (_dir, mut dag) = dag();
        dag.add_node(NodeSpec::new("src", "nop").typed_output("out", Schema::Sample))
            .unwrap();
        dag.add_node(NodeSpec::new("dst", "nop").data_inputs(&["in"]).metadata_inputs(&["ctl"]))
            .unwrap();
        dag.create_ring_queue("q", Schema::Sample, 8).unwrap();
        dag.create_ring_queue("frames", Schema::frame(4, 4, crate::types::ElementType::U8), 2)
            .unwrap();
        dag.create_metadata_queue("m").unwrap();

        assert!(matches!(
            dag.connect_data_ports("src", "nope", "dst", "in", "q"),
            Err(DagError::UnknownPort { .. })
        ));
        assert!(matches!(
            dag.connect_data_ports("src", "out", "dst", "in", "m"),
            Err(DagError::WrongQueueKind { .. })
        ));
        assert!(matches!(
            dag.connect_data_ports("src", "out", "dst", "in", "frames"),
            Err(DagError::SchemaMismatch { .. })
        ));
        dag.connect_data_ports("src", "out", "dst", "in", "q").unwrap();
        assert!(matches!(
            dag.connect_data_ports("src", "out", "dst", "in", "other"),
            Err(DagError::UnknownQueue(_))
        ));
        assert!(matches!(
            dag.create_ring_queue("q", Schema::Sample, 8),
            Err(DagError::DuplicateQueue(_))
        ));
    }

    #[test]
    fn test_input_bound_once() {
        let (_dir, mut dag) = dag();
        dag.add_node(NodeSpec::new("a", "nop").data_outputs(&["out"])).unwrap();
        dag.add_node(NodeSpec::new("b", "nop").data_outputs(&["out"])).unwrap();
        dag.add_node(NodeSpec::new("c", "nop").data_inputs(&["in"])).unwrap();
        dag.create_ring_queue("q1", Schema::Sample, 4).unwrap();
        dag.create_ring_queue("q2", Schema::Sample, 4).unwrap();
        dag.connect_data_ports("a", "out", "c", "in", "q1").unwrap();
        // fan-in through the same queue is fine
        dag.connect_data_ports("b", "out", "c", "in", "q1").unwrap();
        assert!(matches!(
            dag.connect_data_ports("b", "out", "c", "in", "q2"),
            Err(DagError::InputAlreadyBound { .. })
        ));
    }

    #[test]
    fn test_start_stop_isolated_node() {
        let (_dir, mut dag) = dag();
        dag.add_node(NodeSpec::new("alone", "nop")).unwrap();
        dag.start().unwrap();
        assert!(matches!(dag.start(), Err(DagError::AlreadyStarted)));
        assert!(matches!(
            dag.add_node(NodeSpec::new("late", "nop")),
            Err(DagError::AlreadyStarted)
        ));
        std::thread::sleep(Duration::from_millis(30));
        let report = dag.stop().unwrap();
        assert!(report.is_success());
        let w = report.worker("alone").unwrap();
        assert_eq!(w.state, WorkerState::Finished);
        assert!(w.iterations > 0);
        assert!(report.terminated.is_empty());
        assert!(matches!(dag.stop(), Err(DagError::NotStarted)));
    }

    #[test]
    fn test_abnormal_exit_marks_worker_failed() {
        let dir = tempfile::tempdir().unwrap();
        let control = ControlBlock::create(&dir.path().join("control")).unwrap();

        control.set_state(0, WorkerState::Running);
        assert!(mark_if_crashed(&control, 0, "killed", false));
        assert_eq!(control.state(0), WorkerState::Failed);
        // already failed: reported once
        assert!(!mark_if_crashed(&control, 0, "killed", false));

        control.set_state(1, WorkerState::Finished);
        assert!(!mark_if_crashed(&control, 1, "clean", true));
        assert_eq!(control.state(1), WorkerState::Finished);
        assert!(mark_if_crashed(&control, 1, "bad-exit", false));

        control.set_state(2, WorkerState::Running);
        assert!(mark_if_crashed(&control, 2, "vanished", true));
        assert_eq!(control.state(2), WorkerState::Failed);
    }

    #[test]
    fn test_run_dir_removed_on_drop() {
        let (_dir, dag) = dag();
        let run_dir = dag.run_dir().to_path_buf();
        assert!(run_dir.is_dir());
        drop(dag);
        assert!(!run_dir.exists());
    }
}
