//! Node abstraction for the DAG.
//!
//! Three pieces:
//! - **`WorkerNode` trait**: the hooks a node body implements. It runs inside its
//!   own worker process (or thread), single-threaded.
//! - **`NodeSpec`**: the serializable declaration of a node (name, kind, params,
//!   ports, strategies, timeouts). This is what crosses the process boundary.
//! - **`NodeRegistry`**: maps a `kind` to a factory that builds the node body from
//!   its spec inside the worker.

use crate::pipeline::control::ControlBlock;
use crate::pipeline::error::{DagError, DagResult};
use crate::pipeline::packet::{MetaValue, Packet, PortMap};
use crate::pipeline::port::{DataPort, NodePorts};
use crate::pipeline::strategy::{ReceiveStrategy, SendStrategy, Strategies};
use crate::queue::{QueueHandle, Schema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Context passed to node hooks.
pub struct NodeContext<'a> {
    /// Name of the node.
    pub name: &'a str,
    /// Loop iteration counter, starting at 0.
    pub iteration: u64,
    /// Every queue of the DAG by name, for nodes that inspect queues.
    pub queues: &'a BTreeMap<String, QueueHandle>,
    control: &'a ControlBlock,
    outbox: Vec<(String, MetaValue)>,
}

impl<'a> NodeContext<'a> {
    pub fn new(
        name: &'a str,
        queues: &'a BTreeMap<String, QueueHandle>,
        control: &'a ControlBlock,
    ) -> Self {
        Self {
            name,
            iteration: 0,
            queues,
            control,
            outbox: Vec::new(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.control.stop_requested()
    }

    /// Queue a metadata message for `port`, published after the current hook
    /// returns. Lets nodes without metadata inputs (sequencers, monitors) emit.
    pub fn send_metadata(&mut self, port: &str, message: MetaValue) {
        self.outbox.push((port.to_string(), message));
    }

    pub(crate) fn take_outbox(&mut self) -> Vec<(String, MetaValue)> {
        std::mem::take(&mut self.outbox)
    }

    /// Sleep up to `duration`, returning early when stop is requested.
    pub fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop_requested() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            std::thread::sleep(left.min(Duration::from_millis(5)));
        }
    }
}

/// Hooks of a node body.
///
/// `process_data(None)` is called whenever no input arrived within the receive
/// timeout (and on every iteration for nodes without data inputs), so sources
/// produce on their own clock and sinks can do periodic work.
pub trait WorkerNode: Send {
    /// Run once in the worker, before the loop. An error is fatal for the node.
    fn initialize(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Map input port readings to records to publish, keyed by output port.
    /// Missing keys publish nothing.
    fn process_data(
        &mut self,
        inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>>;

    /// Same as `process_data`, for metadata channels. Only called with messages.
    fn process_metadata(
        &mut self,
        _inputs: PortMap<MetaValue>,
        _ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<MetaValue>>> {
        Ok(None)
    }

    /// Run once after the stop flag is set.
    fn cleanup(&mut self, _ctx: &mut NodeContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Serializable declaration of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    /// Registry key used to build the node body.
    pub kind: String,
    #[serde(default)]
    pub params: MetaValue,
    #[serde(default)]
    pub ports: NodePorts,
    #[serde(default)]
    pub strategies: Strategies,
    /// Data receive timeout; the runtime default when `None`.
    #[serde(default)]
    pub receive_data_timeout: Option<Duration>,
    /// Metadata receive timeout; metadata is only checked, never waited on, when `None`.
    #[serde(default)]
    pub receive_metadata_timeout: Option<Duration>,
    #[serde(default)]
    pub profile: bool,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            params: MetaValue::Null,
            ports: NodePorts::default(),
            strategies: Strategies::default(),
            receive_data_timeout: None,
            receive_metadata_timeout: None,
            profile: false,
        }
    }

    pub fn with_params(mut self, params: MetaValue) -> Self {
        self.params = params;
        self
    }

    pub fn data_inputs(mut self, ports: &[&str]) -> Self {
        self.ports
            .data_inputs
            .extend(ports.iter().map(|p| DataPort::new(*p)));
        self
    }

    pub fn data_outputs(mut self, ports: &[&str]) -> Self {
        self.ports
            .data_outputs
            .extend(ports.iter().map(|p| DataPort::new(*p)));
        self
    }

    pub fn typed_input(mut self, port: &str, schema: Schema) -> Self {
        self.ports.data_inputs.push(DataPort::typed(port, schema));
        self
    }

    pub fn typed_output(mut self, port: &str, schema: Schema) -> Self {
        self.ports.data_outputs.push(DataPort::typed(port, schema));
        self
    }

    pub fn metadata_inputs(mut self, ports: &[&str]) -> Self {
        self.ports
            .metadata_inputs
            .extend(ports.iter().map(|p| p.to_string()));
        self
    }

    pub fn metadata_outputs(mut self, ports: &[&str]) -> Self {
        self.ports
            .metadata_outputs
            .extend(ports.iter().map(|p| p.to_string()));
        self
    }

    pub fn receive_data(mut self, strategy: ReceiveStrategy) -> Self {
        self.strategies.receive_data = strategy;
        self
    }

    pub fn send_data(mut self, strategy: SendStrategy) -> Self {
        self.strategies.send_data = strategy;
        self
    }

    pub fn send_port(mut self, port: &str, strategy: SendStrategy) -> Self {
        self.strategies
            .data_port_overrides
            .insert(port.to_string(), strategy);
        self
    }

    pub fn receive_metadata(mut self, strategy: ReceiveStrategy) -> Self {
        self.strategies.receive_metadata = strategy;
        self
    }

    pub fn send_metadata(mut self, strategy: SendStrategy) -> Self {
        self.strategies.send_metadata = strategy;
        self
    }

    pub fn data_timeout(mut self, timeout: Duration) -> Self {
        self.receive_data_timeout = Some(timeout);
        self
    }

    pub fn metadata_timeout(mut self, timeout: Duration) -> Self {
        self.receive_metadata_timeout = Some(timeout);
        self
    }

    pub fn profiled(mut self, enabled: bool) -> Self {
        self.profile = enabled;
        self
    }

    /// Deserialize the whole `params` object into a node configuration struct.
    /// `null` params yield the struct's default.
    pub fn params_as<T: DeserializeOwned + Default>(&self) -> anyhow::Result<T> {
        if self.params.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.params.clone()).map_err(|e| {
            anyhow::anyhow!("invalid params for node '{}' ({}): {}", self.name, self.kind, e)
        })
    }
}

/// Builds a node body from its spec.
pub type NodeFactory = Arc<dyn Fn(&NodeSpec) -> anyhow::Result<Box<dyn WorkerNode>> + Send + Sync>;

/// Kind → factory table shared by the orchestrator and the workers.
#[derive(Clone, Default)]
pub struct NodeRegistry {
    factories: BTreeMap<String, NodeFactory>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in node kind.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        crate::pipeline::nodes::register_builtin(&mut registry);
        registry
    }

    pub fn register<F>(&mut self, kind: &str, factory: F) -> &mut Self
    where
        F: Fn(&NodeSpec) -> anyhow::Result<Box<dyn WorkerNode>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Arc::new(factory));
        self
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.factories.contains_key(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, spec: &NodeSpec) -> DagResult<anyhow::Result<Box<dyn WorkerNode>>> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| DagError::UnknownKind {
                node: spec.name.clone(),
                kind: spec.kind.clone(),
            })?;
        Ok(factory(spec))
    }
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Nop;

    impl WorkerNode for Nop {
        fn process_data(
            &mut self,
            _inputs: Option<PortMap<Packet>>,
            _ctx: &mut NodeContext,
        ) -> anyhow::Result<Option<PortMap<Packet>>> {
            Ok(None)
        }
    }

    #[derive(Deserialize, Default, Debug, PartialEq)]
    #[serde(default)]
    struct Params {
        threshold: u8,
        label: String,
    }

    #[test]
    fn test_spec_builder() {
        let spec = NodeSpec::new("tracker_0", "tracker")
            .data_inputs(&["crop"])
            .data_outputs(&["stimulus", "saver"])
            .metadata_inputs(&["control"])
            .receive_data(ReceiveStrategy::Collect)
            .send_port("saver", SendStrategy::Dispatch)
            .data_timeout(Duration::from_millis(50))
            .profiled(true);
        assert_eq!(spec.ports.data_outputs.len(), 2);
        assert_eq!(spec.strategies.receive_data, ReceiveStrategy::Collect);
        assert_eq!(
            spec.strategies.send_for_data_port("saver"),
            SendStrategy::Dispatch
        );
        assert!(spec.profile);

        let json = serde_json::to_string(&spec).unwrap();
        let back: NodeSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_params_as() {
        let spec = NodeSpec::new("n", "k").with_params(json!({ "threshold": 40 }));
        let p: Params = spec.params_as().unwrap();
        assert_eq!(p.threshold, 40);
        assert_eq!(p.label, "");

        let defaults: Params = NodeSpec::new("n", "k").params_as().unwrap();
        assert_eq!(defaults, Params::default());

        let bad = NodeSpec::new("n", "k").with_params(json!({ "threshold": "high" }));
        assert!(bad.params_as::<Params>().is_err());
    }

    #[test]
    fn test_registry() {
        let mut registry = NodeRegistry::new();
        registry.register("nop", |_spec| Ok(Box::new(Nop)));
        assert!(registry.contains("nop"));
        assert!(registry
            .create(&NodeSpec::new("a", "nop"))
            .unwrap()
            .is_ok());
        assert!(matches!(
            registry.create(&NodeSpec::new("b", "missing")),
            Err(DagError::UnknownKind { .. })
        ));
    }

    #[test]
    fn test_builtin_kinds_registered() {
        let registry = NodeRegistry::with_builtin();
        for kind in [
            "camera",
            "background",
            "crop",
            "tracker",
            "tracking_saver",
            "stimulus",
            "sequencer",
            "video_writer",
            "queue_monitor",
        ] {
            assert!(registry.contains(kind), "missing {}", kind);
        }
    }
}
