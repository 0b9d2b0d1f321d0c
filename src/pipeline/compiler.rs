use super::dag::Edge;
use super::error::{DagError, DagResult};
use super::id::NodeId;
use super::node::NodeSpec;
use super::port::PortPlane;
use crate::queue::QueueHandle;
use serde::Serialize;
use std::collections::VecDeque;

/// Result of checking a DAG topology before start.
#[derive(Debug, Clone)]
pub struct CompiledTopology {
    /// Nodes in topological order of the data subgraph.
    pub order: Vec<NodeId>,

    pub stats: TopologyStats,
}

/// Statistics about the checked topology
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TopologyStats {
    pub nodes: usize,
    pub queues: usize,
    pub data_edges: usize,
    pub metadata_edges: usize,

    /// Nodes declaring no data input port
    pub sources: usize,

    /// Nodes declaring no data output port
    pub sinks: usize,

    /// Nodes with no data edge at all (e.g. a queue monitor)
    pub isolated: usize,

    /// Check time in microseconds
    pub compile_time_us: u64,
}

/// Checks a DAG before any worker is spawned.
pub struct TopologyCompiler;

impl TopologyCompiler {
    /// Verify the topology and order its nodes.
    ///
    /// Checks, in order:
    /// - no port name collides with another on the same node (per plane);
    /// - every queue has at least one sender and one receiver;
    /// - the data subgraph has no cycle. The metadata subgraph may.
    pub fn compile(
        nodes: &[NodeSpec],
        queues: &[QueueHandle],
        edges: &[Edge],
    ) -> DagResult<CompiledTopology> {
        let start_time = std::time::Instant::now();

        Self::check_ports(nodes)?;
        Self::check_queue_endpoints(queues, edges)?;

        let order = Self::topological_sort(nodes, edges).map_err(|cycle| {
            DagError::CycleDetected(cycle.iter().map(|&i| nodes[i].name.clone()).collect())
        })?;

        let n = nodes.len();
        let mut touched = vec![false; n];
        for edge in edges.iter().filter(|e| e.plane == PortPlane::Data) {
            touched[edge.sender.index()] = true;
            touched[edge.receiver.index()] = true;
        }

        let stats = TopologyStats {
            nodes: n,
            queues: queues.len(),
            data_edges: edges.iter().filter(|e| e.plane == PortPlane::Data).count(),
            metadata_edges: edges
                .iter()
                .filter(|e| e.plane == PortPlane::Metadata)
                .count(),
            sources: nodes
                .iter()
                .filter(|s| s.ports.data_inputs.is_empty())
                .count(),
            sinks: nodes
                .iter()
                .filter(|s| s.ports.data_outputs.is_empty())
                .count(),
            isolated: touched.iter().filter(|t| !**t).count(),
            compile_time_us: start_time.elapsed().as_micros() as u64,
        };

        Ok(CompiledTopology {
            order: order.into_iter().map(|i| NodeId(i as u32)).collect(),
            stats,
        })
    }

    fn check_ports(nodes: &[NodeSpec]) -> DagResult<()> {
        for spec in nodes {
            if let Some((plane, port)) = spec.ports.collisions().into_iter().next() {
                return Err(DagError::PortCollision {
                    node: spec.name.clone(),
                    plane,
                    port,
                });
            }
        }
        Ok(())
    }

    fn check_queue_endpoints(queues: &[QueueHandle], edges: &[Edge]) -> DagResult<()> {
        let mut has_sender = vec![false; queues.len()];
        let mut has_receiver = vec![false; queues.len()];
        for edge in edges {
            let q = edge.queue.index();
            if q < queues.len() {
                has_sender[q] = true;
                has_receiver[q] = true;
            }
        }
        for (i, queue) in queues.iter().enumerate() {
            if !has_sender[i] {
                return Err(DagError::QueueWithoutSender(queue.name().to_string()));
            }
            if !has_receiver[i] {
                return Err(DagError::QueueWithoutReceiver(queue.name().to_string()));
            }
        }
        Ok(())
    }

    /// Kahn's algorithm over the data edges. On a cycle, returns the nodes that
    /// could not be ordered.
    fn topological_sort(nodes: &[NodeSpec], edges: &[Edge]) -> Result<Vec<usize>, Vec<usize>> {
        let n = nodes.len();
        let mut adj = vec![Vec::new(); n];
        let mut in_degree = vec![0usize; n];

        for edge in edges.iter().filter(|e| e.plane == PortPlane::Data) {
            let from = edge.sender.index();
            let to = edge.receiver.index();
            if from >= n || to >= n {
                continue;
            }
            adj[from].push(to);
            in_degree[to] += 1;
        }

        let mut queue: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
        let mut result = Vec::with_capacity(n);

        while let Some(node) = queue.pop_front() {
            result.push(node);
            for &neighbor in &adj[node] {
                in_degree[neighbor] -= 1;
                if in_degree[neighbor] == 0 {
                    queue.push_back(neighbor);
                }
            }
        }

        if result.len() == n {
            Ok(result)
        } else {
            Err((0..n).filter(|&i| in_degree[i] > 0).collect())
        }
    }
}
