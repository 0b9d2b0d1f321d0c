//! Multi-process processing DAG.
//!
//! Nodes run in their own worker (OS process or thread) and talk only through
//! queues: ring buffers for data, metadata queues for control messages.
//!
//! # Architecture
//!
//! ```text
//! [camera] ──frames──► [background] ──► [crop] ──roi_0──► [tracker_0] ──► [saver_0]
//!                                          └──roi_1──► [tracker_1] ──► [stimulus]
//!                                                                           ▲
//! [sequencer] ─────────────────────────── metadata ─────────────────────────┘
//! ```
//!
//! # Design
//!
//! - **One loop per worker**: metadata, then data; receive → process → send.
//! - **Shared stop flag**: set once in the control block; loops exit at their
//!   next timeout.
//! - **Typed queues**: every ring carries one [`Schema`](crate::queue::Schema),
//!   checked at connect time and again when a worker attaches.
//! - **Pluggable nodes**: a [`NodeRegistry`] maps node kinds to factories.

pub mod builder;
pub mod compiler;
pub mod control;
pub mod dag;
pub mod error;
pub mod id;
pub mod node;
pub mod nodes;
pub mod packet;
pub mod port;
pub mod spawn;
pub mod strategy;
pub mod worker;

pub use builder::DagBuilder;
pub use compiler::{CompiledTopology, TopologyCompiler, TopologyStats};
pub use control::{ControlBlock, WorkerCounters, WorkerState, MAX_WORKERS};
pub use dag::{DagReport, Edge, ProcessingDag, WorkerReport};
pub use error::{DagError, DagResult};
pub use id::{EdgeId, NodeId, QueueId};
pub use node::{NodeContext, NodeFactory, NodeRegistry, NodeSpec, WorkerNode};
pub use packet::{single, MetaValue, Packet, PortMap};
pub use port::{DataPort, NodePorts, PortDirection, PortPlane};
pub use spawn::{run_worker_from_env, WorkerHandle, WORKER_ENV};
pub use strategy::{InputTable, OutputTable, ReceiveStrategy, SendStrategy, Strategies};
pub use worker::{run_worker, WorkerManifest};
