//! DAG-specific error types.

use crate::pipeline::port::PortPlane;
use crate::queue::QueueError;
use thiserror::Error;

/// Errors raised while building, checking, starting or running the DAG.
#[derive(Error, Debug)]
pub enum DagError {
    #[error("Node '{0}' already exists")]
    DuplicateNode(String),

    #[error("Unknown node '{0}'")]
    UnknownNode(String),

    #[error("Unknown node kind '{kind}' for node '{node}'")]
    UnknownKind { node: String, kind: String },

    #[error("Queue '{0}' already exists")]
    DuplicateQueue(String),

    #[error("Unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("Node '{node}' has no {plane:?} port '{port}'")]
    UnknownPort {
        node: String,
        plane: PortPlane,
        port: String,
    },

    #[error("Port name '{port}' collides on node '{node}' ({plane:?})")]
    PortCollision {
        node: String,
        plane: PortPlane,
        port: String,
    },

    #[error("Input port '{port}' of node '{node}' is already bound to queue '{queue}'")]
    InputAlreadyBound {
        node: String,
        port: String,
        queue: String,
    },

    #[error("Queue '{queue}' cannot carry {plane:?} edges")]
    WrongQueueKind { queue: String, plane: PortPlane },

    #[error("Schema mismatch on '{context}': port expects {expected}, queue carries {actual}")]
    SchemaMismatch {
        context: String,
        expected: String,
        actual: String,
    },

    #[error("Cycle detected in data subgraph through: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("Queue '{0}' has no sender")]
    QueueWithoutSender(String),

    #[error("Queue '{0}' has no receiver")]
    QueueWithoutReceiver(String),

    #[error("Too many workers: {count} exceeds the limit of {limit}")]
    TooManyWorkers { count: usize, limit: usize },

    #[error("DAG already started")]
    AlreadyStarted,

    #[error("DAG not started")]
    NotStarted,

    #[error("Failed to spawn worker '{node}': {message}")]
    Spawn { node: String, message: String },

    #[error("Worker '{0}' did not become ready before the startup timeout")]
    StartupTimeout(String),

    #[error("Node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DagError {
    /// Construction errors are raised before any worker runs.
    pub fn is_construction(&self) -> bool {
        !matches!(self, DagError::NodeFailed { .. })
    }
}

pub type DagResult<T> = std::result::Result<T, DagError>;
