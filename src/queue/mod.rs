//! Inter-process queues.
//!
//! Two queue primitives connect the nodes of the DAG:
//!
//! - [`RingBuffer`]: fixed-capacity shared-memory ring of fixed-size slots for
//!   bulk records (frames, crops, tracking). Overwrites the oldest unread slot
//!   when full and counts the loss; the producer never blocks.
//! - [`MetadataQueue`]: unbounded multi-producer multi-consumer FIFO of JSON
//!   messages for low-rate control traffic.
//!
//! Both live in the shared-memory directory of a run and can be re-opened in
//! another process from a serializable [`QueueHandle`]. [`MonitoredQueue`]
//! decorates either one with throughput measurement.
//!
//! ```text
//!  producer ──put──► [ header | slot 0 | slot 1 | … | slot N-1 ] ──get──► consumer
//!                      ▲ head/tail/count/lost under a process-shared mutex
//! ```

pub mod codec;
pub mod metadata;
pub mod monitored;
pub mod ring;
pub mod shm;

pub use codec::Schema;
pub use metadata::MetadataQueue;
pub use monitored::MonitoredQueue;
pub use ring::RingBuffer;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by queue primitives.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Schema mismatch on queue '{queue}': expected {expected}, got {actual}")]
    SchemaMismatch {
        queue: String,
        expected: String,
        actual: String,
    },

    #[error("Shared memory error on {path:?}: {source}")]
    Shm {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Queue '{0}' has an invalid or uninitialised header")]
    Corrupt(String),

    #[error("Synchronisation error on queue '{queue}': {source}")]
    Sync {
        queue: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed record in queue '{queue}': {message}")]
    Decode { queue: String, message: String },

    #[error("Message serialization failed on queue '{queue}': {message}")]
    Serialization { queue: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Read-only counters every queue exposes.
///
/// Counters may be read from any attached process without taking the queue lock.
pub trait QueueStats: Send + Sync {
    fn name(&self) -> &str;

    /// Number of items waiting, as last published (see `t_refresh`).
    fn qsize(&self) -> usize;

    /// `None` for unbounded queues.
    fn capacity(&self) -> Option<usize>;

    /// Items overwritten before being read.
    fn num_lost(&self) -> u64;

    /// Items successfully put.
    fn produced(&self) -> u64;

    /// Items successfully taken.
    fn consumed(&self) -> u64;

    /// Items currently stored, read live rather than from the published size.
    fn in_flight(&self) -> usize {
        self.qsize()
    }
}

/// A typed queue: `put` never blocks, `get` waits at most `timeout`.
pub trait Channel: QueueStats {
    type Item;

    fn put(&self, item: &Self::Item) -> QueueResult<()>;

    /// `Ok(None)` is the timeout sentinel.
    fn get(&self, timeout: Duration) -> QueueResult<Option<Self::Item>>;
}

/// Serializable descriptor used to re-open a queue inside a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueHandle {
    Ring {
        name: String,
        path: PathBuf,
        schema: Schema,
        capacity: usize,
    },
    Metadata {
        name: String,
        path: PathBuf,
    },
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        match self {
            QueueHandle::Ring { name, .. } | QueueHandle::Metadata { name, .. } => name,
        }
    }

    pub fn is_ring(&self) -> bool {
        matches!(self, QueueHandle::Ring { .. })
    }

    /// Schema of a ring queue, `None` for metadata queues.
    pub fn schema(&self) -> Option<&Schema> {
        match self {
            QueueHandle::Ring { schema, .. } => Some(schema),
            QueueHandle::Metadata { .. } => None,
        }
    }

    pub fn open_ring(&self) -> QueueResult<RingBuffer> {
        match self {
            QueueHandle::Ring { .. } => RingBuffer::open(self),
            QueueHandle::Metadata { name, .. } => Err(QueueError::Corrupt(format!(
                "{} is a metadata queue, not a ring buffer",
                name
            ))),
        }
    }

    pub fn open_metadata(&self) -> QueueResult<MetadataQueue> {
        match self {
            QueueHandle::Metadata { .. } => MetadataQueue::open(self),
            QueueHandle::Ring { name, .. } => Err(QueueError::Corrupt(format!(
                "{} is a ring buffer, not a metadata queue",
                name
            ))),
        }
    }

    /// Attach for inspection only (queue monitor).
    pub fn open_stats(&self) -> QueueResult<Arc<dyn QueueStats>> {
        Ok(match self {
            QueueHandle::Ring { .. } => Arc::new(self.open_ring()?),
            QueueHandle::Metadata { .. } => Arc::new(self.open_metadata()?),
        })
    }
}

/// Snapshot of a queue's counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub name: String,
    pub produced: u64,
    pub consumed: u64,
    pub lost: u64,
    pub in_flight: usize,
    pub capacity: Option<usize>,
}

impl QueueSnapshot {
    pub fn of(queue: &dyn QueueStats) -> Self {
        Self {
            name: queue.name().to_string(),
            produced: queue.produced(),
            consumed: queue.consumed(),
            lost: queue.num_lost(),
            in_flight: queue.in_flight(),
            capacity: queue.capacity(),
        }
    }

    /// `produced = consumed + lost + in_flight`.
    pub fn is_balanced(&self) -> bool {
        self.produced == self.consumed + self.lost + self.in_flight as u64
    }
}
