//! # vrloop: real-time processing DAG for closed-loop virtual reality
//!
//! Camera frames flow through background subtraction, per-animal cropping and
//! tracking to CSV writers and a stimulus renderer, with every stage running in
//! its own worker process. Workers exchange records through shared-memory ring
//! buffers that drop the oldest record rather than block, so a slow consumer
//! never stalls the camera.
//!
//! ## Architecture
//!
//! - **Queues** ([`queue`]): fixed-schema ring buffers for data, unbounded
//!   queues for metadata, both attachable from any process
//! - **Pipeline** ([`pipeline`]): nodes, send/receive strategies, the worker
//!   loop, topology checks and the orchestrating [`ProcessingDag`]
//! - **Config** ([`config`]): the settings file and the runtime parameters
//! - **Logging** ([`logging`]): per-worker `tracing` dispatch forwarded to a
//!   single logger worker
//!
//! ## Example
//!
//! ```ignore
//! use vrloop::{DagBuilder, NodeRegistry, RuntimeConfig, Settings};
//!
//! let settings = Settings::load("experiment.toml")?;
//! settings.validate()?;
//! let runtime = RuntimeConfig::from_settings(&settings);
//! let mut dag = DagBuilder::from_settings(&settings, runtime, NodeRegistry::with_builtin())
//!     .build()?;
//! dag.start()?;
//! let report = dag.run(Some(std::time::Duration::from_secs(10)), None)?;
//! println!("{} records lost", report.queues.iter().map(|q| q.lost).sum::<u64>());
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod queue;
pub mod session;
pub mod types;

// Re-export commonly used types
pub use config::{Mode, RuntimeConfig, Settings, SpawnMode};
pub use error::{Result, VrError};
pub use pipeline::{
    DagBuilder, DagError, DagReport, NodeContext, NodeRegistry, NodeSpec, ProcessingDag,
    WorkerNode,
};
pub use queue::{Channel, MetadataQueue, QueueHandle, QueueStats, RingBuffer, Schema};
pub use types::{Crop, Frame, Image, Sample, Tracking, TrackingRecord};
