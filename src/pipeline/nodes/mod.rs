//! Built-in node kinds.
//!
//! Each node reads its configuration from the `params` of its [`NodeSpec`].
//! Hardware and rendering back-ends stay outside the crate and plug in through
//! [`FrameSource`], [`Tracker`], [`StimulusRenderer`] and [`FrameEncoder`].

pub mod background;
pub mod camera;
pub mod crop;
pub mod pgm;
pub mod queue_monitor;
pub mod sequencer;
pub mod stimulus;
pub mod tracker;
pub mod tracking_saver;
pub mod video_writer;

pub use background::{BackgroundParams, BackgroundSubNode};
pub use camera::{CameraNode, CameraParams, FrameSource, ImageSequenceCamera, SyntheticCamera};
pub use crop::{roi_port, CropNode, CropParams};
pub use queue_monitor::{QueueMonitorNode, QueueMonitorParams, QueueReport};
pub use sequencer::{SequencerNode, SequencerParams};
pub use stimulus::{
    animal_port, NullRenderer, StimulusCommand, StimulusNode, StimulusParams, StimulusRenderer,
};
pub use tracker::{MomentTracker, Tracker, TrackerNode, TrackerParams};
pub use tracking_saver::{csv_header, format_row, TrackingSaverNode, TrackingSaverParams};
pub use video_writer::{
    FrameEncoder, PgmSequenceEncoder, RawVideoEncoder, VideoWriterNode, VideoWriterParams,
};

use crate::pipeline::node::{NodeRegistry, NodeSpec, WorkerNode};

pub const CAMERA: &str = "camera";
pub const BACKGROUND: &str = "background";
pub const CROP: &str = "crop";
pub const TRACKER: &str = "tracker";
pub const TRACKING_SAVER: &str = "tracking_saver";
pub const STIMULUS: &str = "stimulus";
pub const SEQUENCER: &str = "sequencer";
pub const VIDEO_WRITER: &str = "video_writer";
pub const QUEUE_MONITOR: &str = "queue_monitor";

fn boxed<N, F>(
    build: F,
) -> impl Fn(&NodeSpec) -> anyhow::Result<Box<dyn WorkerNode>> + Send + Sync + 'static
where
    N: WorkerNode + 'static,
    F: Fn(&NodeSpec) -> anyhow::Result<N> + Send + Sync + 'static,
{
    move |spec| Ok(Box::new(build(spec)?) as Box<dyn WorkerNode>)
}

/// Register every built-in kind.
pub fn register_builtin(registry: &mut NodeRegistry) {
    registry
        .register(CAMERA, boxed(CameraNode::from_spec))
        .register(BACKGROUND, boxed(BackgroundSubNode::from_spec))
        .register(CROP, boxed(CropNode::from_spec))
        .register(TRACKER, boxed(TrackerNode::from_spec))
        .register(TRACKING_SAVER, boxed(TrackingSaverNode::from_spec))
        .register(STIMULUS, boxed(StimulusNode::from_spec))
        .register(SEQUENCER, boxed(SequencerNode::from_spec))
        .register(VIDEO_WRITER, boxed(VideoWriterNode::from_spec))
        .register(QUEUE_MONITOR, boxed(QueueMonitorNode::from_spec));
}
