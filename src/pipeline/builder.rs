//! Standard topologies assembled from the settings file.
//!
//! ```text
//! tracking-only   camera ─► background ─► crop ─► tracker_k ─► saver_k
//! closed-loop     … tracker_k ─► saver_k
//!                           └──► stimulus ◄── sequencer (metadata)
//! open-loop       tracking-only + sequencer ─► stimulus (metadata only)
//! video-recording camera ─► video_writer
//! ```
//!
//! `main.record` adds the `camera ─► video_writer` branch to any mode. With
//! `settings.tracking.workers_per_animal > 1` each animal's crops are
//! dispatched round-robin over a pool of trackers that share one output queue.
//! A queue monitor watches every queue.

use crate::config::{CameraSource, Mode, RuntimeConfig, Settings};
use crate::error::{Result, VrError};
use crate::pipeline::dag::ProcessingDag;
use crate::pipeline::node::{NodeRegistry, NodeSpec};
use crate::pipeline::nodes::{
    self, animal_port, roi_port, BackgroundParams, CameraParams, CropParams, ImageSequenceCamera,
    QueueMonitorParams, SequencerParams, StimulusParams, TrackerParams, TrackingSaverParams,
    VideoWriterParams,
};
use crate::pipeline::strategy::{ReceiveStrategy, SendStrategy};
use crate::queue::Schema;
use crate::types::ElementType;
use serde::Serialize;

pub const CAMERA: &str = "camera";
pub const BACKGROUND: &str = "background";
pub const CROP: &str = "crop";
pub const STIMULUS: &str = "stimulus";
pub const SEQUENCER: &str = "sequencer";
pub const VIDEO_WRITER: &str = "video_writer";
pub const QUEUE_MONITOR: &str = "queue_monitor";

pub fn tracker_name(animal: usize, worker: usize, pool: usize) -> String {
    if pool == 1 {
        format!("tracker_{}", animal)
    } else {
        format!("tracker_{}_{}", animal, worker)
    }
}

pub fn saver_name(animal: usize) -> String {
    format!("saver_{}", animal)
}

fn params<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

/// Builds a [`ProcessingDag`] for `main.mode`.
pub struct DagBuilder<'a> {
    settings: &'a Settings,
    runtime: RuntimeConfig,
    registry: NodeRegistry,
    queue_monitor: bool,
    max_frames: Option<u64>,
}

impl<'a> DagBuilder<'a> {
    pub fn from_settings(
        settings: &'a Settings,
        runtime: RuntimeConfig,
        registry: NodeRegistry,
    ) -> Self {
        Self {
            settings,
            runtime,
            registry,
            queue_monitor: true,
            max_frames: None,
        }
    }

    pub fn with_queue_monitor(mut self, enabled: bool) -> Self {
        self.queue_monitor = enabled;
        self
    }

    /// Stop the camera after `max_frames` frames.
    pub fn with_max_frames(mut self, max_frames: Option<u64>) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn build(self) -> Result<ProcessingDag> {
        let s = self.settings;
        let mut dag = ProcessingDag::new(self.runtime.clone(), self.registry.clone())?;

        let camera_schema = self.camera_schema()?;
        self.add_camera(&mut dag, camera_schema.clone())?;

        // trackers connect to the stimulus node, so it goes first
        if matches!(s.main.mode, Mode::ClosedLoop | Mode::OpenLoop) {
            self.add_stimulus(&mut dag, s.main.mode == Mode::ClosedLoop)?;
        }
        if s.main.mode != Mode::VideoRecording {
            self.add_tracking(&mut dag, &camera_schema)?;
        }
        if s.records_video() {
            self.add_recording(&mut dag, camera_schema)?;
        }
        if self.queue_monitor {
            dag.add_node(
                NodeSpec::new(QUEUE_MONITOR, nodes::QUEUE_MONITOR)
                    .with_params(params(&QueueMonitorParams::default())?),
            )?;
        }

        tracing::info!(
            mode = %s.main.mode,
            nodes = dag.nodes().len(),
            edges = dag.edges().len(),
            "DAG assembled"
        );
        Ok(dag)
    }

    fn camera_schema(&self) -> Result<Schema> {
        let cam = &self.settings.camera;
        match cam.source {
            CameraSource::Synthetic => Ok(Schema::frame(cam.height, cam.width, ElementType::U8)),
            CameraSource::ImageSequence => {
                let dir = cam.image_dir.as_deref().ok_or_else(|| {
                    VrError::Config("camera.image_dir is required for image-sequence".into())
                })?;
                let sequence = ImageSequenceCamera::open(dir, cam.looping)
                    .map_err(|e| VrError::Config(format!("{:#}", e)))?;
                let shape = nodes::FrameSource::shape(&sequence);
                Ok(Schema::frame(
                    shape.height,
                    shape.width,
                    nodes::FrameSource::element(&sequence),
                ))
            }
        }
    }

    fn add_camera(&self, dag: &mut ProcessingDag, schema: Schema) -> Result<()> {
        let cam = &self.settings.camera;
        let camera = CameraParams {
            source: cam.source,
            width: cam.width,
            height: cam.height,
            framerate: cam.framerate,
            rois: self.settings.identity.rois.clone(),
            image_dir: cam.image_dir.clone(),
            looping: cam.looping,
            max_frames: self.max_frames,
        };
        dag.add_node(
            NodeSpec::new(CAMERA, nodes::CAMERA)
                .with_params(params(&camera)?)
                .typed_output(nodes::camera::FRAME_PORT, schema),
        )?;
        Ok(())
    }

    fn add_tracking(&self, dag: &mut ProcessingDag, camera_schema: &Schema) -> Result<()> {
        let s = self.settings;
        let q = &s.queues;
        let (h, w) = match camera_schema {
            Schema::Frame { shape, .. } => (shape.height, shape.width),
            _ => (s.camera.height, s.camera.width),
        };
        let closed_loop = s.main.mode == Mode::ClosedLoop;
        let pool = s.settings.tracking.workers_per_animal.max(1);
        let tail_points = s.settings.tracking.tail_points;
        let tracking_schema = Schema::tracking(false, tail_points);
        let float_frame = Schema::frame(h, w, ElementType::F32);

        dag.add_node(
            NodeSpec::new(BACKGROUND, nodes::BACKGROUND)
                .with_params(params(&BackgroundParams {
                    polarity: s.background.polarity,
                    learning_rate: s.background.learning_rate,
                    reference_image: s.background.reference_image.clone(),
                })?)
                .data_inputs(&[nodes::background::INPUT_PORT])
                .typed_output(nodes::background::OUTPUT_PORT, float_frame.clone()),
        )?;
        dag.create_ring_queue("frames", camera_schema.clone(), q.frame_capacity)?;
        dag.connect_data_ports(
            CAMERA,
            nodes::camera::FRAME_PORT,
            BACKGROUND,
            nodes::background::INPUT_PORT,
            "frames",
        )?;

        let rois = &s.identity.rois;
        let mut crop = NodeSpec::new(CROP, nodes::CROP)
            .with_params(params(&CropParams { rois: rois.clone() })?)
            .data_inputs(&[nodes::crop::INPUT_PORT]);
        for (k, roi) in rois.iter().enumerate() {
            crop = crop.typed_output(&roi_port(k), Schema::crop(roi.h, roi.w, ElementType::F32));
            if pool > 1 {
                crop = crop.send_port(&roi_port(k), SendStrategy::Dispatch);
            }
        }
        dag.add_node(crop)?;
        dag.create_ring_queue("subtracted", float_frame, q.frame_capacity)?;
        dag.connect_data_ports(
            BACKGROUND,
            nodes::background::OUTPUT_PORT,
            CROP,
            nodes::crop::INPUT_PORT,
            "subtracted",
        )?;

        let mut outputs = vec!["saver".to_string()];
        if closed_loop {
            outputs.push("stimulus".to_string());
        }
        let tracker_params = params(&TrackerParams {
            threshold: s.settings.tracking.threshold,
            tail_points,
            outputs: outputs.clone(),
        })?;
        let output_refs: Vec<&str> = outputs.iter().map(String::as_str).collect();

        for (k, roi) in rois.iter().enumerate() {
            let saver = saver_name(k);
            let csv_prefix = format!("{}_{}", s.settings.tracking.csv_filename.display(), k);
            dag.add_node(
                NodeSpec::new(&saver, nodes::TRACKING_SAVER)
                    .with_params(params(&TrackingSaverParams {
                        output_dir: s.main.output_dir.clone(),
                        prefix: csv_prefix,
                        tail_points,
                    })?)
                    .typed_input(nodes::tracking_saver::INPUT_PORT, tracking_schema.clone()),
            )?;
            let tracking_queue = format!("tracking_{}", k);
            dag.create_ring_queue(&tracking_queue, tracking_schema.clone(), q.tracking_capacity)?;
            let animal_queue = format!("animal_{}", k);
            if closed_loop {
                dag.create_ring_queue(&animal_queue, tracking_schema.clone(), q.tracking_capacity)?;
            }

            for j in 0..pool {
                let tracker = tracker_name(k, j, pool);
                let mut spec = NodeSpec::new(&tracker, nodes::TRACKER)
                    .with_params(tracker_params.clone())
                    .typed_input(
                        nodes::tracker::INPUT_PORT,
                        Schema::crop(roi.h, roi.w, ElementType::F32),
                    );
                for port in &output_refs {
                    spec = spec.typed_output(port, tracking_schema.clone());
                }
                dag.add_node(spec)?;

                let crop_queue = if pool == 1 {
                    format!("crops_{}", k)
                } else {
                    format!("crops_{}_{}", k, j)
                };
                dag.create_ring_queue(
                    &crop_queue,
                    Schema::crop(roi.h, roi.w, ElementType::F32),
                    q.crop_capacity,
                )?;
                dag.connect_data_ports(
                    CROP,
                    &roi_port(k),
                    &tracker,
                    nodes::tracker::INPUT_PORT,
                    &crop_queue,
                )?;
                dag.connect_data_ports(
                    &tracker,
                    "saver",
                    &saver,
                    nodes::tracking_saver::INPUT_PORT,
                    &tracking_queue,
                )?;
                if closed_loop {
                    dag.connect_data_ports(
                        &tracker,
                        "stimulus",
                        STIMULUS,
                        &animal_port(k),
                        &animal_queue,
                    )?;
                }
            }
        }
        Ok(())
    }

    fn add_stimulus(&self, dag: &mut ProcessingDag, closed_loop: bool) -> Result<()> {
        let s = self.settings;
        let n = s.identity.rois.len();
        let tracking_schema = Schema::tracking(false, s.settings.tracking.tail_points);
        let mut stimulus = NodeSpec::new(STIMULUS, nodes::STIMULUS)
            .with_params(params(&StimulusParams {
                output_dir: s.main.output_dir.clone(),
                ..Default::default()
            })?)
            .metadata_inputs(&[nodes::stimulus::CONTROL_PORT])
            .receive_data(ReceiveStrategy::Poll);
        if closed_loop {
            for k in 0..n {
                stimulus = stimulus.typed_input(&animal_port(k), tracking_schema.clone());
            }
        }
        dag.add_node(stimulus)?;

        dag.add_node(
            NodeSpec::new(SEQUENCER, nodes::SEQUENCER)
                .with_params(params(&SequencerParams {
                    protocol: s.sequencer.protocol.clone(),
                    repetitions: s.sequencer.repetitions,
                })?)
                .metadata_outputs(&[nodes::sequencer::STIMULUS_PORT]),
        )?;
        dag.create_metadata_queue("protocol")?;
        dag.connect_metadata_ports(
            SEQUENCER,
            nodes::sequencer::STIMULUS_PORT,
            STIMULUS,
            nodes::stimulus::CONTROL_PORT,
            "protocol",
        )?;
        Ok(())
    }

    fn add_recording(&self, dag: &mut ProcessingDag, schema: Schema) -> Result<()> {
        let s = self.settings;
        let video = &s.settings.videorecording;
        dag.add_node(
            NodeSpec::new(VIDEO_WRITER, nodes::VIDEO_WRITER)
                .with_params(params(&VideoWriterParams {
                    output_dir: s.main.output_dir.clone(),
                    prefix: video.filename.display().to_string(),
                    method: video.method,
                    decimation: video.decimation,
                })?)
                .typed_input(nodes::video_writer::INPUT_PORT, schema.clone()),
        )?;
        dag.create_ring_queue("recording", schema, s.queues.frame_capacity)?;
        dag.connect_data_ports(
            CAMERA,
            nodes::camera::FRAME_PORT,
            VIDEO_WRITER,
            nodes::video_writer::INPUT_PORT,
            "recording",
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Roi;

    fn runtime(dir: &tempfile::TempDir) -> RuntimeConfig {
        RuntimeConfig::threaded().with_shm_dir(dir.path())
    }

    fn names(dag: &ProcessingDag) -> Vec<&str> {
        dag.nodes().iter().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_tracking_only() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::default();
        let dag = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .build()
            .unwrap();
        assert_eq!(
            names(&dag),
            vec!["camera", "background", "crop", "tracker_0", "saver_0", "queue_monitor"]
        );
        assert!(dag.queue_handle("crops_0").is_some());
        dag.check().unwrap();
    }

    #[test]
    fn test_closed_loop_with_tracker_pool() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.main.mode = Mode::ClosedLoop;
        settings.identity.n_animals = 2;
        settings.identity.rois = vec![Roi::new(0, 0, 320, 480), Roi::new(320, 0, 320, 480)];
        settings.settings.tracking.workers_per_animal = 2;

        let dag = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .with_queue_monitor(false)
            .build()
            .unwrap();
        let nodes = names(&dag);
        for name in ["stimulus", "sequencer", "tracker_0_0", "tracker_1_1", "saver_1"] {
            assert!(nodes.contains(&name), "missing {}", name);
        }
        assert_eq!(nodes.len(), 11);

        let crop = &dag.nodes()[dag.node_id("crop").unwrap().index()];
        assert_eq!(
            crop.strategies.send_for_data_port("roi_1"),
            SendStrategy::Dispatch
        );
        let stimulus = &dag.nodes()[dag.node_id("stimulus").unwrap().index()];
        assert_eq!(stimulus.strategies.receive_data, ReceiveStrategy::Poll);
        assert_eq!(stimulus.ports.data_inputs.len(), 2);
        dag.check().unwrap();
    }

    #[test]
    fn test_open_loop_stimulus_has_no_data_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.main.mode = Mode::OpenLoop;
        let dag = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .build()
            .unwrap();
        let stimulus = &dag.nodes()[dag.node_id("stimulus").unwrap().index()];
        assert!(stimulus.ports.data_inputs.is_empty());
        assert!(dag.queue_handle("protocol").is_some());
        dag.check().unwrap();
    }

    #[test]
    fn test_video_recording_and_record_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.main.mode = Mode::VideoRecording;
        let dag = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .build()
            .unwrap();
        assert_eq!(names(&dag), vec!["camera", "video_writer", "queue_monitor"]);
        dag.check().unwrap();

        let mut settings = Settings::default();
        settings.main.record = true;
        let dag = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .build()
            .unwrap();
        assert!(names(&dag).contains(&"video_writer"));
        assert!(dag.queue_handle("recording").is_some());
        dag.check().unwrap();
    }

    #[test]
    fn test_image_sequence_without_dir_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.camera.source = CameraSource::ImageSequence;
        let err = DagBuilder::from_settings(&settings, runtime(&dir), NodeRegistry::with_builtin())
            .build()
            .unwrap_err();
        assert!(err.is_config());
    }
}
