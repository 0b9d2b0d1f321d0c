//! Experiment settings, one struct per section of the settings file
//!
//! # Sections
//!
//! - [`CameraSettings`] - frame source selector and geometry
//! - [`BackgroundSettings`] - background model polarity and reference image
//! - [`IdentitySettings`] - animal count and per-animal ROIs
//! - [`ProjectorSettings`] - stimulus display geometry
//! - [`CalibrationSettings`] - camera to projector mapping
//! - [`RunSettings`] - `videorecording` and `tracking` subsections
//! - [`SequencerSettings`] - stimulus protocol
//! - [`LogSettings`] - log file paths and queue refresh interval
//! - [`MainSettings`] - mode, recording flag and duration
//!
//! Every field has a default so partial files are accepted.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub camera: CameraSettings,
    pub background: BackgroundSettings,
    pub identity: IdentitySettings,
    pub projector: ProjectorSettings,
    pub calibration: CalibrationSettings,
    pub settings: RunSettings,
    pub sequencer: SequencerSettings,
    pub queues: QueueSettings,
    pub logs: LogSettings,
    pub main: MainSettings,
}

// ==================== Camera ====================

/// Which frame source to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CameraSource {
    /// Moving blobs generated in software.
    #[default]
    Synthetic,
    /// Replay of a directory of PGM images.
    ImageSequence,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub source: CameraSource,
    pub exposure_us: f32,
    pub gain: f32,
    pub framerate: f32,
    pub height: usize,
    pub width: usize,
    pub offset_x: usize,
    pub offset_y: usize,
    pub num_channels: usize,
    /// Image directory for `image-sequence`.
    pub image_dir: Option<PathBuf>,
    /// Replay the image sequence forever.
    pub looping: bool,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            source: CameraSource::default(),
            exposure_us: 3000.0,
            gain: 0.0,
            framerate: 100.0,
            height: 480,
            width: 640,
            offset_x: 0,
            offset_y: 0,
            num_channels: 1,
            image_dir: None,
            looping: true,
        }
    }
}

// ==================== Background ====================

/// Contrast of the animal against the background.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Polarity {
    #[default]
    DarkOnBright,
    BrightOnDark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundSettings {
    pub polarity: Polarity,
    /// Reference background (PGM). Learnt from the stream when absent.
    pub reference_image: Option<PathBuf>,
    pub use_gpu: bool,
    /// Weight of a new frame in the running average.
    pub learning_rate: f32,
}

impl Default for BackgroundSettings {
    fn default() -> Self {
        Self {
            polarity: Polarity::default(),
            reference_image: None,
            use_gpu: false,
            learning_rate: 0.01,
        }
    }
}

// ==================== Identity ====================

/// Region of interest in full-frame pixels, written `[x, y, w, h]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[usize; 4]", into = "[usize; 4]")]
pub struct Roi {
    pub x: usize,
    pub y: usize,
    pub w: usize,
    pub h: usize,
}

impl Roi {
    pub fn new(x: usize, y: usize, w: usize, h: usize) -> Self {
        Self { x, y, w, h }
    }

    pub fn fits(&self, width: usize, height: usize) -> bool {
        self.w > 0 && self.h > 0 && self.x + self.w <= width && self.y + self.h <= height
    }
}

impl From<[usize; 4]> for Roi {
    fn from([x, y, w, h]: [usize; 4]) -> Self {
        Self { x, y, w, h }
    }
}

impl From<Roi> for [usize; 4] {
    fn from(r: Roi) -> Self {
        [r.x, r.y, r.w, r.h]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub n_animals: usize,
    pub rois: Vec<Roi>,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        let camera = CameraSettings::default();
        Self {
            n_animals: 1,
            rois: vec![Roi::new(0, 0, camera.width, camera.height)],
        }
    }
}

// ==================== Projector / calibration ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectorSettings {
    pub resolution: [u32; 2],
    pub offset: [i32; 2],
    pub fps: f32,
    pub pixel_scale: f32,
    pub fullscreen: bool,
}

impl Default for ProjectorSettings {
    fn default() -> Self {
        Self {
            resolution: [1280, 800],
            offset: [0, 0],
            fps: 60.0,
            pixel_scale: 1.0,
            fullscreen: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub pix_per_mm: f32,
    /// Camera to projector homography.
    pub transformation: [[f32; 3]; 3],
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            pix_per_mm: 40.0,
            transformation: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
        }
    }
}

// ==================== Video recording / tracking ====================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    pub videorecording: VideoRecordingSettings,
    pub tracking: TrackingSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordingMethod {
    /// One PGM file per frame.
    #[default]
    ImageSequence,
    /// A single raw `.gray` stream.
    VideoFile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoRecordingSettings {
    pub enabled: bool,
    pub method: RecordingMethod,
    /// Output path prefix; a timestamp and extension are appended.
    pub filename: PathBuf,
    /// Keep one frame out of `decimation`.
    pub decimation: usize,
    pub codec: String,
    pub profile: String,
    pub preset: String,
    pub quality: u32,
    pub gpu: bool,
    pub grayscale: bool,
}

impl Default for VideoRecordingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            method: RecordingMethod::default(),
            filename: PathBuf::from("recording"),
            decimation: 1,
            codec: "rawvideo".to_string(),
            profile: "main".to_string(),
            preset: "fast".to_string(),
            quality: 23,
            gpu: false,
            grayscale: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingSettings {
    pub tracker_settings_file: Option<PathBuf>,
    /// CSV path prefix; one file per animal.
    pub csv_filename: PathBuf,
    pub display_fps: f32,
    /// Tracker workers sharing one animal's crops (DISPATCH pool).
    pub workers_per_animal: usize,
    /// Intensity above background counted as animal.
    pub threshold: f32,
    /// Tail points reported per record.
    pub tail_points: usize,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            tracker_settings_file: None,
            csv_filename: PathBuf::from("tracking"),
            display_fps: 30.0,
            workers_per_animal: 1,
            threshold: 20.0,
            tail_points: 0,
        }
    }
}

// ==================== Sequencer ====================

/// One step of the stimulus protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolItem {
    pub stimulus: String,
    pub duration_s: f64,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerSettings {
    pub protocol: Vec<ProtocolItem>,
    pub repetitions: usize,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            protocol: Vec::new(),
            repetitions: 1,
        }
    }
}

// ==================== Queues / logs / main ====================

/// Ring buffer sizes, in records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub frame_capacity: usize,
    pub crop_capacity: usize,
    pub tracking_capacity: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            frame_capacity: 100,
            crop_capacity: 100,
            tracking_capacity: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub worker_log: PathBuf,
    pub queue_log: PathBuf,
    pub queue_refresh_time_us: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            worker_log: PathBuf::from("worker.log"),
            queue_log: PathBuf::from("queue.log"),
            queue_refresh_time_us: 1000,
        }
    }
}

/// What the DAG is assembled for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Stimulus follows the tracked animals.
    ClosedLoop,
    /// Stimulus follows the protocol only.
    OpenLoop,
    /// Camera straight to disk.
    VideoRecording,
    #[default]
    TrackingOnly,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::ClosedLoop => write!(f, "closed-loop"),
            Mode::OpenLoop => write!(f, "open-loop"),
            Mode::VideoRecording => write!(f, "video-recording"),
            Mode::TrackingOnly => write!(f, "tracking-only"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MainSettings {
    pub mode: Mode,
    /// Add the video recording branch to any mode.
    pub record: bool,
    pub recording_duration_s: f64,
    /// Directory for run artefacts.
    pub output_dir: PathBuf,
}

impl Default for MainSettings {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            record: false,
            recording_duration_s: 10.0,
            output_dir: PathBuf::from("."),
        }
    }
}
