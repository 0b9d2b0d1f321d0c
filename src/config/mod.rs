//! Configuration module for vrloop
//!
//! This module handles:
//! - The experiment settings file ([`Settings`]), JSON or TOML
//! - Process-wide runtime parameters of the DAG ([`RuntimeConfig`])
//!
//! # Example
//!
//! ```ignore
//! use vrloop::config::{RuntimeConfig, Settings};
//!
//! let settings = Settings::load("experiment.toml")?;
//! settings.validate()?;
//! let runtime = RuntimeConfig::from_settings(&settings);
//! ```

pub mod runtime;
pub mod settings;

pub use runtime::*;
pub use settings::*;

use crate::error::{Result, VrError};
use std::path::{Path, PathBuf};

/// Application identifier for data directories
pub const APP_ID: &str = "vrloop";

// ==================== App Data Directory ====================

/// Platform data directory of the application, e.g. `~/.local/share/vrloop`.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Output directory used when no settings file is given.
pub fn default_session_dir() -> Result<PathBuf> {
    let dir = app_data_dir()
        .ok_or_else(|| VrError::Config("Could not determine app data directory".to_string()))?
        .join("sessions");
    std::fs::create_dir_all(&dir).map_err(|e| {
        VrError::Config(format!("Failed to create session directory {:?}: {}", dir, e))
    })?;
    Ok(dir)
}

// ==================== Load / Save ====================

impl Settings {
    /// Load settings from a `.json` or `.toml` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            VrError::Config(format!("Failed to read settings file {:?}: {}", path, e))
        })?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content).map_err(|e| {
                VrError::Config(format!("Failed to parse settings file {:?}: {}", path, e))
            }),
            Some("toml") => toml::from_str(&content).map_err(|e| {
                VrError::Config(format!("Failed to parse settings file {:?}: {}", path, e))
            }),
            _ => Err(VrError::Config(format!(
                "Unsupported settings file extension: {:?} (expected .json or .toml)",
                path
            ))),
        }
    }

    /// Save settings; the format follows the extension like [`Settings::load`].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)
                .map_err(|e| VrError::Serialization(e.to_string()))?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content).map_err(|e| {
            VrError::Config(format!("Failed to write settings file {:?}: {}", path, e))
        })
    }

    /// Check cross-field constraints. Returns the first problem found.
    pub fn validate(&self) -> Result<()> {
        let cam = &self.camera;
        if cam.width == 0 || cam.height == 0 {
            return Err(VrError::Config(format!(
                "camera dimensions must be positive, got {}x{}",
                cam.width, cam.height
            )));
        }
        if cam.num_channels == 0 {
            return Err(VrError::Config("camera.num_channels must be >= 1".into()));
        }
        if cam.framerate.is_nan() || cam.framerate <= 0.0 {
            return Err(VrError::Config(format!(
                "camera.framerate must be > 0, got {}",
                cam.framerate
            )));
        }
        if cam.source == CameraSource::ImageSequence {
            match &cam.image_dir {
                Some(dir) if dir.is_dir() => {}
                Some(dir) => {
                    return Err(VrError::Config(format!(
                        "camera.image_dir {:?} is not a directory",
                        dir
                    )))
                }
                None => {
                    return Err(VrError::Config(
                        "camera.image_dir is required for the image-sequence source".into(),
                    ))
                }
            }
        }

        let identity = &self.identity;
        if identity.n_animals == 0 {
            return Err(VrError::Config("identity.n_animals must be >= 1".into()));
        }
        if identity.rois.len() != identity.n_animals {
            return Err(VrError::Config(format!(
                "identity.rois has {} entries for {} animals",
                identity.rois.len(),
                identity.n_animals
            )));
        }
        for (k, roi) in identity.rois.iter().enumerate() {
            if !roi.fits(cam.width, cam.height) {
                return Err(VrError::Config(format!(
                    "identity.rois[{}] = {:?} lies outside the {}x{} frame",
                    k, roi, cam.width, cam.height
                )));
            }
        }

        if let Some(path) = &self.background.reference_image {
            if !path.exists() {
                return Err(VrError::Config(format!(
                    "background.reference_image {:?} does not exist",
                    path
                )));
            }
        }

        if self.settings.videorecording.decimation == 0 {
            return Err(VrError::Config(
                "settings.videorecording.decimation must be >= 1".into(),
            ));
        }
        if self.settings.tracking.workers_per_animal == 0 {
            return Err(VrError::Config(
                "settings.tracking.workers_per_animal must be >= 1".into(),
            ));
        }
        let q = &self.queues;
        if q.frame_capacity == 0 || q.crop_capacity == 0 || q.tracking_capacity == 0 {
            return Err(VrError::Config("queue capacities must be >= 1".into()));
        }
        if self.main.recording_duration_s < 0.0 {
            return Err(VrError::Config(
                "main.recording_duration_s must not be negative".into(),
            ));
        }
        Ok(())
    }

    /// Whether the video recording branch is part of the DAG.
    pub fn records_video(&self) -> bool {
        self.main.mode == Mode::VideoRecording
            || self.main.record
            || self.settings.videorecording.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn test_load_toml_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.toml");
        std::fs::write(
            &path,
            r#"
[camera]
width = 200
height = 100
framerate = 250.0

[identity]
n_animals = 2
rois = [[0, 0, 100, 100], [100, 0, 100, 100]]

[settings.tracking]
workers_per_animal = 3

[main]
mode = "closed-loop"
record = true
"#,
        )
        .unwrap();
        let s = Settings::load(&path).unwrap();
        assert_eq!(s.camera.width, 200);
        assert_eq!(s.camera.num_channels, 1);
        assert_eq!(s.identity.rois[1], Roi::new(100, 0, 100, 100));
        assert_eq!(s.settings.tracking.workers_per_animal, 3);
        assert_eq!(s.main.mode, Mode::ClosedLoop);
        assert!(s.records_video());
        s.validate().unwrap();
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.json");
        let mut s = Settings::default();
        s.sequencer.protocol.push(ProtocolItem {
            stimulus: "grating".into(),
            duration_s: 2.5,
            params: serde_json::json!({ "speed": 10 }),
        });
        s.save(&path).unwrap();
        assert_eq!(Settings::load(&path).unwrap(), s);
    }

    #[test]
    fn test_unknown_extension_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exp.yaml");
        std::fs::write(&path, "camera: {}").unwrap();
        assert!(Settings::load(&path).unwrap_err().is_config());
        assert!(Settings::load(dir.path().join("missing.json"))
            .unwrap_err()
            .is_config());
    }

    #[test]
    fn test_validate_rejects() {
        let mut s = Settings::default();
        s.identity.n_animals = 2;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.identity.rois[0] = Roi::new(600, 0, 100, 100);
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.settings.videorecording.decimation = 0;
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.background.reference_image = Some(PathBuf::from("/nonexistent/bg.pgm"));
        assert!(s.validate().is_err());

        let mut s = Settings::default();
        s.camera.framerate = 0.0;
        assert!(s.validate().is_err());
    }
}
