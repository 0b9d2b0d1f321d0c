//! Run artefact naming and the metadata dump
//!
//! Every file a run produces is named
//! `<prefix>_<Weekday>_<DD>_<Mon>_<YYYY>_<HH>h<MM>min<SS>sec.<ext>`.
//! When that name is taken, the writer waits one second and tries again.

use crate::config::Settings;
use crate::error::{Result, ResultExt};
use crate::pipeline::{DagReport, TopologyStats};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// `chrono` format of the timestamp in artefact names.
pub const STAMP_FORMAT: &str = "%A_%d_%b_%Y_%Hh%Mmin%Ssec";

/// Name for `prefix` at `time`. An empty `ext` gives a bare name (directories).
pub fn stamped_name(prefix: &str, ext: &str, time: &DateTime<Local>) -> String {
    if ext.is_empty() {
        format!("{}_{}", prefix, time.format(STAMP_FORMAT))
    } else {
        format!("{}_{}.{}", prefix, time.format(STAMP_FORMAT), ext)
    }
}

/// First free `dir/<prefix>_<stamp>.<ext>`, waiting a second per collision.
///
/// `prefix` may contain directories; they are created.
pub fn timestamped_path(dir: &Path, prefix: &str, ext: &str) -> Result<PathBuf> {
    let base = dir.join(prefix);
    let parent = base.parent().unwrap_or(dir).to_path_buf();
    let stem = base
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(prefix)
        .to_string();
    std::fs::create_dir_all(&parent)
        .with_context(|| format!("creating artefact directory {:?}", parent))?;
    loop {
        let path = parent.join(stamped_name(&stem, ext, &Local::now()));
        if !path.exists() {
            return Ok(path);
        }
        tracing::debug!(path = ?path, "artefact name taken, retrying in 1 s");
        std::thread::sleep(Duration::from_secs(1));
    }
}

/// Contents of the metadata dump.
#[derive(Debug, Serialize)]
pub struct MetadataDump<'a> {
    pub version: &'static str,
    pub created: String,
    pub settings: &'a Settings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topology: Option<&'a TopologyStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<&'a DagReport>,
}

impl<'a> MetadataDump<'a> {
    pub fn new(settings: &'a Settings) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION"),
            created: Local::now().to_rfc3339(),
            settings,
            topology: None,
            report: None,
        }
    }

    pub fn with_topology(mut self, topology: &'a TopologyStats) -> Self {
        self.topology = Some(topology);
        self
    }

    pub fn with_report(mut self, report: &'a DagReport) -> Self {
        self.report = Some(report);
        self
    }
}

/// Write the pretty-printed dump to `dir/metadata_<stamp>.json`.
pub fn write_metadata_dump(dir: &Path, dump: &MetadataDump<'_>) -> Result<PathBuf> {
    let path = timestamped_path(dir, "metadata", "json")?;
    let content = serde_json::to_string_pretty(dump)?;
    std::fs::write(&path, content).with_context(|| format!("writing {:?}", path))?;
    tracing::info!(path = ?path, "metadata dump written");
    Ok(path)
}
