//! Process-wide runtime parameters of a DAG.
//!
//! A [`RuntimeConfig`] is built once before anything is spawned and handed to
//! [`ProcessingDag::new`](crate::pipeline::ProcessingDag::new). It is never
//! mutated afterwards.

use super::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How workers are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMode {
    /// One OS process per worker, started by re-executing `worker_program`.
    #[default]
    Process,
    /// One thread per worker in the orchestrator process. Same queues, same
    /// control block, same loop; used by tests and single-binary embedding.
    Thread,
}

/// Default receive timeout of a node.
pub const DEFAULT_RECEIVE_TIMEOUT: Duration = Duration::from_secs(1);

/// Default wait for workers to exit after stop.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Default wait for all workers to report ready.
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of consecutive failing iterations before a node is failed.
pub const DEFAULT_FATAL_ERROR_THRESHOLD: u32 = 10;

/// Environment variables forced to 1 in worker processes when pinning threads.
pub const THREAD_POOL_VARS: [&str; 4] = [
    "OMP_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "MKL_NUM_THREADS",
    "RAYON_NUM_THREADS",
];

/// Log files written by the logger worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogTargets {
    pub worker_log: PathBuf,
    pub queue_log: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub spawn_mode: SpawnMode,

    /// Program started for each worker in process mode; the current executable
    /// when `None`.
    pub worker_program: Option<PathBuf>,

    /// Extra arguments passed to `worker_program`.
    pub worker_args: Vec<String>,

    pub default_timeout: Duration,
    pub grace_period: Duration,
    pub startup_timeout: Duration,

    /// `SCHED_FIFO` priority requested by every worker.
    pub realtime_priority: Option<i32>,

    /// Force thread-pool sizes of numeric libraries to 1 in workers.
    pub pin_threads: bool,

    /// Directory holding the shared-memory files of a run.
    pub shm_dir: PathBuf,

    /// Minimum interval between published `qsize` updates.
    pub queue_refresh: Duration,

    pub fatal_error_threshold: u32,

    /// `EnvFilter` directives for workers.
    pub log_filter: String,

    /// Logger worker output; workers log to stderr when `None`.
    pub logs: Option<LogTargets>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            spawn_mode: SpawnMode::default(),
            worker_program: None,
            worker_args: Vec::new(),
            default_timeout: DEFAULT_RECEIVE_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            realtime_priority: None,
            pin_threads: true,
            shm_dir: default_shm_dir(),
            queue_refresh: Duration::ZERO,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
            log_filter: default_log_filter(),
            logs: None,
        }
    }
}

impl RuntimeConfig {
    /// Runtime for the given settings: log files and queue refresh from `logs`.
    /// Relative log paths are taken from `main.output_dir`.
    pub fn from_settings(settings: &Settings) -> Self {
        let anchor = |path: &PathBuf| {
            if path.is_relative() {
                settings.main.output_dir.join(path)
            } else {
                path.clone()
            }
        };
        Self {
            queue_refresh: Duration::from_micros(settings.logs.queue_refresh_time_us),
            logs: Some(LogTargets {
                worker_log: anchor(&settings.logs.worker_log),
                queue_log: anchor(&settings.logs.queue_log),
            }),
            ..Self::default()
        }
    }

    /// Thread-mode runtime with short timeouts, for tests and tools.
    pub fn threaded() -> Self {
        Self {
            spawn_mode: SpawnMode::Thread,
            default_timeout: Duration::from_millis(50),
            ..Self::default()
        }
    }

    pub fn with_spawn_mode(mut self, mode: SpawnMode) -> Self {
        self.spawn_mode = mode;
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        self.worker_program = Some(program.into());
        self.worker_args = args;
        self
    }

    pub fn with_shm_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shm_dir = dir.into();
        self
    }

    pub fn with_logs(mut self, worker_log: impl Into<PathBuf>, queue_log: impl Into<PathBuf>) -> Self {
        self.logs = Some(LogTargets {
            worker_log: worker_log.into(),
            queue_log: queue_log.into(),
        });
        self
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_realtime_priority(mut self, priority: Option<i32>) -> Self {
        self.realtime_priority = priority;
        self
    }

    pub fn with_fatal_error_threshold(mut self, threshold: u32) -> Self {
        self.fatal_error_threshold = threshold;
        self
    }
}

/// `/dev/shm` when present, the temporary directory otherwise.
pub fn default_shm_dir() -> PathBuf {
    let shm = PathBuf::from("/dev/shm");
    if shm.is_dir() {
        shm
    } else {
        std::env::temp_dir()
    }
}

fn default_log_filter() -> String {
    std::env::var("RUST_LOG").unwrap_or_else(|_| crate::logging::DEFAULT_FILTER.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let rt = RuntimeConfig::default();
        assert_eq!(rt.spawn_mode, SpawnMode::Process);
        assert_eq!(rt.default_timeout, Duration::from_secs(1));
        assert_eq!(rt.grace_period, Duration::from_secs(2));
        assert_eq!(rt.fatal_error_threshold, 10);
        assert!(rt.pin_threads);
        assert!(rt.logs.is_none());
    }

    #[test]
    fn test_from_settings_takes_logs() {
        let mut settings = Settings::default();
        settings.logs.queue_refresh_time_us = 500;
        settings.logs.queue_log = PathBuf::from("/var/log/queue.log");
        settings.main.output_dir = PathBuf::from("/data/run");
        let rt = RuntimeConfig::from_settings(&settings);
        assert_eq!(rt.queue_refresh, Duration::from_micros(500));
        let logs = rt.logs.unwrap();
        assert_eq!(logs.worker_log, PathBuf::from("/data/run/worker.log"));
        assert_eq!(logs.queue_log, PathBuf::from("/var/log/queue.log"));
    }

    #[test]
    fn test_spawn_mode_serde() {
        assert_eq!(
            serde_json::to_string(&SpawnMode::Thread).unwrap(),
            "\"thread\""
        );
    }
}
