//! Process-safe logging.
//!
//! Every worker formats its own `tracing` events and pushes the finished lines
//! into the run's log queue (a [`MetadataQueue`]). One logger worker drains
//! that queue and appends the lines to two files:
//!
//! ```text
//! worker ─┐
//! worker ─┼─► log queue ─► logger worker ─┬─► worker log  (everything else)
//! worker ─┘                               └─► queue log   (vrloop::queue*, vrloop::profile)
//! ```
//!
//! The logger is started before and stopped after every node worker, and
//! drains the queue completely before it exits.

use crate::pipeline::control::ControlBlock;
use crate::queue::{MetadataQueue, QueueResult};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Dispatch, Metadata};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,vrloop=debug";

/// Target prefixes routed to the queue log.
const QUEUE_TARGETS: [&str; 2] = ["vrloop::queue", "vrloop::profile"];

/// Destination file of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogChannel {
    Worker,
    Queue,
}

impl LogChannel {
    pub fn for_target(target: &str) -> Self {
        if QUEUE_TARGETS.iter().any(|t| target.starts_with(t)) {
            LogChannel::Queue
        } else {
            LogChannel::Worker
        }
    }
}

/// One formatted line travelling on the log queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    pub channel: LogChannel,
    pub worker: String,
    pub line: String,
}

/// Install the orchestrator's subscriber: `EnvFilter` from `RUST_LOG` (or
/// [`DEFAULT_FILTER`]) and a `fmt` layer on stderr.
pub fn init_orchestrator() {
    use tracing_subscriber::util::SubscriberInitExt;
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init();
}

fn filter_from(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Dispatcher for a worker. Lines go to `queue` when given, else to stderr.
pub fn worker_dispatch(queue: Option<Arc<MetadataQueue>>, filter: &str, worker: &str) -> Dispatch {
    match queue {
        Some(queue) => {
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(QueueMakeWriter::new(queue, worker));
            Dispatch::new(
                tracing_subscriber::registry()
                    .with(filter_from(filter))
                    .with(layer),
            )
        }
        None => Dispatch::new(
            tracing_subscriber::registry()
                .with(filter_from(filter))
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr)),
        ),
    }
}

/// `MakeWriter` producing one [`QueueLineWriter`] per event.
#[derive(Clone)]
pub struct QueueMakeWriter {
    queue: Arc<MetadataQueue>,
    worker: Arc<str>,
}

impl QueueMakeWriter {
    pub fn new(queue: Arc<MetadataQueue>, worker: &str) -> Self {
        Self {
            queue,
            worker: Arc::from(worker),
        }
    }

    fn writer(&self, channel: LogChannel) -> QueueLineWriter {
        QueueLineWriter {
            queue: self.queue.clone(),
            worker: self.worker.clone(),
            channel,
            buf: Vec::with_capacity(256),
        }
    }
}

impl<'a> MakeWriter<'a> for QueueMakeWriter {
    type Writer = QueueLineWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.writer(LogChannel::Worker)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        self.writer(LogChannel::for_target(meta.target()))
    }
}

/// Buffers one formatted event and sends it when dropped.
pub struct QueueLineWriter {
    queue: Arc<MetadataQueue>,
    worker: Arc<str>,
    channel: LogChannel,
    buf: Vec<u8>,
}

impl Write for QueueLineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for QueueLineWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buf);
        let line = LogLine {
            channel: self.channel,
            worker: self.worker.to_string(),
            line: text.trim_end().to_string(),
        };
        let sent = serde_json::to_value(&line)
            .map_err(|e| e.to_string())
            .and_then(|v| self.queue.put(&v).map_err(|e| e.to_string()));
        if sent.is_err() {
            // the log queue is gone; keep the line rather than lose it
            eprintln!("{}", line.line);
        }
    }
}

/// File pair written by the logger worker.
pub struct LogFiles {
    worker: RollingFileAppender,
    queue: RollingFileAppender,
}

impl LogFiles {
    pub fn open(worker_log: &Path, queue_log: &Path) -> io::Result<Self> {
        Ok(Self {
            worker: appender(worker_log)?,
            queue: appender(queue_log)?,
        })
    }

    pub fn write(&mut self, line: &LogLine) -> io::Result<()> {
        let out = match line.channel {
            LogChannel::Worker => &mut self.worker,
            LogChannel::Queue => &mut self.queue,
        };
        writeln!(out, "{}", line.line)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.worker.flush()?;
        self.queue.flush()
    }
}

fn appender(path: &Path) -> io::Result<RollingFileAppender> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"))?;
    RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(dir)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}

/// Logger worker body: drain `queue` into `files` until the logger stop flag is
/// set, then drain what is left. Returns the number of lines written.
pub fn run_logger(
    queue: &MetadataQueue,
    control: &ControlBlock,
    files: &mut LogFiles,
) -> QueueResult<u64> {
    let mut written = 0;
    loop {
        match queue.get(Duration::from_millis(50))? {
            Some(value) => {
                write_value(files, value, &mut written);
            }
            None if control.logger_stop_requested() => break,
            None => {
                let _ = files.flush();
            }
        }
    }
    while let Some(value) = queue.get(Duration::ZERO)? {
        write_value(files, value, &mut written);
    }
    let _ = files.flush();
    Ok(written)
}

fn write_value(files: &mut LogFiles, value: serde_json::Value, written: &mut u64) {
    match serde_json::from_value::<LogLine>(value) {
        Ok(line) => {
            if let Err(e) = files.write(&line) {
                eprintln!("logger: write failed: {}", e);
            } else {
                *written += 1;
            }
        }
        Err(e) => eprintln!("logger: malformed log line: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_routing() {
        assert_eq!(LogChannel::for_target("vrloop::queue"), LogChannel::Queue);
        assert_eq!(
            LogChannel::for_target("vrloop::queue::monitor"),
            LogChannel::Queue
        );
        assert_eq!(LogChannel::for_target("vrloop::profile"), LogChannel::Queue);
        assert_eq!(
            LogChannel::for_target("vrloop::pipeline::worker"),
            LogChannel::Worker
        );
        assert_eq!(LogChannel::for_target("my_node"), LogChannel::Worker);
    }

    #[test]
    fn test_worker_lines_reach_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = Arc::new(MetadataQueue::create(dir.path(), "log").unwrap());
        let dispatch = worker_dispatch(Some(queue.clone()), "trace", "cam");
        tracing::dispatcher::with_default(&dispatch, || {
            tracing::info!("frame grabbed");
            tracing::debug!(target: "vrloop::queue", queue = "camera", qsize = 3, "stats");
        });

        let first: LogLine =
            serde_json::from_value(queue.get(Duration::from_millis(50)).unwrap().unwrap()).unwrap();
        assert_eq!(first.channel, LogChannel::Worker);
        assert_eq!(first.worker, "cam");
        assert!(first.line.contains("frame grabbed"));
        assert!(first.line.contains("INFO"));

        let second: LogLine =
            serde_json::from_value(queue.get(Duration::from_millis(50)).unwrap().unwrap()).unwrap();
        assert_eq!(second.channel, LogChannel::Queue);
        assert!(second.line.contains("qsize=3"));
    }

    #[test]
    fn test_logger_drains_before_exit() {
        let dir = tempfile::tempdir().unwrap();
        let queue = MetadataQueue::create(dir.path(), "log").unwrap();
        let control = ControlBlock::create(&dir.path().join("control")).unwrap();
        for i in 0..20 {
            let line = LogLine {
                channel: if i % 2 == 0 {
                    LogChannel::Worker
                } else {
                    LogChannel::Queue
                },
                worker: "w".into(),
                line: format!("line {}", i),
            };
            queue.put(&serde_json::to_value(&line).unwrap()).unwrap();
        }
        control.request_logger_stop();

        let worker_log = dir.path().join("logs").join("worker.log");
        let queue_log = dir.path().join("logs").join("queue.log");
        let mut files = LogFiles::open(&worker_log, &queue_log).unwrap();
        let written = run_logger(&queue, &control, &mut files).unwrap();
        drop(files);

        assert_eq!(written, 20);
        let w = std::fs::read_to_string(&worker_log).unwrap();
        let q = std::fs::read_to_string(&queue_log).unwrap();
        assert_eq!(w.lines().count(), 10);
        assert_eq!(q.lines().count(), 10);
        assert!(w.starts_with("line 0"));
        assert!(q.starts_with("line 1"));
    }
}
