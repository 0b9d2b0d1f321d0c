//! Queue monitor: an isolated node that reports queue counters.
//!
//! Every `period_ms` it logs `qsize`, `num_lost` and the put rate of each queue
//! on the `vrloop::queue` target, warns when a queue lost more than
//! `loss_warning_rate` of what was put during the period, and optionally sends
//! the same figures on its `metrics` metadata port.

use crate::pipeline::node::{NodeContext, NodeSpec, WorkerNode};
use crate::pipeline::packet::{Packet, PortMap};
use crate::queue::{QueueSnapshot, QueueStats};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const METRICS_PORT: &str = "metrics";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueMonitorParams {
    /// Queue names; every data and metadata queue of the DAG when empty.
    pub queues: Vec<String>,
    pub period_ms: u64,
    /// Fraction of puts lost within one period that triggers a warning.
    pub loss_warning_rate: f64,
    pub publish_metrics: bool,
}

impl Default for QueueMonitorParams {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            period_ms: 1000,
            loss_warning_rate: 0.01,
            publish_metrics: false,
        }
    }
}

struct Watched {
    stats: Arc<dyn QueueStats>,
    last: Option<QueueSnapshot>,
}

/// Figures of one queue over one period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueReport {
    pub queue: String,
    pub qsize: usize,
    pub num_lost: u64,
    pub lost_in_period: u64,
    pub put_rate_hz: f64,
}

pub struct QueueMonitorNode {
    params: QueueMonitorParams,
    watched: Vec<Watched>,
    next_due: Option<Instant>,
    last_report: Option<Instant>,
    warnings: u64,
}

impl QueueMonitorNode {
    pub fn new(params: QueueMonitorParams) -> Self {
        Self {
            params,
            watched: Vec::new(),
            next_due: None,
            last_report: None,
            warnings: 0,
        }
    }

    pub fn from_spec(spec: &NodeSpec) -> anyhow::Result<Self> {
        Ok(Self::new(spec.params_as()?))
    }

    pub fn watch(&mut self, stats: Arc<dyn QueueStats>) {
        self.watched.push(Watched { stats, last: None });
    }

    pub fn warnings(&self) -> u64 {
        self.warnings
    }

    fn period(&self) -> Duration {
        Duration::from_millis(self.params.period_ms.max(1))
    }

    /// Compare every queue with the previous sample and log the result.
    pub fn sample(&mut self) -> Vec<QueueReport> {
        let now = Instant::now();
        let elapsed = self
            .last_report
            .map_or(self.period(), |t| now.duration_since(t))
            .as_secs_f64()
            .max(1e-6);
        self.last_report = Some(now);

        let threshold = self.params.loss_warning_rate;
        let mut reports = Vec::with_capacity(self.watched.len());
        for w in &mut self.watched {
            let snap = QueueSnapshot::of(w.stats.as_ref());
            let (put, lost) = match &w.last {
                Some(prev) => (
                    snap.produced.saturating_sub(prev.produced),
                    snap.lost.saturating_sub(prev.lost),
                ),
                None => (snap.produced, snap.lost),
            };
            let report = QueueReport {
                queue: snap.name.clone(),
                qsize: w.stats.qsize(),
                num_lost: snap.lost,
                lost_in_period: lost,
                put_rate_hz: put as f64 / elapsed,
            };
            tracing::info!(
                target: "vrloop::queue",
                queue = %report.queue,
                qsize = report.qsize,
                num_lost = report.num_lost,
                put_rate_hz = report.put_rate_hz,
                "queue status"
            );
            if put > 0 && lost as f64 / put as f64 > threshold {
                self.warnings += 1;
                tracing::warn!(
                    target: "vrloop::queue",
                    queue = %report.queue,
                    lost,
                    put,
                    "queue is dropping records"
                );
            }
            w.last = Some(snap);
            reports.push(report);
        }
        reports
    }
}

impl WorkerNode for QueueMonitorNode {
    fn initialize(&mut self, ctx: &mut NodeContext) -> anyhow::Result<()> {
        let names: Vec<String> = if self.params.queues.is_empty() {
            ctx.queues
                .keys()
                .filter(|name| !name.starts_with("__"))
                .cloned()
                .collect()
        } else {
            self.params.queues.clone()
        };
        for name in &names {
            let handle = ctx
                .queues
                .get(name)
                .with_context(|| format!("unknown queue '{}'", name))?;
            let stats = handle
                .open_stats()
                .with_context(|| format!("attaching to queue '{}'", name))?;
            self.watch(stats);
        }
        tracing::info!(queues = names.len(), "queue monitor ready");
        Ok(())
    }

    fn process_data(
        &mut self,
        _inputs: Option<PortMap<Packet>>,
        ctx: &mut NodeContext,
    ) -> anyhow::Result<Option<PortMap<Packet>>> {
        let period = self.period();
        let due = *self.next_due.get_or_insert_with(|| Instant::now() + period);
        ctx.sleep(due.saturating_duration_since(Instant::now()));
        if ctx.stop_requested() {
            return Ok(None);
        }
        self.next_due = Some(due + period);

        let reports = self.sample();
        if self.params.publish_metrics {
            ctx.send_metadata(
                METRICS_PORT,
                json!({ "iteration": ctx.iteration, "queues": reports }),
            );
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{RingBuffer, Schema};
    use crate::types::Sample;

    fn sample(index: i64) -> Packet {
        Sample {
            index,
            timestamp_ns: 0,
            value: 0.0,
        }
        .into()
    }

    #[test]
    fn test_reports_loss_per_period() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Arc::new(
            RingBuffer::create(dir.path(), "samples", Schema::Sample, 2, Duration::ZERO).unwrap(),
        );
        let mut monitor = QueueMonitorNode::new(QueueMonitorParams {
            loss_warning_rate: 0.1,
            ..Default::default()
        });
        monitor.watch(ring.clone());

        ring.put(&sample(0)).unwrap();
        let first = monitor.sample();
        assert_eq!(first[0].queue, "samples");
        assert_eq!(first[0].lost_in_period, 0);
        assert_eq!(monitor.warnings(), 0);

        for i in 1..6 {
            ring.put(&sample(i)).unwrap();
        }
        let second = monitor.sample();
        assert_eq!(second[0].num_lost, 4);
        assert_eq!(second[0].lost_in_period, 4);
        assert_eq!(second[0].qsize, 2);
        assert_eq!(monitor.warnings(), 1);

        let third = monitor.sample();
        assert_eq!(third[0].lost_in_period, 0);
        assert_eq!(monitor.warnings(), 1);
    }
}
