//! Send and receive strategies.
//!
//! Output side ([`OutputTable`]): every output port maps to the queues connected
//! to it. `Broadcast` puts the record on all of them; `Dispatch` puts it on one,
//! chosen by a per-port round-robin pointer advanced on every put.
//!
//! Input side ([`InputTable`]): every input port is bound to one queue.
//! `Poll` returns whatever arrived within the timeout; `Collect` holds partial
//! readings until every port has delivered one record.
//!
//! Both tables are generic over [`Channel`], so the same code drives data
//! (ring buffers) and metadata (spool queues).

use crate::pipeline::error::{DagError, DagResult};
use crate::pipeline::packet::PortMap;
use crate::pipeline::port::PortPlane;
use crate::queue::{Channel, QueueResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Output fan-out discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    /// Every connected queue receives the record.
    #[default]
    Broadcast,
    /// Exactly one connected queue receives it, round-robin.
    Dispatch,
}

/// Input aggregation discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveStrategy {
    /// Pass whatever arrived; absent ports are missing from the map.
    #[default]
    Poll,
    /// Wait until every port has delivered one record.
    Collect,
}

/// Strategy selection for one node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Strategies {
    #[serde(default)]
    pub receive_data: ReceiveStrategy,
    #[serde(default)]
    pub send_data: SendStrategy,
    #[serde(default)]
    pub receive_metadata: ReceiveStrategy,
    #[serde(default)]
    pub send_metadata: SendStrategy,
    /// Per data output port overrides of `send_data`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub data_port_overrides: BTreeMap<String, SendStrategy>,
}

impl Strategies {
    pub fn send_for_data_port(&self, port: &str) -> SendStrategy {
        self.data_port_overrides
            .get(port)
            .copied()
            .unwrap_or(self.send_data)
    }
}

struct OutPort<Q> {
    strategy: SendStrategy,
    queues: Vec<Arc<Q>>,
    next: usize,
}

impl<Q: Channel> OutPort<Q> {
    fn send(&mut self, item: &Q::Item) -> QueueResult<usize> {
        if self.queues.is_empty() {
            return Ok(0);
        }
        match self.strategy {
            SendStrategy::Broadcast => {
                for q in &self.queues {
                    q.put(item)?;
                }
                Ok(self.queues.len())
            }
            SendStrategy::Dispatch => {
                let target = self.next % self.queues.len();
                self.next = self.next.wrapping_add(1);
                self.queues[target].put(item)?;
                Ok(1)
            }
        }
    }
}

/// Output port → connected queues.
pub struct OutputTable<Q> {
    plane: PortPlane,
    ports: BTreeMap<String, OutPort<Q>>,
}

impl<Q: Channel> OutputTable<Q> {
    pub fn new(plane: PortPlane) -> Self {
        Self {
            plane,
            ports: BTreeMap::new(),
        }
    }

    /// Declare a port. Ports with no queue accept records and drop them.
    pub fn add_port(&mut self, port: &str, strategy: SendStrategy) {
        self.ports
            .entry(port.to_string())
            .or_insert_with(|| OutPort {
                strategy,
                queues: Vec::new(),
                next: 0,
            })
            .strategy = strategy;
    }

    pub fn connect(&mut self, port: &str, queue: Arc<Q>, strategy: SendStrategy) {
        self.add_port(port, strategy);
        if let Some(p) = self.ports.get_mut(port) {
            p.queues.push(queue);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn queues(&self, port: &str) -> &[Arc<Q>] {
        self.ports
            .get(port)
            .map(|p| p.queues.as_slice())
            .unwrap_or(&[])
    }

    /// Publish every entry of `outputs` on its port. Keys that are not declared
    /// output ports are reported after the rest have been published.
    ///
    /// Returns the number of puts performed.
    pub fn send(&mut self, node: &str, outputs: &PortMap<Q::Item>) -> DagResult<usize> {
        let mut puts = 0;
        let mut first_err = None;
        for (port, item) in outputs {
            match self.ports.get_mut(port) {
                Some(p) => match p.send(item) {
                    Ok(n) => puts += n,
                    Err(e) => {
                        first_err.get_or_insert(DagError::Queue(e));
                    }
                },
                None => {
                    first_err.get_or_insert(DagError::UnknownPort {
                        node: node.to_string(),
                        plane: self.plane,
                        port: port.clone(),
                    });
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(puts),
        }
    }
}

/// Input port → bound queue, plus the partial readings kept by `Collect`.
pub struct InputTable<Q: Channel> {
    strategy: ReceiveStrategy,
    timeout: Duration,
    ports: Vec<(String, Arc<Q>)>,
    pending: PortMap<Q::Item>,
}

impl<Q: Channel> InputTable<Q> {
    pub fn new(strategy: ReceiveStrategy, timeout: Duration) -> Self {
        Self {
            strategy,
            timeout,
            ports: Vec::new(),
            pending: PortMap::new(),
        }
    }

    pub fn bind(&mut self, port: &str, queue: Arc<Q>) {
        self.ports.retain(|(name, _)| name != port);
        self.ports.push((port.to_string(), queue));
        self.ports.sort_by(|a, b| a.0.cmp(&b.0));
    }

    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of `Collect` readings held back so far.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// One receive round. All waits share a single deadline of `timeout`, so a
    /// round never takes much longer than one timeout. `Ok(None)` means nothing
    /// to hand to the node this round.
    pub fn receive(&mut self) -> QueueResult<Option<PortMap<Q::Item>>> {
        if self.ports.is_empty() {
            return Ok(None);
        }
        let deadline = Instant::now() + self.timeout;
        match self.strategy {
            ReceiveStrategy::Poll => {
                let mut got = PortMap::new();
                // ready records first, so a busy port is not held up by an idle one
                for (port, queue) in &self.ports {
                    if let Some(item) = queue.get(Duration::ZERO)? {
                        got.insert(port.clone(), item);
                    }
                }
                if got.is_empty() {
                    for (port, queue) in &self.ports {
                        let remaining = if got.is_empty() {
                            deadline.saturating_duration_since(Instant::now())
                        } else {
                            Duration::ZERO
                        };
                        if let Some(item) = queue.get(remaining)? {
                            got.insert(port.clone(), item);
                        }
                    }
                }
                Ok((!got.is_empty()).then_some(got))
            }
            ReceiveStrategy::Collect => {
                for (port, queue) in &self.ports {
                    if self.pending.contains_key(port) {
                        continue;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if let Some(item) = queue.get(remaining)? {
                        self.pending.insert(port.clone(), item);
                    }
                }
                if self.pending.len() == self.ports.len() {
                    Ok(Some(std::mem::take(&mut self.pending)))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Packet;
    use crate::queue::{QueueStats, RingBuffer, Schema};
    use crate::types::Sample;
    use proptest::prelude::*;

    fn sample(index: i64) -> Packet {
        Packet::Sample(Sample {
            index,
            timestamp_ns: 0,
            value: 0.0,
        })
    }

    fn rings(dir: &std::path::Path, n: usize, capacity: usize) -> Vec<Arc<RingBuffer>> {
        (0..n)
            .map(|i| {
                Arc::new(
                    RingBuffer::create(
                        dir,
                        &format!("q{}", i),
                        Schema::Sample,
                        capacity,
                        Duration::ZERO,
                    )
                    .unwrap(),
                )
            })
            .collect()
    }

    fn outputs(index: i64) -> PortMap<Packet> {
        crate::pipeline::packet::single("out", sample(index))
    }

    #[test]
    fn test_broadcast_reaches_every_queue() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 3, 16);
        let mut table = OutputTable::new(PortPlane::Data);
        for q in &qs {
            table.connect("out", q.clone(), SendStrategy::Broadcast);
        }
        for i in 0..5 {
            assert_eq!(table.send("src", &outputs(i)).unwrap(), 3);
        }
        for q in &qs {
            assert_eq!(q.produced(), 5);
        }
    }

    #[test]
    fn test_dispatch_round_robin() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 3, 16);
        let mut table = OutputTable::new(PortPlane::Data);
        for q in &qs {
            table.connect("out", q.clone(), SendStrategy::Dispatch);
        }
        for i in 0..9 {
            assert_eq!(table.send("src", &outputs(i)).unwrap(), 1);
        }
        for (k, q) in qs.iter().enumerate() {
            let got: Vec<i64> = std::iter::from_fn(|| q.get(Duration::ZERO).unwrap())
                .map(|p| p.index())
                .collect();
            let expected: Vec<i64> = (0..9).filter(|i| (*i as usize) % 3 == k).collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_unknown_output_port_is_error_but_others_publish() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 1, 4);
        let mut table = OutputTable::new(PortPlane::Data);
        table.connect("out", qs[0].clone(), SendStrategy::Broadcast);

        let mut out = outputs(0);
        out.insert("bogus".into(), sample(0));
        let err = table.send("src", &out).unwrap_err();
        assert!(matches!(err, DagError::UnknownPort { .. }));
        assert_eq!(qs[0].produced(), 1);
    }

    #[test]
    fn test_unconnected_port_drops_silently() {
        let mut table: OutputTable<RingBuffer> = OutputTable::new(PortPlane::Data);
        table.add_port("out", SendStrategy::Broadcast);
        assert_eq!(table.send("src", &outputs(0)).unwrap(), 0);
    }

    #[test]
    fn test_port_override() {
        let mut s = Strategies::default();
        s.data_port_overrides
            .insert("to_workers".into(), SendStrategy::Dispatch);
        assert_eq!(s.send_for_data_port("to_workers"), SendStrategy::Dispatch);
        assert_eq!(s.send_for_data_port("to_saver"), SendStrategy::Broadcast);
    }

    #[test]
    fn test_poll_returns_partial_map() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 2, 4);
        let mut table = InputTable::new(ReceiveStrategy::Poll, Duration::from_millis(10));
        table.bind("a", qs[0].clone());
        table.bind("b", qs[1].clone());

        assert!(table.receive().unwrap().is_none());

        qs[1].put(&sample(4)).unwrap();
        let got = table.receive().unwrap().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got["b"].index(), 4);
    }

    #[test]
    fn test_collect_holds_partials_until_complete() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 2, 4);
        let mut table = InputTable::new(ReceiveStrategy::Collect, Duration::from_millis(5));
        table.bind("a", qs[0].clone());
        table.bind("b", qs[1].clone());

        qs[0].put(&sample(1)).unwrap();
        assert!(table.receive().unwrap().is_none());
        assert_eq!(table.pending(), 1);

        qs[1].put(&sample(2)).unwrap();
        let got = table.receive().unwrap().unwrap();
        assert_eq!(got["a"].index(), 1);
        assert_eq!(got["b"].index(), 2);
        assert_eq!(table.pending(), 0);
    }

    #[test]
    fn test_round_bounded_by_one_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let qs = rings(dir.path(), 4, 4);
        let mut table = InputTable::new(ReceiveStrategy::Poll, Duration::from_millis(30));
        for (i, q) in qs.iter().enumerate() {
            table.bind(&format!("p{}", i), q.clone());
        }
        let start = Instant::now();
        assert!(table.receive().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_no_ports_returns_none_immediately() {
        let mut table: InputTable<RingBuffer> =
            InputTable::new(ReceiveStrategy::Collect, Duration::from_secs(10));
        let start = Instant::now();
        assert!(table.receive().unwrap().is_none());
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_dispatch_counts_differ_by_at_most_one(k in 1usize..5, n in 0i64..200) {
            let dir = tempfile::tempdir().unwrap();
            let qs = rings(dir.path(), k, 256);
            let mut table = OutputTable::new(PortPlane::Data);
            for q in &qs {
                table.connect("out", q.clone(), SendStrategy::Dispatch);
            }
            for i in 0..n {
                table.send("src", &outputs(i)).unwrap();
            }
            let counts: Vec<u64> = qs.iter().map(|q| q.produced()).collect();
            let max = *counts.iter().max().unwrap();
            let min = *counts.iter().min().unwrap();
            prop_assert!(max - min <= 1);
            prop_assert_eq!(counts.iter().sum::<u64>(), n as u64);
        }
    }
}
