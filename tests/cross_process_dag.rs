//! A DAG with every node in its own OS process. The test binary itself is the
//! worker program: children run only `worker_entry`, which picks up the
//! manifest from the environment.

mod common;

use common::{counter, crash, forward, sink, wait_until, Recorder};
use serial_test::serial;
use std::time::{Duration, Instant};
use vrloop::pipeline::{run_worker_from_env, WorkerState};
use vrloop::{DagError, ProcessingDag, RuntimeConfig, Schema};

#[test]
fn worker_entry() {
    if let Some(result) = run_worker_from_env(&common::registry(&Recorder::default())) {
        result.unwrap();
    }
}

fn runtime(dir: &tempfile::TempDir) -> RuntimeConfig {
    let exe = std::env::current_exe().unwrap();
    let args = ["--exact", "worker_entry", "--nocapture", "--test-threads=1"];
    RuntimeConfig::default()
        .with_shm_dir(dir.path())
        .with_worker_program(exe, args.iter().map(|a| a.to_string()).collect())
        .with_default_timeout(Duration::from_millis(50))
}

#[test]
#[serial]
fn test_pipeline_across_processes() {
    let dir = tempfile::tempdir().unwrap();
    let mut dag = ProcessingDag::new(runtime(&dir), common::registry(&Recorder::default())).unwrap();
    dag.add_node(counter("source", Some(200), 1000)).unwrap();
    dag.add_node(forward("tracker", 0)).unwrap();
    dag.add_node(sink("sink", 0)).unwrap();
    dag.create_ring_queue("raw", Schema::Sample, 64).unwrap();
    dag.create_ring_queue("tracked", Schema::Sample, 64).unwrap();
    dag.connect_data_ports("source", "out", "tracker", "in", "raw")
        .unwrap();
    dag.connect_data_ports("tracker", "out", "sink", "in", "tracked")
        .unwrap();

    dag.start().unwrap();
    let pids: Vec<u32> = ["source", "tracker", "sink"]
        .iter()
        .map(|n| dag.worker_counters(n).unwrap().pid)
        .collect();
    assert!(pids.iter().all(|&pid| pid != 0 && pid != std::process::id()));

    // drained: nothing in flight and every consumer has finished its iteration
    let done = wait_until(Duration::from_secs(20), || {
        let queues = dag.queue_snapshots();
        let consumed = |name: &str| {
            queues
                .iter()
                .find(|q| q.name == name)
                .map_or(u64::MAX, |q| q.consumed)
        };
        let counters = |name: &str| dag.worker_counters(name);
        queues.iter().all(|q| q.in_flight == 0)
            && counters("source").is_some_and(|c| c.published == 200)
            && counters("tracker").is_some_and(|c| c.received == consumed("raw"))
            && counters("sink").is_some_and(|c| c.received == consumed("tracked"))
    });
    assert!(done);
    let report = dag.stop().unwrap();

    assert!(report.is_success(), "failed workers: {:?}", report.failed());
    assert!(report.terminated.is_empty());
    for name in ["source", "tracker", "sink"] {
        assert_eq!(report.worker(name).unwrap().state, WorkerState::Finished);
    }
    for q in &report.queues {
        assert!(q.is_balanced(), "{:?}", q);
    }
    let raw = report.queue("raw").unwrap();
    let tracked = report.queue("tracked").unwrap();
    assert_eq!(raw.produced, 200);
    assert_eq!(tracked.produced, raw.consumed);
    assert_eq!(report.worker("sink").unwrap().received, tracked.consumed);
}

#[test]
#[serial]
fn test_failing_construction_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let mut dag = ProcessingDag::new(runtime(&dir), common::registry(&Recorder::default())).unwrap();
    dag.add_node(counter("source", None, 1000)).unwrap();
    // params of the wrong type make the factory fail inside the worker
    dag.add_node(sink("sink", 0).with_params(serde_json::json!({ "delay_us": "slow" })))
        .unwrap();
    dag.create_ring_queue("samples", Schema::Sample, 8).unwrap();
    dag.connect_data_ports("source", "out", "sink", "in", "samples")
        .unwrap();

    match dag.start() {
        Err(DagError::NodeFailed { node, .. }) => assert_eq!(node, "sink"),
        other => panic!("expected a startup failure, got {:?}", other),
    }
    assert!(!dag.is_running());
}

#[test]
#[serial]
fn test_crashed_worker_stops_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut dag = ProcessingDag::new(runtime(&dir), common::registry(&Recorder::default())).unwrap();
    dag.add_node(counter("source", None, 1000)).unwrap();
    dag.add_node(crash("crasher")).unwrap();
    dag.create_ring_queue("samples", Schema::Sample, 8).unwrap();
    dag.connect_data_ports("source", "out", "crasher", "in", "samples")
        .unwrap();

    let started = Instant::now();
    let report = dag.run(Some(Duration::from_secs(20)), None).unwrap();
    assert!(started.elapsed() < Duration::from_secs(10), "{:?}", started.elapsed());

    assert!(!report.is_success());
    let crasher = report.worker("crasher").unwrap();
    assert_eq!(crasher.state, WorkerState::Failed);
    assert!(!crasher.terminated);
    assert_eq!(report.worker("source").unwrap().state, WorkerState::Finished);
    assert_eq!(
        report.failed().iter().map(|w| w.name.as_str()).collect::<Vec<_>>(),
        vec!["crasher"]
    );
}
