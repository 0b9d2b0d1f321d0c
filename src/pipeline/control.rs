//! Shared control block of a running DAG.
//!
//! One small shared-memory region per run, created by the orchestrator before
//! any worker starts. Workers attach by path. It carries:
//!
//! - the stop flag (set once, never cleared),
//! - the release flag that lets all workers enter their loops together,
//! - the logger stop flag (set after every node worker has exited),
//! - one [`WorkerState`] slot plus counters per worker.
//!
//! Everything is an atomic; no lock is needed.

use crate::queue::shm::ShmRegion;
use crate::queue::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Maximum number of workers (nodes plus the logger) in one DAG.
pub const MAX_WORKERS: usize = 256;

const CONTROL_MAGIC: u64 = 0x5652_4c4f_4f50_4342;

/// Lifecycle of one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum WorkerState {
    /// Slot unused or worker not yet spawned.
    Pending = 0,
    /// Process/thread started, attaching queues.
    Spawned = 1,
    /// Queues attached and node constructed; waiting for release.
    Ready = 2,
    /// Inside the event loop.
    Running = 3,
    /// Cleanup done, exited normally.
    Finished = 4,
    /// Fatal error (construction, `initialize`, or too many consecutive errors).
    Failed = 5,
}

impl WorkerState {
    fn from_u32(v: u32) -> Self {
        match v {
            1 => WorkerState::Spawned,
            2 => WorkerState::Ready,
            3 => WorkerState::Running,
            4 => WorkerState::Finished,
            5 => WorkerState::Failed,
            _ => WorkerState::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerState::Finished | WorkerState::Failed)
    }
}

#[repr(C)]
struct WorkerSlot {
    state: AtomicU32,
    pid: AtomicU32,
    transient_errors: AtomicU64,
    iterations: AtomicU64,
    received: AtomicU64,
    published: AtomicU64,
}

#[repr(C)]
struct ControlHeader {
    magic: AtomicU64,
    stop: AtomicU32,
    released: AtomicU32,
    logger_stop: AtomicU32,
    _pad: u32,
    workers: [WorkerSlot; MAX_WORKERS],
}

/// Counters of one worker, copied out of the control block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub state: WorkerState,
    pub pid: u32,
    pub transient_errors: u64,
    pub iterations: u64,
    pub received: u64,
    pub published: u64,
}

/// Handle on the control region.
pub struct ControlBlock {
    region: ShmRegion,
    header: NonNull<ControlHeader>,
}

// SAFETY: only atomics are accessed through the header pointer.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    pub fn create(path: &Path) -> QueueResult<Self> {
        let region = ShmRegion::create(path, std::mem::size_of::<ControlHeader>())?;
        let header = NonNull::new(region.as_ptr() as *mut ControlHeader)
            .ok_or_else(|| QueueError::Corrupt(path.display().to_string()))?;
        // SAFETY: zero-filled region of header size; all-zero is a valid header.
        unsafe { header.as_ref() }
            .magic
            .store(CONTROL_MAGIC, Ordering::Release);
        Ok(Self { region, header })
    }

    pub fn open(path: &Path) -> QueueResult<Self> {
        let region = ShmRegion::open(path)?;
        if region.len() < std::mem::size_of::<ControlHeader>() {
            return Err(QueueError::Corrupt(path.display().to_string()));
        }
        let header = NonNull::new(region.as_ptr() as *mut ControlHeader)
            .ok_or_else(|| QueueError::Corrupt(path.display().to_string()))?;
        // SAFETY: mapping is at least header-sized.
        if unsafe { header.as_ref() }.magic.load(Ordering::Acquire) != CONTROL_MAGIC {
            return Err(QueueError::Corrupt(path.display().to_string()));
        }
        Ok(Self { region, header })
    }

    pub fn path(&self) -> &Path {
        self.region.path()
    }

    fn header(&self) -> &ControlHeader {
        // SAFETY: validated at create/open.
        unsafe { self.header.as_ref() }
    }

    fn slot(&self, slot: usize) -> Option<&WorkerSlot> {
        self.header().workers.get(slot)
    }

    // ====== Flags ======

    pub fn request_stop(&self) {
        self.header().stop.store(1, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.header().stop.load(Ordering::Acquire) != 0
    }

    pub fn release(&self) {
        self.header().released.store(1, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.header().released.load(Ordering::Acquire) != 0
    }

    pub fn request_logger_stop(&self) {
        self.header().logger_stop.store(1, Ordering::SeqCst);
    }

    pub fn logger_stop_requested(&self) -> bool {
        self.header().logger_stop.load(Ordering::Acquire) != 0
    }

    /// Block until released or stopped. Returns `true` when released.
    pub fn wait_for_release(&self) -> bool {
        loop {
            if self.stop_requested() {
                return false;
            }
            if self.is_released() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    // ====== Worker slots ======

    pub fn set_state(&self, slot: usize, state: WorkerState) {
        if let Some(s) = self.slot(slot) {
            s.state.store(state as u32, Ordering::Release);
        }
    }

    pub fn state(&self, slot: usize) -> WorkerState {
        self.slot(slot)
            .map(|s| WorkerState::from_u32(s.state.load(Ordering::Acquire)))
            .unwrap_or(WorkerState::Pending)
    }

    pub fn set_pid(&self, slot: usize, pid: u32) {
        if let Some(s) = self.slot(slot) {
            s.pid.store(pid, Ordering::Relaxed);
        }
    }

    pub fn add_transient_error(&self, slot: usize) {
        if let Some(s) = self.slot(slot) {
            s.transient_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_iteration(&self, slot: usize, received: u64, published: u64) {
        if let Some(s) = self.slot(slot) {
            s.iterations.fetch_add(1, Ordering::Relaxed);
            s.received.fetch_add(received, Ordering::Relaxed);
            s.published.fetch_add(published, Ordering::Relaxed);
        }
    }

    pub fn counters(&self, slot: usize) -> Option<WorkerCounters> {
        self.slot(slot).map(|s| WorkerCounters {
            state: WorkerState::from_u32(s.state.load(Ordering::Acquire)),
            pid: s.pid.load(Ordering::Relaxed),
            transient_errors: s.transient_errors.load(Ordering::Relaxed),
            iterations: s.iterations.load(Ordering::Relaxed),
            received: s.received.load(Ordering::Relaxed),
            published: s.published.load(Ordering::Relaxed),
        })
    }

    /// Poll until every slot in `slots` reaches a state accepted by `done`, or the
    /// timeout passes. Returns the slots still not done.
    pub fn wait_states(
        &self,
        slots: &[usize],
        timeout: Duration,
        done: impl Fn(WorkerState) -> bool,
    ) -> Vec<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            let waiting: Vec<usize> = slots
                .iter()
                .copied()
                .filter(|&s| !done(self.state(s)))
                .collect();
            if waiting.is_empty() || Instant::now() >= deadline {
                return waiting;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

impl std::fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlBlock")
            .field("path", &self.region.path())
            .field("stop", &self.stop_requested())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_visible_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control");
        let owner = ControlBlock::create(&path).unwrap();
        let worker = ControlBlock::open(&path).unwrap();

        assert!(!worker.stop_requested());
        assert!(!worker.is_released());
        owner.release();
        assert!(worker.is_released());
        owner.request_stop();
        assert!(worker.stop_requested());
        assert!(!worker.logger_stop_requested());
        owner.request_logger_stop();
        assert!(worker.logger_stop_requested());
    }

    #[test]
    fn test_worker_slots() {
        let dir = tempfile::tempdir().unwrap();
        let block = ControlBlock::create(&dir.path().join("control")).unwrap();
        assert_eq!(block.state(3), WorkerState::Pending);
        block.set_state(3, WorkerState::Running);
        block.add_transient_error(3);
        block.add_iteration(3, 2, 5);
        let c = block.counters(3).unwrap();
        assert_eq!(c.state, WorkerState::Running);
        assert_eq!(c.transient_errors, 1);
        assert_eq!(c.iterations, 1);
        assert_eq!(c.received, 2);
        assert_eq!(c.published, 5);

        // out of range slots are ignored
        block.set_state(MAX_WORKERS, WorkerState::Failed);
        assert!(block.counters(MAX_WORKERS).is_none());
    }

    #[test]
    fn test_wait_for_release_returns_false_on_stop() {
        let dir = tempfile::tempdir().unwrap();
        let block = ControlBlock::create(&dir.path().join("control")).unwrap();
        block.request_stop();
        assert!(!block.wait_for_release());
    }

    #[test]
    fn test_wait_states_reports_stragglers() {
        let dir = tempfile::tempdir().unwrap();
        let block = ControlBlock::create(&dir.path().join("control")).unwrap();
        block.set_state(0, WorkerState::Ready);
        let waiting = block.wait_states(&[0, 1], Duration::from_millis(10), |s| {
            s == WorkerState::Ready
        });
        assert_eq!(waiting, vec![1]);
    }

    #[test]
    fn test_open_rejects_foreign_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk");
        std::fs::write(&path, vec![0u8; std::mem::size_of::<ControlHeader>()]).unwrap();
        assert!(ControlBlock::open(&path).is_err());
    }
}
