//! Shared-memory ring buffer of fixed-size records.
//!
//! Region layout:
//!
//! ```text
//! [ RingHeader (cursors, counters, ShmLock) | pad to 64 | slot 0 | … | slot N-1 ]
//! ```
//!
//! Cursors and counters change only while the header lock is held. Counters are
//! atomics so monitors in other processes can read them without locking.
//!
//! Several consumers share one read cursor: each record is delivered to exactly
//! one of them and an overwrite is counted once for the queue.

use super::codec::Schema;
use super::shm::{deadline_after, monotonic_ns, ShmLock, ShmRegion};
use super::{Channel, QueueError, QueueHandle, QueueResult, QueueStats};
use crate::pipeline::Packet;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const RING_MAGIC: u64 = 0x5652_4c4f_4f50_5242;
const SLOT_ALIGN: usize = 64;

#[repr(C)]
struct RingHeader {
    magic: AtomicU64,
    capacity: u64,
    item_size: u64,
    fingerprint: u64,
    refresh_ns: u64,
    head: AtomicU64,
    tail: AtomicU64,
    count: AtomicU64,
    lost: AtomicU64,
    produced: AtomicU64,
    consumed: AtomicU64,
    public_size: AtomicU64,
    last_refresh_ns: AtomicU64,
    lock: ShmLock,
}

fn data_offset() -> usize {
    std::mem::size_of::<RingHeader>().div_ceil(SLOT_ALIGN) * SLOT_ALIGN
}

/// Fixed-capacity, overwrite-on-full, multi-producer multi-consumer queue.
pub struct RingBuffer {
    name: String,
    schema: Schema,
    capacity: usize,
    item_size: usize,
    region: ShmRegion,
    header: NonNull<RingHeader>,
    scratch: Mutex<Vec<u8>>,
}

// SAFETY: the header is only mutated under `ShmLock` or through atomics, and the
// mapping outlives the pointer because `region` is owned alongside it.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Create a ring of `capacity` slots in `dir`. The returned value owns the region.
    ///
    /// `refresh` is the minimum interval between updates of the published `qsize`.
    pub fn create(
        dir: &Path,
        name: &str,
        schema: Schema,
        capacity: usize,
        refresh: Duration,
    ) -> QueueResult<Self> {
        if capacity == 0 {
            return Err(QueueError::Corrupt(format!(
                "{}: capacity must be at least 1",
                name
            )));
        }
        let item_size = schema.item_size();
        let size = data_offset() + capacity * item_size;
        let region = ShmRegion::create(&dir.join(format!("{}.ring", name)), size)?;

        let header = region.as_ptr() as *mut RingHeader;
        // SAFETY: the region is freshly created, zero-filled, page aligned and at
        // least `size_of::<RingHeader>()` bytes long. Nobody else has attached yet.
        unsafe {
            std::ptr::addr_of_mut!((*header).capacity).write(capacity as u64);
            std::ptr::addr_of_mut!((*header).item_size).write(item_size as u64);
            std::ptr::addr_of_mut!((*header).fingerprint).write(schema.fingerprint());
            std::ptr::addr_of_mut!((*header).refresh_ns).write(refresh.as_nanos() as u64);
            ShmLock::init(std::ptr::addr_of_mut!((*header).lock)).map_err(|source| {
                QueueError::Sync {
                    queue: name.to_string(),
                    source,
                }
            })?;
            (*header).magic.store(RING_MAGIC, Ordering::Release);
        }

        tracing::debug!(
            target: "vrloop::queue",
            queue = name,
            %schema,
            capacity,
            bytes = size,
            "ring buffer created"
        );

        Ok(Self {
            name: name.to_string(),
            schema,
            capacity,
            item_size,
            header: NonNull::new(header).ok_or_else(|| QueueError::Corrupt(name.to_string()))?,
            region,
            scratch: Mutex::new(vec![0; item_size]),
        })
    }

    /// Attach to a ring created elsewhere, verifying its schema.
    pub fn open(handle: &QueueHandle) -> QueueResult<Self> {
        let QueueHandle::Ring {
            name,
            path,
            schema,
            capacity,
        } = handle
        else {
            return Err(QueueError::Corrupt(handle.name().to_string()));
        };

        let region = ShmRegion::open(path)?;
        if region.len() < data_offset() {
            return Err(QueueError::Corrupt(name.clone()));
        }
        let header = NonNull::new(region.as_ptr() as *mut RingHeader)
            .ok_or_else(|| QueueError::Corrupt(name.clone()))?;

        // SAFETY: the mapping is at least as large as the header.
        let h = unsafe { header.as_ref() };
        if h.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(QueueError::Corrupt(name.clone()));
        }
        if h.fingerprint != schema.fingerprint() {
            return Err(QueueError::SchemaMismatch {
                queue: name.clone(),
                expected: format!("fingerprint {:#x}", h.fingerprint),
                actual: schema.to_string(),
            });
        }
        let item_size = schema.item_size();
        if h.capacity as usize != *capacity
            || h.item_size as usize != item_size
            || region.len() < data_offset() + capacity * item_size
        {
            return Err(QueueError::Corrupt(name.clone()));
        }

        Ok(Self {
            name: name.clone(),
            schema: schema.clone(),
            capacity: *capacity,
            item_size,
            region,
            header,
            scratch: Mutex::new(vec![0; item_size]),
        })
    }

    /// Descriptor for re-opening this ring in another process.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle::Ring {
            name: self.name.clone(),
            path: self.region.path().to_path_buf(),
            schema: self.schema.clone(),
            capacity: self.capacity,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn item_size(&self) -> usize {
        self.item_size
    }

    fn header(&self) -> &RingHeader {
        // SAFETY: validated at create/open; lives as long as `region`.
        unsafe { self.header.as_ref() }
    }

    fn slot_ptr(&self, position: u64) -> *mut u8 {
        let slot = (position % self.capacity as u64) as usize;
        // SAFETY: slot < capacity and the region holds `capacity` slots after the header.
        unsafe {
            self.region
                .as_ptr()
                .add(data_offset() + slot * self.item_size)
        }
    }

    fn sync_err(&self, source: std::io::Error) -> QueueError {
        QueueError::Sync {
            queue: self.name.clone(),
            source,
        }
    }

    /// Publish `count` as the visible qsize if the refresh interval has passed.
    fn refresh_size(&self, h: &RingHeader, count: u64) {
        if h.refresh_ns == 0 {
            h.public_size.store(count, Ordering::Relaxed);
            return;
        }
        let now = monotonic_ns();
        let last = h.last_refresh_ns.load(Ordering::Relaxed);
        if last == 0 || now.saturating_sub(last) >= h.refresh_ns {
            h.public_size.store(count, Ordering::Relaxed);
            h.last_refresh_ns.store(now, Ordering::Relaxed);
        }
    }

    /// Write a record. Never blocks on consumers; overwrites the oldest unread
    /// record when full.
    pub fn put(&self, packet: &Packet) -> QueueResult<()> {
        if !self.schema.accepts(packet) {
            return Err(QueueError::SchemaMismatch {
                queue: self.name.clone(),
                expected: self.schema.to_string(),
                actual: Schema::of(packet).to_string(),
            });
        }

        let mut scratch = self
            .scratch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.schema
            .encode(packet, &mut scratch)
            .map_err(|message| QueueError::Serialization {
                queue: self.name.clone(),
                message,
            })?;

        let h = self.header();
        let overwrote = {
            let _guard = h.lock.lock().map_err(|e| self.sync_err(e))?;
            let head = h.head.load(Ordering::Relaxed);
            // SAFETY: slot is in bounds, scratch is item_size bytes, and slot
            // contents are only touched under the lock.
            unsafe {
                std::ptr::copy_nonoverlapping(scratch.as_ptr(), self.slot_ptr(head), self.item_size);
            }
            h.head.store(head + 1, Ordering::Relaxed);

            let count = h.count.load(Ordering::Relaxed);
            let overwrote = count as usize == self.capacity;
            if overwrote {
                h.tail.fetch_add(1, Ordering::Relaxed);
                h.lost.fetch_add(1, Ordering::Relaxed);
            } else {
                h.count.store(count + 1, Ordering::Relaxed);
            }
            h.produced.fetch_add(1, Ordering::Relaxed);
            self.refresh_size(h, h.count.load(Ordering::Relaxed));
            h.lock.notify_all();
            overwrote
        };

        if overwrote {
            tracing::trace!(target: "vrloop::queue", queue = %self.name, "slot overwritten");
        }
        Ok(())
    }

    /// Take the oldest record, waiting at most `timeout`. `Ok(None)` on timeout.
    pub fn get(&self, timeout: Duration) -> QueueResult<Option<Packet>> {
        let h = self.header();
        let deadline = deadline_after(timeout);
        let mut buf = vec![0u8; self.item_size];
        {
            let mut guard = h.lock.lock().map_err(|e| self.sync_err(e))?;
            while h.count.load(Ordering::Relaxed) == 0 {
                let timed_out = guard.wait_until(&deadline).map_err(|e| self.sync_err(e))?;
                if timed_out && h.count.load(Ordering::Relaxed) == 0 {
                    return Ok(None);
                }
            }
            let tail = h.tail.load(Ordering::Relaxed);
            // SAFETY: slot is in bounds and we hold the lock.
            unsafe {
                std::ptr::copy_nonoverlapping(self.slot_ptr(tail), buf.as_mut_ptr(), self.item_size);
            }
            h.tail.store(tail + 1, Ordering::Relaxed);
            let count = h.count.load(Ordering::Relaxed) - 1;
            h.count.store(count, Ordering::Relaxed);
            h.consumed.fetch_add(1, Ordering::Relaxed);
            self.refresh_size(h, count);
        }

        self.schema
            .decode(&buf)
            .map(Some)
            .map_err(|message| QueueError::Decode {
                queue: self.name.clone(),
                message,
            })
    }
}

impl QueueStats for RingBuffer {
    fn name(&self) -> &str {
        &self.name
    }

    fn qsize(&self) -> usize {
        self.header().public_size.load(Ordering::Relaxed) as usize
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn num_lost(&self) -> u64 {
        self.header().lost.load(Ordering::Relaxed)
    }

    fn produced(&self) -> u64 {
        self.header().produced.load(Ordering::Relaxed)
    }

    fn consumed(&self) -> u64 {
        self.header().consumed.load(Ordering::Relaxed)
    }

    fn in_flight(&self) -> usize {
        self.header().count.load(Ordering::Relaxed) as usize
    }
}

impl Channel for RingBuffer {
    type Item = Packet;

    fn put(&self, item: &Packet) -> QueueResult<()> {
        RingBuffer::put(self, item)
    }

    fn get(&self, timeout: Duration) -> QueueResult<Option<Packet>> {
        RingBuffer::get(self, timeout)
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("name", &self.name)
            .field("schema", &self.schema)
            .field("capacity", &self.capacity)
            .field("owner", &self.region.is_owner())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ElementType, Frame, Image, ImageShape, Sample};
    use std::sync::Arc;

    fn sample(index: i64) -> Packet {
        Packet::Sample(Sample {
            index,
            timestamp_ns: index * 1000,
            value: index as f64,
        })
    }

    fn sample_ring(dir: &Path, capacity: usize) -> RingBuffer {
        RingBuffer::create(dir, "test", Schema::Sample, capacity, Duration::ZERO).unwrap()
    }

    #[test]
    fn test_fifo_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let ring = sample_ring(dir.path(), 8);
        for i in 0..5 {
            ring.put(&sample(i)).unwrap();
        }
        assert_eq!(ring.qsize(), 5);
        for i in 0..5 {
            let p = ring.get(Duration::from_millis(10)).unwrap().unwrap();
            assert_eq!(p.index(), i);
        }
        assert_eq!(ring.qsize(), 0);
        assert_eq!(ring.num_lost(), 0);
    }

    #[test]
    fn test_get_timeout_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let ring = sample_ring(dir.path(), 2);
        let start = std::time::Instant::now();
        assert!(ring.get(Duration::from_millis(20)).unwrap().is_none());
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_overwrite_oldest_counts_loss() {
        let dir = tempfile::tempdir().unwrap();
        let ring = sample_ring(dir.path(), 3);
        for i in 0..10 {
            ring.put(&sample(i)).unwrap();
        }
        assert_eq!(ring.num_lost(), 7);
        assert_eq!(ring.in_flight(), 3);
        let got: Vec<i64> = (0..3)
            .map(|_| ring.get(Duration::ZERO).unwrap().unwrap().index())
            .collect();
        assert_eq!(got, vec![7, 8, 9]);
    }

    #[test]
    fn test_capacity_one_keeps_latest() {
        let dir = tempfile::tempdir().unwrap();
        let ring = sample_ring(dir.path(), 1);
        for i in 0..100 {
            ring.put(&sample(i)).unwrap();
        }
        assert_eq!(ring.num_lost(), 99);
        assert_eq!(ring.get(Duration::ZERO).unwrap().unwrap().index(), 99);
        assert!(ring.get(Duration::ZERO).unwrap().is_none());
        assert_eq!(ring.produced(), ring.consumed() + ring.num_lost());
    }

    #[test]
    fn test_schema_mismatch_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let ring = RingBuffer::create(
            dir.path(),
            "frames",
            Schema::frame(2, 2, ElementType::U8),
            4,
            Duration::ZERO,
        )
        .unwrap();
        let err = ring.put(&sample(0)).unwrap_err();
        assert!(matches!(err, QueueError::SchemaMismatch { .. }));
        assert_eq!(ring.produced(), 0);
    }

    #[test]
    fn test_open_by_handle_shares_slots() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::frame(2, 3, ElementType::U8);
        let owner = RingBuffer::create(dir.path(), "cam", schema, 4, Duration::ZERO).unwrap();
        let attached = owner.handle().open_ring().unwrap();

        let frame = Packet::Frame(Frame {
            index: 1,
            timestamp_ns: 5,
            image: Image::from_u8(ImageShape::gray(2, 3), vec![1, 2, 3, 4, 5, 6]).unwrap(),
        });
        attached.put(&frame).unwrap();
        assert_eq!(owner.get(Duration::ZERO).unwrap(), Some(frame));
        assert_eq!(attached.consumed(), 1);
    }

    #[test]
    fn test_open_with_wrong_schema_fails() {
        let dir = tempfile::tempdir().unwrap();
        let owner = sample_ring(dir.path(), 4);
        let QueueHandle::Ring { name, path, capacity, .. } = owner.handle() else {
            unreachable!()
        };
        let wrong = QueueHandle::Ring {
            name,
            path,
            schema: Schema::tracking(false, 0),
            capacity,
        };
        assert!(matches!(
            wrong.open_ring(),
            Err(QueueError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_refresh_interval_throttles_qsize() {
        let dir = tempfile::tempdir().unwrap();
        let ring =
            RingBuffer::create(dir.path(), "slow", Schema::Sample, 16, Duration::from_secs(3600))
                .unwrap();
        ring.put(&sample(0)).unwrap();
        ring.put(&sample(1)).unwrap();
        // first put publishes, the second is inside the refresh interval
        assert_eq!(ring.qsize(), 1);
        assert_eq!(ring.in_flight(), 2);
    }

    #[test]
    fn test_blocked_consumer_wakes_on_put() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Arc::new(sample_ring(dir.path(), 4));
        let consumer = {
            let ring = ring.clone();
            std::thread::spawn(move || ring.get(Duration::from_secs(5)).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        ring.put(&sample(3)).unwrap();
        assert_eq!(consumer.join().unwrap().map(|p| p.index()), Some(3));
    }

    #[test]
    fn test_multi_consumer_each_record_once() {
        let dir = tempfile::tempdir().unwrap();
        let ring = Arc::new(sample_ring(dir.path(), 1024));
        for i in 0..600 {
            ring.put(&sample(i)).unwrap();
        }
        let workers: Vec<_> = (0..3)
            .map(|_| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some(p) = ring.get(Duration::from_millis(20)).unwrap() {
                        seen.push(p.index());
                    }
                    seen
                })
            })
            .collect();
        let mut all: Vec<i64> = Vec::new();
        for w in workers {
            let seen = w.join().unwrap();
            assert!(seen.windows(2).all(|p| p[0] < p[1]));
            all.extend(seen);
        }
        all.sort_unstable();
        assert_eq!(all, (0..600).collect::<Vec<_>>());
    }
}
