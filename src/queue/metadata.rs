//! Unbounded cross-process metadata queue.
//!
//! Messages are JSON values. Each message is spooled as its own file in
//! `<name>.spool/`, named by a sequence number handed out under the shared
//! header lock:
//!
//! ```text
//! <name>.meta            header: magic, write_seq, read_seq, ShmLock
//! <name>.spool/
//!     00000000000000000000.json
//!     00000000000000000001.json
//! ```
//!
//! A producer writes its message to a temporary file first and renames it into
//! place while holding the lock, so a consumer never observes a partial message.

use super::shm::{deadline_after, ShmLock, ShmRegion};
use super::{Channel, QueueError, QueueHandle, QueueResult, QueueStats};
use crate::pipeline::MetaValue;
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const META_MAGIC: u64 = 0x5652_4c4f_4f50_4d51;

#[repr(C)]
struct SpoolHeader {
    magic: AtomicU64,
    write_seq: AtomicU64,
    read_seq: AtomicU64,
    lock: ShmLock,
}

/// Multi-producer multi-consumer FIFO of JSON messages without capacity bound.
pub struct MetadataQueue {
    name: String,
    region: ShmRegion,
    header: NonNull<SpoolHeader>,
    spool: PathBuf,
    tmp_counter: AtomicU64,
}

// SAFETY: header fields are atomics or the process-shared lock.
unsafe impl Send for MetadataQueue {}
unsafe impl Sync for MetadataQueue {}

fn spool_dir(header_path: &Path) -> PathBuf {
    header_path.with_extension("spool")
}

impl MetadataQueue {
    pub fn create(dir: &Path, name: &str) -> QueueResult<Self> {
        let path = dir.join(format!("{}.meta", name));
        let region = ShmRegion::create(&path, std::mem::size_of::<SpoolHeader>())?;
        let spool = spool_dir(&path);
        if spool.exists() {
            std::fs::remove_dir_all(&spool)?;
        }
        std::fs::create_dir_all(&spool)?;

        let header = region.as_ptr() as *mut SpoolHeader;
        // SAFETY: fresh zeroed mapping, large enough for the header, not shared yet.
        unsafe {
            ShmLock::init(std::ptr::addr_of_mut!((*header).lock)).map_err(|source| {
                QueueError::Sync {
                    queue: name.to_string(),
                    source,
                }
            })?;
            (*header).magic.store(META_MAGIC, Ordering::Release);
        }

        tracing::debug!(target: "vrloop::queue", queue = name, "metadata queue created");

        Ok(Self {
            name: name.to_string(),
            header: NonNull::new(header).ok_or_else(|| QueueError::Corrupt(name.to_string()))?,
            region,
            spool,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn open(handle: &QueueHandle) -> QueueResult<Self> {
        let QueueHandle::Metadata { name, path } = handle else {
            return Err(QueueError::Corrupt(handle.name().to_string()));
        };
        let region = ShmRegion::open(path)?;
        if region.len() < std::mem::size_of::<SpoolHeader>() {
            return Err(QueueError::Corrupt(name.clone()));
        }
        let header = NonNull::new(region.as_ptr() as *mut SpoolHeader)
            .ok_or_else(|| QueueError::Corrupt(name.clone()))?;
        // SAFETY: mapping is at least header-sized.
        if unsafe { header.as_ref() }.magic.load(Ordering::Acquire) != META_MAGIC {
            return Err(QueueError::Corrupt(name.clone()));
        }
        Ok(Self {
            name: name.clone(),
            spool: spool_dir(path),
            region,
            header,
            tmp_counter: AtomicU64::new(0),
        })
    }

    pub fn handle(&self) -> QueueHandle {
        QueueHandle::Metadata {
            name: self.name.clone(),
            path: self.region.path().to_path_buf(),
        }
    }

    fn header(&self) -> &SpoolHeader {
        // SAFETY: validated at create/open, lives as long as `region`.
        unsafe { self.header.as_ref() }
    }

    fn sync_err(&self, source: std::io::Error) -> QueueError {
        QueueError::Sync {
            queue: self.name.clone(),
            source,
        }
    }

    fn message_path(&self, seq: u64) -> PathBuf {
        self.spool.join(format!("{:020}.json", seq))
    }

    pub fn put(&self, message: &MetaValue) -> QueueResult<()> {
        let bytes = serde_json::to_vec(message).map_err(|e| QueueError::Serialization {
            queue: self.name.clone(),
            message: e.to_string(),
        })?;
        let tmp = self.spool.join(format!(
            ".tmp-{}-{:?}-{}",
            std::process::id(),
            std::thread::current().id(),
            self.tmp_counter.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::write(&tmp, &bytes)?;

        let h = self.header();
        let _guard = h.lock.lock().map_err(|e| self.sync_err(e))?;
        let seq = h.write_seq.load(Ordering::Relaxed);
        if let Err(e) = std::fs::rename(&tmp, self.message_path(seq)) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        h.write_seq.store(seq + 1, Ordering::Release);
        h.lock.notify_all();
        Ok(())
    }

    /// Next message, waiting at most `timeout`. `Ok(None)` on timeout.
    pub fn get(&self, timeout: Duration) -> QueueResult<Option<MetaValue>> {
        let h = self.header();
        let deadline = deadline_after(timeout);
        let seq = {
            let mut guard = h.lock.lock().map_err(|e| self.sync_err(e))?;
            loop {
                let read = h.read_seq.load(Ordering::Relaxed);
                if read < h.write_seq.load(Ordering::Relaxed) {
                    h.read_seq.store(read + 1, Ordering::Release);
                    break read;
                }
                if guard.wait_until(&deadline).map_err(|e| self.sync_err(e))?
                    && h.read_seq.load(Ordering::Relaxed) >= h.write_seq.load(Ordering::Relaxed)
                {
                    return Ok(None);
                }
            }
        };

        let path = self.message_path(seq);
        let bytes = std::fs::read(&path)?;
        let _ = std::fs::remove_file(&path);
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| QueueError::Decode {
                queue: self.name.clone(),
                message: e.to_string(),
            })
    }
}

impl QueueStats for MetadataQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn qsize(&self) -> usize {
        let h = self.header();
        let write = h.write_seq.load(Ordering::Acquire);
        write.saturating_sub(h.read_seq.load(Ordering::Acquire)) as usize
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn num_lost(&self) -> u64 {
        0
    }

    fn produced(&self) -> u64 {
        self.header().write_seq.load(Ordering::Acquire)
    }

    fn consumed(&self) -> u64 {
        self.header().read_seq.load(Ordering::Acquire)
    }
}

impl Channel for MetadataQueue {
    type Item = MetaValue;

    fn put(&self, item: &MetaValue) -> QueueResult<()> {
        MetadataQueue::put(self, item)
    }

    fn get(&self, timeout: Duration) -> QueueResult<Option<MetaValue>> {
        MetadataQueue::get(self, timeout)
    }
}

impl Drop for MetadataQueue {
    fn drop(&mut self) {
        if self.region.is_owner() {
            let _ = std::fs::remove_dir_all(&self.spool);
        }
    }
}

impl std::fmt::Debug for MetadataQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataQueue")
            .field("name", &self.name)
            .field("spool", &self.spool)
            .finish()
    }
}
