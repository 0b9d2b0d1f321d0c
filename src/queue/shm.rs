//! Shared-memory regions and process-shared locking.
//!
//! Regions are plain files in the run's shared-memory directory (tmpfs on
//! Linux, so RAM-backed) mapped with `memmap2`. The creating process owns the
//! file and unlinks it on drop; workers attach by path.
//!
//! [`ShmLock`] is a robust, process-shared pthread mutex paired with a
//! condition variable on the monotonic clock. It lives inside a region header;
//! if a process dies while holding it the next locker recovers it.

use super::{QueueError, QueueResult};
use memmap2::{MmapMut, MmapOptions};
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// A file-backed shared mapping.
#[derive(Debug)]
pub struct ShmRegion {
    mmap: MmapMut,
    _file: File,
    path: PathBuf,
    owner: bool,
}

impl ShmRegion {
    /// Create (or replace a stale) region of `size` zeroed bytes. The caller owns it.
    pub fn create(path: &Path, size: usize) -> QueueResult<Self> {
        let shm_err = |source| QueueError::Shm {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(shm_err)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(shm_err)?;
        file.set_len(size as u64).map_err(shm_err)?;

        // SAFETY: the file was just sized to `size` bytes and stays open for the
        // lifetime of the mapping.
        let mut mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(shm_err)?;
        mmap.fill(0);

        Ok(Self {
            mmap,
            _file: file,
            path: path.to_path_buf(),
            owner: true,
        })
    }

    /// Attach to an existing region.
    pub fn open(path: &Path) -> QueueResult<Self> {
        let shm_err = |source| QueueError::Shm {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(shm_err)?;
        let size = file.metadata().map_err(shm_err)?.len() as usize;
        if size == 0 {
            return Err(QueueError::Corrupt(path.display().to_string()));
        }

        // SAFETY: the file is open and `size` is its current length.
        let mmap = unsafe { MmapOptions::new().len(size).map_mut(&file) }.map_err(shm_err)?;

        Ok(Self {
            mmap,
            _file: file,
            path: path.to_path_buf(),
            owner: false,
        })
    }

    /// Base pointer of the mapping (page aligned).
    pub fn as_ptr(&self) -> *mut u8 {
        // Writes go through raw pointers under `ShmLock` or to atomics only.
        self.mmap.as_ptr() as *mut u8
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(target_os = "linux")]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const COND_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

/// Longest single wait; longer timeouts are clamped.
const MAX_WAIT: Duration = Duration::from_secs(24 * 3600);

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(rc))
    }
}

/// Nanoseconds on the clock shared by all processes of the host.
pub fn monotonic_ns() -> u64 {
    // SAFETY: zeroed timespec is a valid out-parameter.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Absolute deadline for [`ShmGuard::wait_until`].
pub fn deadline_after(timeout: Duration) -> libc::timespec {
    let timeout = timeout.min(MAX_WAIT);
    // SAFETY: zeroed timespec is a valid out-parameter.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    // SAFETY: `ts` is a valid, writable timespec.
    unsafe { libc::clock_gettime(COND_CLOCK, &mut ts) };
    let nanos = ts.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    ts.tv_sec += timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t;
    ts.tv_nsec = (nanos % 1_000_000_000) as _;
    ts
}

/// Process-shared mutex + "not empty" condition variable, placed in shared memory.
#[repr(C)]
pub struct ShmLock {
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

// SAFETY: all access goes through pthread calls configured for PTHREAD_PROCESS_SHARED.
unsafe impl Sync for ShmLock {}
unsafe impl Send for ShmLock {}

impl ShmLock {
    /// Initialise the lock in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory inside a shared mapping that no other
    /// thread or process is using yet.
    pub unsafe fn init(this: *mut ShmLock) -> io::Result<()> {
        unsafe {
            let mut mattr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(libc::pthread_mutexattr_init(&mut mattr))?;
            check(libc::pthread_mutexattr_setpshared(
                &mut mattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_mutexattr_setrobust(
                &mut mattr,
                libc::PTHREAD_MUTEX_ROBUST,
            ))?;
            let rc = libc::pthread_mutex_init((*this).mutex.get(), &mattr);
            libc::pthread_mutexattr_destroy(&mut mattr);
            check(rc)?;

            let mut cattr: libc::pthread_condattr_t = std::mem::zeroed();
            check(libc::pthread_condattr_init(&mut cattr))?;
            check(libc::pthread_condattr_setpshared(
                &mut cattr,
                libc::PTHREAD_PROCESS_SHARED,
            ))?;
            #[cfg(target_os = "linux")]
            check(libc::pthread_condattr_setclock(&mut cattr, COND_CLOCK))?;
            let rc = libc::pthread_cond_init((*this).cond.get(), &cattr);
            libc::pthread_condattr_destroy(&mut cattr);
            check(rc)
        }
    }

    pub fn lock(&self) -> io::Result<ShmGuard<'_>> {
        // SAFETY: the mutex was initialised by `init` before the header was published.
        let rc = unsafe { libc::pthread_mutex_lock(self.mutex.get()) };
        self.recover(rc)?;
        Ok(ShmGuard { lock: self })
    }

    /// Wake every waiter.
    pub fn notify_all(&self) {
        // SAFETY: initialised condition variable.
        unsafe { libc::pthread_cond_broadcast(self.cond.get()) };
    }

    fn recover(&self, rc: libc::c_int) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        if rc == libc::EOWNERDEAD {
            tracing::warn!("shared lock owner died while holding it; recovering");
            // SAFETY: we hold the mutex after EOWNERDEAD.
            unsafe { libc::pthread_mutex_consistent(self.mutex.get()) };
            return Ok(());
        }
        check(rc)
    }
}

/// Holds the [`ShmLock`]; unlocks on drop.
pub struct ShmGuard<'a> {
    lock: &'a ShmLock,
}

impl ShmGuard<'_> {
    /// Wait for a notification or the deadline. Returns `true` on timeout.
    pub fn wait_until(&mut self, deadline: &libc::timespec) -> io::Result<bool> {
        // SAFETY: we hold the mutex; both primitives are initialised.
        let rc = unsafe {
            libc::pthread_cond_timedwait(self.lock.cond.get(), self.lock.mutex.get(), deadline)
        };
        if rc == libc::ETIMEDOUT {
            return Ok(true);
        }
        self.lock.recover(rc)?;
        Ok(false)
    }
}

impl Drop for ShmGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: the guard exists only while the mutex is held by this thread.
        unsafe { libc::pthread_mutex_unlock(self.lock.mutex.get()) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn test_region_create_open_and_unlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let owner = ShmRegion::create(&path, 4096).unwrap();
        assert!(owner.is_owner());
        assert_eq!(owner.len(), 4096);

        // SAFETY: in-bounds write to the mapping.
        unsafe { *owner.as_ptr().add(10) = 42 };

        let attached = ShmRegion::open(&path).unwrap();
        assert!(!attached.is_owner());
        // SAFETY: in-bounds read of the same file.
        assert_eq!(unsafe { *attached.as_ptr().add(10) }, 42);

        drop(attached);
        assert!(path.exists());
        drop(owner);
        assert!(!path.exists());
    }

    #[test]
    fn test_open_missing_region_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ShmRegion::open(&dir.path().join("missing")).is_err());
    }

    #[repr(C)]
    struct Cell {
        lock: ShmLock,
        value: AtomicU64,
    }

    #[test]
    fn test_lock_wait_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let region = ShmRegion::create(&dir.path().join("lock"), 4096).unwrap();
        let cell = region.as_ptr() as *mut Cell;
        // SAFETY: fresh zeroed mapping, not shared yet.
        unsafe { ShmLock::init(std::ptr::addr_of_mut!((*cell).lock)).unwrap() };
        // SAFETY: initialised above.
        let cell = unsafe { &*cell };

        let start = Instant::now();
        let mut guard = cell.lock.lock().unwrap();
        let timed_out = guard
            .wait_until(&deadline_after(Duration::from_millis(20)))
            .unwrap();
        assert!(timed_out);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_lock_notify_wakes_waiter() {
        let dir = tempfile::tempdir().unwrap();
        let region = Arc::new(ShmRegion::create(&dir.path().join("notify"), 4096).unwrap());
        let cell = region.as_ptr() as *mut Cell;
        // SAFETY: fresh zeroed mapping, not shared yet.
        unsafe { ShmLock::init(std::ptr::addr_of_mut!((*cell).lock)).unwrap() };

        let region2 = region.clone();
        let waiter = std::thread::spawn(move || {
            // SAFETY: initialised before the thread was spawned; region kept alive.
            let cell = unsafe { &*(region2.as_ptr() as *const Cell) };
            let mut guard = cell.lock.lock().unwrap();
            let deadline = deadline_after(Duration::from_secs(5));
            while cell.value.load(Ordering::Relaxed) == 0 {
                if guard.wait_until(&deadline).unwrap() {
                    return false;
                }
            }
            true
        });

        std::thread::sleep(Duration::from_millis(20));
        // SAFETY: initialised above.
        let cell = unsafe { &*cell };
        {
            let _guard = cell.lock.lock().unwrap();
            cell.value.store(1, Ordering::Relaxed);
            cell.lock.notify_all();
        }
        assert!(waiter.join().unwrap());
    }
}
