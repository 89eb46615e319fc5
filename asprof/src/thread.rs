//! Per-thread profiler state.
//!
//! Each sampled thread owns one `ProfiledThread`, reachable from the signal
//! handler through a single pthread TLS key. Threads that start after attach
//! get a heap record installed by the thread-start hook; threads that
//! existed before attach claim a slot from a preallocated pool on their
//! first signal, because the handler cannot allocate.

use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::os;

const PRE_ATTACH_POOL_SIZE: usize = 4096;

#[repr(C)]
pub struct ProfiledThread {
    /// Bumped on every signal-driven sample; exposed through the C API.
    pub sample_counter: AtomicU64,
    /// Set while this thread executes the sampling path; short-circuits
    /// handler recursion.
    in_handler: AtomicU64,
    tid: i32,
    from_pool: bool,
    cpu_epoch: u64,
    wall_epoch: u64,
    skipped_samples: u64,
    context_key: u64,
}

impl ProfiledThread {
    fn new(tid: i32, from_pool: bool) -> ProfiledThread {
        ProfiledThread {
            sample_counter: AtomicU64::new(0),
            in_handler: AtomicU64::new(0),
            tid,
            from_pool,
            cpu_epoch: 0,
            wall_epoch: 0,
            skipped_samples: 0,
            context_key: 0,
        }
    }

    /// Returns false when the sampling path is already active on this
    /// thread.
    pub fn enter_handler(&self) -> bool {
        self.in_handler.swap(1, Ordering::Acquire) == 0
    }

    pub fn leave_handler(&self) {
        self.in_handler.store(0, Ordering::Release);
    }

    pub fn in_handler(&self) -> bool {
        self.in_handler.load(Ordering::Relaxed) != 0
    }

    pub fn tid(&self) -> i32 {
        self.tid
    }

    pub fn note_sample(&self) {
        self.sample_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cpu_epoch(&self) -> u64 {
        self.cpu_epoch
    }

    pub fn note_cpu_sample(&mut self) -> u64 {
        self.cpu_epoch += 1;
        self.cpu_epoch
    }

    /// Wall-clock dedup: when `all` is false, consecutive samples with the
    /// same context key collapse into a skip count the caller attaches to
    /// the next recorded sample.
    pub fn note_wall_sample(&mut self, all: bool, context_key: u64, skipped: &mut u64) -> bool {
        self.wall_epoch += 1;
        if all || context_key != self.context_key {
            self.context_key = context_key;
            *skipped = self.skipped_samples;
            self.skipped_samples = 0;
            true
        } else {
            self.skipped_samples += 1;
            false
        }
    }
}

struct Registry {
    key: libc::pthread_key_t,
    pool: *mut ProfiledThread,
    pool_next: AtomicI32,
}

unsafe impl Send for Registry {}
unsafe impl Sync for Registry {}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

unsafe extern "C" fn destroy_record(value: *mut libc::c_void) {
    let record = value as *mut ProfiledThread;
    if !record.is_null() && !(*record).from_pool {
        drop(Box::from_raw(record));
    }
}

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| {
        let mut key: libc::pthread_key_t = 0;
        unsafe {
            libc::pthread_key_create(&mut key, Some(destroy_record));
        }
        let pool = os::safe_alloc(PRE_ATTACH_POOL_SIZE * std::mem::size_of::<ProfiledThread>())
            as *mut ProfiledThread;
        Registry {
            key,
            pool,
            pool_next: AtomicI32::new(0),
        }
    })
}

/// Ensures the registry (TLS key and pool) exists. Called once at init.
pub fn prepare() {
    registry();
}

/// The current thread's record, or null if it has none yet.
/// Async-signal-safe.
#[inline]
pub fn current() -> *mut ProfiledThread {
    match REGISTRY.get() {
        Some(registry) => unsafe {
            libc::pthread_getspecific(registry.key) as *mut ProfiledThread
        },
        None => ptr::null_mut(),
    }
}

pub fn current_tid() -> i32 {
    let record = current();
    if record.is_null() {
        os::thread_id()
    } else {
        unsafe { (*record).tid }
    }
}

/// Installs a heap record for the current thread. Regular context only.
pub fn init_current_thread() -> *mut ProfiledThread {
    let existing = current();
    if !existing.is_null() {
        return existing;
    }
    let registry = registry();
    let record = Box::into_raw(Box::new(ProfiledThread::new(os::thread_id(), false)));
    unsafe {
        libc::pthread_setspecific(registry.key, record as *const libc::c_void);
    }
    record
}

/// Claims a pool slot for a thread that predates attach. Safe to call from
/// the signal handler; returns null when the pool is exhausted, in which
/// case the sample is dropped and counted by the caller.
pub fn claim_pooled(tid: i32) -> *mut ProfiledThread {
    let Some(registry) = REGISTRY.get() else {
        return ptr::null_mut();
    };
    if registry.pool.is_null() {
        return ptr::null_mut();
    }
    let index = registry.pool_next.fetch_add(1, Ordering::Relaxed);
    if index as usize >= PRE_ATTACH_POOL_SIZE {
        registry.pool_next.store(PRE_ATTACH_POOL_SIZE as i32, Ordering::Relaxed);
        return ptr::null_mut();
    }
    let record = unsafe { registry.pool.add(index as usize) };
    unsafe {
        record.write(ProfiledThread::new(tid, true));
        libc::pthread_setspecific(registry.key, record as *const libc::c_void);
    }
    record
}

/// The record for the sampling path: the installed one, or a pool slot for
/// pre-attach threads. Null means "drop this sample".
#[inline]
pub fn current_or_pooled() -> *mut ProfiledThread {
    let record = current();
    if !record.is_null() {
        return record;
    }
    claim_pooled(os::thread_id())
}

/// Drops the current thread's record; called from the thread-end hook.
pub fn release() {
    let Some(registry) = REGISTRY.get() else { return };
    let record = current();
    if record.is_null() {
        return;
    }
    unsafe {
        libc::pthread_setspecific(registry.key, ptr::null());
        if !(*record).from_pool {
            drop(Box::from_raw(record));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_per_thread() {
        prepare();
        let record = init_current_thread();
        assert!(!record.is_null());
        assert_eq!(unsafe { (*record).tid() }, os::thread_id());
        assert_eq!(init_current_thread(), record);

        let other = std::thread::spawn(|| init_current_thread() as usize)
            .join()
            .unwrap();
        assert_ne!(other, record as usize);
        release();
        assert!(current().is_null());
    }

    #[test]
    fn pool_serves_unregistered_threads() {
        prepare();
        std::thread::spawn(|| {
            let record = current_or_pooled();
            assert!(!record.is_null());
            assert!(unsafe { (*record).from_pool });
            // The same slot is returned on the next sample.
            assert_eq!(current_or_pooled(), record);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn wall_sample_batching() {
        let mut record = ProfiledThread::new(1, false);
        let mut skipped = 0;
        assert!(record.note_wall_sample(false, 7, &mut skipped));
        assert!(!record.note_wall_sample(false, 7, &mut skipped));
        assert!(!record.note_wall_sample(false, 7, &mut skipped));
        assert!(record.note_wall_sample(false, 8, &mut skipped));
        assert_eq!(skipped, 2);
        assert!(record.note_wall_sample(true, 8, &mut skipped));
        assert_eq!(skipped, 0);
    }
}
