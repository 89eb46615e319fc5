//! Native lock engine: interposes the pthread mutex and rwlock slow paths
//! through the same GOT rewriting machinery as the native memory engine.
//! A shim that observes an uncontended acquisition records nothing; when
//! the lock is contended, the wait duration feeds the interval accumulator
//! and crossing waits are recorded as lock samples against the caller's
//! native stack.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, LockEvent};
use crate::os;
use crate::profiler::Profiler;
use crate::tsc;

use super::{update_counter, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static TOTAL_DURATION: AtomicU64 = AtomicU64::new(0);
static RUNNING: AtomicUsize = AtomicUsize::new(0);

static REAL_MUTEX_LOCK: AtomicUsize = AtomicUsize::new(0);
static REAL_MUTEX_TRYLOCK: AtomicUsize = AtomicUsize::new(0);
static REAL_RWLOCK_WRLOCK: AtomicUsize = AtomicUsize::new(0);
static REAL_RWLOCK_RDLOCK: AtomicUsize = AtomicUsize::new(0);

struct GotPatch {
    slot: *mut usize,
    original: usize,
}

unsafe impl Send for GotPatch {}

static PATCHES: Mutex<Vec<GotPatch>> = Mutex::new(Vec::new());

fn running() -> bool {
    RUNNING.load(Ordering::Acquire) != 0
}

fn record_wait(address: usize, start: u64, end: u64) {
    let duration = end - start;
    if !update_counter(&TOTAL_DURATION, duration, INTERVAL.load(Ordering::Relaxed)) {
        return;
    }
    let profiler = Profiler::instance();
    let event = Event::Lock(LockEvent {
        start_time: start,
        end_time: end,
        class_id: profiler.class_id("pthread_mutex_t"),
        address: address as u64,
        timeout: 0,
    });
    profiler.record_sample(
        std::ptr::null_mut(),
        tsc::ticks_to_nanos(duration),
        EventType::LockSample,
        &event,
    );
}

unsafe extern "C" fn mutex_lock_shim(mutex: *mut libc::pthread_mutex_t) -> libc::c_int {
    let lock: unsafe extern "C" fn(*mut libc::pthread_mutex_t) -> libc::c_int =
        std::mem::transmute(REAL_MUTEX_LOCK.load(Ordering::Acquire));
    let trylock_raw = REAL_MUTEX_TRYLOCK.load(Ordering::Acquire);

    if running() && trylock_raw != 0 {
        let trylock: unsafe extern "C" fn(*mut libc::pthread_mutex_t) -> libc::c_int =
            std::mem::transmute(trylock_raw);
        if trylock(mutex) == 0 {
            return 0;
        }
        // Contended path.
        let start = tsc::ticks();
        let rc = lock(mutex);
        record_wait(mutex as usize, start, tsc::ticks());
        return rc;
    }
    lock(mutex)
}

unsafe extern "C" fn rwlock_wrlock_shim(rwlock: *mut libc::pthread_rwlock_t) -> libc::c_int {
    timed_rwlock(rwlock, &REAL_RWLOCK_WRLOCK)
}

unsafe extern "C" fn rwlock_rdlock_shim(rwlock: *mut libc::pthread_rwlock_t) -> libc::c_int {
    timed_rwlock(rwlock, &REAL_RWLOCK_RDLOCK)
}

unsafe fn timed_rwlock(rwlock: *mut libc::pthread_rwlock_t, real: &AtomicUsize) -> libc::c_int {
    let lock: unsafe extern "C" fn(*mut libc::pthread_rwlock_t) -> libc::c_int =
        std::mem::transmute(real.load(Ordering::Acquire));
    if !running() {
        return lock(rwlock);
    }
    let start = tsc::ticks();
    let rc = lock(rwlock);
    let end = tsc::ticks();
    // Report only acquisitions that actually waited.
    if tsc::ticks_to_nanos(end - start) > 1000 {
        record_wait(rwlock as usize, start, end);
    }
    rc
}

fn resolve_real_functions() -> bool {
    for (name, slot) in [
        ("pthread_mutex_lock", &REAL_MUTEX_LOCK),
        ("pthread_mutex_trylock", &REAL_MUTEX_TRYLOCK),
        ("pthread_rwlock_wrlock", &REAL_RWLOCK_WRLOCK),
        ("pthread_rwlock_rdlock", &REAL_RWLOCK_RDLOCK),
    ] {
        let cname = std::ffi::CString::new(name).unwrap();
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        if addr.is_null() {
            return false;
        }
        slot.store(addr as usize, Ordering::Release);
    }
    true
}

fn patch_libraries() {
    let hooks: [(&str, usize); 3] = [
        ("pthread_mutex_lock", mutex_lock_shim as usize),
        ("pthread_rwlock_wrlock", rwlock_wrlock_shim as usize),
        ("pthread_rwlock_rdlock", rwlock_rdlock_shim as usize),
    ];
    let libraries = Profiler::instance().libraries();
    let mut patches = PATCHES.lock();
    for library in libraries.iter() {
        if library.name.contains("asprof") || library.name.contains("libpthread") {
            continue;
        }
        for (name, shim) in hooks {
            if let Some(slot) = library.got_slot(name) {
                unsafe {
                    let current = slot.read();
                    if current == shim || current == 0 {
                        continue;
                    }
                    let page = (slot as usize & !os::PAGE_MASK) as *mut u8;
                    if os::mprotect(page, os::PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) {
                        slot.write(shim);
                        patches.push(GotPatch { slot, original: current });
                    }
                }
            }
        }
    }
}

fn unpatch_libraries() {
    let mut patches = PATCHES.lock();
    for patch in patches.drain(..) {
        unsafe {
            let page = (patch.slot as usize & !os::PAGE_MASK) as *mut u8;
            if os::mprotect(page, os::PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) {
                patch.slot.write(patch.original);
            }
        }
    }
}

#[derive(Default)]
pub struct NativeLockTracer;

impl Engine for NativeLockTracer {
    fn type_name(&self) -> &'static str {
        "native_lock_tracer"
    }

    fn title(&self) -> &'static str {
        "Native lock profile"
    }

    fn units(&self) -> &'static str {
        "ns"
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        if !resolve_real_functions() {
            return Err(ProfilerError::feasibility("cannot resolve pthread entry points"));
        }
        let interval_ns = args.lock.unwrap_or(0);
        INTERVAL.store(
            (interval_ns as u128 * tsc::frequency() as u128 / 1_000_000_000) as u64,
            Ordering::Relaxed,
        );
        TOTAL_DURATION.store(0, Ordering::Relaxed);
        RUNNING.store(1, Ordering::Release);
        patch_libraries();
        Ok(())
    }

    fn stop(&mut self) {
        RUNNING.store(0, Ordering::Release);
        unpatch_libraries();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pthread_symbols_resolve() {
        assert!(resolve_real_functions());
    }
}
