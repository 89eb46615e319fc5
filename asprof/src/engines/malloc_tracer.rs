//! Native memory engine.
//!
//! Rewrites the GOT entries binding `malloc`, `calloc`, `realloc`, `free`,
//! `posix_memalign` and `aligned_alloc` in every loaded object to local
//! shims. The shims forward to the real functions (resolved once with
//! `RTLD_NEXT`), then record a sampled malloc event and balance it with a
//! free event when a tracked address is released. A `dlopen` interposer
//! re-patches objects loaded while the engine runs. Address-to-size-and-
//! trace correlation lives in a lock-free open-addressed table.

use std::cell::Cell;
use std::ffi::c_void;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::debug;
use parking_lot::Mutex;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, MallocEvent};
use crate::os;
use crate::profiler::Profiler;
use crate::tsc;

use super::{update_counter, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
static RUNNING: AtomicUsize = AtomicUsize::new(0);

// Real entry points, resolved before any GOT slot is rewritten.
static REAL_MALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_CALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_REALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_FREE: AtomicUsize = AtomicUsize::new(0);
static REAL_POSIX_MEMALIGN: AtomicUsize = AtomicUsize::new(0);
static REAL_ALIGNED_ALLOC: AtomicUsize = AtomicUsize::new(0);
static REAL_DLOPEN: AtomicUsize = AtomicUsize::new(0);

/// One patched GOT slot and the value it held before.
struct GotPatch {
    slot: *mut usize,
    original: usize,
}

unsafe impl Send for GotPatch {}

static PATCHES: Mutex<Vec<GotPatch>> = Mutex::new(Vec::new());

thread_local! {
    static IN_SHIM: Cell<bool> = const { Cell::new(false) };
}

/// Lock-free open-addressed live-address table: address -> (size, trace).
struct LiveAddressTable {
    entries: AtomicUsize, // *mut Entry array
}

#[repr(C)]
struct LiveEntry {
    address: AtomicUsize,
    size: AtomicU64,
    trace: AtomicU64,
}

const LIVE_TABLE_CAPACITY: usize = 65536;

static LIVE_TABLE: LiveAddressTable = LiveAddressTable {
    entries: AtomicUsize::new(0),
};

impl LiveAddressTable {
    fn entries(&self) -> Option<&'static [LiveEntry]> {
        let ptr = self.entries.load(Ordering::Acquire) as *const LiveEntry;
        if ptr.is_null() {
            return None;
        }
        Some(unsafe { std::slice::from_raw_parts(ptr, LIVE_TABLE_CAPACITY) })
    }

    fn ensure(&self) -> bool {
        if self.entries.load(Ordering::Acquire) != 0 {
            return true;
        }
        let ptr = os::safe_alloc(LIVE_TABLE_CAPACITY * std::mem::size_of::<LiveEntry>());
        if ptr.is_null() {
            return false;
        }
        if self
            .entries
            .compare_exchange(0, ptr as usize, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            os::safe_free(ptr, LIVE_TABLE_CAPACITY * std::mem::size_of::<LiveEntry>());
        }
        true
    }

    fn insert(&self, address: usize, size: u64, trace: u64) {
        let Some(entries) = self.entries() else { return };
        let mut index = (address >> 4) & (LIVE_TABLE_CAPACITY - 1);
        for _ in 0..64 {
            let entry = &entries[index];
            let current = entry.address.load(Ordering::Acquire);
            if current == 0 || current == address {
                if entry
                    .address
                    .compare_exchange(current, address, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    entry.size.store(size, Ordering::Relaxed);
                    entry.trace.store(trace, Ordering::Release);
                    return;
                }
            }
            index = (index + 1) & (LIVE_TABLE_CAPACITY - 1);
        }
    }

    /// Removes `address`, returning its recorded (size, trace).
    fn remove(&self, address: usize) -> Option<(u64, u64)> {
        let entries = self.entries()?;
        let mut index = (address >> 4) & (LIVE_TABLE_CAPACITY - 1);
        for _ in 0..64 {
            let entry = &entries[index];
            let current = entry.address.load(Ordering::Acquire);
            if current == address {
                let size = entry.size.load(Ordering::Relaxed);
                let trace = entry.trace.load(Ordering::Acquire);
                if entry
                    .address
                    .compare_exchange(address, usize::MAX, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Some((size, trace));
                }
            }
            if current == 0 {
                return None;
            }
            index = (index + 1) & (LIVE_TABLE_CAPACITY - 1);
        }
        None
    }
}

fn running() -> bool {
    RUNNING.load(Ordering::Acquire) != 0
}

fn record_malloc(address: usize, size: u64) {
    if !running() || address == 0 {
        return;
    }
    let sampled = update_counter(&ALLOCATED_BYTES, size, INTERVAL.load(Ordering::Relaxed));
    if !sampled {
        return;
    }
    let profiler = Profiler::instance();
    let event = Event::Malloc(MallocEvent {
        start_time: tsc::ticks(),
        address: address as u64,
        size,
    });
    let trace = profiler.record_sample(std::ptr::null_mut(), size, EventType::Malloc, &event);
    LIVE_TABLE.insert(address, size, trace as u64);
}

fn record_free(address: usize) {
    if !running() || address == 0 {
        return;
    }
    // Only frees of sampled allocations are interesting; everything else
    // would drown the output.
    if let Some((size, _trace)) = LIVE_TABLE.remove(address) {
        let event = Event::Free(MallocEvent {
            start_time: tsc::ticks(),
            address: address as u64,
            size,
        });
        Profiler::instance().record_sample(std::ptr::null_mut(), 0, EventType::Free, &event);
    }
}

macro_rules! real {
    ($slot:expr, $ty:ty) => {{
        let raw = $slot.load(Ordering::Acquire);
        if raw == 0 {
            None
        } else {
            Some(unsafe { std::mem::transmute::<usize, $ty>(raw) })
        }
    }};
}

fn with_guard<T>(f: impl FnOnce(bool) -> T) -> T {
    IN_SHIM.with(|guard| {
        let reentered = guard.replace(true);
        let result = f(reentered);
        guard.set(reentered);
        result
    })
}

unsafe extern "C" fn malloc_shim(size: libc::size_t) -> *mut c_void {
    let Some(real) = real!(REAL_MALLOC, unsafe extern "C" fn(libc::size_t) -> *mut c_void) else {
        return std::ptr::null_mut();
    };
    with_guard(|reentered| {
        let ptr = unsafe { real(size) };
        if !reentered {
            record_malloc(ptr as usize, size as u64);
        }
        ptr
    })
}

unsafe extern "C" fn calloc_shim(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
    let Some(real) =
        real!(REAL_CALLOC, unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void)
    else {
        return std::ptr::null_mut();
    };
    with_guard(|reentered| {
        let ptr = unsafe { real(nmemb, size) };
        if !reentered {
            record_malloc(ptr as usize, (nmemb * size) as u64);
        }
        ptr
    })
}

unsafe extern "C" fn realloc_shim(old: *mut c_void, size: libc::size_t) -> *mut c_void {
    let Some(real) =
        real!(REAL_REALLOC, unsafe extern "C" fn(*mut c_void, libc::size_t) -> *mut c_void)
    else {
        return std::ptr::null_mut();
    };
    with_guard(|reentered| {
        let ptr = unsafe { real(old, size) };
        if !reentered {
            if !old.is_null() {
                record_free(old as usize);
            }
            record_malloc(ptr as usize, size as u64);
        }
        ptr
    })
}

unsafe extern "C" fn free_shim(ptr: *mut c_void) {
    let Some(real) = real!(REAL_FREE, unsafe extern "C" fn(*mut c_void)) else {
        return;
    };
    with_guard(|reentered| {
        if !reentered {
            record_free(ptr as usize);
        }
        unsafe { real(ptr) };
    })
}

unsafe extern "C" fn posix_memalign_shim(
    out: *mut *mut c_void,
    alignment: libc::size_t,
    size: libc::size_t,
) -> libc::c_int {
    let Some(real) = real!(
        REAL_POSIX_MEMALIGN,
        unsafe extern "C" fn(*mut *mut c_void, libc::size_t, libc::size_t) -> libc::c_int
    ) else {
        return libc::ENOMEM;
    };
    with_guard(|reentered| {
        let rc = unsafe { real(out, alignment, size) };
        if !reentered && rc == 0 {
            record_malloc(unsafe { *out } as usize, size as u64);
        }
        rc
    })
}

unsafe extern "C" fn aligned_alloc_shim(
    alignment: libc::size_t,
    size: libc::size_t,
) -> *mut c_void {
    let Some(real) = real!(
        REAL_ALIGNED_ALLOC,
        unsafe extern "C" fn(libc::size_t, libc::size_t) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    with_guard(|reentered| {
        let ptr = unsafe { real(alignment, size) };
        if !reentered {
            record_malloc(ptr as usize, size as u64);
        }
        ptr
    })
}

unsafe extern "C" fn dlopen_shim(
    filename: *const libc::c_char,
    flags: libc::c_int,
) -> *mut c_void {
    let Some(real) = real!(
        REAL_DLOPEN,
        unsafe extern "C" fn(*const libc::c_char, libc::c_int) -> *mut c_void
    ) else {
        return std::ptr::null_mut();
    };
    let handle = real(filename, flags);
    // A newly loaded object brings fresh GOT entries.
    if running() && !handle.is_null() {
        Profiler::instance().refresh_libraries();
        patch_libraries();
    }
    handle
}

fn hooks() -> [(&'static str, usize); 7] {
    [
        ("malloc", malloc_shim as usize),
        ("calloc", calloc_shim as usize),
        ("realloc", realloc_shim as usize),
        ("free", free_shim as usize),
        ("posix_memalign", posix_memalign_shim as usize),
        ("aligned_alloc", aligned_alloc_shim as usize),
        ("dlopen", dlopen_shim as usize),
    ]
}

fn resolve_real_functions() -> bool {
    for (name, slot) in [
        ("malloc", &REAL_MALLOC),
        ("calloc", &REAL_CALLOC),
        ("realloc", &REAL_REALLOC),
        ("free", &REAL_FREE),
        ("posix_memalign", &REAL_POSIX_MEMALIGN),
        ("aligned_alloc", &REAL_ALIGNED_ALLOC),
        ("dlopen", &REAL_DLOPEN),
    ] {
        let cname = std::ffi::CString::new(name).unwrap();
        let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, cname.as_ptr()) };
        let addr = if addr.is_null() {
            unsafe { libc::dlsym(libc::RTLD_DEFAULT, cname.as_ptr()) }
        } else {
            addr
        };
        if addr.is_null() {
            if name == "aligned_alloc" || name == "posix_memalign" {
                continue;
            }
            return false;
        }
        slot.store(addr as usize, Ordering::Release);
    }
    true
}

fn patch_slot(patches: &mut Vec<GotPatch>, slot: *mut usize, replacement: usize) {
    unsafe {
        let current = slot.read();
        if current == replacement || current == 0 {
            return;
        }
        let page = (slot as usize & !os::PAGE_MASK) as *mut u8;
        if !os::mprotect(page, os::PAGE_SIZE, libc::PROT_READ | libc::PROT_WRITE) {
            return;
        }
        slot.write(replacement);
        patches.push(GotPatch { slot, original: current });
    }
}

/// Rewrites the hook entries in every loaded object's GOT. Idempotent:
/// already-patched slots are skipped.
pub fn patch_libraries() {
    let libraries = Profiler::instance().libraries();
    let mut patches = PATCHES.lock();
    for library in libraries.iter() {
        // Our own shims must keep calling the real functions.
        if library.name.contains("asprof") {
            continue;
        }
        for (name, shim) in hooks() {
            if let Some(slot) = library.got_slot(name) {
                patch_slot(&mut patches, slot, shim);
            }
        }
    }
    debug!("native memory hooks patched in {} slots", patches.len());
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
pub struct MallocTracer;

impl Engine for MallocTracer {
    fn type_name(&self) -> &'static str {
        "malloc_tracer"
    }

    fn title(&self) -> &'static str {
        "Malloc/free profile"
    }

    fn units(&self) -> &'static str {
        "bytes"
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        if !resolve_real_functions() {
            return Err(ProfilerError::feasibility("cannot resolve allocator entry points"));
        }
        if !LIVE_TABLE.ensure() {
            return Err(ProfilerError::install("cannot allocate live address table"));
        }
        INTERVAL.store(args.nativemem.unwrap_or(0), Ordering::Relaxed);
        ALLOCATED_BYTES.store(0, Ordering::Relaxed);
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
    fn live_table_balance() {
        assert!(LIVE_TABLE.ensure());
        LIVE_TABLE.insert(0x7000_1000, 1_999_993, 42);
        let (size, trace) = LIVE_TABLE.remove(0x7000_1000).expect("tracked address");
        assert_eq!(size, 1_999_993);
        assert_eq!(trace, 42);
        assert!(LIVE_TABLE.remove(0x7000_1000).is_none());
    }

    #[test]
    fn untracked_free_is_ignored() {
        assert!(LIVE_TABLE.ensure());
        assert!(LIVE_TABLE.remove(0x1234_5678).is_none());
    }

    #[test]
    fn real_function_resolution() {
        assert!(resolve_real_functions());
        assert_ne!(REAL_MALLOC.load(Ordering::Relaxed), 0);
        assert_ne!(REAL_FREE.load(Ordering::Relaxed), 0);
    }
}
