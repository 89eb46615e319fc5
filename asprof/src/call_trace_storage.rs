//! Lock-free interning store for call traces.
//!
//! A chain of power-of-two hash tables maps the 64-bit MurmurHash of a frame
//! array to a `(trace, samples, counter)` slot. Keys are installed once by
//! CAS and never change; the trace pointer is published with release
//! semantics after the frames are copied through the arena, so a reader that
//! observes the pointer observes the frames. When a table passes 75% load a
//! successor of double capacity is installed and becomes the write target;
//! readers walk the chain newest to oldest. The externally visible 32-bit
//! trace id encodes the table of origin, which keeps ids stable across
//! rehashes.
//!
//! `put` is called from signal handlers: no process allocator, no locks, no
//! memcpy.

use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};

use crate::arena::Arena;
use crate::frame::Frame;
use crate::os;

pub const OVERFLOW_TRACE_ID: u32 = 0x7fff_ffff;
const DEFAULT_INITIAL_CAPACITY: u32 = 65536;
const CALL_TRACE_CHUNK: usize = 8 * 1024 * 1024;

#[repr(C)]
struct CallTraceSample {
    trace: AtomicPtr<u8>,
    samples: AtomicU64,
    counter: AtomicU64,
}

// Stored in arena memory as a u64 frame count followed by the frames.
const TRACE_HEADER: usize = 8;

#[repr(C)]
struct Table {
    prev: *mut Table,
    capacity: u32,
    size: AtomicU32,
}

const TABLE_HEADER: usize = std::mem::size_of::<Table>();

impl Table {
    fn alloc_size(capacity: u32) -> usize {
        TABLE_HEADER
            + capacity as usize
                * (std::mem::size_of::<AtomicU64>() + std::mem::size_of::<CallTraceSample>())
    }

    fn allocate(prev: *mut Table, capacity: u32) -> *mut Table {
        let table = os::safe_alloc(Self::alloc_size(capacity)) as *mut Table;
        if !table.is_null() {
            unsafe {
                (*table).prev = prev;
                (*table).capacity = capacity;
                (*table).size = AtomicU32::new(0);
            }
        }
        table
    }

    unsafe fn keys(table: *mut Table) -> *mut AtomicU64 {
        (table as *mut u8).add(TABLE_HEADER) as *mut AtomicU64
    }

    unsafe fn values(table: *mut Table) -> *mut CallTraceSample {
        Self::keys(table).add((*table).capacity as usize) as *mut CallTraceSample
    }
}

pub struct CallTraceStorage {
    allocator: Arena,
    current_table: AtomicPtr<Table>,
    initial_capacity: u32,
    overflow: AtomicU64,
}

unsafe impl Send for CallTraceStorage {}
unsafe impl Sync for CallTraceStorage {}

// MurmurHash64A over the raw frame bytes. Frames are 16 bytes with no
// padding holes, so the input is always a whole number of u64 words.
fn calc_hash(frames: &[Frame]) -> u64 {
    const M: u64 = 0xc6a4_a793_5bd1_e995;
    const R: u32 = 47;

    let len = frames.len() * std::mem::size_of::<Frame>();
    let mut h = (len as u64).wrapping_mul(M);

    let words = unsafe { slice::from_raw_parts(frames.as_ptr() as *const u64, frames.len() * 2) };
    for &word in words {
        let mut k = word.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h ^= k;
        h = h.wrapping_mul(M);
    }

    h ^= h >> R;
    h = h.wrapping_mul(M);
    h ^= h >> R;

    // 0 marks an empty slot.
    if h == 0 {
        M
    } else {
        h
    }
}

impl CallTraceStorage {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INITIAL_CAPACITY)
    }

    /// Smaller initial capacities exist for rehash testing; production use
    /// goes through [`CallTraceStorage::new`].
    pub fn with_capacity(initial_capacity: u32) -> Self {
        debug_assert!(initial_capacity.is_power_of_two());
        let storage = CallTraceStorage {
            allocator: Arena::new(CALL_TRACE_CHUNK),
            current_table: AtomicPtr::new(Table::allocate(ptr::null_mut(), initial_capacity)),
            initial_capacity,
            overflow: AtomicU64::new(0),
        };
        assert!(
            !storage.current_table.load(Ordering::Relaxed).is_null(),
            "cannot allocate initial call trace table"
        );
        storage
    }

    /// Interns `frames` and adds `(1, counter)` to its sample slot. Returns
    /// the stable trace id, or [`OVERFLOW_TRACE_ID`] on probe exhaustion.
    /// Async-signal-safe.
    pub fn put(&self, frames: &[Frame], counter: u64) -> u32 {
        let hash = calc_hash(frames);

        let table = self.current_table.load(Ordering::Acquire);
        let capacity = unsafe { (*table).capacity };
        let keys = unsafe { Table::keys(table) };
        let mut slot = (hash & (capacity as u64 - 1)) as u32;
        let mut step = 0u32;

        loop {
            let key = unsafe { (*keys.add(slot as usize)).load(Ordering::Acquire) };
            if key == hash {
                break;
            }
            if key == 0 {
                if unsafe {
                    (*keys.add(slot as usize))
                        .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                } {
                    continue;
                }

                // Crossing 75% load reserves the successor table ahead of
                // time so no put ever waits for the kernel.
                let size = unsafe { (*table).size.fetch_add(1, Ordering::AcqRel) + 1 };
                if size == capacity / 4 * 3 {
                    let new_table = Table::allocate(table, capacity * 2);
                    if !new_table.is_null()
                        && self
                            .current_table
                            .compare_exchange(table, new_table, Ordering::AcqRel, Ordering::Acquire)
                            .is_err()
                    {
                        os::safe_free(new_table as *mut u8, Table::alloc_size(capacity * 2));
                    }
                }

                // Migrate the trace from an older table when possible to
                // avoid a second arena copy.
                let prev = unsafe { (*table).prev };
                let mut trace = if prev.is_null() {
                    ptr::null_mut()
                } else {
                    Self::find_call_trace(prev, hash)
                };
                if trace.is_null() {
                    trace = self.store_call_trace(frames);
                }
                unsafe {
                    (*Table::values(table).add(slot as usize))
                        .trace
                        .store(trace, Ordering::Release);
                }
                break;
            }

            step += 1;
            if step >= capacity {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                return OVERFLOW_TRACE_ID;
            }
            slot = (slot + step) & (capacity - 1);
        }

        if counter != 0 {
            unsafe {
                let sample = &*Table::values(table).add(slot as usize);
                sample.samples.fetch_add(1, Ordering::Relaxed);
                sample.counter.fetch_add(counter, Ordering::Relaxed);
            }
        }

        capacity - (self.initial_capacity - 1) + slot
    }

    /// Adds to a known trace's counters without re-hashing the frames.
    pub fn add(&self, trace_id: u32, counter: u64) {
        if trace_id == OVERFLOW_TRACE_ID || trace_id == 0 {
            return;
        }
        let slot_plus_capacity = trace_id + (self.initial_capacity - 1);
        let mut table = self.current_table.load(Ordering::Acquire);
        while !table.is_null() {
            let capacity = unsafe { (*table).capacity };
            if slot_plus_capacity >= capacity {
                unsafe {
                    let sample = &*Table::values(table).add((slot_plus_capacity - capacity) as usize);
                    sample.samples.fetch_add(1, Ordering::Relaxed);
                    sample.counter.fetch_add(counter, Ordering::Relaxed);
                }
                return;
            }
            table = unsafe { (*table).prev };
        }
    }

    fn store_call_trace(&self, frames: &[Frame]) -> *mut u8 {
        let buf = self
            .allocator
            .alloc(TRACE_HEADER + std::mem::size_of_val(frames));
        if buf.is_null() {
            return buf;
        }
        unsafe {
            (buf as *mut u64).write(frames.len() as u64);
            let dst = buf.add(TRACE_HEADER) as *mut Frame;
            // Copied element-wise: memcpy is off-limits in a signal handler.
            for (i, &frame) in frames.iter().enumerate() {
                dst.add(i).write(frame);
            }
        }
        buf
    }

    fn find_call_trace(table: *mut Table, hash: u64) -> *mut u8 {
        unsafe {
            let capacity = (*table).capacity;
            let keys = Table::keys(table);
            let mut slot = (hash & (capacity as u64 - 1)) as u32;
            let mut step = 0u32;

            loop {
                let key = (*keys.add(slot as usize)).load(Ordering::Acquire);
                if key == hash {
                    return (*Table::values(table).add(slot as usize))
                        .trace
                        .load(Ordering::Acquire);
                }
                if key == 0 {
                    return ptr::null_mut();
                }
                step += 1;
                if step >= capacity {
                    return ptr::null_mut();
                }
                slot = (slot + step) & (capacity - 1);
            }
        }
    }

    unsafe fn trace_frames<'a>(trace: *const u8) -> &'a [Frame] {
        let num_frames = (trace as *const u64).read() as usize;
        slice::from_raw_parts(trace.add(TRACE_HEADER) as *const Frame, num_frames)
    }

    /// Resolves every interned trace id. Does not reset any counters, so the
    /// same id keeps resolving to byte-identical frames across calls.
    pub fn collect_traces(&self, mut visit: impl FnMut(u32, &[Frame])) {
        let mut table = self.current_table.load(Ordering::Acquire);
        while !table.is_null() {
            unsafe {
                let capacity = (*table).capacity;
                let keys = Table::keys(table);
                let values = Table::values(table);
                for slot in 0..capacity {
                    if (*keys.add(slot as usize)).load(Ordering::Acquire) != 0 {
                        let trace = (*values.add(slot as usize)).trace.load(Ordering::Acquire);
                        if !trace.is_null() {
                            let trace_id = capacity - (self.initial_capacity - 1) + slot;
                            visit(trace_id, Self::trace_frames(trace));
                        }
                    }
                }
                table = (*table).prev;
            }
        }
        if self.overflow.load(Ordering::Relaxed) > 0 {
            visit(OVERFLOW_TRACE_ID, &[]);
        }
    }

    /// Drains accumulated samples for the writer: visits every trace with a
    /// nonzero sample count and resets the per-slot counts so the next dump
    /// chunk does not double-report. The trace frames stay interned.
    pub fn collect_samples(&self, mut visit: impl FnMut(u32, &[Frame], u64, u64)) {
        let mut table = self.current_table.load(Ordering::Acquire);
        while !table.is_null() {
            unsafe {
                let capacity = (*table).capacity;
                let keys = Table::keys(table);
                let values = Table::values(table);
                for slot in 0..capacity {
                    if (*keys.add(slot as usize)).load(Ordering::Acquire) == 0 {
                        continue;
                    }
                    let sample = &*values.add(slot as usize);
                    let samples = sample.samples.swap(0, Ordering::AcqRel);
                    if samples == 0 {
                        continue;
                    }
                    let counter = sample.counter.swap(0, Ordering::AcqRel);
                    let trace = sample.trace.load(Ordering::Acquire);
                    if !trace.is_null() {
                        let trace_id = capacity - (self.initial_capacity - 1) + slot;
                        visit(trace_id, Self::trace_frames(trace), samples, counter);
                    }
                }
                table = (*table).prev;
            }
        }
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn used_memory(&self) -> usize {
        let mut bytes = self.allocator.used_memory();
        let mut table = self.current_table.load(Ordering::Acquire);
        while !table.is_null() {
            unsafe {
                bytes += Table::alloc_size((*table).capacity);
                table = (*table).prev;
            }
        }
        bytes
    }

    /// Drops all tables but the oldest and clears the arena. Not safe to run
    /// concurrently with `put`; the profiler only clears while stopped.
    pub fn clear(&self) {
        unsafe {
            let mut table = self.current_table.load(Ordering::Acquire);
            while !(*table).prev.is_null() {
                let prev = (*table).prev;
                os::safe_free(table as *mut u8, Table::alloc_size((*table).capacity));
                table = prev;
            }
            let capacity = (*table).capacity;
            ptr::write_bytes(
                Table::keys(table) as *mut u8,
                0,
                capacity as usize
                    * (std::mem::size_of::<AtomicU64>() + std::mem::size_of::<CallTraceSample>()),
            );
            (*table).size.store(0, Ordering::Relaxed);
            self.current_table.store(table, Ordering::Release);
        }
        self.allocator.clear();
        self.overflow.store(0, Ordering::Relaxed);
    }
}

impl Default for CallTraceStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for CallTraceStorage {
    fn drop(&mut self) {
        unsafe {
            let mut table = self.current_table.load(Ordering::Relaxed);
            while !table.is_null() {
                let prev = (*table).prev;
                os::safe_free(table as *mut u8, Table::alloc_size((*table).capacity));
                table = prev;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameTypeId;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn frame(method: u64, bci: i32) -> Frame {
        Frame::managed(FrameTypeId::JitCompiled, bci, method)
    }

    #[test]
    fn put_resolves_to_identical_frames() {
        let storage = CallTraceStorage::new();
        let frames = [frame(1, 10), frame(2, 20), frame(3, 30)];
        let id = storage.put(&frames, 5);
        assert_ne!(id, OVERFLOW_TRACE_ID);

        let mut resolved = HashMap::new();
        storage.collect_traces(|trace_id, trace_frames| {
            resolved.insert(trace_id, trace_frames.to_vec());
        });
        assert_eq!(resolved[&id], frames.to_vec());
    }

    #[test]
    fn same_frames_same_id() {
        let storage = CallTraceStorage::new();
        let frames = [frame(7, 1)];
        assert_eq!(storage.put(&frames, 1), storage.put(&frames, 1));
        assert_ne!(storage.put(&frames, 1), storage.put(&[frame(8, 1)], 1));
    }

    #[test]
    fn empty_trace_gets_valid_distinct_id() {
        let storage = CallTraceStorage::new();
        let empty_id = storage.put(&[], 1);
        let other_id = storage.put(&[frame(1, 1)], 1);
        assert_ne!(empty_id, OVERFLOW_TRACE_ID);
        assert_ne!(empty_id, other_id);

        let mut seen = false;
        storage.collect_traces(|trace_id, frames| {
            if trace_id == empty_id {
                assert!(frames.is_empty());
                seen = true;
            }
        });
        assert!(seen);
    }

    #[test]
    fn counters_sum_exactly() {
        let storage = CallTraceStorage::new();
        let frames = [frame(1, 1), frame(2, 2)];
        let mut expected = 0u64;
        for i in 1..=100u64 {
            storage.put(&frames, i);
            expected += i;
        }
        let mut total_counter = 0;
        let mut total_samples = 0;
        storage.collect_samples(|_, _, samples, counter| {
            total_samples += samples;
            total_counter += counter;
        });
        assert_eq!(total_counter, expected);
        assert_eq!(total_samples, 100);

        // Drained by the first collect.
        let mut second = 0;
        storage.collect_samples(|_, _, samples, _| second += samples);
        assert_eq!(second, 0);
    }

    #[test]
    fn add_increments_without_rehash() {
        let storage = CallTraceStorage::new();
        let id = storage.put(&[frame(1, 1)], 10);
        storage.add(id, 32);
        let mut counter = 0;
        let mut samples = 0;
        storage.collect_samples(|trace_id, _, s, c| {
            assert_eq!(trace_id, id);
            samples = s;
            counter = c;
        });
        assert_eq!(samples, 2);
        assert_eq!(counter, 42);
    }

    #[test]
    fn ids_stay_stable_across_rehash() {
        // 64-slot table rehashes at 48 entries.
        let storage = CallTraceStorage::with_capacity(64);
        let mut ids = HashMap::new();
        for i in 0..100u64 {
            let frames = [frame(i + 1, 0)];
            ids.insert(storage.put(&frames, 1), frames.to_vec());
        }
        assert_eq!(ids.len(), 100, "distinct traces must get distinct ids");

        let mut resolved = 0;
        storage.collect_traces(|trace_id, frames| {
            if let Some(expected) = ids.get(&trace_id) {
                assert_eq!(frames, &expected[..]);
                resolved += 1;
            }
        });
        assert_eq!(resolved, 100);

        // Ids handed out before the rehash still resolve through `add`.
        for (&id, frames) in &ids {
            storage.add(id, 1);
            let _ = frames;
        }
        let mut samples = 0;
        storage.collect_samples(|_, _, s, _| samples += s);
        assert_eq!(samples, 200);
    }

    #[test]
    fn concurrent_puts_never_lose_counts() {
        let storage = Arc::new(CallTraceStorage::with_capacity(256));
        const THREADS: u64 = 4;
        const TRACES: u64 = 300;
        const REPEATS: u64 = 20;

        let mut handles = Vec::new();
        for t in 0..THREADS {
            let storage = storage.clone();
            handles.push(std::thread::spawn(move || {
                for r in 0..REPEATS {
                    for i in 0..TRACES {
                        let frames = [frame(i + 1, 0), frame(t + 1000, 0)];
                        let id = storage.put(&frames, 1);
                        assert_ne!(id, OVERFLOW_TRACE_ID);
                        let _ = r;
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let mut samples = 0;
        let mut counter = 0;
        storage.collect_samples(|_, _, s, c| {
            samples += s;
            counter += c;
        });
        assert_eq!(samples, THREADS * TRACES * REPEATS);
        assert_eq!(counter, THREADS * TRACES * REPEATS);
    }

    #[test]
    fn clear_resets_everything() {
        let storage = CallTraceStorage::with_capacity(64);
        for i in 0..100u64 {
            storage.put(&[frame(i, 0)], 1);
        }
        storage.clear();
        let mut count = 0;
        storage.collect_traces(|_, _| count += 1);
        assert_eq!(count, 0);
        // Still usable after clear.
        assert_ne!(storage.put(&[frame(1, 1)], 1), OVERFLOW_TRACE_ID);
    }
}
