//! Bump allocator safe to call from a signal handler.
//!
//! Memory comes straight from `mmap` in fixed-size chunks, never from the
//! process allocator. Allocation bumps an atomic offset with CAS; once an
//! allocation steps past the middle of a chunk, the caller reserves the next
//! chunk ahead of time so a later allocation inside a signal handler does not
//! have to wait for the kernel. Pointers stay valid until [`Arena::clear`].

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::os;

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[repr(C)]
struct Chunk {
    prev: *mut Chunk,
    offs: AtomicUsize,
}

const HEADER_SIZE: usize = std::mem::size_of::<Chunk>();

pub struct Arena {
    chunk_size: usize,
    tail: AtomicPtr<Chunk>,
    reserve: AtomicPtr<Chunk>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new(chunk_size: usize) -> Self {
        let arena = Arena {
            chunk_size,
            tail: AtomicPtr::new(ptr::null_mut()),
            reserve: AtomicPtr::new(ptr::null_mut()),
        };
        let head = arena.allocate_chunk(ptr::null_mut());
        arena.tail.store(head, Ordering::Relaxed);
        arena.reserve.store(head, Ordering::Relaxed);
        arena
    }

    /// Returns a pointer to `size` zeroed bytes, or null if the OS refused
    /// to hand out a new chunk. Never blocks, never reuses freed memory.
    pub fn alloc(&self, size: usize) -> *mut u8 {
        let size = (size + 7) & !7;
        let mut chunk = self.tail.load(Ordering::Acquire);

        while !chunk.is_null() {
            unsafe {
                let offs = &(*chunk).offs;
                let mut current = offs.load(Ordering::Relaxed);
                while current + size <= self.chunk_size {
                    match offs.compare_exchange_weak(
                        current,
                        current + size,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            let mid = self.chunk_size / 2;
                            if current <= mid && mid - current < size {
                                // Stepped over the middle of the chunk:
                                // time to prepare the next one.
                                self.reserve_chunk(chunk);
                            }
                            return (chunk as *mut u8).add(current);
                        }
                        Err(actual) => current = actual,
                    }
                }
            }
            chunk = self.next_chunk(chunk);
        }

        ptr::null_mut()
    }

    pub fn clear(&self) {
        unsafe {
            let tail = self.tail.load(Ordering::Relaxed);
            let reserve = self.reserve.load(Ordering::Relaxed);
            if !reserve.is_null() && (*reserve).prev == tail {
                self.free_chunk(reserve);
            }
            let mut chunk = tail;
            while !(*chunk).prev.is_null() {
                let prev = (*chunk).prev;
                self.free_chunk(chunk);
                chunk = prev;
            }
            self.tail.store(chunk, Ordering::Relaxed);
            self.reserve.store(chunk, Ordering::Relaxed);
            (*chunk).offs.store(HEADER_SIZE, Ordering::Relaxed);
        }
    }

    pub fn used_memory(&self) -> usize {
        let mut bytes = 0;
        unsafe {
            let tail = self.tail.load(Ordering::Relaxed);
            let reserve = self.reserve.load(Ordering::Relaxed);
            if !reserve.is_null() && (*reserve).prev == tail {
                bytes += self.chunk_size;
            }
            let mut chunk = tail;
            while !chunk.is_null() {
                bytes += self.chunk_size;
                chunk = (*chunk).prev;
            }
        }
        bytes
    }

    fn allocate_chunk(&self, prev: *mut Chunk) -> *mut Chunk {
        let chunk = os::safe_alloc(self.chunk_size) as *mut Chunk;
        if !chunk.is_null() {
            unsafe {
                (*chunk).prev = prev;
                (*chunk).offs = AtomicUsize::new(HEADER_SIZE);
            }
        }
        chunk
    }

    fn free_chunk(&self, chunk: *mut Chunk) {
        os::safe_free(chunk as *mut u8, self.chunk_size);
    }

    fn reserve_chunk(&self, current: *mut Chunk) {
        let reserve = self.allocate_chunk(current);
        if !reserve.is_null()
            && self
                .reserve
                .compare_exchange(current, reserve, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            // Lost the race; another thread already reserved.
            self.free_chunk(reserve);
        }
    }

    fn next_chunk(&self, current: *mut Chunk) -> *mut Chunk {
        let mut reserve = self.reserve.load(Ordering::Acquire);

        if reserve == current {
            // No reserve yet; it is probably being allocated right now,
            // so compete for it.
            reserve = self.allocate_chunk(current);
            if reserve.is_null() {
                return ptr::null_mut();
            }
            match self.reserve.compare_exchange(
                current,
                reserve,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {}
                Err(winner) => {
                    self.free_chunk(reserve);
                    reserve = winner;
                }
            }
        }

        match self
            .tail
            .compare_exchange(current, reserve, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => reserve,
            Err(tail) => tail,
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.clear();
        let head = self.tail.load(Ordering::Relaxed);
        if !head.is_null() {
            self.free_chunk(head);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allocations_do_not_overlap() {
        let arena = Arena::new(4096);
        let a = arena.alloc(100);
        let b = arena.alloc(100);
        assert!(!a.is_null() && !b.is_null());
        assert!(b as usize >= a as usize + 100);
    }

    #[test]
    fn pointers_survive_chunk_growth() {
        let arena = Arena::new(4096);
        let first = arena.alloc(64);
        unsafe { ptr::write_bytes(first, 0xab, 64) };
        // Force growth past the first chunk.
        for _ in 0..256 {
            assert!(!arena.alloc(512).is_null());
        }
        unsafe {
            for i in 0..64 {
                assert_eq!(*first.add(i), 0xab);
            }
        }
        assert!(arena.used_memory() >= 2 * 4096);
    }

    #[test]
    fn clear_resets_to_one_chunk() {
        let arena = Arena::new(4096);
        for _ in 0..64 {
            arena.alloc(512);
        }
        arena.clear();
        assert!(arena.used_memory() <= 2 * 4096);
        assert!(!arena.alloc(16).is_null());
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let arena = Arc::new(Arena::new(64 * 1024));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let arena = arena.clone();
            handles.push(std::thread::spawn(move || {
                let mut ptrs = Vec::new();
                for _ in 0..500 {
                    let p = arena.alloc(24);
                    if !p.is_null() {
                        ptrs.push(p as usize);
                    }
                }
                ptrs
            }));
        }
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let count = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), count);
    }
}
