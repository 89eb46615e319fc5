//! Thread filter: a lock-free bitmap over OS thread ids. Used by the
//! `threads` option and by begin/end gating to restrict sampling to threads
//! that opted in. All operations are async-signal-safe after construction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::os;

pub struct ThreadFilter {
    bits: Box<[AtomicU64]>,
    enabled: AtomicBool,
}

impl ThreadFilter {
    pub fn new() -> Self {
        let words = (os::max_thread_id() as usize + 63) / 64;
        let mut bits = Vec::with_capacity(words);
        for _ in 0..words {
            bits.push(AtomicU64::new(0));
        }
        ThreadFilter {
            bits: bits.into_boxed_slice(),
            enabled: AtomicBool::new(false),
        }
    }

    pub fn init(&self, enabled: bool) {
        self.clear();
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn accept(&self, tid: i32) -> bool {
        match self.bits.get(tid as usize / 64) {
            Some(word) => word.load(Ordering::Relaxed) & (1 << (tid as usize % 64)) != 0,
            None => false,
        }
    }

    pub fn add(&self, tid: i32) {
        if let Some(word) = self.bits.get(tid as usize / 64) {
            word.fetch_or(1 << (tid as usize % 64), Ordering::Relaxed);
        }
    }

    pub fn remove(&self, tid: i32) {
        if let Some(word) = self.bits.get(tid as usize / 64) {
            word.fetch_and(!(1 << (tid as usize % 64)), Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        for word in self.bits.iter() {
            word.store(0, Ordering::Relaxed);
        }
    }

    /// Visits all accepted thread ids.
    pub fn collect(&self, mut visit: impl FnMut(i32)) {
        for (i, word) in self.bits.iter().enumerate() {
            let mut value = word.load(Ordering::Relaxed);
            while value != 0 {
                let bit = value.trailing_zeros() as usize;
                visit((i * 64 + bit) as i32);
                value &= value - 1;
            }
        }
    }
}

impl Default for ThreadFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_remove_accept() {
        let filter = ThreadFilter::new();
        filter.init(true);
        assert!(!filter.accept(10));
        filter.add(10);
        filter.add(64);
        filter.add(65);
        assert!(filter.accept(10) && filter.accept(64) && filter.accept(65));
        filter.remove(64);
        assert!(!filter.accept(64) && filter.accept(65));
    }

    #[test]
    fn collect_returns_sorted_ids() {
        let filter = ThreadFilter::new();
        filter.init(true);
        for tid in [3, 100, 7, 500] {
            filter.add(tid);
        }
        let mut seen = Vec::new();
        filter.collect(|tid| seen.push(tid));
        assert_eq!(seen, vec![3, 7, 100, 500]);
    }
}
