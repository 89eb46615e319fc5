//! Per-thread tracing context: a `(span_id, root_span_id)` pair indexed by
//! OS thread id through a page table of lazily installed fixed-size pages.
//! Reads from uninitialized slots return the zero pair. After the one-time
//! atomic page install, reads and writes are async-signal-safe.

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::OnceLock;

use crate::os;

const PAGE_SHIFT: usize = 10;
const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Context {
    pub span_id: u64,
    pub root_span_id: u64,
}

#[repr(C)]
struct Slot {
    span_id: AtomicU64,
    root_span_id: AtomicU64,
}

pub struct Contexts {
    pages: Box<[AtomicPtr<Slot>]>,
}

static CONTEXTS: OnceLock<Contexts> = OnceLock::new();

impl Contexts {
    fn new() -> Self {
        let max_pages = (os::max_thread_id() as usize >> PAGE_SHIFT) + 1;
        let mut pages = Vec::with_capacity(max_pages);
        for _ in 0..max_pages {
            pages.push(AtomicPtr::new(ptr::null_mut()));
        }
        Contexts {
            pages: pages.into_boxed_slice(),
        }
    }

    pub fn instance() -> &'static Contexts {
        CONTEXTS.get_or_init(Contexts::new)
    }

    fn page(&self, tid: i32) -> Option<&AtomicPtr<Slot>> {
        self.pages.get(tid as usize >> PAGE_SHIFT)
    }

    fn slot(&self, tid: i32) -> Option<*mut Slot> {
        let page = self.page(tid)?.load(Ordering::Acquire);
        if page.is_null() {
            return None;
        }
        Some(unsafe { page.add(tid as usize & (PAGE_SIZE - 1)) })
    }

    /// Installs the page covering `tid` if it is not mapped yet. Must be
    /// called from a regular context; the signal path only reads.
    pub fn initialize(&self, tid: i32) -> bool {
        let Some(entry) = self.page(tid) else {
            return false;
        };
        if !entry.load(Ordering::Acquire).is_null() {
            return true;
        }
        let page = os::safe_alloc(PAGE_SIZE * std::mem::size_of::<Slot>()) as *mut Slot;
        if page.is_null() {
            return false;
        }
        if entry
            .compare_exchange(ptr::null_mut(), page, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            os::safe_free(page as *mut u8, PAGE_SIZE * std::mem::size_of::<Slot>());
        }
        true
    }

    pub fn set(&self, tid: i32, context: Context) {
        if !self.initialize(tid) {
            return;
        }
        if let Some(slot) = self.slot(tid) {
            unsafe {
                (*slot).span_id.store(context.span_id, Ordering::Relaxed);
                (*slot).root_span_id.store(context.root_span_id, Ordering::Release);
            }
        }
    }

    pub fn clear(&self, tid: i32) {
        self.set(tid, Context::default());
    }

    /// Reads the context for `tid`; zero pair when the slot was never set.
    /// Async-signal-safe.
    pub fn get(&self, tid: i32) -> Context {
        match self.slot(tid) {
            Some(slot) => unsafe {
                Context {
                    root_span_id: (*slot).root_span_id.load(Ordering::Acquire),
                    span_id: (*slot).span_id.load(Ordering::Relaxed),
                }
            },
            None => Context::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_slot_reads_zero() {
        let contexts = Contexts::instance();
        assert_eq!(contexts.get(12345), Context::default());
    }

    #[test]
    fn set_then_get() {
        let contexts = Contexts::instance();
        let tid = os::thread_id();
        contexts.set(tid, Context { span_id: 7, root_span_id: 9 });
        assert_eq!(contexts.get(tid), Context { span_id: 7, root_span_id: 9 });
        contexts.clear(tid);
        assert_eq!(contexts.get(tid), Context::default());
    }

    #[test]
    fn out_of_range_tid_is_ignored() {
        let contexts = Contexts::instance();
        let huge = i32::MAX;
        contexts.set(huge, Context { span_id: 1, root_span_id: 1 });
        assert_eq!(contexts.get(huge), Context::default());
    }
}
