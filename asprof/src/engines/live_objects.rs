//! Live-object tracking on top of the sampled-object engine.
//!
//! Each sampled allocation is remembered in a fixed-size open-addressed ring
//! keyed by the object handle, together with its size, trace id and the GC
//! epoch at allocation time. A garbage-collection-start hook bumps the
//! epoch. On engine stop, objects that are still reachable and have
//! survived at least `gc_threshold` collections are emitted as live-object
//! events.
//!
//! Liveness of an opaque handle is decided by a probe the runtime binding
//! registers; tests install their own.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::event::{Event, EventType, LiveObjectEvent};
use crate::profiler::Profiler;
use crate::tsc;

const RING_SIZE: usize = 1024;
const DEFAULT_GC_THRESHOLD: u64 = 0;

#[derive(Default, Clone, Copy)]
struct LiveObjectInfo {
    handle: u64,
    size: u64,
    trace: u64,
    time: u64,
    gc_epoch: u64,
}

struct LiveRefs {
    entries: Mutex<Vec<LiveObjectInfo>>,
    full: AtomicBool,
}

static LIVE: LiveRefs = LiveRefs {
    entries: Mutex::new(Vec::new()),
    full: AtomicBool::new(false),
};
static ENABLED: AtomicBool = AtomicBool::new(false);
static GC_EPOCH: AtomicU64 = AtomicU64::new(0);
static GC_THRESHOLD: AtomicU64 = AtomicU64::new(DEFAULT_GC_THRESHOLD);

type LivenessProbe = fn(handle: u64) -> bool;
static LIVENESS_PROBE: AtomicUsize = AtomicUsize::new(0);

/// Registers the probe deciding whether an object handle is still
/// reachable. Without one, every tracked handle counts as live.
pub fn set_liveness_probe(probe: LivenessProbe) {
    LIVENESS_PROBE.store(probe as usize, Ordering::Release);
}

fn is_live(handle: u64) -> bool {
    let raw = LIVENESS_PROBE.load(Ordering::Acquire);
    if raw == 0 {
        return true;
    }
    let probe: LivenessProbe = unsafe { std::mem::transmute(raw) };
    probe(handle)
}

pub fn init(enabled: bool) {
    ENABLED.store(enabled, Ordering::Release);
    LIVE.full.store(false, Ordering::Relaxed);
    let mut entries = LIVE.entries.lock();
    entries.clear();
    entries.resize(RING_SIZE, LiveObjectInfo::default());
}

pub fn set_gc_threshold(threshold: u64) {
    GC_THRESHOLD.store(threshold, Ordering::Relaxed);
}

/// Garbage-collection-start hook: new epoch, and dead slots become
/// reusable again.
pub fn on_gc_start() {
    GC_EPOCH.fetch_add(1, Ordering::Relaxed);
    LIVE.full.store(false, Ordering::Relaxed);
}

pub fn current_gc_epoch() -> u64 {
    GC_EPOCH.load(Ordering::Relaxed)
}

/// Remembers one sampled allocation. `trace` packs `(tid << 32) | trace_id`
/// the way external-sample records carry it.
pub fn track(handle: u64, size: u64, trace: u64) {
    if !ENABLED.load(Ordering::Acquire) || LIVE.full.load(Ordering::Relaxed) {
        return;
    }
    let Some(mut entries) = LIVE.entries.try_lock() else {
        return;
    };
    if entries.is_empty() {
        return;
    }
    let len = entries.len();
    let start = (handle >> 4).wrapping_add(trace) as usize & (len - 1);
    let mut index = start;
    loop {
        let slot = &mut entries[index];
        if slot.handle == 0 || !is_live(slot.handle) {
            *slot = LiveObjectInfo {
                handle,
                size,
                trace,
                time: tsc::ticks(),
                gc_epoch: current_gc_epoch(),
            };
            return;
        }
        index = (index + 1) & (len - 1);
        if index == start {
            LIVE.full.store(true, Ordering::Relaxed);
            return;
        }
    }
}

/// Emits a live-object event for every tracked object that is still
/// reachable and has survived the GC-epoch threshold.
pub fn dump_live_refs() {
    if !ENABLED.load(Ordering::Acquire) {
        return;
    }
    let profiler = Profiler::instance();
    let threshold = GC_THRESHOLD.load(Ordering::Relaxed);
    let current_epoch = current_gc_epoch();

    let mut entries = LIVE.entries.lock();
    for slot in entries.iter_mut() {
        if slot.handle == 0 || !is_live(slot.handle) {
            continue;
        }
        let meets_filter = if threshold == 0 {
            true
        } else if slot.gc_epoch > current_epoch {
            // Epoch wrapped; do not emit rather than guess.
            false
        } else {
            current_epoch - slot.gc_epoch >= threshold
        };
        if meets_filter {
            let event = Event::LiveObject(LiveObjectEvent {
                start_time: tsc::ticks(),
                class_id: 0,
                alloc_size: slot.size,
                alloc_time: slot.time,
            });
            let tid = (slot.trace >> 32) as i32;
            let call_trace_id = slot.trace as u32;
            profiler.record_external_samples(
                1,
                slot.size,
                tid,
                call_trace_id,
                EventType::LiveObject,
                &event,
            );
        }
        slot.handle = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_tracks_and_reuses_dead_slots() {
        init(true);
        set_liveness_probe(|handle| handle != 0xdead);
        track(0xdead, 64, 1 << 32 | 10);
        track(0x1000, 64, 1 << 32 | 11);
        // The dead handle's slot is reusable.
        track(0x2000, 64, 1 << 32 | 12);

        let entries = LIVE.entries.lock();
        let live_count = entries.iter().filter(|e| e.handle != 0).count();
        assert!(live_count >= 2);
        drop(entries);
        set_liveness_probe(|_| true);
    }

    #[test]
    fn gc_epoch_advances() {
        let before = current_gc_epoch();
        on_gc_start();
        assert_eq!(current_gc_epoch(), before + 1);
    }
}
