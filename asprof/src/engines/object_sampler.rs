//! Sampled-object engine: consumes the runtime's heap-sampling callback.
//!
//! The runtime invokes the exported [`on_sampled_object_alloc`] entry for a
//! statistical subset of allocations (the runtime itself applies the
//! sampling interval). Each callback becomes one allocation event keyed by
//! class id; with `live` enabled, the object is also tracked in the
//! live-object ring.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{AllocEvent, Event, EventType};
use crate::profiler::Profiler;
use crate::tsc;

use super::{enabled, live_objects, Engine};

pub const DEFAULT_ALLOC_INTERVAL: u64 = crate::args::DEFAULT_ALLOC_INTERVAL;

static INTERVAL: AtomicU64 = AtomicU64::new(0);

/// Heap-sampling callback entry. `object_handle` is an opaque reference the
/// live-object tracker can later probe for liveness.
pub fn on_sampled_object_alloc(object_handle: u64, class_name: &str, size: u64) {
    if !enabled() {
        return;
    }
    let profiler = Profiler::instance();
    let interval = INTERVAL.load(Ordering::Relaxed);
    let event = Event::Alloc(AllocEvent {
        start_time: tsc::ticks(),
        class_id: profiler.class_id(class_name),
        // Each sampled callback statistically represents a full interval of
        // allocated bytes.
        total_size: size.max(interval),
        instance_size: size,
    });
    let trace = profiler.record_sample(
        std::ptr::null_mut(),
        size.max(interval),
        EventType::AllocSample,
        &event,
    );
    if trace != 0 {
        // The live tracker records which thread allocated, packed next to
        // the trace id the way external samples carry it.
        let packed = (crate::thread::current_tid() as u64) << 32 | trace as u64;
        live_objects::track(object_handle, size, packed);
    }
}

#[derive(Default)]
pub struct ObjectSampler;

impl Engine for ObjectSampler {
    fn type_name(&self) -> &'static str {
        "object_sampler"
    }

    fn title(&self) -> &'static str {
        "Allocation profile"
    }

    fn units(&self) -> &'static str {
        "bytes"
    }

    fn check(&mut self, _args: &Arguments) -> Result<()> {
        if Profiler::instance().runtime_library().is_none() {
            return Err(ProfilerError::feasibility(
                "heap sampling requires a managed runtime",
            ));
        }
        Ok(())
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        let interval = match args.alloc {
            Some(0) | None => DEFAULT_ALLOC_INTERVAL,
            Some(interval) => interval,
        };
        INTERVAL.store(interval, Ordering::Relaxed);
        live_objects::init(args.live);
        Profiler::instance().set_heap_sampling(interval as i64)
    }

    fn stop(&mut self) {
        let _ = Profiler::instance().set_heap_sampling(0);
        live_objects::dump_live_refs();
    }
}
