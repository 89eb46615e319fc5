//! Allocation-trace engine: breakpoint traps on the runtime's slow-path
//! allocation notification entries (in-TLAB and outside-TLAB). The trap
//! handler reads the class and size from the trapped frame's argument
//! registers, simulates `ret` so the victim thread continues, and records an
//! allocation sample when the byte accumulator crosses the interval.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{AllocEvent, Event, EventType};
use crate::profiler::Profiler;
use crate::signals;
use crate::stack_frame::StackFrame;
use crate::trap::Trap;
use crate::tsc;

use super::{enabled, update_counter, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static ALLOCATED_BYTES: AtomicU64 = AtomicU64::new(0);
/// Which calling convention the discovered symbols use:
/// 1 = (klass, obj, tlab_size, alloc_size, ...), 2 = (klass, heapword, size).
static TRAP_KIND: AtomicI32 = AtomicI32::new(0);

static TRAPS: Mutex<Option<(Trap, Trap)>> = Mutex::new(None);
// Entry addresses mirrored for the async-signal-safe covers check.
static IN_TLAB_ENTRY: AtomicU64 = AtomicU64::new(0);
static OUTSIDE_TLAB_ENTRY: AtomicU64 = AtomicU64::new(0);

// Three calling-convention generations of the runtime's allocation-notify
// entries. The JDK 10+ pair and the KlassHandle-suffixed JDK 8u262+ pair
// share an ABI (sizes in args 2/3); the plain `_event` pair of JDK 7-9
// takes them one register earlier.
const SYMBOLS_NEW: (&str, &str) = (
    "_ZN11AllocTracer27send_allocation_in_new_tlab",
    "_ZN11AllocTracer28send_allocation_outside_tlab",
);
const SYMBOLS_EVENT_KLASS_HANDLE: (&str, &str) = (
    "_ZN11AllocTracer33send_allocation_in_new_tlab_eventE11KlassHandleP8HeapWord",
    "_ZN11AllocTracer34send_allocation_outside_tlab_eventE11KlassHandleP8HeapWord",
);
const SYMBOLS_EVENT: (&str, &str) = (
    "_ZN11AllocTracer33send_allocation_in_new_tlab_event",
    "_ZN11AllocTracer34send_allocation_outside_tlab_event",
);

fn covers(entry: &AtomicU64, pc: usize) -> bool {
    let entry = entry.load(Ordering::Relaxed) as usize;
    entry != 0 && pc.wrapping_sub(entry) <= std::mem::size_of::<crate::trap::Instruction>()
}

/// Trap hook registered with the signal dispatcher.
pub(crate) unsafe fn trap_hook(
    pc: usize,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) -> bool {
    let in_tlab = covers(&IN_TLAB_ENTRY, pc);
    let outside = covers(&OUTSIDE_TLAB_ENTRY, pc);
    if !in_tlab && !outside {
        return false;
    }

    let mut frame = StackFrame::new(ucontext);
    let trap_kind = TRAP_KIND.load(Ordering::Relaxed);

    let (event_type, total_size, instance_size) = if in_tlab {
        // send_allocation_in_new_tlab(klass, obj, tlab_size, alloc_size, ..)
        // send_allocation_in_new_tlab_event(klass, tlab_size, alloc_size)
        if trap_kind == 1 {
            (EventType::AllocSample, frame.arg2(), frame.arg3())
        } else {
            (EventType::AllocSample, frame.arg1(), frame.arg2())
        }
    } else {
        // send_allocation_outside_tlab(klass, obj, alloc_size, ..)
        if trap_kind == 1 {
            (EventType::AllocOutsideTlab, frame.arg2(), 0)
        } else {
            (EventType::AllocOutsideTlab, frame.arg1(), 0)
        }
    };

    let klass = frame.arg0();
    // Continue the victim before doing any heavier work.
    frame.ret();

    if enabled()
        && update_counter(
            &ALLOCATED_BYTES,
            total_size as u64,
            INTERVAL.load(Ordering::Relaxed),
        )
    {
        record_allocation(ucontext, event_type, klass, total_size as u64, instance_size as u64);
    }
    true
}

fn record_allocation(
    ucontext: *mut libc::c_void,
    event_type: EventType,
    klass: usize,
    total_size: u64,
    instance_size: u64,
) {
    let profiler = Profiler::instance();
    let event = Event::Alloc(AllocEvent {
        start_time: tsc::ticks(),
        class_id: profiler.class_id_of_klass(klass),
        total_size,
        instance_size,
    });
    profiler.record_sample(ucontext, total_size, event_type, &event);
}

#[derive(Default)]
pub struct AllocTracer;

impl AllocTracer {
    fn find_entries(&self) -> Result<(usize, usize, i32)> {
        let profiler = Profiler::instance();
        let Some(libjvm) = profiler.runtime_library() else {
            return Err(ProfilerError::feasibility("no managed runtime in this process"));
        };

        for ((in_tlab, outside), kind) in [
            (SYMBOLS_NEW, 1),
            (SYMBOLS_EVENT_KLASS_HANDLE, 1),
            (SYMBOLS_EVENT, 2),
        ] {
            if let (Some(ne), Some(oe)) = (
                libjvm.find_symbol_by_prefix(in_tlab),
                libjvm.find_symbol_by_prefix(outside),
            ) {
                return Ok((ne.start, oe.start, kind));
            }
        }
        Err(ProfilerError::feasibility(
            "allocation tracer symbols not found; are runtime debug symbols installed?",
        ))
    }
}

impl Engine for AllocTracer {
    fn type_name(&self) -> &'static str {
        "alloc_tracer"
    }

    fn title(&self) -> &'static str {
        "Allocation profile"
    }

    fn units(&self) -> &'static str {
        "bytes"
    }

    fn check(&mut self, args: &Arguments) -> Result<()> {
        if args.live {
            return Err(ProfilerError::feasibility(
                "'live' requires the heap sampling engine",
            ));
        }
        self.find_entries().map(|_| ())
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        let (in_tlab_entry, outside_entry, kind) = self.find_entries()?;

        INTERVAL.store(args.alloc.unwrap_or(0), Ordering::Relaxed);
        ALLOCATED_BYTES.store(0, Ordering::Relaxed);
        TRAP_KIND.store(kind, Ordering::Relaxed);

        let mut in_tlab = Trap::new(0);
        let mut outside = Trap::new(1);
        in_tlab.assign(in_tlab_entry);
        outside.assign(outside_entry);
        in_tlab.pair(&mut outside);

        IN_TLAB_ENTRY.store(in_tlab.entry() as u64, Ordering::Relaxed);
        OUTSIDE_TLAB_ENTRY.store(outside.entry() as u64, Ordering::Relaxed);
        signals::register_trap_hook(trap_hook);

        if !in_tlab.install() || !outside.install() {
            in_tlab.uninstall();
            signals::unregister_trap_hook(trap_hook);
            return Err(ProfilerError::install("cannot install allocation breakpoints"));
        }
        *TRAPS.lock() = Some((in_tlab, outside));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((in_tlab, outside)) = TRAPS.lock().take() {
            in_tlab.uninstall();
            outside.uninstall();
        }
        IN_TLAB_ENTRY.store(0, Ordering::Relaxed);
        OUTSIDE_TLAB_ENTRY.store(0, Ordering::Relaxed);
        signals::unregister_trap_hook(trap_hook);
    }
}
