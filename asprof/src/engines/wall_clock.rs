//! Wall-clock engine.
//!
//! A background worker walks the process's threads, signals up to
//! `THREADS_PER_TICK` of them per cycle with SIGVTALRM, and sleeps until the
//! next tick. The signaled threads record their own stacks from the signal
//! handler. In batch mode, consecutive samples of an idle thread collapse
//! into one record carrying a sample count; a thread is considered idle
//! until its CPU time advances by more than `RUNNABLE_THRESHOLD_NS` between
//! cycles.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rustc_hash::FxHashMap;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, WallClockEvent};
use crate::os::{self, ThreadState};
use crate::profiler::Profiler;
use crate::signals;
use crate::stack_frame::StackFrame;
use crate::tsc;

use super::{enabled, Engine};

/// Cap on signals per cycle; throttles profiling overhead for applications
/// with very many threads.
const THREADS_PER_TICK: usize = 8;
/// Walking threads more often than this is pure overhead.
const MIN_INTERVAL_NS: u64 = 100_000;
/// CPU-time advance below this keeps a thread classified as idle.
const RUNNABLE_THRESHOLD_NS: u64 = 10_000;
/// Idle batch flush bound.
const MAX_IDLE_BATCH: u32 = 1000;

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static BATCH_MODE: AtomicU32 = AtomicU32::new(0);

#[derive(Default, Clone, Copy)]
struct ThreadSleepState {
    start_time: u64,
    last_cpu_time: u64,
    call_trace_id: u32,
    counter: u32,
}

/// MPSC ring carrying (tid, trace id, cpu time) from the signal handlers
/// back to the worker, so the worker can tell idle threads apart without
/// reading other threads' clocks from the handler.
struct CpuTimeRing {
    write_pos: AtomicU32,
    slots: [(AtomicU64, AtomicU64); Self::SIZE],
}

impl CpuTimeRing {
    const SIZE: usize = 256;

    const fn new() -> CpuTimeRing {
        #[allow(clippy::declare_interior_mutable_const)]
        const SLOT: (AtomicU64, AtomicU64) = (AtomicU64::new(0), AtomicU64::new(0));
        CpuTimeRing {
            write_pos: AtomicU32::new(0),
            slots: [SLOT; Self::SIZE],
        }
    }

    fn add(&self, tid: i32, trace_id: u32) {
        let slot = &self.slots[self.write_pos.fetch_add(1, Ordering::Relaxed) as usize % Self::SIZE];
        slot.0.store((tid as u64) << 32 | trace_id as u64, Ordering::Relaxed);
        slot.1.store(os::thread_cpu_time(0).max(1), Ordering::Release);
    }

    fn drain(&self, states: &mut FxHashMap<i32, ThreadSleepState>) {
        for slot in &self.slots {
            let cpu_time = slot.1.load(Ordering::Acquire);
            if cpu_time == 0 {
                continue;
            }
            let tagged = slot.0.load(Ordering::Relaxed);
            if slot
                .1
                .compare_exchange(cpu_time, 0, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                let state = states.entry((tagged >> 32) as i32).or_default();
                state.last_cpu_time = cpu_time;
                state.call_trace_id = tagged as u32;
                state.counter = 0;
            }
        }
    }
}

static CPU_TIME_RING: CpuTimeRing = CpuTimeRing::new();

unsafe extern "C" fn signal_handler(
    _signo: libc::c_int,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if !enabled() {
        return;
    }
    let frame = StackFrame::new(ucontext);
    let thread_state = thread_state_of(&frame);
    let event = Event::WallClock(WallClockEvent {
        start_time: tsc::ticks(),
        thread_state,
        samples: 1,
    });
    let trace = Profiler::instance().record_sample(
        ucontext,
        INTERVAL.load(Ordering::Relaxed),
        EventType::WallClockSample,
        &event,
    );
    if BATCH_MODE.load(Ordering::Relaxed) != 0 && thread_state == ThreadState::Sleeping {
        CPU_TIME_RING.add(crate::thread::current_tid(), trace);
    }
}

/// A thread is sleeping if it was interrupted at (or right after) a syscall
/// instruction that returned EINTR.
fn thread_state_of(frame: &StackFrame) -> ThreadState {
    let pc = frame.pc();
    if StackFrame::is_syscall(pc as *const u8) {
        return ThreadState::Sleeping;
    }
    let prev_pc = pc.wrapping_sub(crate::stack_frame::SYSCALL_SIZE);
    if (pc & 0xfff) >= crate::stack_frame::SYSCALL_SIZE && StackFrame::is_syscall(prev_pc as *const u8)
    {
        // The mutable check would restart interrupted pollers; state alone
        // is enough here.
        return ThreadState::Sleeping;
    }
    ThreadState::Running
}

fn record_batched(start_time: u64, samples: u32, tid: i32, call_trace_id: u32) {
    let event = Event::WallClock(WallClockEvent {
        start_time,
        thread_state: ThreadState::Sleeping,
        samples,
    });
    Profiler::instance().record_external_samples(
        samples as u64,
        samples as u64 * INTERVAL.load(Ordering::Relaxed),
        tid,
        call_trace_id,
        EventType::WallClockSample,
        &event,
    );
}

fn timer_loop(stop: Receiver<()>) {
    let self_tid = os::thread_id();
    let batch = BATCH_MODE.load(Ordering::Relaxed) != 0;
    let interval = INTERVAL.load(Ordering::Relaxed).max(MIN_INTERVAL_NS);

    let mut sleep_states: FxHashMap<i32, ThreadSleepState> = FxHashMap::default();
    let mut threads = os::ThreadList::new();
    let mut cycle_start = os::nanotime();

    loop {
        let is_enabled = enabled();

        let mut signaled = 0;
        while signaled < THREADS_PER_TICK && threads.has_next() {
            let Some(tid) = threads.next() else { break };
            if tid == self_tid || !Profiler::instance().thread_accepted(tid) {
                continue;
            }

            if batch {
                let state = sleep_states.entry(tid).or_default();
                let cpu_time = if is_enabled { os::thread_cpu_time(tid) } else { 0 };
                if cpu_time != 0 && cpu_time.wrapping_sub(state.last_cpu_time) <= RUNNABLE_THRESHOLD_NS
                {
                    state.counter += 1;
                    if state.counter < MAX_IDLE_BATCH {
                        if state.counter == 1 {
                            state.start_time = tsc::ticks();
                        }
                        continue;
                    }
                }
                if state.counter != 0 {
                    let state = *state;
                    record_batched(state.start_time, state.counter, tid, state.call_trace_id);
                    sleep_states.entry(tid).or_default().counter = 0;
                }
            }

            if is_enabled && os::send_signal_to_thread(tid, libc::SIGVTALRM) {
                signaled += 1;
            }
        }

        let now = os::nanotime();
        let sleep_nanos = if threads.has_next() {
            // Spread the cycle across the thread list so the per-thread
            // rate stays stable regardless of thread count.
            let target = cycle_start + interval * threads.index() as u64 / threads.count().max(1) as u64;
            target.saturating_sub(now).max(MIN_INTERVAL_NS)
        } else {
            cycle_start += interval;
            let mut sleep = cycle_start.saturating_sub(now);
            if sleep < MIN_INTERVAL_NS {
                cycle_start = now + MIN_INTERVAL_NS;
                sleep = MIN_INTERVAL_NS;
            }
            threads.update();
            sleep
        };

        match stop.recv_timeout(Duration::from_nanos(sleep_nanos)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }

        CPU_TIME_RING.drain(&mut sleep_states);
    }

    // Flush the remaining batches.
    for (tid, state) in &sleep_states {
        if state.counter != 0 {
            record_batched(state.start_time, state.counter, *tid, state.call_trace_id);
        }
    }
}

#[derive(Default)]
pub struct WallClockEngine {
    worker: Option<(Sender<()>, JoinHandle<()>)>,
    old_handler: Option<libc::sigaction>,
}

impl Engine for WallClockEngine {
    fn type_name(&self) -> &'static str {
        "wall"
    }

    fn title(&self) -> &'static str {
        "Wall clock profile"
    }

    fn units(&self) -> &'static str {
        "ns"
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        let interval = args.wall.unwrap_or(args.interval);
        // Wall mode samples many more threads; stretch the default.
        let interval = if interval == 0 {
            crate::args::DEFAULT_INTERVAL * 5
        } else {
            interval
        };
        INTERVAL.store(interval, Ordering::Relaxed);
        BATCH_MODE.store(u32::from(!args.nobatch), Ordering::Relaxed);

        self.old_handler = Some(signals::install(libc::SIGVTALRM, signal_handler));

        let (sender, receiver) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("asprof-wall".to_owned())
            .spawn(move || timer_loop(receiver))
            .map_err(|e| ProfilerError::install(format!("cannot start wall clock thread: {e}")))?;
        self.worker = Some((sender, handle));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((sender, handle)) = self.worker.take() {
            let _ = sender.send(());
            let _ = handle.join();
        }
        if let Some(old) = self.old_handler.take() {
            signals::restore(libc::SIGVTALRM, &old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_ring_hands_updates_to_worker() {
        CPU_TIME_RING.add(1234, 77);
        let mut states = FxHashMap::default();
        CPU_TIME_RING.drain(&mut states);
        let state = states.get(&1234).expect("state for tid");
        assert_eq!(state.call_trace_id, 77);
        assert!(state.last_cpu_time > 0);
        // Second drain sees nothing new.
        let mut again = FxHashMap::default();
        CPU_TIME_RING.drain(&mut again);
        assert!(again.is_empty());
    }
}
