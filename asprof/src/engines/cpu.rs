//! CPU engine: one interval timer per thread, ticking on that thread's CPU
//! clock and delivered as SIGPROF directly to the owning thread. Timers are
//! created for all live threads at start and for new threads from the
//! thread-start hook; stop deletes them all.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::warn;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, ExecutionEvent};
use crate::os::{self, ThreadState};
use crate::profiler::Profiler;
use crate::signals;
use crate::tsc;

use super::{enabled, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
// This engine, specifically, is between start() and stop(); the global
// enable flag covers all engines and is not enough to gate timer creation.
static RUNNING: AtomicUsize = AtomicUsize::new(0);
// timer_t per tid; 0 = no timer. Allocated once, sized by max thread id.
static TIMERS: AtomicUsize = AtomicUsize::new(0);
static TIMERS_LEN: AtomicUsize = AtomicUsize::new(0);

unsafe extern "C" fn signal_handler(
    _signo: libc::c_int,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if !enabled() {
        return;
    }
    let event = Event::Execution(ExecutionEvent {
        start_time: tsc::ticks(),
        thread_state: ThreadState::Running,
    });
    Profiler::instance().record_sample(
        ucontext,
        INTERVAL.load(Ordering::Relaxed),
        EventType::ExecutionSample,
        &event,
    );
}

/// The kernel's sigevent layout with the thread-id union member exposed:
/// SIGEV_THREAD_ID delivery needs the tid at offset 16.
#[repr(C)]
struct SigEventThreadId {
    sigev_value: libc::sigval,
    sigev_signo: libc::c_int,
    sigev_notify: libc::c_int,
    sigev_notify_thread_id: libc::c_int,
    _pad: [libc::c_int; 11],
}

fn sigevent_for_thread(tid: i32) -> SigEventThreadId {
    SigEventThreadId {
        sigev_value: libc::sigval { sival_ptr: std::ptr::null_mut() },
        sigev_signo: libc::SIGPROF,
        sigev_notify: libc::SIGEV_THREAD_ID,
        sigev_notify_thread_id: tid,
        _pad: [0; 11],
    }
}

fn timers() -> Option<&'static [AtomicUsize]> {
    let ptr = TIMERS.load(Ordering::Acquire) as *const AtomicUsize;
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { std::slice::from_raw_parts(ptr, TIMERS_LEN.load(Ordering::Acquire)) })
}

fn register_thread(tid: i32) -> i32 {
    let Some(timers) = timers() else { return libc::EINVAL };
    let Some(slot) = timers.get(tid as usize) else {
        return libc::EINVAL;
    };

    let mut sev = sigevent_for_thread(tid);

    let mut timer_id: libc::timer_t = std::ptr::null_mut();
    if unsafe {
        libc::timer_create(
            libc::CLOCK_THREAD_CPUTIME_ID,
            &mut sev as *mut SigEventThreadId as *mut libc::sigevent,
            &mut timer_id,
        )
    } != 0
    {
        let err = unsafe { *libc::__errno_location() };
        warn!("timer_create for TID {tid} failed: errno {err}");
        return err;
    }

    let interval = INTERVAL.load(Ordering::Relaxed);
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: (interval / 1_000_000_000) as libc::time_t,
            tv_nsec: (interval % 1_000_000_000) as libc::c_long,
        },
        it_value: libc::timespec {
            tv_sec: (interval / 1_000_000_000) as libc::time_t,
            tv_nsec: (interval % 1_000_000_000) as libc::c_long,
        },
    };
    if unsafe { libc::timer_settime(timer_id, 0, &spec, std::ptr::null_mut()) } != 0 {
        let err = unsafe { *libc::__errno_location() };
        warn!("timer_settime for TID {tid} failed: errno {err}");
        unsafe { libc::timer_delete(timer_id) };
        return err;
    }

    let prev = slot.swap(timer_id as usize, Ordering::AcqRel);
    if prev != 0 {
        unsafe { libc::timer_delete(prev as libc::timer_t) };
    }
    0
}

fn unregister_thread(tid: i32) {
    if let Some(timers) = timers() {
        if let Some(slot) = timers.get(tid as usize) {
            let timer = slot.swap(0, Ordering::AcqRel);
            if timer != 0 {
                unsafe { libc::timer_delete(timer as libc::timer_t) };
            }
        }
    }
}

/// Thread lifecycle hooks, invoked by the profiler facade while this engine
/// is running.
pub fn on_thread_start() {
    if enabled() && RUNNING.load(Ordering::Acquire) != 0 {
        register_thread(os::thread_id());
    }
}

pub fn on_thread_end() {
    unregister_thread(os::thread_id());
}

#[derive(Default)]
pub struct CpuEngine {
    old_handler: Option<libc::sigaction>,
}

impl Engine for CpuEngine {
    fn type_name(&self) -> &'static str {
        "ctimer"
    }

    fn title(&self) -> &'static str {
        "CPU profile"
    }

    fn units(&self) -> &'static str {
        "ns"
    }

    fn check(&mut self, _args: &Arguments) -> Result<()> {
        // Probe the timer API without keeping the timer.
        let mut sev = sigevent_for_thread(os::thread_id());
        let mut timer_id: libc::timer_t = std::ptr::null_mut();
        if unsafe {
            libc::timer_create(
                libc::CLOCK_THREAD_CPUTIME_ID,
                &mut sev as *mut SigEventThreadId as *mut libc::sigevent,
                &mut timer_id,
            )
        } != 0
        {
            return Err(ProfilerError::feasibility(
                "per-thread CPU timers are unavailable on this system",
            ));
        }
        unsafe { libc::timer_delete(timer_id) };
        Ok(())
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        INTERVAL.store(args.interval, Ordering::Relaxed);

        if TIMERS.load(Ordering::Acquire) == 0 {
            let len = os::max_thread_id() as usize + 1;
            let ptr = os::safe_alloc(len * std::mem::size_of::<AtomicUsize>());
            if ptr.is_null() {
                return Err(ProfilerError::install("cannot allocate timer table"));
            }
            TIMERS_LEN.store(len, Ordering::Release);
            TIMERS.store(ptr as usize, Ordering::Release);
        }

        self.old_handler = Some(signals::install(libc::SIGPROF, signal_handler));

        let mut created = false;
        let mut last_err = 0;
        let mut threads = os::ThreadList::new();
        while let Some(tid) = threads.next() {
            match register_thread(tid) {
                0 => created = true,
                err => last_err = err,
            }
        }

        if !created {
            if last_err == libc::EACCES || last_err == libc::EPERM {
                return Err(ProfilerError::install("no permission to create thread timers"));
            }
            return Err(ProfilerError::install("failed to create any thread timer"));
        }
        RUNNING.store(1, Ordering::Release);
        Ok(())
    }

    fn stop(&mut self) {
        RUNNING.store(0, Ordering::Release);
        if let Some(timers) = timers() {
            for slot in timers {
                let timer = slot.swap(0, Ordering::AcqRel);
                if timer != 0 {
                    unsafe { libc::timer_delete(timer as libc::timer_t) };
                }
            }
        }
        if let Some(old) = self.old_handler.take() {
            signals::restore(libc::SIGPROF, &old);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_probes_timer_api() {
        let mut engine = CpuEngine::default();
        // Linux always has per-thread timers.
        assert!(engine.check(&Arguments::default()).is_ok());
    }
}
