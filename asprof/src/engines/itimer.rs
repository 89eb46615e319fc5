//! Fallback CPU engine using the classic process-wide `setitimer` profiling
//! timer. The kernel delivers SIGPROF to a running thread, which biases
//! toward threads burning CPU; the per-thread timer engine is preferred
//! where available.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, ExecutionEvent};
use crate::os::ThreadState;
use crate::profiler::Profiler;
use crate::signals;
use crate::tsc;

use super::{enabled, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);

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

fn set_timer(interval_nanos: u64) -> bool {
    let tv = libc::timeval {
        tv_sec: (interval_nanos / 1_000_000_000) as libc::time_t,
        tv_usec: (interval_nanos % 1_000_000_000 / 1000) as libc::suseconds_t,
    };
    let itv = libc::itimerval {
        it_interval: tv,
        it_value: tv,
    };
    unsafe { libc::setitimer(libc::ITIMER_PROF, &itv, std::ptr::null_mut()) == 0 }
}

#[derive(Default)]
pub struct ITimerEngine {
    old_handler: Option<libc::sigaction>,
}

impl Engine for ITimerEngine {
    fn type_name(&self) -> &'static str {
        "itimer"
    }

    fn title(&self) -> &'static str {
        "CPU profile"
    }

    fn units(&self) -> &'static str {
        "ns"
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        if args.interval == 0 {
            return Err(ProfilerError::invalid("interval must be positive"));
        }
        INTERVAL.store(args.interval, Ordering::Relaxed);
        self.old_handler = Some(signals::install(libc::SIGPROF, signal_handler));
        if !set_timer(args.interval) {
            if let Some(old) = self.old_handler.take() {
                signals::restore(libc::SIGPROF, &old);
            }
            return Err(ProfilerError::install("setitimer failed"));
        }
        Ok(())
    }

    fn stop(&mut self) {
        set_timer(0);
        if let Some(old) = self.old_handler.take() {
            signals::restore(libc::SIGPROF, &old);
        }
    }
}
