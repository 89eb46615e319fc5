//! Lock engine: monitor contention plus `park`-style waiting.
//!
//! The runtime's monitor-contended-enter callback stores the enter
//! timestamp in a thread-local slot; the matching entered callback computes
//! the wait and records a lock sample when the accumulated wait crosses the
//! configured threshold. Park interception covers the juc synchronizers:
//! the wrapped park entry measures the park duration and reports it under
//! the park event kind, filtered to the known high-level lock classes.

use std::cell::Cell;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, LockEvent};
use crate::profiler::Profiler;
use crate::tsc;

use super::{enabled, update_counter, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static TOTAL_DURATION: AtomicU64 = AtomicU64::new(0);
static START_TIME: AtomicI64 = AtomicI64::new(0);

thread_local! {
    static ENTER_TIME: Cell<u64> = const { Cell::new(0) };
}

/// Only these synchronizers are reported from park interception; arbitrary
/// parks (condition waits, sleeps) are not lock contention.
fn is_concurrent_lock(class_name: &str) -> bool {
    class_name.starts_with("java/util/concurrent/locks/ReentrantLock")
        || class_name.starts_with("java/util/concurrent/locks/ReentrantReadWriteLock")
        || class_name.starts_with("java/util/concurrent/Semaphore")
}

/// Monitor-contended-enter callback: remember when the wait began.
pub fn on_monitor_contended_enter() {
    ENTER_TIME.with(|slot| slot.set(tsc::ticks()));
}

/// Monitor-contended-entered callback: the wait is over.
pub fn on_monitor_contended_entered(lock_class: &str, lock_address: u64) {
    let entered_time = tsc::ticks();
    let enter_time = ENTER_TIME.with(|slot| slot.replace(0));
    if enter_time == 0 || (enter_time as i64) < START_TIME.load(Ordering::Relaxed) {
        // The lock attempt started before profiling; its duration is
        // meaningless.
        return;
    }
    let duration = entered_time - enter_time;
    if enabled() && update_counter(&TOTAL_DURATION, duration, INTERVAL.load(Ordering::Relaxed)) {
        record_contended_lock(
            EventType::LockSample,
            enter_time,
            entered_time,
            Some(lock_class),
            lock_address,
            0,
        );
    }
}

/// The object a parked thread is blocked on, as reported by the runtime
/// binding. `class_name` is `None` when the blocker exists but its
/// class-signature lookup failed; such parks are still reported, with
/// class id 0.
#[derive(Debug, Clone, Copy)]
pub struct ParkBlocker<'a> {
    pub class_name: Option<&'a str>,
    pub address: u64,
}

/// Park samples pass when the blocker is one of the known synchronizers,
/// or when its class could not be resolved at all.
fn park_reportable(class_name: Option<&str>) -> bool {
    class_name.map_or(true, is_concurrent_lock)
}

/// Wraps one park call; invoked by the interposed park entry. A park with
/// no blocker (plain sleep, condition wait) is not lock contention and is
/// not even timed.
pub fn on_park(blocker: Option<ParkBlocker>, timeout: i64, park: impl FnOnce()) {
    let Some(blocker) = blocker.filter(|_| enabled()) else {
        park();
        return;
    };
    let start = tsc::ticks();
    park();
    let end = tsc::ticks();
    let duration = end - start;
    if update_counter(&TOTAL_DURATION, duration, INTERVAL.load(Ordering::Relaxed))
        && park_reportable(blocker.class_name)
    {
        record_contended_lock(
            EventType::ParkSample,
            start,
            end,
            blocker.class_name,
            blocker.address,
            timeout,
        );
    }
}

fn record_contended_lock(
    event_type: EventType,
    start_time: u64,
    end_time: u64,
    class_name: Option<&str>,
    address: u64,
    timeout: i64,
) {
    let profiler = Profiler::instance();
    let event = Event::Lock(LockEvent {
        start_time,
        end_time,
        class_id: class_name.map_or(0, |name| profiler.class_id(name)),
        address,
        timeout,
    });
    let duration_nanos = crate::tsc::ticks_to_nanos(end_time - start_time);
    profiler.record_sample(std::ptr::null_mut(), duration_nanos, event_type, &event);
}

#[derive(Default)]
pub struct LockTracer;

impl Engine for LockTracer {
    fn type_name(&self) -> &'static str {
        "lock_tracer"
    }

    fn title(&self) -> &'static str {
        "Lock profile"
    }

    fn units(&self) -> &'static str {
        "ns"
    }

    fn check(&mut self, _args: &Arguments) -> Result<()> {
        if Profiler::instance().runtime_library().is_none() {
            return Err(ProfilerError::feasibility(
                "lock profiling requires a managed runtime",
            ));
        }
        Ok(())
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        // The threshold is a duration; convert to ticks so the hot path
        // compares raw counter values.
        let interval_ns = args.lock.unwrap_or(0);
        let interval_ticks =
            (interval_ns as u128 * crate::tsc::frequency() as u128 / 1_000_000_000) as u64;
        INTERVAL.store(interval_ticks, Ordering::Relaxed);
        TOTAL_DURATION.store(0, Ordering::Relaxed);
        START_TIME.store(tsc::ticks() as i64, Ordering::Relaxed);
        Profiler::instance().set_monitor_events(true)
    }

    fn stop(&mut self) {
        let _ = Profiler::instance().set_monitor_events(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_lock_filter() {
        assert!(is_concurrent_lock("java/util/concurrent/locks/ReentrantLock$NonfairSync"));
        assert!(is_concurrent_lock("java/util/concurrent/Semaphore$FairSync"));
        assert!(!is_concurrent_lock("java/lang/Object"));
        assert!(!is_concurrent_lock("java/util/concurrent/CountDownLatch$Sync"));
    }

    #[test]
    fn park_without_blocker_just_parks() {
        let mut ran = false;
        on_park(None, 0, || ran = true);
        assert!(ran);
    }

    #[test]
    fn unresolved_blocker_class_is_still_reportable() {
        assert!(park_reportable(None));
        assert!(park_reportable(Some("java/util/concurrent/locks/ReentrantLock$Sync")));
        assert!(!park_reportable(Some("java/lang/Object")));
    }
}
