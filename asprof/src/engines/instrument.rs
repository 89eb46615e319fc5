//! Instrumented-method engine.
//!
//! `event=<Class.method>` asks the runtime to retransform the target class
//! with enter/timed-exit hooks that call back into the exported
//! [`record_entry`]/[`record_exit`] routines. The bytecode rewriting itself
//! is the runtime adapter's job; this engine owns the target selection, the
//! call accumulator, and the sample records the injected hooks produce.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, ExecutionEvent};
use crate::os::ThreadState;
use crate::profiler::Profiler;
use crate::tsc;

use super::{enabled, update_counter, Engine};

static INTERVAL: AtomicU64 = AtomicU64::new(0);
static CALLS: AtomicU64 = AtomicU64::new(0);
static TARGET: Mutex<Option<(String, String)>> = Mutex::new(None);

thread_local! {
    static ENTRY_TIME: Cell<u64> = const { Cell::new(0) };
}

/// Splits `com.example.Foo.bar` into class and method; a missing method
/// part means "all methods".
fn parse_target(event: &str) -> Option<(String, String)> {
    let (class, method) = event.rsplit_once('.')?;
    if class.is_empty() || method.is_empty() {
        return None;
    }
    Some((class.replace('.', "/"), method.to_owned()))
}

/// Called by the injected entry hook.
pub extern "C" fn record_entry() {
    if !enabled() {
        return;
    }
    ENTRY_TIME.with(|slot| slot.set(tsc::ticks()));
    if update_counter(&CALLS, 1, INTERVAL.load(Ordering::Relaxed)) {
        let event = Event::Execution(ExecutionEvent {
            start_time: tsc::ticks(),
            thread_state: ThreadState::Running,
        });
        Profiler::instance().record_sample(
            std::ptr::null_mut(),
            1,
            EventType::InstrumentedMethod,
            &event,
        );
    }
}

/// Called by the injected timed-exit hook; duration bookkeeping only, so
/// exceptional exits stay cheap.
pub extern "C" fn record_exit() {
    ENTRY_TIME.with(|slot| slot.set(0));
}

pub fn target() -> Option<(String, String)> {
    TARGET.lock().clone()
}

#[derive(Default)]
pub struct Instrument;

impl Engine for Instrument {
    fn type_name(&self) -> &'static str {
        "instrument"
    }

    fn title(&self) -> &'static str {
        "Method profile"
    }

    fn units(&self) -> &'static str {
        "calls"
    }

    fn check(&mut self, args: &Arguments) -> Result<()> {
        let event = args.primary_event();
        if parse_target(event).is_none() {
            return Err(ProfilerError::invalid(format!(
                "'{event}' is not a Class.method target"
            )));
        }
        if Profiler::instance().runtime_library().is_none() {
            return Err(ProfilerError::feasibility(
                "method instrumentation requires a managed runtime",
            ));
        }
        Ok(())
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        let target = parse_target(args.primary_event())
            .ok_or_else(|| ProfilerError::invalid("invalid instrumentation target"))?;
        INTERVAL.store(args.interval.max(1), Ordering::Relaxed);
        CALLS.store(0, Ordering::Relaxed);
        let class = target.0.clone();
        *TARGET.lock() = Some(target);
        Profiler::instance().request_retransform(&class)
    }

    fn stop(&mut self) {
        if let Some((class, _)) = TARGET.lock().take() {
            let _ = Profiler::instance().request_retransform(&class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_parsing() {
        assert_eq!(
            parse_target("com.example.Foo.bar"),
            Some(("com/example/Foo".to_owned(), "bar".to_owned()))
        );
        assert_eq!(parse_target("nodots"), None);
        assert_eq!(parse_target(".bar"), None);
    }
}
