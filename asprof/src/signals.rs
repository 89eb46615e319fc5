//! Signal plumbing: handler installation with old-disposition capture, the
//! trap (SIGTRAP) dispatcher, and the chained SIGSEGV/SIGBUS crash handler
//! that turns unwinder and safe-load faults into recoverable events.
//!
//! Engines register a covers-predicate for trap PCs; the dispatcher walks a
//! short fixed list in registration order and forwards the first match.
//! Unclaimed faults chain to whatever handler was installed before attach.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::safe_access;
use crate::stack_frame::StackFrame;
use crate::trap::Trap;

pub type SignalHandlerFn =
    unsafe extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// A trap hook: returns true when it owned and fully handled the fault.
pub type TrapHookFn = unsafe fn(pc: usize, siginfo: *mut libc::siginfo_t, ucontext: *mut libc::c_void) -> bool;

const MAX_TRAP_HOOKS: usize = 8;
static TRAP_HOOKS: [AtomicUsize; MAX_TRAP_HOOKS] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

static OLD_SEGV: AtomicUsize = AtomicUsize::new(0);
static OLD_BUS: AtomicUsize = AtomicUsize::new(0);
static OLD_TRAP: AtomicUsize = AtomicUsize::new(0);

fn old_slot(signo: libc::c_int) -> &'static AtomicUsize {
    match signo {
        libc::SIGBUS => &OLD_BUS,
        libc::SIGTRAP => &OLD_TRAP,
        _ => &OLD_SEGV,
    }
}

/// Installs `handler` for `signo` with `SA_SIGINFO | SA_RESTART` and returns
/// the previous sigaction for chaining.
pub fn install(signo: libc::c_int, handler: SignalHandlerFn) -> libc::sigaction {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = handler as usize;
        sa.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
        libc::sigemptyset(&mut sa.sa_mask);
        let mut old: libc::sigaction = mem::zeroed();
        libc::sigaction(signo, &sa, &mut old);
        old
    }
}

pub fn install_ignore(signo: libc::c_int) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaction(signo, &sa, std::ptr::null_mut());
    }
}

pub fn restore(signo: libc::c_int, old: &libc::sigaction) {
    unsafe {
        libc::sigaction(signo, old, std::ptr::null_mut());
    }
}

/// Forwards a signal to a previously captured disposition. Falls back to
/// re-raising with the default handler so genuine crashes still crash.
unsafe fn chain(
    old_ptr: usize,
    signo: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if old_ptr != 0 {
        let old = &*(old_ptr as *const libc::sigaction);
        if old.sa_flags & libc::SA_SIGINFO != 0 && old.sa_sigaction != 0 {
            let f: SignalHandlerFn = mem::transmute(old.sa_sigaction);
            f(signo, siginfo, ucontext);
            return;
        }
        if old.sa_sigaction != libc::SIG_DFL && old.sa_sigaction != libc::SIG_IGN {
            let f: unsafe extern "C" fn(libc::c_int) = mem::transmute(old.sa_sigaction);
            f(signo);
            return;
        }
        if old.sa_sigaction == libc::SIG_IGN {
            return;
        }
    }
    // Default disposition: restore and re-deliver.
    let mut sa: libc::sigaction = mem::zeroed();
    sa.sa_sigaction = libc::SIG_DFL;
    libc::sigaction(signo, &sa, std::ptr::null_mut());
    libc::raise(signo);
}

/// Registers a trap hook. Returns false when the fixed table is full.
pub fn register_trap_hook(hook: TrapHookFn) -> bool {
    for slot in &TRAP_HOOKS {
        if slot
            .compare_exchange(0, hook as usize, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return true;
        }
    }
    false
}

pub fn unregister_trap_hook(hook: TrapHookFn) {
    for slot in &TRAP_HOOKS {
        let _ = slot.compare_exchange(hook as usize, 0, Ordering::AcqRel, Ordering::Acquire);
    }
}

unsafe extern "C" fn trap_handler(
    signo: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let frame = StackFrame::new(ucontext);
    let pc = frame.pc();

    for slot in &TRAP_HOOKS {
        let raw = slot.load(Ordering::Acquire);
        if raw != 0 {
            let hook: TrapHookFn = mem::transmute(raw);
            if hook(pc, siginfo, ucontext) {
                return;
            }
        }
    }
    chain(old_slot(signo).load(Ordering::Acquire), signo, siginfo, ucontext);
}

unsafe extern "C" fn crash_handler(
    signo: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let mut frame = StackFrame::new(ucontext);
    let pc = frame.pc();

    // A fault inside the safe-load helper resumes at its recovery stub.
    if let Some(recovery) = safe_access::recovery_address(pc) {
        frame.set_pc(recovery);
        return;
    }

    // A fault on a page we patched means a stale breakpoint: give the trap
    // hooks a chance.
    if Trap::is_fault_instruction(pc) {
        for slot in &TRAP_HOOKS {
            let raw = slot.load(Ordering::Acquire);
            if raw != 0 {
                let hook: TrapHookFn = mem::transmute(raw);
                if hook(pc, siginfo, ucontext) {
                    return;
                }
            }
        }
    }

    // A load the unwinder issued against unmapped metadata: skip the
    // instruction with a zeroed destination and let the walk's bounds
    // checks stop it.
    if crate::profiler::in_signal_handler() && frame.skip_fault_instruction() {
        return;
    }

    chain(old_slot(signo).load(Ordering::Acquire), signo, siginfo, ucontext);
}

static OLD_SEGV_STORAGE: parking_lot::Mutex<Option<Box<libc::sigaction>>> =
    parking_lot::Mutex::new(None);
static OLD_BUS_STORAGE: parking_lot::Mutex<Option<Box<libc::sigaction>>> =
    parking_lot::Mutex::new(None);
static OLD_TRAP_STORAGE: parking_lot::Mutex<Option<Box<libc::sigaction>>> =
    parking_lot::Mutex::new(None);

/// Installs the crash and trap dispatchers, once.
pub fn setup_crash_handlers() {
    let mut segv = OLD_SEGV_STORAGE.lock();
    if segv.is_some() {
        return;
    }
    let old = Box::new(install(libc::SIGSEGV, crash_handler));
    OLD_SEGV.store(&*old as *const _ as usize, Ordering::Release);
    *segv = Some(old);

    let old = Box::new(install(libc::SIGBUS, crash_handler));
    OLD_BUS.store(&*old as *const _ as usize, Ordering::Release);
    *OLD_BUS_STORAGE.lock() = Some(old);

    let old = Box::new(install(libc::SIGTRAP, trap_handler));
    OLD_TRAP.store(&*old as *const _ as usize, Ordering::Release);
    *OLD_TRAP_STORAGE.lock() = Some(old);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::safe_access;

    #[test]
    fn safe_load_recovers_after_handler_installation() {
        setup_crash_handlers();
        // A read of unmapped memory returns the default instead of
        // crashing the test process.
        let bad = 0x100 as *const usize;
        assert_eq!(safe_access::load(bad, 0x5a5a), 0x5a5a);
        // Mapped memory still reads through.
        let value: usize = 77;
        assert_eq!(safe_access::load(&value, 0), 77);
    }

    #[test]
    fn trap_hook_registration_round_trip() {
        unsafe fn hook(_pc: usize, _si: *mut libc::siginfo_t, _uc: *mut libc::c_void) -> bool {
            false
        }
        assert!(register_trap_hook(hook));
        unregister_trap_hook(hook);
    }
}
