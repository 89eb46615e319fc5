//! Access to the interrupted machine context.
//!
//! A [`StackFrame`] wraps the `ucontext_t` delivered to a signal handler and
//! exposes the registers the unwinder and the trap handlers need. The
//! architecture-specific accessors and the compiled-code prologue/epilogue
//! heuristics live in the per-arch submodules.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use x86_64::*;
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use aarch64::*;
    }
}

pub struct StackFrame {
    ucontext: *mut libc::ucontext_t,
}

impl StackFrame {
    /// Wraps a `void* ucontext` as delivered by `sigaction`.
    ///
    /// # Safety
    /// `ucontext` must point to a live `ucontext_t` for as long as the
    /// returned frame is used.
    pub unsafe fn new(ucontext: *mut libc::c_void) -> StackFrame {
        StackFrame {
            ucontext: ucontext as *mut libc::ucontext_t,
        }
    }

    pub fn stack_at(&self, slot: isize) -> usize {
        unsafe { *(self.sp() as *const usize).offset(slot) }
    }

    /// Whether `address` is plausibly on the stack this code runs on.
    pub fn within_current_stack(address: usize) -> bool {
        let probe: usize = 0;
        address.wrapping_sub(&probe as *const usize as usize) <= 0xffff
    }

    pub fn restore(&mut self, saved_pc: usize, saved_sp: usize, saved_fp: usize) {
        self.set_pc(saved_pc);
        self.set_sp(saved_sp);
        self.set_fp(saved_fp);
    }
}

/// Approximate `(pc, sp, fp)` of the caller, for synchronous self-profiling
/// where no interrupted context exists.
#[inline(never)]
pub fn current_frame() -> (usize, usize, usize) {
    let pc: usize;
    let sp: usize;
    let fp: usize;
    #[cfg(target_arch = "x86_64")]
    unsafe {
        core::arch::asm!(
            "lea {pc}, [rip]",
            "mov {sp}, rsp",
            "mov {fp}, rbp",
            pc = out(reg) pc,
            sp = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack),
        );
    }
    #[cfg(target_arch = "aarch64")]
    unsafe {
        core::arch::asm!(
            "adr {pc}, .",
            "mov {sp_out}, sp",
            "mov {fp}, x29",
            pc = out(reg) pc,
            sp_out = out(reg) sp,
            fp = out(reg) fp,
            options(nomem, nostack),
        );
    }
    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        pc = 0;
        sp = 0;
        fp = 0;
    }
    (pc, sp, fp)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_frame_is_plausible() {
        let (pc, sp, fp) = current_frame();
        assert_ne!(pc, 0);
        assert_ne!(sp, 0);
        // fp may legitimately be unused with -fomit-frame-pointer, but on
        // test builds it tracks the stack.
        let local: usize = 0;
        let here = &local as *const usize as usize;
        assert!(sp.abs_diff(here) < 0x10000);
        let _ = fp;
    }

    #[test]
    fn within_current_stack_accepts_nearby_locals() {
        let local: usize = 0;
        assert!(StackFrame::within_current_stack(&local as *const usize as usize));
        assert!(!StackFrame::within_current_stack(0x1000));
    }
}
