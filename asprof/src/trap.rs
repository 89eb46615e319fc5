//! Breakpoint traps: patch a machine instruction at a named entry point,
//! restore it on uninstall. The containing page is made writable for the
//! patch and re-protected afterwards; two traps sharing a page are
//! unprotected once.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::os;

pub const TRAP_COUNT: usize = 4;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub type Instruction = u8;
        pub const BREAKPOINT: Instruction = 0xcc; // int3
        pub const BREAKPOINT_OFFSET: usize = 0;
    } else if #[cfg(target_arch = "aarch64")] {
        pub type Instruction = u32;
        pub const BREAKPOINT: Instruction = 0xd420_0000; // brk #0
        pub const BREAKPOINT_OFFSET: usize = 0;
    } else {
        pub type Instruction = u32;
        pub const BREAKPOINT: Instruction = 0;
        pub const BREAKPOINT_OFFSET: usize = 0;
    }
}

// Whether executable pages must drop PROT_EXEC while being written.
const WX_MEMORY: bool = false;

static PAGE_START: [AtomicUsize; TRAP_COUNT] = [
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
    AtomicUsize::new(0),
];

#[cfg(target_arch = "aarch64")]
extern "C" {
    fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
}

fn flush_cache(entry: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        __clear_cache(
            entry as *mut libc::c_char,
            (entry + std::mem::size_of::<Instruction>()) as *mut libc::c_char,
        );
    }
    #[cfg(not(target_arch = "aarch64"))]
    let _ = entry;
}

pub struct Trap {
    id: usize,
    unprotect: bool,
    protect: bool,
    entry: usize,
    breakpoint_insn: Instruction,
    saved_insn: Instruction,
}

impl Trap {
    pub const fn new(id: usize) -> Self {
        Trap {
            id,
            unprotect: true,
            protect: WX_MEMORY,
            entry: 0,
            breakpoint_insn: BREAKPOINT,
            saved_insn: 0 as Instruction,
        }
    }

    pub fn entry(&self) -> usize {
        self.entry
    }

    /// PC points either to the breakpoint instruction or to the next one.
    pub fn covers(&self, pc: usize) -> bool {
        self.entry != 0 && pc.wrapping_sub(self.entry) <= std::mem::size_of::<Instruction>()
    }

    pub fn assign(&mut self, address: usize) {
        self.assign_at(address, BREAKPOINT_OFFSET)
    }

    pub fn assign_at(&mut self, address: usize, offset: usize) {
        self.entry = address;
        if self.entry == 0 {
            return;
        }
        self.entry += offset;
        self.saved_insn = unsafe { (self.entry as *const Instruction).read() };
        PAGE_START[self.id].store(self.entry & !os::PAGE_MASK, Ordering::Relaxed);
    }

    /// Paired traps that live on the same page unprotect it once.
    pub fn pair(&mut self, second: &mut Trap) {
        if PAGE_START[self.id].load(Ordering::Relaxed)
            == PAGE_START[second.id].load(Ordering::Relaxed)
        {
            self.protect = false;
            second.unprotect = false;
        }
    }

    fn patch(&self, insn: Instruction) -> bool {
        let page = (self.entry & !os::PAGE_MASK) as *mut u8;
        if self.unprotect {
            let prot = if WX_MEMORY {
                libc::PROT_READ | libc::PROT_WRITE
            } else {
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC
            };
            if !os::mprotect(page, os::PAGE_SIZE, prot) {
                return false;
            }
        }

        unsafe { (self.entry as *mut Instruction).write(insn) };
        flush_cache(self.entry);

        if self.protect {
            os::mprotect(page, os::PAGE_SIZE, libc::PROT_READ | libc::PROT_EXEC);
        }
        true
    }

    pub fn install(&self) -> bool {
        self.entry == 0 || self.patch(self.breakpoint_insn)
    }

    pub fn uninstall(&self) -> bool {
        self.entry == 0 || self.patch(self.saved_insn)
    }

    /// Whether a faulting PC lies on a page that hosts one of our traps.
    pub fn is_fault_instruction(pc: usize) -> bool {
        PAGE_START
            .iter()
            .any(|page| pc.wrapping_sub(page.load(Ordering::Relaxed)) < os::PAGE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unassigned_trap_installs_as_noop() {
        let trap = Trap::new(3);
        assert!(trap.install());
        assert!(trap.uninstall());
        assert!(!trap.covers(0x1000));
    }

    #[test]
    fn patch_and_restore_in_anonymous_page() {
        // Patch a private executable-less page; install/uninstall only need
        // read/write here.
        let page = os::safe_alloc(os::PAGE_SIZE);
        assert!(!page.is_null());
        unsafe { (page as *mut Instruction).write(0x90 as Instruction) };

        let mut trap = Trap::new(0);
        trap.assign(page as usize);
        assert!(trap.covers(page as usize));
        assert!(trap.covers(page as usize + std::mem::size_of::<Instruction>()));
        assert!(!trap.covers(page as usize + 64));

        assert!(trap.install());
        assert_eq!(unsafe { (page as *const Instruction).read() }, BREAKPOINT);
        assert!(Trap::is_fault_instruction(page as usize + 8));

        assert!(trap.uninstall());
        assert_eq!(unsafe { (page as *const Instruction).read() }, 0x90 as Instruction);
        os::safe_free(page, os::PAGE_SIZE);
    }

    #[test]
    fn paired_traps_share_page_protection() {
        let page = os::safe_alloc(os::PAGE_SIZE);
        let mut first = Trap::new(1);
        let mut second = Trap::new(2);
        first.assign(page as usize);
        second.assign(page as usize + 64);
        first.pair(&mut second);
        assert!(first.install() && second.install());
        assert!(first.uninstall() && second.uninstall());
        os::safe_free(page, os::PAGE_SIZE);
    }
}
