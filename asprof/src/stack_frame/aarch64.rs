use super::StackFrame;

pub const FRAME_PC_SLOT: usize = 1;
pub const EMPTY_FRAME_SIZE: usize = 0;
pub const LINKED_FRAME_SIZE: usize = 16;
pub const SYSCALL_SIZE: usize = 4;

/// Strip pointer-authentication bits.
#[inline]
pub fn strip_pointer(pc: usize) -> usize {
    pc & ((1usize << 55) - 1)
}

const RET: u32 = 0xd65f_03c0;
const STP_X29_X30_PRE: u32 = 0xa9bf_7bfd; // stp x29, x30, [sp, #-16]!

impl StackFrame {
    #[inline]
    fn reg(&self, index: usize) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.regs[index] as usize }
    }

    #[inline]
    fn set_reg(&mut self, index: usize, value: usize) {
        unsafe {
            (*self.ucontext).uc_mcontext.regs[index] = value as u64;
        }
    }

    pub fn pc(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.pc as usize }
    }

    pub fn set_pc(&mut self, value: usize) {
        unsafe {
            (*self.ucontext).uc_mcontext.pc = value as u64;
        }
    }

    pub fn sp(&self) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.sp as usize }
    }

    pub fn set_sp(&mut self, value: usize) {
        unsafe {
            (*self.ucontext).uc_mcontext.sp = value as u64;
        }
    }

    pub fn fp(&self) -> usize {
        self.reg(29)
    }

    pub fn set_fp(&mut self, value: usize) {
        self.set_reg(29, value)
    }

    pub fn retval(&self) -> usize {
        self.reg(0)
    }

    pub fn set_retval(&mut self, value: usize) {
        self.set_reg(0, value)
    }

    pub fn link(&self) -> usize {
        self.reg(30)
    }

    pub fn arg0(&self) -> usize {
        self.reg(0)
    }

    pub fn arg1(&self) -> usize {
        self.reg(1)
    }

    pub fn arg2(&self) -> usize {
        self.reg(2)
    }

    pub fn arg3(&self) -> usize {
        self.reg(3)
    }

    /// The interpreter keeps the current method in x12.
    pub fn method(&self) -> usize {
        self.reg(12)
    }

    /// Sender sp register moved from x13 to x19 in newer runtimes
    /// (JDK-8288971); x13 covers the versions the adapter targets first.
    pub fn sender_sp(&self) -> usize {
        self.reg(13)
    }

    /// Leaves the trapped function by simulating `ret`.
    pub fn ret(&mut self) {
        let link = self.link();
        self.set_pc(link);
    }

    pub fn unwind_stub(
        &self,
        entry: *const u8,
        name: &str,
        pc: &mut usize,
        sp: &mut usize,
        fp: &mut usize,
    ) -> bool {
        let ip = *pc as *const u32;
        let entry = entry as *const u32;
        unsafe {
            if ip == entry
                || *ip == RET
                || name.starts_with("itable")
                || name.starts_with("vtable")
                || name == "InlineCacheBuffer"
                || name == "zero_blocks"
                || name == "atomic entry points"
            {
                *pc = self.link();
                return true;
            }
            if name.ends_with("copy_longs") {
                // Arraycopy stubs maintain the regular frame link.
                if Self::within_current_stack(*fp) {
                    *sp = *fp + 16;
                    *fp = *((*sp as *const usize).offset(-2));
                    *pc = (*(*sp as *const usize).offset(-1)).wrapping_sub(4);
                } else {
                    *pc = self.link();
                }
                return true;
            }
            if !entry.is_null() && *entry == STP_X29_X30_PRE {
                // The stub begins with
                //   stp x29, x30, [sp, #-16]!
                //   mov x29, sp
                if ip == entry.add(1) {
                    *sp += 16;
                    *pc = *((*sp as *const usize).offset(-1));
                    return true;
                } else if Self::within_current_stack(*fp) {
                    *sp = *fp + 16;
                    *fp = *((*sp as *const usize).offset(-2));
                    *pc = *((*sp as *const usize).offset(-1));
                    return true;
                }
            }
        }
        false
    }

    pub fn unwind_compiled(
        &self,
        entry: *const u8,
        frame_size: usize,
        pc: &mut usize,
        sp: &mut usize,
        fp: &mut usize,
    ) -> bool {
        let ip = *pc as *const u32;
        let entry = entry as *const u32;
        unsafe {
            if ip <= entry || *ip == RET {
                // Frame not yet constructed or about to return: the caller's
                // pc is still in the link register.
                *pc = strip_pointer(self.link()).wrapping_sub(4);
                return true;
            }
            if *entry == STP_X29_X30_PRE {
                if ip == entry.add(1) {
                    *sp += 16;
                    *pc = strip_pointer(*((*sp as *const usize).offset(-1))).wrapping_sub(4);
                    return true;
                }
                if Self::within_current_stack(*fp) {
                    *sp = *fp + 16;
                    *fp = *((*sp as *const usize).offset(-2));
                    *pc = strip_pointer(*((*sp as *const usize).offset(-1))).wrapping_sub(4);
                    return true;
                }
            }
            let _ = frame_size;
        }
        false
    }

    /// Ldadd/swp sequences in atomic stubs leave lr pointing at the caller;
    /// treat a top-frame PC inside them as already unwound.
    pub fn unwind_atomic_stub(&self, pc: usize) -> bool {
        let insn = unsafe { (pc as *const u32).read_unaligned() };
        // ldaxr / stlxr family
        (insn & 0x3f00_0000) == 0x0800_0000
    }

    /// Compiled code occasionally extends sp past the frame for out-of-line
    /// slow paths near the entry; nothing to correct here on AArch64.
    pub fn adjust_sp(&self, _entry: usize, _pc: usize, _sp: &mut usize) {}

    /// Skips a faulted `ldr x<d>, [x<n>, #off]` by zeroing the destination.
    pub fn skip_fault_instruction(&mut self) -> bool {
        let insn = unsafe { (self.pc() as *const u32).read_unaligned() };
        if (insn & 0xffc0_0000) != 0xf940_0000 {
            return false;
        }
        let dest = (insn & 0x1f) as usize;
        if dest < 31 {
            self.set_reg(dest, 0);
        }
        let pc = self.pc();
        self.set_pc(pc + 4);
        true
    }

    pub fn check_interrupted_syscall(&mut self) -> bool {
        self.retval() == (-libc::EINTR) as usize
    }

    pub fn is_syscall(pc: *const u8) -> bool {
        unsafe { (pc as *const u32).read_unaligned() == 0xd400_0001 } // svc #0
    }
}
