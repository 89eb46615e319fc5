use super::StackFrame;

pub const FRAME_PC_SLOT: usize = 1;
pub const EMPTY_FRAME_SIZE: usize = 8;
pub const LINKED_FRAME_SIZE: usize = 16;
pub const SYSCALL_SIZE: usize = 2;

/// No pointer authentication on x86.
#[inline]
pub fn strip_pointer(pc: usize) -> usize {
    pc
}

impl StackFrame {
    #[inline]
    fn greg(&self, reg: i32) -> usize {
        unsafe { (*self.ucontext).uc_mcontext.gregs[reg as usize] as usize }
    }

    #[inline]
    fn set_greg(&mut self, reg: i32, value: usize) {
        unsafe {
            (*self.ucontext).uc_mcontext.gregs[reg as usize] = value as i64;
        }
    }

    pub fn pc(&self) -> usize {
        self.greg(libc::REG_RIP)
    }

    pub fn set_pc(&mut self, value: usize) {
        self.set_greg(libc::REG_RIP, value)
    }

    pub fn sp(&self) -> usize {
        self.greg(libc::REG_RSP)
    }

    pub fn set_sp(&mut self, value: usize) {
        self.set_greg(libc::REG_RSP, value)
    }

    pub fn fp(&self) -> usize {
        self.greg(libc::REG_RBP)
    }

    pub fn set_fp(&mut self, value: usize) {
        self.set_greg(libc::REG_RBP, value)
    }

    pub fn retval(&self) -> usize {
        self.greg(libc::REG_RAX)
    }

    pub fn set_retval(&mut self, value: usize) {
        self.set_greg(libc::REG_RAX, value)
    }

    /// No link register on x86.
    pub fn link(&self) -> usize {
        0
    }

    pub fn arg0(&self) -> usize {
        self.greg(libc::REG_RDI)
    }

    pub fn arg1(&self) -> usize {
        self.greg(libc::REG_RSI)
    }

    pub fn arg2(&self) -> usize {
        self.greg(libc::REG_RDX)
    }

    pub fn arg3(&self) -> usize {
        self.greg(libc::REG_RCX)
    }

    /// The interpreter keeps the current method in rbx.
    pub fn method(&self) -> usize {
        self.greg(libc::REG_RBX)
    }

    /// The interpreter keeps the caller's sp in r13.
    pub fn sender_sp(&self) -> usize {
        self.greg(libc::REG_R13)
    }

    /// Leaves the trapped function by simulating a `ret`.
    pub fn ret(&mut self) {
        let return_address = self.stack_at(0);
        self.set_pc(return_address);
        let sp = self.sp();
        self.set_sp(sp + 8);
    }

    /// Unwinds one frame of a runtime stub interrupted at an arbitrary
    /// instruction, using prologue byte patterns.
    pub fn unwind_stub(
        &self,
        entry: *const u8,
        name: &str,
        pc: &mut usize,
        sp: &mut usize,
        fp: &mut usize,
    ) -> bool {
        let ip = *pc as *const u8;
        unsafe {
            if ip == entry
                || *ip == 0xc3
                || name.starts_with("itable")
                || name.starts_with("vtable")
                || name == "InlineCacheBuffer"
            {
                *pc = (*(*sp as *const usize)).wrapping_sub(1);
                *sp += 8;
                return true;
            }
            if !entry.is_null() && (entry as *const u32).read_unaligned() == 0xec8b_4855 {
                // The stub begins with
                //   push rbp
                //   mov  rbp, rsp
                if ip == entry.add(1) {
                    *pc = (*(*sp as *const usize).add(1)).wrapping_sub(1);
                    *sp += 16;
                    return true;
                } else if Self::within_current_stack(*fp) {
                    *sp = *fp + 16;
                    *fp = *((*sp as *const usize).offset(-2));
                    *pc = (*(*sp as *const usize).offset(-1)).wrapping_sub(1);
                    return true;
                }
            }
        }
        false
    }

    /// Unwinds a compiled frame that is not yet (or no longer) complete.
    /// `entry` is the method's code entry, `frame_size` its declared frame
    /// size in words.
    pub fn unwind_compiled(
        &self,
        entry: *const u8,
        frame_size: usize,
        pc: &mut usize,
        sp: &mut usize,
        fp: &mut usize,
    ) -> bool {
        let ip = *pc as *const u8;
        unsafe {
            if ip <= entry
                || *ip == 0xc3                                             // ret
                || *ip == 0x55                                             // push rbp
                || *ip.offset(-1) == 0x5d                                  // after pop rbp
                || (*ip == 0x41 && *ip.add(1) == 0x85 && *ip.add(2) == 0x02 && *ip.add(3) == 0xc3)
            {
                // Subtract 1 so the PC points at the call instruction,
                // otherwise the sample lands on the wrong bytecode.
                *pc = (*(*sp as *const usize)).wrapping_sub(1);
                *sp += 8;
                return true;
            }
            if *ip == 0x5d {
                // pop rbp
                *fp = *(*sp as *const usize);
                *pc = (*(*sp as *const usize).add(1)).wrapping_sub(1);
                *sp += 16;
                return true;
            }
            if ip <= entry.add(15) && (*pc & 0xfff) != 0 && *ip.offset(-1) == 0x55 {
                // right after push rbp
                *pc = (*(*sp as *const usize).add(1)).wrapping_sub(1);
                *sp += 16;
                return true;
            }
            if ip <= entry.add(7)
                && *ip == 0x48
                && *ip.add(1) == 0x89
                && *ip.add(2) == 0x6c
                && *ip.add(3) == 0x24
            {
                // mov [rsp + #off], rbp
                *sp += *ip.add(4) as usize + 16;
                *pc = (*(*sp as *const usize).offset(-1)).wrapping_sub(1);
                return true;
            }
            let is_entry_barrier = |p: *const u8| {
                *p == 0x41 && *p.add(1) == 0x81 && *p.add(2) == 0x7f
                    && (p.add(4) as *const u32).read_unaligned() == 1
            };
            if is_entry_barrier(ip) || (ip >= entry.add(8) && is_entry_barrier(ip.offset(-8))) {
                // cmp [r15 + #off], 1 — the nmethod entry barrier runs with
                // the frame fully constructed.
                *sp += frame_size * 8;
                *fp = *((*sp as *const usize).offset(-2));
                *pc = *((*sp as *const usize).offset(-1));
                return true;
            }
        }
        false
    }

    /// x86 has no atomic-sequence stubs that need special top-frame care.
    pub fn unwind_atomic_stub(&self, _pc: usize) -> bool {
        false
    }

    /// No sp adjustment needed on x86.
    pub fn adjust_sp(&self, _entry: usize, _pc: usize, _sp: &mut usize) {}

    /// Skips a faulted `mov r64, [r64 + off]` by zeroing the destination
    /// register, so the unwinder survives reads of unmapped metadata.
    pub fn skip_fault_instruction(&mut self) -> bool {
        let insn = unsafe { (self.pc() as *const u32).read_unaligned() };
        if (insn & 0x80ff_f8) != 0x008b_48 {
            return false;
        }
        let reg = ((insn << 1) & 8) | ((insn >> 19) & 7);
        let target = match reg {
            0x0 => libc::REG_RAX,
            0x1 => libc::REG_RCX,
            0x2 => libc::REG_RDX,
            0x3 => libc::REG_RBX,
            0x4 => return false, // never touch RSP
            0x5 => libc::REG_RBP,
            0x6 => libc::REG_RSI,
            0x7 => libc::REG_RDI,
            0x8 => libc::REG_R8,
            0x9 => libc::REG_R9,
            0xa => libc::REG_R10,
            0xb => libc::REG_R11,
            0xc => libc::REG_R12,
            0xd => libc::REG_R13,
            0xe => libc::REG_R14,
            _ => libc::REG_R15,
        };
        self.set_greg(target, 0);

        let mut insn_size = 3;
        if (insn & 0x07_0000) == 0x04_0000 {
            insn_size += 1;
        }
        if (insn & 0x40_0000) == 0x40_0000 {
            insn_size += 1;
        }
        let pc = self.pc();
        self.set_pc(pc + insn_size);
        true
    }

    /// Whether the thread was interrupted inside a syscall that returned
    /// EINTR; also restarts pollers with infinite timeouts, which the
    /// runtime does not restart by itself.
    pub fn check_interrupted_syscall(&mut self) -> bool {
        if self.retval() != (-libc::EINTR) as usize {
            return false;
        }
        // Check for mov eax, SYS_poll/ppoll/epoll_wait with infinite timeout
        // right before the syscall instruction and rewind to restart it.
        let pc = self.pc();
        if (pc & 0xfff) >= 7 && unsafe { *((pc - 7) as *const u8) } == 0xb8 {
            let nr = unsafe { ((pc - 6) as *const i32).read_unaligned() };
            let rdx = self.greg(libc::REG_RDX) as i64 as i32;
            let r10 = self.greg(libc::REG_R10) as i64 as i32;
            if nr == libc::SYS_ppoll as i32
                || (nr == libc::SYS_poll as i32 && rdx == -1)
                || (nr == libc::SYS_epoll_wait as i32 && r10 == -1)
                || (nr == libc::SYS_epoll_pwait as i32 && r10 == -1)
            {
                self.set_pc(pc - 7);
            }
        }
        true
    }

    pub fn is_syscall(pc: *const u8) -> bool {
        unsafe { *pc == 0x0f && *pc.add(1) == 0x05 }
    }
}
