//! The unwinder: reconstructs a bounded stack from an arbitrary interrupted
//! context.
//!
//! Three modes, selectable per engine: a frame-pointer walk, a DWARF walk
//! over the compact CFI tables, and the runtime-aware walk that understands
//! compiled, interpreted and stub frames. Every step validates that the walk
//! makes forward progress within plausible bounds; every read of stack or
//! metadata memory goes through [`safe_access`], so a fault yields a zero
//! that the bounds checks turn into a clean stop instead of a crash.

use crate::code_cache::CodeCache;
use crate::dictionary::Dictionary;
use crate::dwarf::{FrameDesc, DW_PC_OFFSET, DW_REG_FP, DW_REG_PLT, DW_REG_SP, DW_SAME_FP};
use crate::frame::{Frame, FrameTypeId, BCI_ERROR, BCI_NATIVE_FRAME};
use crate::safe_access;
use crate::stack_frame::{
    current_frame, strip_pointer, StackFrame, EMPTY_FRAME_SIZE, FRAME_PC_SLOT, LINKED_FRAME_SIZE,
};
use crate::vm::{InterpreterFrame, NMethodKind, ScopeDesc, VMMethod, VMStructs};

const MAX_WALK_SIZE: usize = 0x100000;
const MAX_FRAME_SIZE: usize = 0x40000;
const MAX_INTERPRETER_FRAME_SIZE: usize = 0x1000;
const DEAD_ZONE: usize = 0x1000;

#[inline]
fn aligned(ptr: usize) -> bool {
    ptr & (std::mem::size_of::<usize>() - 1) == 0
}

#[inline]
fn in_dead_zone(ptr: usize) -> bool {
    ptr < DEAD_ZONE || ptr > usize::MAX - DEAD_ZONE
}

/// Where a native walk stopped at the managed-code boundary; the runtime
/// walk resumes from here.
#[derive(Debug, Clone, Copy, Default)]
pub struct JavaStackContext {
    pub pc: usize,
    pub sp: usize,
    pub fp: usize,
}

impl JavaStackContext {
    fn set(&mut self, pc: usize, sp: usize, fp: usize) {
        self.pc = pc;
        self.sp = sp;
        self.fp = fp;
    }
}

/// Everything the walker needs to classify a PC.
pub struct WalkEnv<'a> {
    pub libraries: &'a [CodeCache],
    pub vm: Option<&'a VMStructs>,
    pub symbols: &'a Dictionary,
}

impl<'a> WalkEnv<'a> {
    fn find_library(&self, pc: usize) -> Option<&CodeCache> {
        self.libraries.iter().find(|lib| lib.contains(pc))
    }

    fn code_heap_contains(&self, pc: usize) -> bool {
        self.vm.is_some_and(|vm| vm.code_heap_contains(pc))
    }

    /// Name of the native function at `pc`, interned. Unresolvable PCs get a
    /// raw-address frame instead.
    pub fn native_frame(&self, pc: usize) -> Frame {
        match self.find_library(pc).and_then(|lib| lib.find_symbol(pc)) {
            Some(symbol) => Frame::symbol(BCI_NATIVE_FRAME, self.symbols.lookup(&symbol.name) as u64),
            None => Frame::address(pc as u64),
        }
    }

    pub fn error_frame(&self, marker: &str) -> Frame {
        Frame::symbol(BCI_ERROR, self.symbols.lookup(marker) as u64)
    }
}

fn initial_state(frame: Option<&StackFrame>) -> (usize, usize, usize) {
    match frame {
        Some(frame) => (frame.pc(), frame.sp(), frame.fp()),
        None => {
            let (pc, sp, fp) = current_frame();
            (pc, sp + LINKED_FRAME_SIZE, fp)
        }
    }
}

/// Frame-pointer walk: follow `fp[0]`/`fp[1]` links until the PC enters the
/// managed code heap or the chain stops being plausible.
pub fn walk_fp(
    env: &WalkEnv,
    frame: Option<&StackFrame>,
    callchain: &mut [usize],
    java_ctx: &mut JavaStackContext,
) -> usize {
    let (mut pc, mut sp, mut fp) = initial_state(frame);
    let anchor: usize = 0;
    let bottom = (&anchor as *const usize as usize) + MAX_WALK_SIZE;

    let mut depth = 0;
    while depth < callchain.len() {
        if env.code_heap_contains(pc)
            && !(depth == 0 && frame.is_some_and(|f| f.unwind_atomic_stub(pc)))
        {
            java_ctx.set(pc, sp, fp);
            break;
        }

        callchain[depth] = pc;
        depth += 1;

        // The next frame must be above this one on the same stack.
        if fp < sp || fp >= sp + MAX_FRAME_SIZE || fp >= bottom {
            break;
        }
        if !aligned(fp) {
            break;
        }

        pc = strip_pointer(safe_access::load(
            (fp + FRAME_PC_SLOT * std::mem::size_of::<usize>()) as *const usize,
            0,
        ));
        if in_dead_zone(pc) {
            break;
        }

        sp = fp + (FRAME_PC_SLOT + 1) * std::mem::size_of::<usize>();
        fp = safe_access::load(fp as *const usize, 0);
    }

    depth
}

/// Applies one compact CFI rule. Returns false when the walk must stop.
fn apply_frame_desc(
    desc: &FrameDesc,
    frame: Option<&StackFrame>,
    depth: usize,
    pc: &mut usize,
    sp: &mut usize,
    fp: &mut usize,
    bottom: usize,
) -> bool {
    let prev_sp = *sp;
    if prev_sp == 0 {
        return false;
    }

    let cfa_reg = desc.cfa_reg();
    let cfa_off = desc.cfa_off();
    if cfa_reg == DW_REG_SP {
        *sp = prev_sp.wrapping_add(cfa_off as isize as usize);
    } else if cfa_reg == DW_REG_FP {
        *sp = fp.wrapping_add(cfa_off as isize as usize);
    } else if cfa_reg == DW_REG_PLT {
        // PLT slots push one extra word halfway through.
        *sp = prev_sp + if (*pc & 15) >= 11 { cfa_off as usize * 2 } else { cfa_off as usize };
    } else {
        return false;
    }

    if *sp < prev_sp || *sp >= prev_sp + MAX_FRAME_SIZE || *sp >= bottom {
        return false;
    }
    if !aligned(*sp) {
        return false;
    }

    if desc.fp_off & DW_PC_OFFSET != 0 {
        *pc = pc.wrapping_add((desc.fp_off >> 1) as isize as usize);
    } else {
        if desc.fp_off != DW_SAME_FP
            && desc.fp_off < MAX_FRAME_SIZE as i32
            && desc.fp_off > -(MAX_FRAME_SIZE as i32)
        {
            *fp = safe_access::load(
                sp.wrapping_add(desc.fp_off as isize as usize) as *const usize,
                0,
            );
        }
        if EMPTY_FRAME_SIZE > 0 || cfa_off != 0 {
            *pc = strip_pointer(safe_access::load(
                sp.wrapping_add(desc.pc_off as isize as usize) as *const usize,
                0,
            ));
        } else if desc.fp_off != DW_SAME_FP {
            // Frame-record walk: the default descriptor on link-register
            // architectures.
            *pc = strip_pointer(safe_access::load(
                sp.wrapping_add(desc.pc_off as isize as usize) as *const usize,
                0,
            ));
            *sp = *fp;
        } else if depth <= 1 {
            *pc = match frame {
                Some(frame) => frame.link(),
                None => 0,
            };
        } else {
            return false;
        }
    }

    !in_dead_zone(*pc)
}

/// DWARF walk: per-PC CFI rules with a default descriptor for PCs that have
/// no FDE.
pub fn walk_dwarf(
    env: &WalkEnv,
    frame: Option<&StackFrame>,
    callchain: &mut [usize],
    java_ctx: &mut JavaStackContext,
) -> usize {
    let (mut pc, mut sp, mut fp) = initial_state(frame);
    let anchor: usize = 0;
    let bottom = (&anchor as *const usize as usize) + MAX_WALK_SIZE;

    let default_desc = FrameDesc::default_frame();
    let mut depth = 0;
    while depth < callchain.len() {
        if env.code_heap_contains(pc)
            && !(depth == 0 && frame.is_some_and(|f| f.unwind_atomic_stub(pc)))
        {
            java_ctx.set(pc, sp, fp);
            break;
        }

        callchain[depth] = pc;
        depth += 1;

        let desc = match env.find_library(pc) {
            Some(lib) if lib.is_plt(pc) => FrameDesc::plt_frame(0),
            Some(lib) => *lib.find_frame_desc(pc).unwrap_or(&default_desc),
            None => default_desc,
        };
        if !apply_frame_desc(&desc, frame, depth, &mut pc, &mut sp, &mut fp, bottom) {
            break;
        }
    }

    depth
}

/// The runtime-aware walk: mixed native, compiled, inlined, interpreted and
/// stub frames, producing fully classified [`Frame`]s.
pub fn walk_vm(
    env: &WalkEnv,
    frame: Option<&StackFrame>,
    frames: &mut [Frame],
) -> usize {
    let (mut pc, mut sp, mut fp) = initial_state(frame);
    let anchor: usize = 0;
    let bottom = (&anchor as *const usize as usize) + MAX_WALK_SIZE;

    let mut depth = 0;
    let default_desc = FrameDesc::default_frame();

    'walk: while depth < frames.len() {
        if let Some(vm) = env.vm.filter(|vm| vm.code_heap_contains(pc)) {
            let Some(nm) = vm.find_nmethod(pc) else {
                frames[depth] = env.error_frame("unknown_nmethod");
                depth += 1;
                break;
            };
            match nm.kind() {
                NMethodKind::Compiled => {
                    let level = nm.level();
                    let type_id = if (1..=3).contains(&level) {
                        FrameTypeId::C1Compiled
                    } else {
                        FrameTypeId::JitCompiled
                    };
                    frames[depth] = Frame::managed(type_id, 0, nm.method().id());
                    depth += 1;

                    if nm.is_frame_complete_at(pc) {
                        let mut scope_offset = nm.find_scope_offset(pc);
                        if scope_offset > 0 {
                            // Replace the plain frame with the full inline
                            // chain, callee first.
                            depth -= 1;
                            let mut scope = ScopeDesc::new(nm);
                            loop {
                                scope_offset = scope.decode(scope_offset);
                                let type_id = if scope_offset > 0 {
                                    FrameTypeId::Inlined
                                } else if (1..=3).contains(&level) {
                                    FrameTypeId::C1Compiled
                                } else {
                                    FrameTypeId::JitCompiled
                                };
                                frames[depth] =
                                    Frame::managed(type_id, scope.bci(), scope.method().id());
                                depth += 1;
                                if scope_offset <= 0 || depth >= frames.len() {
                                    break;
                                }
                            }
                        }

                        let mut adjusted_sp = sp;
                        if let Some(frame) = frame {
                            frame.adjust_sp(nm.entry(), pc, &mut adjusted_sp);
                        }
                        sp = adjusted_sp.wrapping_add(nm.frame_size() * std::mem::size_of::<usize>());
                        fp = safe_access::load(
                            sp.wrapping_sub((FRAME_PC_SLOT + 1) * std::mem::size_of::<usize>())
                                as *const usize,
                            0,
                        );
                        pc = safe_access::load(
                            sp.wrapping_sub(FRAME_PC_SLOT * std::mem::size_of::<usize>())
                                as *const usize,
                            0,
                        );
                        if in_dead_zone(pc) || !aligned(sp) || sp >= bottom {
                            break;
                        }
                        continue;
                    }

                    if let Some(frame) = frame {
                        if frame.unwind_compiled(
                            nm.entry() as *const u8,
                            nm.frame_size(),
                            &mut pc,
                            &mut sp,
                            &mut fp,
                        ) && env.find_library(pc).is_some()
                        {
                            continue;
                        }
                    }

                    frames[depth] = env.error_frame("break_compiled");
                    depth += 1;
                    break;
                }
                NMethodKind::Interpreter => {
                    const WORD: isize = std::mem::size_of::<usize>() as isize;
                    let slot = |base: usize, offset: isize| (base as isize + offset * WORD) as usize;

                    let bcp_offset = InterpreterFrame::bcp_offset(&vm.offsets);
                    let plausible = !in_dead_zone(fp)
                        && aligned(fp)
                        && sp > fp.wrapping_sub(MAX_INTERPRETER_FRAME_SIZE)
                        && (sp as isize) < fp as isize + bcp_offset * WORD;

                    if plausible {
                        let method_addr = safe_access::load(
                            slot(fp, InterpreterFrame::METHOD_OFFSET) as *const usize,
                            0,
                        );
                        let method = VMMethod::new(method_addr, &vm.offsets);
                        let method_id = method.id();
                        if method_id != 0 {
                            let bytecode_start = method.bytecode_start();
                            let bcp = safe_access::load(slot(fp, bcp_offset) as *const usize, 0);
                            let bci = if bytecode_start == 0 || bcp < bytecode_start {
                                0
                            } else {
                                (bcp - bytecode_start) as i32
                            };
                            frames[depth] = Frame::managed(FrameTypeId::Interpreted, bci, method_id);
                            depth += 1;

                            sp = safe_access::load(
                                slot(fp, InterpreterFrame::SENDER_SP_OFFSET) as *const usize,
                                0,
                            );
                            pc = strip_pointer(safe_access::load(
                                slot(fp, FRAME_PC_SLOT as isize) as *const usize,
                                0,
                            ));
                            fp = safe_access::load(fp as *const usize, 0);
                            if in_dead_zone(pc) || sp == 0 {
                                break;
                            }
                            continue;
                        }
                    }

                    if depth == 0 {
                        // The method register still holds the Method* while
                        // the frame is being set up.
                        if let Some(frame) = frame {
                            let method = VMMethod::new(frame.method(), &vm.offsets);
                            let method_id = method.id();
                            if method_id != 0 {
                                frames[depth] =
                                    Frame::managed(FrameTypeId::Interpreted, 0, method_id);
                                depth += 1;
                                pc = strip_pointer(safe_access::load(sp as *const usize, 0));
                                sp = frame.sender_sp();
                                if in_dead_zone(pc) || sp == 0 {
                                    break;
                                }
                                continue;
                            }
                        }
                    }

                    frames[depth] = env.error_frame("break_interpreted");
                    depth += 1;
                    break;
                }
                NMethodKind::Stub => {
                    let name = nm.name().unwrap_or("stub");
                    frames[depth] =
                        Frame::symbol(BCI_NATIVE_FRAME, env.symbols.lookup(name) as u64);
                    depth += 1;

                    if let Some(frame) = frame {
                        if frame.unwind_stub(
                            nm.entry() as *const u8,
                            name,
                            &mut pc,
                            &mut sp,
                            &mut fp,
                        ) {
                            continue;
                        }
                    }
                    if depth > 1 && nm.frame_size() > 0 {
                        sp = sp.wrapping_add(nm.frame_size() * std::mem::size_of::<usize>());
                        fp = safe_access::load(
                            sp.wrapping_sub((FRAME_PC_SLOT + 1) * std::mem::size_of::<usize>())
                                as *const usize,
                            0,
                        );
                        pc = safe_access::load(
                            sp.wrapping_sub(FRAME_PC_SLOT * std::mem::size_of::<usize>())
                                as *const usize,
                            0,
                        );
                        if in_dead_zone(pc) {
                            break;
                        }
                        continue;
                    }
                    // Fall through to the CFI step below.
                }
            }
        } else {
            frames[depth] = env.native_frame(pc);
            depth += 1;
        }

        let desc = match env.find_library(pc) {
            Some(lib) if lib.is_plt(pc) => FrameDesc::plt_frame(0),
            Some(lib) => *lib.find_frame_desc(pc).unwrap_or(&default_desc),
            None => default_desc,
        };
        if !apply_frame_desc(&desc, frame, depth, &mut pc, &mut sp, &mut fp, bottom) {
            break 'walk;
        }
    }

    depth
}

/// Synchronous self-sample: used by engines that record on the current
/// thread without an interrupted context.
pub fn walk_self(env: &WalkEnv, frames: &mut [Frame]) -> usize {
    let mut callchain = [0usize; 256];
    let mut java_ctx = JavaStackContext::default();
    let limit = callchain.len().min(frames.len());
    let depth = walk_dwarf(env, None, &mut callchain[..limit], &mut java_ctx);
    for (i, &pc) in callchain[..depth].iter().enumerate() {
        frames[i] = env.native_frame(pc);
    }
    depth
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_cache::collect_libraries;
    use crate::stack_frame::current_frame;

    fn env_fixture<'a>(libraries: &'a [CodeCache], symbols: &'a Dictionary) -> WalkEnv<'a> {
        // Walks may probe unmapped memory; the crash handler must be in
        // place for the safe loads to recover.
        crate::signals::setup_crash_handlers();
        WalkEnv {
            libraries,
            vm: None,
            symbols,
        }
    }

    #[test]
    fn self_walk_produces_frames() {
        let libraries = collect_libraries();
        let symbols = Dictionary::new();
        let env = env_fixture(&libraries, &symbols);

        let mut frames = [Frame::address(0); 128];
        let depth = walk_self(&env, &mut frames);
        assert!(depth >= 1, "expected at least the leaf frame");
        for frame in &frames[..depth] {
            assert!(frame.is_symbol());
        }
    }

    #[test]
    fn fp_walk_stops_at_implausible_frame() {
        let libraries = collect_libraries();
        let symbols = Dictionary::new();
        let env = env_fixture(&libraries, &symbols);

        // A synthetic context with a garbage frame pointer must stop after
        // the first frame instead of wandering off.
        let mut callchain = [0usize; 16];
        let mut java_ctx = JavaStackContext::default();
        let (pc, sp, _) = current_frame();
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let mut frame = unsafe {
            StackFrame::new(&mut ucontext as *mut libc::ucontext_t as *mut libc::c_void)
        };
        frame.restore(pc, sp, 0x10);
        let depth = walk_fp(&env, Some(&frame), &mut callchain, &mut java_ctx);
        assert_eq!(depth, 1);
        assert_eq!(callchain[0], pc);
    }

    #[test]
    fn dwarf_walk_survives_garbage_context() {
        let libraries = collect_libraries();
        let symbols = Dictionary::new();
        let env = env_fixture(&libraries, &symbols);

        let mut callchain = [0usize; 16];
        let mut java_ctx = JavaStackContext::default();
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let mut frame = unsafe {
            StackFrame::new(&mut ucontext as *mut libc::ucontext_t as *mut libc::c_void)
        };
        frame.restore(0xdead, 0x2000, 0x3000);
        let depth = walk_dwarf(&env, Some(&frame), &mut callchain, &mut java_ctx);
        assert!(depth <= 2);
    }

    #[test]
    fn vm_walk_without_runtime_degrades_to_native() {
        let libraries = collect_libraries();
        let symbols = Dictionary::new();
        let env = env_fixture(&libraries, &symbols);

        let mut frames = [Frame::address(0); 64];
        let (pc, sp, fp) = current_frame();
        let mut ucontext: libc::ucontext_t = unsafe { std::mem::zeroed() };
        let mut frame = unsafe {
            StackFrame::new(&mut ucontext as *mut libc::ucontext_t as *mut libc::c_void)
        };
        frame.restore(pc, sp, fp);
        let depth = walk_vm(&env, Some(&frame), &mut frames);
        assert!(depth >= 1);
        assert!(frames[0].is_symbol());
    }
}
