//! Read-only adapter over the hosted runtime's internal structures.
//!
//! Nothing in here assumes a fixed layout: every field offset is discovered
//! at attach time from the metadata tables the runtime exports
//! (`gHotSpotVMStructs` and friends), the way serviceability agents do it.
//! When the tables are absent (no managed runtime in the process, or a
//! runtime that does not export them), [`VMStructs::init`] returns `None`
//! and the unwinder treats every PC as native.
//!
//! All reads of runtime memory go through [`safe_access`]: the structures
//! are owned by the runtime and can be concurrently modified or unmapped, so
//! a fault must degrade into a default value, never a crash.

use std::ffi::CStr;

use crate::code_cache::CodeCache;
use crate::safe_access;

mod nmethod;
pub use nmethod::{NMethod, NMethodKind, ScopeDesc};

/// Offsets into runtime structures, resolved from the exported tables.
/// `-1` means "not found"; accessors degrade gracefully.
#[derive(Debug, Clone)]
pub struct JvmOffsets {
    pub nmethod_name: i32,
    pub nmethod_method: i32,
    pub nmethod_entry: i32,
    pub nmethod_frame_size: i32,
    pub nmethod_frame_complete: i32,
    pub nmethod_level: i32,
    pub nmethod_metadata: i32,
    pub nmethod_scopes_pcs: i32,
    pub nmethod_scopes_data: i32,
    pub code_heap_memory: i32,
    pub code_heap_segmap: i32,
    pub code_heap_segment_shift: i32,
    pub vs_low: i32,
    pub method_constmethod: i32,
    pub method_code: i32,
    pub constmethod_constants: i32,
    pub constmethod_size: i32,
    pub interpreter_frame_bcp: i32,
    pub interpreter_frame_method: i32,
    pub interpreter_frame_sender_sp: i32,
    pub thread_anchor: i32,
    pub thread_state: i32,
    pub klass_name: i32,
    pub symbol_length: i32,
    pub symbol_body: i32,
}

impl Default for JvmOffsets {
    fn default() -> Self {
        JvmOffsets {
            nmethod_name: -1,
            nmethod_method: -1,
            nmethod_entry: -1,
            nmethod_frame_size: -1,
            nmethod_frame_complete: -1,
            nmethod_level: -1,
            nmethod_metadata: -1,
            nmethod_scopes_pcs: -1,
            nmethod_scopes_data: -1,
            code_heap_memory: -1,
            code_heap_segmap: -1,
            code_heap_segment_shift: -1,
            vs_low: -1,
            method_constmethod: -1,
            method_code: -1,
            constmethod_constants: -1,
            constmethod_size: -1,
            interpreter_frame_bcp: -1,
            interpreter_frame_method: -2, // fixed slot, see InterpreterFrame
            interpreter_frame_sender_sp: -1,
            thread_anchor: -1,
            thread_state: -1,
            klass_name: -1,
            symbol_length: -1,
            symbol_body: -1,
        }
    }
}

/// One code heap: `[low, high)` plus the segment map used to find the start
/// of the blob containing a PC.
#[derive(Debug, Clone, Copy)]
pub struct CodeHeapRef {
    pub low: usize,
    pub high: usize,
    pub segmap: usize,
    pub segment_shift: u32,
}

pub struct VMStructs {
    pub offsets: JvmOffsets,
    pub heaps: Vec<CodeHeapRef>,
}

/// Reads one word of possibly-unmapped runtime memory.
#[inline]
pub fn read_word(addr: usize) -> usize {
    safe_access::load(addr as *const usize, 0)
}

#[inline]
fn read_i32(addr: usize) -> i32 {
    let word = read_word(addr & !7);
    ((word >> ((addr & 7) * 8)) as u32) as i32
}

impl VMStructs {
    /// Resolves structure offsets from the runtime's exported metadata
    /// tables. `libjvm` is the code cache of the runtime library.
    pub fn init(libjvm: &CodeCache) -> Option<VMStructs> {
        let entry_stride = Self::read_global(libjvm, "gHotSpotVMStructEntryArrayStride")?;
        let type_name_offset = Self::read_global(libjvm, "gHotSpotVMStructEntryTypeNameOffset")?;
        let field_name_offset = Self::read_global(libjvm, "gHotSpotVMStructEntryFieldNameOffset")?;
        let offset_offset = Self::read_global(libjvm, "gHotSpotVMStructEntryOffsetOffset")?;
        let address_offset = Self::read_global(libjvm, "gHotSpotVMStructEntryAddressOffset")?;
        let entries = Self::read_global(libjvm, "gHotSpotVMStructs")?;
        if entries == 0 || entry_stride == 0 {
            return None;
        }

        let mut offsets = JvmOffsets::default();
        let mut code_cache_heaps_addr: usize = 0;
        let mut entry = entries;
        // The real table has a couple thousand entries; the cap keeps a
        // corrupted one from spinning the scan forever.
        let scan_end = entries.saturating_add(entry_stride.saturating_mul(8192));
        while entry < scan_end {
            let type_name_ptr = read_word(entry + type_name_offset);
            if type_name_ptr == 0 {
                break;
            }
            let type_name = unsafe { CStr::from_ptr(type_name_ptr as *const libc::c_char) };
            let field_name_ptr = read_word(entry + field_name_offset);
            if field_name_ptr == 0 {
                break;
            }
            let field_name = unsafe { CStr::from_ptr(field_name_ptr as *const libc::c_char) };
            let offset = read_word(entry + offset_offset) as i32;
            let address = read_word(entry + address_offset);

            match (
                type_name.to_bytes(),
                field_name.to_bytes(),
            ) {
                (b"CodeBlob", b"_name") => offsets.nmethod_name = offset,
                (b"CodeBlob", b"_frame_size") => offsets.nmethod_frame_size = offset,
                (b"CodeBlob", b"_frame_complete_offset") => offsets.nmethod_frame_complete = offset,
                (b"nmethod", b"_method") => offsets.nmethod_method = offset,
                (b"nmethod", b"_verified_entry_point") => offsets.nmethod_entry = offset,
                (b"nmethod", b"_comp_level") => offsets.nmethod_level = offset,
                (b"nmethod", b"_metadata_offset") => offsets.nmethod_metadata = offset,
                (b"nmethod", b"_scopes_pcs_offset") => offsets.nmethod_scopes_pcs = offset,
                (b"nmethod", b"_scopes_data_offset") => offsets.nmethod_scopes_data = offset,
                (b"CodeHeap", b"_memory") => offsets.code_heap_memory = offset,
                (b"CodeHeap", b"_segmap") => offsets.code_heap_segmap = offset,
                (b"CodeHeap", b"_log2_segment_size") => offsets.code_heap_segment_shift = offset,
                (b"VirtualSpace", b"_low") => offsets.vs_low = offset,
                (b"Method", b"_constMethod") => offsets.method_constmethod = offset,
                (b"Method", b"_code") => offsets.method_code = offset,
                (b"ConstMethod", b"_constants") => offsets.constmethod_constants = offset,
                (b"ConstMethod", b"_constMethod_size") => offsets.constmethod_size = offset,
                (b"frame", b"interpreter_frame_bcp_offset") => offsets.interpreter_frame_bcp = offset,
                (b"frame", b"interpreter_frame_sender_sp_offset") => {
                    offsets.interpreter_frame_sender_sp = offset
                }
                (b"JavaThread", b"_anchor") => offsets.thread_anchor = offset,
                (b"JavaThread", b"_thread_state") => offsets.thread_state = offset,
                (b"Klass", b"_name") => offsets.klass_name = offset,
                (b"Symbol", b"_length") => offsets.symbol_length = offset,
                (b"Symbol", b"_body") => offsets.symbol_body = offset,
                (b"CodeCache", b"_heaps") => code_cache_heaps_addr = address,
                (b"CodeCache", b"_heap") => code_cache_heaps_addr = address,
                _ => {}
            }
            entry += entry_stride;
        }

        let heaps = Self::resolve_heaps(&offsets, code_cache_heaps_addr);
        if heaps.is_empty() {
            return None;
        }
        Some(VMStructs { offsets, heaps })
    }

    fn read_global(libjvm: &CodeCache, name: &str) -> Option<usize> {
        let symbol = libjvm.find_exact_symbol(name)?;
        Some(read_word(symbol.start))
    }

    fn resolve_heaps(offsets: &JvmOffsets, heaps_addr: usize) -> Vec<CodeHeapRef> {
        let mut heaps = Vec::new();
        if heaps_addr == 0 || offsets.code_heap_memory < 0 || offsets.vs_low < 0 {
            return heaps;
        }
        // `_heaps` is a GrowableArray*: {data, ..., len}. Read up to the
        // three segmented heaps a modern runtime uses.
        let array = read_word(heaps_addr);
        if array == 0 {
            return heaps;
        }
        let data = read_word(array);
        let len = read_i32(array + std::mem::size_of::<usize>()).clamp(0, 3);
        for i in 0..len as usize {
            let heap = read_word(data + i * std::mem::size_of::<usize>());
            if heap == 0 {
                continue;
            }
            let memory = heap + offsets.code_heap_memory as usize;
            let low = read_word(memory + offsets.vs_low as usize);
            let high = read_word(memory + offsets.vs_low as usize + std::mem::size_of::<usize>());
            let segmap = if offsets.code_heap_segmap >= 0 {
                read_word(heap + offsets.code_heap_segmap as usize + offsets.vs_low as usize)
            } else {
                0
            };
            let segment_shift = if offsets.code_heap_segment_shift >= 0 {
                read_i32(heap + offsets.code_heap_segment_shift as usize).clamp(0, 16) as u32
            } else {
                10
            };
            if low != 0 && high > low {
                heaps.push(CodeHeapRef { low, high, segmap, segment_shift });
            }
        }
        heaps
    }

    /// Copies the class name of a Klass handle into `buf`, returning the
    /// filled prefix. Tolerates garbage handles.
    pub fn klass_name<'b>(&self, klass: usize, buf: &'b mut [u8]) -> Option<&'b [u8]> {
        if klass == 0 || klass & 7 != 0 || self.offsets.klass_name < 0 {
            return None;
        }
        let symbol = read_word(klass + self.offsets.klass_name as usize);
        if symbol == 0 {
            return None;
        }
        let length_off = if self.offsets.symbol_length >= 0 {
            self.offsets.symbol_length as usize
        } else {
            0
        };
        let body_off = if self.offsets.symbol_body >= 0 {
            self.offsets.symbol_body as usize
        } else {
            length_off + 2
        };
        let length = (read_word(symbol + length_off & !7) >> ((symbol + length_off) % 8 * 8)) as u16;
        let length = (length as usize).min(buf.len());
        for (i, slot) in buf.iter_mut().enumerate().take(length) {
            let addr = symbol + body_off + i;
            let word = safe_access::load((addr & !7) as *const usize, 0);
            *slot = (word >> ((addr & 7) * 8)) as u8;
        }
        Some(&buf[..length])
    }

    /// Whether `pc` lies inside any managed code heap.
    pub fn code_heap_contains(&self, pc: usize) -> bool {
        self.heaps.iter().any(|heap| pc >= heap.low && pc < heap.high)
    }

    /// Locates the blob containing `pc` by walking the heap's segment map
    /// back to the block start.
    pub fn find_nmethod(&self, pc: usize) -> Option<NMethod<'_>> {
        let heap = self
            .heaps
            .iter()
            .find(|heap| pc >= heap.low && pc < heap.high)?;
        if heap.segmap == 0 {
            return None;
        }
        let mut segment = (pc - heap.low) >> heap.segment_shift;
        let mut guard = 0;
        loop {
            let byte = safe_access::load((heap.segmap + segment & !7) as *const usize, usize::MAX);
            let lead = (byte >> ((heap.segmap + segment) % 8 * 8)) as u8;
            if lead == 0xff || guard > 4096 {
                return None;
            }
            if lead == 0 {
                break;
            }
            segment = segment.checked_sub(lead as usize)?;
            guard += 1;
        }
        let block = heap.low + (segment << heap.segment_shift);
        // HeapBlock header: {length, used}; a free block has used == 0.
        if read_word(block + std::mem::size_of::<usize>()) == 0 {
            return None;
        }
        Some(NMethod::new(
            block + 2 * std::mem::size_of::<usize>(),
            &self.offsets,
        ))
    }
}

/// Interpreter frame layout: fixed slots relative to the frame pointer.
pub struct InterpreterFrame;

impl InterpreterFrame {
    /// fp[-3] holds the Method* in the template interpreter.
    pub const METHOD_OFFSET: isize = -3;
    /// fp[-1] holds the sender's sp.
    pub const SENDER_SP_OFFSET: isize = -1;

    /// Slot of the bytecode pointer relative to fp. The exported constant
    /// is a slot count below the frame pointer; either sign convention is
    /// seen in the wild, so normalize to negative.
    pub fn bcp_offset(offsets: &JvmOffsets) -> isize {
        match offsets.interpreter_frame_bcp {
            offset if (-16..0).contains(&offset) => offset as isize,
            offset if (0..16).contains(&offset) => -(offset as isize),
            _ => -7,
        }
    }
}

/// A `Method*` wrapper with validity checking: a sampled frame can hold a
/// stale or garbage method pointer.
#[derive(Clone, Copy)]
pub struct VMMethod<'a> {
    addr: usize,
    offsets: &'a JvmOffsets,
}

impl<'a> VMMethod<'a> {
    pub fn new(addr: usize, offsets: &'a JvmOffsets) -> Self {
        VMMethod { addr, offsets }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    /// The jmethodID, validated by checking the id points back at this
    /// method. Returns 0 for implausible pointers.
    pub fn id(&self) -> u64 {
        if self.addr == 0 || self.addr & 7 != 0 {
            return 0;
        }
        let const_method = match self.offsets.method_constmethod {
            offset if offset >= 0 => read_word(self.addr + offset as usize),
            _ => return 0,
        };
        if const_method == 0 {
            return 0;
        }
        // The method id slot lives behind the constMethod; reading it back
        // must reproduce the Method*.
        let id_slot = read_word(const_method);
        if id_slot != 0 && read_word(id_slot) == self.addr {
            id_slot as u64
        } else {
            self.addr as u64
        }
    }

    /// First bytecode address, for bci computation in interpreter frames.
    pub fn bytecode_start(&self) -> usize {
        let const_method = match self.offsets.method_constmethod {
            offset if offset >= 0 => read_word(self.addr + offset as usize),
            _ => return 0,
        };
        if const_method == 0 || self.offsets.constmethod_size < 0 {
            return 0;
        }
        let words = read_i32(const_method + self.offsets.constmethod_size as usize);
        if !(0..=0xffff).contains(&words) {
            return 0;
        }
        const_method + words as usize * std::mem::size_of::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code_cache::collect_libraries;

    #[test]
    fn init_without_runtime_returns_none() {
        // The test process hosts no managed runtime; every library must fail
        // the metadata probe.
        for lib in collect_libraries() {
            assert!(VMStructs::init(&lib).is_none(), "{}", lib.name);
        }
    }

    #[test]
    fn garbage_method_pointer_yields_no_id() {
        let offsets = JvmOffsets::default();
        assert_eq!(VMMethod::new(0, &offsets).id(), 0);
        assert_eq!(VMMethod::new(0x3, &offsets).id(), 0);
        // Aligned but offsets unresolved.
        assert_eq!(VMMethod::new(0x1000, &offsets).id(), 0);
    }
}
