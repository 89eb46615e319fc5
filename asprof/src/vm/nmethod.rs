//! Compiled-method blobs and their inlining metadata.

use std::ffi::CStr;

use super::{read_word, JvmOffsets, VMMethod};
use crate::safe_access;

/// What kind of blob a code-heap lookup produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NMethodKind {
    /// A regular compiled method.
    Compiled,
    /// One of the interpreter's generated blobs.
    Interpreter,
    /// A runtime stub (arraycopy, call adapters, ...).
    Stub,
}

/// A view over one blob in the code heap. All reads are fault-tolerant; a
/// concurrently flushed nmethod degrades into zeros and the caller's
/// plausibility checks stop the walk.
#[derive(Clone, Copy)]
pub struct NMethod<'a> {
    addr: usize,
    offsets: &'a JvmOffsets,
}

impl<'a> NMethod<'a> {
    pub fn new(addr: usize, offsets: &'a JvmOffsets) -> Self {
        NMethod { addr, offsets }
    }

    fn at(&self, offset: i32) -> usize {
        self.addr + offset as usize
    }

    fn read_i32_field(&self, offset: i32) -> i32 {
        if offset < 0 {
            return 0;
        }
        let addr = self.at(offset);
        let word = safe_access::load((addr & !7) as *const usize, 0);
        (word >> ((addr & 7) * 8)) as u32 as i32
    }

    pub fn name(&self) -> Option<&'static str> {
        if self.offsets.nmethod_name < 0 {
            return None;
        }
        let name_ptr = read_word(self.at(self.offsets.nmethod_name));
        if name_ptr == 0 {
            return None;
        }
        unsafe {
            CStr::from_ptr(name_ptr as *const libc::c_char)
                .to_str()
                .ok()
        }
    }

    pub fn kind(&self) -> NMethodKind {
        match self.name() {
            Some("nmethod") | Some("native nmethod") => NMethodKind::Compiled,
            Some(name) if name.contains("Interpreter") => NMethodKind::Interpreter,
            _ => NMethodKind::Stub,
        }
    }

    /// Compilation tier; 1-3 are C1, 4 is the top tier.
    pub fn level(&self) -> i32 {
        if self.offsets.nmethod_level < 0 {
            0
        } else {
            self.read_i32_field(self.offsets.nmethod_level) & 0xff
        }
    }

    /// Frame size in words, as declared by the compiler.
    pub fn frame_size(&self) -> usize {
        let size = self.read_i32_field(self.offsets.nmethod_frame_size);
        if (0..0x10000).contains(&size) {
            size as usize
        } else {
            0
        }
    }

    pub fn entry(&self) -> usize {
        if self.offsets.nmethod_entry < 0 {
            self.addr
        } else {
            read_word(self.at(self.offsets.nmethod_entry))
        }
    }

    pub fn method(&self) -> VMMethod<'a> {
        let addr = if self.offsets.nmethod_method < 0 {
            0
        } else {
            read_word(self.at(self.offsets.nmethod_method))
        };
        VMMethod::new(addr, self.offsets)
    }

    /// Whether the frame is fully constructed at `pc`: past the offset the
    /// compiler recorded as frame-complete.
    pub fn is_frame_complete_at(&self, pc: usize) -> bool {
        let offset = self.read_i32_field(self.offsets.nmethod_frame_complete) & 0xffff;
        offset > 0 && pc >= self.entry() && pc - self.addr >= offset as usize
    }

    fn metadata_at(&self, index: i32) -> usize {
        if index <= 0 || self.offsets.nmethod_metadata < 0 {
            return 0;
        }
        let metadata = self.addr + self.read_i32_field(self.offsets.nmethod_metadata) as usize;
        read_word(metadata + (index as usize - 1) * std::mem::size_of::<usize>())
    }

    /// Finds the scope-decode offset recorded for `pc` in the PcDesc array:
    /// entries of `(pc_offset, scope_decode_offset, obj_decode_offset,
    /// flags)`. Returns 0 when there is no debug info at this PC.
    pub fn find_scope_offset(&self, pc: usize) -> i32 {
        if self.offsets.nmethod_scopes_pcs < 0 || self.offsets.nmethod_scopes_data < 0 {
            return 0;
        }
        let pcs_begin = self.addr + self.read_i32_field(self.offsets.nmethod_scopes_pcs) as usize;
        let pcs_end = self.addr + self.read_i32_field(self.offsets.nmethod_scopes_data) as usize;
        if pcs_end <= pcs_begin || pcs_end - pcs_begin > 1 << 20 {
            return 0;
        }
        let pc_offset = (pc - self.entry()) as i32;
        const PCDESC_SIZE: usize = 16;
        let mut best = 0;
        let mut addr = pcs_begin;
        while addr + PCDESC_SIZE <= pcs_end {
            let desc_pc = safe_access::load(addr as *const usize, 0) as u32 as i32;
            let scope = (safe_access::load(addr as *const usize, 0) >> 32) as u32 as i32;
            if desc_pc == pc_offset {
                return scope;
            }
            if desc_pc < pc_offset && scope > 0 {
                best = scope;
            }
            addr += PCDESC_SIZE;
        }
        best
    }

    /// Start of the compressed scopes-data stream.
    pub fn scopes_data(&self) -> usize {
        self.addr + self.read_i32_field(self.offsets.nmethod_scopes_data) as usize
    }
}

/// Decoder for one inlining scope chain.
///
/// The scopes-data stream is a sequence of compressed integers: each scope
/// record is `(sender_offset, method_index, bci)`. `decode` returns the
/// sender's offset, so the caller emits frames callee-to-caller until the
/// offset reaches zero.
pub struct ScopeDesc<'a> {
    nmethod: NMethod<'a>,
    stream_base: usize,
    method: usize,
    bci: i32,
}

impl<'a> ScopeDesc<'a> {
    pub fn new(nmethod: NMethod<'a>) -> Self {
        let stream_base = nmethod.scopes_data();
        ScopeDesc {
            nmethod,
            stream_base,
            method: 0,
            bci: 0,
        }
    }

    pub fn method(&self) -> VMMethod<'a> {
        VMMethod::new(self.method, self.nmethod.offsets)
    }

    pub fn bci(&self) -> i32 {
        self.bci
    }

    /// Decodes the scope record at `offset`; returns the sender offset
    /// (0 for the outermost scope).
    pub fn decode(&mut self, offset: i32) -> i32 {
        let mut stream = CompressedStream::new(self.stream_base + offset as usize);
        let sender = stream.read_int();
        let method_index = stream.read_int();
        // InvocationEntryBci is -1; stored biased by +1.
        self.bci = stream.read_int() - 1;
        self.method = self.nmethod.metadata_at(method_index);
        sender
    }
}

/// The runtime's UNSIGNED5 compressed integer stream: bytes below 192
/// terminate; higher bytes accumulate base-64 digits, at most five bytes.
struct CompressedStream {
    pos: usize,
}

const STREAM_L: u32 = 192;
const STREAM_LG_H: u32 = 6;
const STREAM_MAX_BYTES: u32 = 5;

impl CompressedStream {
    fn new(pos: usize) -> Self {
        CompressedStream { pos }
    }

    fn read_byte(&mut self) -> u32 {
        let addr = self.pos;
        self.pos += 1;
        let word = safe_access::load((addr & !7) as *const usize, 0);
        ((word >> ((addr & 7) * 8)) & 0xff) as u32
    }

    fn read_int(&mut self) -> i32 {
        let b0 = self.read_byte();
        if b0 < STREAM_L {
            return b0 as i32;
        }
        let mut sum = b0;
        let mut lg_h_i = STREAM_LG_H;
        for i in 1..STREAM_MAX_BYTES {
            let b_i = self.read_byte();
            sum = sum.wrapping_add(b_i << lg_h_i);
            if b_i < STREAM_L || i == STREAM_MAX_BYTES - 1 {
                break;
            }
            lg_h_i += STREAM_LG_H;
        }
        sum as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compressed_stream_small_values_are_single_bytes() {
        let data: [u8; 8] = [0, 5, 191, 0, 0, 0, 0, 0];
        let mut stream = CompressedStream::new(data.as_ptr() as usize);
        assert_eq!(stream.read_int(), 0);
        assert_eq!(stream.read_int(), 5);
        assert_eq!(stream.read_int(), 191);
    }

    #[test]
    fn compressed_stream_multi_byte() {
        // 192 + 1*64 = 256
        let data: [u8; 8] = [192, 1, 0, 0, 0, 0, 0, 0];
        let mut stream = CompressedStream::new(data.as_ptr() as usize);
        assert_eq!(stream.read_int(), 256);
    }

    #[test]
    fn unresolved_offsets_read_as_zeros() {
        let offsets = JvmOffsets::default();
        let buffer = [0u8; 256];
        let nm = NMethod::new(buffer.as_ptr() as usize, &offsets);
        assert_eq!(nm.level(), 0);
        assert_eq!(nm.frame_size(), 0);
        assert_eq!(nm.kind(), NMethodKind::Stub);
        assert_eq!(nm.find_scope_offset(nm.entry()), 0);
    }
}
