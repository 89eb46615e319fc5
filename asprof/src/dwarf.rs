//! Compact CFI tables.
//!
//! `.eh_frame` is parsed once per library (via gimli, off the sampling path)
//! into a flat, binary-searchable array of [`FrameDesc`] rows. The unwinder
//! only ever touches the compact rows; evaluating DWARF programs inside a
//! signal handler is out of the question. Functions without an FDE fall back
//! to a default descriptor.

use gimli::{
    BaseAddresses, CfaRule, CieOrFde, EhFrame, NativeEndian, Register, RegisterRule,
    UnwindContext, UnwindSection,
};

use crate::stack_frame::EMPTY_FRAME_SIZE;

/// CFA base register selector, kept in the low 8 bits of `FrameDesc::cfa`.
pub const DW_REG_SP: u8 = 0;
pub const DW_REG_FP: u8 = 1;
/// Synthetic rule for PLT entries: the frame size depends on the position
/// within the 16-byte PLT slot.
pub const DW_REG_PLT: u8 = 128;
pub const DW_REG_INVALID: u8 = 255;

/// "FP is not saved in this frame" marker for `FrameDesc::fp_off`.
pub const DW_SAME_FP: i32 = i32::MIN;
/// Low bit of `fp_off` marking a pc-relative rule: `pc += fp_off >> 1`.
pub const DW_PC_OFFSET: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameDesc {
    /// Stated virtual address (unbiased) of the first PC this row covers.
    pub loc: u64,
    /// Low 8 bits: CFA base register; upper 24 bits: signed offset.
    pub cfa: i32,
    pub fp_off: i32,
    pub pc_off: i32,
}

impl FrameDesc {
    pub const fn new(loc: u64, reg: u8, cfa_off: i32, fp_off: i32, pc_off: i32) -> Self {
        FrameDesc {
            loc,
            cfa: (cfa_off << 8) | reg as i32,
            fp_off,
            pc_off,
        }
    }

    pub fn cfa_reg(&self) -> u8 {
        self.cfa as u8
    }

    pub fn cfa_off(&self) -> i32 {
        self.cfa >> 8
    }

    /// The rule applied when a PC has no FDE: a bare return address on x86,
    /// a live frame-pointer link on AArch64.
    pub fn default_frame() -> FrameDesc {
        if EMPTY_FRAME_SIZE > 0 {
            FrameDesc::new(0, DW_REG_SP, EMPTY_FRAME_SIZE as i32, DW_SAME_FP, -8)
        } else {
            FrameDesc::new(0, DW_REG_SP, 0, 0, 8)
        }
    }

    pub fn plt_frame(loc: u64) -> FrameDesc {
        FrameDesc::new(loc, DW_REG_PLT, 8, DW_SAME_FP, -8)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        const REG_SP: Register = Register(7);
        const REG_FP: Register = Register(6);
        const REG_RA: Register = Register(16);
    } else if #[cfg(target_arch = "aarch64")] {
        const REG_SP: Register = Register(31);
        const REG_FP: Register = Register(29);
        const REG_RA: Register = Register(30);
    } else {
        const REG_SP: Register = Register(0);
        const REG_FP: Register = Register(0);
        const REG_RA: Register = Register(0);
    }
}

/// Parses `.eh_frame` bytes into a sorted compact table. `eh_frame_vaddr` is
/// the section's stated address, used to resolve pc-relative pointers.
pub fn parse_eh_frame(data: &[u8], eh_frame_vaddr: u64, text_vaddr: u64) -> Vec<FrameDesc> {
    let eh_frame = EhFrame::new(data, NativeEndian);
    let bases = BaseAddresses::default()
        .set_eh_frame(eh_frame_vaddr)
        .set_text(text_vaddr);

    let mut table: Vec<FrameDesc> = Vec::new();
    let mut ctx = UnwindContext::new();

    let mut entries = eh_frame.entries(&bases);
    while let Ok(Some(entry)) = entries.next() {
        let CieOrFde::Fde(partial) = entry else {
            continue;
        };
        let Ok(fde) = partial.parse(|section, bases, offset| section.cie_from_offset(bases, offset))
        else {
            continue;
        };
        let Ok(mut rows) = fde.rows(&eh_frame, &bases, &mut ctx) else {
            continue;
        };
        while let Ok(Some(row)) = rows.next_row() {
            let (reg, cfa_off) = match row.cfa() {
                CfaRule::RegisterAndOffset { register, offset } => {
                    if *register == REG_SP {
                        (DW_REG_SP, *offset as i32)
                    } else if *register == REG_FP {
                        (DW_REG_FP, *offset as i32)
                    } else {
                        (DW_REG_INVALID, 0)
                    }
                }
                CfaRule::Expression(_) => (DW_REG_INVALID, 0),
            };

            // Saved-register offsets in the compact table are relative to
            // the new SP (== CFA).
            let fp_off = match row.register(REG_FP) {
                RegisterRule::Offset(offset) => offset as i32,
                _ => DW_SAME_FP,
            };
            let pc_off = match row.register(REG_RA) {
                RegisterRule::Offset(offset) => offset as i32,
                _ => -(std::mem::size_of::<usize>() as i32),
            };

            let desc = FrameDesc {
                loc: row.start_address(),
                cfa: ((cfa_off) << 8) | reg as i32,
                fp_off,
                pc_off,
            };
            // Adjacent identical rows collapse into one.
            if table.last().map(|prev| {
                (prev.cfa, prev.fp_off, prev.pc_off) == (desc.cfa, desc.fp_off, desc.pc_off)
            }) != Some(true)
            {
                table.push(desc);
            }
        }
    }

    table.sort_unstable_by_key(|desc| desc.loc);
    table.dedup_by_key(|desc| desc.loc);
    table
}

/// Finds the row covering `svma`, newest location not above the PC.
pub fn find_frame_desc(table: &[FrameDesc], svma: u64) -> Option<&FrameDesc> {
    match table.binary_search_by_key(&svma, |desc| desc.loc) {
        Ok(index) => Some(&table[index]),
        Err(0) => None,
        Err(index) => Some(&table[index - 1]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_frame_matches_architecture() {
        let desc = FrameDesc::default_frame();
        assert_eq!(desc.cfa_reg(), DW_REG_SP);
        if EMPTY_FRAME_SIZE > 0 {
            assert_eq!(desc.cfa_off(), EMPTY_FRAME_SIZE as i32);
            assert_eq!(desc.fp_off, DW_SAME_FP);
        }
    }

    #[test]
    fn cfa_encoding_round_trips() {
        let desc = FrameDesc::new(0x1000, DW_REG_FP, -32, 16, -8);
        assert_eq!(desc.cfa_reg(), DW_REG_FP);
        assert_eq!(desc.cfa_off(), -32);
    }

    #[test]
    fn lookup_picks_covering_row() {
        let table = vec![
            FrameDesc::new(0x1000, DW_REG_SP, 8, DW_SAME_FP, -8),
            FrameDesc::new(0x1010, DW_REG_SP, 32, -16, -8),
            FrameDesc::new(0x2000, DW_REG_FP, 16, -16, -8),
        ];
        assert_eq!(find_frame_desc(&table, 0x0fff), None);
        assert_eq!(find_frame_desc(&table, 0x1000).unwrap().loc, 0x1000);
        assert_eq!(find_frame_desc(&table, 0x100f).unwrap().loc, 0x1000);
        assert_eq!(find_frame_desc(&table, 0x1010).unwrap().loc, 0x1010);
        assert_eq!(find_frame_desc(&table, 0x5000).unwrap().loc, 0x2000);
    }

    #[test]
    fn parses_own_eh_frame() {
        // Read this test binary's .eh_frame through the same path the
        // profiler uses for shared libraries.
        let exe = std::fs::read("/proc/self/exe").unwrap();
        let file = object::File::parse(&exe[..]).unwrap();
        use object::{Object, ObjectSection};
        let section = file.section_by_name(".eh_frame").unwrap();
        let data = section.data().unwrap();
        let table = parse_eh_frame(data, section.address(), 0);
        assert!(!table.is_empty());
        for window in table.windows(2) {
            assert!(window[0].loc <= window[1].loc);
        }
    }
}
