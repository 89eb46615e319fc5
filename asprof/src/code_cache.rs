//! Native library table.
//!
//! One [`CodeCache`] per loaded object: executable address range, sorted
//! function symbols, the compact CFI table, the PLT range and the GOT import
//! slots used by the native-memory hooks. Everything is built off the
//! sampling path; lookups are binary searches over immutable arrays.

use std::ffi::CStr;
use std::ops::Range;

use memmap2::Mmap;
use object::{Object, ObjectSection, ObjectSymbol, ObjectSymbolTable, RelocationTarget, SymbolKind};

use crate::dwarf::{self, FrameDesc};

#[derive(Debug, Clone)]
pub struct Symbol {
    /// Actual (loaded) address.
    pub start: usize,
    pub size: usize,
    pub name: String,
}

pub struct CodeCache {
    pub name: String,
    /// Executable segment range in loaded addresses.
    pub min_address: usize,
    pub max_address: usize,
    /// Loaded address minus stated address.
    pub load_bias: usize,
    symbols: Vec<Symbol>,
    frame_descs: Vec<FrameDesc>,
    /// PLT range in stated addresses.
    plt: Range<u64>,
    /// Imported symbol name -> GOT slot (stated address).
    got_imports: Vec<(String, u64)>,
}

fn demangled(name: &str) -> String {
    if name.starts_with("_R") || name.starts_with("_ZN") {
        let rust = rustc_demangle::demangle(name).to_string();
        if rust != name {
            return rust;
        }
    }
    if name.starts_with("_Z") {
        if let Ok(symbol) = cpp_demangle::Symbol::new(name) {
            if let Ok(text) = symbol.demangle_with_options(&cpp_demangle::DemangleOptions::new().no_params()) {
                return text;
            }
        }
    }
    name.to_owned()
}

impl CodeCache {
    pub fn contains(&self, pc: usize) -> bool {
        pc >= self.min_address && pc < self.max_address
    }

    /// The symbol covering `pc`, if any.
    pub fn find_symbol(&self, pc: usize) -> Option<&Symbol> {
        let index = match self.symbols.binary_search_by_key(&pc, |s| s.start) {
            Ok(index) => index,
            Err(0) => return None,
            Err(index) => index - 1,
        };
        let symbol = &self.symbols[index];
        // A zero-sized symbol covers everything up to its successor.
        if symbol.size == 0 || pc < symbol.start + symbol.size {
            Some(symbol)
        } else {
            None
        }
    }

    /// Mangled-name prefix search, used to locate runtime entry points
    /// whose suffix varies between runtime versions.
    pub fn find_symbol_by_prefix(&self, prefix: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name.starts_with(prefix))
    }

    pub fn find_exact_symbol(&self, name: &str) -> Option<&Symbol> {
        self.symbols.iter().find(|s| s.name == name)
    }

    pub fn find_frame_desc(&self, pc: usize) -> Option<&FrameDesc> {
        let svma = (pc - self.load_bias) as u64;
        dwarf::find_frame_desc(&self.frame_descs, svma)
    }

    pub fn is_plt(&self, pc: usize) -> bool {
        let svma = (pc.wrapping_sub(self.load_bias)) as u64;
        self.plt.contains(&svma)
    }

    /// The loaded address of the GOT slot binding `name`, if this object
    /// imports it.
    pub fn got_slot(&self, name: &str) -> Option<*mut usize> {
        self.got_imports
            .iter()
            .find(|(import, _)| import == name)
            .map(|(_, svma)| (self.load_bias + *svma as usize) as *mut usize)
    }

    pub fn imports(&self) -> impl Iterator<Item = &str> {
        self.got_imports.iter().map(|(name, _)| name.as_str())
    }

    fn from_mapped_object(name: &str, load_bias: usize, exec_range: Range<usize>) -> CodeCache {
        let mut cache = CodeCache {
            name: name.to_owned(),
            min_address: exec_range.start,
            max_address: exec_range.end,
            load_bias,
            symbols: Vec::new(),
            frame_descs: Vec::new(),
            plt: 0..0,
            got_imports: Vec::new(),
        };

        let path = if name.is_empty() { "/proc/self/exe" } else { name };
        let Ok(file) = std::fs::File::open(path) else {
            return cache;
        };
        let Ok(map) = (unsafe { Mmap::map(&file) }) else {
            return cache;
        };
        let Ok(obj) = object::File::parse(&map[..]) else {
            return cache;
        };

        // Data symbols are kept too: exported metadata tables (used by the
        // runtime adapter) are objects, not functions.
        for symbol in obj.symbols().chain(obj.dynamic_symbols()) {
            if symbol.address() == 0
                || !matches!(
                    symbol.kind(),
                    SymbolKind::Text | SymbolKind::Data | SymbolKind::Unknown
                )
            {
                continue;
            }
            let Ok(raw_name) = symbol.name() else { continue };
            cache.symbols.push(Symbol {
                start: load_bias + symbol.address() as usize,
                size: symbol.size() as usize,
                name: demangled(raw_name),
            });
        }
        cache.symbols.sort_unstable_by_key(|s| s.start);
        cache.symbols.dedup_by_key(|s| s.start);

        if let Some(section) = obj.section_by_name(".eh_frame") {
            if let Ok(data) = section.data() {
                cache.frame_descs = dwarf::parse_eh_frame(data, section.address(), 0);
            }
        }
        if let Some(section) = obj.section_by_name(".plt") {
            cache.plt = section.address()..section.address() + section.size();
        }

        // GOT import slots come from the jump-slot relocations.
        if let Some(relocations) = obj.dynamic_relocations() {
            for (offset, relocation) in relocations {
                let RelocationTarget::Symbol(index) = relocation.target() else {
                    continue;
                };
                let Some(target) = obj
                    .dynamic_symbol_table()
                    .and_then(|table| table.symbol_by_index(index).ok())
                else {
                    continue;
                };
                if let Ok(name) = target.name() {
                    if !name.is_empty() {
                        cache.got_imports.push((name.to_owned(), offset));
                    }
                }
            }
        }

        cache
    }
}

struct PhdrEntry {
    name: String,
    load_bias: usize,
    exec_range: Range<usize>,
}

unsafe extern "C" fn phdr_callback(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut libc::c_void,
) -> libc::c_int {
    let entries = &mut *(data as *mut Vec<PhdrEntry>);
    let info = &*info;

    let name = if info.dlpi_name.is_null() {
        String::new()
    } else {
        CStr::from_ptr(info.dlpi_name).to_string_lossy().into_owned()
    };

    let mut exec_range: Option<Range<usize>> = None;
    for i in 0..info.dlpi_phnum {
        let phdr = &*info.dlpi_phdr.add(i as usize);
        if phdr.p_type == libc::PT_LOAD && phdr.p_flags & libc::PF_X != 0 {
            let start = info.dlpi_addr as usize + phdr.p_vaddr as usize;
            let end = start + phdr.p_memsz as usize;
            exec_range = Some(match exec_range {
                Some(range) => range.start.min(start)..range.end.max(end),
                None => start..end,
            });
        }
    }

    if let Some(exec_range) = exec_range {
        entries.push(PhdrEntry {
            name,
            load_bias: info.dlpi_addr as usize,
            exec_range,
        });
    }
    0
}

/// Builds one [`CodeCache`] per object currently loaded into the process.
pub fn collect_libraries() -> Vec<CodeCache> {
    let mut entries: Vec<PhdrEntry> = Vec::new();
    unsafe {
        libc::dl_iterate_phdr(
            Some(phdr_callback),
            &mut entries as *mut Vec<PhdrEntry> as *mut libc::c_void,
        );
    }
    entries
        .into_iter()
        .filter(|entry| !entry.name.contains("linux-vdso"))
        .map(|entry| CodeCache::from_mapped_object(&entry.name, entry.load_bias, entry.exec_range))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_own_executable() {
        let libraries = collect_libraries();
        assert!(!libraries.is_empty());
        let pc = finds_own_executable as usize;
        assert!(
            libraries.iter().any(|lib| lib.contains(pc)),
            "test function address not covered by any library"
        );
    }

    #[test]
    fn libc_symbols_resolve() {
        let libraries = collect_libraries();
        let libc_cache = libraries
            .iter()
            .find(|lib| lib.name.contains("libc."))
            .expect("libc not found");
        let malloc = libc_cache.find_exact_symbol("malloc").expect("no malloc symbol");
        let resolved = libc_cache.find_symbol(malloc.start + 1).unwrap();
        assert_eq!(resolved.name, "malloc");
    }

    #[test]
    fn own_imports_include_malloc() {
        let libraries = collect_libraries();
        // The test executable links against libc and imports malloc through
        // its GOT on standard toolchains.
        let exe = &libraries[0];
        let has_malloc_import = exe.imports().any(|name| name == "malloc");
        if has_malloc_import {
            assert!(exe.got_slot("malloc").is_some());
        }
    }

    #[test]
    fn demangling_covers_both_schemes() {
        assert_eq!(demangled("plain_c_name"), "plain_c_name");
        assert!(demangled("_ZN3std2io5stdio6_print17h1234567890abcdefE").contains("std::io::stdio"));
        let cpp = demangled("_ZNSt6vectorIiSaIiEE9push_backERKi");
        assert!(cpp.contains("push_back"), "{cpp}");
    }
}
