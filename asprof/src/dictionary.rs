//! Lock-free name interning: maps strings to dense u32 ids and back.
//!
//! Used for class names, native symbols and sentinel frame labels, all of
//! which may be looked up from a signal or trap handler. The table is a
//! fixed-capacity open-addressed array of CAS-installed hashes; string bytes
//! are copied into an [`Arena`], so no allocation happens on the lookup path
//! after the table itself is created.

use std::slice;
use std::str;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crate::arena::Arena;

const TABLE_CAPACITY: usize = 65536;
const NAME_CHUNK: usize = 1024 * 1024;

#[repr(C)]
struct Slot {
    hash: AtomicU64,
    // Arena copy of the name: u32 length followed by the bytes.
    name: AtomicPtr<u8>,
}

pub struct Dictionary {
    slots: Box<[Slot]>,
    arena: Arena,
}

fn hash_bytes(bytes: &[u8]) -> u64 {
    // FNV-1a; cheap and good enough for symbol names. Zero is reserved for
    // empty slots.
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in bytes {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h | 1
}

impl Dictionary {
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(TABLE_CAPACITY);
        for _ in 0..TABLE_CAPACITY {
            slots.push(Slot {
                hash: AtomicU64::new(0),
                name: AtomicPtr::new(std::ptr::null_mut()),
            });
        }
        Dictionary {
            slots: slots.into_boxed_slice(),
            arena: Arena::new(NAME_CHUNK),
        }
    }

    /// Interns `name` and returns its id (slot index + 1). Returns 0 when the
    /// table or the arena is exhausted; callers treat 0 as "unknown".
    pub fn lookup(&self, name: &str) -> u32 {
        self.lookup_bytes(name.as_bytes())
    }

    pub fn lookup_bytes(&self, bytes: &[u8]) -> u32 {
        let hash = hash_bytes(bytes);
        let mask = TABLE_CAPACITY - 1;
        let mut slot = hash as usize & mask;
        let mut step = 0;

        loop {
            let current = self.slots[slot].hash.load(Ordering::Acquire);
            if current == hash {
                return slot as u32 + 1;
            }
            if current == 0 {
                if self.slots[slot]
                    .hash
                    .compare_exchange(0, hash, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    let copy = self.arena.alloc(4 + bytes.len());
                    if !copy.is_null() {
                        unsafe {
                            (copy as *mut u32).write_unaligned(bytes.len() as u32);
                            // No memcpy inside a signal handler.
                            for (i, &b) in bytes.iter().enumerate() {
                                *copy.add(4 + i) = b;
                            }
                        }
                        self.slots[slot].name.store(copy, Ordering::Release);
                    }
                    return slot as u32 + 1;
                }
                continue;
            }
            step += 1;
            if step >= TABLE_CAPACITY {
                return 0;
            }
            slot = (slot + step) & mask;
        }
    }

    /// Resolves an id back to its name. Returns `None` for unknown ids and
    /// for slots whose name copy failed at intern time.
    pub fn name_of(&self, id: u32) -> Option<&str> {
        if id == 0 || id as usize > TABLE_CAPACITY {
            return None;
        }
        let name = self.slots[id as usize - 1].name.load(Ordering::Acquire);
        if name.is_null() {
            return None;
        }
        unsafe {
            let len = (name as *const u32).read_unaligned() as usize;
            str::from_utf8(slice::from_raw_parts(name.add(4), len)).ok()
        }
    }

    /// Visits every interned (id, name) pair.
    pub fn collect(&self, mut visit: impl FnMut(u32, &str)) {
        for (i, slot) in self.slots.iter().enumerate() {
            if slot.hash.load(Ordering::Acquire) != 0 {
                if let Some(name) = self.name_of(i as u32 + 1) {
                    visit(i as u32 + 1, name);
                }
            }
        }
    }

    pub fn clear(&self) {
        for slot in self.slots.iter() {
            slot.name.store(std::ptr::null_mut(), Ordering::Relaxed);
            slot.hash.store(0, Ordering::Relaxed);
        }
        self.arena.clear();
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn same_name_same_id() {
        let dict = Dictionary::new();
        let a = dict.lookup("java/lang/String");
        let b = dict.lookup("java/lang/String");
        let c = dict.lookup("java/lang/Object");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, 0);
    }

    #[test]
    fn id_resolves_back_to_name() {
        let dict = Dictionary::new();
        let id = dict.lookup("com.example.Main.run");
        assert_eq!(dict.name_of(id), Some("com.example.Main.run"));
        assert_eq!(dict.name_of(0), None);
    }

    #[test]
    fn concurrent_interning_agrees() {
        let dict = Arc::new(Dictionary::new());
        let names: Vec<String> = (0..200).map(|i| format!("name_{i}")).collect();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let dict = dict.clone();
            let names = names.clone();
            handles.push(std::thread::spawn(move || {
                names.iter().map(|n| dict.lookup(n)).collect::<Vec<u32>>()
            }));
        }
        let results: Vec<Vec<u32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
    }
}
