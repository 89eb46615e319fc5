//! JFR chunk writer.
//!
//! Produces a single self-contained chunk: a 68-byte big-endian header,
//! the buffered event records (varint-packed), a metadata event describing
//! the event types, and a constant pool holding symbols, classes, threads,
//! frame types and stack traces. Offsets in the header are patched when the
//! chunk is finished.
//!
//! The reader in this module understands exactly what the writer emits; it
//! exists for the write-then-parse law and for `status`-style inspection,
//! not as a general JFR parser.

use std::io::{self, Write};

use byteorder::{BigEndian, WriteBytesExt};
use indexmap::{IndexMap, IndexSet};
use thiserror::Error;

const MAGIC: &[u8; 4] = b"FLR\0";
const VERSION_MAJOR: u16 = 2;
const VERSION_MINOR: u16 = 0;
const HEADER_SIZE: usize = 68;

const FEATURE_FINAL_CHUNK: u32 = 1;

// Event type ids. Small ids are reserved for metadata/constant-pool records,
// the rest follow the numbering the JDK assigns to built-in event types.
const T_METADATA: u64 = 0;
const T_CPOOL: u64 = 1;
pub const T_EXECUTION_SAMPLE: u64 = 101;
pub const T_WALL_CLOCK_SAMPLE: u64 = 102;
pub const T_ALLOC_IN_NEW_TLAB: u64 = 103;
pub const T_ALLOC_OUTSIDE_TLAB: u64 = 104;
pub const T_MONITOR_ENTER: u64 = 105;
pub const T_THREAD_PARK: u64 = 106;
pub const T_LIVE_OBJECT: u64 = 107;
pub const T_MALLOC: u64 = 108;
pub const T_FREE: u64 = 109;
pub const T_PROFILING_WINDOW: u64 = 110;
pub const T_PROCESS_SAMPLE: u64 = 111;

// Constant pool type ids.
const T_SYMBOL: u64 = 30;
const T_CLASS: u64 = 21;
const T_THREAD: u64 = 22;
const T_FRAME_TYPE: u64 = 24;
const T_STACK_TRACE: u64 = 26;

// String encodings used inside the chunk.
const STRING_EMPTY: u8 = 1;
const STRING_UTF8: u8 = 3;
const STRING_LATIN1: u8 = 5;

#[derive(Debug, Error)]
pub enum JfrError {
    #[error("not a JFR chunk")]
    BadMagic,
    #[error("truncated chunk")]
    Truncated,
    #[error("malformed varint")]
    BadVarInt,
    #[error("malformed string")]
    BadString,
    #[error("unknown event type {0}")]
    UnknownEvent(u64),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// One resolved frame of a constant-pool stack trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JfrStackFrame {
    /// Index into the symbol pool.
    pub method: u32,
    pub bci: i32,
    /// Frame type constant-pool index (interpreted, JIT, inlined, native...).
    pub frame_type: u8,
}

/// Event records, one variant per event type the profiler emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JfrEvent {
    ExecutionSample {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        thread_state: u8,
    },
    WallClockSample {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        thread_state: u8,
        samples: u32,
    },
    AllocationInNewTlab {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        class: u32,
        instance_size: u64,
        tlab_size: u64,
    },
    AllocationOutsideTlab {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        class: u32,
        allocation_size: u64,
    },
    MonitorEnter {
        start_ticks: u64,
        duration_ticks: u64,
        tid: i32,
        stack_trace: u32,
        class: u32,
        address: u64,
    },
    ThreadPark {
        start_ticks: u64,
        duration_ticks: u64,
        tid: i32,
        stack_trace: u32,
        class: u32,
        timeout_ns: i64,
        address: u64,
    },
    LiveObject {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        class: u32,
        allocation_size: u64,
        allocation_ticks: u64,
    },
    Malloc {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        address: u64,
        size: u64,
    },
    Free {
        start_ticks: u64,
        tid: i32,
        stack_trace: u32,
        address: u64,
    },
    ProfilingWindow {
        start_ticks: u64,
        end_ticks: u64,
    },
    ProcessSample {
        start_ticks: u64,
        pid: i32,
        cpu_permille: u32,
        rss_bytes: u64,
        name: String,
    },
}

pub struct JfrChunkWriter {
    events: Vec<u8>,
    event_count: u64,
    symbols: IndexSet<String>,
    classes: IndexSet<u32>,
    threads: IndexMap<i32, String>,
    stack_traces: IndexMap<u32, Vec<JfrStackFrame>>,
    start_nanos: u64,
    start_ticks: u64,
    ticks_per_sec: u64,
}

impl JfrChunkWriter {
    pub fn new(start_nanos: u64, start_ticks: u64, ticks_per_sec: u64) -> Self {
        JfrChunkWriter {
            events: Vec::with_capacity(64 * 1024),
            event_count: 0,
            symbols: IndexSet::new(),
            classes: IndexSet::new(),
            threads: IndexMap::new(),
            stack_traces: IndexMap::new(),
            start_nanos,
            start_ticks,
            ticks_per_sec,
        }
    }

    /// Interns a method or class name, returning its symbol-pool index.
    pub fn symbol(&mut self, name: &str) -> u32 {
        self.symbols.insert_full(name.to_owned()).0 as u32
    }

    /// Interns a class by name, returning its class-pool index.
    pub fn class(&mut self, name: &str) -> u32 {
        let symbol = self.symbol(name);
        self.classes.insert_full(symbol).0 as u32
    }

    pub fn set_thread(&mut self, tid: i32, name: &str) {
        self.threads.insert(tid, name.to_owned());
    }

    /// Registers a stack trace under the profiler's stable trace id.
    pub fn set_stack_trace(&mut self, trace_id: u32, frames: Vec<JfrStackFrame>) {
        self.stack_traces.insert(trace_id, frames);
    }

    pub fn write_event(&mut self, event: &JfrEvent) {
        let mut body = Vec::with_capacity(64);
        match event {
            JfrEvent::ExecutionSample { start_ticks, tid, stack_trace, thread_state } => {
                put_var_u64(&mut body, T_EXECUTION_SAMPLE);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *thread_state as u64);
            }
            JfrEvent::WallClockSample { start_ticks, tid, stack_trace, thread_state, samples } => {
                put_var_u64(&mut body, T_WALL_CLOCK_SAMPLE);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *thread_state as u64);
                put_var_u64(&mut body, *samples as u64);
            }
            JfrEvent::AllocationInNewTlab { start_ticks, tid, stack_trace, class, instance_size, tlab_size } => {
                put_var_u64(&mut body, T_ALLOC_IN_NEW_TLAB);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *class as u64);
                put_var_u64(&mut body, *instance_size);
                put_var_u64(&mut body, *tlab_size);
            }
            JfrEvent::AllocationOutsideTlab { start_ticks, tid, stack_trace, class, allocation_size } => {
                put_var_u64(&mut body, T_ALLOC_OUTSIDE_TLAB);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *class as u64);
                put_var_u64(&mut body, *allocation_size);
            }
            JfrEvent::MonitorEnter { start_ticks, duration_ticks, tid, stack_trace, class, address } => {
                put_var_u64(&mut body, T_MONITOR_ENTER);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *duration_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *class as u64);
                put_var_u64(&mut body, *address);
            }
            JfrEvent::ThreadPark { start_ticks, duration_ticks, tid, stack_trace, class, timeout_ns, address } => {
                put_var_u64(&mut body, T_THREAD_PARK);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *duration_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *class as u64);
                put_var_u64(&mut body, *timeout_ns as u64);
                put_var_u64(&mut body, *address);
            }
            JfrEvent::LiveObject { start_ticks, tid, stack_trace, class, allocation_size, allocation_ticks } => {
                put_var_u64(&mut body, T_LIVE_OBJECT);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *class as u64);
                put_var_u64(&mut body, *allocation_size);
                put_var_u64(&mut body, *allocation_ticks);
            }
            JfrEvent::Malloc { start_ticks, tid, stack_trace, address, size } => {
                put_var_u64(&mut body, T_MALLOC);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *address);
                put_var_u64(&mut body, *size);
            }
            JfrEvent::Free { start_ticks, tid, stack_trace, address } => {
                put_var_u64(&mut body, T_FREE);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *tid as u32 as u64);
                put_var_u64(&mut body, *stack_trace as u64);
                put_var_u64(&mut body, *address);
            }
            JfrEvent::ProfilingWindow { start_ticks, end_ticks } => {
                put_var_u64(&mut body, T_PROFILING_WINDOW);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *end_ticks);
            }
            JfrEvent::ProcessSample { start_ticks, pid, cpu_permille, rss_bytes, name } => {
                put_var_u64(&mut body, T_PROCESS_SAMPLE);
                put_var_u64(&mut body, *start_ticks);
                put_var_u64(&mut body, *pid as u32 as u64);
                put_var_u64(&mut body, *cpu_permille as u64);
                put_var_u64(&mut body, *rss_bytes);
                put_string(&mut body, name);
            }
        }
        put_record(&mut self.events, &body);
        self.event_count += 1;
    }

    pub fn event_count(&self) -> u64 {
        self.event_count
    }

    /// Writes the complete chunk. Consumes the writer; a new chunk starts
    /// from a fresh `JfrChunkWriter`.
    pub fn finish<W: Write + ?Sized>(self, out: &mut W, duration_nanos: u64) -> Result<(), JfrError> {
        let mut chunk: Vec<u8> = Vec::with_capacity(HEADER_SIZE + self.events.len());

        chunk.extend_from_slice(MAGIC);
        chunk.write_u16::<BigEndian>(VERSION_MAJOR)?;
        chunk.write_u16::<BigEndian>(VERSION_MINOR)?;
        chunk.write_u64::<BigEndian>(0)?; // chunk size, patched below
        chunk.write_u64::<BigEndian>(0)?; // constant pool offset, patched below
        chunk.write_u64::<BigEndian>(0)?; // metadata offset, patched below
        chunk.write_u64::<BigEndian>(self.start_nanos)?;
        chunk.write_u64::<BigEndian>(duration_nanos)?;
        chunk.write_u64::<BigEndian>(self.start_ticks)?;
        chunk.write_u64::<BigEndian>(self.ticks_per_sec)?;
        chunk.write_u32::<BigEndian>(FEATURE_FINAL_CHUNK)?;
        debug_assert_eq!(chunk.len(), HEADER_SIZE);

        chunk.extend_from_slice(&self.events);

        let metadata_offset = chunk.len();
        write_metadata_event(&mut chunk, self.start_nanos);

        let cpool_offset = chunk.len();
        self.write_constant_pool(&mut chunk);

        let chunk_len = chunk.len() as u64;
        patch_u64(&mut chunk, 8, chunk_len);
        patch_u64(&mut chunk, 16, cpool_offset as u64);
        patch_u64(&mut chunk, 24, metadata_offset as u64);

        out.write_all(&chunk)?;
        Ok(())
    }

    fn write_constant_pool(&self, out: &mut Vec<u8>) {
        let mut body = Vec::with_capacity(4096);
        put_var_u64(&mut body, T_CPOOL);
        put_var_u64(&mut body, 5); // number of pools

        put_var_u64(&mut body, T_SYMBOL);
        put_var_u64(&mut body, self.symbols.len() as u64);
        for (i, name) in self.symbols.iter().enumerate() {
            put_var_u64(&mut body, i as u64);
            put_string(&mut body, name);
        }

        put_var_u64(&mut body, T_CLASS);
        put_var_u64(&mut body, self.classes.len() as u64);
        for (i, &symbol) in self.classes.iter().enumerate() {
            put_var_u64(&mut body, i as u64);
            put_var_u64(&mut body, symbol as u64);
        }

        put_var_u64(&mut body, T_THREAD);
        put_var_u64(&mut body, self.threads.len() as u64);
        for (&tid, name) in &self.threads {
            put_var_u64(&mut body, tid as u32 as u64);
            put_string(&mut body, name);
        }

        put_var_u64(&mut body, T_FRAME_TYPE);
        let frame_types = ["Interpreted", "JIT compiled", "Inlined", "Native", "C++", "Kernel", "C1 compiled"];
        put_var_u64(&mut body, frame_types.len() as u64);
        for (i, name) in frame_types.iter().enumerate() {
            put_var_u64(&mut body, i as u64);
            put_string(&mut body, name);
        }

        put_var_u64(&mut body, T_STACK_TRACE);
        put_var_u64(&mut body, self.stack_traces.len() as u64);
        for (&trace_id, frames) in &self.stack_traces {
            put_var_u64(&mut body, trace_id as u64);
            put_var_u64(&mut body, frames.len() as u64);
            for frame in frames {
                put_var_u64(&mut body, frame.method as u64);
                put_var_u64(&mut body, frame.bci as u32 as u64);
                put_var_u64(&mut body, frame.frame_type as u64);
            }
        }

        put_record(out, &body);
    }
}

fn write_metadata_event(out: &mut Vec<u8>, start_nanos: u64) {
    // A flat list of (id, name) type descriptors. Real JFR metadata is a
    // class/field/annotation tree; the reader here only needs the mapping
    // from event type id to name.
    let types: [(u64, &str); 11] = [
        (T_EXECUTION_SAMPLE, "jdk.ExecutionSample"),
        (T_WALL_CLOCK_SAMPLE, "profiler.WallClockSample"),
        (T_ALLOC_IN_NEW_TLAB, "jdk.ObjectAllocationInNewTLAB"),
        (T_ALLOC_OUTSIDE_TLAB, "jdk.ObjectAllocationOutsideTLAB"),
        (T_MONITOR_ENTER, "jdk.JavaMonitorEnter"),
        (T_THREAD_PARK, "jdk.ThreadPark"),
        (T_LIVE_OBJECT, "profiler.LiveObject"),
        (T_MALLOC, "profiler.Malloc"),
        (T_FREE, "profiler.Free"),
        (T_PROFILING_WINDOW, "profiler.Window"),
        (T_PROCESS_SAMPLE, "profiler.ProcessSample"),
    ];

    let mut body = Vec::with_capacity(512);
    put_var_u64(&mut body, T_METADATA);
    put_var_u64(&mut body, start_nanos);
    put_var_u64(&mut body, types.len() as u64);
    for (id, name) in types {
        put_var_u64(&mut body, id);
        put_string(&mut body, name);
    }

    put_record(out, &body);
}

/// Prepends the record size varint; the size covers the varint itself, so
/// iterate until the length is consistent with its own encoding.
fn put_record(out: &mut Vec<u8>, body: &[u8]) {
    let mut total = body.len() as u64 + 1;
    loop {
        let candidate = body.len() as u64 + var_int_size(total) as u64;
        if candidate == total {
            break;
        }
        total = candidate;
    }
    put_var_u64(out, total);
    out.extend_from_slice(body);
}

fn patch_u64(chunk: &mut [u8], offset: usize, value: u64) {
    chunk[offset..offset + 8].copy_from_slice(&value.to_be_bytes());
}

fn put_var_u64(out: &mut Vec<u8>, mut n: u64) {
    // 56-bit packing: 7 bits per byte for the first 8 bytes, the 9th byte
    // carries the remaining 8 bits without a continuation marker.
    for _ in 0..8 {
        if n < 0x80 {
            out.push(n as u8);
            return;
        }
        out.push(0x80 | (n & 0x7f) as u8);
        n >>= 7;
    }
    out.push(n as u8);
}

fn var_int_size(mut n: u64) -> usize {
    let mut size = 1;
    while n >= 0x80 && size < 9 {
        size += 1;
        n >>= 7;
    }
    size
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    if s.is_empty() {
        out.push(STRING_EMPTY);
    } else if s.is_ascii() {
        out.push(STRING_LATIN1);
        put_var_u64(out, s.len() as u64);
        out.extend_from_slice(s.as_bytes());
    } else {
        out.push(STRING_UTF8);
        put_var_u64(out, s.len() as u64);
        out.extend_from_slice(s.as_bytes());
    }
}

/// Parsed view of one chunk, produced by [`parse_chunk`].
#[derive(Debug, Default)]
pub struct JfrChunk {
    pub start_nanos: u64,
    pub duration_nanos: u64,
    pub ticks_per_sec: u64,
    pub events: Vec<JfrEvent>,
    pub symbols: Vec<String>,
    pub threads: Vec<(i32, String)>,
    pub stack_traces: Vec<(u32, Vec<JfrStackFrame>)>,
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn u16_be(&mut self) -> Result<u16, JfrError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u64_be(&mut self) -> Result<u64, JfrError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], JfrError> {
        if self.pos + n > self.data.len() {
            return Err(JfrError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn var_u64(&mut self) -> Result<u64, JfrError> {
        let mut value = 0u64;
        for i in 0..9 {
            let byte = *self.take(1)?.first().ok_or(JfrError::Truncated)?;
            if i == 8 {
                value |= (byte as u64) << 56;
                return Ok(value);
            }
            value |= ((byte & 0x7f) as u64) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(JfrError::BadVarInt)
    }

    fn var_i32(&mut self) -> Result<i32, JfrError> {
        Ok(self.var_u64()? as u32 as i32)
    }

    fn string(&mut self) -> Result<String, JfrError> {
        let encoding = *self.take(1)?.first().ok_or(JfrError::Truncated)?;
        match encoding {
            STRING_EMPTY => Ok(String::new()),
            STRING_UTF8 | STRING_LATIN1 => {
                let len = self.var_u64()? as usize;
                let bytes = self.take(len)?;
                String::from_utf8(bytes.to_vec()).map_err(|_| JfrError::BadString)
            }
            _ => Err(JfrError::BadString),
        }
    }
}

/// Parses one chunk previously produced by [`JfrChunkWriter`].
pub fn parse_chunk(data: &[u8]) -> Result<JfrChunk, JfrError> {
    if data.len() < HEADER_SIZE || &data[..4] != MAGIC {
        return Err(JfrError::BadMagic);
    }
    let mut header = Cursor { data, pos: 4 };
    let _major = header.u16_be()?;
    let _minor = header.u16_be()?;
    let chunk_size = header.u64_be()? as usize;
    let cpool_offset = header.u64_be()? as usize;
    let metadata_offset = header.u64_be()? as usize;
    let start_nanos = header.u64_be()?;
    let duration_nanos = header.u64_be()?;
    let _start_ticks = header.u64_be()?;
    let ticks_per_sec = header.u64_be()?;

    if chunk_size > data.len() || cpool_offset >= chunk_size || metadata_offset >= chunk_size {
        return Err(JfrError::Truncated);
    }

    let mut chunk = JfrChunk {
        start_nanos,
        duration_nanos,
        ticks_per_sec,
        ..JfrChunk::default()
    };

    // Event records sit between the header and the metadata event.
    let mut cursor = Cursor { data: &data[..metadata_offset], pos: HEADER_SIZE };
    while cursor.pos < metadata_offset {
        let record_start = cursor.pos;
        let size = cursor.var_u64()? as usize;
        let event = parse_event(&mut cursor)?;
        chunk.events.push(event);
        if cursor.pos > record_start + size {
            return Err(JfrError::Truncated);
        }
        cursor.pos = record_start + size;
    }

    let mut cursor = Cursor { data, pos: cpool_offset };
    let _size = cursor.var_u64()?;
    let type_id = cursor.var_u64()?;
    if type_id != T_CPOOL {
        return Err(JfrError::UnknownEvent(type_id));
    }
    let pool_count = cursor.var_u64()?;
    for _ in 0..pool_count {
        let pool_type = cursor.var_u64()?;
        let entry_count = cursor.var_u64()?;
        match pool_type {
            T_SYMBOL => {
                for _ in 0..entry_count {
                    let _index = cursor.var_u64()?;
                    chunk.symbols.push(cursor.string()?);
                }
            }
            T_CLASS => {
                for _ in 0..entry_count {
                    let _index = cursor.var_u64()?;
                    let _symbol = cursor.var_u64()?;
                }
            }
            T_THREAD => {
                for _ in 0..entry_count {
                    let tid = cursor.var_i32()?;
                    chunk.threads.push((tid, cursor.string()?));
                }
            }
            T_FRAME_TYPE => {
                for _ in 0..entry_count {
                    let _index = cursor.var_u64()?;
                    let _name = cursor.string()?;
                }
            }
            T_STACK_TRACE => {
                for _ in 0..entry_count {
                    let trace_id = cursor.var_u64()? as u32;
                    let frame_count = cursor.var_u64()? as usize;
                    let mut frames = Vec::with_capacity(frame_count);
                    for _ in 0..frame_count {
                        frames.push(JfrStackFrame {
                            method: cursor.var_u64()? as u32,
                            bci: cursor.var_i32()?,
                            frame_type: cursor.var_u64()? as u8,
                        });
                    }
                    chunk.stack_traces.push((trace_id, frames));
                }
            }
            other => return Err(JfrError::UnknownEvent(other)),
        }
    }

    Ok(chunk)
}

fn parse_event(cursor: &mut Cursor) -> Result<JfrEvent, JfrError> {
    let type_id = cursor.var_u64()?;
    let event = match type_id {
        T_EXECUTION_SAMPLE => JfrEvent::ExecutionSample {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            thread_state: cursor.var_u64()? as u8,
        },
        T_WALL_CLOCK_SAMPLE => JfrEvent::WallClockSample {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            thread_state: cursor.var_u64()? as u8,
            samples: cursor.var_u64()? as u32,
        },
        T_ALLOC_IN_NEW_TLAB => JfrEvent::AllocationInNewTlab {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            class: cursor.var_u64()? as u32,
            instance_size: cursor.var_u64()?,
            tlab_size: cursor.var_u64()?,
        },
        T_ALLOC_OUTSIDE_TLAB => JfrEvent::AllocationOutsideTlab {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            class: cursor.var_u64()? as u32,
            allocation_size: cursor.var_u64()?,
        },
        T_MONITOR_ENTER => JfrEvent::MonitorEnter {
            start_ticks: cursor.var_u64()?,
            duration_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            class: cursor.var_u64()? as u32,
            address: cursor.var_u64()?,
        },
        T_THREAD_PARK => JfrEvent::ThreadPark {
            start_ticks: cursor.var_u64()?,
            duration_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            class: cursor.var_u64()? as u32,
            timeout_ns: cursor.var_u64()? as i64,
            address: cursor.var_u64()?,
        },
        T_LIVE_OBJECT => JfrEvent::LiveObject {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            class: cursor.var_u64()? as u32,
            allocation_size: cursor.var_u64()?,
            allocation_ticks: cursor.var_u64()?,
        },
        T_MALLOC => JfrEvent::Malloc {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            address: cursor.var_u64()?,
            size: cursor.var_u64()?,
        },
        T_FREE => JfrEvent::Free {
            start_ticks: cursor.var_u64()?,
            tid: cursor.var_i32()?,
            stack_trace: cursor.var_u64()? as u32,
            address: cursor.var_u64()?,
        },
        T_PROFILING_WINDOW => JfrEvent::ProfilingWindow {
            start_ticks: cursor.var_u64()?,
            end_ticks: cursor.var_u64()?,
        },
        T_PROCESS_SAMPLE => JfrEvent::ProcessSample {
            start_ticks: cursor.var_u64()?,
            pid: cursor.var_i32()?,
            cpu_permille: cursor.var_u64()? as u32,
            rss_bytes: cursor.var_u64()?,
            name: cursor.string()?,
        },
        other => return Err(JfrError::UnknownEvent(other)),
    };
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_56_bit_packing() {
        let mut buf = Vec::new();
        put_var_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 9);
        let mut cursor = Cursor { data: &buf, pos: 0 };
        assert_eq!(cursor.var_u64().unwrap(), u64::MAX);
    }

    #[test]
    fn write_then_parse_round_trip() {
        let mut writer = JfrChunkWriter::new(1_700_000_000_000_000_000, 1000, 1_000_000_000);
        let method = writer.symbol("com.example.Main.run");
        let class = writer.class("java.lang.String");
        writer.set_thread(42, "main");
        writer.set_stack_trace(
            7,
            vec![JfrStackFrame { method, bci: 13, frame_type: 1 }],
        );

        let events = vec![
            JfrEvent::ExecutionSample { start_ticks: 1234, tid: 42, stack_trace: 7, thread_state: 0 },
            JfrEvent::AllocationInNewTlab {
                start_ticks: 1300,
                tid: 42,
                stack_trace: 7,
                class,
                instance_size: 24,
                tlab_size: 65536,
            },
            JfrEvent::Malloc { start_ticks: 1400, tid: 42, stack_trace: 7, address: 0xdead_beef, size: 1999993 },
            JfrEvent::Free { start_ticks: 1500, tid: 42, stack_trace: 7, address: 0xdead_beef },
        ];
        for event in &events {
            writer.write_event(event);
        }

        let mut out = Vec::new();
        writer.finish(&mut out, 2_000_000_000).unwrap();

        let chunk = parse_chunk(&out).unwrap();
        assert_eq!(chunk.events, events);
        assert_eq!(chunk.symbols, vec!["com.example.Main.run".to_owned(), "java.lang.String".to_owned()]);
        assert_eq!(chunk.threads, vec![(42, "main".to_owned())]);
        assert_eq!(chunk.stack_traces.len(), 1);
        assert_eq!(chunk.ticks_per_sec, 1_000_000_000);
    }

    #[test]
    fn malloc_and_free_share_address() {
        let mut writer = JfrChunkWriter::new(0, 0, 1_000_000_000);
        writer.write_event(&JfrEvent::Malloc { start_ticks: 1, tid: 1, stack_trace: 0, address: 0x1000, size: 64 });
        writer.write_event(&JfrEvent::Free { start_ticks: 2, tid: 1, stack_trace: 0, address: 0x1000 });
        let mut out = Vec::new();
        writer.finish(&mut out, 0).unwrap();

        let chunk = parse_chunk(&out).unwrap();
        let malloc_addr = match &chunk.events[0] {
            JfrEvent::Malloc { address, .. } => *address,
            other => panic!("unexpected event {other:?}"),
        };
        let free_addr = match &chunk.events[1] {
            JfrEvent::Free { address, .. } => *address,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(malloc_addr, free_addr);
    }

    #[test]
    fn rejects_foreign_data() {
        assert!(matches!(parse_chunk(b"not a jfr file"), Err(JfrError::BadMagic)));
    }
}
