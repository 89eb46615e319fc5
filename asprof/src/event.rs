//! Sample events. One record per sample, tagged by kind, constructed on the
//! sampling path and either buffered for the output layer or forwarded
//! straight to a serializer.

use crate::os::ThreadState;

/// Event kinds; the order groups the CPU-style kinds first, which the
/// engines rely on when deciding whether context filtering applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum EventType {
    ExecutionSample = 0,
    WallClockSample = 1,
    InstrumentedMethod = 2,
    AllocSample = 3,
    AllocOutsideTlab = 4,
    LiveObject = 5,
    LockSample = 6,
    ParkSample = 7,
    ProfilingWindow = 8,
    Malloc = 9,
    Free = 10,
    ProcessSample = 11,
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutionEvent {
    pub start_time: u64,
    pub thread_state: ThreadState,
}

#[derive(Debug, Clone, Copy)]
pub struct WallClockEvent {
    pub start_time: u64,
    pub thread_state: ThreadState,
    /// Number of consecutive idle samples folded into this record.
    pub samples: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AllocEvent {
    pub start_time: u64,
    pub class_id: u32,
    pub total_size: u64,
    pub instance_size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LockEvent {
    pub start_time: u64,
    pub end_time: u64,
    pub class_id: u32,
    pub address: u64,
    pub timeout: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LiveObjectEvent {
    pub start_time: u64,
    pub class_id: u32,
    pub alloc_size: u64,
    pub alloc_time: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct WindowEvent {
    pub start_time: u64,
    pub end_time: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct MallocEvent {
    pub start_time: u64,
    pub address: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProcessSnapshotEvent {
    pub start_time: u64,
    pub pid: i32,
    pub cpu_permille: u32,
    pub rss_bytes: u64,
}

/// The tagged union carried through the sample pipeline.
#[derive(Debug, Clone, Copy)]
pub enum Event {
    Execution(ExecutionEvent),
    WallClock(WallClockEvent),
    Alloc(AllocEvent),
    LiveObject(LiveObjectEvent),
    Lock(LockEvent),
    Window(WindowEvent),
    Malloc(MallocEvent),
    Free(MallocEvent),
    ProcessSnapshot(ProcessSnapshotEvent),
}

impl Event {
    pub fn start_time(&self) -> u64 {
        match self {
            Event::Execution(e) => e.start_time,
            Event::WallClock(e) => e.start_time,
            Event::Alloc(e) => e.start_time,
            Event::LiveObject(e) => e.start_time,
            Event::Lock(e) => e.start_time,
            Event::Window(e) => e.start_time,
            Event::Malloc(e) | Event::Free(e) => e.start_time,
            Event::ProcessSnapshot(e) => e.start_time,
        }
    }
}
