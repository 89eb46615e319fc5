//! asprof is an in-process sampling profiler agent for the JVM and
//! compatible runtimes, with useful degraded behavior in plain native
//! processes.
//!
//! It produces stack-resolved profiles of CPU time, wall-clock time, heap
//! allocations, monitor and native lock contention, native memory
//! operations and process-level resource usage, at configurable sampling
//! intervals and with negligible perturbation of the host program.
//!
//! The crate builds as a `cdylib` exposing the C API in [`api`]
//! (`asprof_init`, `asprof_execute`, ...), and as a regular library for
//! embedding. The command surface is a comma-separated token list:
//!
//! ```no_run
//! use asprof::profiler::Profiler;
//!
//! let profiler = Profiler::instance();
//! profiler.init();
//! let mut out = Vec::new();
//! profiler
//!     .execute("start,event=cpu,interval=10ms", &mut out)
//!     .unwrap();
//! // ... workload ...
//! profiler.execute("stop,file=profile.collapsed", &mut out).unwrap();
//! ```
//!
//! Internals, roughly bottom-up: [`arena`] (signal-safe bump allocation),
//! [`call_trace_storage`] (lock-free trace interning), [`stack_frame`] /
//! [`stack_walker`] / [`dwarf`] (the unwinder), [`vm`] (read-only runtime
//! metadata adapter), [`trap`] / [`signals`] (instruction patching and
//! fault recovery), the engines under [`engines`], and the [`profiler`]
//! facade tying them together.

pub mod api;
pub mod args;
pub mod arena;
pub mod call_trace_storage;
pub mod code_cache;
pub mod context;
pub mod dictionary;
pub mod dwarf;
pub mod engines;
pub mod error;
pub mod event;
pub mod event_buffer;
pub mod frame;
pub mod logger;
pub mod os;
pub mod profiler;
pub mod safe_access;
pub mod signals;
pub mod stack_frame;
pub mod stack_walker;
pub mod streamer;
pub mod thread;
pub mod thread_filter;
pub mod trap;
pub mod tsc;
pub mod vm;

pub use args::Arguments;
pub use call_trace_storage::CallTraceStorage;
pub use error::{ProfilerError, Result};
pub use event::{Event, EventType};
pub use frame::{Frame, FrameTypeId};
pub use profiler::{Profiler, RuntimeBinding};
