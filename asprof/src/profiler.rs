//! The profiler facade: lifecycle, engine registry, per-thread state and
//! the sample record pipeline.
//!
//! One instance per process, initialized at first use. The control plane
//! (`execute`, `start`, `stop`, `dump`) runs under a mutex; the sampling
//! path ([`Profiler::record_sample`]) touches only lock-free state: the
//! call-trace store, the event buffer, the dictionaries and the per-thread
//! records.

use std::io::Write;
use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use log::{info, warn};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::args::{
    Action, Arguments, CStack, Output, EVENT_ALLOC, EVENT_CPU, EVENT_ITIMER, EVENT_LOCK,
    EVENT_NOOP, EVENT_WALL, MAX_STACK_DEPTH,
};
use crate::call_trace_storage::{CallTraceStorage, OVERFLOW_TRACE_ID};
use crate::code_cache::{collect_libraries, CodeCache};
use crate::context::Contexts;
use crate::dictionary::Dictionary;
use crate::engines::{self, Engine};
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, WindowEvent};
use crate::event_buffer::EventBuffer;
use crate::frame::{Frame, FrameTypeId, BCI_THREAD_ID};
use crate::signals;
use crate::stack_frame::StackFrame;
use crate::stack_walker::{self, WalkEnv};
use crate::thread::{self, ProfiledThread};
use crate::thread_filter::ThreadFilter;
use crate::trap::Trap;
use crate::tsc;
use crate::{logger, streamer};

use asprof_formats::{
    CollapsedWriter, Counter, FlameGraph, FrameKind, JfrChunkWriter, JfrEvent, JfrStackFrame,
    OtlpProfile,
};

/// Operations only the embedding front-end can perform against the hosted
/// runtime (event notification modes, heap sampling, retransformation).
/// Registered once at attach time; absent in plain native processes.
pub trait RuntimeBinding: Send + Sync {
    fn set_heap_sampling_interval(&self, interval: i64) -> Result<()>;
    fn set_monitor_events(&self, enabled: bool) -> Result<()>;
    fn retransform_class(&self, class: &str) -> Result<()>;
    /// Resolves a managed method id to `Class.method`.
    fn method_name(&self, method_id: u64) -> Option<String>;
}

#[derive(Default)]
struct SampleCounters {
    total: AtomicU64,
    dropped_no_thread: AtomicU64,
    dropped_reentry: AtomicU64,
    dropped_filtered: AtomicU64,
    dropped_buffer: AtomicU64,
    failed_unwinds: AtomicU64,
}

struct ControlState {
    running: bool,
    session: Option<Arguments>,
    engines: Vec<Box<dyn Engine>>,
    begin_trap: Option<Trap>,
    end_trap: Option<Trap>,
    start_nanos: u64,
    start_ticks: u64,
    dump_sequence: u32,
}

pub struct Profiler {
    storage: CallTraceStorage,
    events: EventBuffer,
    class_map: Dictionary,
    symbols: Dictionary,
    thread_filter: ThreadFilter,
    thread_names: Mutex<FxHashMap<i32, String>>,
    // (code_begin, code_end, name) regions from compiled-method-load
    // notifications, sorted by start address. Dump-time reads only.
    jit_methods: Mutex<Vec<(usize, usize, String)>>,
    counters: SampleCounters,
    control: Mutex<ControlState>,
    binding: Mutex<Option<Box<dyn RuntimeBinding>>>,
    // Published library list; replaced wholesale, old versions retired into
    // `library_history` so in-flight samplers never see a dangling pointer.
    libraries_current: AtomicPtr<Vec<CodeCache>>,
    library_history: Mutex<Vec<Box<Vec<CodeCache>>>>,
    // Installed once the runtime's metadata tables resolve; retried on every
    // start because the runtime may load after attach.
    vm_current: AtomicPtr<crate::vm::VMStructs>,
    // Async-signal-safe copies of the session settings.
    cstack: AtomicU32,
    max_depth: AtomicU32,
    signal_context_filter: AtomicU32,
    // `threads` option: append a tid frame at the root of every trace.
    signal_threads: AtomicU32,
    // Event records are only buffered when a serializer will consume them.
    events_enabled: AtomicU32,
}

static INSTANCE: OnceLock<Profiler> = OnceLock::new();

// Begin/end gate trap entries, mirrored for the trap hook.
static BEGIN_ENTRY: AtomicU64 = AtomicU64::new(0);
static END_ENTRY: AtomicU64 = AtomicU64::new(0);

impl Profiler {
    pub fn instance() -> &'static Profiler {
        INSTANCE.get_or_init(|| {
            logger::init();
            thread::prepare();
            Profiler {
                storage: CallTraceStorage::new(),
                events: EventBuffer::new(),
                class_map: Dictionary::new(),
                symbols: Dictionary::new(),
                thread_filter: ThreadFilter::new(),
                thread_names: Mutex::new(FxHashMap::default()),
                jit_methods: Mutex::new(Vec::new()),
                counters: SampleCounters::default(),
                control: Mutex::new(ControlState {
                    running: false,
                    session: None,
                    engines: Vec::new(),
                    begin_trap: None,
                    end_trap: None,
                    start_nanos: 0,
                    start_ticks: 0,
                    dump_sequence: 0,
                }),
                binding: Mutex::new(None),
                libraries_current: AtomicPtr::new(std::ptr::null_mut()),
                library_history: Mutex::new(Vec::new()),
                vm_current: AtomicPtr::new(std::ptr::null_mut()),
                cstack: AtomicU32::new(CStack::Default as u32),
                max_depth: AtomicU32::new(crate::args::DEFAULT_JSTACKDEPTH as u32),
                signal_context_filter: AtomicU32::new(0),
                signal_threads: AtomicU32::new(0),
                events_enabled: AtomicU32::new(0),
            }
        })
    }

    /// One-time process setup: crash handlers, the library table, and the
    /// lazily-built lookup structures the signal handler must never be the
    /// first to touch.
    pub fn init(&self) {
        signals::setup_crash_handlers();
        self.refresh_libraries();
        Contexts::instance();
        self.init_vm_structs();
    }

    pub fn set_runtime_binding(&self, binding: Box<dyn RuntimeBinding>) {
        *self.binding.lock() = Some(binding);
    }

    /// Rebuilds the library table (at init and after dlopen). Previous
    /// versions stay alive in `library_history`, so a sampler that loaded
    /// the old pointer keeps reading valid memory.
    pub fn refresh_libraries(&self) {
        let fresh = Box::new(collect_libraries());
        let raw = Box::as_ref(&fresh) as *const Vec<CodeCache> as *mut Vec<CodeCache>;
        let mut history = self.library_history.lock();
        history.push(fresh);
        self.libraries_current.store(raw, Ordering::Release);
    }

    /// The current library table. Entries live for the process lifetime.
    pub fn libraries(&self) -> &'static [CodeCache] {
        let raw = self.libraries_current.load(Ordering::Acquire);
        if raw.is_null() {
            &[]
        } else {
            unsafe { (*raw).as_slice() }
        }
    }

    /// The managed runtime's own library, if one is loaded.
    pub fn runtime_library(&self) -> Option<&'static CodeCache> {
        self.libraries()
            .iter()
            .find(|lib| lib.name.contains("libjvm.") || lib.name.contains("libj9vm"))
    }

    fn vm_structs(&self) -> Option<&'static crate::vm::VMStructs> {
        let vm = self.vm_current.load(Ordering::Acquire);
        if vm.is_null() {
            None
        } else {
            Some(unsafe { &*vm })
        }
    }

    /// Probes the runtime's exported metadata tables. Control plane only;
    /// cheap when already resolved or when no runtime is present.
    fn init_vm_structs(&self) {
        if !self.vm_current.load(Ordering::Acquire).is_null() {
            return;
        }
        if let Some(vm) = self.runtime_library().and_then(crate::vm::VMStructs::init) {
            let vm = Box::into_raw(Box::new(vm));
            if self
                .vm_current
                .compare_exchange(std::ptr::null_mut(), vm, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                drop(unsafe { Box::from_raw(vm) });
            }
        }
    }

    pub fn find_library_by_address(&self, pc: usize) -> Option<&'static CodeCache> {
        self.libraries().iter().find(|lib| lib.contains(pc))
    }

    // ---- sampling path -------------------------------------------------

    /// The single entry point from every engine. Returns the interned trace
    /// id (0 when the sample was dropped).
    pub fn record_sample(
        &self,
        ucontext: *mut libc::c_void,
        counter: u64,
        event_type: EventType,
        event: &Event,
    ) -> u32 {
        let record = thread::current_or_pooled();
        if record.is_null() {
            self.counters.dropped_no_thread.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let record = unsafe { &*record };
        if !record.enter_handler() {
            self.counters.dropped_reentry.fetch_add(1, Ordering::Relaxed);
            return 0;
        }
        let trace_id = self.record_sample_inner(record, ucontext, counter, event_type, event);
        record.leave_handler();
        trace_id
    }

    fn record_sample_inner(
        &self,
        record: &ProfiledThread,
        ucontext: *mut libc::c_void,
        counter: u64,
        event_type: EventType,
        event: &Event,
    ) -> u32 {
        record.note_sample();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let tid = record.tid();
        if self.signal_context_filter.load(Ordering::Relaxed) != 0
            && matches!(event_type, EventType::ExecutionSample | EventType::WallClockSample)
        {
            let context = Contexts::instance().get(tid);
            if context.span_id == 0 && context.root_span_id == 0 {
                self.counters.dropped_filtered.fetch_add(1, Ordering::Relaxed);
                return 0;
            }
        }

        // Allocation and lock samples carry the class as an extra leaf
        // frame, so profiles group by the allocated/contended type.
        let class_frame = match event {
            Event::Alloc(e) if e.class_id != 0 => Some(Frame::symbol(
                if event_type == EventType::AllocOutsideTlab {
                    crate::frame::BCI_ALLOC_OUTSIDE_TLAB
                } else {
                    crate::frame::BCI_ALLOC
                },
                e.class_id as u64,
            )),
            Event::Lock(e) if e.class_id != 0 => Some(Frame::symbol(
                if event_type == EventType::ParkSample {
                    crate::frame::BCI_PARK
                } else {
                    crate::frame::BCI_LOCK
                },
                e.class_id as u64,
            )),
            _ => None,
        };

        let mut frames = [Frame::address(0); MAX_STACK_DEPTH];
        let reserved = usize::from(class_frame.is_some());
        let mut depth = self.walk(ucontext, &mut frames[reserved..]) + reserved;
        if let Some(class_frame) = class_frame {
            frames[0] = class_frame;
        }
        if self.signal_threads.load(Ordering::Relaxed) != 0 && depth < frames.len() {
            frames[depth] = Frame::symbol(BCI_THREAD_ID, tid as u32 as u64);
            depth += 1;
        }
        let max_depth = (self.max_depth.load(Ordering::Relaxed) as usize).max(1);
        // Deeper stacks are truncated from the leaf side, marked by a
        // sentinel in place of the dropped frames.
        let frames = if depth > max_depth {
            let start = depth - (max_depth - 1);
            frames[start - 1] =
                Frame::symbol(crate::frame::BCI_ERROR, self.symbols.lookup("truncated") as u64);
            &frames[start - 1..depth]
        } else {
            &frames[..depth]
        };

        let trace_id = self.storage.put(frames, counter);
        if trace_id == OVERFLOW_TRACE_ID {
            return trace_id;
        }

        if self.events_enabled.load(Ordering::Relaxed) != 0
            && !self.events.publish(event_type, *event, tid, trace_id)
        {
            self.counters.dropped_buffer.fetch_add(1, Ordering::Relaxed);
        }
        trace_id
    }

    /// Records samples whose stack was captured earlier (wall-clock idle
    /// batches, live-object dumps, process snapshots).
    pub fn record_external_samples(
        &self,
        samples: u64,
        counter: u64,
        tid: i32,
        call_trace_id: u32,
        event_type: EventType,
        event: &Event,
    ) {
        self.counters.total.fetch_add(samples, Ordering::Relaxed);
        self.storage.add(call_trace_id, counter);
        if self.events_enabled.load(Ordering::Relaxed) != 0
            && !self.events.publish(event_type, *event, tid, call_trace_id)
        {
            self.counters.dropped_buffer.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn walk(&self, ucontext: *mut libc::c_void, frames: &mut [Frame]) -> usize {
        let env = WalkEnv {
            libraries: self.libraries(),
            vm: self.vm_structs(),
            symbols: &self.symbols,
        };
        let frame_holder;
        let frame = if ucontext.is_null() {
            None
        } else {
            frame_holder = unsafe { StackFrame::new(ucontext) };
            Some(&frame_holder)
        };

        let cstack = self.cstack.load(Ordering::Relaxed);
        let depth = if cstack == CStack::No as u32 {
            0
        } else if cstack == CStack::FramePointer as u32 {
            let mut callchain = [0usize; MAX_STACK_DEPTH];
            let mut java_ctx = Default::default();
            let native = stack_walker::walk_fp(
                &env,
                frame,
                &mut callchain[..frames.len()],
                &mut java_ctx,
            );
            for (slot, pc) in frames.iter_mut().zip(&callchain[..native]) {
                *slot = env.native_frame(*pc);
            }
            native
        } else if cstack == CStack::Dwarf as u32 {
            let mut callchain = [0usize; MAX_STACK_DEPTH];
            let mut java_ctx = Default::default();
            let native = stack_walker::walk_dwarf(
                &env,
                frame,
                &mut callchain[..frames.len()],
                &mut java_ctx,
            );
            for (slot, pc) in frames.iter_mut().zip(&callchain[..native]) {
                *slot = env.native_frame(*pc);
            }
            native
        } else {
            // Default and `vm`: the full runtime-aware walk.
            stack_walker::walk_vm(&env, frame, frames)
        };

        if depth == 0 {
            self.counters.failed_unwinds.fetch_add(1, Ordering::Relaxed);
        }
        depth
    }

    // ---- lookups used by engines --------------------------------------

    pub fn class_id(&self, class_name: &str) -> u32 {
        // JNI signatures arrive as "Ljava/lang/String;"; store the bare name.
        let name = class_name
            .strip_prefix('L')
            .and_then(|n| n.strip_suffix(';'))
            .unwrap_or(class_name);
        self.class_map.lookup(name)
    }

    pub fn class_id_of_klass(&self, klass: usize) -> u32 {
        let Some(vm) = self.vm_structs() else { return 0 };
        let mut buf = [0u8; 256];
        match vm.klass_name(klass, &mut buf) {
            Some(name) if !name.is_empty() => self.class_map.lookup_bytes(name),
            _ => 0,
        }
    }

    pub fn thread_accepted(&self, tid: i32) -> bool {
        !self.thread_filter.enabled() || self.thread_filter.accept(tid)
    }

    /// Publishes a tracing context for `tid`; with filtering enabled,
    /// execution and wall samples of threads without a context are dropped.
    pub fn set_context(&self, tid: i32, span_id: u64, root_span_id: u64) {
        Contexts::instance().set(tid, crate::context::Context { span_id, root_span_id });
    }

    pub fn clear_context(&self, tid: i32) {
        Contexts::instance().clear(tid);
    }

    pub fn set_context_filter(&self, enabled: bool) {
        self.signal_context_filter.store(u32::from(enabled), Ordering::Relaxed);
    }

    // ---- runtime binding passthroughs ---------------------------------

    fn with_binding(&self, f: impl FnOnce(&dyn RuntimeBinding) -> Result<()>) -> Result<()> {
        match self.binding.lock().as_deref() {
            Some(binding) => f(binding),
            None => Err(ProfilerError::feasibility(
                "no runtime binding registered in this process",
            )),
        }
    }

    pub fn set_heap_sampling(&self, interval: i64) -> Result<()> {
        self.with_binding(|b| b.set_heap_sampling_interval(interval))
    }

    pub fn set_monitor_events(&self, enabled: bool) -> Result<()> {
        self.with_binding(|b| b.set_monitor_events(enabled))
    }

    pub fn request_retransform(&self, class: &str) -> Result<()> {
        self.with_binding(|b| b.retransform_class(class))
    }

    // ---- thread lifecycle ---------------------------------------------

    pub fn thread_start(&self) {
        let record = thread::init_current_thread();
        if !record.is_null() {
            let tid = unsafe { (*record).tid() };
            if let Some(name) = std::thread::current().name() {
                self.thread_names.lock().insert(tid, name.to_owned());
            }
            Contexts::instance().initialize(tid);
        }
        engines::cpu::on_thread_start();
    }

    pub fn thread_end(&self) {
        engines::cpu::on_thread_end();
        thread::release();
    }

    pub fn set_thread_name(&self, tid: i32, name: &str) {
        self.thread_names.lock().insert(tid, name.to_owned());
    }

    /// Class-load notification from the runtime adapter: pre-interns the
    /// name so allocation samples of this class resolve without work on the
    /// sampling path.
    pub fn class_load(&self, class_name: &str) {
        self.class_id(class_name);
    }

    /// Compiled-method-load notification: remembers the code region so raw
    /// addresses inside it render as the method even when the metadata
    /// adapter is unavailable.
    pub fn compiled_method_load(&self, method_name: &str, code_begin: usize, code_size: usize) {
        let mut methods = self.jit_methods.lock();
        methods.push((code_begin, code_begin + code_size, method_name.to_owned()));
        methods.sort_unstable_by_key(|(begin, _, _)| *begin);
    }

    fn jit_method_name(&self, pc: usize) -> Option<String> {
        let methods = self.jit_methods.lock();
        let index = methods.partition_point(|(begin, _, _)| *begin <= pc);
        let (begin, end, name) = methods.get(index.checked_sub(1)?)?;
        (pc >= *begin && pc < *end).then(|| name.clone())
    }

    // ---- control plane -------------------------------------------------

    /// Parses and executes one textual command, writing human output to
    /// `writer`.
    pub fn execute(&self, command: &str, writer: &mut dyn Write) -> Result<()> {
        let args = Arguments::parse(command)?;
        logger::configure(args.loglevel, args.log.as_deref())?;
        if args.server.is_some() {
            return Err(ProfilerError::invalid("server mode is not supported in this build"));
        }
        match args.action {
            Action::Start | Action::Resume => {
                let loop_args = args.clone();
                self.start(args)?;
                if loop_args.loop_interval.is_some() {
                    run_loop_rotation(loop_args);
                }
                Ok(())
            }
            Action::Stop => {
                self.stop()?;
                // Dumping drains the per-slot sample counts, so a bare stop
                // leaves them for a later dump command.
                let has_target = args.file.is_some()
                    || self
                        .control
                        .lock()
                        .session
                        .as_ref()
                        .is_some_and(|session| session.file.is_some());
                if has_target {
                    self.dump_session_with(writer, Some(&args))
                } else {
                    writeln!(writer, "Profiling stopped")?;
                    Ok(())
                }
            }
            Action::Dump => self.dump_session_with(writer, Some(&args)),
            Action::Status => self.status(writer),
            Action::List => self.list(writer),
            Action::Version => {
                writeln!(writer, "asprof {}", env!("CARGO_PKG_VERSION"))?;
                Ok(())
            }
            Action::None => Err(ProfilerError::invalid("missing action")),
        }
    }

    fn select_engines(&self, args: &Arguments) -> Result<Vec<Box<dyn Engine>>> {
        let mut selected: Vec<Box<dyn Engine>> = Vec::new();

        match args.primary_event() {
            EVENT_CPU => {
                let mut cpu = Box::<engines::cpu::CpuEngine>::default();
                if cpu.check(args).is_ok() {
                    selected.push(cpu);
                } else {
                    selected.push(Box::<engines::itimer::ITimerEngine>::default());
                }
            }
            EVENT_ITIMER => selected.push(Box::<engines::itimer::ITimerEngine>::default()),
            EVENT_WALL => selected.push(Box::<engines::wall_clock::WallClockEngine>::default()),
            EVENT_ALLOC => {
                let mut sampler = Box::<engines::object_sampler::ObjectSampler>::default();
                if sampler.check(args).is_ok() {
                    selected.push(sampler);
                } else {
                    let mut tracer = Box::<engines::alloc_tracer::AllocTracer>::default();
                    tracer.check(args)?;
                    selected.push(tracer);
                }
            }
            EVENT_LOCK => {
                let mut lock = Box::<engines::lock_tracer::LockTracer>::default();
                if lock.check(args).is_ok() {
                    selected.push(lock);
                } else {
                    selected.push(Box::<engines::native_lock_tracer::NativeLockTracer>::default());
                }
            }
            EVENT_NOOP => {}
            other => {
                let mut instrument = Box::<engines::instrument::Instrument>::default();
                instrument.check(args).map_err(|_| {
                    ProfilerError::invalid(format!("unknown event '{other}'"))
                })?;
                selected.push(instrument);
            }
        }

        // Secondary engines from their own thresholds.
        if args.wall.is_some() && args.primary_event() != EVENT_WALL {
            selected.push(Box::<engines::wall_clock::WallClockEngine>::default());
        }
        if args.alloc.is_some() && args.primary_event() != EVENT_ALLOC {
            let mut sampler = Box::<engines::object_sampler::ObjectSampler>::default();
            if sampler.check(args).is_ok() {
                selected.push(sampler);
            }
        }
        if args.lock.is_some() && args.primary_event() != EVENT_LOCK {
            let mut lock = Box::<engines::lock_tracer::LockTracer>::default();
            if lock.check(args).is_ok() {
                selected.push(lock);
            } else {
                selected.push(Box::<engines::native_lock_tracer::NativeLockTracer>::default());
            }
        }
        if args.nativemem.is_some() {
            selected.push(Box::<engines::malloc_tracer::MallocTracer>::default());
        }
        if args.proc.is_some() {
            selected.push(Box::<engines::process_sampler::ProcessSampler>::default());
        }

        if selected.is_empty() {
            return Err(ProfilerError::invalid("no engine selected"));
        }
        Ok(selected)
    }

    pub fn start(&self, args: Arguments) -> Result<()> {
        let mut control = self.control.lock();
        if control.running {
            return Err(ProfilerError::failed("profiler already started"));
        }

        self.init();
        tsc::enable(tsc::Clock::Tsc);
        self.storage.clear();
        self.events.clear();

        self.cstack.store(args.cstack as u32, Ordering::Relaxed);
        self.max_depth.store(args.jstackdepth as u32, Ordering::Relaxed);
        self.thread_filter.init(args.threads && args.begin.is_some());
        self.signal_threads.store(u32::from(args.threads), Ordering::Relaxed);
        // Without a fixed output target the dump format is decided later,
        // so keep the event records around.
        self.events_enabled.store(
            u32::from(args.output == Output::Jfr || args.file.is_none()),
            Ordering::Relaxed,
        );

        let mut engines_list = self.select_engines(&args)?;

        // Begin/end gates: profiling is disabled until the begin symbol is
        // hit, then toggled by the traps.
        let gated = args.begin.is_some();
        if gated || args.end.is_some() {
            self.install_gate_traps(&args, &mut control)?;
        }

        control.start_nanos = crate::os::micros() * 1000;
        control.start_ticks = tsc::ticks();

        engines::enable_events(!gated);
        let mut started: Vec<Box<dyn Engine>> = Vec::new();
        let mut first_err = None;
        for mut engine in engines_list.drain(..) {
            match engine.start(&args) {
                Ok(()) => {
                    info!("engine {} started", engine.type_name());
                    started.push(engine);
                }
                Err(err) => {
                    // A failed engine stops nothing else; only a session
                    // with no engine at all fails.
                    warn!("engine {} failed to start: {err}", engine.type_name());
                    first_err.get_or_insert(err);
                }
            }
        }
        if started.is_empty() {
            engines::enable_events(false);
            return Err(
                first_err.unwrap_or_else(|| ProfilerError::failed("no engine could be started")),
            );
        }

        control.engines = started;
        control.session = Some(args);
        control.running = true;
        Ok(())
    }

    fn install_gate_traps(&self, args: &Arguments, control: &mut ControlState) -> Result<()> {
        let resolve = |symbol: &str| -> Option<usize> {
            self.libraries()
                .iter()
                .find_map(|lib| lib.find_exact_symbol(symbol).map(|s| s.start))
        };
        if let Some(begin) = &args.begin {
            let address = resolve(begin)
                .ok_or_else(|| ProfilerError::feasibility(format!("symbol '{begin}' not found")))?;
            let mut trap = Trap::new(2);
            trap.assign(address);
            BEGIN_ENTRY.store(trap.entry() as u64, Ordering::Relaxed);
            if !trap.install() {
                return Err(ProfilerError::install("cannot install begin breakpoint"));
            }
            control.begin_trap = Some(trap);
        }
        if let Some(end) = &args.end {
            let address = resolve(end)
                .ok_or_else(|| ProfilerError::feasibility(format!("symbol '{end}' not found")))?;
            let mut trap = Trap::new(3);
            trap.assign(address);
            END_ENTRY.store(trap.entry() as u64, Ordering::Relaxed);
            if !trap.install() {
                return Err(ProfilerError::install("cannot install end breakpoint"));
            }
            control.end_trap = Some(trap);
        }
        signals::register_trap_hook(gate_trap_hook);
        Ok(())
    }

    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock();
        if !control.running {
            return Err(ProfilerError::failed("profiler is not active"));
        }

        engines::enable_events(false);
        for engine in control.engines.iter_mut().rev() {
            engine.stop();
            info!("engine {} stopped", engine.type_name());
        }
        control.engines.clear();

        if let Some(trap) = control.begin_trap.take() {
            trap.uninstall();
            BEGIN_ENTRY.store(0, Ordering::Relaxed);
        }
        if let Some(trap) = control.end_trap.take() {
            trap.uninstall();
            END_ENTRY.store(0, Ordering::Relaxed);
        }
        signals::unregister_trap_hook(gate_trap_hook);

        let event = Event::Window(WindowEvent {
            start_time: control.start_ticks,
            end_time: tsc::ticks(),
        });
        self.events.publish(EventType::ProfilingWindow, event, thread::current_tid(), 0);

        control.running = false;
        Ok(())
    }

    // ---- output ---------------------------------------------------------

    /// Renders one frame for text outputs.
    fn frame_name(&self, frame: &Frame) -> String {
        if frame.is_symbol() {
            match frame.bci {
                crate::frame::BCI_ADDRESS => {
                    if let Some(name) = self.jit_method_name(frame.method as usize) {
                        return name;
                    }
                    return format!("[0x{:x}]", frame.method);
                }
                crate::frame::BCI_ALLOC
                | crate::frame::BCI_ALLOC_OUTSIDE_TLAB
                | crate::frame::BCI_LOCK
                | crate::frame::BCI_PARK => {
                    // Class sentinel frames resolve through the class map.
                    return match self.class_map.name_of(frame.method as u32) {
                        Some(name) => name.to_owned(),
                        None => format!("[class {}]", frame.method),
                    };
                }
                crate::frame::BCI_THREAD_ID => {
                    let tid = frame.method as i32;
                    return match self.thread_names.lock().get(&tid) {
                        Some(name) => format!("[{name} tid={tid}]"),
                        None => format!("[tid={tid}]"),
                    };
                }
                _ => {}
            }
            return match self.symbols.name_of(frame.method as u32) {
                Some(name) => name.to_owned(),
                None => format!("[symbol {}]", frame.method),
            };
        }
        let binding = self.binding.lock();
        if let Some(name) = binding
            .as_deref()
            .and_then(|b| b.method_name(frame.method))
        {
            return name;
        }
        format!("[jmethodID 0x{:x}]", frame.method)
    }

    fn frame_kind(frame: &Frame) -> FrameKind {
        match frame.type_id() {
            Some(FrameTypeId::Interpreted) => FrameKind::Interpreted,
            Some(FrameTypeId::C1Compiled) => FrameKind::C1Compiled,
            Some(FrameTypeId::Inlined) => FrameKind::Inlined,
            Some(FrameTypeId::Kernel) => FrameKind::Kernel,
            Some(FrameTypeId::Cpp) => FrameKind::Cpp,
            Some(FrameTypeId::Native) => FrameKind::Native,
            Some(FrameTypeId::JitCompiled) => FrameKind::JitCompiled,
            None => match frame.bci {
                crate::frame::BCI_NATIVE_FRAME | crate::frame::BCI_ADDRESS => FrameKind::Native,
                _ => FrameKind::Cpp,
            },
        }
    }

    fn matches_filters(&self, args: &Arguments, names: &[String]) -> bool {
        let matches_glob = |glob: &str, name: &str| {
            // Globs here are prefix/suffix patterns: `*seg*`, `java/*`, `*.run`.
            let parts: Vec<&str> = glob.split('*').collect();
            match parts.as_slice() {
                [exact] => name == *exact,
                [prefix, suffix] => name.starts_with(prefix) && name.ends_with(suffix),
                [prefix, middle @ .., suffix] => {
                    if !name.starts_with(prefix) || !name.ends_with(suffix) {
                        return false;
                    }
                    let mut pos = prefix.len();
                    for part in middle {
                        match name[pos..].find(part) {
                            Some(found) => pos += found + part.len(),
                            None => return false,
                        }
                    }
                    true
                }
                [] => false,
            }
        };
        if !args.include.is_empty()
            && !names
                .iter()
                .any(|name| args.include.iter().any(|glob| matches_glob(glob, name)))
        {
            return false;
        }
        if names
            .iter()
            .any(|name| args.exclude.iter().any(|glob| matches_glob(glob, name)))
        {
            return false;
        }
        true
    }

    /// Writes the session's aggregated profile in the configured format.
    pub fn dump_session(&self, writer: &mut dyn Write) -> Result<()> {
        self.dump_session_with(writer, None)
    }

    /// Like [`Profiler::dump_session`], but output target and filters given
    /// on the dump command itself override the session's.
    pub fn dump_session_with(
        &self,
        writer: &mut dyn Write,
        request: Option<&Arguments>,
    ) -> Result<()> {
        let (mut args, start_nanos, start_ticks, sequence) = {
            let mut control = self.control.lock();
            let args = control.session.clone().ok_or_else(|| {
                ProfilerError::failed("profiler has not run yet")
            })?;
            control.dump_sequence += 1;
            (args, control.start_nanos, control.start_ticks, control.dump_sequence - 1)
        };

        if let Some(request) = request {
            if request.file.is_some() {
                args.file = request.file.clone();
                args.output = request.output;
            } else if request.output != Output::Text {
                args.file = None;
                args.output = request.output;
            }
            if !request.include.is_empty() {
                args.include = request.include.clone();
            }
            if !request.exclude.is_empty() {
                args.exclude = request.exclude.clone();
            }
            if request.total {
                args.total = true;
            }
        }

        match args.expanded_file(sequence) {
            Some(path) => {
                let file = std::fs::File::create(&path)?;
                let mut out = std::io::BufWriter::new(file);
                self.dump_to(&args, start_nanos, start_ticks, &mut out)?;
                out.flush()?;
                writeln!(writer, "Profile written to {path}")?;
                Ok(())
            }
            None => self.dump_to(&args, start_nanos, start_ticks, writer),
        }
    }

    fn dump_to(
        &self,
        args: &Arguments,
        start_nanos: u64,
        start_ticks: u64,
        out: &mut dyn Write,
    ) -> Result<()> {
        streamer::flush(self, args);

        // Collect and render every stack once.
        struct Aggregated {
            names: Vec<String>,
            kinds: Vec<FrameKind>,
            samples: u64,
            counter: u64,
        }
        let mut traces: Vec<Aggregated> = Vec::new();
        self.storage.collect_samples(|trace_id, frames, samples, counter| {
            let _ = trace_id;
            let mut names = Vec::with_capacity(frames.len() + 1);
            let mut kinds = Vec::with_capacity(frames.len() + 1);
            // Leaf-first in storage; reverse to root-first for rendering.
            for frame in frames.iter().rev() {
                names.push(self.frame_name(frame));
                kinds.push(Self::frame_kind(frame));
            }
            traces.push(Aggregated { names, kinds, samples, counter });
        });

        traces.retain(|trace| self.matches_filters(args, &trace.names));

        let use_total = args.total;
        let weight_of = |trace: &Aggregated| if use_total { trace.counter.max(trace.samples) } else { trace.samples };

        match args.output {
            Output::Collapsed => {
                let mut collapsed = CollapsedWriter::new(out);
                for trace in &traces {
                    let refs: Vec<&str> = trace.names.iter().map(String::as_str).collect();
                    collapsed.write_stack(&refs, weight_of(trace))?;
                }
                collapsed.finish()?;
            }
            Output::FlameGraph | Output::Tree => {
                let counter_kind = if use_total { Counter::Total } else { Counter::Samples };
                let mut graph = FlameGraph::new("asprof profile", counter_kind, 0.25, false);
                for trace in &traces {
                    let stack: Vec<(&str, FrameKind)> = trace
                        .names
                        .iter()
                        .map(String::as_str)
                        .zip(trace.kinds.iter().copied())
                        .collect();
                    graph.add_sample(&stack, weight_of(trace));
                }
                if args.output == Output::Tree {
                    graph.dump_tree(out)?;
                } else {
                    graph.dump(out)?;
                }
            }
            Output::Otlp => {
                let duration = tsc::ticks_to_nanos(tsc::ticks().saturating_sub(start_ticks));
                let mut profile = OtlpProfile::new(
                    args.primary_event(),
                    "samples",
                    args.interval as i64,
                    start_nanos as i64,
                    duration as i64,
                );
                for trace in &traces {
                    let leaf_first: Vec<&str> =
                        trace.names.iter().rev().map(String::as_str).collect();
                    profile.add_sample(&leaf_first, weight_of(trace) as i64);
                }
                profile.write_gzipped(out)?;
            }
            Output::Jfr => {
                self.dump_jfr(args, start_nanos, start_ticks, out)?;
            }
            Output::Text | Output::None => {
                traces.sort_by(|a, b| weight_of(b).cmp(&weight_of(a)));
                writeln!(out, "--- Execution profile ---")?;
                writeln!(out, "Total samples       : {}", self.counters.total.load(Ordering::Relaxed))?;
                for trace in traces.iter().take(200) {
                    writeln!(out, "\nSamples: {} ({} total)", trace.samples, trace.counter)?;
                    for (i, name) in trace.names.iter().rev().enumerate() {
                        writeln!(out, "  [{i:2}] {name}")?;
                    }
                }
            }
        }
        Ok(())
    }

    fn dump_jfr(
        &self,
        _args: &Arguments,
        start_nanos: u64,
        start_ticks: u64,
        out: &mut dyn Write,
    ) -> Result<()> {
        let mut chunk = JfrChunkWriter::new(start_nanos, start_ticks, tsc::frequency());

        for (tid, name) in self.thread_names.lock().iter() {
            chunk.set_thread(*tid, name);
        }

        self.storage.collect_traces(|trace_id, frames| {
            let jfr_frames: Vec<JfrStackFrame> = frames
                .iter()
                .map(|frame| {
                    let method = chunk.symbol(&self.frame_name(frame));
                    let (bci, frame_type) = if frame.is_symbol() {
                        (0, 3)
                    } else {
                        let (type_id, bci) = FrameTypeId::decode(frame.bci);
                        (bci, type_id as u8)
                    };
                    JfrStackFrame { method, bci, frame_type }
                })
                .collect();
            chunk.set_stack_trace(trace_id, jfr_frames);
        });

        self.class_map.collect(|_, name| {
            let _ = chunk.class(name);
        });

        // Per-thread order is publish order; restore a total order across
        // threads by timestamp before writing the chunk.
        let mut ordered = Vec::new();
        while let Some(buffered) = self.events.poll() {
            ordered.push((buffered.event.start_time(), buffered));
        }
        ordered.sort_by_key(|(start, _)| *start);

        for (_, buffered) in ordered {
            let jfr_event = match buffered.event {
                Event::Execution(e) => JfrEvent::ExecutionSample {
                    start_ticks: e.start_time,
                    tid: buffered.tid,
                    stack_trace: buffered.call_trace_id,
                    thread_state: 0,
                },
                Event::WallClock(e) => JfrEvent::WallClockSample {
                    start_ticks: e.start_time,
                    tid: buffered.tid,
                    stack_trace: buffered.call_trace_id,
                    thread_state: u8::from(e.thread_state == crate::os::ThreadState::Sleeping),
                    samples: e.samples,
                },
                Event::Alloc(e) => {
                    if buffered.event_type == EventType::AllocOutsideTlab {
                        JfrEvent::AllocationOutsideTlab {
                            start_ticks: e.start_time,
                            tid: buffered.tid,
                            stack_trace: buffered.call_trace_id,
                            class: e.class_id,
                            allocation_size: e.total_size,
                        }
                    } else {
                        JfrEvent::AllocationInNewTlab {
                            start_ticks: e.start_time,
                            tid: buffered.tid,
                            stack_trace: buffered.call_trace_id,
                            class: e.class_id,
                            instance_size: e.instance_size,
                            tlab_size: e.total_size,
                        }
                    }
                }
                Event::Lock(e) => {
                    if buffered.event_type == EventType::ParkSample {
                        JfrEvent::ThreadPark {
                            start_ticks: e.start_time,
                            duration_ticks: e.end_time - e.start_time,
                            tid: buffered.tid,
                            stack_trace: buffered.call_trace_id,
                            class: e.class_id,
                            timeout_ns: e.timeout,
                            address: e.address,
                        }
                    } else {
                        JfrEvent::MonitorEnter {
                            start_ticks: e.start_time,
                            duration_ticks: e.end_time - e.start_time,
                            tid: buffered.tid,
                            stack_trace: buffered.call_trace_id,
                            class: e.class_id,
                            address: e.address,
                        }
                    }
                }
                Event::LiveObject(e) => JfrEvent::LiveObject {
                    start_ticks: e.start_time,
                    tid: buffered.tid,
                    stack_trace: buffered.call_trace_id,
                    class: e.class_id,
                    allocation_size: e.alloc_size,
                    allocation_ticks: e.alloc_time,
                },
                Event::Malloc(e) => JfrEvent::Malloc {
                    start_ticks: e.start_time,
                    tid: buffered.tid,
                    stack_trace: buffered.call_trace_id,
                    address: e.address,
                    size: e.size,
                },
                Event::Free(e) => JfrEvent::Free {
                    start_ticks: e.start_time,
                    tid: buffered.tid,
                    stack_trace: buffered.call_trace_id,
                    address: e.address,
                },
                Event::Window(e) => JfrEvent::ProfilingWindow {
                    start_ticks: e.start_time,
                    end_ticks: e.end_time,
                },
                Event::ProcessSnapshot(e) => JfrEvent::ProcessSample {
                    start_ticks: e.start_time,
                    pid: e.pid,
                    cpu_permille: e.cpu_permille,
                    rss_bytes: e.rss_bytes,
                    name: String::new(),
                },
            };
            chunk.write_event(&jfr_event);
        }

        let duration = tsc::ticks_to_nanos(tsc::ticks().saturating_sub(start_ticks));
        chunk
            .finish(out, duration)
            .map_err(|e| ProfilerError::failed(format!("JFR write failed: {e}")))?;
        Ok(())
    }

    pub fn status(&self, writer: &mut dyn Write) -> Result<()> {
        let control = self.control.lock();
        if control.running {
            let engines: Vec<&str> = control.engines.iter().map(|e| e.type_name()).collect();
            writeln!(writer, "Profiler is active. Engines: {}", engines.join(", "))?;
        } else {
            writeln!(writer, "Profiler is not active.")?;
        }
        let total = self.counters.total.load(Ordering::Relaxed).max(1);
        writeln!(writer, "Samples total        : {}", self.counters.total.load(Ordering::Relaxed))?;
        for (label, counter) in [
            ("No thread record", &self.counters.dropped_no_thread),
            ("Handler reentry", &self.counters.dropped_reentry),
            ("Context filtered", &self.counters.dropped_filtered),
            ("Buffer full", &self.counters.dropped_buffer),
            ("Failed unwinds", &self.counters.failed_unwinds),
        ] {
            let value = counter.load(Ordering::Relaxed);
            if value > 0 {
                writeln!(
                    writer,
                    "{label:<21}: {value} ({:.2}%)",
                    value as f64 * 100.0 / total as f64
                )?;
            }
        }
        let overflow = self.storage.overflow_count();
        if overflow > 0 {
            writeln!(writer, "Trace store overflow : {overflow}")?;
        }
        writeln!(writer, "Storage used         : {} bytes", self.storage.used_memory())?;
        Ok(())
    }

    pub fn list(&self, writer: &mut dyn Write) -> Result<()> {
        writeln!(writer, "Basic events:")?;
        for event in ["cpu", "itimer", "wall", "alloc", "lock", "nativemem"] {
            writeln!(writer, "  {event}")?;
        }
        if self.runtime_library().is_some() {
            writeln!(writer, "Java method events:")?;
            writeln!(writer, "  ClassName.methodName")?;
        }
        Ok(())
    }

    pub fn running(&self) -> bool {
        self.control.lock().running
    }

    // Accessors for the output plug-ins.

    pub fn storage(&self) -> &CallTraceStorage {
        &self.storage
    }

    pub fn symbols(&self) -> &Dictionary {
        &self.symbols
    }

    pub fn class_map(&self) -> &Dictionary {
        &self.class_map
    }

    pub fn render_frame(&self, frame: &Frame) -> String {
        self.frame_name(frame)
    }
}

/// Whether the current thread is inside the sampling path; consulted by the
/// crash handler before skipping a faulted instruction.
pub fn in_signal_handler() -> bool {
    let record = thread::current();
    !record.is_null() && unsafe { (*record).in_handler() }
}

/// Begin/end gate: hitting the begin symbol opens the profiling window,
/// hitting the end symbol closes it. The trapped thread continues by
/// simulated return.
unsafe fn gate_trap_hook(
    pc: usize,
    _siginfo: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) -> bool {
    let begin = BEGIN_ENTRY.load(Ordering::Relaxed) as usize;
    let end = END_ENTRY.load(Ordering::Relaxed) as usize;
    let word = std::mem::size_of::<crate::trap::Instruction>();

    if begin != 0 && pc.wrapping_sub(begin) <= word {
        let mut frame = StackFrame::new(ucontext);
        frame.ret();
        let profiler = Profiler::instance();
        profiler.thread_filter.add(thread::current_tid());
        engines::enable_events(true);
        return true;
    }
    if end != 0 && pc.wrapping_sub(end) <= word {
        let mut frame = StackFrame::new(ucontext);
        frame.ret();
        engines::enable_events(false);
        let profiler = Profiler::instance();
        let event = Event::Window(WindowEvent {
            start_time: 0,
            end_time: tsc::ticks(),
        });
        profiler.events.publish(EventType::ProfilingWindow, event, thread::current_tid(), 0);
        return true;
    }
    false
}

/// Loop-mode rotation: dump and restart on a timer. Driven by the control
/// plane when `loop=` was given.
pub fn run_loop_rotation(args: Arguments) {
    let Some(interval) = args.loop_interval else { return };
    std::thread::Builder::new()
        .name("asprof-loop".to_owned())
        .spawn(move || {
            let profiler = Profiler::instance();
            while profiler.running() {
                std::thread::sleep(Duration::from_nanos(interval));
                if !profiler.running() {
                    break;
                }
                let mut sink = Vec::new();
                if let Err(err) = profiler.dump_session(&mut sink) {
                    warn!("loop rotation dump failed: {err}");
                }
            }
        })
        .ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_inactive() {
        let profiler = Profiler::instance();
        let mut out = Vec::new();
        profiler.status(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Profiler is"));
    }

    #[test]
    fn execute_rejects_bad_command() {
        let profiler = Profiler::instance();
        let mut out = Vec::new();
        let err = profiler.execute("bogus_token", &mut out).unwrap_err();
        assert_eq!(err.exit_code(), 100);
    }

    #[test]
    fn execute_stop_without_start_fails() {
        let profiler = Profiler::instance();
        let mut out = Vec::new();
        let err = profiler.execute("stop", &mut out).unwrap_err();
        assert_eq!(err.exit_code(), 200);
    }

    #[test]
    fn class_id_strips_jni_signature() {
        let profiler = Profiler::instance();
        let a = profiler.class_id("Ljava/lang/String;");
        let b = profiler.class_id("java/lang/String");
        assert_eq!(a, b);
    }

    #[test]
    fn compiled_method_regions_resolve_addresses() {
        let profiler = Profiler::instance();
        profiler.compiled_method_load("com.example.Main.run", 0x7000_0000, 0x400);
        assert_eq!(
            profiler.jit_method_name(0x7000_0123).as_deref(),
            Some("com.example.Main.run")
        );
        assert_eq!(profiler.jit_method_name(0x7000_0400), None);
        profiler.class_load("Lcom/example/Main;");
        assert_ne!(profiler.class_id("com/example/Main"), 0);
    }

    #[test]
    fn glob_filters() {
        let profiler = Profiler::instance();
        let mut args = Arguments::default();
        args.include.push("java/*".to_owned());
        assert!(profiler.matches_filters(&args, &["java/lang/String.length".to_owned()]));
        assert!(!profiler.matches_filters(&args, &["sun/misc/Unsafe.park".to_owned()]));
        args.exclude.push("*length".to_owned());
        assert!(!profiler.matches_filters(&args, &["java/lang/String.length".to_owned()]));
    }
}
