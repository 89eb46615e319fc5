//! The textual command surface: a comma-separated token list such as
//! `start,event=cpu,interval=10ms,file=profile.html`. Every control-plane
//! entry point (attach, C API, preload autostart) funnels through
//! [`Arguments::parse`].

use std::time::Duration;

use bitflags::bitflags;

use crate::error::{ProfilerError, Result};
use crate::os;

pub const DEFAULT_INTERVAL: u64 = 10_000_000; // 10 ms
pub const DEFAULT_ALLOC_INTERVAL: u64 = 524_287;
pub const DEFAULT_NATIVEMEM_INTERVAL: u64 = 0; // every malloc
pub const DEFAULT_PROC_INTERVAL: u64 = 5_000_000_000;
pub const DEFAULT_JSTACKDEPTH: usize = 2048;
pub const MAX_STACK_DEPTH: usize = 2048;

pub const EVENT_CPU: &str = "cpu";
pub const EVENT_WALL: &str = "wall";
pub const EVENT_ALLOC: &str = "alloc";
pub const EVENT_LOCK: &str = "lock";
pub const EVENT_ITIMER: &str = "itimer";
pub const EVENT_NOOP: &str = "noop";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    None,
    Start,
    Resume,
    Stop,
    Dump,
    Status,
    List,
    Version,
}

/// Native unwind mode (`cstack=`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CStack {
    #[default]
    Default,
    FramePointer,
    Dwarf,
    Lbr,
    Vm,
    No,
}

/// Output format, from `format=` or inferred from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Output {
    #[default]
    None,
    Text,
    Collapsed,
    FlameGraph,
    Tree,
    Jfr,
    Otlp,
}

/// What the aggregated value counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CounterKind {
    #[default]
    Samples,
    Total,
}

bitflags! {
    /// Frame-name rendering style.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Style: u32 {
        const SIMPLE     = 0x1;
        const DOTTED     = 0x2;
        const SIGNATURES = 0x4;
        const ANNOTATE   = 0x8;
        const LIB_NAMES  = 0x10;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    None,
}

#[derive(Debug, Clone, Default)]
pub struct Arguments {
    pub action: Action,
    pub event: Option<String>,
    pub interval: u64,
    pub wall: Option<u64>,
    pub alloc: Option<u64>,
    pub lock: Option<u64>,
    pub nativemem: Option<u64>,
    pub proc: Option<u64>,
    pub cstack: CStack,
    pub jstackdepth: usize,
    pub threads: bool,
    pub sched: bool,
    pub live: bool,
    pub nobatch: bool,
    pub total: bool,
    pub style: Style,
    pub file: Option<String>,
    pub loop_interval: Option<u64>,
    pub output: Output,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub begin: Option<String>,
    pub end: Option<String>,
    pub loglevel: Option<LogLevel>,
    pub log: Option<String>,
    pub server: Option<String>,
}

fn split_value(token: &str) -> (&str, Option<&str>) {
    match token.split_once('=') {
        Some((name, value)) => (name, Some(value)),
        None => (token, None),
    }
}

fn require<'t>(name: &str, value: Option<&'t str>) -> Result<&'t str> {
    value.filter(|v| !v.is_empty()).ok_or_else(|| {
        ProfilerError::invalid(format!("missing value for '{name}'"))
    })
}

/// Parses a duration token into nanoseconds. Accepts humantime-style
/// suffixed values (`10ms`, `2s`, `1m`) and bare numbers, which are taken
/// as the unit the original tool used for this option.
fn parse_duration(name: &str, value: &str, bare_unit_nanos: u64) -> Result<u64> {
    if let Ok(n) = value.parse::<u64>() {
        return Ok(n * bare_unit_nanos);
    }
    match humantime::parse_duration(value) {
        Ok(duration) if duration <= Duration::from_secs(3600 * 24) => {
            Ok(duration.as_nanos() as u64)
        }
        Ok(_) => Err(ProfilerError::invalid(format!("'{name}' is too large"))),
        Err(_) => Err(ProfilerError::invalid(format!("invalid duration '{value}' for '{name}'"))),
    }
}

/// Parses a byte-count token: bare number, or `k`/`m`/`g` suffix.
fn parse_bytes(name: &str, value: &str) -> Result<u64> {
    let (digits, multiplier) = match value.as_bytes().last() {
        Some(b'k') | Some(b'K') => (&value[..value.len() - 1], 1u64 << 10),
        Some(b'm') | Some(b'M') => (&value[..value.len() - 1], 1u64 << 20),
        Some(b'g') | Some(b'G') => (&value[..value.len() - 1], 1u64 << 30),
        _ => (value, 1),
    };
    digits
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| ProfilerError::invalid(format!("invalid byte count '{value}' for '{name}'")))
}

impl Arguments {
    pub fn parse(command: &str) -> Result<Arguments> {
        let mut args = Arguments {
            interval: DEFAULT_INTERVAL,
            jstackdepth: DEFAULT_JSTACKDEPTH,
            ..Arguments::default()
        };

        for token in command.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            let (name, value) = split_value(token);
            match name {
                "start" => args.action = Action::Start,
                "resume" => args.action = Action::Resume,
                "stop" => args.action = Action::Stop,
                "dump" => args.action = Action::Dump,
                "status" => args.action = Action::Status,
                "list" => args.action = Action::List,
                "version" => args.action = Action::Version,

                "event" => {
                    let value = require(name, value)?;
                    if args.event.is_some() {
                        return Err(ProfilerError::invalid("duplicate 'event' argument"));
                    }
                    args.event = Some(value.to_owned());
                }
                "interval" => {
                    args.interval = parse_duration(name, require(name, value)?, 1)?;
                    if args.interval == 0 {
                        return Err(ProfilerError::invalid("interval must be positive"));
                    }
                }
                "wall" => args.wall = Some(parse_duration(name, require(name, value)?, 1)?),
                "lock" => args.lock = Some(match value {
                    Some(v) if !v.is_empty() => parse_duration(name, v, 1)?,
                    _ => 0,
                }),
                "alloc" => args.alloc = Some(match value {
                    Some(v) if !v.is_empty() => parse_bytes(name, v)?,
                    _ => DEFAULT_ALLOC_INTERVAL,
                }),
                "nativemem" => args.nativemem = Some(match value {
                    Some(v) if !v.is_empty() => parse_bytes(name, v)?,
                    _ => DEFAULT_NATIVEMEM_INTERVAL,
                }),
                "proc" => args.proc = Some(match value {
                    Some(v) if !v.is_empty() => parse_duration(name, v, 1_000_000)?,
                    _ => DEFAULT_PROC_INTERVAL,
                }),

                "cstack" => {
                    args.cstack = match require(name, value)? {
                        "fp" => CStack::FramePointer,
                        "dwarf" => CStack::Dwarf,
                        "lbr" => CStack::Lbr,
                        "vm" => CStack::Vm,
                        "no" => CStack::No,
                        other => {
                            return Err(ProfilerError::invalid(format!("invalid cstack mode '{other}'")))
                        }
                    }
                }
                "jstackdepth" => {
                    let depth: usize = require(name, value)?
                        .parse()
                        .map_err(|_| ProfilerError::invalid("invalid jstackdepth"))?;
                    if depth == 0 || depth > MAX_STACK_DEPTH {
                        return Err(ProfilerError::invalid(format!(
                            "jstackdepth must be between 1 and {MAX_STACK_DEPTH}"
                        )));
                    }
                    args.jstackdepth = depth;
                }

                "threads" => args.threads = true,
                "sched" => args.sched = true,
                "live" => args.live = true,
                "nobatch" => args.nobatch = true,
                "total" => args.total = true,
                "simple" => args.style |= Style::SIMPLE,
                "dot" => args.style |= Style::DOTTED,
                "sig" => args.style |= Style::SIGNATURES,
                "ann" => args.style |= Style::ANNOTATE,
                "lib" => args.style |= Style::LIB_NAMES,

                "file" => args.file = Some(require(name, value)?.to_owned()),
                "loop" => {
                    args.loop_interval = Some(parse_duration(name, require(name, value)?, 1_000_000_000)?);
                    if args.action == Action::None {
                        args.action = Action::Start;
                    }
                }
                "format" => {
                    args.output = match require(name, value)? {
                        "text" | "summary" => Output::Text,
                        "collapsed" | "folded" => Output::Collapsed,
                        "flamegraph" | "html" => Output::FlameGraph,
                        "tree" => Output::Tree,
                        "jfr" => Output::Jfr,
                        "otlp" | "pprof" => Output::Otlp,
                        other => {
                            return Err(ProfilerError::invalid(format!("unknown format '{other}'")))
                        }
                    }
                }
                "collapsed" | "flamegraph" | "tree" | "jfr" => {
                    // Format names are also accepted as bare tokens.
                    args.output = match name {
                        "collapsed" => Output::Collapsed,
                        "flamegraph" => Output::FlameGraph,
                        "tree" => Output::Tree,
                        _ => Output::Jfr,
                    };
                }

                "include" => args.include.push(require(name, value)?.to_owned()),
                "exclude" => args.exclude.push(require(name, value)?.to_owned()),
                "begin" => args.begin = Some(require(name, value)?.to_owned()),
                "end" => args.end = Some(require(name, value)?.to_owned()),

                "loglevel" => {
                    args.loglevel = Some(match require(name, value)?.to_ascii_lowercase().as_str() {
                        "trace" => LogLevel::Trace,
                        "debug" => LogLevel::Debug,
                        "info" => LogLevel::Info,
                        "warn" | "warning" => LogLevel::Warn,
                        "error" => LogLevel::Error,
                        "none" => LogLevel::None,
                        other => {
                            return Err(ProfilerError::invalid(format!("invalid loglevel '{other}'")))
                        }
                    })
                }
                "log" => args.log = Some(require(name, value)?.to_owned()),
                "server" => args.server = Some(require(name, value)?.to_owned()),

                unknown => {
                    return Err(ProfilerError::invalid(format!("unknown argument '{unknown}'")))
                }
            }
        }

        if args.action == Action::None {
            return Err(ProfilerError::invalid("missing action"));
        }
        if args.output == Output::None {
            args.output = args.infer_output();
        }
        Ok(args)
    }

    fn infer_output(&self) -> Output {
        let Some(file) = &self.file else {
            return Output::Text;
        };
        let lower = file.to_ascii_lowercase();
        if lower.ends_with(".jfr") {
            Output::Jfr
        } else if lower.ends_with(".html") {
            Output::FlameGraph
        } else if lower.ends_with(".collapsed") || lower.ends_with(".folded") {
            Output::Collapsed
        } else if lower.ends_with(".pprof") || lower.ends_with(".pb") || lower.ends_with(".pb.gz") {
            Output::Otlp
        } else {
            Output::Text
        }
    }

    /// Expands `%p` (pid), `%t` (timestamp) and `%n` (sequence number) in
    /// the output file name.
    pub fn expanded_file(&self, sequence: u32) -> Option<String> {
        let file = self.file.as_ref()?;
        let mut out = String::with_capacity(file.len() + 16);
        let mut chars = file.chars().peekable();
        while let Some(ch) = chars.next() {
            if ch != '%' {
                out.push(ch);
                continue;
            }
            match chars.next() {
                Some('p') => out.push_str(&os::process_id().to_string()),
                Some('t') => out.push_str(&os::micros().to_string()),
                Some('n') => out.push_str(&sequence.to_string()),
                Some(other) => {
                    out.push('%');
                    out.push(other);
                }
                None => out.push('%'),
            }
        }
        Some(out)
    }

    /// The primary engine event, defaulting to CPU profiling.
    pub fn primary_event(&self) -> &str {
        self.event.as_deref().unwrap_or(EVENT_CPU)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_start_command() {
        let args = Arguments::parse("start,event=cpu,interval=1ms,file=out.collapsed").unwrap();
        assert_eq!(args.action, Action::Start);
        assert_eq!(args.event.as_deref(), Some("cpu"));
        assert_eq!(args.interval, 1_000_000);
        assert_eq!(args.output, Output::Collapsed);
    }

    #[test]
    fn bare_interval_number_is_nanoseconds() {
        let args = Arguments::parse("start,interval=500000").unwrap();
        assert_eq!(args.interval, 500_000);
    }

    #[test]
    fn alloc_accepts_byte_suffixes() {
        let args = Arguments::parse("start,alloc=512k").unwrap();
        assert_eq!(args.alloc, Some(512 * 1024));
        let args = Arguments::parse("start,alloc").unwrap();
        assert_eq!(args.alloc, Some(DEFAULT_ALLOC_INTERVAL));
        let args = Arguments::parse("start,nativemem=1m").unwrap();
        assert_eq!(args.nativemem, Some(1 << 20));
    }

    #[test]
    fn file_extension_selects_output() {
        for (file, output) in [
            ("x.jfr", Output::Jfr),
            ("x.html", Output::FlameGraph),
            ("x.collapsed", Output::Collapsed),
            ("x.pb.gz", Output::Otlp),
            ("x.txt", Output::Text),
        ] {
            let args = Arguments::parse(&format!("dump,file={file}")).unwrap();
            assert_eq!(args.output, output, "{file}");
        }
    }

    #[test]
    fn explicit_format_overrides_extension() {
        let args = Arguments::parse("dump,file=x.txt,format=flamegraph").unwrap();
        assert_eq!(args.output, Output::FlameGraph);
    }

    #[test]
    fn rejects_garbage() {
        assert!(Arguments::parse("bogus").is_err());
        assert!(Arguments::parse("start,event=").is_err());
        assert!(Arguments::parse("start,interval=0").is_err());
        assert!(Arguments::parse("start,interval=zzz").is_err());
        assert!(Arguments::parse("start,cstack=xyz").is_err());
        assert!(Arguments::parse("start,jstackdepth=0").is_err());
        assert!(Arguments::parse("").is_err());
        assert!(Arguments::parse("start,event=cpu,event=wall").is_err());
    }

    #[test]
    fn filename_substitutions() {
        let args = Arguments::parse("start,file=profile-%p-%n.jfr").unwrap();
        let expanded = args.expanded_file(3).unwrap();
        assert!(expanded.contains(&os::process_id().to_string()));
        assert!(expanded.ends_with("-3.jfr"));
        assert!(!expanded.contains('%'));
    }

    #[test]
    fn begin_end_and_filters() {
        let args = Arguments::parse(
            "start,begin=JVM_StartThread,end=JVM_StopThread,include=java/*,exclude=jdk/*",
        )
        .unwrap();
        assert_eq!(args.begin.as_deref(), Some("JVM_StartThread"));
        assert_eq!(args.end.as_deref(), Some("JVM_StopThread"));
        assert_eq!(args.include, vec!["java/*"]);
        assert_eq!(args.exclude, vec!["jdk/*"]);
    }

    #[test]
    fn loop_implies_start() {
        let args = Arguments::parse("loop=1m,file=x-%n.jfr").unwrap();
        assert_eq!(args.action, Action::Start);
        assert_eq!(args.loop_interval, Some(60_000_000_000));
    }

    #[test]
    fn wall_accepts_suffixed_durations() {
        let args = Arguments::parse("start,event=wall,wall=200us").unwrap();
        assert_eq!(args.wall, Some(200_000));
    }
}
