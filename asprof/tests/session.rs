//! End-to-end profiling sessions against this test process.
//!
//! These run in one process against the singleton profiler, so the flow is
//! sequential inside each test and the tests avoid overlapping sessions.

use std::io::Read;
use std::time::{Duration, Instant};

use asprof::profiler::Profiler;
use asprof_formats::{parse_chunk, parse_collapsed, JfrEvent};

// The profiler is a process-wide singleton; sessions must not overlap even
// when the harness schedules these tests on different threads.
static SESSION_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

fn burn_cpu(duration: Duration) -> u64 {
    let deadline = Instant::now() + duration;
    let mut acc = 0u64;
    while Instant::now() < deadline {
        for i in 0..10_000u64 {
            acc = acc.wrapping_mul(6364136223846793005).wrapping_add(i);
        }
        std::hint::black_box(acc);
    }
    acc
}

#[test]
fn cpu_session_produces_collapsed_stacks() {
    let _guard = SESSION_LOCK.lock();
    let profiler = Profiler::instance();
    profiler.init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cpu.collapsed");

    let mut out = Vec::new();
    profiler
        .execute("start,event=itimer,interval=5ms,cstack=dwarf", &mut out)
        .expect("start");

    burn_cpu(Duration::from_millis(500));

    profiler.execute("stop", &mut out).expect("stop");
    profiler
        .execute(&format!("dump,file={}", path.display()), &mut out)
        .expect("dump");

    let file = std::fs::File::open(&path).expect("output file");
    let stacks = parse_collapsed(std::io::BufReader::new(file)).expect("parse collapsed");
    let total: u64 = stacks.values().sum();
    assert!(
        total >= 1,
        "expected at least one CPU sample over 500ms of spinning"
    );
}

#[test]
fn native_memory_session_balances_malloc_and_free() {
    let _guard = SESSION_LOCK.lock();
    let profiler = Profiler::instance();
    profiler.init();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("native.jfr");

    let mut out = Vec::new();
    profiler
        .execute("start,event=noop,nativemem=10000", &mut out)
        .expect("start nativemem");

    // One large allocation, sampled with certainty, and its free.
    let size = 1_999_993usize;
    let ptr = unsafe { libc::malloc(size) };
    assert!(!ptr.is_null());
    unsafe { libc::free(ptr) };

    profiler.execute("stop", &mut out).expect("stop");
    profiler
        .execute(&format!("dump,file={}", path.display()), &mut out)
        .expect("dump");

    let mut bytes = Vec::new();
    std::fs::File::open(&path)
        .unwrap()
        .read_to_end(&mut bytes)
        .unwrap();
    let chunk = parse_chunk(&bytes).expect("parse jfr chunk");

    let mallocs: Vec<u64> = chunk
        .events
        .iter()
        .filter_map(|event| match event {
            JfrEvent::Malloc { address, size, .. } if *size == 1_999_993 => Some(*address),
            _ => None,
        })
        .collect();
    assert!(!mallocs.is_empty(), "expected a sampled malloc event");

    let freed: Vec<u64> = chunk
        .events
        .iter()
        .filter_map(|event| match event {
            JfrEvent::Free { address, .. } => Some(*address),
            _ => None,
        })
        .collect();
    assert!(
        mallocs.iter().any(|address| freed.contains(address)),
        "expected a free event matching the sampled malloc address"
    );
}

#[test]
fn status_and_list_are_always_available() {
    let profiler = Profiler::instance();
    profiler.init();

    let mut out = Vec::new();
    profiler.execute("status", &mut out).expect("status");
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Profiler is"));

    let mut out = Vec::new();
    profiler.execute("list", &mut out).expect("list");
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("cpu"));
    assert!(text.contains("nativemem"));
}

#[test]
fn double_start_is_rejected() {
    let _guard = SESSION_LOCK.lock();
    let profiler = Profiler::instance();
    profiler.init();

    let mut out = Vec::new();
    profiler
        .execute("start,event=itimer,interval=100ms", &mut out)
        .expect("first start");
    let err = profiler
        .execute("start,event=itimer", &mut out)
        .expect_err("second start must fail");
    assert_eq!(err.exit_code(), 200);
    profiler.execute("stop", &mut out).expect("stop");
}
