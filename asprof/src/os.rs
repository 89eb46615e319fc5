//! Thin wrappers over the OS facilities the profiler needs. Everything here
//! that may run on the sampling path (page allocation, tick reads, signal
//! sends) sticks to raw syscalls; nothing touches the process allocator.

use std::fs;
use std::io::Read;
use std::ptr;

pub const PAGE_SIZE: usize = 4096;
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Allocates zeroed pages directly from the OS. Async-signal-safe.
pub fn safe_alloc(size: usize) -> *mut u8 {
    let size = (size + PAGE_MASK) & !PAGE_MASK;
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        ptr::null_mut()
    } else {
        addr as *mut u8
    }
}

pub fn safe_free(addr: *mut u8, size: usize) {
    if !addr.is_null() {
        let size = (size + PAGE_MASK) & !PAGE_MASK;
        unsafe {
            libc::munmap(addr as *mut libc::c_void, size);
        }
    }
}

pub fn mprotect(addr: *mut u8, size: usize, prot: i32) -> bool {
    unsafe { libc::mprotect(addr as *mut libc::c_void, size, prot) == 0 }
}

/// The kernel thread id of the calling thread.
pub fn thread_id() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

pub fn process_id() -> i32 {
    unsafe { libc::getpid() }
}

/// Sends `signo` to one thread of this process.
pub fn send_signal_to_thread(tid: i32, signo: i32) -> bool {
    unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signo) == 0 }
}

/// Monotonic nanoseconds.
pub fn nanotime() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall-clock microseconds since the epoch.
pub fn micros() -> u64 {
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1000
}

/// CPU time consumed by the given thread, or 0 if the thread is gone.
/// `tid == 0` means the calling thread.
pub fn thread_cpu_time(tid: i32) -> u64 {
    let clock_id = if tid == 0 {
        libc::CLOCK_THREAD_CPUTIME_ID
    } else {
        // clock_id layout for clock_getcpuclockid(): bits 3+ carry the pid,
        // low bits select CPUCLOCK_SCHED for a thread clock.
        (!tid << 3) | 6
    };
    let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
    if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

pub fn sleep_nanos(nanos: u64) {
    let ts = libc::timespec {
        tv_sec: (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    };
    unsafe {
        libc::nanosleep(&ts, ptr::null_mut());
    }
}

/// Upper bound for thread ids on this system.
pub fn max_thread_id() -> i32 {
    match fs::read_to_string("/proc/sys/kernel/pid_max") {
        Ok(s) => s.trim().parse().unwrap_or(65536),
        Err(_) => 65536,
    }
}

pub fn ram_size() -> u64 {
    let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
    if unsafe { libc::sysinfo(&mut info) } == 0 {
        info.totalram as u64 * info.mem_unit as u64
    } else {
        0
    }
}

/// Thread ids of this process, read from `/proc/self/task`. The listing is
/// re-read on [`ThreadList::update`]; iteration order is the directory order.
pub struct ThreadList {
    tids: Vec<i32>,
    index: usize,
}

impl ThreadList {
    pub fn new() -> Self {
        let mut list = ThreadList { tids: Vec::new(), index: 0 };
        list.update();
        list
    }

    pub fn update(&mut self) {
        self.tids.clear();
        self.index = 0;
        if let Ok(entries) = fs::read_dir("/proc/self/task") {
            for entry in entries.flatten() {
                if let Ok(tid) = entry.file_name().to_string_lossy().parse() {
                    self.tids.push(tid);
                }
            }
        }
    }

    pub fn next(&mut self) -> Option<i32> {
        let tid = self.tids.get(self.index).copied();
        if tid.is_some() {
            self.index += 1;
        }
        tid
    }

    pub fn has_next(&self) -> bool {
        self.index < self.tids.len()
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn count(&self) -> usize {
        self.tids.len()
    }
}

impl Default for ThreadList {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling state of a thread as reported by `/proc/<tid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Running,
    Sleeping,
    Unknown,
}

pub fn thread_state(tid: i32) -> ThreadState {
    let path = format!("/proc/self/task/{tid}/stat");
    let mut buf = String::new();
    if fs::File::open(path)
        .and_then(|mut f| f.read_to_string(&mut buf))
        .is_err()
    {
        return ThreadState::Unknown;
    }
    // The state letter follows the parenthesized comm field.
    match buf.rfind(')') {
        Some(pos) => match buf[pos + 1..].trim_start().chars().next() {
            Some('R') => ThreadState::Running,
            Some(_) => ThreadState::Sleeping,
            None => ThreadState::Unknown,
        },
        None => ThreadState::Unknown,
    }
}

/// Basic per-process accounting for the process sampler.
#[derive(Debug, Default, Clone)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    pub start_time: u64,
    pub cpu_user: u64,
    pub cpu_system: u64,
    pub vm_rss: u64,
    pub cpu_percent: f32,
}

/// All currently running process ids.
pub fn process_ids(limit: usize) -> Vec<i32> {
    let mut pids = Vec::new();
    if let Ok(entries) = fs::read_dir("/proc") {
        for entry in entries.flatten() {
            if pids.len() >= limit {
                break;
            }
            if let Ok(pid) = entry.file_name().to_string_lossy().parse() {
                pids.push(pid);
            }
        }
    }
    pids
}

pub fn basic_process_info(pid: i32) -> Option<ProcessInfo> {
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let open = stat.find('(')?;
    let close = stat.rfind(')')?;
    let name = stat[open + 1..close].to_owned();
    let fields: Vec<&str> = stat[close + 1..].split_whitespace().collect();
    // Fields after comm/state: utime is field 11, stime 12, starttime 19,
    // rss 21 (0-based within the remainder, state being field 0).
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let start_time: u64 = fields.get(19)?.parse().ok()?;
    let rss_pages: u64 = fields.get(21)?.parse().ok()?;
    Some(ProcessInfo {
        pid,
        name,
        start_time,
        cpu_user: utime,
        cpu_system: stime,
        vm_rss: rss_pages * PAGE_SIZE as u64,
        cpu_percent: 0.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_alloc_returns_zeroed_writable_pages() {
        let p = safe_alloc(8192);
        assert!(!p.is_null());
        unsafe {
            assert_eq!(*p, 0);
            *p = 42;
            assert_eq!(*p, 42);
        }
        safe_free(p, 8192);
    }

    #[test]
    fn thread_list_contains_self() {
        let mut list = ThreadList::new();
        let self_tid = thread_id();
        let mut found = false;
        while let Some(tid) = list.next() {
            found |= tid == self_tid;
        }
        assert!(found);
    }

    #[test]
    fn own_cpu_time_advances() {
        let before = thread_cpu_time(0);
        let mut x = 0u64;
        for i in 0..5_000_000u64 {
            x = x.wrapping_add(i * i);
        }
        std::hint::black_box(x);
        assert!(thread_cpu_time(0) > before);
    }

    #[test]
    fn own_process_info_is_readable() {
        let info = basic_process_info(process_id()).unwrap();
        assert_eq!(info.pid, process_id());
        assert!(info.vm_rss > 0);
    }
}
