//! Process sampler: periodic `/proc` snapshots of processes that matter.
//!
//! A process is included when it uses at least 5% of a CPU or 5% of RAM.
//! CPU usage is computed against per-pid history from the previous cycle;
//! history of exited processes is dropped every cycle.

use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use rustc_hash::FxHashMap;

use crate::args::Arguments;
use crate::error::{ProfilerError, Result};
use crate::event::{Event, EventType, ProcessSnapshotEvent};
use crate::os;
use crate::profiler::Profiler;
use crate::tsc;

use super::Engine;

const MIN_CPU_THRESHOLD: f32 = 0.05;
const MIN_RSS_THRESHOLD: f64 = 0.05;
const MAX_PROCESSES: usize = 4096;

#[derive(Default, Clone, Copy)]
struct ProcessHistory {
    prev_cpu_total: u64,
    prev_timestamp: u64,
    start_time: u64,
}

struct Sampler {
    history: FxHashMap<i32, ProcessHistory>,
    clock_ticks_per_sec: u64,
    ram_size: u64,
}

impl Sampler {
    fn new() -> Sampler {
        Sampler {
            history: FxHashMap::default(),
            clock_ticks_per_sec: unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64,
            ram_size: os::ram_size(),
        }
    }

    fn cpu_percent(&mut self, info: &os::ProcessInfo, now: u64) -> Option<f32> {
        let cpu_total_ns =
            (info.cpu_user + info.cpu_system) * 1_000_000_000 / self.clock_ticks_per_sec;
        let history = self.history.entry(info.pid).or_default();
        if history.prev_timestamp == 0 || history.start_time != info.start_time {
            history.prev_cpu_total = cpu_total_ns;
            history.prev_timestamp = now;
            history.start_time = info.start_time;
            return None;
        }
        let delta_cpu = cpu_total_ns.saturating_sub(history.prev_cpu_total);
        let delta_time = now.saturating_sub(history.prev_timestamp).max(1);
        history.prev_cpu_total = cpu_total_ns;
        history.prev_timestamp = now;
        Some(delta_cpu as f32 / delta_time as f32)
    }

    fn rss_ratio(&self, info: &os::ProcessInfo) -> f64 {
        if self.ram_size == 0 || info.vm_rss == 0 {
            return 0.0;
        }
        info.vm_rss as f64 / self.ram_size as f64
    }

    fn cycle(&mut self) {
        let now = os::nanotime();
        let pids = os::process_ids(MAX_PROCESSES);

        // Forget processes that exited since the previous cycle.
        self.history.retain(|pid, _| pids.contains(pid));

        let profiler = Profiler::instance();
        for pid in pids {
            let Some(mut info) = os::basic_process_info(pid) else {
                continue;
            };
            let Some(cpu) = self.cpu_percent(&info, now) else {
                continue;
            };
            info.cpu_percent = cpu;
            if cpu < MIN_CPU_THRESHOLD && self.rss_ratio(&info) < MIN_RSS_THRESHOLD {
                continue;
            }
            let event = Event::ProcessSnapshot(ProcessSnapshotEvent {
                start_time: tsc::ticks(),
                pid,
                cpu_permille: (cpu * 1000.0) as u32,
                rss_bytes: info.vm_rss,
            });
            profiler.record_external_samples(1, 0, pid, 0, EventType::ProcessSample, &event);
        }
    }
}

fn sampler_loop(interval_nanos: u64, stop: Receiver<()>) {
    let mut sampler = Sampler::new();
    loop {
        sampler.cycle();
        match stop.recv_timeout(Duration::from_nanos(interval_nanos)) {
            Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
        }
    }
}

#[derive(Default)]
pub struct ProcessSampler {
    worker: Option<(Sender<()>, JoinHandle<()>)>,
}

impl Engine for ProcessSampler {
    fn type_name(&self) -> &'static str {
        "process_sampler"
    }

    fn title(&self) -> &'static str {
        "Process activity"
    }

    fn units(&self) -> &'static str {
        "samples"
    }

    fn start(&mut self, args: &Arguments) -> Result<()> {
        let interval = args.proc.unwrap_or(crate::args::DEFAULT_PROC_INTERVAL).max(1_000_000);
        let (sender, receiver) = bounded(1);
        let handle = std::thread::Builder::new()
            .name("asprof-proc".to_owned())
            .spawn(move || sampler_loop(interval, receiver))
            .map_err(|e| ProfilerError::install(format!("cannot start process sampler: {e}")))?;
        self.worker = Some((sender, handle));
        Ok(())
    }

    fn stop(&mut self) {
        if let Some((sender, handle)) = self.worker.take() {
            let _ = sender.send(());
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_cycle_produces_cpu_percent() {
        let mut sampler = Sampler::new();
        let info = os::basic_process_info(os::process_id()).unwrap();
        let t0 = os::nanotime();
        assert!(sampler.cpu_percent(&info, t0).is_none());
        let later = os::basic_process_info(os::process_id()).unwrap();
        let cpu = sampler.cpu_percent(&later, t0 + 1_000_000_000).unwrap();
        assert!(cpu >= 0.0);
    }

    #[test]
    fn history_drops_dead_pids() {
        let mut sampler = Sampler::new();
        sampler.history.insert(-42, ProcessHistory::default());
        sampler.cycle();
        assert!(!sampler.history.contains_key(&-42));
    }
}
