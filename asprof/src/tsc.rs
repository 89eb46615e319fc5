//! Timestamp source for sample records.
//!
//! Prefers the hardware cycle counter (rdtsc / cntvct_el0) calibrated once
//! against the monotonic clock; falls back to `clock_gettime` where no stable
//! counter is available. Reading ticks is async-signal-safe on both paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::os;

const NANOTIME_FREQ: u64 = 1_000_000_000;

static ENABLED: AtomicBool = AtomicBool::new(false);
static OFFSET: AtomicU64 = AtomicU64::new(0);
static FREQUENCY: AtomicU64 = AtomicU64::new(NANOTIME_FREQ);

#[cfg(target_arch = "x86_64")]
#[inline]
fn rdtsc() -> u64 {
    unsafe { core::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "aarch64")]
#[inline]
fn rdtsc() -> u64 {
    let ticks: u64;
    unsafe {
        core::arch::asm!("mrs {}, cntvct_el0", out(reg) ticks, options(nomem, nostack));
    }
    ticks
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline]
fn rdtsc() -> u64 {
    os::nanotime()
}

#[cfg(target_arch = "aarch64")]
fn counter_frequency() -> u64 {
    let freq: u64;
    unsafe {
        core::arch::asm!("mrs {}, cntfrq_el0", out(reg) freq, options(nomem, nostack));
    }
    freq
}

#[cfg(target_arch = "x86_64")]
fn counter_frequency() -> u64 {
    // Calibrate the TSC against the monotonic clock over a short window.
    let t0 = os::nanotime();
    let c0 = rdtsc();
    os::sleep_nanos(10_000_000);
    let t1 = os::nanotime();
    let c1 = rdtsc();
    if t1 <= t0 {
        return 0;
    }
    (c1 - c0) * NANOTIME_FREQ / (t1 - t0)
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn counter_frequency() -> u64 {
    0
}

/// Which clock `ticks()` should read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clock {
    Tsc,
    Monotonic,
}

pub fn enable(clock: Clock) {
    if clock == Clock::Monotonic {
        ENABLED.store(false, Ordering::Relaxed);
        return;
    }
    let frequency = counter_frequency();
    if frequency > NANOTIME_FREQ / 2 {
        // Rebase the counter so tick values stay comparable to nanotime-based
        // timestamps recorded before enabling.
        FREQUENCY.store(frequency, Ordering::Relaxed);
        OFFSET.store(rdtsc().wrapping_sub(os::nanotime()), Ordering::Relaxed);
        ENABLED.store(true, Ordering::Release);
    } else {
        ENABLED.store(false, Ordering::Relaxed);
    }
}

#[inline]
pub fn ticks() -> u64 {
    if ENABLED.load(Ordering::Acquire) {
        rdtsc().wrapping_sub(OFFSET.load(Ordering::Relaxed))
    } else {
        os::nanotime()
    }
}

pub fn frequency() -> u64 {
    if ENABLED.load(Ordering::Acquire) {
        FREQUENCY.load(Ordering::Relaxed)
    } else {
        NANOTIME_FREQ
    }
}

pub fn ticks_to_nanos(ticks: u64) -> u64 {
    let freq = frequency();
    if freq == NANOTIME_FREQ {
        ticks
    } else {
        (ticks as u128 * NANOTIME_FREQ as u128 / freq as u128) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_monotonic() {
        let a = ticks();
        let b = ticks();
        assert!(b >= a);
    }

    #[test]
    fn nanos_conversion_is_identity_without_tsc() {
        ENABLED.store(false, Ordering::Relaxed);
        assert_eq!(ticks_to_nanos(123456), 123456);
    }
}
