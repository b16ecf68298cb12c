//! Cycle-counter timekeeping.
//!
//! Session management timestamps use the CPU timestamp counter scaled by a
//! frequency measured once per process. The retry sweep does not need
//! microsecond accuracy, so a short calibration loop is sufficient.

use std::time::Duration;

use minstant::Instant;

/// Read the CPU timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Measure the timestamp counter frequency in GHz.
///
/// Spins for ~10 ms against a wall clock. On architectures where [`rdtsc`]
/// falls back to nanosecond ticks this measures ~1.0.
pub fn measure_freq_ghz() -> f64 {
    let start_cycles = rdtsc();
    let start = Instant::now();
    while start.elapsed() < Duration::from_millis(10) {
        std::hint::spin_loop();
    }
    let elapsed_cycles = rdtsc().wrapping_sub(start_cycles);
    let elapsed_ns = start.elapsed().as_nanos() as u64;
    elapsed_cycles as f64 / elapsed_ns as f64
}

/// Convert a cycle count to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e9)
}

/// Convert a cycle count to milliseconds.
#[inline]
pub fn to_ms(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e6)
}

/// Convert a cycle count to microseconds.
#[inline]
pub fn to_usec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e3)
}
