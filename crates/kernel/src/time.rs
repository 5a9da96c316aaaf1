//! Time and Timestamp Utilities

use core::sync::atomic::{AtomicU64, Ordering};

/// Timebase frequency of the platform counter (QEMU virt: 10 MHz).
/// Overridden from the device tree when available.
static TIMEBASE_FREQ: AtomicU64 = AtomicU64::new(10_000_000);

static BOOT_TIMESTAMP_US: AtomicU64 = AtomicU64::new(0);

pub fn set_timebase_freq(hz: u64) {
    if hz > 0 {
        TIMEBASE_FREQ.store(hz, Ordering::Relaxed);
    }
}

pub fn timebase_freq() -> u64 {
    TIMEBASE_FREQ.load(Ordering::Relaxed)
}

/// Get current timestamp in microseconds.
/// Uses the `time` CSR on RISC-V.
pub fn get_timestamp_us() -> u64 {
    #[cfg(target_arch = "riscv64")]
    {
        let cycles = crate::arch::read_time();
        let freq = timebase_freq();
        (cycles as u128 * 1_000_000 / freq as u128) as u64
    }

    #[cfg(not(target_arch = "riscv64"))]
    {
        // Fallback for hosted builds: a monotonic fake clock
        static FAKE_US: AtomicU64 = AtomicU64::new(0);
        FAKE_US.fetch_add(1, Ordering::Relaxed)
    }
}

/// Initialize boot timestamp
pub fn init_boot_timestamp() {
    BOOT_TIMESTAMP_US.store(get_timestamp_us(), Ordering::Relaxed);
}

/// Get time since boot in microseconds
pub fn get_time_since_boot_us() -> u64 {
    let current = get_timestamp_us();
    let boot = BOOT_TIMESTAMP_US.load(Ordering::Relaxed);
    current.saturating_sub(boot)
}

/// Get time since boot in milliseconds
pub fn get_time_since_boot_ms() -> u64 {
    get_time_since_boot_us() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic() {
        let a = get_timestamp_us();
        let b = get_timestamp_us();
        assert!(b >= a);
    }
}
