//! Clock adapters.
//!
//! [`Clock`] is the seam between the time module and the platform:
//! a monotonic millisecond counter plus the wall clock (epoch seconds,
//! 0 while unset). The system clock wraps the ESP high-resolution timer
//! on-target and `std::time` on the host; [`SimClock`] is a fully
//! scripted clock for tests.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic + wall time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since boot (monotonic).
    fn monotonic_ms(&self) -> u64;

    /// Current epoch seconds (UTC), 0 when the wall clock is unset.
    fn wall_epoch(&self) -> u64;

    /// Install a freshly synced wall time.
    fn set_wall_epoch(&self, epoch: u64);
}

/// Platform clock.
pub struct SystemClock {
    #[cfg(not(target_os = "espidf"))]
    start: std::time::Instant,
    /// Offset applied on top of the monotonic clock once synced.
    /// On-target the system RTC is set instead and this stays unused.
    #[cfg(not(target_os = "espidf"))]
    wall_base: AtomicU64,
    #[cfg(not(target_os = "espidf"))]
    wall_base_mono_ms: AtomicU64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            #[cfg(not(target_os = "espidf"))]
            start: std::time::Instant::now(),
            #[cfg(not(target_os = "espidf"))]
            wall_base: AtomicU64::new(0),
            #[cfg(not(target_os = "espidf"))]
            wall_base_mono_ms: AtomicU64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[cfg(target_os = "espidf")]
    fn monotonic_ms(&self) -> u64 {
        (unsafe { esp_idf_svc::sys::esp_timer_get_time() }) as u64 / 1_000
    }

    #[cfg(not(target_os = "espidf"))]
    fn monotonic_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    #[cfg(target_os = "espidf")]
    fn wall_epoch(&self) -> u64 {
        // Reject obviously unsynced time (before 2020-01-01).
        const EPOCH_2020: i64 = 1_577_836_800;
        let mut tv = esp_idf_svc::sys::timeval { tv_sec: 0, tv_usec: 0 };
        if unsafe { esp_idf_svc::sys::gettimeofday(&mut tv, core::ptr::null_mut()) } != 0 {
            return 0;
        }
        if tv.tv_sec < EPOCH_2020 {
            return 0;
        }
        tv.tv_sec as u64
    }

    #[cfg(not(target_os = "espidf"))]
    fn wall_epoch(&self) -> u64 {
        let base = self.wall_base.load(Ordering::Relaxed);
        if base == 0 {
            return 0;
        }
        let elapsed_ms = self
            .monotonic_ms()
            .saturating_sub(self.wall_base_mono_ms.load(Ordering::Relaxed));
        base + elapsed_ms / 1000
    }

    #[cfg(target_os = "espidf")]
    fn set_wall_epoch(&self, epoch: u64) {
        let tv = esp_idf_svc::sys::timeval {
            tv_sec: epoch as i64,
            tv_usec: 0,
        };
        unsafe {
            esp_idf_svc::sys::settimeofday(&tv, core::ptr::null());
        }
    }

    #[cfg(not(target_os = "espidf"))]
    fn set_wall_epoch(&self, epoch: u64) {
        self.wall_base_mono_ms
            .store(self.monotonic_ms(), Ordering::Relaxed);
        self.wall_base.store(epoch, Ordering::Relaxed);
    }
}

/// Fully scripted clock for tests: both axes advance only on demand.
pub struct SimClock {
    mono_ms: AtomicU64,
    epoch: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self {
            mono_ms: AtomicU64::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    /// Advance both the monotonic and (if set) the wall axis.
    pub fn advance_ms(&self, ms: u64) {
        self.mono_ms.fetch_add(ms, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Relaxed);
        if epoch != 0 {
            self.epoch.store(epoch + ms / 1000, Ordering::Relaxed);
        }
    }

    pub fn advance_secs(&self, secs: u64) {
        self.mono_ms.fetch_add(secs * 1000, Ordering::Relaxed);
        let epoch = self.epoch.load(Ordering::Relaxed);
        if epoch != 0 {
            self.epoch.store(epoch + secs, Ordering::Relaxed);
        }
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SimClock {
    fn monotonic_ms(&self) -> u64 {
        self.mono_ms.load(Ordering::Relaxed)
    }

    fn wall_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    fn set_wall_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_clock_is_scripted() {
        let clk = SimClock::new();
        assert_eq!(clk.monotonic_ms(), 0);
        assert_eq!(clk.wall_epoch(), 0);

        clk.advance_ms(1500);
        assert_eq!(clk.monotonic_ms(), 1500);
        // Wall axis does not run until set.
        assert_eq!(clk.wall_epoch(), 0);

        clk.set_wall_epoch(1_700_000_000);
        clk.advance_secs(60);
        assert_eq!(clk.wall_epoch(), 1_700_000_060);
    }

    #[test]
    fn system_clock_wall_follows_monotonic_once_set() {
        let clk = SystemClock::new();
        assert_eq!(clk.wall_epoch(), 0);
        clk.set_wall_epoch(1_700_000_000);
        assert!(clk.wall_epoch() >= 1_700_000_000);
    }
}
