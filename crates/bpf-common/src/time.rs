//! eBPF programs stamp events with `bpf_ktime_get_ns`, which counts
//! nanoseconds of `CLOCK_MONOTONIC`. This module converts such values into
//! wall-clock time.

use std::{
    fmt,
    time::{Duration, SystemTime},
};

use nix::time::{ClockId, clock_gettime};

/// Nanoseconds since boot, as measured by `CLOCK_MONOTONIC`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current value of the monotonic clock.
    pub fn now() -> Self {
        Self(clock_nanos(ClockId::CLOCK_MONOTONIC).unwrap_or(0))
    }

    /// Convert a `CLOCK_BOOTTIME` value, which keeps counting while the
    /// system is suspended, given how long the system has been suspended.
    pub fn from_boottime(boottime: u64, suspended: u64) -> Self {
        Self(boottime.saturating_sub(suspended))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Nanoseconds the system spent suspended since boot: the distance between
/// `CLOCK_BOOTTIME` and `CLOCK_MONOTONIC`.
pub fn suspended_nanos() -> u64 {
    match (
        clock_nanos(ClockId::CLOCK_BOOTTIME),
        clock_nanos(ClockId::CLOCK_MONOTONIC),
    ) {
        (Some(boottime), Some(monotonic)) => boottime.saturating_sub(monotonic),
        _ => 0,
    }
}

fn clock_nanos(clock: ClockId) -> Option<u64> {
    match clock_gettime(clock) {
        Ok(ts) => Some(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64),
        Err(err) => {
            log::warn!("Error reading {clock:?}: {err}");
            None
        }
    }
}

impl From<u64> for Timestamp {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The instant the monotonic clock started counting.
///
/// Computed once: later conversions are stable even if the wall clock is
/// adjusted while we're running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTime(SystemTime);

impl BootTime {
    pub fn detect() -> Self {
        let since_boot = Duration::from_nanos(Timestamp::now().raw());
        let now = SystemTime::now();
        Self(now.checked_sub(since_boot).unwrap_or(SystemTime::UNIX_EPOCH))
    }

    pub fn from_system_time(boot: SystemTime) -> Self {
        Self(boot)
    }

    /// Wall-clock time of the given monotonic timestamp.
    pub fn to_system_time(&self, timestamp: Timestamp) -> SystemTime {
        self.0 + Duration::from_nanos(timestamp.raw())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_clock_advances() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(b >= a);
        assert!(a.raw() > 0);
    }

    #[test]
    fn boottime_excludes_suspension() {
        let hour = 3_600_000_000_000;
        assert_eq!(
            Timestamp::from_boottime(5 * hour, hour),
            Timestamp::from(4 * hour)
        );
        assert_eq!(Timestamp::from_boottime(42, 0).raw(), 42);
        // started before a suspension longer than its uptime offset
        assert_eq!(Timestamp::from_boottime(hour, 2 * hour).raw(), 0);
    }

    #[test]
    fn boottime_is_ahead_of_monotonic() {
        let monotonic = Timestamp::now();
        let boottime = clock_nanos(ClockId::CLOCK_BOOTTIME).unwrap();
        assert!(boottime >= monotonic.raw());
        assert!(Timestamp::from_boottime(boottime, suspended_nanos()) >= monotonic);
    }

    #[test]
    fn conversion_adds_offset_to_boot() {
        let boot = BootTime::from_system_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1000));
        assert_eq!(
            boot.to_system_time(Timestamp::from(2_500_000_000)),
            SystemTime::UNIX_EPOCH + Duration::from_millis(1_002_500)
        );
    }

    #[test]
    fn detected_boot_is_in_the_past() {
        let boot = BootTime::detect();
        assert!(boot.to_system_time(Timestamp::from(0)) <= SystemTime::now());
        assert!(boot.to_system_time(Timestamp::now()) <= SystemTime::now() + Duration::from_secs(1));
    }
}
