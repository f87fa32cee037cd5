use std::time::{SystemTime, UNIX_EPOCH};

use embassy_time::Instant;

pub use ahcp_proto::client::clock_broken;

/// The wall clock, in whole seconds since the epoch.
pub fn wall_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

/// Watches the wall clock drift against the monotonic clock so that NTP
/// steps can be noticed and logged. Timers run on the monotonic clock and
/// freshness is recomputed from the wall clock on every loop iteration,
/// so a step needs no repair beyond being observed.
pub struct ClockMonitor {
    wall: u32,
    mono: Instant,
}

impl Default for ClockMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockMonitor {
    pub fn new() -> Self {
        Self {
            wall: wall_now(),
            mono: Instant::now(),
        }
    }

    /// Rebaselines and returns the size of the step, if one happened.
    pub fn observe(&mut self) -> Option<i64> {
        let wall = wall_now();
        let mono = Instant::now();

        let elapsed = (mono - self.mono).as_secs() as i64;
        let drift = wall as i64 - (self.wall as i64 + elapsed);

        self.wall = wall;
        self.mono = mono;

        (drift.abs() > 2).then_some(drift)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn steady_clock_reports_no_step() {
        let mut monitor = ClockMonitor::new();
        assert_eq!(monitor.observe(), None);
    }

    #[test]
    fn broken_clock_threshold() {
        assert!(clock_broken(1_199_999_999));
        assert!(!clock_broken(1_200_000_000));
    }
}
