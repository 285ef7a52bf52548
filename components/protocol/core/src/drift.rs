//  _____       ______   ____
// |_   _|     |  ____|/ ____|  Institute of Embedded Systems
//   | |  _ __ | |__  | (___    Zurich University of Applied Sciences
//   | | | '_ \|  __|  \___ \   8401 Winterthur, Switzerland
//  _| |_| | | | |____ ____) |
// |_____|_| |_|______|_____/
//
// Copyright 2025 Institute of Embedded Systems at Zurich University of Applied Sciences.
// All rights reserved.
// SPDX-License-Identifier: MIT

//! Watchdog-tick drift estimator (spec §4.7.4). Learns the true duration of
//! one low-power watchdog tick from how far off the wake-to-beacon (WTB)
//! residual is from the expected sleep duration, so the next cycle's sleep
//! tick count gets closer to `awake+sleep` exactly.

use seel_api::TimeMs;

#[derive(Debug, Clone, Copy)]
pub struct DriftEstimator {
    /// Current best estimate of one watchdog tick, in ms. Starts out as a
    /// deliberate overestimate so the first few cycles wake early rather
    /// than oversleep past the next beacon.
    estimate_ms: TimeMs,
    /// Running correction applied to the naive sleep-ms/estimate division.
    offset_ms: TimeMs,
    early_wake_ms: TimeMs,
}

impl DriftEstimator {
    pub fn new(initial_estimate_ms: TimeMs, early_wake_ms: TimeMs) -> Self {
        Self {
            estimate_ms: initial_estimate_ms,
            offset_ms: 0,
            early_wake_ms,
        }
    }

    pub fn estimate_ms(&self) -> TimeMs {
        self.estimate_ms
    }

    /// Learns from one cycle's wake-to-beacon residual. Must only be called
    /// when `system_sync` holds, no beacons were missed, and the parent
    /// didn't change (spec §4.7.4).
    pub fn learn(&mut self, wtb_ms: TimeMs, prev_sleep_secs: u32, awake_secs: u32) {
        let prev_sleep_ms = prev_sleep_secs as TimeMs * 1000;
        let cycle_ms = (awake_secs + prev_sleep_secs) as TimeMs * 1000;
        let wtb_trim = if cycle_ms == 0 { 0 } else { wtb_ms % cycle_ms };

        let prev_sleep_counts = (prev_sleep_ms
            .saturating_sub(self.early_wake_ms)
            .saturating_sub(self.offset_ms))
            / self.estimate_ms.max(1);
        let actual_sleep_ms;

        if wtb_trim > prev_sleep_ms {
            // overslept past the beacon
            self.offset_ms = (cycle_ms - wtb_trim).min(prev_sleep_ms.saturating_sub(self.early_wake_ms));
            actual_sleep_ms = prev_sleep_ms + self.offset_ms;
        } else {
            actual_sleep_ms = prev_sleep_ms - wtb_trim;
            if self.offset_ms > 0 && wtb_trim > self.offset_ms {
                // last cycle's correction was fully consumed by slack
                self.offset_ms = 0;
            }
        }

        if prev_sleep_counts > 0 {
            self.estimate_ms = actual_sleep_ms / prev_sleep_counts;
        }
    }

    /// Ticks to sleep for `sleep_secs`, with the Force-Sleep awake-time
    /// penalty of already-missed beacons subtracted back out.
    pub fn sleep_ticks(&self, sleep_secs: u32, awake_secs: u32, missed_bcasts: u8, mult: f32, scale: f32) -> u32 {
        let sleep_ms = sleep_secs as TimeMs * 1000;
        let baseline = sleep_ms
            .saturating_sub(self.early_wake_ms)
            .saturating_sub(self.offset_ms)
            / self.estimate_ms.max(1);

        if missed_bcasts == 0 {
            return baseline;
        }
        let awake_ms = awake_secs as f32 * 1000.0;
        let extra_awake_ms = (mult * scale.powi(missed_bcasts as i32) - 1.0) * awake_ms;
        let extra_ticks = (extra_awake_ms.max(0.0) as TimeMs) / self.estimate_ms.max(1);
        baseline.saturating_sub(extra_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spec §8 scenario 5: prev_sleep_secs=60, awake_secs=10, est=1000,
    /// offset=0, wtb_ms=60200.
    #[test]
    fn learns_from_overslept_cycle() {
        let mut d = DriftEstimator::new(1000, 0);
        d.learn(60_200, 60, 10);
        assert_eq!(d.offset_ms, 9_800);
        assert_eq!(d.estimate_ms, 1163); // 69800 / 60, truncated
    }

    /// Spec §8 scenario 6: next cycle wtb_ms=10200, consumes the offset.
    #[test]
    fn next_cycle_consumes_slack_offset() {
        let mut d = DriftEstimator::new(1000, 0);
        d.learn(60_200, 60, 10);
        d.learn(10_200, 60, 10);
        assert_eq!(d.offset_ms, 0);
        assert_eq!(d.estimate_ms, 1158); // 49800 / 43, truncated
    }

    #[test]
    fn effective_sleep_never_goes_negative() {
        let mut d = DriftEstimator::new(1000, 0);
        d.learn(1_000_000, 60, 10); // absurdly long WTB
        assert!(d.offset_ms <= 60_000);
    }
}
