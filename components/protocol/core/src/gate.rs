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

//! Collision-avoidance transmit gate (spec §4.4). No carrier sense is
//! performed anywhere in the crate; the gate alone decides whether a node may
//! key the (assumed half-duplex) radio at a given moment.

use rand_core::RngCore;
use seel_api::TimeMs;

#[derive(Debug, Clone, Copy)]
pub enum GateMode {
    /// TDMA: the cycle is divided into `slots` fixed-width slots of
    /// `slot_wait_ms = transmission_ub_ms + buffer_ms` each. A node may send
    /// only during its own slot's buffer window.
    Tdma {
        slots: u16,
        slot_wait_ms: TimeMs,
        buffer_ms: TimeMs,
        /// If set, at most one send is permitted per slot visit.
        single_send: bool,
    },
    /// Exponential backoff: a send is permitted once `send_delay` ms have
    /// elapsed since the last one. `send_delay` grows geometrically with the
    /// number of consecutive unacknowledged sends.
    ExponentialBackoff {
        init_ms: TimeMs,
        min_ms: TimeMs,
        /// Multiplier applied per unacknowledged send, as a percentage
        /// (e.g. 200 == 2.0x) to avoid a floating point dependency.
        exp_scale_pct: u32,
    },
}

pub struct TransmitGate {
    mode: GateMode,
    last_send_ms: TimeMs,
    send_delay_ms: TimeMs,
    prev_tdma_slot: Option<u16>,
}

impl TransmitGate {
    pub fn new(mode: GateMode) -> Self {
        let init = match mode {
            GateMode::ExponentialBackoff { init_ms, .. } => init_ms,
            GateMode::Tdma { .. } => 0,
        };
        Self {
            mode,
            last_send_ms: 0,
            send_delay_ms: init,
            prev_tdma_slot: None,
        }
    }

    fn tdma_slot(slot_wait_ms: TimeMs, slots: u16, now: TimeMs) -> u16 {
        ((now / slot_wait_ms) % slots as TimeMs) as u16
    }

    /// Whether a send is permitted right now. `my_slot` is only consulted in
    /// TDMA mode.
    pub fn permitted(&self, now: TimeMs, my_slot: u16) -> bool {
        match self.mode {
            GateMode::Tdma {
                slots,
                slot_wait_ms,
                buffer_ms,
                single_send,
            } => {
                let current_slot = Self::tdma_slot(slot_wait_ms, slots, now);
                let in_buffer = now % slot_wait_ms < buffer_ms;
                let base = current_slot == my_slot && in_buffer;
                if single_send {
                    base && self.prev_tdma_slot != Some(current_slot)
                } else {
                    base
                }
            }
            GateMode::ExponentialBackoff { .. } => {
                now.saturating_sub(self.last_send_ms) > self.send_delay_ms
            }
        }
    }

    /// Records that a send just happened, updating backoff/slot bookkeeping.
    /// `unack_msgs` is the node's current run of unacknowledged sends (owned
    /// by the node, not the gate).
    pub fn record_send(&mut self, now: TimeMs, my_slot: u16, unack_msgs: u16, rng: &mut impl RngCore) {
        match self.mode {
            GateMode::Tdma {
                slots,
                slot_wait_ms,
                ..
            } => {
                self.prev_tdma_slot = Some(Self::tdma_slot(slot_wait_ms, slots, now));
                let _ = (slots, my_slot);
            }
            GateMode::ExponentialBackoff {
                init_ms,
                min_ms,
                exp_scale_pct,
            } => {
                self.last_send_ms = now;
                let mut upper = init_ms as u64;
                for _ in 0..unack_msgs {
                    upper = upper * exp_scale_pct as u64 / 100;
                }
                let upper = (upper as TimeMs).max(min_ms + 1);
                let span = upper - min_ms;
                self.send_delay_ms = min_ms + (rng.next_u32() % span);
            }
        }
    }

    /// Resets backoff state on a successful ACK (spec §4.5 ACK ingestion).
    /// No-op in TDMA mode.
    pub fn record_ack(&mut self) {
        if let GateMode::ExponentialBackoff { init_ms, .. } = self.mode {
            self.send_delay_ms = 0;
            let _ = init_ms;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    /// Spec §8 scenario 4: cycle_ms=15000, slots=10, slot_wait=1500,
    /// buffer=500.
    #[test]
    fn tdma_boundaries_match_spec_scenario_4() {
        let gate = TransmitGate::new(GateMode::Tdma {
            slots: 10,
            slot_wait_ms: 1500,
            buffer_ms: 500,
            single_send: false,
        });
        assert!(!gate.permitted(4499, 3), "999 > buffer -> denied");
        assert!(gate.permitted(4501, 3), "1 < buffer -> permitted");
        assert!(!gate.permitted(5000, 3), "500 == buffer -> denied");
    }

    #[test]
    fn tdma_single_send_blocks_second_send_in_same_slot() {
        let mut gate = TransmitGate::new(GateMode::Tdma {
            slots: 10,
            slot_wait_ms: 1500,
            buffer_ms: 500,
            single_send: true,
        });
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert!(gate.permitted(4501, 3));
        gate.record_send(4501, 3, 0, &mut rng);
        assert!(!gate.permitted(4550, 3), "same slot, already sent once");
        assert!(gate.permitted(6001, 3), "next visit to slot 3");
    }

    #[test]
    fn exponential_backoff_blocks_until_delay_elapses() {
        let mut gate = TransmitGate::new(GateMode::ExponentialBackoff {
            init_ms: 1000,
            min_ms: 100,
            exp_scale_pct: 200,
        });
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert!(gate.permitted(0, 0));
        gate.record_send(0, 0, 0, &mut rng);
        assert!(!gate.permitted(50, 0));
        assert!(gate.permitted(2000, 0));
    }

    #[test]
    fn exponential_backoff_ack_resets_delay() {
        let mut gate = TransmitGate::new(GateMode::ExponentialBackoff {
            init_ms: 10_000,
            min_ms: 0,
            exp_scale_pct: 200,
        });
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        gate.record_send(0, 0, 3, &mut rng);
        gate.record_ack();
        assert!(gate.permitted(1, 0));
    }
}
