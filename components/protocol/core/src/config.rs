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

//! Runtime configuration parameters (spec §6 "Configuration parameters").
//!
//! Queue/array capacities (`MAX_NODES`, `USER_SIZE`, `DUP_WINDOW`) are const
//! generics on [`crate::gnode::GNode`] / [`crate::snode::SNode`] because a
//! `no_std` crate with no allocator must size them at compile time. Everything
//! else here is genuinely per-deployment (radio region, cycle length, parent
//! selection policy) and is plain runtime data, built once at startup and
//! shared by reference.

use seel_api::TimeMs;

use crate::gate::GateMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentSelectionMode {
    /// Accept the first beacon heard each cycle, unconditionally.
    FirstBroadcast,
    /// Prefer the strongest immediate (one-hop) link RSSI.
    ImmediateRssi,
    /// Prefer the strongest path RSSI (weakest link along the route to the
    /// GNODE), tie-broken by fewer hops.
    PathRssi,
}

#[derive(Debug, Clone, Copy)]
pub struct RadioParams {
    pub frequency_hz: u32,
    pub spreading_factor: u8,
    pub bandwidth_khz: u32,
    pub tx_power_dbm: i8,
    pub coding_rate_denominator: u8,
    pub crc_enabled: bool,
}

/// Network- and cycle-level parameters shared by GNODE and SNODE.
#[derive(Debug, Clone, Copy)]
pub struct SeelConfig {
    pub radio: RadioParams,

    /// How long SNODEs stay awake per cycle, beacon included.
    pub awake_secs: u32,
    /// How long SNODEs sleep per cycle. The GNODE beacons every
    /// `awake_secs + sleep_secs` (spec GLOSSARY: Cycle).
    pub sleep_secs: u32,
    /// Upper bound on one frame's time-on-air plus processing latency, used
    /// to size TDMA slots and to stamp `time_sync_ms`.
    pub transmission_ub_ms: TimeMs,
    /// Elapsed time inside the PHY receive routine, added to a beacon's
    /// decoded `time_sync_ms` before adopting it (spec §4.7.3).
    pub receive_offset_ms: TimeMs,

    /// Initial (deliberately overestimated) watchdog-tick duration, before
    /// the drift estimator has learned a better value.
    pub initial_wd_estimate_ms: TimeMs,
    /// Margin subtracted from the computed sleep duration so a node wakes
    /// slightly early rather than slightly late.
    pub early_wake_ms: TimeMs,

    pub force_sleep_awake_mult: f32,
    pub force_sleep_awake_duration_scale: f32,
    /// 0 disables Force-Sleep's awake-duration backoff entirely.
    pub force_sleep_reset_count: u8,

    pub parent_selection_mode: ParentSelectionMode,
    pub psel_duration_ms: TimeMs,

    pub gate_mode: GateMode,
    /// SNODE's own TDMA slot index, only consulted when `gate_mode` is
    /// [`GateMode::Tdma`]. GNODE beacons and ACKs bypass the gate entirely.
    pub tdma_slot: u16,

    /// Cycles an ID registry entry may go unrefreshed before it is treated
    /// as free for reassignment. Must be <= 127 (7-bit wraparound math).
    pub max_cycle_misses: u8,

    pub assertions_enabled: bool,
    pub assertion_nvm_enabled: bool,
}

impl SeelConfig {
    pub fn cycle_period_secs(&self) -> u32 {
        self.awake_secs + self.sleep_secs
    }
}

impl Default for SeelConfig {
    fn default() -> Self {
        Self {
            radio: RadioParams {
                frequency_hz: 868_100_000,
                spreading_factor: 9,
                bandwidth_khz: 125,
                tx_power_dbm: 14,
                coding_rate_denominator: 5,
                crc_enabled: true,
            },
            awake_secs: 10,
            sleep_secs: 290,
            transmission_ub_ms: 100,
            receive_offset_ms: 0,
            initial_wd_estimate_ms: 1000,
            early_wake_ms: 0,
            force_sleep_awake_mult: 1.0,
            force_sleep_awake_duration_scale: 1.5,
            force_sleep_reset_count: 3,
            parent_selection_mode: ParentSelectionMode::PathRssi,
            psel_duration_ms: 2_000,
            gate_mode: GateMode::Tdma {
                slots: 10,
                slot_wait_ms: 200,
                buffer_ms: 100,
                single_send: true,
            },
            tdma_slot: 0,
            max_cycle_misses: 25,
            assertions_enabled: true,
            assertion_nvm_enabled: true,
        }
    }
}
