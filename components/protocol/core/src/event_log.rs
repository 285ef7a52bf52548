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

//! Macros for generating parseable event log lines, consumed by
//! [`seel_event_writer`] on the host side. Format: `$uptime;node_id;kind;content`.

#[macro_export]
macro_rules! seel_event_log {
    ($uptime:expr,$node_id:expr,$kind:expr,$content:expr) => {
        info!("${};{};{};{}", $uptime, $node_id, $kind, $content);
    };
}

#[macro_export]
macro_rules! seel_event_log_msg {
    ($uptime:expr,$node_id:expr,$content:expr) => {
        $crate::seel_event_log!($uptime, $node_id, "message", $content);
    };
}

/// Logged once at boot, before the first Wake (spec §4.7 Wake).
#[macro_export]
macro_rules! seel_event_log_reset {
    ($uptime:expr,$node_id:expr,$role:expr) => {
        info!("${};{};reset;{{\"role\":\"{}\"}}", $uptime, $node_id, $role);
    };
}

/// Logged on every cycle state transition (Wake/Receive/Enqueue/User/Sleep/
/// Force-Sleep, spec §4.7).
#[macro_export]
macro_rules! seel_event_log_state {
    ($uptime:expr,$node_id:expr,$new_state:expr) => {
        info!("${};{};state;\"{}\"", $uptime, $node_id, $new_state);
    };
}

/// Logged whenever a SNODE accepts a new parent (spec §4.7.1 step 4).
#[macro_export]
macro_rules! seel_event_log_parent {
    ($uptime:expr,$node_id:expr,$parent_id:expr,$hop_count:expr) => {
        info!(
            "${};{};parent;{{\"parent_id\":{},\"hop_count\":{}}}",
            $uptime, $node_id, $parent_id, $hop_count
        );
    };
}
