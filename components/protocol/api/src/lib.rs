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

//! Hardware and host contracts the SEEL protocol engine is built against.
//!
//! Mirrors the role `protocol_api::Protocol` plays for `lightning`: the engine
//! crate never talks to a radio, an EEPROM or a watchdog timer directly, only
//! through the traits defined here. A simulator and a real firmware target each
//! provide their own implementations.

#![cfg_attr(not(test), no_std)]

use ring_queue::RingQueue;

/// Time as milliseconds since an arbitrary epoch (scheduler start).
pub type TimeMs = u32;
/// Node identifier. 0 is reserved for the GNODE.
pub type NodeId = u8;
/// Received signal strength, in dBm.
pub type Rssi = i16;

/// Number of consecutive watchdog ticks the MCU should sleep for. The tick
/// period itself is a hardware-specific enum (`LowPower::Tick`); this is the
/// repeat count the protocol layer has computed.
pub type WatchdogTicks = u32;

/// A single entry of the bounded "last N beacons heard" / "last N messages
/// relayed" diagnostic rings carried in [`CbInfo`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceivedBeaconInfo {
    pub sender_id: NodeId,
    pub rssi: Rssi,
}

/// Per-command transmit counters for the current cycle. Diagnostics only,
/// never consulted by protocol logic.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Transmissions {
    pub beacons: u16,
    pub acks: u16,
    pub data: u16,
    pub id_checks: u16,
}

/// Information handed to host callbacks alongside a frame's payload.
///
/// Carries both the fields a callback needs to make a decision (cycle
/// counters, hop count) and a handful of bounded diagnostic rings ported from
/// the original implementation's `SEEL_CB_Info`, which a host application can
/// use for telemetry without the protocol engine itself depending on them.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CbInfo<const DIAG_DEPTH: usize> {
    pub node_id: NodeId,
    pub parent_id: NodeId,
    pub hop_count: u8,
    pub bcast_count: u8,
    pub missed_bcasts: u8,
    pub data_msgs_sent: u16,
    pub crc_fails: u16,
    pub received_bcasts: RingQueue<ReceivedBeaconInfo, DIAG_DEPTH>,
    pub prev_received_msgs: RingQueue<ReceivedBeaconInfo, DIAG_DEPTH>,
    pub transmissions: Transmissions,
}

impl<const DIAG_DEPTH: usize> Default for CbInfo<DIAG_DEPTH> {
    fn default() -> Self {
        Self {
            node_id: 0,
            parent_id: 0,
            hop_count: u8::MAX,
            bcast_count: 0,
            missed_bcasts: 0,
            data_msgs_sent: 0,
            crc_fails: 0,
            received_bcasts: RingQueue::new(),
            prev_received_msgs: RingQueue::new(),
            transmissions: Transmissions::default(),
        }
    }
}

/// Radio PHY contract (§6). Operates on raw byte slices; the engine owns the
/// wire format, the radio just moves bytes on and off air.
pub trait RadioPhy {
    type Error;

    fn begin(&mut self) -> Result<(), Self::Error>;
    fn set_spreading_factor(&mut self, sf: u8) -> Result<(), Self::Error>;
    fn set_bandwidth_khz(&mut self, bandwidth_khz: u32) -> Result<(), Self::Error>;
    fn set_tx_power_dbm(&mut self, power_dbm: i8) -> Result<(), Self::Error>;
    fn set_coding_rate(&mut self, denominator: u8) -> Result<(), Self::Error>;
    fn set_crc(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Blocks for the time on air.
    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error>;

    /// Non-blocking poll: `Ok(Some(len))` if a packet is waiting, `Ok(None)`
    /// otherwise.
    fn parse_packet(&mut self) -> Result<Option<usize>, Self::Error>;

    /// Reads the packet found by the last successful `parse_packet`.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;

    fn packet_rssi(&self) -> Rssi;
    fn packet_snr(&self) -> f32;
    /// Whether the PHY validated the CRC of the last received packet.
    fn packet_crc_ok(&self) -> bool;

    fn sleep(&mut self) -> Result<(), Self::Error>;
}

/// Deep-sleep contract (§6). `power_down` blocks for exactly one watchdog
/// period of the given duration.
pub trait LowPower {
    type Tick: Copy;

    fn power_down(&mut self, tick: Self::Tick);
}

/// Wear-leveling-aware NVM contract (§6). `update` must be a no-op when the
/// stored bytes already match `buf`, to avoid wearing the cell.
pub trait Nvm {
    type Error;

    fn length(&self) -> usize;
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn update(&mut self, addr: usize, buf: &[u8]) -> Result<(), Self::Error>;
}

/// Sink for non-fatal invariant violations (§7, §9 Design Notes). Recording
/// must never panic or otherwise abort the caller.
pub trait AssertionHook {
    fn record(&mut self, file: &'static str, line: u32);
}

/// GNODE host callbacks (§6).
pub trait GNodeCallbacks {
    /// Called after the beacon payload has been assembled, before it is
    /// transmitted. May inspect but is not expected to mutate system bytes.
    fn on_broadcast(&mut self, payload: &[u8]);

    /// Called for every accepted DATA frame, with the RSSI it arrived at.
    fn on_data(&mut self, payload: &[u8], rssi: Rssi);
}

/// SNODE host callbacks (§6).
pub trait SNodeCallbacks<const DIAG_DEPTH: usize> {
    /// Called once per cycle to ask the host for a payload to upload.
    /// Returns `false` if there is nothing to send this cycle.
    fn on_load(&mut self, payload: &mut [u8], info: &CbInfo<DIAG_DEPTH>) -> bool;

    /// Called when forwarding a child's DATA frame upstream. Returning
    /// `false` drops the frame (and its ACK) instead of relaying it.
    fn on_forward(&mut self, _payload: &mut [u8], _info: &CbInfo<DIAG_DEPTH>) -> bool {
        true
    }

    /// Called immediately before a DATA frame already queued for
    /// transmission is sent, with a last chance to rewrite the payload.
    fn on_presend(&mut self, _payload: &mut [u8], _info: &CbInfo<DIAG_DEPTH>) {}
}
