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

//! Wire frame layout, beacon/ID_CHECK/ACK payload accessors and duplicate
//! suppression (spec §3, §4.2, §6).

use ring_queue::RingQueue;
use seel_api::NodeId;

/// Byte length of the fixed beacon header (first_bcast_flag, bcast_count,
/// time_sync_ms, awake_secs, sleep_secs, hop_count, path_rssi), before the
/// id_feedback region starts at offset 16.
pub const MISC_SIZE: usize = 16;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    #[default]
    Bcast = 0,
    Ack = 1,
    Data = 2,
    IdCheck = 3,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Command::Bcast),
            1 => Some(Command::Ack),
            2 => Some(Command::Data),
            3 => Some(Command::IdCheck),
            _ => None,
        }
    }
}

/// Length of the fixed frame header, in bytes: target_id, sender_id, command,
/// seq_num, original_sender_id.
pub const FRAME_HEADER_LEN: usize = 5;

/// A fixed-size protocol frame. `DATA_SIZE` is `MISC_SIZE + USER_SIZE`
/// (spec §3); callers pick one `DATA_SIZE` for the whole deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Frame<const DATA_SIZE: usize> {
    pub target_id: NodeId,
    pub sender_id: NodeId,
    pub command: Command,
    pub seq_num: u8,
    pub original_sender_id: NodeId,
    pub payload: [u8; DATA_SIZE],
}

impl<const DATA_SIZE: usize> Default for Frame<DATA_SIZE> {
    fn default() -> Self {
        Self {
            target_id: 0,
            sender_id: 0,
            command: Command::default(),
            seq_num: 0,
            original_sender_id: 0,
            payload: [0u8; DATA_SIZE],
        }
    }
}

impl<const DATA_SIZE: usize> Frame<DATA_SIZE> {
    pub const WIRE_LEN: usize = FRAME_HEADER_LEN + DATA_SIZE;

    pub fn encode(&self, out: &mut [u8]) {
        debug_assert!(out.len() >= Self::WIRE_LEN);
        out[0] = self.target_id;
        out[1] = self.sender_id;
        out[2] = self.command as u8;
        out[3] = self.seq_num;
        out[4] = self.original_sender_id;
        out[FRAME_HEADER_LEN..Self::WIRE_LEN].copy_from_slice(&self.payload);
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::WIRE_LEN {
            return None;
        }
        let command = Command::from_u8(bytes[2])?;
        let mut payload = [0u8; DATA_SIZE];
        payload.copy_from_slice(&bytes[FRAME_HEADER_LEN..Self::WIRE_LEN]);
        Some(Self {
            target_id: bytes[0],
            sender_id: bytes[1],
            command,
            seq_num: bytes[3],
            original_sender_id: bytes[4],
            payload,
        })
    }
}

/// Beacon payload fields, laid out big-endian at the fixed offsets of §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeaconHeader {
    pub first_bcast_flag: bool,
    pub bcast_count: u8,
    pub time_sync_ms: u32,
    pub awake_secs: u32,
    pub sleep_secs: u32,
    pub hop_count: u8,
    pub path_rssi: i8,
}

impl BeaconHeader {
    pub fn encode(&self, payload: &mut [u8]) {
        debug_assert!(payload.len() >= MISC_SIZE);
        payload[0] = self.first_bcast_flag as u8;
        payload[1] = self.bcast_count;
        payload[2..6].copy_from_slice(&self.time_sync_ms.to_be_bytes());
        payload[6..10].copy_from_slice(&self.awake_secs.to_be_bytes());
        payload[10..14].copy_from_slice(&self.sleep_secs.to_be_bytes());
        payload[14] = self.hop_count;
        payload[15] = self.path_rssi as u8;
    }

    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < MISC_SIZE {
            return None;
        }
        Some(Self {
            first_bcast_flag: payload[0] != 0,
            bcast_count: payload[1],
            time_sync_ms: u32::from_be_bytes(payload[2..6].try_into().ok()?),
            awake_secs: u32::from_be_bytes(payload[6..10].try_into().ok()?),
            sleep_secs: u32::from_be_bytes(payload[10..14].try_into().ok()?),
            hop_count: payload[14],
            path_rssi: payload[15] as i8,
        })
    }
}

/// One `(requested_id, assigned_id)` entry of the id_feedback region that
/// follows the beacon header, starting at byte offset [`MISC_SIZE`].
pub fn id_feedback_slots(payload_len: usize) -> usize {
    (payload_len.saturating_sub(MISC_SIZE)) / 2
}

pub fn write_id_feedback(payload: &mut [u8], slot: usize, requested_id: NodeId, assigned_id: NodeId) {
    let off = MISC_SIZE + slot * 2;
    payload[off] = requested_id;
    payload[off + 1] = assigned_id;
}

pub fn read_id_feedback(payload: &[u8], slot: usize) -> (NodeId, NodeId) {
    let off = MISC_SIZE + slot * 2;
    (payload[off], payload[off + 1])
}

/// ID_CHECK payload: requested_id (byte 0), unique_key big-endian (bytes 1-4).
pub fn encode_id_check(payload: &mut [u8], requested_id: NodeId, unique_key: u32) {
    payload[0] = requested_id;
    payload[1..5].copy_from_slice(&unique_key.to_be_bytes());
}

pub fn decode_id_check(payload: &[u8]) -> Option<(NodeId, u32)> {
    if payload.len() < 5 {
        return None;
    }
    Some((payload[0], u32::from_be_bytes(payload[1..5].try_into().ok()?)))
}

/// Encodes up to `payload.len()` sender ids into the ACK payload, zero-padding
/// (0 is reserved for the GNODE and never a valid ACK target) the remainder.
/// Returns the number of ids actually encoded.
pub fn encode_ack(payload: &mut [u8], ids: &[NodeId]) -> usize {
    let n = ids.len().min(payload.len());
    payload[..n].copy_from_slice(&ids[..n]);
    for b in &mut payload[n..] {
        *b = 0;
    }
    n
}

/// Iterates the non-zero ids of an ACK payload in order, stopping at the
/// first zero-padding byte.
pub fn decode_ack(payload: &[u8]) -> impl Iterator<Item = NodeId> + '_ {
    payload.iter().copied().take_while(|&id| id != 0)
}

/// The fields `dup_check` compares a received frame against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DupKey {
    pub sender_id: NodeId,
    pub seq_num: u8,
    pub command: Command,
}

impl<const DATA_SIZE: usize> From<&Frame<DATA_SIZE>> for DupKey {
    fn from(f: &Frame<DATA_SIZE>) -> Self {
        Self {
            sender_id: f.sender_id,
            seq_num: f.seq_num,
            command: f.command,
        }
    }
}

/// Bounded `DUP_WINDOW`-sized ring of recently seen `(sender_id, seq_num,
/// command)` triples (spec §4.2). `check_and_record` inserts overwriting the
/// oldest slot when full, so only the most recent `N` distinct frames are
/// remembered.
pub struct DupSuppressor<const N: usize> {
    seen: RingQueue<DupKey, N>,
}

impl<const N: usize> DupSuppressor<N> {
    pub fn new() -> Self {
        Self {
            seen: RingQueue::new(),
        }
    }

    /// Returns `true` if this exact `(sender, seq, command)` was already seen
    /// within the last `N` distinct frames; otherwise records it and returns
    /// `false`.
    pub fn check_and_record(&mut self, key: DupKey) -> bool {
        if self.seen.find(&key).is_some() {
            true
        } else {
            self.seen.add(key, true);
            false
        }
    }
}

impl<const N: usize> Default for DupSuppressor<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trips_through_wire_bytes() {
        let frame = Frame::<8> {
            target_id: 1,
            sender_id: 42,
            command: Command::Data,
            seq_num: 7,
            original_sender_id: 42,
            payload: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut bytes = [0u8; Frame::<8>::WIRE_LEN];
        frame.encode(&mut bytes);
        let decoded = Frame::<8>::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decode_rejects_unknown_command_byte() {
        let mut bytes = [0u8; Frame::<4>::WIRE_LEN];
        bytes[2] = 0xFF;
        assert!(Frame::<4>::decode(&bytes).is_none());
    }

    #[test]
    fn beacon_header_round_trips() {
        let header = BeaconHeader {
            first_bcast_flag: true,
            bcast_count: 5,
            time_sync_ms: 0xDEAD_BEEF,
            awake_secs: 10,
            sleep_secs: 60,
            hop_count: 2,
            path_rssi: -80,
        };
        let mut payload = [0u8; MISC_SIZE];
        header.encode(&mut payload);
        assert_eq!(BeaconHeader::decode(&payload).unwrap(), header);
    }

    #[test]
    fn id_feedback_pairs_are_packed_after_misc_region() {
        let mut payload = [0u8; MISC_SIZE + 4];
        write_id_feedback(&mut payload, 0, 42, 42);
        write_id_feedback(&mut payload, 1, 7, 0);
        assert_eq!(read_id_feedback(&payload, 0), (42, 42));
        assert_eq!(read_id_feedback(&payload, 1), (7, 0));
        assert_eq!(id_feedback_slots(payload.len()), 2);
    }

    #[test]
    fn ack_payload_zero_pads_unused_tail() {
        let mut payload = [0xFFu8; 6];
        let n = encode_ack(&mut payload, &[3, 9]);
        assert_eq!(n, 2);
        assert_eq!(payload, [3, 9, 0, 0, 0, 0]);
        assert_eq!(decode_ack(&payload).collect::<std::vec::Vec<_>>(), [3, 9]);
    }

    #[test]
    fn dup_suppressor_flags_repeats_within_window() {
        let mut dup: DupSuppressor<3> = DupSuppressor::new();
        let key = DupKey {
            sender_id: 5,
            seq_num: 1,
            command: Command::Data,
        };
        assert!(!dup.check_and_record(key));
        assert!(dup.check_and_record(key));
    }

    #[test]
    fn dup_suppressor_forgets_past_the_window() {
        let mut dup: DupSuppressor<2> = DupSuppressor::new();
        let k = |seq| DupKey {
            sender_id: 1,
            seq_num: seq,
            command: Command::Data,
        };
        dup.check_and_record(k(1));
        dup.check_and_record(k(2));
        dup.check_and_record(k(3)); // evicts k(1)
        assert!(!dup.check_and_record(k(1)));
        assert!(dup.check_and_record(k(3)));
    }
}
