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

//! Gateway node role (spec §4.6, §4.6.1). The GNODE always has node id 0; it
//! beacons once per cycle, bypassing the transmit gate entirely, and answers
//! ID_CHECK/DATA frames from its direct children.

use seel_api::{AssertionHook, GNodeCallbacks, NodeId, RadioPhy, Rssi, TimeMs};

use crate::codec::{
    decode_id_check, id_feedback_slots, write_id_feedback, BeaconHeader, Command, DupKey,
    DupSuppressor, Frame,
};
use crate::config::SeelConfig;
use crate::node::{AckQueue, SeqCounter};
use crate::scheduler::{Clock, Scheduler};
use crate::seel_assert;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, info};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, info};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum GNodeTask {
    #[default]
    None,
    Bcast,
    Receive,
}

/// `(used, saved_bcast_count)` id-registry entry (spec §3 GNODE ID Registry
/// Entry). `saved_bcast_count` is a 7-bit counter compared to the current
/// `bcast_count` modulo 128.
#[derive(Debug, Clone, Copy, Default)]
struct IdRegistryEntry {
    used: bool,
    saved_bcast_count: u8,
}

/// A pending response to an ID_CHECK, queued for the next beacon's
/// id_feedback region. `assigned_id == 0` signals a collision error.
#[derive(Debug, Clone, Copy, Default)]
struct PendingIdResponse {
    requested_id: NodeId,
    assigned_id: NodeId,
    unique_key: u32,
}

const PENDING_ID_CAP: usize = 8;

pub struct GNode<const MAX_NODES: usize, const DATA_SIZE: usize, const DUP_WINDOW: usize> {
    id_container: [IdRegistryEntry; MAX_NODES],
    pending: ring_queue::RingQueue<PendingIdResponse, PENDING_ID_CAP>,
    ack_queue: AckQueue<MAX_NODES>,
    seq: SeqCounter,
    dup: DupSuppressor<DUP_WINDOW>,
    bcast_count: u8,
    first_bcast: bool,
}

impl<const MAX_NODES: usize, const DATA_SIZE: usize, const DUP_WINDOW: usize>
    GNode<MAX_NODES, DATA_SIZE, DUP_WINDOW>
{
    pub fn new() -> Self {
        Self {
            id_container: [IdRegistryEntry::default(); MAX_NODES],
            pending: ring_queue::RingQueue::new(),
            ack_queue: AckQueue::new(),
            seq: SeqCounter::default(),
            dup: DupSuppressor::new(),
            bcast_count: 0,
            first_bcast: true,
        }
    }

    fn id_avail(&self, id: NodeId, max_cycle_misses: u8) -> bool {
        let entry = self.id_container[id as usize];
        if !entry.used {
            return true;
        }
        let elapsed = self.bcast_count.wrapping_sub(entry.saved_bcast_count) & 0x7F;
        elapsed >= max_cycle_misses
    }

    /// Runs the ID_CHECK allocation policy (spec §4.6.1).
    fn allocate_id(&mut self, requested_id: NodeId, unique_key: u32, max_cycle_misses: u8) {
        if requested_id == 0 || requested_id as usize >= MAX_NODES {
            return;
        }
        if let Some(pending) = self
            .pending
            .iter_mut()
            .find(|p| p.requested_id == requested_id)
        {
            if pending.unique_key == unique_key {
                // same requester retried before this beacon drained the
                // queue: nothing new to do.
                return;
            }
            // a different node asked for the same id: collision.
            pending.assigned_id = 0;
            self.id_container[requested_id as usize].used = false;
            return;
        }

        if self.id_avail(requested_id, max_cycle_misses) {
            self.pending.add(
                PendingIdResponse {
                    requested_id,
                    assigned_id: requested_id,
                    unique_key,
                },
                true,
            );
            self.id_container[requested_id as usize] = IdRegistryEntry {
                used: true,
                saved_bcast_count: self.bcast_count,
            };
            return;
        }

        for candidate in (1..MAX_NODES as u16).rev() {
            let candidate = candidate as NodeId;
            if self.id_avail(candidate, max_cycle_misses) {
                self.pending.add(
                    PendingIdResponse {
                        requested_id,
                        assigned_id: candidate,
                        unique_key,
                    },
                    true,
                );
                self.id_container[candidate as usize] = IdRegistryEntry {
                    used: true,
                    saved_bcast_count: self.bcast_count,
                };
                return;
            }
        }

        self.pending.add(
            PendingIdResponse {
                requested_id,
                assigned_id: 0,
                unique_key,
            },
            true,
        );
    }

    /// Refreshes the registry entry for `sender_id` on every accepted
    /// DATA/ID_CHECK frame, so it doesn't expire under `MAX_CYCLE_MISSES`.
    fn refresh(&mut self, sender_id: NodeId) {
        if (sender_id as usize) < MAX_NODES {
            self.id_container[sender_id as usize] = IdRegistryEntry {
                used: true,
                saved_bcast_count: self.bcast_count,
            };
        }
    }

    /// Self-rescheduling beacon task (spec §4.6). Bypasses the transmit
    /// gate entirely.
    #[allow(clippy::too_many_arguments)]
    pub fn bcast_task<C: Clock, R: RadioPhy, CB: GNodeCallbacks, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, GNodeTask, SCHED_CAP>,
        radio: &mut R,
        cb: &mut CB,
        config: &SeelConfig,
    ) {
        self.ack_queue.clear();

        let mut frame = Frame::<DATA_SIZE>::default();
        frame.target_id = 0;
        frame.sender_id = 0;
        frame.command = Command::Bcast;
        frame.seq_num = self.seq.next();
        frame.original_sender_id = 0;

        let slots = id_feedback_slots(DATA_SIZE);
        let mut filled = 0;
        while filled < slots {
            match self.pending.pop_front() {
                Some(p) => {
                    write_id_feedback(&mut frame.payload, filled, p.requested_id, p.assigned_id);
                    filled += 1;
                }
                None => break,
            }
        }
        for s in filled..slots {
            write_id_feedback(&mut frame.payload, s, 0, 0);
        }

        let now = sched.now();
        let header = BeaconHeader {
            first_bcast_flag: self.first_bcast,
            bcast_count: self.bcast_count,
            time_sync_ms: now + config.transmission_ub_ms,
            awake_secs: config.awake_secs,
            sleep_secs: config.sleep_secs,
            hop_count: 0,
            path_rssi: 0,
        };
        header.encode(&mut frame.payload);

        cb.on_broadcast(&frame.payload);

        let mut bytes = [0u8; Frame::<DATA_SIZE>::WIRE_LEN];
        frame.encode(&mut bytes);
        let _ = radio.send(&bytes);

        self.bcast_count = self.bcast_count.wrapping_add(1) & 0x7F;
        self.first_bcast = false;

        sched.add_task(
            GNodeTask::Bcast,
            config.cycle_period_secs() as TimeMs * 1000,
            false,
        );
    }

    /// Drains the radio of pending frames, dispatching DATA/ID_CHECK from
    /// direct children (spec §4.6).
    #[allow(clippy::too_many_arguments)]
    pub fn receive_task<R: RadioPhy, CB: GNodeCallbacks, H: AssertionHook>(
        &mut self,
        radio: &mut R,
        cb: &mut CB,
        hook: &mut H,
        max_cycle_misses: u8,
    ) {
        let mut bytes = [0u8; Frame::<DATA_SIZE>::WIRE_LEN];
        loop {
            match radio.parse_packet() {
                Ok(Some(len)) if len >= Frame::<DATA_SIZE>::WIRE_LEN => {
                    let _ = radio.read(&mut bytes);
                    if !radio.packet_crc_ok() {
                        continue;
                    }
                    let Some(frame) = Frame::<DATA_SIZE>::decode(&bytes) else {
                        continue;
                    };
                    if frame.target_id != 0 {
                        continue;
                    }
                    let dup = self.dup.check_and_record(DupKey::from(&frame));
                    if dup {
                        continue;
                    }
                    match frame.command {
                        Command::Data => {
                            self.refresh(frame.sender_id);
                            cb.on_data(&frame.payload, radio.packet_rssi());
                            self.ack_queue.enqueue_unless_present(frame.sender_id);
                        }
                        Command::IdCheck => {
                            if let Some((requested_id, unique_key)) =
                                decode_id_check(&frame.payload)
                            {
                                self.allocate_id(requested_id, unique_key, max_cycle_misses);
                            }
                            self.ack_queue.enqueue_unless_present(frame.sender_id);
                        }
                        Command::Bcast | Command::Ack => {
                            seel_assert!(hook, false);
                        }
                    }
                }
                Ok(Some(_)) | Ok(None) => break,
                Err(_) => break,
            }
        }
    }

    /// Sends one ACK frame listing up to `DATA_SIZE` acknowledged children,
    /// if any are pending. Like the beacon, GNODE ACKs are not gated.
    pub fn send_ack_if_pending<R: RadioPhy>(&mut self, radio: &mut R) {
        if self.ack_queue.is_empty() {
            return;
        }
        let mut frame = Frame::<DATA_SIZE>::default();
        frame.target_id = 0;
        frame.sender_id = 0;
        frame.command = Command::Ack;
        frame.seq_num = self.seq.next();
        self.ack_queue.drain_into(&mut frame.payload);

        let mut bytes = [0u8; Frame::<DATA_SIZE>::WIRE_LEN];
        frame.encode(&mut bytes);
        let _ = radio.send(&bytes);
    }

    pub fn bcast_count(&self) -> u8 {
        self.bcast_count
    }
}

impl<const MAX_NODES: usize, const DATA_SIZE: usize, const DUP_WINDOW: usize> Default
    for GNode<MAX_NODES, DATA_SIZE, DUP_WINDOW>
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_hop_join_assigns_requested_id() {
        let mut g: GNode<128, 24, 3> = GNode::new();
        g.allocate_id(42, 0xCAFE_BABE, 25);
        assert_eq!(g.pending.size(), 1);
        let p = g.pending.front().unwrap();
        assert_eq!((p.requested_id, p.assigned_id), (42, 42));
        assert!(g.id_container[42].used);
    }

    #[test]
    fn duplicate_join_with_same_key_is_ignored() {
        let mut g: GNode<128, 24, 3> = GNode::new();
        g.allocate_id(42, 0xCAFE_BABE, 25);
        g.allocate_id(42, 0xCAFE_BABE, 25);
        assert_eq!(g.pending.size(), 1);
    }

    #[test]
    fn id_collision_reverts_container_and_flags_error() {
        let mut g: GNode<128, 24, 3> = GNode::new();
        g.allocate_id(42, 0x1111_1111, 25);
        g.allocate_id(42, 0x2222_2222, 25);
        assert_eq!(g.pending.size(), 1);
        let p = g.pending.front().unwrap();
        assert_eq!(p.assigned_id, 0);
        assert!(!g.id_container[42].used);
    }

    #[test]
    fn expired_registry_entry_becomes_available_again() {
        let mut g: GNode<128, 24, 3> = GNode::new();
        g.id_container[5] = IdRegistryEntry {
            used: true,
            saved_bcast_count: 0,
        };
        g.bcast_count = 30;
        assert!(g.id_avail(5, 25));
        g.bcast_count = 10;
        assert!(!g.id_avail(5, 25));
    }

    #[test]
    fn beacon_never_holds_two_pending_entries_for_same_requested_id() {
        let mut g: GNode<128, 24, 3> = GNode::new();
        g.allocate_id(9, 1, 25);
        g.allocate_id(9, 2, 25);
        let count = g.pending.iter().filter(|p| p.requested_id == 9).count();
        assert_eq!(count, 1);
    }
}
