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

//! Sensor node role (spec §4.7): the Wake -> Receive(+Enqueue/Send) -> User ->
//! Sleep cycle, plus the Force-Sleep escape. Reuses the Node Base send
//! selection (§4.5) built on top of [`crate::gate::TransmitGate`] and
//! [`crate::node::AckQueue`].

use rand_core::RngCore;
use seel_api::{
    AssertionHook, CbInfo, LowPower, NodeId, ReceivedBeaconInfo, RadioPhy, Rssi, SNodeCallbacks,
    TimeMs,
};

use crate::codec::{
    decode_ack, encode_id_check, id_feedback_slots, read_id_feedback, BeaconHeader, Command,
    DupKey, DupSuppressor, Frame,
};
use crate::config::{ParentSelectionMode, SeelConfig};
use crate::drift::DriftEstimator;
use crate::gate::TransmitGate;
use crate::node::{AckQueue, SeqCounter};
use crate::scheduler::{Clock, Scheduler};
use crate::seel_assert;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::{debug, info, warn};
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::{debug, info, warn};

use crate::{seel_event_log_parent, seel_event_log_state};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SNodeTask {
    #[default]
    None,
    Wake,
    Receive,
    Enqueue,
    Send,
    User,
    Sleep,
    ForceSleep,
}

/// Capacity of the outgoing data queue (own DATA, forwarded DATA/ID_CHECK and
/// this node's own ID_CHECK). Not in the spec's deployment-tunable
/// configuration table, so it is a fixed internal constant.
const DATA_QUEUE_CAP: usize = 4;

/// Re-poll interval while Enqueue or Send are waiting on a precondition
/// (`beacon_sent`, the transmit gate). Not spec-mandated; any small value that
/// doesn't starve the scheduler works since both tasks re-arm themselves.
const POLL_AGAIN_MS: TimeMs = 10;

pub struct SNode<const MAX_NODES: usize, const DATA_SIZE: usize, const DUP_WINDOW: usize, const DIAG_DEPTH: usize>
{
    node_id: NodeId,
    unique_key: u32,
    id_verified: bool,

    parent_id: NodeId,
    last_parent_id: NodeId,
    parent_sync: bool,
    hop_count: u8,
    parent_rssi: Rssi,
    path_rssi: i16,

    beacon_received: bool,
    beacon_available: bool,
    beacon_sent: bool,
    beacon_msg: Frame<DATA_SIZE>,

    acked: bool,
    unack_msgs: u16,
    failed_transmissions: u16,
    data_msgs_sent: u16,
    crc_fails: u16,
    missed_bcasts: u8,
    wd_adjusted: bool,
    system_sync: bool,
    last_bcast_count: u8,

    wtb_ms: TimeMs,
    cycle_awake_secs: u32,
    cycle_sleep_secs: u32,

    seq: SeqCounter,
    ack_queue: AckQueue<MAX_NODES>,
    data_queue: ring_queue::RingQueue<Frame<DATA_SIZE>, DATA_QUEUE_CAP>,
    blacklist: ring_queue::RingQueue<NodeId, MAX_NODES>,
    dup: DupSuppressor<DUP_WINDOW>,
    gate: TransmitGate,
    drift: DriftEstimator,

    cb_info: CbInfo<DIAG_DEPTH>,
}

impl<const MAX_NODES: usize, const DATA_SIZE: usize, const DUP_WINDOW: usize, const DIAG_DEPTH: usize>
    SNode<MAX_NODES, DATA_SIZE, DUP_WINDOW, DIAG_DEPTH>
{
    pub fn new(node_id: NodeId, unique_key: u32, config: &SeelConfig) -> Self {
        Self {
            node_id,
            unique_key,
            id_verified: false,
            parent_id: 0,
            last_parent_id: 0,
            parent_sync: false,
            hop_count: u8::MAX,
            parent_rssi: 0,
            path_rssi: i16::MIN,
            beacon_received: false,
            beacon_available: false,
            beacon_sent: false,
            beacon_msg: Frame::default(),
            acked: false,
            unack_msgs: 0,
            failed_transmissions: 0,
            data_msgs_sent: 0,
            crc_fails: 0,
            missed_bcasts: 0,
            wd_adjusted: false,
            system_sync: false,
            last_bcast_count: 0,
            wtb_ms: 0,
            cycle_awake_secs: config.awake_secs,
            cycle_sleep_secs: config.sleep_secs,
            seq: SeqCounter::default(),
            ack_queue: AckQueue::new(),
            data_queue: ring_queue::RingQueue::new(),
            blacklist: ring_queue::RingQueue::new(),
            dup: DupSuppressor::new(),
            gate: TransmitGate::new(config.gate_mode),
            drift: DriftEstimator::new(config.initial_wd_estimate_ms, config.early_wake_ms),
            cb_info: CbInfo::default(),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn id_verified(&self) -> bool {
        self.id_verified
    }

    pub fn cb_info(&self) -> &CbInfo<DIAG_DEPTH> {
        &self.cb_info
    }

    fn encode_frame(frame: &Frame<DATA_SIZE>) -> [u8; Frame::<DATA_SIZE>::WIRE_LEN] {
        let mut bytes = [0u8; Frame::<DATA_SIZE>::WIRE_LEN];
        frame.encode(&mut bytes);
        bytes
    }

    // ---- Wake --------------------------------------------------------

    pub fn wake_task<C: Clock, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        config: &SeelConfig,
    ) {
        self.wtb_ms = sched.now();
        seel_event_log_state!(self.wtb_ms, self.node_id, "wake");
        self.unack_msgs = 0;
        self.failed_transmissions = 0;
        self.data_msgs_sent = 0;
        self.crc_fails = 0;
        self.beacon_received = false;
        self.parent_sync = false;
        self.beacon_available = false;
        self.beacon_sent = false;
        self.hop_count = u8::MAX;
        self.parent_rssi = 0;
        self.path_rssi = i16::MIN;
        self.ack_queue.clear();

        sched.set_user_task_enable(false);
        sched.add_task(SNodeTask::Receive, 0, false);

        if self.wd_adjusted && self.missed_bcasts < config.force_sleep_reset_count {
            let awake_ms = self.cycle_awake_secs as f32 * 1000.0;
            let scale = config
                .force_sleep_awake_duration_scale
                .powi(self.missed_bcasts as i32 + 1);
            let delay = (config.force_sleep_awake_mult * awake_ms * scale) as TimeMs;
            sched.add_task(SNodeTask::ForceSleep, delay, false);
        } else {
            self.wd_adjusted = false;
            self.drift = DriftEstimator::new(config.initial_wd_estimate_ms, config.early_wake_ms);
        }
    }

    // ---- Receive -------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn receive_task<C, R, CB, H, RNG, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        radio: &mut R,
        cb: &mut CB,
        hook: &mut H,
        config: &SeelConfig,
        rng: &mut RNG,
    ) where
        C: Clock,
        R: RadioPhy,
        CB: SNodeCallbacks<DIAG_DEPTH>,
        H: AssertionHook,
        RNG: RngCore,
    {
        let mut bytes = [0u8; Frame::<DATA_SIZE>::WIRE_LEN];
        match radio.parse_packet() {
            Ok(Some(len)) if len >= Frame::<DATA_SIZE>::WIRE_LEN => {
                let _ = radio.read(&mut bytes);
                if !radio.packet_crc_ok() {
                    self.crc_fails = self.crc_fails.saturating_add(1);
                } else if let Some(frame) = Frame::<DATA_SIZE>::decode(&bytes) {
                    if !self.dup.check_and_record(DupKey::from(&frame)) {
                        self.dispatch_received(&frame, sched, radio, cb, hook, config, rng);
                    }
                }
            }
            _ => {}
        }
        sched.add_task(SNodeTask::Receive, 0, false);
    }

    #[allow(clippy::too_many_arguments)]
    fn dispatch_received<C, R, CB, H, RNG, const SCHED_CAP: usize>(
        &mut self,
        frame: &Frame<DATA_SIZE>,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        radio: &mut R,
        cb: &mut CB,
        hook: &mut H,
        config: &SeelConfig,
        rng: &mut RNG,
    ) where
        C: Clock,
        R: RadioPhy,
        CB: SNodeCallbacks<DIAG_DEPTH>,
        H: AssertionHook,
        RNG: RngCore,
    {
        match frame.command {
            Command::Bcast if !self.beacon_sent => {
                let rssi = radio.packet_rssi();
                self.handle_beacon(frame, rssi, sched, config, rng);
            }
            Command::Ack if self.unack_msgs > 0 => {
                self.handle_ack(frame);
            }
            Command::Data | Command::IdCheck if frame.target_id == self.node_id => {
                self.handle_forward(frame, cb);
            }
            _ if frame.target_id == self.node_id => {
                seel_assert!(hook, false);
            }
            _ => {}
        }
    }

    fn handle_ack(&mut self, frame: &Frame<DATA_SIZE>) {
        if decode_ack(&frame.payload).any(|id| id == self.node_id) {
            self.data_queue.pop_front();
            self.gate.record_ack();
            self.unack_msgs = 0;
            self.acked = true;
        }
    }

    fn handle_forward<CB: SNodeCallbacks<DIAG_DEPTH>>(&mut self, frame: &Frame<DATA_SIZE>, cb: &mut CB) {
        let original_sender = frame.sender_id;
        let mut copy = *frame;
        copy.target_id = self.parent_id;
        copy.sender_id = self.node_id;

        let keep = if frame.command == Command::Data {
            cb.on_forward(&mut copy.payload, &self.cb_info)
        } else {
            true
        };

        if keep && self.data_queue.add(copy, false) {
            self.ack_queue.enqueue_unless_present(original_sender);
        }
    }

    // ---- Beacon handling & parent selection (§4.7.1) --------------------

    fn handle_beacon<C: Clock, RNG: RngCore, const SCHED_CAP: usize>(
        &mut self,
        frame: &Frame<DATA_SIZE>,
        rssi: Rssi,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        config: &SeelConfig,
        rng: &mut RNG,
    ) {
        let Some(header) = BeaconHeader::decode(&frame.payload) else {
            return;
        };

        if !self.acked && header.bcast_count != self.last_bcast_count {
            self.blacklist.clear();
        }
        self.last_bcast_count = header.bcast_count;
        self.cb_info.bcast_count = header.bcast_count;
        self.cb_info
            .received_bcasts
            .add(ReceivedBeaconInfo { sender_id: frame.sender_id, rssi }, true);

        if self.blacklist.find(&frame.sender_id).is_some() {
            if !self.beacon_received {
                self.bcast_setup(&header, sched, config);
            }
            return;
        }

        let incoming_hop = header.hop_count.saturating_add(1);
        let metric: i32 = match config.parent_selection_mode {
            ParentSelectionMode::FirstBroadcast => 0,
            ParentSelectionMode::ImmediateRssi => rssi as i32,
            ParentSelectionMode::PathRssi => (rssi as i32).min(header.path_rssi as i32),
        };
        let accept = match config.parent_selection_mode {
            ParentSelectionMode::FirstBroadcast => !self.parent_sync,
            _ => {
                !self.parent_sync
                    || metric > self.path_rssi as i32
                    || (metric == self.path_rssi as i32 && incoming_hop < self.hop_count)
            }
        };
        if !accept {
            return;
        }

        self.acked = false;
        self.parent_id = frame.sender_id;
        self.path_rssi = metric as i16;
        self.parent_rssi = rssi;
        self.hop_count = incoming_hop;
        self.beacon_msg = *frame;
        self.beacon_available = true;
        seel_event_log_parent!(sched.now(), self.node_id, self.parent_id, self.hop_count);

        let first_this_cycle = !self.parent_sync;
        self.parent_sync = true;

        if first_this_cycle {
            let missed_before_reset = self.missed_bcasts;
            self.cb_info.missed_bcasts = missed_before_reset;
            self.missed_bcasts = 0;

            let prev_awake = self.cycle_awake_secs;
            let prev_sleep = self.cycle_sleep_secs;
            if !self.beacon_received {
                self.bcast_setup(&header, sched, config);
            }

            if self.system_sync && missed_before_reset == 0 && self.last_parent_id == self.parent_id {
                self.drift.learn(self.wtb_ms, prev_sleep, prev_awake);
                self.wd_adjusted = true;
            }

            if !self.id_verified && !header.first_bcast_flag {
                self.verify_id_from_beacon(&header, frame, rng);
            }
            self.system_sync = true;
            self.last_parent_id = self.parent_id;

            let enqueue_delay = if config.parent_selection_mode == ParentSelectionMode::FirstBroadcast {
                0
            } else {
                config.psel_duration_ms
            };
            sched.add_task(SNodeTask::Enqueue, enqueue_delay, false);
            sched.add_task(SNodeTask::Send, 0, false);
        }

        self.beacon_received = true;
    }

    fn verify_id_from_beacon<RNG: RngCore>(
        &mut self,
        header: &BeaconHeader,
        frame: &Frame<DATA_SIZE>,
        rng: &mut RNG,
    ) {
        let _ = header;
        let slots = id_feedback_slots(DATA_SIZE);
        for slot in 0..slots {
            let (requested, assigned) = read_id_feedback(&frame.payload, slot);
            if requested == self.node_id {
                if assigned == 0 {
                    let largest = (MAX_NODES as u32).max(2);
                    self.node_id = 1 + (rng.next_u32() % (largest - 1)) as NodeId;
                    self.id_verified = false;
                } else {
                    self.node_id = assigned;
                    self.id_verified = true;
                }
                return;
            }
        }
    }

    // ---- Time rebase (§4.7.3) -------------------------------------------

    fn bcast_setup<C: Clock, const SCHED_CAP: usize>(
        &mut self,
        header: &BeaconHeader,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        config: &SeelConfig,
    ) {
        let now = sched.now();
        self.wtb_ms = now.wrapping_sub(self.wtb_ms);

        let new_ms = header.time_sync_ms.wrapping_add(config.receive_offset_ms);
        sched.adjust_time(new_ms);

        self.system_sync &= !header.first_bcast_flag;
        self.cycle_awake_secs = header.awake_secs;
        self.cycle_sleep_secs = header.sleep_secs;
        sched.add_task(SNodeTask::Sleep, header.awake_secs * 1000, false);
    }

    // ---- Enqueue ---------------------------------------------------------

    pub fn enqueue_task<C: Clock, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
    ) {
        if !self.beacon_sent {
            sched.add_task(SNodeTask::Enqueue, POLL_AGAIN_MS, false);
            return;
        }
        if self.id_verified {
            sched.set_user_task_enable(true);
            sched.add_task(SNodeTask::User, 0, true);
        } else {
            let mut frame = Frame::<DATA_SIZE>::default();
            frame.target_id = self.parent_id;
            frame.sender_id = self.node_id;
            frame.command = Command::IdCheck;
            frame.seq_num = self.seq.next();
            frame.original_sender_id = self.node_id;
            encode_id_check(&mut frame.payload, self.node_id, self.unique_key);
            self.data_queue.add(frame, false);
        }
    }

    // ---- User --------------------------------------------------------------

    pub fn user_task<C: Clock, CB: SNodeCallbacks<DIAG_DEPTH>, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        cb: &mut CB,
        user_task_interval_ms: TimeMs,
    ) {
        if self.beacon_received {
            let mut payload = [0u8; DATA_SIZE];
            if cb.on_load(&mut payload, &self.cb_info) {
                let mut frame = Frame::<DATA_SIZE>::default();
                frame.target_id = self.parent_id;
                frame.sender_id = self.node_id;
                frame.command = Command::Data;
                frame.seq_num = self.seq.next();
                frame.original_sender_id = self.node_id;
                frame.payload = payload;
                self.data_queue.add(frame, false);
            }
        }
        sched.add_task(SNodeTask::User, user_task_interval_ms, true);
    }

    // ---- Send (Node Base §4.5) ----------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn send_task<C, R, CB, RNG, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        radio: &mut R,
        cb: &mut CB,
        config: &SeelConfig,
        rng: &mut RNG,
    ) where
        C: Clock,
        R: RadioPhy,
        CB: SNodeCallbacks<DIAG_DEPTH>,
        RNG: RngCore,
    {
        let now = sched.now();
        let want_beacon = self.beacon_available && !self.beacon_sent;
        let want_ack = !self.ack_queue.is_empty();
        let want_data = self.parent_sync && !self.data_queue.is_empty();

        if (want_beacon || want_ack || want_data) && self.gate.permitted(now, config.tdma_slot) {
            let sent = if want_beacon {
                self.send_beacon_rebroadcast(radio, config, now)
            } else if want_ack {
                self.send_ack(radio)
            } else {
                self.send_data_or_id_check(radio, cb)
            };
            if sent {
                self.gate.record_send(now, config.tdma_slot, self.unack_msgs, rng);
            }
        }

        // Re-arm unconditionally: a stalled send task permanently stalls the
        // cycle (spec §9 design notes).
        sched.add_task(SNodeTask::Send, POLL_AGAIN_MS, false);
    }

    /// Returns whether the frame actually went out; only a successful send
    /// should feed the gate's exponential-backoff/TDMA bookkeeping (spec §4.4:
    /// backoff advances "on each successful send").
    fn send_beacon_rebroadcast<R: RadioPhy>(&mut self, radio: &mut R, config: &SeelConfig, now: TimeMs) -> bool {
        let mut frame = self.beacon_msg;
        frame.sender_id = self.node_id;

        if let Some(mut header) = BeaconHeader::decode(&frame.payload) {
            header.hop_count = self.hop_count;
            header.path_rssi = self.path_rssi.clamp(i8::MIN as i16, i8::MAX as i16) as i8;
            header.time_sync_ms = now + config.transmission_ub_ms;
            header.encode(&mut frame.payload);
        }

        let bytes = Self::encode_frame(&frame);
        if radio.send(&bytes).is_ok() {
            self.beacon_sent = true;
            self.beacon_available = false;
            self.cb_info.transmissions.beacons = self.cb_info.transmissions.beacons.saturating_add(1);
            true
        } else {
            warn!("beacon rebroadcast send failed");
            false
        }
    }

    fn send_ack<R: RadioPhy>(&mut self, radio: &mut R) -> bool {
        let mut frame = Frame::<DATA_SIZE>::default();
        frame.target_id = self.parent_id;
        frame.sender_id = self.node_id;
        frame.command = Command::Ack;
        frame.seq_num = self.seq.next();
        self.ack_queue.drain_into(&mut frame.payload);

        let bytes = Self::encode_frame(&frame);
        if radio.send(&bytes).is_ok() {
            self.cb_info.transmissions.acks = self.cb_info.transmissions.acks.saturating_add(1);
            true
        } else {
            false
        }
    }

    fn send_data_or_id_check<R: RadioPhy, CB: SNodeCallbacks<DIAG_DEPTH>>(&mut self, radio: &mut R, cb: &mut CB) -> bool {
        let Some(front) = self.data_queue.front().copied() else {
            return false;
        };

        if front.command == Command::IdCheck && front.original_sender_id == self.node_id && self.id_verified {
            self.data_queue.pop_front();
            return false;
        }

        let mut frame = front;
        frame.target_id = self.parent_id;
        frame.sender_id = self.node_id;

        if frame.command == Command::Data {
            cb.on_presend(&mut frame.payload, &self.cb_info);
        }

        let bytes = Self::encode_frame(&frame);
        let sent = radio.send(&bytes).is_ok();
        if !sent {
            debug!("data/id_check send failed, will retry next cycle");
        }

        self.unack_msgs = self.unack_msgs.saturating_add(1);
        self.failed_transmissions = self.failed_transmissions.saturating_add(1);
        self.data_msgs_sent = self.data_msgs_sent.saturating_add(1);
        match frame.command {
            Command::Data => self.cb_info.transmissions.data = self.cb_info.transmissions.data.saturating_add(1),
            Command::IdCheck => {
                self.cb_info.transmissions.id_checks = self.cb_info.transmissions.id_checks.saturating_add(1)
            }
            _ => {}
        }
        sent
    }

    // ---- Sleep / Force-Sleep ----------------------------------------------

    pub fn sleep_task<C, R, L, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
        radio: &mut R,
        low_power: &mut L,
        tick: L::Tick,
        config: &SeelConfig,
    ) where
        C: Clock,
        R: RadioPhy,
        L: LowPower,
    {
        self.cb_info.node_id = self.node_id;
        self.cb_info.parent_id = self.parent_id;
        self.cb_info.hop_count = self.hop_count;
        self.cb_info.data_msgs_sent = self.data_msgs_sent;
        self.cb_info.crc_fails = self.crc_fails;
        self.cb_info.prev_received_msgs = self.cb_info.received_bcasts;
        self.cb_info.received_bcasts = ring_queue::RingQueue::new();

        if self.parent_sync && !self.acked && self.data_msgs_sent > 0 {
            self.blacklist.add(self.parent_id, true);
            self.acked = true;
        }

        sched.clear_tasks();
        sched.add_task(SNodeTask::Wake, 0, false);

        let _ = radio.sleep();

        let ticks = self.drift.sleep_ticks(
            self.cycle_sleep_secs,
            self.cycle_awake_secs,
            self.missed_bcasts,
            config.force_sleep_awake_mult,
            config.force_sleep_awake_duration_scale,
        );
        for _ in 0..ticks {
            low_power.power_down(tick);
        }
    }

    pub fn force_sleep_task<C: Clock, const SCHED_CAP: usize>(
        &mut self,
        sched: &mut Scheduler<C, SNodeTask, SCHED_CAP>,
    ) {
        if self.beacon_received {
            return;
        }
        self.missed_bcasts = self.missed_bcasts.saturating_add(1);
        self.blacklist.clear();
        sched.clear_tasks();
        sched.add_task(SNodeTask::Sleep, 0, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::Cell;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    struct TestClock(Cell<TimeMs>);
    impl Clock for TestClock {
        fn now_ms(&self) -> TimeMs {
            self.0.get()
        }
        fn set_now_ms(&mut self, new_ms: TimeMs) {
            self.0.set(new_ms);
        }
    }

    type TestSched = Scheduler<TestClock, SNodeTask, 8>;
    type TestSNode = SNode<8, 20, 4, 4>;

    struct NullHook;
    impl AssertionHook for NullHook {
        fn record(&mut self, _file: &'static str, _line: u32) {}
    }

    fn beacon_frame(sender: NodeId, hop_count: u8, path_rssi: i8, first: bool, bcast_count: u8) -> Frame<20> {
        let mut frame = Frame::<20>::default();
        frame.target_id = 0;
        frame.sender_id = sender;
        frame.command = Command::Bcast;
        frame.seq_num = 0;
        frame.original_sender_id = sender;
        let header = BeaconHeader {
            first_bcast_flag: first,
            bcast_count,
            time_sync_ms: 1_000,
            awake_secs: 10,
            sleep_secs: 290,
            hop_count,
            path_rssi,
        };
        header.encode(&mut frame.payload);
        frame
    }

    #[test]
    fn accepts_first_beacon_and_arms_enqueue_and_send() {
        let mut node = TestSNode::new(5, 0xAAAA, &SeelConfig::default());
        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        let config = SeelConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let frame = beacon_frame(0, 0, -40, false, 1);
        node.handle_beacon(&frame, -40, &mut sched, &config, &mut rng);

        assert!(node.parent_sync);
        assert_eq!(node.parent_id, 0);
        assert_eq!(node.hop_count, 1);
        assert!(node.beacon_available);
        assert!(sched.next_runnable_time().is_some());
    }

    #[test]
    fn path_rssi_prefers_stronger_metric_over_first_parent() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        let config = SeelConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let weak = beacon_frame(1, 0, -90, false, 1);
        node.handle_beacon(&weak, -90, &mut sched, &config, &mut rng);
        assert_eq!(node.parent_id, 1);

        let strong = beacon_frame(2, 0, -40, false, 1);
        node.handle_beacon(&strong, -40, &mut sched, &config, &mut rng);
        assert_eq!(node.parent_id, 1, "parent already locked for this cycle");
    }

    #[test]
    fn blacklisted_sender_is_never_selected_as_parent() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        node.blacklist.add(9, true);
        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        let config = SeelConfig::default();
        let mut rng = ChaCha8Rng::seed_from_u64(0);

        let frame = beacon_frame(9, 0, -40, false, 1);
        node.handle_beacon(&frame, -40, &mut sched, &config, &mut rng);
        assert!(!node.parent_sync);
    }

    #[test]
    fn ack_pops_data_queue_and_clears_unack_counter() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        node.data_queue.add(Frame::default(), false);
        node.unack_msgs = 1;

        let mut ack = Frame::<20>::default();
        ack.command = Command::Ack;
        ack.payload[0] = 5;
        node.handle_ack(&ack);

        assert!(node.data_queue.is_empty());
        assert_eq!(node.unack_msgs, 0);
        assert!(node.acked);
    }

    #[test]
    fn lost_parent_is_blacklisted_at_sleep_without_ack() {
        struct NullRadio;
        impl RadioPhy for NullRadio {
            type Error = ();
            fn begin(&mut self) -> Result<(), ()> {
                Ok(())
            }
            fn set_spreading_factor(&mut self, _: u8) -> Result<(), ()> {
                Ok(())
            }
            fn set_bandwidth_khz(&mut self, _: u32) -> Result<(), ()> {
                Ok(())
            }
            fn set_tx_power_dbm(&mut self, _: i8) -> Result<(), ()> {
                Ok(())
            }
            fn set_coding_rate(&mut self, _: u8) -> Result<(), ()> {
                Ok(())
            }
            fn set_crc(&mut self, _: bool) -> Result<(), ()> {
                Ok(())
            }
            fn send(&mut self, _: &[u8]) -> Result<(), ()> {
                Ok(())
            }
            fn parse_packet(&mut self) -> Result<Option<usize>, ()> {
                Ok(None)
            }
            fn read(&mut self, _: &mut [u8]) -> Result<usize, ()> {
                Ok(0)
            }
            fn packet_rssi(&self) -> Rssi {
                0
            }
            fn packet_snr(&self) -> f32 {
                0.0
            }
            fn packet_crc_ok(&self) -> bool {
                true
            }
            fn sleep(&mut self) -> Result<(), ()> {
                Ok(())
            }
        }
        struct NullLowPower;
        impl LowPower for NullLowPower {
            type Tick = ();
            fn power_down(&mut self, _tick: ()) {}
        }

        let config = SeelConfig::default();
        let mut node = TestSNode::new(5, 1, &config);
        node.parent_id = 0;
        node.parent_sync = true;
        node.acked = false;
        node.data_msgs_sent = 3;

        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        let mut radio = NullRadio;
        let mut low_power = NullLowPower;
        node.sleep_task(&mut sched, &mut radio, &mut low_power, (), &config);

        assert!(node.blacklist.find(&0).is_some());
        assert_eq!(sched.next_runnable_time(), Some(0));
    }

    #[test]
    fn force_sleep_is_a_no_op_once_beacon_already_received() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        node.beacon_received = true;
        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        node.force_sleep_task(&mut sched);
        assert_eq!(node.missed_bcasts, 0);
        assert_eq!(sched.next_runnable_time(), None);
    }

    #[test]
    fn force_sleep_increments_missed_bcasts_and_schedules_sleep() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        let mut sched = TestSched::new(TestClock(Cell::new(0)));
        node.force_sleep_task(&mut sched);
        assert_eq!(node.missed_bcasts, 1);
        assert_eq!(sched.next_runnable_time(), Some(0));
    }

    #[test]
    fn id_check_to_self_is_dropped_once_verified_without_transmitting() {
        let mut node = TestSNode::new(5, 1, &SeelConfig::default());
        node.id_verified = true;
        let mut frame = Frame::<20>::default();
        frame.command = Command::IdCheck;
        frame.original_sender_id = 5;
        node.data_queue.add(frame, false);

        struct CountingRadio(Cell<u32>);
        impl RadioPhy for CountingRadio {
            type Error = ();
            fn begin(&mut self) -> Result<(), ()> {
                Ok(())
            }
            fn set_spreading_factor(&mut self, _: u8) -> Result<(), ()> {
                Ok(())
            }
            fn set_bandwidth_khz(&mut self, _: u32) -> Result<(), ()> {
                Ok(())
            }
            fn set_tx_power_dbm(&mut self, _: i8) -> Result<(), ()> {
                Ok(())
            }
            fn set_coding_rate(&mut self, _: u8) -> Result<(), ()> {
                Ok(())
            }
            fn set_crc(&mut self, _: bool) -> Result<(), ()> {
                Ok(())
            }
            fn send(&mut self, _: &[u8]) -> Result<(), ()> {
                self.0.set(self.0.get() + 1);
                Ok(())
            }
            fn parse_packet(&mut self) -> Result<Option<usize>, ()> {
                Ok(None)
            }
            fn read(&mut self, _: &mut [u8]) -> Result<usize, ()> {
                Ok(0)
            }
            fn packet_rssi(&self) -> Rssi {
                0
            }
            fn packet_snr(&self) -> f32 {
                0.0
            }
            fn packet_crc_ok(&self) -> bool {
                true
            }
            fn sleep(&mut self) -> Result<(), ()> {
                Ok(())
            }
        }
        struct NullCb;
        impl SNodeCallbacks<4> for NullCb {
            fn on_load(&mut self, _payload: &mut [u8], _info: &CbInfo<4>) -> bool {
                false
            }
        }

        let mut radio = CountingRadio(Cell::new(0));
        let mut cb = NullCb;
        node.send_data_or_id_check(&mut radio, &mut cb);

        assert!(node.data_queue.is_empty());
        assert_eq!(radio.0.get(), 0);
    }
}
