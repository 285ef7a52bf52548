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

//! Deterministic discrete-event simulation harness for a SEEL network: a
//! virtual ether (distance-based visibility, time-on-air delay and
//! collision detection) plus per-node virtual clocks driving the real
//! `seel_core` scheduler, radio and low-power traits unmodified.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    fs::File,
    io::{self, Write},
    rc::Rc,
};

#[allow(unused_imports)]
use log::{debug, info, warn};
use rand::SeedableRng;

use seel_api::{AssertionHook, CbInfo, GNodeCallbacks, LowPower, NodeId, Nvm, RadioPhy, Rssi, SNodeCallbacks, TimeMs};
use seel_core::config::SeelConfig;
use seel_core::gnode::{GNode, GNodeTask};
use seel_core::scheduler::{Clock, Scheduler};
use seel_core::snode::{SNode, SNodeTask};

use sorted_linked_list::SortedLinkedList;

pub const MAX_NODES: usize = 64;
pub const DATA_SIZE: usize = 24;
pub const DUP_WINDOW: usize = 8;
pub const DIAG_DEPTH: usize = 4;
const SCHED_CAP: usize = 16;

/// Approximate time a `DATA_SIZE`-byte frame spends in the air; only the
/// relative ordering of overlapping transmissions matters for collision
/// detection, not the exact figure.
pub const TIME_ON_AIR: TimeMs = 100;

/// Nominal duration of one watchdog tick as actually delivered by the
/// simulated hardware, as opposed to `initial_wd_estimate_ms`, which is the
/// engine's a-priori guess of it.
const NOMINAL_TICK_MS: TimeMs = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Coordinates {
    pub x: i64,
    pub y: i64,
}

impl From<(i64, i64)> for Coordinates {
    fn from(value: (i64, i64)) -> Self {
        Self { x: value.0, y: value.1 }
    }
}

pub fn get_distance(a: &Coordinates, b: &Coordinates) -> f32 {
    let dx = b.x - a.x;
    let dy = b.y - a.y;
    ((dx.pow(2) + dy.pow(2)) as f32).sqrt()
}

/// Check if two nodes are in range of each other.
pub fn check_visibility_based_on_distance(a: &Coordinates, b: &Coordinates, range: u32) -> bool {
    get_distance(a, b) < range as f32
}

/// A frame in flight: it left `sender` at `departure_ms` and lands at
/// `arrival_ms` on every recipient still standing once collisions are
/// accounted for.
struct InFlight {
    sender: NodeId,
    departure_ms: TimeMs,
    arrival_ms: TimeMs,
}

/// Shared radio medium. Visibility is purely distance-based; unlike
/// lightning's per-channel broadcast domains SEEL has no channel concept,
/// so every node shares one half-duplex frequency and two overlapping
/// transmissions at a common recipient always collide.
pub struct Ether {
    locations: Vec<Coordinates>,
    range: u32,
    packet_error_rate_ppt: Option<u32>,
    in_flight: Vec<InFlight>,
    mailboxes: Vec<RefCell<VecDeque<(Vec<u8>, Rssi, TimeMs)>>>,
}

impl Ether {
    pub fn new(locations: Vec<Coordinates>, range: u32, packet_error_rate_ppt: Option<u32>) -> Self {
        let n = locations.len();
        Self {
            locations,
            range,
            packet_error_rate_ppt,
            in_flight: Vec::new(),
            mailboxes: (0..n).map(|_| RefCell::new(VecDeque::new())).collect(),
        }
    }

    fn visible(&self, a: NodeId, b: NodeId) -> bool {
        a != b && check_visibility_based_on_distance(&self.locations[a as usize], &self.locations[b as usize], self.range)
    }

    /// Called by a node's [`SimRadio::send`]. Computes which other nodes
    /// receive the frame, dropping deliveries to recipients whose receive
    /// window collides with another transmission in flight at the same
    /// time, and applying the configured packet error rate.
    pub fn transmit(&mut self, sender: NodeId, bytes: &[u8], now: TimeMs, mut rng: impl rand::RngCore) {
        let arrival = now + TIME_ON_AIR;

        self.in_flight.retain(|f| f.arrival_ms > now);
        let overlapping: Vec<NodeId> = self
            .in_flight
            .iter()
            .filter(|f| f.departure_ms < arrival && now < f.arrival_ms)
            .map(|f| f.sender)
            .collect();

        for id in 0..self.locations.len() as NodeId {
            if !self.visible(sender, id) {
                continue;
            }
            if overlapping.iter().any(|&other| self.visible(other, id)) {
                warn!("message collision at node {id}: frame from {sender} overlapped another in-flight frame");
                continue;
            }
            if let Some(per) = self.packet_error_rate_ppt {
                if rng.next_u32() % 1000 < per {
                    warn!("packet error simulation: dropping message to node {id}");
                    continue;
                }
            }
            self.mailboxes[id as usize].borrow_mut().push_back((bytes.to_vec(), 0, arrival));
        }

        self.in_flight.push(InFlight {
            sender,
            departure_ms: now,
            arrival_ms: arrival,
        });
    }

    fn poll(&self, node: NodeId, now: TimeMs) -> Option<(Vec<u8>, Rssi)> {
        let mut mailbox = self.mailboxes[node as usize].borrow_mut();
        match mailbox.front() {
            Some((_, _, arrival)) if *arrival <= now => {
                let (bytes, rssi, _) = mailbox.pop_front().unwrap();
                Some((bytes, rssi))
            }
            _ => None,
        }
    }
}

/// A [`Clock`] backed by a plain shared cell the simulator's event loop
/// writes to directly -- this is what lets `LowPower::power_down` "pass
/// time" without the scheduler itself knowing anything changed.
#[derive(Clone)]
pub struct SimClock(Rc<Cell<TimeMs>>);

impl SimClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub fn cell(&self) -> Rc<Cell<TimeMs>> {
        self.0.clone()
    }
}

impl Clock for SimClock {
    fn now_ms(&self) -> TimeMs {
        self.0.get()
    }

    fn set_now_ms(&mut self, new_ms: TimeMs) {
        self.0.set(new_ms);
    }
}

pub struct SimRadio {
    id: NodeId,
    ether: Rc<RefCell<Ether>>,
    clock: Rc<Cell<TimeMs>>,
    rng: rand_chacha::ChaCha8Rng,
    last_rssi: Rssi,
    pending: Option<Vec<u8>>,
}

impl SimRadio {
    pub fn new(id: NodeId, ether: Rc<RefCell<Ether>>, clock: Rc<Cell<TimeMs>>, rng_seed: u64) -> Self {
        Self {
            id,
            ether,
            clock,
            rng: rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed),
            last_rssi: 0,
            pending: None,
        }
    }
}

impl RadioPhy for SimRadio {
    type Error = ();

    fn begin(&mut self) -> Result<(), ()> {
        Ok(())
    }
    fn set_spreading_factor(&mut self, _sf: u8) -> Result<(), ()> {
        Ok(())
    }
    fn set_bandwidth_khz(&mut self, _bandwidth_khz: u32) -> Result<(), ()> {
        Ok(())
    }
    fn set_tx_power_dbm(&mut self, _power_dbm: i8) -> Result<(), ()> {
        Ok(())
    }
    fn set_coding_rate(&mut self, _denominator: u8) -> Result<(), ()> {
        Ok(())
    }
    fn set_crc(&mut self, _enabled: bool) -> Result<(), ()> {
        Ok(())
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), ()> {
        let now = self.clock.get();
        self.ether.borrow_mut().transmit(self.id, bytes, now, &mut self.rng);
        Ok(())
    }

    fn parse_packet(&mut self) -> Result<Option<usize>, ()> {
        let now = self.clock.get();
        if let Some((bytes, rssi)) = self.ether.borrow().poll(self.id, now) {
            self.last_rssi = rssi;
            let len = bytes.len();
            self.pending = Some(bytes);
            Ok(Some(len))
        } else {
            Ok(None)
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, ()> {
        let Some(bytes) = self.pending.take() else {
            return Ok(0);
        };
        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        Ok(n)
    }

    fn packet_rssi(&self) -> Rssi {
        self.last_rssi
    }

    fn packet_snr(&self) -> f32 {
        8.0
    }

    fn packet_crc_ok(&self) -> bool {
        true
    }

    fn sleep(&mut self) -> Result<(), ()> {
        Ok(())
    }
}

/// `Tick` is nominal milliseconds: `power_down` advances the shared clock
/// directly, modeling the real elapsed wall-clock time that passes while a
/// node is asleep between cycles.
pub struct SimLowPower {
    clock: Rc<Cell<TimeMs>>,
}

impl SimLowPower {
    pub fn new(clock: Rc<Cell<TimeMs>>) -> Self {
        Self { clock }
    }
}

impl LowPower for SimLowPower {
    type Tick = TimeMs;

    fn power_down(&mut self, tick: TimeMs) {
        self.clock.set(self.clock.get() + tick);
    }
}

pub struct SimNvm {
    bytes: RefCell<Vec<u8>>,
}

impl SimNvm {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: RefCell::new(vec![0u8; len]),
        }
    }
}

impl Nvm for SimNvm {
    type Error = ();

    fn length(&self) -> usize {
        self.bytes.borrow().len()
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), ()> {
        buf.copy_from_slice(&self.bytes.borrow()[addr..addr + buf.len()]);
        Ok(())
    }

    fn update(&mut self, addr: usize, buf: &[u8]) -> Result<(), ()> {
        self.bytes.borrow_mut()[addr..addr + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}

#[derive(Default)]
pub struct SimAssertionHook {
    pub failures: Vec<(&'static str, u32)>,
}

impl AssertionHook for SimAssertionHook {
    fn record(&mut self, file: &'static str, line: u32) {
        self.failures.push((file, line));
    }
}

/// Host callbacks handing out a one-byte payload (the node's own id) on
/// every cycle, so every joined SNODE produces observable uplink traffic.
#[derive(Default)]
pub struct DemoCallbacks;

impl SNodeCallbacks<DIAG_DEPTH> for DemoCallbacks {
    fn on_load(&mut self, payload: &mut [u8], info: &CbInfo<DIAG_DEPTH>) -> bool {
        payload[0] = info.node_id;
        true
    }
}

#[derive(Default)]
pub struct GDemoCallbacks {
    pub received: Vec<(NodeId, Rssi)>,
}

impl GNodeCallbacks for GDemoCallbacks {
    fn on_broadcast(&mut self, _payload: &[u8]) {}

    fn on_data(&mut self, payload: &[u8], rssi: Rssi) {
        self.received.push((payload[0], rssi));
    }
}

enum Role {
    GNode(GNode<MAX_NODES, DATA_SIZE, DUP_WINDOW>, Scheduler<SimClock, GNodeTask, SCHED_CAP>, GDemoCallbacks),
    SNode(
        SNode<MAX_NODES, DATA_SIZE, DUP_WINDOW, DIAG_DEPTH>,
        Scheduler<SimClock, SNodeTask, SCHED_CAP>,
        DemoCallbacks,
    ),
}

/// One simulated node: its protocol-engine state plus every host-side trait
/// implementation the engine needs injected (radio, low power, clock, rng,
/// assertion hook, callbacks).
pub struct NodeDriver {
    location: Coordinates,
    role: Role,
    radio: SimRadio,
    low_power: SimLowPower,
    clock_cell: Rc<Cell<TimeMs>>,
    rng: rand_chacha::ChaCha8Rng,
    hook: SimAssertionHook,
}

impl NodeDriver {
    pub fn gnode(ether: Rc<RefCell<Ether>>, location: Coordinates, rng_seed: u64) -> Self {
        let clock = SimClock::new();
        let cell = clock.cell();
        Self {
            location,
            role: Role::GNode(GNode::new(), Scheduler::new(clock), GDemoCallbacks::default()),
            radio: SimRadio::new(0, ether, cell.clone(), rng_seed),
            low_power: SimLowPower::new(cell.clone()),
            clock_cell: cell,
            rng: rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed ^ 0x5EE1),
            hook: SimAssertionHook::default(),
        }
    }

    pub fn snode(id: NodeId, unique_key: u32, ether: Rc<RefCell<Ether>>, location: Coordinates, config: &SeelConfig, rng_seed: u64) -> Self {
        let clock = SimClock::new();
        let cell = clock.cell();
        Self {
            location,
            role: Role::SNode(SNode::new(id, unique_key, config), Scheduler::new(clock), DemoCallbacks),
            radio: SimRadio::new(id, ether, cell.clone(), rng_seed),
            low_power: SimLowPower::new(cell.clone()),
            clock_cell: cell,
            rng: rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed ^ 0x5EE1),
            hook: SimAssertionHook::default(),
        }
    }

    pub fn location(&self) -> &Coordinates {
        &self.location
    }

    pub fn is_gnode(&self) -> bool {
        matches!(self.role, Role::GNode(..))
    }

    pub fn id(&self) -> NodeId {
        match &self.role {
            Role::GNode(..) => 0,
            Role::SNode(s, ..) => s.node_id(),
        }
    }

    pub fn now(&self) -> TimeMs {
        self.clock_cell.get()
    }

    pub fn id_verified(&self) -> bool {
        match &self.role {
            Role::GNode(..) => true,
            Role::SNode(s, ..) => s.id_verified(),
        }
    }

    pub fn gnode_received(&self) -> Option<&[(NodeId, Rssi)]> {
        match &self.role {
            Role::GNode(_, _, cb) => Some(&cb.received),
            Role::SNode(..) => None,
        }
    }

    pub fn assertion_failures(&self) -> &[(&'static str, u32)] {
        &self.hook.failures
    }

    /// Bootstraps the first task for this node's cycle state machine.
    fn arm_initial(&mut self) {
        match &mut self.role {
            Role::GNode(_, sched, _) => {
                sched.add_task(GNodeTask::Bcast, 0, false);
            }
            Role::SNode(_, sched, _) => {
                sched.add_task(SNodeTask::Wake, 0, false);
            }
        }
    }

    fn next_runnable_time(&self) -> Option<TimeMs> {
        match &self.role {
            Role::GNode(_, sched, _) => sched.next_runnable_time(),
            Role::SNode(_, sched, _) => sched.next_runnable_time(),
        }
    }

    /// Runs exactly one scheduler step at the node's current clock value,
    /// dispatching whatever task (if any) became due. Returns whether a
    /// task actually ran.
    fn step(&mut self, config: &SeelConfig) -> bool {
        match &mut self.role {
            Role::GNode(g, sched, cb) => {
                let Some(task) = sched.step() else {
                    return false;
                };
                match task {
                    GNodeTask::Bcast => g.bcast_task(sched, &mut self.radio, cb, config),
                    GNodeTask::Receive => {
                        g.receive_task(&mut self.radio, cb, &mut self.hook, config.max_cycle_misses);
                        g.send_ack_if_pending(&mut self.radio);
                        sched.add_task(GNodeTask::Receive, 0, false);
                    }
                    GNodeTask::None => {}
                }
                true
            }
            Role::SNode(s, sched, cb) => {
                let Some(task) = sched.step() else {
                    return false;
                };
                match task {
                    SNodeTask::Wake => s.wake_task(sched, config),
                    SNodeTask::Receive => s.receive_task(sched, &mut self.radio, cb, &mut self.hook, config, &mut self.rng),
                    SNodeTask::Enqueue => s.enqueue_task(sched),
                    SNodeTask::Send => s.send_task(sched, &mut self.radio, cb, config, &mut self.rng),
                    SNodeTask::User => s.user_task(sched, cb, 1_000),
                    SNodeTask::Sleep => s.sleep_task(sched, &mut self.radio, &mut self.low_power, NOMINAL_TICK_MS, config),
                    SNodeTask::ForceSleep => s.force_sleep_task(sched),
                    SNodeTask::None => {}
                }
                true
            }
        }
    }
}

/// One entry of the simulator's global event queue: "node `node_id` has
/// work to do no earlier than `time`".
#[derive(Debug, Clone, Eq, PartialEq)]
struct WakeEvent {
    time: TimeMs,
    node_id: NodeId,
}

impl Ord for WakeEvent {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time.cmp(&other.time)
    }
}
impl PartialOrd for WakeEvent {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Upper bound on tasks drained per node per event-queue pop. A cascade of
/// same-timestamp tasks (e.g. Wake -> Receive -> Enqueue -> Send) settles in
/// a handful of steps; `Receive` re-arms itself at delay 0 forever, so the
/// drain always stops here rather than spinning -- matching the real
/// firmware's "once per loop iteration" cadence.
const MAX_STEPS_PER_EVENT: usize = 8;

/// Runs the network for `duration_ms` of simulated time. `config` is shared
/// by every node, as a real deployment provisions them identically.
pub fn run(mut nodes: Vec<NodeDriver>, duration_ms: TimeMs, config: &SeelConfig) -> Vec<NodeDriver> {
    let mut queue: SortedLinkedList<WakeEvent> = SortedLinkedList::new();
    for (idx, node) in nodes.iter_mut().enumerate() {
        node.arm_initial();
        queue.push(WakeEvent { time: 0, node_id: idx as NodeId });
    }

    while let Some(event) = queue.pop() {
        if event.time > duration_ms {
            continue;
        }
        let node = &mut nodes[event.node_id as usize];
        let advanced = event.time.max(node.now());
        node.clock_cell.set(advanced);

        for _ in 0..MAX_STEPS_PER_EVENT {
            if !node.step(config) {
                break;
            }
        }

        let next = node.next_runnable_time().map(|t| t.max(node.now() + 1)).unwrap_or(node.now() + 1);
        if next <= duration_ms {
            queue.push(WakeEvent { time: next, node_id: event.node_id });
        }
    }

    nodes
}

pub fn write_metadata_to_file(nodes: &[NodeDriver], node_range: u32, file_path: &str) -> io::Result<()> {
    let mut node_loc_file = File::create(file_path)?;
    node_loc_file.write_all(format!("{{\n\"node_range\":{node_range},\n").as_bytes())?;
    node_loc_file.write_all("\"nodes\":\n[\n".as_bytes())?;
    let mut node_iter = nodes.iter();
    let mut next = node_iter.next();
    while let Some(node) = next {
        node_loc_file.write_all(
            format!(
                "{{\"id\":{},\"location\":{{\"x\":{},\"y\":{}}}}}",
                node.id(),
                node.location().x,
                node.location().y
            )
            .as_bytes(),
        )?;
        next = node_iter.next();
        if next.is_some() {
            node_loc_file.write_all(",".as_bytes())?;
        }
        node_loc_file.write_all("\n".as_bytes())?;
    }
    node_loc_file.write_all("]\n}\n".as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> SeelConfig {
        SeelConfig::default()
    }

    #[test]
    fn single_hop_join_and_upload() {
        let config = default_config();
        let locations = vec![Coordinates::from((0, 0)), Coordinates::from((5, 0))];
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 50, None)));

        let gnode = NodeDriver::gnode(ether.clone(), locations[0], 1);
        let snode = NodeDriver::snode(42, 0xCAFE_BABE, ether, locations[1], &config, 2);

        let nodes = run(vec![gnode, snode], 60_000, &config);

        assert!(nodes[1].id_verified(), "child should have completed id verification");
        assert!(nodes[0].gnode_received().unwrap().iter().any(|(id, _)| *id == 42));
    }

    #[test]
    fn out_of_range_node_never_joins() {
        let config = default_config();
        let locations = vec![Coordinates::from((0, 0)), Coordinates::from((1000, 0))];
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 50, None)));

        let gnode = NodeDriver::gnode(ether.clone(), locations[0], 1);
        let snode = NodeDriver::snode(7, 0x1234, ether, locations[1], &config, 2);

        let nodes = run(vec![gnode, snode], 60_000, &config);
        assert!(!nodes[1].id_verified());
    }

    #[test]
    fn multi_hop_chain_forwards_to_root() {
        let config = default_config();
        let locations = vec![Coordinates::from((0, 0)), Coordinates::from((8, 0)), Coordinates::from((16, 0))];
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 12, None)));

        let gnode = NodeDriver::gnode(ether.clone(), locations[0], 10);
        let mid = NodeDriver::snode(1, 0xAAAA, ether.clone(), locations[1], &config, 11);
        let leaf = NodeDriver::snode(2, 0xBBBB, ether, locations[2], &config, 12);

        let nodes = run(vec![gnode, mid, leaf], 120_000, &config);
        assert!(nodes[1].id_verified());
        assert!(nodes[2].id_verified());
    }
}
