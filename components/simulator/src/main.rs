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

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};
use rand::{RngCore, SeedableRng};
use std::{cell::RefCell, env, rc::Rc};

use seel_core::config::SeelConfig;

mod logger;
mod sim;

use crate::sim::*;

/// Minimum distance between nodes. Avoids overlapping nodes.
const MIN_NODE_DISTANCE: u32 = 10;
/// Height and width of the square area nodes are scattered over.
const AREA_SIZE: u32 = 100;
/// Probability of a transmission error, in parts per thousand.
const PACKET_ERROR_RATE_PPT: Option<u32> = None;

const EVENT_FILE_PATH: &str = "/tmp/seel_events.csv";
const SIMULATION_METADATA_FILE_PATH: &str = "/tmp/seel_sim_meta.json";

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut rng_seed: u64 = 0;
    let mut num_nodes: usize = 15;
    let mut simulation_minutes: usize = 90;
    // Nodes farther apart from each other than this value are not in range of each other.
    let mut range: u32 = 30;

    for chunk in args[1..].chunks_exact(2) {
        let (arg, val) = (&chunk[0], &chunk[1]);
        match arg.as_str() {
            "--seed" => rng_seed = val.parse().expect("invalid rng seed"),
            "--nodes" => num_nodes = val.parse().expect("invalid number of nodes"),
            "--range" => range = val.parse().expect("invalid range"),
            "--time_min" => simulation_minutes = val.parse().expect("invalid number of simulation minutes"),
            _ => panic!("unknown argument: {arg}"),
        }
    }

    assert!(num_nodes >= 1, "need at least the GNODE");

    let mut rng = get_rng(rng_seed);
    let config = SeelConfig::default();

    let locations = scatter_nodes(num_nodes, &mut rng);
    let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), range, PACKET_ERROR_RATE_PPT)));

    let mut nodes = Vec::with_capacity(num_nodes);
    nodes.push(NodeDriver::gnode(ether.clone(), locations[0], rng.next_u64()));
    for (idx, location) in locations.iter().enumerate().skip(1) {
        let unique_key = rng.next_u32();
        nodes.push(NodeDriver::snode(idx as u8, unique_key, ether.clone(), *location, &config, rng.next_u64()));
    }

    write_metadata_to_file(&nodes, range, SIMULATION_METADATA_FILE_PATH).unwrap();
    logger::init(log::Level::Trace, Some(EVENT_FILE_PATH)).unwrap();

    let duration_ms = (simulation_minutes as u32) * 60 * 1000;
    let nodes = run(nodes, duration_ms, &config);

    let mut joined: Vec<_> = nodes.iter().skip(1).filter(|n| n.id_verified()).map(|n| n.id()).collect();
    joined.sort_unstable();
    println!("{joined:?}");
}

fn get_rng(rng_seed: u64) -> impl RngCore {
    println!("RNG seed: {rng_seed:#x}");
    rand_chacha::ChaCha8Rng::seed_from_u64(rng_seed)
}

/// Scatters `num_nodes` coordinates over an `AREA_SIZE` square, rejecting
/// placements closer than `MIN_NODE_DISTANCE` to an already-placed node.
fn scatter_nodes(num_nodes: usize, rng: &mut impl RngCore) -> Vec<Coordinates> {
    let mut locations = Vec::with_capacity(num_nodes);
    while locations.len() != num_nodes {
        let candidate = Coordinates {
            x: (rng.next_u32() % AREA_SIZE) as i64,
            y: (rng.next_u32() % AREA_SIZE) as i64,
        };
        if !locations.iter().any(|c| get_distance(&candidate, c) < MIN_NODE_DISTANCE as f32) {
            locations.push(candidate);
        }
    }
    locations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_config() -> SeelConfig {
        SeelConfig::default()
    }

    /// Builds a fully visible network (node 0 is the GNODE, the rest are
    /// SNODEs at the origin so every pairwise distance is zero) and runs it
    /// for `minutes`.
    fn run_fully_visible(num_nodes: u8, minutes: u32) -> Vec<NodeDriver> {
        let config = default_config();
        let locations = vec![Coordinates::default(); num_nodes as usize];
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 1_000_000, None)));

        let mut nodes = Vec::with_capacity(num_nodes as usize);
        nodes.push(NodeDriver::gnode(ether.clone(), locations[0], 1));
        for id in 1..num_nodes {
            nodes.push(NodeDriver::snode(id, 0x1000 + id as u32, ether.clone(), locations[id as usize], &config, 100 + id as u64));
        }

        run(nodes, minutes * 60 * 1000, &config)
    }

    #[test]
    fn single_sink_two_children_both_join() {
        let nodes = run_fully_visible(3, 60);
        assert!(nodes[1].id_verified());
        assert!(nodes[2].id_verified());
    }

    /// One GNODE with four children, all nodes see each other.
    #[test]
    fn children() {
        let num_nodes = 5;
        let nodes = run_fully_visible(num_nodes, 2 * 60);
        for n in 1..num_nodes {
            assert!(nodes[n as usize].id_verified(), "node {n} never joined");
        }
    }

    /// One GNODE with many children, all nodes see each other.
    #[test]
    fn more_children() {
        let num_nodes = 9;
        let nodes = run_fully_visible(num_nodes, 4 * 60);
        for n in 1..num_nodes {
            assert!(nodes[n as usize].id_verified(), "node {n} never joined");
        }
    }

    /// Linear chain: each node only sees its immediate neighbors. Requires
    /// beacon rebroadcast to propagate hop-by-hop down the chain.
    #[test]
    fn chain3() {
        let config = default_config();
        let locations: Vec<_> = (0..3).map(|i| Coordinates::from((i * 8, 0))).collect();
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 10, None)));

        let gnode = NodeDriver::gnode(ether.clone(), locations[0], 1);
        let a = NodeDriver::snode(1, 0xAAAA, ether.clone(), locations[1], &config, 2);
        let b = NodeDriver::snode(2, 0xBBBB, ether, locations[2], &config, 3);

        let nodes = run(vec![gnode, a, b], 120 * 1000, &config);
        assert!(nodes[1].id_verified());
        assert!(nodes[2].id_verified());
    }

    #[test]
    fn chain4() {
        let config = default_config();
        let locations: Vec<_> = (0..4).map(|i| Coordinates::from((i * 8, 0))).collect();
        let ether = Rc::new(RefCell::new(Ether::new(locations.clone(), 10, None)));

        let gnode = NodeDriver::gnode(ether.clone(), locations[0], 1);
        let mut nodes = vec![gnode];
        for id in 1..4u8 {
            nodes.push(NodeDriver::snode(id, 0x1000 + id as u32, ether.clone(), locations[id as usize], &config, 10 + id as u64));
        }

        let nodes = run(nodes, 180 * 1000, &config);
        for n in 1..4 {
            assert!(nodes[n].id_verified(), "node {n} never joined");
        }
    }
}
