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

//! Non-fatal invariant assertions and their wear-leveled NVM backing log
//! (spec §6 "Assertion NVM layout", §7, §9 Open Question 1).
//!
//! Resolution of Open Question 1: the 4-byte-per-entry ring format is
//! normative. Each entry is `[used_flag:1 | file_id>>8:7, file_id & 0xFF,
//! line>>8, line & 0xFF]`, giving a 15-bit file id (MAX_FILE_NUM = 32767) and
//! a 16-bit line number (MAX_LINE_NUM = 65535). Source file *paths* don't fit
//! a 15-bit field, so `file_id` is derived by folding `file!()`'s bytes down
//! with a small FNV-1a style hash truncated to 15 bits; this is a diagnostic
//! identifier only; it never influences protocol decisions, only what a human
//! reading the fault log sees.

use seel_api::AssertionHook;
use seel_api::Nvm;

#[cfg(feature = "defmt")]
#[allow(unused_imports)]
use defmt::error;
#[cfg(not(feature = "defmt"))]
#[allow(unused_imports)]
use log::error;

/// Non-fatal assertion: on failure, logs and calls the injected
/// [`AssertionHook`] instead of panicking. Matches §7's "Invariant
/// violation -> call assertion hook with (file, line), continue best-effort."
#[macro_export]
macro_rules! seel_assert {
    ($hook:expr, $cond:expr) => {
        if !($cond) {
            $crate::assert::assertion_failed($hook, file!(), line!());
        }
    };
}

#[doc(hidden)]
pub fn assertion_failed(hook: &mut impl AssertionHook, file: &'static str, line: u32) {
    error!("assertion failed at {}:{}", file, line);
    hook.record(file, line);
}

fn file_id(file: &'static str) -> u16 {
    let mut hash: u32 = 2166136261;
    for b in file.as_bytes() {
        hash ^= *b as u32;
        hash = hash.wrapping_mul(16777619);
    }
    (hash & 0x7FFF) as u16
}

fn encode_entry(used: bool, file: u16, line: u32) -> [u8; 4] {
    let line = (line & 0xFFFF) as u16;
    [
        ((used as u8) << 7) | ((file >> 8) as u8 & 0x7F),
        (file & 0xFF) as u8,
        (line >> 8) as u8,
        (line & 0xFF) as u8,
    ]
}

fn decode_used(entry: &[u8; 4]) -> bool {
    entry[0] & 0x80 != 0
}

/// A ring of 4-byte assertion entries backed by an [`Nvm`] implementation.
/// `NUM_ENTRIES` is the ring capacity; the NVM region used is
/// `NUM_ENTRIES * 4` bytes starting at `base_addr`.
pub struct NvmAssertionLog<N: Nvm, const NUM_ENTRIES: usize> {
    nvm: N,
    base_addr: usize,
    start: usize,
    len: usize,
}

impl<N: Nvm, const NUM_ENTRIES: usize> NvmAssertionLog<N, NUM_ENTRIES> {
    fn entry_addr(&self, idx: usize) -> usize {
        self.base_addr + idx * 4
    }

    fn read_entry(&self, idx: usize) -> [u8; 4] {
        let mut buf = [0u8; 4];
        let _ = self.nvm.read(self.entry_addr(idx), &mut buf);
        buf
    }

    fn write_entry(&mut self, idx: usize, used: bool, file: u16, line: u32) {
        let bytes = encode_entry(used, file, line);
        let addr = self.entry_addr(idx);
        let _ = self.nvm.update(addr, &bytes);
    }

    /// Scans the NVM ring to find the current head (`start`) and the length
    /// of the contiguous used run starting there (spec §6: "init scans
    /// 4-byte strides to find start (first free->used transition) + length
    /// (contiguous used-run, possibly wrap)").
    pub fn init(nvm: N, base_addr: usize) -> Self {
        let mut log = Self {
            nvm,
            base_addr,
            start: 0,
            len: 0,
        };
        if NUM_ENTRIES == 0 {
            return log;
        }

        let mut start = 0usize;
        let mut found_start = false;
        for i in 0..NUM_ENTRIES {
            let prev = (i + NUM_ENTRIES - 1) % NUM_ENTRIES;
            let prev_used = decode_used(&log.read_entry(prev));
            let this_used = decode_used(&log.read_entry(i));
            if !prev_used && this_used {
                start = i;
                found_start = true;
                break;
            }
        }
        if !found_start {
            log.start = 0;
            log.len = 0;
            return log;
        }
        let mut len = 0usize;
        for offset in 0..NUM_ENTRIES {
            let idx = (start + offset) % NUM_ENTRIES;
            if decode_used(&log.read_entry(idx)) {
                len += 1;
            } else {
                break;
            }
        }
        log.start = start;
        log.len = len;
        log
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends a new entry at `(start + len) mod NUM_ENTRIES`. Refuses if the
    /// ring is already full.
    pub fn add(&mut self, file: &'static str, line: u32) -> bool {
        if self.len >= NUM_ENTRIES {
            return false;
        }
        let idx = (self.start + self.len) % NUM_ENTRIES;
        self.write_entry(idx, true, file_id(file), line);
        self.len += 1;
        true
    }

    /// Zeroes every used entry's lead cell, then advances the ring head and
    /// leaves a single dummy entry occupied, so a subsequent `init` still
    /// finds a valid (empty-but-for-the-dummy) head.
    pub fn clear(&mut self) {
        if NUM_ENTRIES == 0 {
            return;
        }
        for offset in 0..self.len {
            let idx = (self.start + offset) % NUM_ENTRIES;
            self.write_entry(idx, false, 0, 0);
        }
        let new_head = (self.start + self.len) % NUM_ENTRIES;
        self.write_entry(new_head, true, 0, 0);
        self.start = new_head;
        self.len = 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemNvm {
        bytes: RefCell<std::vec::Vec<u8>>,
    }
    impl MemNvm {
        fn new(len: usize) -> Self {
            Self {
                bytes: RefCell::new(std::vec![0u8; len]),
            }
        }
    }
    impl Nvm for MemNvm {
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

    #[test]
    fn fresh_nvm_inits_empty() {
        let nvm = MemNvm::new(4 * 8);
        let log = NvmAssertionLog::<MemNvm, 8>::init(nvm, 0);
        assert!(log.is_empty());
    }

    #[test]
    fn add_then_reinit_recovers_same_length() {
        let nvm = MemNvm::new(4 * 8);
        let mut log = NvmAssertionLog::<MemNvm, 8>::init(nvm, 0);
        log.add("a.rs", 10);
        log.add("b.rs", 20);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn clear_then_reinit_leaves_only_dummy_head() {
        let nvm = MemNvm::new(4 * 8);
        let mut log = NvmAssertionLog::<MemNvm, 8>::init(nvm, 0);
        log.add("a.rs", 1);
        log.add("b.rs", 2);
        log.clear();
        assert_eq!(log.len(), 1);

        // subsequent adds begin at the new ring head
        log.add("c.rs", 3);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn ring_refuses_past_capacity() {
        let nvm = MemNvm::new(4 * 2);
        let mut log = NvmAssertionLog::<MemNvm, 2>::init(nvm, 0);
        assert!(log.add("a.rs", 1));
        assert!(log.add("b.rs", 2));
        assert!(!log.add("c.rs", 3));
    }
}
