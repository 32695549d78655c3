// Copyright 2026-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Hash set of sampled allocation addresses with a lock-free read path.
//!
//! The set is a flat open-addressed table of atomic slots. One writer at a
//! time mutates it (the sampler serializes writers under its own mutex) while
//! any number of readers call [`LockFreeAddressHashSet::contains`] without
//! synchronization. The table never grows in place: the sampler builds a
//! doubled copy and publishes it through an atomic pointer, leaking the old
//! table so readers holding it stay valid.

use std::sync::atomic::{AtomicUsize, Ordering};

use rustc_hash::FxHasher;
use std::hash::Hasher;

/// Slot value for a bucket that has never held a key.
const EMPTY_SLOT: usize = 0;
/// Slot value for a bucket whose key was removed. Probes continue past it;
/// inserts may reuse it.
const TOMBSTONE_SLOT: usize = 1;

/// Open-addressed set of addresses, single writer, lock-free readers.
///
/// Keys are raw allocation addresses. Real allocations are pointer-aligned,
/// so a key is never `0` or `1` and cannot collide with the slot markers.
///
/// `insert` and `remove` must be serialized by the caller; `contains` and the
/// size accessors may race with them freely.
pub struct LockFreeAddressHashSet {
    buckets: Box<[AtomicUsize]>,
    bucket_mask: usize,
    len: AtomicUsize,
}

impl LockFreeAddressHashSet {
    /// # Panics
    ///
    /// Panics if `buckets` is not a power of two.
    pub fn with_buckets(buckets: usize) -> Self {
        assert!(
            buckets.is_power_of_two(),
            "bucket count {buckets} is not a power of two"
        );
        let slots: Vec<AtomicUsize> = (0..buckets).map(|_| AtomicUsize::new(EMPTY_SLOT)).collect();
        Self {
            buckets: slots.into_boxed_slice(),
            bucket_mask: buckets - 1,
            len: AtomicUsize::new(0),
        }
    }

    fn bucket_index(&self, address: usize) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_usize(address);
        (hasher.finish() as usize) & self.bucket_mask
    }

    /// Lock-free membership test. Terminates at the first empty slot on the
    /// probe path, or after one full cycle of a table with no empty slots.
    pub fn contains(&self, address: usize) -> bool {
        debug_assert!(address > TOMBSTONE_SLOT);
        let start = self.bucket_index(address);
        let mut index = start;
        loop {
            match self.buckets[index].load(Ordering::Relaxed) {
                slot if slot == address => return true,
                EMPTY_SLOT => return false,
                _ => {}
            }
            index = (index + 1) & self.bucket_mask;
            if index == start {
                return false;
            }
        }
    }

    /// Inserts `address`, reusing the first tombstone on the probe path.
    /// Returns false if the key was already present. Writer-side: the caller
    /// must hold the external lock that serializes mutation.
    pub fn insert(&self, address: usize) -> bool {
        debug_assert!(address > TOMBSTONE_SLOT);
        let start = self.bucket_index(address);
        let mut index = start;
        let mut reusable: Option<usize> = None;
        loop {
            match self.buckets[index].load(Ordering::Relaxed) {
                slot if slot == address => return false,
                EMPTY_SLOT => {
                    self.set_slot(reusable.unwrap_or(index), address);
                    return true;
                }
                TOMBSTONE_SLOT => {
                    if reusable.is_none() {
                        reusable = Some(index);
                    }
                }
                _ => {}
            }
            index = (index + 1) & self.bucket_mask;
            if index == start {
                break;
            }
        }
        match reusable {
            Some(slot) => {
                self.set_slot(slot, address);
                true
            }
            None => {
                // Growth keeps the load factor under 1, so a full table with
                // no tombstone means the caller broke that contract.
                #[allow(clippy::panic)]
                {
                    panic!("no free slot for address {address:#x}")
                }
            }
        }
    }

    fn set_slot(&self, index: usize, address: usize) {
        self.buckets[index].store(address, Ordering::Relaxed);
        self.len.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes `address`, leaving a tombstone. Returns false if it was not
    /// present. Writer-side, like [`LockFreeAddressHashSet::insert`].
    pub fn remove(&self, address: usize) -> bool {
        debug_assert!(address > TOMBSTONE_SLOT);
        let start = self.bucket_index(address);
        let mut index = start;
        loop {
            match self.buckets[index].load(Ordering::Relaxed) {
                slot if slot == address => {
                    self.buckets[index].store(TOMBSTONE_SLOT, Ordering::Relaxed);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return true;
                }
                EMPTY_SLOT => return false,
                _ => {}
            }
            index = (index + 1) & self.bucket_mask;
            if index == start {
                return false;
            }
        }
    }

    /// Copies every live key of `other` into this set. Tombstones are not
    /// carried over, which is what compacts them away on growth.
    pub fn copy_from(&self, other: &LockFreeAddressHashSet) {
        for slot in other.buckets.iter() {
            let address = slot.load(Ordering::Relaxed);
            if address > TOMBSTONE_SLOT {
                self.insert(address);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn buckets_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn load_factor(&self) -> f64 {
        self.len() as f64 / self.buckets.len() as f64
    }

    #[cfg(test)]
    fn raw_slots(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }
}
