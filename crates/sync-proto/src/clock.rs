//! Vector clocks for causality tracking between operations.

use crate::error::{Error, Result};
use crate::id::Id128;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A vector clock mapping device id to that device's logical counter.
///
/// `BTreeMap` keeps devices in a stable order so two vector clocks with the
/// same entries always compare and encode identically.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(BTreeMap<Id128, u64>);

/// The relationship between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    Equal,
    Less,
    Greater,
    /// Neither clock happened-before the other: a real conflict.
    Concurrent,
}

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn get(&self, device: &Id128) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Advance `device`'s counter by one and return the new value. Called
    /// once per captured operation on the originating device.
    pub fn increment(&mut self, device: Id128) -> u64 {
        let counter = self.0.entry(device).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Merge another clock into this one, taking the per-device maximum.
    /// Used both when receiving a remote operation and when a replica
    /// catches up to a peer's vector clock during sync.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(*device).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// Compare two clocks by the happens-before relation.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_greater = false;
        let mut other_greater = false;

        let mut devices: Vec<&Id128> = self.0.keys().chain(other.0.keys()).collect();
        devices.sort();
        devices.dedup();

        for device in devices {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Greater => self_greater = true,
                Ordering::Less => other_greater = true,
                Ordering::Equal => {}
            }
        }

        match (self_greater, other_greater) {
            (false, false) => ClockOrdering::Equal,
            (true, false) => ClockOrdering::Greater,
            (false, true) => ClockOrdering::Less,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    pub fn happens_before(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Less)
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), ClockOrdering::Concurrent)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(&self.0).map_err(Error::from)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map(Self).map_err(Error::from)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Id128, &u64)> {
        self.0.iter()
    }
}
