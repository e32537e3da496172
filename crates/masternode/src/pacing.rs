//! Request pacing state.
//!
//! Every table stores an absolute deadline; entries may be replaced with a
//! later deadline and are purged once the deadline is in the past.

use std::collections::HashMap;

use zocd_primitives::NetAddr;

/// How long a fulfilled-request flag shields a peer from repeats.
pub const FULFILLED_REQUEST_EXPIRE_SECONDS: i64 = 2 * 60 * 60;

pub const FULFILLED_MNV_REQUEST: &str = "mnverify-request";
pub const FULFILLED_MNV_REPLY: &str = "mnverify-reply";
pub const FULFILLED_MNV_DONE: &str = "mnverify-done";

/// Which one-shot requests a peer has already used up, keyed by address and
/// request tag.
#[derive(Clone, Debug, Default)]
pub struct FulfilledRequests {
    entries: HashMap<(NetAddr, &'static str), i64>,
}

impl FulfilledRequests {
    pub fn has(&self, addr: &NetAddr, tag: &'static str, now: i64) -> bool {
        match self.entries.get(&(*addr, tag)) {
            Some(expires) => *expires > now,
            None => false,
        }
    }

    pub fn add(&mut self, addr: &NetAddr, tag: &'static str, now: i64) {
        self.entries
            .insert((*addr, tag), now + FULFILLED_REQUEST_EXPIRE_SECONDS);
    }

    pub fn remove(&mut self, addr: &NetAddr, tag: &'static str) {
        self.entries.remove(&(*addr, tag));
    }

    pub fn expire(&mut self, now: i64) {
        self.entries.retain(|_, expires| *expires > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Drop entries whose deadline has passed.
pub fn expire_deadlines<K: std::hash::Hash + Eq>(map: &mut HashMap<K, i64>, now: i64) {
    map.retain(|_, deadline| *deadline >= now);
}
