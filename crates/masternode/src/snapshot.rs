//! Snapshot persistence.
//!
//! One blob, prefixed with a version tag, holding the registry, the pacing
//! tables and the seen-message caches. A mismatched tag refuses to load and
//! the manager starts empty. Transport-bound tables (scheduled and pending
//! requests, outstanding nonce bindings, fulfilled flags) are volatile and
//! never persisted.

use std::fmt;

use zocd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use zocd_primitives::{NetAddr, OutPoint};
use zocd_storage::{Column, KeyValueStore, StoreError};

use crate::manager::{ManagerState, MasternodeManager, RecoveryRequest, SeenBroadcast};
use crate::messages::{MasternodeBroadcast, MasternodeVerification};
use crate::record::{Masternode, MasternodePing};

pub const SNAPSHOT_VERSION_TAG: &str = "CMasternodeMan-Version-8";

const SNAPSHOT_KEY: &[u8] = b"snapshot";

#[derive(Debug)]
pub enum SnapshotError {
    /// The stored blob carries a different version tag; do not load it.
    VersionMismatch { found: String },
    Decode(DecodeError),
    Store(StoreError),
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SnapshotError::VersionMismatch { found } => {
                write!(f, "snapshot version mismatch: found {found:?}, expected {SNAPSHOT_VERSION_TAG:?}")
            }
            SnapshotError::Decode(err) => write!(f, "snapshot decode failed: {err}"),
            SnapshotError::Store(err) => write!(f, "snapshot store failed: {err}"),
        }
    }
}

impl std::error::Error for SnapshotError {}

impl From<DecodeError> for SnapshotError {
    fn from(err: DecodeError) -> Self {
        SnapshotError::Decode(err)
    }
}

impl From<StoreError> for SnapshotError {
    fn from(err: StoreError) -> Self {
        SnapshotError::Store(err)
    }
}

fn sorted<K: Ord + Copy, V>(map: &std::collections::HashMap<K, V>) -> Vec<(K, &V)> {
    let mut entries: Vec<(K, &V)> = map.iter().map(|(key, value)| (*key, value)).collect();
    entries.sort_by_key(|(key, _)| *key);
    entries
}

pub(crate) fn encode_snapshot(state: &ManagerState) -> Vec<u8> {
    let mut encoder = Encoder::new();
    encoder.write_var_str(SNAPSHOT_VERSION_TAG);

    encoder.write_varint(state.masternodes.len() as u64);
    for record in state.masternodes.values() {
        record.consensus_encode(&mut encoder);
    }

    write_deadline_map(&mut encoder, &state.asked_us_for_list);
    write_deadline_map(&mut encoder, &state.we_asked_for_list);

    encoder.write_varint(state.we_asked_for_entry.len() as u64);
    let mut entries: Vec<(&OutPoint, _)> = state.we_asked_for_entry.iter().collect();
    entries.sort_by_key(|(outpoint, _)| **outpoint);
    for (outpoint, peers) in entries {
        outpoint.consensus_encode(&mut encoder);
        write_deadline_map(&mut encoder, peers);
    }

    encoder.write_varint(state.recovery_requests.len() as u64);
    for (hash, request) in sorted(&state.recovery_requests) {
        encoder.write_hash(&hash);
        encoder.write_i64_le(request.deadline);
        encoder.write_varint(request.asked.len() as u64);
        for addr in &request.asked {
            addr.consensus_encode(&mut encoder);
        }
    }

    encoder.write_varint(state.recovery_good_replies.len() as u64);
    for (hash, replies) in sorted(&state.recovery_good_replies) {
        encoder.write_hash(&hash);
        encoder.write_varint(replies.len() as u64);
        for mnb in replies {
            mnb.consensus_encode(&mut encoder);
        }
    }

    encoder.write_varint(state.seen_broadcast.len() as u64);
    for (hash, seen) in sorted(&state.seen_broadcast) {
        encoder.write_hash(&hash);
        encoder.write_i64_le(seen.first_seen);
        seen.broadcast.consensus_encode(&mut encoder);
    }

    encoder.write_varint(state.seen_ping.len() as u64);
    for (hash, ping) in sorted(&state.seen_ping) {
        encoder.write_hash(&hash);
        ping.consensus_encode(&mut encoder);
    }

    encoder.write_varint(state.seen_verification.len() as u64);
    for (hash, mnv) in sorted(&state.seen_verification) {
        encoder.write_hash(&hash);
        mnv.consensus_encode(&mut encoder);
    }

    encoder.write_i64_le(state.last_sentinel_ping_time);
    encoder.write_i64_le(state.dsq_count);
    encoder.into_inner()
}

fn write_deadline_map(encoder: &mut Encoder, map: &std::collections::HashMap<NetAddr, i64>) {
    encoder.write_varint(map.len() as u64);
    for (addr, deadline) in sorted(map) {
        addr.consensus_encode(encoder);
        encoder.write_i64_le(*deadline);
    }
}

fn read_deadline_map(
    decoder: &mut Decoder<'_>,
) -> Result<std::collections::HashMap<NetAddr, i64>, DecodeError> {
    let count = decoder.read_varint()?;
    let mut map = std::collections::HashMap::new();
    for _ in 0..count {
        let addr = NetAddr::consensus_decode(decoder)?;
        let deadline = decoder.read_i64_le()?;
        map.insert(addr, deadline);
    }
    Ok(map)
}

pub(crate) fn decode_snapshot(bytes: &[u8]) -> Result<ManagerState, SnapshotError> {
    let mut decoder = Decoder::new(bytes);

    let tag = decoder.read_var_str()?;
    if tag != SNAPSHOT_VERSION_TAG {
        return Err(SnapshotError::VersionMismatch { found: tag });
    }

    let mut state = ManagerState::default();

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let record = Masternode::consensus_decode(&mut decoder)?;
        state.masternodes.insert(record.outpoint, record);
    }

    state.asked_us_for_list = read_deadline_map(&mut decoder)?;
    state.we_asked_for_list = read_deadline_map(&mut decoder)?;

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let outpoint = OutPoint::consensus_decode(&mut decoder)?;
        let peers = read_deadline_map(&mut decoder)?;
        state.we_asked_for_entry.insert(outpoint, peers);
    }

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let hash = decoder.read_hash()?;
        let deadline = decoder.read_i64_le()?;
        let asked_count = decoder.read_varint()?;
        let mut asked = std::collections::BTreeSet::new();
        for _ in 0..asked_count {
            asked.insert(NetAddr::consensus_decode(&mut decoder)?);
        }
        state
            .recovery_requests
            .insert(hash, RecoveryRequest { deadline, asked });
    }

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let hash = decoder.read_hash()?;
        let reply_count = decoder.read_varint()?;
        let mut replies = Vec::new();
        for _ in 0..reply_count {
            replies.push(MasternodeBroadcast::consensus_decode(&mut decoder)?);
        }
        state.recovery_good_replies.insert(hash, replies);
    }

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let hash = decoder.read_hash()?;
        let first_seen = decoder.read_i64_le()?;
        let broadcast = MasternodeBroadcast::consensus_decode(&mut decoder)?;
        state.seen_broadcast.insert(
            hash,
            SeenBroadcast {
                first_seen,
                broadcast,
            },
        );
    }

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let hash = decoder.read_hash()?;
        state
            .seen_ping
            .insert(hash, MasternodePing::consensus_decode(&mut decoder)?);
    }

    let count = decoder.read_varint()?;
    for _ in 0..count {
        let hash = decoder.read_hash()?;
        state
            .seen_verification
            .insert(hash, MasternodeVerification::consensus_decode(&mut decoder)?);
    }

    state.last_sentinel_ping_time = decoder.read_i64_le()?;
    state.dsq_count = decoder.read_i64_le()?;

    if !decoder.is_empty() {
        return Err(SnapshotError::Decode(DecodeError::TrailingBytes));
    }
    Ok(state)
}

impl MasternodeManager {
    /// Serialize the current state to the store.
    pub fn save(&self, store: &dyn KeyValueStore) -> Result<(), SnapshotError> {
        let bytes = {
            let Some(state) = self.lock_state() else {
                return Ok(());
            };
            encode_snapshot(&state)
        };
        store.put(Column::MasternodeMan, SNAPSHOT_KEY, &bytes)?;
        Ok(())
    }

    /// Load a stored snapshot, replacing the persisted portion of the state.
    /// Returns whether a snapshot was found. A version mismatch is an error;
    /// the caller is expected to start empty.
    pub fn load(&self, store: &dyn KeyValueStore) -> Result<bool, SnapshotError> {
        let Some(bytes) = store.get(Column::MasternodeMan, SNAPSHOT_KEY)? else {
            return Ok(false);
        };
        let loaded = decode_snapshot(&bytes)?;
        let Some(mut state) = self.lock_state() else {
            return Ok(false);
        };
        let cached_height = state.cached_block_height;
        *state = loaded;
        state.cached_block_height = cached_height;
        println!(
            "masternode: loaded {} records from snapshot",
            state.masternodes.len()
        );
        Ok(true)
    }
}
