//! The masternode manager: registry, pacing, gossip and housekeeping.
//!
//! Locking: `state` guards the registry and every pacing table; the pending
//! verification map has its own lock so the challenge path does not contend
//! with read-only queries. Lock order is chain reads first, then `state`,
//! then `pending_verifications`, and chain lookups are always prefetched
//! before `state` is taken.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use primitive_types::U256;
use rand::seq::SliceRandom;
use rand::Rng;
use zocd_consensus::constants::{
    CLIENT_DAEMON_VERSION, DSEG_UPDATE_SECONDS, LAST_PAID_SCAN_BLOCKS,
    MASTERNODE_FUTURE_SIGTIME_SLACK, MASTERNODE_MIN_MNP_SECONDS,
    MASTERNODE_NEW_START_REQUIRED_SECONDS, MASTERNODE_PING_BLOCK_DEPTH,
    MASTERNODE_POSE_BAN_MAX_SCORE,
    MASTERNODE_SENTINEL_PING_MAX_SECONDS, MAX_POSE_BLOCKS, MISBEHAVIOR_DSEG_SPAM,
    MNB_RECOVERY_MAX_ASK_ENTRIES, MNB_RECOVERY_QUORUM_REQUIRED, MNB_RECOVERY_QUORUM_TOTAL,
    MNB_RECOVERY_RETRY_SECONDS, MNB_RECOVERY_WAIT_SECONDS, PENDING_REQUEST_TIMEOUT_SECONDS,
    PROTOCOL_VERSION,
};
use zocd_consensus::{ChainParams, Hash256};
use zocd_primitives::{AddrFamily, NetAddr, OutPoint};

use crate::config::ManagerConfig;
use crate::messages::{
    Inventory, MasternodeBroadcast, MasternodeVerification, OverlayMessage, ProtocolError,
    MASTERNODE_SYNC_LIST, MSG_MASTERNODE_ANNOUNCE, MSG_MASTERNODE_PING,
};
use crate::pacing::{expire_deadlines, FulfilledRequests};
use crate::ports::{Collaborators, ConnectionManager, PeerHandle};
use crate::record::{CheckContext, Masternode, MasternodeInfo, MasternodePing};

#[derive(Clone, Debug)]
pub(crate) struct SeenBroadcast {
    pub first_seen: i64,
    pub broadcast: MasternodeBroadcast,
}

#[derive(Clone, Debug)]
pub(crate) struct RecoveryRequest {
    pub deadline: i64,
    pub asked: BTreeSet<NetAddr>,
}

#[derive(Default)]
pub(crate) struct ManagerState {
    pub masternodes: BTreeMap<OutPoint, Masternode>,
    pub asked_us_for_list: HashMap<NetAddr, i64>,
    pub we_asked_for_list: HashMap<NetAddr, i64>,
    pub we_asked_for_entry: HashMap<OutPoint, HashMap<NetAddr, i64>>,
    pub we_asked_for_verification: HashMap<NetAddr, MasternodeVerification>,
    pub fulfilled: FulfilledRequests,
    pub seen_broadcast: HashMap<Hash256, SeenBroadcast>,
    pub seen_ping: HashMap<Hash256, MasternodePing>,
    pub seen_verification: HashMap<Hash256, MasternodeVerification>,
    pub recovery_requests: HashMap<Hash256, RecoveryRequest>,
    pub recovery_good_replies: HashMap<Hash256, Vec<MasternodeBroadcast>>,
    pub scheduled_mnb_requests: Vec<(NetAddr, Hash256)>,
    pub pending_mnb: HashMap<NetAddr, (i64, BTreeSet<Hash256>)>,
    pub should_ask_for_verification: BTreeMap<OutPoint, i64>,
    pub dirty_governance_hashes: Vec<Hash256>,
    pub masternodes_added: bool,
    pub masternodes_removed: bool,
    pub last_sentinel_ping_time: i64,
    pub dsq_count: i64,
    pub cached_block_height: i32,
    pub last_paid_scan_height: i32,
    pub warned_daemon_updates: bool,
}

pub struct MasternodeManager {
    pub(crate) params: Arc<ChainParams>,
    pub(crate) config: ManagerConfig,
    pub(crate) collab: Collaborators,
    pub(crate) state: Mutex<ManagerState>,
    /// Verification requests queued for transport, keyed by responder.
    pub(crate) pending_verifications: Mutex<HashMap<NetAddr, (i64, MasternodeVerification)>>,
}

enum IngestOutcome {
    Seen,
    Updated { relay_hash: Hash256 },
    Added { relay_hash: Hash256, manage_local: bool },
    Rejected(&'static str),
}

impl MasternodeManager {
    pub fn new(params: Arc<ChainParams>, config: ManagerConfig, collab: Collaborators) -> Self {
        Self {
            params,
            config,
            collab,
            state: Mutex::new(ManagerState::default()),
            pending_verifications: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn now(&self) -> i64 {
        self.collab.time.now()
    }

    pub(crate) fn adjusted_now(&self) -> i64 {
        self.collab.time.adjusted_now()
    }

    pub(crate) fn lock_state(&self) -> Option<MutexGuard<'_, ManagerState>> {
        self.state.lock().ok()
    }

    /// Per-host pacing key; the port participates only where the chain
    /// allows several masternodes per host.
    pub(crate) fn pacing_key(&self, addr: &NetAddr) -> NetAddr {
        if self.params.allow_multiple_ports {
            *addr
        } else {
            addr.squashed()
        }
    }

    // ---- registry -------------------------------------------------------

    pub fn add(&self, record: Masternode) -> bool {
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        Self::add_locked(&mut state, record)
    }

    fn add_locked(state: &mut ManagerState, record: Masternode) -> bool {
        if state.masternodes.contains_key(&record.outpoint) {
            return false;
        }
        if state
            .masternodes
            .values()
            .any(|existing| !existing.is_pose_banned() && existing.addr == record.addr)
        {
            return false;
        }
        println!(
            "masternode: adding new record addr={} total={}",
            record.addr,
            state.masternodes.len() + 1
        );
        state.masternodes.insert(record.outpoint, record);
        state.masternodes_added = true;
        true
    }

    pub fn has(&self, outpoint: &OutPoint) -> bool {
        self.lock_state()
            .map(|state| state.masternodes.contains_key(outpoint))
            .unwrap_or(false)
    }

    pub fn has_addr(&self, addr: &NetAddr) -> bool {
        self.lock_state()
            .map(|state| state.masternodes.values().any(|mn| mn.addr == *addr))
            .unwrap_or(false)
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<Masternode> {
        self.lock_state()?.masternodes.get(outpoint).cloned()
    }

    pub fn get_info(&self, outpoint: &OutPoint) -> Option<MasternodeInfo> {
        self.lock_state()?
            .masternodes
            .get(outpoint)
            .map(Masternode::get_info)
    }

    pub fn get_info_by_pubkey(&self, pubkey_masternode: &[u8]) -> Option<MasternodeInfo> {
        self.lock_state()?
            .masternodes
            .values()
            .find(|mn| mn.pubkey_masternode == pubkey_masternode)
            .map(Masternode::get_info)
    }

    pub fn get_info_by_payee(&self, payee: &[u8]) -> Option<MasternodeInfo> {
        self.lock_state()?
            .masternodes
            .values()
            .find(|mn| mn.pubkey_collateral == payee)
            .map(Masternode::get_info)
    }

    pub fn size(&self) -> usize {
        self.lock_state()
            .map(|state| state.masternodes.len())
            .unwrap_or(0)
    }

    pub fn count_masternodes(&self, min_proto: Option<i32>) -> usize {
        let min_proto = min_proto.unwrap_or_else(|| self.collab.payments.min_payments_proto());
        self.lock_state()
            .map(|state| {
                state
                    .masternodes
                    .values()
                    .filter(|mn| mn.protocol_version >= min_proto)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn count_enabled(&self, min_proto: Option<i32>) -> usize {
        let min_proto = min_proto.unwrap_or_else(|| self.collab.payments.min_payments_proto());
        self.lock_state()
            .map(|state| {
                state
                    .masternodes
                    .values()
                    .filter(|mn| mn.protocol_version >= min_proto && mn.is_enabled())
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn count_by_family(&self, family: AddrFamily) -> usize {
        self.lock_state()
            .map(|state| {
                state
                    .masternodes
                    .values()
                    .filter(|mn| mn.addr.family() == family)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn clear(&self) {
        let Some(mut state) = self.lock_state() else {
            return;
        };
        *state = ManagerState::default();
    }

    pub fn allow_mixing(&self, outpoint: &OutPoint) -> bool {
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let state = &mut *state;
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        state.dsq_count += 1;
        record.last_dsq = state.dsq_count;
        record.allow_mixing_tx = true;
        true
    }

    pub fn disallow_mixing(&self, outpoint: &OutPoint) -> bool {
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        record.allow_mixing_tx = false;
        true
    }

    pub fn increase_pose_ban_score(&self, outpoint: &OutPoint) -> bool {
        // never against ourselves
        if *outpoint == self.collab.active.outpoint() {
            return false;
        }
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        record.increase_pose_ban_score();
        true
    }

    pub fn decrease_pose_ban_score(&self, outpoint: &OutPoint) -> bool {
        if *outpoint == self.collab.active.outpoint() {
            return false;
        }
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        record.decrease_pose_ban_score();
        true
    }

    pub fn pose_ban(&self, outpoint: &OutPoint) -> bool {
        if *outpoint == self.collab.active.outpoint() {
            return false;
        }
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        record.pose_ban();
        true
    }

    pub fn increase_pose_ban_score_by_addr(&self, addr: &NetAddr) -> bool {
        if Some(*addr) == self.collab.active.service() {
            return false;
        }
        let outpoint = {
            let Some(state) = self.lock_state() else {
                return false;
            };
            state
                .masternodes
                .values()
                .find(|mn| mn.addr == *addr)
                .map(|mn| mn.outpoint)
        };
        match outpoint {
            Some(outpoint) => self.increase_pose_ban_score(&outpoint),
            None => false,
        }
    }

    pub fn decrease_pose_ban_score_by_addr(&self, addr: &NetAddr) -> bool {
        if Some(*addr) == self.collab.active.service() {
            return false;
        }
        let outpoint = {
            let Some(state) = self.lock_state() else {
                return false;
            };
            state
                .masternodes
                .values()
                .find(|mn| mn.addr == *addr)
                .map(|mn| mn.outpoint)
        };
        match outpoint {
            Some(outpoint) => self.decrease_pose_ban_score(&outpoint),
            None => false,
        }
    }

    pub fn pose_ban_by_addr(&self, addr: &NetAddr) -> bool {
        if Some(*addr) == self.collab.active.service() {
            return false;
        }
        let outpoint = {
            let Some(state) = self.lock_state() else {
                return false;
            };
            state
                .masternodes
                .values()
                .find(|mn| mn.addr == *addr)
                .map(|mn| mn.outpoint)
        };
        match outpoint {
            Some(outpoint) => self.pose_ban(&outpoint),
            None => false,
        }
    }

    pub fn add_governance_vote(&self, outpoint: &OutPoint, hash: Hash256) -> bool {
        let Some(mut state) = self.lock_state() else {
            return false;
        };
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return false;
        };
        record.add_governance_vote(hash);
        true
    }

    pub fn remove_governance_object(&self, hash: &Hash256) {
        let Some(mut state) = self.lock_state() else {
            return;
        };
        for record in state.masternodes.values_mut() {
            record.remove_governance_object(hash);
        }
    }

    pub fn take_dirty_governance_hashes(&self) -> Vec<Hash256> {
        self.lock_state()
            .map(|mut state| std::mem::take(&mut state.dirty_governance_hashes))
            .unwrap_or_default()
    }

    pub fn update_last_sentinel_ping_time(&self) {
        let now = self.now();
        if let Some(mut state) = self.lock_state() {
            state.last_sentinel_ping_time = now;
        }
    }

    pub fn is_sentinel_ping_active(&self) -> bool {
        let now = self.now();
        self.lock_state()
            .map(|state| now - state.last_sentinel_ping_time <= MASTERNODE_SENTINEL_PING_MAX_SECONDS)
            .unwrap_or(false)
    }

    pub fn is_masternode_pinged_within(
        &self,
        outpoint: &OutPoint,
        seconds: i64,
        at: Option<i64>,
    ) -> bool {
        let at = at.unwrap_or_else(|| self.now());
        self.lock_state()
            .and_then(|state| {
                state
                    .masternodes
                    .get(outpoint)
                    .map(|mn| mn.is_pinged_within(seconds, at))
            })
            .unwrap_or(false)
    }

    /// Install an accepted ping on a record, refreshing the sentinel beacon
    /// and the cached broadcast copy alongside it.
    pub fn set_masternode_last_ping(&self, outpoint: &OutPoint, ping: MasternodePing) {
        let now = self.now();
        let Some(mut state) = self.lock_state() else {
            return;
        };
        Self::set_last_ping_locked(&mut state, outpoint, ping, now);
    }

    pub(crate) fn set_last_ping_locked(
        state: &mut ManagerState,
        outpoint: &OutPoint,
        ping: MasternodePing,
        now: i64,
    ) {
        // ping times only move forward
        match state.masternodes.get(outpoint) {
            Some(record) if ping.sig_time > record.last_ping_time() => {}
            _ => return,
        }
        if ping.sentinel_is_current {
            state.last_sentinel_ping_time = now;
        }
        let Some(record) = state.masternodes.get_mut(outpoint) else {
            return;
        };
        record.last_ping = Some(ping.clone());
        state.seen_ping.insert(ping.hash(), ping.clone());

        let broadcast_hash = MasternodeBroadcast::from_record(record).hash();
        if let Some(seen) = state.seen_broadcast.get_mut(&broadcast_hash) {
            seen.broadcast.last_ping = Some(ping);
        }
    }

    /// Whether a broadcast hash is already known; used by the sync layer to
    /// answer inventory queries.
    pub fn has_seen_broadcast(&self, hash: &Hash256) -> bool {
        self.lock_state()
            .map(|state| state.seen_broadcast.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn get_seen_broadcast(&self, hash: &Hash256) -> Option<MasternodeBroadcast> {
        self.lock_state()?
            .seen_broadcast
            .get(hash)
            .map(|seen| seen.broadcast.clone())
    }

    pub fn has_seen_ping(&self, hash: &Hash256) -> bool {
        self.lock_state()
            .map(|state| state.seen_ping.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn get_seen_ping(&self, hash: &Hash256) -> Option<MasternodePing> {
        self.lock_state()?.seen_ping.get(hash).cloned()
    }

    pub fn has_seen_verification(&self, hash: &Hash256) -> bool {
        self.lock_state()
            .map(|state| state.seen_verification.contains_key(hash))
            .unwrap_or(false)
    }

    pub fn cached_block_height(&self) -> i32 {
        self.lock_state()
            .map(|state| state.cached_block_height)
            .unwrap_or(0)
    }

    pub fn to_summary_string(&self) -> String {
        self.lock_state()
            .map(|state| {
                format!(
                    "Masternodes: {}, peers who asked us for the list: {}, peers we asked for the list: {}, entries we asked for: {}, dsq count: {}",
                    state.masternodes.len(),
                    state.asked_us_for_list.len(),
                    state.we_asked_for_list.len(),
                    state.we_asked_for_entry.len(),
                    state.dsq_count
                )
            })
            .unwrap_or_else(|| "Masternodes: <unavailable>".to_string())
    }

    // ---- gossip ---------------------------------------------------------

    /// Ask a peer for the full list, no more than once per pacing window.
    pub fn dseg_update(&self, peer: &dyn PeerHandle) {
        let now = self.now();
        let key = self.pacing_key(&peer.addr());
        let Some(mut state) = self.lock_state() else {
            return;
        };
        if self.params.is_mainnet() && !(peer.addr().is_rfc1918() || peer.addr().is_local()) {
            if let Some(deadline) = state.we_asked_for_list.get(&key) {
                if now < *deadline {
                    println!("masternode: already asked {key} for the list; skipping");
                    return;
                }
            }
        }
        peer.push_message(OverlayMessage::Dseg(OutPoint::null()));
        state.we_asked_for_list.insert(key, now + DSEG_UPDATE_SECONDS);
    }

    /// Ask a peer for one entry, no more than once per pacing window.
    pub fn ask_for_mn(&self, peer: &dyn PeerHandle, outpoint: &OutPoint) {
        let now = self.now();
        let key = self.pacing_key(&peer.addr());
        let Some(mut state) = self.lock_state() else {
            return;
        };
        let asked = state.we_asked_for_entry.entry(*outpoint).or_default();
        if let Some(deadline) = asked.get(&key) {
            if now < *deadline {
                // asking the same peer again this soon risks a ban
                return;
            }
        }
        asked.insert(key, now + DSEG_UPDATE_SECONDS);
        peer.push_message(OverlayMessage::Dseg(*outpoint));
    }

    pub fn process_message(
        &self,
        peer: &dyn PeerHandle,
        message: OverlayMessage,
        connman: &dyn ConnectionManager,
    ) {
        match message {
            OverlayMessage::MasternodeAnnounce(mnb) => self.process_announce(peer, mnb, connman),
            OverlayMessage::MasternodePing(mnp) => self.process_ping(peer, mnp, connman),
            OverlayMessage::Dseg(outpoint) => {
                if !self.collab.sync.is_synced() {
                    return;
                }
                if outpoint.is_null() {
                    self.sync_all(peer);
                } else {
                    self.sync_single(peer, &outpoint);
                }
            }
            OverlayMessage::MasternodeVerify(mnv) => {
                if !self.collab.sync.is_masternode_list_synced() {
                    return;
                }
                if mnv.is_challenge() {
                    self.send_verify_reply(peer, mnv);
                } else if mnv.is_reply() {
                    self.process_verify_reply(peer, mnv, connman);
                } else {
                    self.process_verify_broadcast(peer, mnv, connman);
                }
            }
            OverlayMessage::SyncStatusCount { .. } | OverlayMessage::GetData(_) => {}
        }
    }

    fn process_announce(
        &self,
        peer: &dyn PeerHandle,
        mnb: MasternodeBroadcast,
        connman: &dyn ConnectionManager,
    ) {
        if !self.collab.sync.is_blockchain_synced() {
            return;
        }
        let service = mnb.addr;
        match self.check_mnb_and_update_masternode_list(Some(peer), mnb, connman) {
            Ok(true) => connman.add_new_address(&service, &peer.addr()),
            Ok(false) => {}
            Err(err) => {
                if err.dos > 0 {
                    self.collab.misbehavior.misbehaving(peer.id(), err.dos);
                }
            }
        }
        let added = self
            .lock_state()
            .map(|state| state.masternodes_added)
            .unwrap_or(false);
        if added {
            self.notify_masternode_updates(connman);
        }
    }

    /// Ingest an `Announce`, deduplicating, updating or adding as needed.
    /// `Ok(true)` means the broadcast was useful (or benignly seen).
    pub fn check_mnb_and_update_masternode_list(
        &self,
        from: Option<&dyn PeerHandle>,
        mnb: MasternodeBroadcast,
        connman: &dyn ConnectionManager,
    ) -> Result<bool, ProtocolError> {
        // chain facts first, registry lock second
        let confirmations = self.collab.chain.utxo_confirmations(&mnb.outpoint);
        let check_ctx = self.build_check_context(confirmations.is_none());
        let now = self.now();
        let adjusted_now = self.adjusted_now();

        let outcome = {
            let Some(mut state) = self.lock_state() else {
                return Ok(false);
            };
            self.ingest_mnb_locked(&mut state, from, &mnb, &check_ctx, confirmations, now, adjusted_now)?
        };

        match outcome {
            IngestOutcome::Seen => Ok(true),
            IngestOutcome::Updated { relay_hash } => {
                connman.relay_inv(Inventory {
                    kind: MSG_MASTERNODE_ANNOUNCE,
                    hash: relay_hash,
                });
                Ok(true)
            }
            IngestOutcome::Added {
                relay_hash,
                manage_local,
            } => {
                self.collab.sync.bump_asset_last_time("mnb-new");
                if manage_local {
                    self.collab.active.manage_state(connman);
                }
                connman.relay_inv(Inventory {
                    kind: MSG_MASTERNODE_ANNOUNCE,
                    hash: relay_hash,
                });
                Ok(true)
            }
            IngestOutcome::Rejected(reason) => {
                println!(
                    "masternode: rejected announce {} ({reason})",
                    mnb.outpoint.to_string_short()
                );
                Ok(false)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_mnb_locked(
        &self,
        state: &mut ManagerState,
        from: Option<&dyn PeerHandle>,
        mnb: &MasternodeBroadcast,
        check_ctx: &CheckContext,
        confirmations: Option<i32>,
        now: i64,
        adjusted_now: i64,
    ) -> Result<IngestOutcome, ProtocolError> {
        let hash = mnb.hash();

        if state.seen_broadcast.contains_key(&hash) && !mnb.recovery {
            self.note_seen_broadcast_locked(state, from, mnb, &hash, check_ctx, now);
            return Ok(IngestOutcome::Seen);
        }
        state
            .seen_broadcast
            .entry(hash)
            .or_insert_with(|| SeenBroadcast {
                first_seen: now,
                broadcast: mnb.clone(),
            });

        mnb.simple_check(
            &self.params,
            self.collab.signer.as_ref(),
            self.config.new_sigs,
            adjusted_now,
        )?;

        if state.masternodes.contains_key(&mnb.outpoint) {
            return self
                .update_existing_locked(state, mnb, &hash, now)
                .map(|_| IngestOutcome::Updated { relay_hash: hash });
        }

        // brand new entry: collateral must be confirmed and deep enough
        match confirmations {
            None => return Ok(IngestOutcome::Rejected("collateral missing or spent")),
            Some(depth) if depth < self.params.masternode_min_confirmations => {
                return Ok(IngestOutcome::Rejected("collateral not confirmed"));
            }
            Some(_) => {}
        }

        let local_pubkey = self.collab.active.pubkey_masternode();
        let is_local = self.collab.active.is_masternode_mode()
            && !local_pubkey.is_empty()
            && mnb.pubkey_masternode == local_pubkey;
        if is_local && mnb.protocol_version != PROTOCOL_VERSION {
            // stale announce of ourselves: needs a local re-activation, not a ban
            return Ok(IngestOutcome::Rejected("local masternode needs reactivation"));
        }

        let mut record = mnb.clone().into_record();
        if is_local {
            record.pose_ban_score = -MASTERNODE_POSE_BAN_MAX_SCORE;
        }
        if !Self::add_locked(state, record) {
            return Ok(IngestOutcome::Rejected("duplicate outpoint or service"));
        }

        Ok(IngestOutcome::Added {
            relay_hash: hash,
            manage_local: is_local,
        })
    }

    fn note_seen_broadcast_locked(
        &self,
        state: &mut ManagerState,
        from: Option<&dyn PeerHandle>,
        mnb: &MasternodeBroadcast,
        hash: &Hash256,
        check_ctx: &CheckContext,
        now: i64,
    ) {
        let refresh_deadline =
            MASTERNODE_NEW_START_REQUIRED_SECONDS - 2 * MASTERNODE_MIN_MNP_SECONDS;
        if let Some(seen) = state.seen_broadcast.get_mut(hash) {
            // the record is close to needing a fresh start; keep sync alive
            if now - seen.first_seen > refresh_deadline {
                seen.first_seen = now;
                self.collab.sync.bump_asset_last_time("mnb-seen");
            }
        }

        let Some(peer) = from else {
            return;
        };
        let still_waiting = state
            .recovery_requests
            .get(hash)
            .map(|request| now < request.deadline)
            .unwrap_or(false);
        if !still_waiting {
            return;
        }
        let Some(request) = state.recovery_requests.get_mut(hash) else {
            return;
        };
        if !request.asked.remove(&peer.addr()) {
            // single reply per asked node in recovery mode
            return;
        }

        let stored_ping_time = state
            .seen_broadcast
            .get(hash)
            .and_then(|seen| seen.broadcast.last_ping.as_ref())
            .map(|ping| ping.sig_time)
            .unwrap_or(0);
        let reply_ping_time = mnb
            .last_ping
            .as_ref()
            .map(|ping| ping.sig_time)
            .unwrap_or(0);
        if reply_ping_time <= stored_ping_time {
            return;
        }

        // project the state this reply would put the record in
        let mut probe = mnb.clone().into_record();
        probe.check(check_ctx, true);
        if probe.active_state.valid_for_auto_start() {
            state
                .recovery_good_replies
                .entry(*hash)
                .or_default()
                .push(mnb.clone());
        }
    }

    fn update_existing_locked(
        &self,
        state: &mut ManagerState,
        mnb: &MasternodeBroadcast,
        hash: &Hash256,
        now: i64,
    ) -> Result<(), ProtocolError> {
        let Some(record) = state.masternodes.get(&mnb.outpoint) else {
            return Err(ProtocolError::transient("record vanished"));
        };
        if mnb.sig_time < record.sig_time
            || (mnb.sig_time == record.sig_time && !mnb.recovery)
        {
            return Err(ProtocolError::transient("announce is not newer"));
        }
        if mnb.pubkey_collateral != record.pubkey_collateral {
            return Err(ProtocolError::dos(33, "collateral key changed"));
        }
        let old_hash = MasternodeBroadcast::from_record(record).hash();

        let Some(record) = state.masternodes.get_mut(&mnb.outpoint) else {
            return Err(ProtocolError::transient("record vanished"));
        };
        record.addr = mnb.addr;
        record.pubkey_masternode = mnb.pubkey_masternode.clone();
        record.sig = mnb.sig.clone();
        record.sig_time = mnb.sig_time;
        record.protocol_version = mnb.protocol_version;
        record.time_last_checked = 0;
        let outpoint = record.outpoint;
        if let Some(ping) = mnb.last_ping.clone() {
            Self::set_last_ping_locked(state, &outpoint, ping, now);
        }

        if *hash != old_hash {
            state.seen_broadcast.remove(&old_hash);
        }
        Ok(())
    }

    fn process_ping(
        &self,
        peer: &dyn PeerHandle,
        ping: MasternodePing,
        connman: &dyn ConnectionManager,
    ) {
        if !self.collab.sync.is_blockchain_synced() {
            return;
        }
        // chain facts before the registry lock
        let ping_height = self.collab.chain.block_height(&ping.block_hash);
        let tip_height = self.collab.chain.tip_height();
        let spent = self
            .collab
            .chain
            .utxo_confirmations(&ping.masternode_outpoint)
            .is_none();
        let check_ctx = self.build_check_context(spent);
        let now = self.now();
        let adjusted_now = self.adjusted_now();

        let outpoint = ping.masternode_outpoint;
        let verdict = {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            self.ingest_ping_locked(
                &mut state,
                ping,
                ping_height,
                tip_height,
                &check_ctx,
                now,
                adjusted_now,
            )
        };

        match verdict {
            PingVerdict::Accepted { relay_hash } => {
                connman.relay_inv(Inventory {
                    kind: MSG_MASTERNODE_PING,
                    hash: relay_hash,
                });
            }
            PingVerdict::Dropped => {}
            PingVerdict::Misbehaving(dos) => {
                self.collab.misbehavior.misbehaving(peer.id(), dos);
            }
            PingVerdict::UnknownMasternode => {
                // we may simply be missing the announce
                self.ask_for_mn(peer, &outpoint);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn ingest_ping_locked(
        &self,
        state: &mut ManagerState,
        ping: MasternodePing,
        ping_height: Option<i32>,
        tip_height: i32,
        check_ctx: &CheckContext,
        now: i64,
        adjusted_now: i64,
    ) -> PingVerdict {
        let hash = ping.hash();
        if state.seen_ping.contains_key(&hash) {
            return PingVerdict::Dropped;
        }
        state.seen_ping.insert(hash, ping.clone());

        let outpoint = ping.masternode_outpoint;
        if !state.masternodes.contains_key(&outpoint) {
            return PingVerdict::UnknownMasternode;
        }
        if ping.sentinel_is_current {
            state.last_sentinel_ping_time = now;
        }
        let Some(record) = state.masternodes.get(&outpoint) else {
            return PingVerdict::Dropped;
        };

        // too late for pings; only a fresh announce revives this one
        if record.is_new_start_required() {
            return PingVerdict::Dropped;
        }

        if ping.sig_time > adjusted_now + MASTERNODE_FUTURE_SIGTIME_SLACK {
            return PingVerdict::Misbehaving(1);
        }
        if ping.sig_time <= record.last_ping_time() {
            return PingVerdict::Dropped;
        }

        match ping_height {
            None => {
                println!(
                    "masternode: ping for {} references unknown block; maybe we are behind",
                    outpoint.to_string_short()
                );
                return PingVerdict::Dropped;
            }
            Some(height) if height < tip_height - MASTERNODE_PING_BLOCK_DEPTH => {
                return PingVerdict::Misbehaving(33);
            }
            Some(_) => {}
        }

        let verified = if self.config.new_sigs {
            self.collab.signer.verify_hash(
                &ping.signature_hash(),
                &record.pubkey_masternode,
                &ping.sig,
            )
        } else {
            self.collab.signer.verify_message(
                &ping.signature_message(),
                &record.pubkey_masternode,
                &ping.sig,
            )
        };
        if verified.is_err() {
            return PingVerdict::Misbehaving(33);
        }

        Self::set_last_ping_locked(state, &outpoint, ping, now);
        if let Some(record) = state.masternodes.get_mut(&outpoint) {
            record.check(check_ctx, true);
        }
        PingVerdict::Accepted { relay_hash: hash }
    }

    fn sync_single(&self, peer: &dyn PeerHandle, outpoint: &OutPoint) {
        let now = self.now();
        let Some(mut state) = self.lock_state() else {
            return;
        };
        let Some(record) = state.masternodes.get(outpoint).cloned() else {
            return;
        };
        // never advertise local-network services
        if record.addr.is_rfc1918() || record.addr.is_local() {
            return;
        }
        Self::push_dseg_invs_locked(&mut state, peer, &record, now);
        println!(
            "masternode: sent 1 entry to peer={} for {}",
            peer.id(),
            outpoint.to_string_short()
        );
    }

    fn sync_all(&self, peer: &dyn PeerHandle) {
        let now = self.now();
        let is_local = peer.addr().is_rfc1918() || peer.addr().is_local();
        let key = self.pacing_key(&peer.addr());

        let Some(mut state) = self.lock_state() else {
            return;
        };
        if !is_local && self.params.is_mainnet() {
            if let Some(deadline) = state.asked_us_for_list.get(&key) {
                if *deadline > now {
                    // full-list spam inside the pacing window
                    self.collab
                        .misbehavior
                        .misbehaving(peer.id(), MISBEHAVIOR_DSEG_SPAM);
                    println!(
                        "masternode: peer={} already asked for the list",
                        peer.id()
                    );
                    return;
                }
            }
            state
                .asked_us_for_list
                .insert(key, now + DSEG_UPDATE_SECONDS);
        }

        let records: Vec<Masternode> = state
            .masternodes
            .values()
            .filter(|mn| !(mn.addr.is_rfc1918() || mn.addr.is_local()))
            .cloned()
            .collect();
        let mut count = 0;
        for record in &records {
            // entries go out regardless of state; peers need them for old votes
            Self::push_dseg_invs_locked(&mut state, peer, record, now);
            count += 1;
        }

        peer.push_message(OverlayMessage::SyncStatusCount {
            item: MASTERNODE_SYNC_LIST,
            count,
        });
        println!("masternode: sent {count} entries to peer={}", peer.id());
    }

    fn push_dseg_invs_locked(
        state: &mut ManagerState,
        peer: &dyn PeerHandle,
        record: &Masternode,
        now: i64,
    ) {
        let mnb = MasternodeBroadcast::from_record(record);
        let mnb_hash = mnb.hash();
        peer.push_inventory(Inventory {
            kind: MSG_MASTERNODE_ANNOUNCE,
            hash: mnb_hash,
        });
        if let Some(ping) = &record.last_ping {
            let ping_hash = ping.hash();
            peer.push_inventory(Inventory {
                kind: MSG_MASTERNODE_PING,
                hash: ping_hash,
            });
            state.seen_ping.insert(ping_hash, ping.clone());
        }
        state
            .seen_broadcast
            .entry(mnb_hash)
            .or_insert_with(|| SeenBroadcast {
                first_seen: now,
                broadcast: mnb,
            });
    }

    // ---- recovery -------------------------------------------------------

    /// Pop the next scheduled recovery connection, coalescing every hash
    /// scheduled for the same address.
    pub fn pop_scheduled_mnb_request(&self) -> Option<(NetAddr, BTreeSet<Hash256>)> {
        let Some(mut state) = self.lock_state() else {
            return None;
        };
        if state.scheduled_mnb_requests.is_empty() {
            return None;
        }
        state.scheduled_mnb_requests.sort();
        let front_addr = state.scheduled_mnb_requests[0].0;
        let mut hashes = BTreeSet::new();
        state.scheduled_mnb_requests.retain(|(addr, hash)| {
            if *addr == front_addr {
                hashes.insert(*hash);
                false
            } else {
                true
            }
        });
        Some((front_addr, hashes))
    }

    /// Drive queued announce fetches; connections that stay silent for the
    /// pending window are abandoned.
    pub fn process_pending_mnb_requests(&self, connman: &dyn ConnectionManager) {
        let popped = self.pop_scheduled_mnb_request();
        let now = self.now();

        let Some(mut state) = self.lock_state() else {
            return;
        };
        if let Some((addr, hashes)) = popped {
            if !hashes.is_empty() && !connman.is_masternode_or_disconnect_requested(&addr) {
                state.pending_mnb.insert(addr, (now, hashes));
                connman.add_pending_masternode(&addr);
            }
        }

        state.pending_mnb.retain(|addr, (added_at, hashes)| {
            let done = connman.for_node(addr, &mut |node| {
                let invs: Vec<Inventory> = hashes
                    .iter()
                    .map(|hash| Inventory {
                        kind: MSG_MASTERNODE_ANNOUNCE,
                        hash: *hash,
                    })
                    .collect();
                node.push_message(OverlayMessage::GetData(invs));
            });
            if done {
                return false;
            }
            if now - *added_at > PENDING_REQUEST_TIMEOUT_SECONDS {
                println!("masternode: failed to connect to {addr} for announce recovery");
                return false;
            }
            true
        });
    }

    pub(crate) fn is_mnb_recovery_requested(state: &ManagerState, hash: &Hash256) -> bool {
        state.recovery_requests.contains_key(hash)
    }

    // ---- ranking and payee selection ------------------------------------

    pub(crate) fn scores_locked(
        state: &ManagerState,
        block_hash: &Hash256,
        min_proto: i32,
    ) -> Vec<(U256, OutPoint)> {
        let mut scores: Vec<(U256, OutPoint)> = state
            .masternodes
            .values()
            .filter(|mn| mn.protocol_version >= min_proto)
            .map(|mn| (mn.calculate_score(block_hash), mn.outpoint))
            .collect();
        scores.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scores
    }

    /// Full rank list at a height; rank 1 holds the highest score.
    pub fn get_masternode_ranks(
        &self,
        block_height: i32,
        min_proto: i32,
    ) -> Vec<(i32, MasternodeInfo)> {
        if !self.collab.sync.is_masternode_list_synced() {
            return Vec::new();
        }
        let Some(block_hash) = self.collab.chain.block_hash(block_height) else {
            eprintln!("masternode: no block hash at height {block_height}");
            return Vec::new();
        };
        let Some(state) = self.lock_state() else {
            return Vec::new();
        };
        Self::scores_locked(&state, &block_hash, min_proto)
            .into_iter()
            .enumerate()
            .filter_map(|(index, (_, outpoint))| {
                state
                    .masternodes
                    .get(&outpoint)
                    .map(|mn| (index as i32 + 1, mn.get_info()))
            })
            .collect()
    }

    pub fn get_masternode_rank(
        &self,
        outpoint: &OutPoint,
        block_height: i32,
        min_proto: i32,
    ) -> Option<i32> {
        if !self.collab.sync.is_masternode_list_synced() {
            return None;
        }
        let block_hash = self.collab.chain.block_hash(block_height)?;
        let state = self.lock_state()?;
        Self::scores_locked(&state, &block_hash, min_proto)
            .iter()
            .position(|(_, candidate)| candidate == outpoint)
            .map(|index| index as i32 + 1)
    }

    /// Deterministically select the next payee: round-robin over the oldest
    /// tenth by last payment, tie-broken by a score against the hash 101
    /// blocks back.
    pub fn get_next_masternode_in_queue(
        &self,
        block_height: i32,
        filter_sig_time: bool,
    ) -> (Option<MasternodeInfo>, usize) {
        if !self.collab.sync.is_winners_list_synced() {
            return (None, 0);
        }
        let Some(block_hash) = self.collab.chain.block_hash(block_height - 101) else {
            eprintln!(
                "masternode: no block hash at height {}",
                block_height - 101
            );
            return (None, 0);
        };

        let min_proto = self.collab.payments.min_payments_proto();
        let adjusted_now = self.adjusted_now();

        let (mn_count, snapshot) = {
            let Some(state) = self.lock_state() else {
                return (None, 0);
            };
            let mn_count = state
                .masternodes
                .values()
                .filter(|mn| mn.protocol_version >= min_proto)
                .count();
            let snapshot: Vec<MasternodeInfo> = state
                .masternodes
                .values()
                .filter(|mn| mn.is_valid_for_payment() && mn.protocol_version >= min_proto)
                .map(Masternode::get_info)
                .collect();
            (mn_count, snapshot)
        };

        let mut candidates: Vec<MasternodeInfo> = Vec::new();
        for info in snapshot {
            // scheduled within the propagation lookahead: skip
            if self.collab.payments.is_scheduled(&info, block_height) {
                continue;
            }
            // too new: give the network a cycle to learn about it
            if filter_sig_time
                && info.sig_time + (mn_count as i64 * 156) > adjusted_now
            {
                continue;
            }
            // collateral must be at least as deep as the masternode count
            match self.collab.chain.utxo_confirmations(&info.outpoint) {
                Some(depth) if depth >= mn_count as i32 => {}
                _ => continue,
            }
            candidates.push(info);
        }

        let count = candidates.len();
        // most filtered out: the network is likely mid-upgrade, retry plain
        if filter_sig_time && count < mn_count / 3 {
            return self.get_next_masternode_in_queue(block_height, false);
        }

        candidates.sort_by(|a, b| {
            a.last_paid_block
                .cmp(&b.last_paid_block)
                .then(a.outpoint.cmp(&b.outpoint))
        });

        let tenth = mn_count / 10;
        let mut best: Option<(U256, MasternodeInfo)> = None;
        for info in candidates.into_iter().take(tenth.max(1)) {
            let score = crate::record::score_for(&info.outpoint, &block_hash);
            let better = match &best {
                Some((high, _)) => score > *high,
                None => true,
            };
            if better {
                best = Some((score, info));
            }
        }
        (best.map(|(_, info)| info), count)
    }

    /// Uniformly random enabled masternode outside the exclusion set.
    pub fn find_random_not_in_vec(
        &self,
        exclude: &[OutPoint],
        min_proto: Option<i32>,
    ) -> Option<MasternodeInfo> {
        let min_proto = min_proto.unwrap_or_else(|| self.collab.payments.min_payments_proto());
        let mut eligible: Vec<MasternodeInfo> = {
            let state = self.lock_state()?;
            state
                .masternodes
                .values()
                .filter(|mn| mn.protocol_version >= min_proto && mn.is_enabled())
                .map(Masternode::get_info)
                .collect()
        };
        if eligible.len() <= exclude.len() {
            return None;
        }
        eligible.shuffle(&mut rand::thread_rng());
        eligible
            .into_iter()
            .find(|info| !exclude.contains(&info.outpoint))
    }

    // ---- housekeeping ---------------------------------------------------

    pub(crate) fn build_check_context(&self, spent: bool) -> CheckContext {
        CheckContext {
            now: self.now(),
            spent,
            sentinel_active: self.collab.sync.is_synced() && self.is_sentinel_ping_active(),
            min_payments_proto: self.collab.payments.min_payments_proto(),
            local_pubkey: self.collab.active.pubkey_masternode(),
        }
    }

    fn spent_outpoints(&self, outpoints: &[OutPoint]) -> HashSet<OutPoint> {
        outpoints
            .iter()
            .filter(|outpoint| self.collab.chain.utxo_confirmations(outpoint).is_none())
            .copied()
            .collect()
    }

    /// Force a state re-evaluation of the record with a given operator key.
    pub fn check_masternode(&self, pubkey_masternode: &[u8], force: bool) {
        let outpoint = {
            let Some(state) = self.lock_state() else {
                return;
            };
            state
                .masternodes
                .values()
                .find(|mn| mn.pubkey_masternode == pubkey_masternode)
                .map(|mn| mn.outpoint)
        };
        let Some(outpoint) = outpoint else {
            return;
        };
        let spent = self.collab.chain.utxo_confirmations(&outpoint).is_none();
        let ctx = self.build_check_context(spent);
        let Some(mut state) = self.lock_state() else {
            return;
        };
        if let Some(record) = state.masternodes.get_mut(&outpoint) {
            record.check(&ctx, force);
        }
    }

    /// Re-evaluate every record's state machine.
    pub fn check(&self) {
        let outpoints: Vec<OutPoint> = match self.lock_state() {
            Some(state) => state.masternodes.keys().copied().collect(),
            None => return,
        };
        let spent = self.spent_outpoints(&outpoints);
        let base_ctx = self.build_check_context(false);

        let Some(mut state) = self.lock_state() else {
            return;
        };
        for (outpoint, record) in state.masternodes.iter_mut() {
            let ctx = CheckContext {
                spent: spent.contains(outpoint),
                ..base_ctx.clone()
            };
            record.check(&ctx, false);
        }
    }

    /// The housekeeping pass: remove terminal records, start and settle
    /// recovery rounds, expire every pacing table.
    pub fn check_and_remove(&self, connman: &dyn ConnectionManager) {
        if !self.collab.sync.is_masternode_list_synced() {
            return;
        }
        self.check();

        let now = self.now();
        let synced = self.collab.sync.is_synced();
        let cached_height = self.cached_block_height();
        let min_proto = self.collab.payments.min_payments_proto();

        // rank source for recovery quorums: a random past block
        let rank_hash = if cached_height > 0 {
            let random_height = rand::thread_rng().gen_range(0..cached_height.max(1));
            self.collab.chain.block_hash(random_height)
        } else {
            None
        };

        let mut reprocess: Vec<MasternodeBroadcast> = Vec::new();
        let mut removed_any = false;
        {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            let state = &mut *state;

            // remove terminal records
            let terminal: Vec<OutPoint> = state
                .masternodes
                .values()
                .filter(|mn| mn.is_terminal())
                .map(|mn| mn.outpoint)
                .collect();
            for outpoint in terminal {
                if let Some(record) = state.masternodes.remove(&outpoint) {
                    println!(
                        "masternode: removing {} record addr={} total={}",
                        record.active_state.as_str(),
                        record.addr,
                        state.masternodes.len()
                    );
                    let hash = MasternodeBroadcast::from_record(&record).hash();
                    state.seen_broadcast.remove(&hash);
                    state.we_asked_for_entry.remove(&outpoint);
                    state
                        .dirty_governance_hashes
                        .extend(record.governance_votes.iter().copied());
                    state.masternodes_removed = true;
                    removed_any = true;
                }
            }

            // schedule recovery for records that need a fresh announce
            if synced && !self.config.connect_only {
                let ranked_addrs: Vec<NetAddr> = rank_hash
                    .map(|hash| {
                        Self::scores_locked(state, &hash, min_proto)
                            .into_iter()
                            .filter_map(|(_, outpoint)| {
                                state.masternodes.get(&outpoint).map(|mn| mn.addr)
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let mut asks_left = MNB_RECOVERY_MAX_ASK_ENTRIES;
                let needing: Vec<(OutPoint, Hash256)> = state
                    .masternodes
                    .values()
                    .filter(|mn| mn.is_new_start_required())
                    .map(|mn| (mn.outpoint, MasternodeBroadcast::from_record(mn).hash()))
                    .collect();
                for (outpoint, hash) in needing {
                    if asks_left == 0 {
                        break;
                    }
                    if Self::is_mnb_recovery_requested(state, &hash) {
                        continue;
                    }
                    let mut asked = BTreeSet::new();
                    for addr in &ranked_addrs {
                        if asked.len() >= MNB_RECOVERY_QUORUM_TOTAL {
                            break;
                        }
                        let already_asked = state
                            .we_asked_for_entry
                            .get(&outpoint)
                            .map(|peers| peers.contains_key(&self.pacing_key(addr)))
                            .unwrap_or(false);
                        if already_asked {
                            continue;
                        }
                        asked.insert(*addr);
                        state.scheduled_mnb_requests.push((*addr, hash));
                    }
                    if !asked.is_empty() {
                        println!(
                            "masternode: recovery initiated for {}",
                            outpoint.to_string_short()
                        );
                        asks_left -= 1;
                    }
                    state.recovery_requests.insert(
                        hash,
                        RecoveryRequest {
                            deadline: now + MNB_RECOVERY_WAIT_SECONDS,
                            asked,
                        },
                    );
                }
            }

            // settle recovery rounds whose wait is over
            let settled: Vec<Hash256> = state
                .recovery_good_replies
                .keys()
                .filter(|hash| {
                    state
                        .recovery_requests
                        .get(*hash)
                        .map(|request| request.deadline < now)
                        .unwrap_or(true)
                })
                .copied()
                .collect();
            for hash in settled {
                if let Some(mut replies) = state.recovery_good_replies.remove(&hash) {
                    if replies.len() >= MNB_RECOVERY_QUORUM_REQUIRED {
                        let mut mnb = replies.swap_remove(0);
                        println!(
                            "masternode: reprocessing recovered announce {}",
                            mnb.outpoint.to_string_short()
                        );
                        mnb.recovery = true;
                        reprocess.push(mnb);
                    }
                }
            }

            // expire settled recovery requests so they may be retried
            state
                .recovery_requests
                .retain(|_, request| now - request.deadline <= MNB_RECOVERY_RETRY_SECONDS);

            // expire pacing tables
            expire_deadlines(&mut state.asked_us_for_list, now);
            expire_deadlines(&mut state.we_asked_for_list, now);
            for peers in state.we_asked_for_entry.values_mut() {
                expire_deadlines(peers, now);
            }
            state.we_asked_for_entry.retain(|_, peers| !peers.is_empty());
            state
                .we_asked_for_verification
                .retain(|_, mnv| mnv.block_height >= cached_height - MAX_POSE_BLOCKS);
            state.fulfilled.expire(now);

            // NOTE: seen_broadcast is cleaned on updates only, never here
            state.seen_ping.retain(|_, ping| !ping.is_expired(now));
            state
                .seen_verification
                .retain(|_, mnv| mnv.block_height >= cached_height - MAX_POSE_BLOCKS);

            println!(
                "masternode: Masternodes: {}, peers who asked us for the list: {}, peers we asked for the list: {}, entries we asked for: {}, dsq count: {}",
                state.masternodes.len(),
                state.asked_us_for_list.len(),
                state.we_asked_for_list.len(),
                state.we_asked_for_entry.len(),
                state.dsq_count
            );
        }

        for mnb in reprocess {
            let _ = self.check_mnb_and_update_masternode_list(None, mnb, connman);
        }

        if removed_any {
            self.notify_masternode_updates(connman);
        }
    }

    /// Refresh every record's `last_paid_block` from recent winners.
    pub fn update_last_paid(&self) {
        if !self.collab.sync.is_winners_list_synced() {
            return;
        }
        let (cached_height, last_run) = {
            let Some(state) = self.lock_state() else {
                return;
            };
            if state.masternodes.is_empty() {
                return;
            }
            (state.cached_block_height, state.last_paid_scan_height)
        };

        let mut scan_back = LAST_PAID_SCAN_BLOCKS.max(cached_height - last_run);
        scan_back = scan_back.min(self.collab.payments.storage_limit());

        // newest win per payee over the scan range
        let mut paid_at: HashMap<Vec<u8>, i32> = HashMap::new();
        for height in (cached_height - scan_back + 1)..=cached_height {
            if height < 0 {
                continue;
            }
            if let Some(payee) = self.collab.payments.block_payee(height) {
                let entry = paid_at.entry(payee).or_insert(height);
                *entry = (*entry).max(height);
            }
        }

        let Some(mut state) = self.lock_state() else {
            return;
        };
        for record in state.masternodes.values_mut() {
            if let Some(height) = paid_at.get(&record.pubkey_collateral) {
                record.last_paid_block = (*height).max(record.last_paid_block);
            }
        }
        state.last_paid_scan_height = cached_height;
    }

    /// Block-tip listener entry point.
    pub fn updated_block_tip(&self, height: i32) {
        if let Some(mut state) = self.lock_state() {
            state.cached_block_height = height;
        }
        self.check_same_addr();
        if self.collab.active.is_masternode_mode() {
            self.update_last_paid();
        }
    }

    /// Raise the one-shot daemon-update warning once half the network runs a
    /// newer daemon than ours.
    pub fn warn_masternode_daemon_updates(&self) {
        if !self.collab.sync.is_masternode_list_synced() {
            return;
        }
        let message = {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            if state.warned_daemon_updates || state.masternodes.is_empty() {
                return;
            }
            let total = state.masternodes.len();
            let updated = state
                .masternodes
                .values()
                .filter(|mn| {
                    mn.last_ping
                        .as_ref()
                        .map(|ping| ping.daemon_version > CLIENT_DAEMON_VERSION)
                        .unwrap_or(false)
                })
                .count();
            if updated < total / 2 {
                return;
            }
            state.warned_daemon_updates = true;
            if updated < total {
                format!(
                    "Warning: at least {updated} of {total} masternodes are running a newer daemon version. Please check latest releases, you might need to update too."
                )
            } else {
                format!(
                    "Warning: every masternode (out of {total} known ones) is running a newer daemon version. It is very likely that you missed a major update."
                )
            }
        };
        self.collab.alerts.notify(&message);
    }

    /// Fan registry changes out to governance, then clear the dirty flags.
    pub fn notify_masternode_updates(&self, _connman: &dyn ConnectionManager) {
        let (added, removed) = {
            let Some(state) = self.lock_state() else {
                return;
            };
            (state.masternodes_added, state.masternodes_removed)
        };
        if added {
            self.collab.governance.check_orphan_objects();
            self.collab.governance.check_orphan_votes();
        }
        if removed {
            self.collab.governance.update_caches_and_clean();
        }
        if let Some(mut state) = self.lock_state() {
            state.masternodes_added = false;
            state.masternodes_removed = false;
        }
    }

    /// Drop connections flagged masternode-only once their exchange is over.
    pub fn process_masternode_connections(&self, connman: &dyn ConnectionManager) {
        if self.params.network == zocd_consensus::params::Network::Regtest {
            return;
        }
        connman.for_each_node(&mut |node| {
            if node.is_masternode_conn() {
                println!("masternode: closing masternode connection peer={}", node.id());
                node.request_disconnect();
            }
        });
    }
}

enum PingVerdict {
    Accepted { relay_hash: Hash256 },
    Dropped,
    Misbehaving(i32),
    UnknownMasternode,
}
