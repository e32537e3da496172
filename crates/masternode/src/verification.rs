//! Proof-of-service verification.
//!
//! A challenger in the top ranks sends a nonce-bound challenge to an
//! advertised service address. Whoever answers must prove, with the
//! masternode key, that it really is the masternode at that address. A
//! successful proof is countersigned and broadcast so the rest of the
//! network can clear the one real record and punish impostors on the same
//! address.

use std::collections::HashMap;

use rand::Rng;
use zocd_consensus::constants::{
    MAX_POSE_BLOCKS, MAX_POSE_CONNECTIONS, MAX_POSE_RANK, MIN_POSE_PROTO_VERSION,
    MISBEHAVIOR_UNREACHABLE, MISBEHAVIOR_VERIFY_FAKE, MISBEHAVIOR_VERIFY_MISMATCH,
    MISBEHAVIOR_VERIFY_SELF, MISBEHAVIOR_VERIFY_SPAM, PENDING_REQUEST_TIMEOUT_SECONDS,
};
use zocd_primitives::{NetAddr, OutPoint};

use crate::manager::{ManagerState, MasternodeManager};
use crate::messages::{
    Inventory, MasternodeVerification, OverlayMessage, MSG_MASTERNODE_VERIFY,
};
use crate::pacing::{FULFILLED_MNV_DONE, FULFILLED_MNV_REPLY, FULFILLED_MNV_REQUEST};
use crate::ports::{ConnectionManager, PeerHandle};

impl MasternodeManager {
    /// Challenge up to `MAX_POSE_CONNECTIONS` peers this round, walking the
    /// rank list from an offset derived from our own rank so challengers do
    /// not pile onto the same targets.
    pub fn do_full_verification_step(&self, connman: &dyn ConnectionManager) {
        let active_outpoint = self.collab.active.outpoint();
        if active_outpoint.is_null() || !self.collab.sync.is_synced() {
            return;
        }
        let cached_height = self.cached_block_height();
        let ranks = self.get_masternode_ranks(cached_height - 1, MIN_POSE_PROTO_VERSION);
        if ranks.is_empty() {
            return;
        }

        let mut to_contact: Vec<NetAddr> = Vec::new();
        {
            let Some(mut state) = self.lock_state() else {
                return;
            };

            let my_rank = ranks
                .iter()
                .find(|(_, info)| info.outpoint == active_outpoint)
                .map(|(rank, _)| *rank);
            let Some(my_rank) = my_rank else {
                println!(
                    "masternode: rank list is too short or this masternode is not enabled"
                );
                return;
            };
            if my_rank > MAX_POSE_RANK {
                println!(
                    "masternode: must be in the top {MAX_POSE_RANK} to send verify requests"
                );
                return;
            }

            let mut offset = (MAX_POSE_RANK + my_rank - 1) as usize;
            let mut contacted = 0usize;
            while offset < ranks.len() {
                let (rank, info) = &ranks[offset];
                if info.is_pose_verified() || info.is_pose_banned() {
                    offset += MAX_POSE_CONNECTIONS;
                    continue;
                }
                if self.verify_request_allowed(&state, &info.addr, connman) {
                    println!(
                        "masternode: verifying {} rank {}/{} addr={}",
                        info.outpoint.to_string_short(),
                        rank,
                        ranks.len(),
                        info.addr
                    );
                    to_contact.push(info.addr);
                    // avoid a duplicate out-of-band challenge for the same node
                    state.should_ask_for_verification.remove(&info.outpoint);
                    contacted += 1;
                    if contacted >= MAX_POSE_CONNECTIONS {
                        break;
                    }
                }
                offset += MAX_POSE_CONNECTIONS;
            }

            // nodes the duplicate-IP sweep queued for re-verification
            let queued: Vec<(OutPoint, i64)> = state
                .should_ask_for_verification
                .iter()
                .map(|(outpoint, asked_at)| (*outpoint, *asked_at))
                .collect();
            for (outpoint, asked_at) in queued {
                state.should_ask_for_verification.remove(&outpoint);
                if let Some(record) = state.masternodes.get(&outpoint) {
                    println!(
                        "masternode: verifying {} after {} secs addr={}",
                        outpoint.to_string_short(),
                        self.now() - asked_at,
                        record.addr
                    );
                    to_contact.push(record.addr);
                }
            }
        }

        let count = to_contact.len();
        for addr in to_contact {
            self.queue_verification(addr, connman);
        }
        println!("masternode: sent verification requests to {count} masternodes");
    }

    /// Schedule a nonce-bound challenge of a specific service address.
    pub fn ask_for_verification(&self, addr: NetAddr, connman: &dyn ConnectionManager) {
        if self.collab.active.outpoint().is_null() || !self.collab.sync.is_synced() {
            return;
        }
        self.queue_verification(addr, connman);
    }

    fn queue_verification(&self, addr: NetAddr, connman: &dyn ConnectionManager) {
        let cached_height = self.cached_block_height();
        let nonce = rand::thread_rng().gen_range(1..1_000_000u64);
        let mnv = MasternodeVerification::new(addr, nonce, cached_height - 1);
        connman.add_pending_masternode(&addr);
        let Ok(mut pending) = self.pending_verifications.lock() else {
            return;
        };
        pending.insert(addr, (self.now(), mnv));
        println!("masternode: verifying node using nonce {nonce} addr={addr}");
    }

    /// A previously fulfilled request only logs; re-asking stays allowed
    /// unless the strict flag tightens the policy.
    fn verify_request_allowed(
        &self,
        state: &ManagerState,
        addr: &NetAddr,
        connman: &dyn ConnectionManager,
    ) -> bool {
        if state.fulfilled.has(addr, FULFILLED_MNV_REQUEST, self.now()) {
            println!("masternode: repeating verify request to addr={addr}");
            if self.config.strict_reverify {
                return false;
            }
        }
        !connman.is_masternode_or_disconnect_requested(addr)
    }

    /// Push queued challenges onto live connections; abandon and punish
    /// targets that stay unreachable or silent past the timeout.
    pub fn process_pending_mnv_requests(&self, connman: &dyn ConnectionManager) {
        let now = self.now();
        let active_outpoint = self.collab.active.outpoint();
        let active_service = self.collab.active.service();
        let synced = self.collab.sync.is_synced();

        let Some(mut state) = self.lock_state() else {
            return;
        };
        let Ok(mut pending) = self.pending_verifications.lock() else {
            return;
        };
        let mut punish: Vec<NetAddr> = Vec::new();

        pending.retain(|addr, (added_at, mnv)| {
            let sent = connman.for_node(addr, &mut |node| {
                state.fulfilled.add(addr, FULFILLED_MNV_REQUEST, now);
                state.we_asked_for_verification.insert(*addr, mnv.clone());
                node.push_message(OverlayMessage::MasternodeVerify(mnv.clone()));
            });
            let timed_out = now - *added_at > PENDING_REQUEST_TIMEOUT_SECONDS;

            if sent {
                let done = state.fulfilled.has(addr, FULFILLED_MNV_REQUEST, now)
                    && state.fulfilled.has(addr, FULFILLED_MNV_DONE, now);
                if done {
                    println!(
                        "masternode: done verifying {addr} in {} secs",
                        now - *added_at
                    );
                    return false;
                }
                if timed_out {
                    increase_score_by_addr_locked(&mut state, addr, active_outpoint, active_service);
                    punish.push(*addr);
                    return false;
                }
                true
            } else if timed_out {
                println!(
                    "masternode: failed to connect to {addr} for verification, {} secs",
                    now - *added_at
                );
                increase_score_by_addr_locked(&mut state, addr, active_outpoint, active_service);
                punish.push(*addr);
                false
            } else {
                true
            }
        });
        let pending_left = pending.len();
        drop(pending);
        drop(state);

        if synced {
            for addr in punish {
                self.punish_node(&addr, connman);
            }
        }
        println!("masternode: pending verifications: {pending_left}");
    }

    /// Peer-level penalty for an unreachable or misbehaving verification
    /// target. Never applied to our own address.
    pub fn punish_node(&self, addr: &NetAddr, connman: &dyn ConnectionManager) {
        if !self.collab.sync.is_synced() {
            return;
        }
        if Some(*addr) == self.collab.active.service() {
            return;
        }
        if let Some(peer) = connman.find_node(addr) {
            println!("masternode: punishing misbehaving node at addr={addr}");
            self.collab
                .misbehavior
                .misbehaving(peer, MISBEHAVIOR_UNREACHABLE);
        }
    }

    /// Phase 1, responder side: sign the challenge so the challenger can
    /// match our key against its records for this address.
    pub fn send_verify_reply(&self, peer: &dyn PeerHandle, mut mnv: MasternodeVerification) {
        // only masternodes can sign this; a regular node stays silent since
        // a malicious peer might be probing with our address
        if !self.collab.active.is_masternode_mode() {
            return;
        }
        let now = self.now();
        let Some(block_hash) = self.collab.chain.block_hash(mnv.block_height) else {
            println!(
                "masternode: no block hash at height {} for verify reply",
                mnv.block_height
            );
            return;
        };

        {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            if state.fulfilled.has(&peer.addr(), FULFILLED_MNV_REPLY, now) {
                // one reply per window per requester
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_SPAM);
                return;
            }
        }

        let key = self.collab.active.sign_key();
        let pubkey = self.collab.active.pubkey_masternode();
        let signed = if self.config.new_sigs {
            let digest = mnv.signature_hash1(&block_hash);
            self.collab.signer.sign_hash(&digest, &key).and_then(|sig| {
                self.collab
                    .signer
                    .verify_hash(&digest, &pubkey, &sig)
                    .map(|_| sig)
            })
        } else {
            let service = match self.collab.active.service() {
                Some(service) => service,
                None => return,
            };
            let message = format!(
                "{}{}{}",
                service,
                mnv.nonce,
                zocd_consensus::hash256_to_hex(&block_hash)
            );
            self.collab
                .signer
                .sign_message(&message, &key)
                .and_then(|sig| {
                    self.collab
                        .signer
                        .verify_message(&message, &pubkey, &sig)
                        .map(|_| sig)
                })
        };
        match signed {
            Ok(sig) => {
                mnv.vch_sig1 = sig;
                peer.push_message(OverlayMessage::MasternodeVerify(mnv));
                if let Some(mut state) = self.lock_state() {
                    state.fulfilled.add(&peer.addr(), FULFILLED_MNV_REPLY, now);
                }
            }
            Err(err) => eprintln!("masternode: failed to sign verify reply: {err}"),
        }
    }

    /// Phase 2, challenger side: match the reply signature against every
    /// record sharing the responder's address.
    pub fn process_verify_reply(
        &self,
        peer: &dyn PeerHandle,
        mnv: MasternodeVerification,
        connman: &dyn ConnectionManager,
    ) {
        let now = self.now();
        let block_hash = self.collab.chain.block_hash(mnv.block_height);
        let active_outpoint = self.collab.active.outpoint();
        let active_service = self.collab.active.service();
        let peer_addr = peer.addr();

        let mut relay: Option<MasternodeVerification> = None;
        {
            let Some(mut state) = self.lock_state() else {
                return;
            };

            // did we even ask this address?
            if !state.fulfilled.has(&peer_addr, FULFILLED_MNV_REQUEST, now) {
                eprintln!(
                    "masternode: unsolicited verify reply from {peer_addr}"
                );
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_SPAM);
                return;
            }

            let (asked_nonce, asked_height) = state
                .we_asked_for_verification
                .get(&peer_addr)
                .map(|asked| (asked.nonce, asked.block_height))
                .unwrap_or((0, 0));
            if asked_nonce != mnv.nonce {
                eprintln!(
                    "masternode: wrong verify nonce from {peer_addr}: requested={asked_nonce} received={}",
                    mnv.nonce
                );
                increase_score_by_addr_locked(&mut state, &peer_addr, active_outpoint, active_service);
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_MISMATCH);
                return;
            }
            if asked_height != mnv.block_height {
                eprintln!(
                    "masternode: wrong verify height from {peer_addr}: requested={asked_height} received={}",
                    mnv.block_height
                );
                increase_score_by_addr_locked(&mut state, &peer_addr, active_outpoint, active_service);
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_MISMATCH);
                return;
            }

            let Some(block_hash) = block_hash else {
                // we asked with this height, so this should not happen
                println!(
                    "masternode: no block hash at height {} for verify reply",
                    mnv.block_height
                );
                return;
            };

            if state.fulfilled.has(&peer_addr, FULFILLED_MNV_DONE, now) {
                // reply spam; still process it
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_SPAM);
            }

            let candidates: Vec<(OutPoint, Vec<u8>)> = state
                .masternodes
                .values()
                .filter(|mn| mn.addr == peer_addr)
                .map(|mn| (mn.outpoint, mn.pubkey_masternode.clone()))
                .collect();

            let digest = mnv.signature_hash1(&block_hash);
            let message = mnv.signature_message1(&block_hash);
            let mut real: Option<OutPoint> = None;
            let mut fakes: Vec<OutPoint> = Vec::new();
            for (outpoint, pubkey) in candidates {
                let verified = if self.config.new_sigs {
                    self.collab.signer.verify_hash(&digest, &pubkey, &mnv.vch_sig1)
                } else {
                    self.collab
                        .signer
                        .verify_message(&message, &pubkey, &mnv.vch_sig1)
                };
                if verified.is_ok() {
                    real = Some(outpoint);
                } else {
                    fakes.push(outpoint);
                }
            }

            if let Some(real_outpoint) = real {
                if let Some(record) = state.masternodes.get_mut(&real_outpoint) {
                    if !record.is_pose_verified() {
                        record.decrease_pose_ban_score();
                    }
                }
                state.fulfilled.add(&peer_addr, FULFILLED_MNV_DONE, now);
                println!(
                    "masternode: verified real masternode {} for addr {peer_addr}",
                    real_outpoint.to_string_short()
                );

                // countersign and broadcast, if we are an active masternode
                if !active_outpoint.is_null() {
                    if let Some(record) = state.masternodes.get(&real_outpoint) {
                        let mut witnessed = mnv.clone();
                        witnessed.addr = record.addr;
                        witnessed.masternode_outpoint1 = real_outpoint;
                        witnessed.masternode_outpoint2 = active_outpoint;
                        let key = self.collab.active.sign_key();
                        let pubkey = self.collab.active.pubkey_masternode();
                        let signed = if self.config.new_sigs {
                            let digest2 = witnessed.signature_hash2(&block_hash);
                            self.collab.signer.sign_hash(&digest2, &key).and_then(|sig| {
                                self.collab
                                    .signer
                                    .verify_hash(&digest2, &pubkey, &sig)
                                    .map(|_| sig)
                            })
                        } else {
                            let message2 = witnessed.signature_message2(&block_hash);
                            self.collab.signer.sign_message(&message2, &key).and_then(
                                |sig| {
                                    self.collab
                                        .signer
                                        .verify_message(&message2, &pubkey, &sig)
                                        .map(|_| sig)
                                },
                            )
                        };
                        match signed {
                            Ok(sig) => {
                                witnessed.vch_sig2 = sig;
                                state
                                    .we_asked_for_verification
                                    .insert(peer_addr, witnessed.clone());
                                state
                                    .seen_verification
                                    .insert(witnessed.hash(), witnessed.clone());
                                relay = Some(witnessed);
                            }
                            Err(err) => {
                                eprintln!(
                                    "masternode: failed to countersign verification: {err}"
                                );
                            }
                        }
                    }
                }
            } else {
                // nobody at this address proved ownership
                eprintln!(
                    "masternode: no real masternode found for addr {peer_addr}"
                );
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_FAKE);
            }

            let fake_count = fakes.len();
            for outpoint in fakes {
                if outpoint == active_outpoint {
                    continue;
                }
                if let Some(record) = state.masternodes.get_mut(&outpoint) {
                    record.increase_pose_ban_score();
                    println!(
                        "masternode: increased PoSe ban score for {} addr {} score {}",
                        outpoint.to_string_short(),
                        record.addr,
                        record.pose_ban_score
                    );
                }
            }
            if fake_count > 0 {
                println!(
                    "masternode: PoSe score increased for {fake_count} fake masternodes at addr {peer_addr}"
                );
            }
        }

        if let Some(witnessed) = relay {
            connman.relay_inv(Inventory {
                kind: MSG_MASTERNODE_VERIFY,
                hash: witnessed.hash(),
            });
        }
    }

    /// Phase 3, everyone else: validate a witnessed broadcast, clear the
    /// named record and raise the score of the other records on its address.
    pub fn process_verify_broadcast(
        &self,
        peer: &dyn PeerHandle,
        mnv: MasternodeVerification,
        connman: &dyn ConnectionManager,
    ) {
        let block_hash = self.collab.chain.block_hash(mnv.block_height);
        let cached_height = self.cached_block_height();

        let mut relay = false;
        {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            let hash = mnv.hash();
            if state.seen_verification.contains_key(&hash) {
                return;
            }
            state.seen_verification.insert(hash, mnv.clone());

            // history does not interest us
            if mnv.block_height < cached_height - MAX_POSE_BLOCKS {
                println!(
                    "masternode: outdated verification at block {} (current {cached_height})",
                    mnv.block_height
                );
                return;
            }

            if mnv.masternode_outpoint1 == mnv.masternode_outpoint2 {
                // verifying yourself is not proof of anything
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_SELF);
                return;
            }

            let Some(block_hash) = block_hash else {
                println!(
                    "masternode: no block hash at height {} for verification",
                    mnv.block_height
                );
                return;
            };

            // the witness itself must sit within the challenger ranks
            let rank = Self::scores_locked(&state, &block_hash, MIN_POSE_PROTO_VERSION)
                .iter()
                .position(|(_, outpoint)| *outpoint == mnv.masternode_outpoint2)
                .map(|index| index as i32 + 1);
            let Some(rank) = rank else {
                println!(
                    "masternode: cannot calculate rank for {}",
                    mnv.masternode_outpoint2.to_string_short()
                );
                return;
            };
            if rank > MAX_POSE_RANK {
                println!(
                    "masternode: witness {} is not in the top {MAX_POSE_RANK} (rank {rank})",
                    mnv.masternode_outpoint2.to_string_short()
                );
                return;
            }

            let Some(pmn1) = state.masternodes.get(&mnv.masternode_outpoint1) else {
                println!(
                    "masternode: unknown verified masternode {}",
                    mnv.masternode_outpoint1.to_string_short()
                );
                return;
            };
            let pmn1_addr = pmn1.addr;
            let pmn1_pubkey = pmn1.pubkey_masternode.clone();
            let Some(pmn2) = state.masternodes.get(&mnv.masternode_outpoint2) else {
                println!(
                    "masternode: unknown witness masternode {}",
                    mnv.masternode_outpoint2.to_string_short()
                );
                return;
            };
            let pmn2_pubkey = pmn2.pubkey_masternode.clone();

            if pmn1_addr != mnv.addr {
                // the witness relays wrong data, or we do not know better;
                // punish only the relay path
                self.collab
                    .misbehavior
                    .misbehaving(peer.id(), MISBEHAVIOR_VERIFY_MISMATCH);
                return;
            }

            let sig1_ok = if self.config.new_sigs {
                self.collab
                    .signer
                    .verify_hash(&mnv.signature_hash1(&block_hash), &pmn1_pubkey, &mnv.vch_sig1)
                    .is_ok()
            } else {
                self.collab
                    .signer
                    .verify_message(
                        &mnv.signature_message1(&block_hash),
                        &pmn1_pubkey,
                        &mnv.vch_sig1,
                    )
                    .is_ok()
            };
            if !sig1_ok {
                println!("masternode: bad verified-node signature in broadcast");
                return;
            }
            let sig2_ok = if self.config.new_sigs {
                self.collab
                    .signer
                    .verify_hash(&mnv.signature_hash2(&block_hash), &pmn2_pubkey, &mnv.vch_sig2)
                    .is_ok()
            } else {
                self.collab
                    .signer
                    .verify_message(
                        &mnv.signature_message2(&block_hash),
                        &pmn2_pubkey,
                        &mnv.vch_sig2,
                    )
                    .is_ok()
            };
            if !sig2_ok {
                println!("masternode: bad witness signature in broadcast");
                return;
            }

            if let Some(record) = state.masternodes.get_mut(&mnv.masternode_outpoint1) {
                if !record.is_pose_verified() {
                    record.decrease_pose_ban_score();
                }
            }
            relay = true;
            println!(
                "masternode: verified {} for addr {}",
                mnv.masternode_outpoint1.to_string_short(),
                pmn1_addr
            );

            // everyone else on that address is an impostor
            let impostors: Vec<OutPoint> = state
                .masternodes
                .values()
                .filter(|mn| mn.addr == mnv.addr && mn.outpoint != mnv.masternode_outpoint1)
                .map(|mn| mn.outpoint)
                .collect();
            let impostor_count = impostors.len();
            for outpoint in impostors {
                if outpoint == self.collab.active.outpoint() {
                    continue;
                }
                if let Some(record) = state.masternodes.get_mut(&outpoint) {
                    record.increase_pose_ban_score();
                    println!(
                        "masternode: increased PoSe ban score for {} addr {} score {}",
                        outpoint.to_string_short(),
                        record.addr,
                        record.pose_ban_score
                    );
                }
            }
            if impostor_count > 0 {
                println!(
                    "masternode: PoSe score increased for {impostor_count} fake masternodes at addr {}",
                    pmn1_addr
                );
            }
        }

        if relay {
            connman.relay_inv(Inventory {
                kind: MSG_MASTERNODE_VERIFY,
                hash: mnv.hash(),
            });
        }
    }

    /// Duplicate-IP sweep: group records by host, keep the lowest ban score
    /// per group, ban the rest. Survivors get re-challenged when their
    /// service is probe-reachable, and accrue score when it is not.
    pub fn check_same_addr(&self) {
        if !self.collab.sync.is_synced() {
            return;
        }
        let active_outpoint = self.collab.active.outpoint();
        let active_service = self.collab.active.service();
        let now = self.now();

        let mut survivors: Vec<(OutPoint, NetAddr)> = Vec::new();
        {
            let Some(mut state) = self.lock_state() else {
                return;
            };
            if state.masternodes.is_empty() {
                return;
            }

            // someone else advertising our own address is banned outright
            let usurpers: Vec<OutPoint> = state
                .masternodes
                .values()
                .filter(|mn| {
                    mn.outpoint != active_outpoint && Some(mn.addr) == active_service
                })
                .map(|mn| mn.outpoint)
                .collect();
            for outpoint in usurpers {
                if let Some(record) = state.masternodes.get_mut(&outpoint) {
                    println!(
                        "masternode: banning {} at our own addr {}",
                        outpoint.to_string_short(),
                        record.addr
                    );
                    record.pose_ban();
                }
            }

            let mut groups: HashMap<NetAddr, Vec<(i32, OutPoint, NetAddr)>> = HashMap::new();
            for record in state.masternodes.values() {
                if record.outpoint == active_outpoint || record.is_terminal() {
                    continue;
                }
                groups.entry(record.addr.squashed()).or_default().push((
                    record.pose_ban_score,
                    record.outpoint,
                    record.addr,
                ));
            }

            let mut to_ban: Vec<OutPoint> = Vec::new();
            for (_, mut group) in groups {
                if group.len() < 2 {
                    continue;
                }
                group.sort();
                let (_, keep_outpoint, keep_addr) = group[0];
                survivors.push((keep_outpoint, keep_addr));
                to_ban.extend(group.into_iter().skip(1).map(|(_, outpoint, _)| outpoint));
            }
            let banned = to_ban.len();
            for outpoint in to_ban {
                if let Some(record) = state.masternodes.get_mut(&outpoint) {
                    println!(
                        "masternode: PoSe ban for duplicate-address masternode {}",
                        outpoint.to_string_short()
                    );
                    record.pose_ban();
                }
            }
            if banned > 0 {
                println!("masternode: duplicate-address sweep banned {banned} records");
            }
        }

        // probing runs without the registry lock
        for (outpoint, addr) in survivors {
            if self.probe_capable(&addr) && self.collab.health.probe(&addr) {
                let Some(mut state) = self.lock_state() else {
                    return;
                };
                println!(
                    "masternode: scheduling re-verification of {} addr {}",
                    outpoint.to_string_short(),
                    addr
                );
                state.should_ask_for_verification.insert(outpoint, now);
            } else {
                let Some(mut state) = self.lock_state() else {
                    return;
                };
                if let Some(record) = state.masternodes.get_mut(&outpoint) {
                    println!(
                        "masternode: could not probe {} addr {}, increasing score",
                        outpoint.to_string_short(),
                        addr
                    );
                    record.increase_pose_ban_score();
                }
            }
        }
    }

    /// Apply the external health monitor's unreachability reports: each
    /// bannable class costs the record one score point and consumes the
    /// report.
    pub fn check_missing_masternodes(&self) {
        if !self.collab.sync.is_synced() {
            return;
        }
        let active_outpoint = self.collab.active.outpoint();

        let candidates: Vec<(OutPoint, NetAddr)> = {
            let Some(state) = self.lock_state() else {
                return;
            };
            if state.masternodes.is_empty() {
                return;
            }
            state
                .masternodes
                .values()
                .filter(|mn| mn.outpoint != active_outpoint && !mn.is_terminal())
                .filter(|mn| {
                    mn.addr.is_routable() && !mn.addr.is_local() && self.probe_capable(&mn.addr)
                })
                .map(|mn| (mn.outpoint, mn.addr))
                .collect()
        };

        let mut flagged: Vec<OutPoint> = Vec::new();
        for (outpoint, addr) in &candidates {
            // any reported class means the service was not reachable
            if self.collab.health.reachability(addr).is_some() {
                self.collab.health.consume(addr);
                flagged.push(*outpoint);
            }
        }
        if flagged.is_empty() {
            return;
        }

        println!(
            "masternode: increasing PoSe ban score for {} unreachable masternodes of {} checked",
            flagged.len(),
            candidates.len()
        );
        let Some(mut state) = self.lock_state() else {
            return;
        };
        for outpoint in flagged {
            if let Some(record) = state.masternodes.get_mut(&outpoint) {
                record.increase_pose_ban_score();
            }
        }
    }

    fn probe_capable(&self, addr: &NetAddr) -> bool {
        (self.config.probe_ipv4 && addr.is_ipv4()) || (self.config.probe_ipv6 && addr.is_ipv6())
    }
}

/// Raise the score of whichever record advertises `addr`, skipping self.
fn increase_score_by_addr_locked(
    state: &mut ManagerState,
    addr: &NetAddr,
    active_outpoint: OutPoint,
    active_service: Option<NetAddr>,
) {
    if Some(*addr) == active_service {
        return;
    }
    let outpoints: Vec<OutPoint> = state
        .masternodes
        .values()
        .filter(|mn| mn.addr == *addr && mn.outpoint != active_outpoint)
        .map(|mn| mn.outpoint)
        .collect();
    for outpoint in outpoints {
        if let Some(record) = state.masternodes.get_mut(&outpoint) {
            record.increase_pose_ban_score();
        }
    }
}
