//! End-to-end scenarios for the masternode manager: gossip pacing,
//! announce dedup and update, the verification protocol, the duplicate-IP
//! sweep, payee selection and snapshot round trips.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};

use zocd_consensus::constants::{
    MIN_MASTERNODE_PAYMENT_PROTO, MISBEHAVIOR_DSEG_SPAM, MISBEHAVIOR_VERIFY_FAKE,
    PROTOCOL_VERSION,
};
use zocd_consensus::params::{chain_params, Network};
use zocd_consensus::Hash256;
use zocd_masternode::config::ManagerConfig;
use zocd_masternode::messages::{
    Inventory, MasternodeBroadcast, MasternodeVerification, OverlayMessage,
    MASTERNODE_SYNC_LIST, MSG_MASTERNODE_VERIFY,
};
use zocd_masternode::ports::*;
use zocd_masternode::record::{Masternode, MasternodeInfo, MasternodePing, MasternodeState};
use zocd_masternode::signer::SignError;
use zocd_masternode::MasternodeManager;
use zocd_primitives::hash::sha256d;
use zocd_primitives::{NetAddr, OutPoint};
use zocd_storage::memory::MemoryStore;
use zocd_storage::KeyValueStore;

// ---- mock collaborators -------------------------------------------------

#[derive(Default)]
struct MockChain {
    hashes: Mutex<HashMap<i32, Hash256>>,
    tip: Mutex<i32>,
    confirmations: Mutex<HashMap<OutPoint, Option<i32>>>,
}

impl MockChain {
    fn set_hash(&self, height: i32, hash: Hash256) {
        self.hashes.lock().expect("chain lock").insert(height, hash);
    }

    fn set_tip(&self, height: i32) {
        *self.tip.lock().expect("chain lock") = height;
    }

    fn set_confirmations(&self, outpoint: OutPoint, confirmations: Option<i32>) {
        self.confirmations
            .lock()
            .expect("chain lock")
            .insert(outpoint, confirmations);
    }
}

impl ChainView for MockChain {
    fn tip_height(&self) -> i32 {
        *self.tip.lock().expect("chain lock")
    }

    fn block_hash(&self, height: i32) -> Option<Hash256> {
        self.hashes.lock().expect("chain lock").get(&height).copied()
    }

    fn block_height(&self, hash: &Hash256) -> Option<i32> {
        self.hashes
            .lock()
            .expect("chain lock")
            .iter()
            .find(|(_, candidate)| *candidate == hash)
            .map(|(height, _)| *height)
    }

    fn utxo_confirmations(&self, outpoint: &OutPoint) -> Option<i32> {
        self.confirmations
            .lock()
            .expect("chain lock")
            .get(outpoint)
            .copied()
            .unwrap_or(Some(1_000))
    }
}

struct FullySynced;

impl SyncTracker for FullySynced {
    fn is_blockchain_synced(&self) -> bool {
        true
    }
    fn is_masternode_list_synced(&self) -> bool {
        true
    }
    fn is_winners_list_synced(&self) -> bool {
        true
    }
    fn is_synced(&self) -> bool {
        true
    }
    fn bump_asset_last_time(&self, _tag: &str) {}
}

/// Symmetric toy scheme: the public key doubles as the secret, signatures
/// are digests over (key bytes followed by the payload). Wrong key, wrong signature.
struct TestSigner;

impl TestSigner {
    fn tag(data: &[u8], payload: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(data.len() + payload.len());
        buffer.extend_from_slice(data);
        buffer.extend_from_slice(payload);
        sha256d(&buffer).to_vec()
    }
}

impl MessageSigner for TestSigner {
    fn sign_hash(&self, hash: &Hash256, key: &[u8]) -> Result<Vec<u8>, SignError> {
        Ok(Self::tag(key, hash))
    }

    fn verify_hash(&self, hash: &Hash256, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError> {
        if Self::tag(pubkey, hash) == sig {
            Ok(())
        } else {
            Err(SignError::VerifyFailed)
        }
    }

    fn sign_message(&self, message: &str, key: &[u8]) -> Result<Vec<u8>, SignError> {
        Ok(Self::tag(key, message.as_bytes()))
    }

    fn verify_message(&self, message: &str, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError> {
        if Self::tag(pubkey, message.as_bytes()) == sig {
            Ok(())
        } else {
            Err(SignError::VerifyFailed)
        }
    }
}

struct OpenPayments;

impl PaymentSchedule for OpenPayments {
    fn min_payments_proto(&self) -> i32 {
        MIN_MASTERNODE_PAYMENT_PROTO
    }
    fn is_scheduled(&self, _info: &MasternodeInfo, _height: i32) -> bool {
        false
    }
    fn storage_limit(&self) -> i32 {
        5_000
    }
    fn block_payee(&self, _height: i32) -> Option<Vec<u8>> {
        None
    }
}

struct NoGovernance;

impl GovernanceHooks for NoGovernance {
    fn check_orphan_objects(&self) {}
    fn check_orphan_votes(&self) {}
    fn update_caches_and_clean(&self) {}
}

#[derive(Default)]
struct MockHealth {
    probe_ok: Mutex<bool>,
    classes: Mutex<HashMap<NetAddr, ReachabilityClass>>,
}

impl HealthMonitor for MockHealth {
    fn reachability(&self, addr: &NetAddr) -> Option<ReachabilityClass> {
        self.classes.lock().expect("health lock").get(addr).copied()
    }
    fn consume(&self, addr: &NetAddr) {
        self.classes.lock().expect("health lock").remove(addr);
    }
    fn probe(&self, _addr: &NetAddr) -> bool {
        *self.probe_ok.lock().expect("health lock")
    }
}

#[derive(Default)]
struct MockAlerts {
    messages: Mutex<Vec<String>>,
}

impl AlertSink for MockAlerts {
    fn notify(&self, message: &str) {
        self.messages.lock().expect("alert lock").push(message.to_string());
    }
}

#[derive(Default)]
struct MockMisbehavior {
    strikes: Mutex<Vec<(PeerId, i32)>>,
}

impl MockMisbehavior {
    fn strikes(&self) -> Vec<(PeerId, i32)> {
        self.strikes.lock().expect("strike lock").clone()
    }
}

impl MisbehaviorSink for MockMisbehavior {
    fn misbehaving(&self, peer: PeerId, score: i32) {
        self.strikes.lock().expect("strike lock").push((peer, score));
    }
}

struct ManualTime {
    now: Mutex<i64>,
}

impl ManualTime {
    fn new(now: i64) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> i64 {
        *self.now.lock().expect("time lock")
    }
}

struct ActiveIdentity {
    outpoint: OutPoint,
    service: NetAddr,
    key: Vec<u8>,
}

impl ActiveNode for ActiveIdentity {
    fn outpoint(&self) -> OutPoint {
        self.outpoint
    }
    fn service(&self) -> Option<NetAddr> {
        Some(self.service)
    }
    fn pubkey_masternode(&self) -> Vec<u8> {
        self.key.clone()
    }
    fn sign_key(&self) -> Vec<u8> {
        self.key.clone()
    }
    fn is_masternode_mode(&self) -> bool {
        true
    }
    fn manage_state(&self, _connman: &dyn ConnectionManager) {}
}

struct MockPeer {
    id: PeerId,
    addr: NetAddr,
    messages: Mutex<Vec<OverlayMessage>>,
    inventories: Mutex<Vec<Inventory>>,
}

impl MockPeer {
    fn new(id: PeerId, addr: NetAddr) -> Self {
        Self {
            id,
            addr,
            messages: Mutex::new(Vec::new()),
            inventories: Mutex::new(Vec::new()),
        }
    }

    fn message_count(&self) -> usize {
        self.messages.lock().expect("peer lock").len()
    }

    fn inventory_count(&self) -> usize {
        self.inventories.lock().expect("peer lock").len()
    }

    fn last_message(&self) -> Option<OverlayMessage> {
        self.messages.lock().expect("peer lock").last().cloned()
    }
}

impl PeerHandle for MockPeer {
    fn id(&self) -> PeerId {
        self.id
    }
    fn addr(&self) -> NetAddr {
        self.addr
    }
    fn push_message(&self, message: OverlayMessage) {
        self.messages.lock().expect("peer lock").push(message);
    }
    fn push_inventory(&self, inv: Inventory) {
        self.inventories.lock().expect("peer lock").push(inv);
    }
    fn is_masternode_conn(&self) -> bool {
        false
    }
    fn request_disconnect(&self) {}
}

#[derive(Default)]
struct MockConnman {
    peers: Mutex<Vec<Arc<MockPeer>>>,
    pending_masternodes: Mutex<Vec<NetAddr>>,
    relayed: Mutex<Vec<Inventory>>,
}

impl MockConnman {
    fn register(&self, peer: Arc<MockPeer>) {
        self.peers.lock().expect("connman lock").push(peer);
    }

    fn pending(&self) -> Vec<NetAddr> {
        self.pending_masternodes.lock().expect("connman lock").clone()
    }

    fn relayed(&self) -> Vec<Inventory> {
        self.relayed.lock().expect("connman lock").clone()
    }
}

impl ConnectionManager for MockConnman {
    fn for_each_node(&self, visit: &mut dyn FnMut(&dyn PeerHandle)) {
        for peer in self.peers.lock().expect("connman lock").iter() {
            visit(peer.as_ref());
        }
    }

    fn for_node(&self, addr: &NetAddr, visit: &mut dyn FnMut(&dyn PeerHandle)) -> bool {
        let peers = self.peers.lock().expect("connman lock");
        for peer in peers.iter() {
            if peer.addr == *addr {
                visit(peer.as_ref());
                return true;
            }
        }
        false
    }

    fn find_node(&self, addr: &NetAddr) -> Option<PeerId> {
        self.peers
            .lock()
            .expect("connman lock")
            .iter()
            .find(|peer| peer.addr == *addr)
            .map(|peer| peer.id)
    }

    fn add_pending_masternode(&self, addr: &NetAddr) {
        self.pending_masternodes
            .lock()
            .expect("connman lock")
            .push(*addr);
    }

    fn is_masternode_or_disconnect_requested(&self, _addr: &NetAddr) -> bool {
        false
    }

    fn add_new_address(&self, _addr: &NetAddr, _from: &NetAddr) {}

    fn relay_inv(&self, inv: Inventory) {
        self.relayed.lock().expect("connman lock").push(inv);
    }
}

// ---- harness ------------------------------------------------------------

const NOW: i64 = 1_700_000_000;

struct Harness {
    manager: MasternodeManager,
    chain: Arc<MockChain>,
    misbehavior: Arc<MockMisbehavior>,
    health: Arc<MockHealth>,
    alerts: Arc<MockAlerts>,
    time: Arc<ManualTime>,
    connman: MockConnman,
}

fn v4(a: u8, b: u8, c: u8, d: u8, port: u16) -> NetAddr {
    NetAddr::new(IpAddr::V4(Ipv4Addr::new(a, b, c, d)), port)
}

fn outpoint(seed: u8) -> OutPoint {
    OutPoint::new([seed; 32], 0)
}

fn key_for(seed: u8) -> Vec<u8> {
    vec![seed; 33]
}

fn harness(network: Network, active: Option<ActiveIdentity>) -> Harness {
    let chain = Arc::new(MockChain::default());
    let misbehavior = Arc::new(MockMisbehavior::default());
    let health = Arc::new(MockHealth::default());
    let alerts = Arc::new(MockAlerts::default());
    let time = Arc::new(ManualTime::new(NOW));
    chain.set_tip(1_000);

    let active: Arc<dyn ActiveNode> = match active {
        Some(identity) => Arc::new(identity),
        None => Arc::new(NoActiveNode),
    };
    let collab = Collaborators {
        chain: Arc::clone(&chain) as Arc<dyn ChainView>,
        sync: Arc::new(FullySynced),
        signer: Arc::new(TestSigner),
        payments: Arc::new(OpenPayments),
        governance: Arc::new(NoGovernance),
        active,
        health: Arc::clone(&health) as Arc<dyn HealthMonitor>,
        alerts: Arc::clone(&alerts) as Arc<dyn AlertSink>,
        misbehavior: Arc::clone(&misbehavior) as Arc<dyn MisbehaviorSink>,
        time: Arc::clone(&time) as Arc<dyn TimeSource>,
    };
    let manager = MasternodeManager::new(
        Arc::new(chain_params(network)),
        ManagerConfig::default(),
        collab,
    );
    Harness {
        manager,
        chain,
        misbehavior,
        health,
        alerts,
        time,
        connman: MockConnman::default(),
    }
}

fn make_ping(outpoint: OutPoint, block_hash: Hash256, sig_time: i64) -> MasternodePing {
    MasternodePing {
        masternode_outpoint: outpoint,
        block_hash,
        sig_time,
        sig: Vec::new(),
        sentinel_is_current: true,
        sentinel_version: 1,
        daemon_version: 1_000_000,
    }
}

fn make_record(seed: u8, addr: NetAddr) -> Masternode {
    let outpoint = outpoint(seed);
    Masternode {
        outpoint,
        addr,
        pubkey_collateral: key_for(seed),
        pubkey_masternode: key_for(seed),
        last_ping: Some(make_ping(outpoint, [0x10; 32], NOW - 60)),
        sig: Vec::new(),
        sig_time: NOW - 7_200,
        last_dsq: 0,
        time_last_checked: 0,
        last_paid_block: 0,
        active_state: MasternodeState::Enabled,
        protocol_version: PROTOCOL_VERSION,
        pose_ban_score: 0,
        allow_mixing_tx: false,
        governance_votes: BTreeSet::new(),
    }
}

fn signed_broadcast(seed: u8, addr: NetAddr, sig_time: i64) -> MasternodeBroadcast {
    let signer = TestSigner;
    let outpoint = outpoint(seed);
    let mut ping = make_ping(outpoint, [0x10; 32], sig_time);
    ping.sig = signer
        .sign_hash(&ping.signature_hash(), &key_for(seed))
        .expect("sign ping");
    let mut mnb = MasternodeBroadcast {
        outpoint,
        addr,
        pubkey_collateral: key_for(seed),
        pubkey_masternode: key_for(seed),
        sig: Vec::new(),
        sig_time,
        protocol_version: PROTOCOL_VERSION,
        last_ping: Some(ping),
        recovery: false,
    };
    mnb.sig = signer
        .sign_hash(&mnb.signature_hash(), &key_for(seed))
        .expect("sign mnb");
    mnb
}

// ---- scenario 1: full-list pacing ---------------------------------------

#[test]
fn full_list_request_is_paced_on_mainnet() {
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    h.manager.add(make_record(2, v4(203, 0, 113, 2, 10_000)));

    let peer = MockPeer::new(7, v4(198, 51, 100, 7, 10_000));

    h.manager
        .process_message(&peer, OverlayMessage::Dseg(OutPoint::null()), &h.connman);

    // two records, an announce and a ping inv each, plus one status summary
    assert_eq!(peer.inventory_count(), 4);
    assert_eq!(peer.message_count(), 1);
    match peer.last_message() {
        Some(OverlayMessage::SyncStatusCount { item, count }) => {
            assert_eq!(item, MASTERNODE_SYNC_LIST);
            assert_eq!(count, 2);
        }
        other => panic!("expected sync status count, got {other:?}"),
    }
    assert!(h.misbehavior.strikes().is_empty());

    // ten seconds later the same peer asks again
    *h.time.now.lock().expect("time lock") += 10;
    h.manager
        .process_message(&peer, OverlayMessage::Dseg(OutPoint::null()), &h.connman);

    assert_eq!(peer.inventory_count(), 4, "no data on the repeat request");
    assert_eq!(peer.message_count(), 1);
    assert_eq!(h.misbehavior.strikes(), vec![(7, MISBEHAVIOR_DSEG_SPAM)]);
}

#[test]
fn local_peers_are_not_paced() {
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    let peer = MockPeer::new(9, v4(127, 0, 0, 1, 10_000));

    h.manager
        .process_message(&peer, OverlayMessage::Dseg(OutPoint::null()), &h.connman);
    h.manager
        .process_message(&peer, OverlayMessage::Dseg(OutPoint::null()), &h.connman);

    assert!(h.misbehavior.strikes().is_empty());
    assert_eq!(peer.message_count(), 2);
}

// ---- scenario 2: dedup then update --------------------------------------

#[test]
fn announce_dedup_then_update_replaces_seen_entry() {
    let h = harness(Network::Main, None);
    let a1 = signed_broadcast(5, v4(203, 0, 113, 5, 10_000), NOW - 7_200);
    let hash_a1 = a1.hash();

    let accepted = h
        .manager
        .check_mnb_and_update_masternode_list(None, a1.clone(), &h.connman)
        .expect("ingest a1");
    assert!(accepted);
    assert!(h.manager.has(&outpoint(5)));
    assert!(h.manager.has_seen_broadcast(&hash_a1));
    let relayed_before = h.connman.relayed().len();

    // identical redelivery is a no-op
    let deduped = h
        .manager
        .check_mnb_and_update_masternode_list(None, a1, &h.connman)
        .expect("dedup a1");
    assert!(deduped);
    assert_eq!(h.connman.relayed().len(), relayed_before, "dedup must not relay");

    // a newer broadcast for the same outpoint moves the service address
    let new_addr = v4(203, 0, 113, 99, 10_000);
    let a2 = signed_broadcast(5, new_addr, NOW - 3_600);
    let hash_a2 = a2.hash();
    let updated = h
        .manager
        .check_mnb_and_update_masternode_list(None, a2, &h.connman)
        .expect("ingest a2");
    assert!(updated);

    let record = h.manager.get(&outpoint(5)).expect("record");
    assert_eq!(record.addr, new_addr);
    assert!(!h.manager.has_seen_broadcast(&hash_a1), "stale seen entry purged");
    assert!(h.manager.has_seen_broadcast(&hash_a2));
}

#[test]
fn spent_collateral_is_rejected() {
    let h = harness(Network::Main, None);
    let mnb = signed_broadcast(6, v4(203, 0, 113, 6, 10_000), NOW - 7_200);
    h.chain.set_confirmations(outpoint(6), None);

    let accepted = h
        .manager
        .check_mnb_and_update_masternode_list(None, mnb, &h.connman)
        .expect("ingest");
    assert!(!accepted);
    assert!(!h.manager.has(&outpoint(6)));
}

// ---- scenarios 3 and 4: verification ------------------------------------

struct VerifySetup {
    h: Harness,
    m1_addr: NetAddr,
    m3_addr_shared: bool,
    challenge: MasternodeVerification,
    block_hash: Hash256,
}

/// Build a challenger (active masternode m2) that has already sent a
/// challenge to m1's address, with m3 optionally squatting the same address.
fn verify_setup(share_addr: bool) -> VerifySetup {
    let m1_addr = v4(203, 0, 113, 1, 10_000);
    let m2_addr = v4(203, 0, 113, 2, 10_000);
    let active = ActiveIdentity {
        outpoint: outpoint(2),
        service: m2_addr,
        key: key_for(2),
    };
    let h = harness(Network::Main, Some(active));
    let block_hash = [0x77; 32];
    h.chain.set_hash(999, block_hash);
    h.chain.set_tip(1_000);
    h.manager.updated_block_tip(1_000);

    h.manager.add(make_record(1, m1_addr));
    h.manager.add(make_record(2, m2_addr));
    if share_addr {
        // records reach a shared address through updates, never through add
        h.manager.add(make_record(3, v4(203, 0, 113, 3, 10_000)));
        let moved = signed_broadcast(3, m1_addr, NOW - 3_600);
        h.manager
            .check_mnb_and_update_masternode_list(None, moved, &h.connman)
            .expect("move m3");
        assert_eq!(h.manager.get(&outpoint(3)).expect("m3").addr, m1_addr);
    }

    // the challenger side queues and transmits the nonce-bound challenge
    let m1_peer = Arc::new(MockPeer::new(1, m1_addr));
    h.connman.register(Arc::clone(&m1_peer));
    h.manager.ask_for_verification(m1_addr, &h.connman);
    h.manager.process_pending_mnv_requests(&h.connman);

    let challenge = match m1_peer.last_message() {
        Some(OverlayMessage::MasternodeVerify(mnv)) => mnv,
        other => panic!("expected a challenge, got {other:?}"),
    };
    assert!(challenge.is_challenge());
    assert_eq!(challenge.block_height, 999);

    VerifySetup {
        h,
        m1_addr,
        m3_addr_shared: share_addr,
        challenge,
        block_hash,
    }
}

#[test]
fn verification_happy_path_clears_the_real_masternode() {
    let setup = verify_setup(false);
    let h = &setup.h;

    // m1 answers with a valid signature over the challenge tuple
    let mut reply = setup.challenge.clone();
    reply.vch_sig1 = TestSigner
        .sign_hash(&reply.signature_hash1(&setup.block_hash), &key_for(1))
        .expect("sign reply");

    let m1_peer = MockPeer::new(1, setup.m1_addr);
    let before = h.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score;
    h.manager
        .process_message(&m1_peer, OverlayMessage::MasternodeVerify(reply), &h.connman);

    let after = h.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score;
    assert!(after < before, "verified node's score must drop");
    assert!(h.misbehavior.strikes().is_empty());

    // the countersigned broadcast went out
    let relayed = h.connman.relayed();
    assert!(relayed.iter().any(|inv| inv.kind == MSG_MASTERNODE_VERIFY));
}

#[test]
fn witnessed_broadcast_is_accepted_once_by_listeners() {
    let setup = verify_setup(false);
    let h = &setup.h;

    let mut reply = setup.challenge.clone();
    reply.vch_sig1 = TestSigner
        .sign_hash(&reply.signature_hash1(&setup.block_hash), &key_for(1))
        .expect("sign reply");
    let m1_peer = MockPeer::new(1, setup.m1_addr);
    h.manager
        .process_message(&m1_peer, OverlayMessage::MasternodeVerify(reply.clone()), &h.connman);

    // reconstruct the broadcast the challenger would relay
    let mut witnessed = reply;
    witnessed.masternode_outpoint1 = outpoint(1);
    witnessed.masternode_outpoint2 = outpoint(2);
    witnessed.vch_sig2 = TestSigner
        .sign_hash(&witnessed.signature_hash2(&setup.block_hash), &key_for(2))
        .expect("sign witness");

    // an observer node with the same view accepts it and relays once
    let observer = harness(Network::Main, None);
    observer.chain.set_hash(999, setup.block_hash);
    observer.chain.set_tip(1_000);
    observer.manager.updated_block_tip(1_000);
    observer.manager.add(make_record(1, setup.m1_addr));
    observer.manager.add(make_record(2, v4(203, 0, 113, 2, 10_000)));

    let gossip_peer = MockPeer::new(42, v4(198, 51, 100, 42, 10_000));
    let before = observer.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score;
    observer.manager.process_message(
        &gossip_peer,
        OverlayMessage::MasternodeVerify(witnessed.clone()),
        &observer.connman,
    );
    let after = observer.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score;
    assert!(after < before);
    assert_eq!(observer.connman.relayed().len(), 1);

    // redelivery is deduplicated
    observer.manager.process_message(
        &gossip_peer,
        OverlayMessage::MasternodeVerify(witnessed),
        &observer.connman,
    );
    assert_eq!(observer.connman.relayed().len(), 1);
    assert!(observer.misbehavior.strikes().is_empty());
}

#[test]
fn forged_verification_reply_penalizes_peer_and_impostors() {
    let setup = verify_setup(true);
    let h = &setup.h;
    assert!(setup.m3_addr_shared);

    // signature produced by a key no record at this address owns
    let mut reply = setup.challenge.clone();
    reply.vch_sig1 = TestSigner
        .sign_hash(&reply.signature_hash1(&setup.block_hash), &key_for(66))
        .expect("sign forged");

    let m1_peer = MockPeer::new(1, setup.m1_addr);
    let score_m1 = h.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score;
    let score_m3 = h.manager.get_info(&outpoint(3)).expect("m3").pose_ban_score;

    h.manager
        .process_message(&m1_peer, OverlayMessage::MasternodeVerify(reply), &h.connman);

    assert!(h
        .misbehavior
        .strikes()
        .contains(&(1, MISBEHAVIOR_VERIFY_FAKE)));
    // every record sharing the address failed key verification
    assert_eq!(
        h.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score,
        score_m1 + 1
    );
    assert_eq!(
        h.manager.get_info(&outpoint(3)).expect("m3").pose_ban_score,
        score_m3 + 1
    );
}

// ---- scenario 5: duplicate-IP sweep -------------------------------------

#[test]
fn duplicate_ip_sweep_keeps_lowest_score_and_schedules_reverify() {
    let shared = v4(203, 0, 113, 5, 10_000);
    let active = ActiveIdentity {
        outpoint: outpoint(9),
        service: v4(203, 0, 113, 9, 10_000),
        key: key_for(9),
    };
    let h = harness(Network::Main, Some(active));
    h.chain.set_hash(999, [0x31; 32]);
    h.manager.updated_block_tip(1_000);

    // collisions arise through updates; seed distinct, then move
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    h.manager.add(make_record(2, v4(203, 0, 113, 2, 10_000)));
    h.manager.add(make_record(3, shared));
    h.manager.add(make_record(9, v4(203, 0, 113, 9, 10_000)));
    for seed in [1u8, 2] {
        let moved = signed_broadcast(seed, shared, NOW - 3_600);
        h.manager
            .check_mnb_and_update_masternode_list(None, moved, &h.connman)
            .expect("move record");
    }
    // scores 0, 2, 4: the lowest survives
    for _ in 0..2 {
        h.manager.increase_pose_ban_score(&outpoint(2));
    }
    for _ in 0..4 {
        h.manager.increase_pose_ban_score(&outpoint(3));
    }

    *h.health.probe_ok.lock().expect("health lock") = true;
    h.manager.check_same_addr();

    assert!(!h.manager.get(&outpoint(1)).expect("m1").is_pose_banned());
    assert!(h.manager.get(&outpoint(2)).expect("m2").is_pose_banned());
    assert!(h.manager.get(&outpoint(3)).expect("m3").is_pose_banned());

    // the survivor is queued for re-verification on the next round
    h.manager.do_full_verification_step(&h.connman);
    assert!(h.connman.pending().contains(&shared));
}

#[test]
fn unreachable_sweep_survivor_accrues_score() {
    let shared = v4(203, 0, 113, 5, 10_000);
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    h.manager.add(make_record(2, shared));
    let moved = signed_broadcast(1, shared, NOW - 3_600);
    h.manager
        .check_mnb_and_update_masternode_list(None, moved, &h.connman)
        .expect("move record");
    h.manager.increase_pose_ban_score(&outpoint(2));

    *h.health.probe_ok.lock().expect("health lock") = false;
    h.manager.check_same_addr();

    // m1 survived (score 0) but could not be probed
    assert!(!h.manager.get(&outpoint(1)).expect("m1").is_pose_banned());
    assert!(h.manager.get(&outpoint(2)).expect("m2").is_pose_banned());
    assert_eq!(h.manager.get_info(&outpoint(1)).expect("m1").pose_ban_score, 1);
}

#[test]
fn record_at_our_own_address_is_banned() {
    let my_service = v4(203, 0, 113, 9, 10_000);
    let active = ActiveIdentity {
        outpoint: outpoint(9),
        service: my_service,
        key: key_for(9),
    };
    let h = harness(Network::Main, Some(active));
    h.manager.add(make_record(9, my_service));
    h.manager.add(make_record(4, v4(203, 0, 113, 4, 10_000)));
    let usurper = signed_broadcast(4, my_service, NOW - 3_600);
    h.manager
        .check_mnb_and_update_masternode_list(None, usurper, &h.connman)
        .expect("move usurper");

    h.manager.check_same_addr();

    assert!(h.manager.get(&outpoint(4)).expect("usurper").is_pose_banned());
    assert!(!h.manager.get(&outpoint(9)).expect("self").is_pose_banned());
}

// ---- scenario 6: payee selection ----------------------------------------

fn payee_harness(hash_899: Hash256) -> Harness {
    let h = harness(Network::Main, None);
    h.chain.set_hash(899, hash_899);
    h.chain.set_hash(999, [0xEE; 32]);
    h.chain.set_tip(1_000);
    for i in 0..90u8 {
        let mut record = make_record(i + 1, v4(203, 0, 113, i + 1, 10_000));
        record.last_paid_block = 100 + i as i32;
        record.sig_time = NOW - 1_000_000;
        h.manager.add(record);
    }
    h
}

fn expected_winner(hash_899: Hash256) -> OutPoint {
    // oldest tenth by last paid: seeds 1..=9, then highest score wins
    (1..=9u8)
        .map(outpoint)
        .max_by_key(|candidate| zocd_masternode::record::score_for(candidate, &hash_899))
        .expect("winner")
}

#[test]
fn payee_selection_picks_highest_score_of_oldest_tenth() {
    let hash_899 = [0x44; 32];
    let h = payee_harness(hash_899);

    let (winner, count) = h.manager.get_next_masternode_in_queue(1_000, true);
    let winner = winner.expect("winner");
    assert_eq!(count, 90);
    assert_eq!(winner.outpoint, expected_winner(hash_899));
    assert!(winner.outpoint.txid[0] <= 9, "winner comes from the oldest tenth");
}

#[test]
fn payee_selection_depends_only_on_the_lagged_hash() {
    let hash_a = [0x44; 32];
    // pick an alternative hash that provably moves the winner
    let hash_b = (0x45..=0xffu8)
        .map(|byte| [byte; 32])
        .find(|candidate| expected_winner(*candidate) != expected_winner(hash_a))
        .expect("distinguishing hash");

    let h = payee_harness(hash_a);
    let (winner_a, _) = h.manager.get_next_masternode_in_queue(1_000, true);

    // changing the tip-adjacent hash must not matter
    h.chain.set_hash(999, [0x01; 32]);
    let (winner_a2, _) = h.manager.get_next_masternode_in_queue(1_000, true);
    assert_eq!(
        winner_a.as_ref().map(|info| info.outpoint),
        winner_a2.as_ref().map(|info| info.outpoint)
    );

    // changing the 101-lagged hash changes the winner
    let h2 = payee_harness(hash_b);
    let (winner_b, _) = h2.manager.get_next_masternode_in_queue(1_000, true);
    assert_eq!(
        winner_b.as_ref().map(|info| info.outpoint),
        Some(expected_winner(hash_b))
    );
    assert_ne!(
        winner_a.map(|info| info.outpoint),
        winner_b.map(|info| info.outpoint)
    );
}

#[test]
fn payee_selection_fails_without_the_lagged_hash() {
    let h = harness(Network::Main, None);
    h.chain.set_tip(1_000);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    let (winner, count) = h.manager.get_next_masternode_in_queue(1_000, true);
    assert!(winner.is_none());
    assert_eq!(count, 0);
}

// ---- ranks, laws and invariants -----------------------------------------

#[test]
fn ranks_are_deterministic_and_ordered() {
    let h = harness(Network::Main, None);
    h.chain.set_hash(500, [0x21; 32]);
    for i in 1..=20u8 {
        h.manager.add(make_record(i, v4(203, 0, 113, i, 10_000)));
    }

    let first = h.manager.get_masternode_ranks(500, 0);
    let second = h.manager.get_masternode_ranks(500, 0);
    assert_eq!(first.len(), 20);
    assert_eq!(
        first.iter().map(|(r, i)| (*r, i.outpoint)).collect::<Vec<_>>(),
        second.iter().map(|(r, i)| (*r, i.outpoint)).collect::<Vec<_>>()
    );
    assert_eq!(first[0].0, 1);

    // the per-record rank lookup agrees with the list
    for (rank, info) in first.iter().take(5) {
        assert_eq!(
            h.manager.get_masternode_rank(&info.outpoint, 500, 0),
            Some(*rank)
        );
    }
}

#[test]
fn ping_times_are_monotonic_per_record() {
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    let stored = h.manager.get(&outpoint(1)).expect("record").last_ping_time();

    let stale = make_ping(outpoint(1), [0x10; 32], stored - 100);
    h.manager.set_masternode_last_ping(&outpoint(1), stale);
    assert_eq!(
        h.manager.get(&outpoint(1)).expect("record").last_ping_time(),
        stored
    );

    let fresh = make_ping(outpoint(1), [0x10; 32], stored + 100);
    h.manager.set_masternode_last_ping(&outpoint(1), fresh);
    assert_eq!(
        h.manager.get(&outpoint(1)).expect("record").last_ping_time(),
        stored + 100
    );
}

#[test]
fn self_is_never_banned_through_score_entry_points() {
    let my_outpoint = outpoint(9);
    let my_service = v4(203, 0, 113, 9, 10_000);
    let active = ActiveIdentity {
        outpoint: my_outpoint,
        service: my_service,
        key: key_for(9),
    };
    let h = harness(Network::Main, Some(active));
    h.manager.add(make_record(9, my_service));

    assert!(!h.manager.increase_pose_ban_score(&my_outpoint));
    assert!(!h.manager.pose_ban(&my_outpoint));
    assert!(!h.manager.increase_pose_ban_score_by_addr(&my_service));
    assert!(!h.manager.pose_ban_by_addr(&my_service));

    let record = h.manager.get(&my_outpoint).expect("self");
    assert_eq!(record.pose_ban_score, 0);
    assert!(!record.is_pose_banned());
}

#[test]
fn mixing_announcements_are_totally_ordered() {
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    h.manager.add(make_record(2, v4(203, 0, 113, 2, 10_000)));

    assert!(h.manager.allow_mixing(&outpoint(1)));
    assert!(h.manager.allow_mixing(&outpoint(2)));
    let first = h.manager.get(&outpoint(1)).expect("record").last_dsq;
    let second = h.manager.get(&outpoint(2)).expect("record").last_dsq;
    assert!(second > first);
    assert!(h.manager.get(&outpoint(1)).expect("record").allow_mixing_tx);

    assert!(h.manager.disallow_mixing(&outpoint(1)));
    assert!(!h.manager.get(&outpoint(1)).expect("record").allow_mixing_tx);
}

#[test]
fn find_random_respects_exclusions() {
    let h = harness(Network::Main, None);
    for i in 1..=10u8 {
        h.manager.add(make_record(i, v4(203, 0, 113, i, 10_000)));
    }
    let exclude: Vec<OutPoint> = (1..=9u8).map(outpoint).collect();
    for _ in 0..20 {
        let found = h
            .manager
            .find_random_not_in_vec(&exclude, Some(0))
            .expect("candidate");
        assert_eq!(found.outpoint, outpoint(10));
    }
    let all: Vec<OutPoint> = (1..=10u8).map(outpoint).collect();
    assert!(h.manager.find_random_not_in_vec(&all, Some(0)).is_none());
}

// ---- snapshot round trip ------------------------------------------------

#[test]
fn snapshot_round_trips_bit_for_bit() {
    let h = harness(Network::Main, None);
    for i in 1..=5u8 {
        let mut record = make_record(i, v4(203, 0, 113, i, 10_000));
        record.governance_votes.insert([i; 32]);
        h.manager.add(record);
    }
    h.manager.allow_mixing(&outpoint(3));
    let mnb = signed_broadcast(7, v4(203, 0, 113, 7, 10_000), NOW - 7_200);
    h.manager
        .check_mnb_and_update_masternode_list(None, mnb, &h.connman)
        .expect("ingest");
    h.manager.update_last_sentinel_ping_time();

    let store = MemoryStore::new();
    h.manager.save(&store).expect("save");
    let bytes_before = store
        .get(zocd_storage::Column::MasternodeMan, b"snapshot")
        .expect("get")
        .expect("snapshot present");

    let h2 = harness(Network::Main, None);
    assert!(h2.manager.load(&store).expect("load"));
    assert_eq!(h2.manager.size(), h.manager.size());
    assert_eq!(
        h2.manager.get(&outpoint(3)).expect("record").last_dsq,
        h.manager.get(&outpoint(3)).expect("record").last_dsq
    );

    let store2 = MemoryStore::new();
    h2.manager.save(&store2).expect("save again");
    let bytes_after = store2
        .get(zocd_storage::Column::MasternodeMan, b"snapshot")
        .expect("get")
        .expect("snapshot present");
    assert_eq!(bytes_before, bytes_after);
}

#[test]
fn snapshot_with_wrong_version_tag_is_refused() {
    let store = MemoryStore::new();
    let mut encoder = zocd_primitives::encoding::Encoder::new();
    encoder.write_var_str("CMasternodeMan-Version-7");
    store
        .put(
            zocd_storage::Column::MasternodeMan,
            b"snapshot",
            &encoder.into_inner(),
        )
        .expect("put");

    let h = harness(Network::Main, None);
    assert!(h.manager.load(&store).is_err());
    assert_eq!(h.manager.size(), 0);
}

// ---- housekeeping -------------------------------------------------------

#[test]
fn housekeeping_removes_terminal_records() {
    let h = harness(Network::Main, None);
    h.manager.add(make_record(1, v4(203, 0, 113, 1, 10_000)));
    h.manager.add(make_record(2, v4(203, 0, 113, 2, 10_000)));
    h.manager.update_last_sentinel_ping_time();

    // collateral of record 2 gets spent
    h.chain.set_confirmations(outpoint(2), None);
    h.manager.check_and_remove(&h.connman);

    assert!(h.manager.has(&outpoint(1)));
    assert!(!h.manager.has(&outpoint(2)), "spent record swept");
}

#[test]
fn daemon_update_warning_fires_once_at_half() {
    let h = harness(Network::Main, None);
    for i in 1..=4u8 {
        let mut record = make_record(i, v4(203, 0, 113, i, 10_000));
        if i <= 2 {
            if let Some(ping) = record.last_ping.as_mut() {
                ping.daemon_version = 99_000_000;
            }
        }
        h.manager.add(record);
    }

    h.manager.warn_masternode_daemon_updates();
    h.manager.warn_masternode_daemon_updates();

    let messages = h.alerts.messages.lock().expect("alerts lock");
    assert_eq!(messages.len(), 1, "warning is latched");
    assert!(messages[0].contains("2 of 4"));
}
