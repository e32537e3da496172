//! Capability seams to the rest of the node.
//!
//! The manager core never reaches for process-wide state; every collaborator
//! is injected here once at wiring time. The connection manager is passed per
//! call instead, mirroring how message handlers receive their transport.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use zocd_consensus::Hash256;
use zocd_primitives::{NetAddr, OutPoint};

use crate::messages::{Inventory, OverlayMessage};
use crate::record::MasternodeInfo;
use crate::signer::SignError;

pub type PeerId = u64;

/// Read access to the best chain. Implementations lock internally; the
/// manager always finishes chain reads before taking its own registry lock.
pub trait ChainView: Send + Sync {
    fn tip_height(&self) -> i32;
    fn block_hash(&self, height: i32) -> Option<Hash256>;
    fn block_height(&self, hash: &Hash256) -> Option<i32>;
    /// Confirmations of a collateral-funding output of the required value.
    /// `None` once spent, absent or of the wrong value.
    fn utxo_confirmations(&self, outpoint: &OutPoint) -> Option<i32>;
}

/// One connected peer, as seen by a message handler.
pub trait PeerHandle {
    fn id(&self) -> PeerId;
    fn addr(&self) -> NetAddr;
    fn push_message(&self, message: OverlayMessage);
    fn push_inventory(&self, inv: Inventory);
    fn is_masternode_conn(&self) -> bool;
    fn request_disconnect(&self);
}

pub trait ConnectionManager: Send + Sync {
    fn for_each_node(&self, visit: &mut dyn FnMut(&dyn PeerHandle));
    /// Runs `visit` for the node at `addr` if connected; returns whether it ran.
    fn for_node(&self, addr: &NetAddr, visit: &mut dyn FnMut(&dyn PeerHandle)) -> bool;
    fn find_node(&self, addr: &NetAddr) -> Option<PeerId>;
    fn add_pending_masternode(&self, addr: &NetAddr);
    fn is_masternode_or_disconnect_requested(&self, addr: &NetAddr) -> bool;
    /// Feed a gossiped service address into the address book.
    fn add_new_address(&self, addr: &NetAddr, from: &NetAddr);
    fn relay_inv(&self, inv: Inventory);
}

/// Readiness flags maintained by the sync state machine.
pub trait SyncTracker: Send + Sync {
    fn is_blockchain_synced(&self) -> bool;
    fn is_masternode_list_synced(&self) -> bool;
    fn is_winners_list_synced(&self) -> bool;
    fn is_synced(&self) -> bool;
    fn bump_asset_last_time(&self, tag: &str);
}

/// Signature scheme seam. Key material is carried as opaque bytes so the
/// curve stays a wiring decision.
pub trait MessageSigner: Send + Sync {
    fn sign_hash(&self, hash: &Hash256, key: &[u8]) -> Result<Vec<u8>, SignError>;
    fn verify_hash(&self, hash: &Hash256, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError>;
    fn sign_message(&self, message: &str, key: &[u8]) -> Result<Vec<u8>, SignError>;
    fn verify_message(&self, message: &str, pubkey: &[u8], sig: &[u8]) -> Result<(), SignError>;
}

pub trait PaymentSchedule: Send + Sync {
    fn min_payments_proto(&self) -> i32;
    /// Whether this masternode is already queued to be paid within the
    /// propagation lookahead of `height`.
    fn is_scheduled(&self, info: &MasternodeInfo, height: i32) -> bool;
    /// How many blocks of payee history the payments module keeps.
    fn storage_limit(&self) -> i32;
    /// Collateral payee recorded as the winner of `height`, if known.
    fn block_payee(&self, height: i32) -> Option<Vec<u8>>;
}

pub trait GovernanceHooks: Send + Sync {
    fn check_orphan_objects(&self);
    fn check_orphan_votes(&self);
    fn update_caches_and_clean(&self);
}

/// Reachability classes reported by the external health monitor. The classes
/// are opaque codes to this subsystem; all three mean "service not reachable".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReachabilityClass {
    NoRoute,
    HostUnreachable,
    AdminFiltered,
}

pub trait HealthMonitor: Send + Sync {
    /// Last reported reachability class for an address, if any.
    fn reachability(&self, addr: &NetAddr) -> Option<ReachabilityClass>;
    /// Drop the stored report once it has been acted upon.
    fn consume(&self, addr: &NetAddr);
    /// Short-lived socket probe of a service address.
    fn probe(&self, addr: &NetAddr) -> bool;
}

/// User-visible warnings (GUI alert bar, `getinfo` warnings field).
pub trait AlertSink: Send + Sync {
    fn notify(&self, message: &str);
}

pub trait MisbehaviorSink: Send + Sync {
    fn misbehaving(&self, peer: PeerId, score: i32);
}

pub trait TimeSource: Send + Sync {
    fn now(&self) -> i64;
    /// Network-adjusted clock; defaults to local time.
    fn adjusted_now(&self) -> i64 {
        self.now()
    }
}

#[derive(Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs() as i64)
            .unwrap_or(0)
    }
}

/// The local masternode identity, when this node runs as one.
pub trait ActiveNode: Send + Sync {
    /// Null outpoint when this node is not an active masternode.
    fn outpoint(&self) -> OutPoint;
    fn service(&self) -> Option<NetAddr>;
    fn pubkey_masternode(&self) -> Vec<u8>;
    fn sign_key(&self) -> Vec<u8>;
    fn is_masternode_mode(&self) -> bool;
    /// Re-run the local activation state machine after a remote start.
    fn manage_state(&self, connman: &dyn ConnectionManager);
}

/// Placeholder identity for nodes that are not masternodes.
#[derive(Debug, Default)]
pub struct NoActiveNode;

impl ActiveNode for NoActiveNode {
    fn outpoint(&self) -> OutPoint {
        OutPoint::null()
    }

    fn service(&self) -> Option<NetAddr> {
        None
    }

    fn pubkey_masternode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn sign_key(&self) -> Vec<u8> {
        Vec::new()
    }

    fn is_masternode_mode(&self) -> bool {
        false
    }

    fn manage_state(&self, _connman: &dyn ConnectionManager) {}
}

/// Everything the manager needs injected, bundled to keep wiring in one place.
#[derive(Clone)]
pub struct Collaborators {
    pub chain: Arc<dyn ChainView>,
    pub sync: Arc<dyn SyncTracker>,
    pub signer: Arc<dyn MessageSigner>,
    pub payments: Arc<dyn PaymentSchedule>,
    pub governance: Arc<dyn GovernanceHooks>,
    pub active: Arc<dyn ActiveNode>,
    pub health: Arc<dyn HealthMonitor>,
    pub alerts: Arc<dyn AlertSink>,
    pub misbehavior: Arc<dyn MisbehaviorSink>,
    pub time: Arc<dyn TimeSource>,
}
