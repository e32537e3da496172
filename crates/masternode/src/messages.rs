//! Gossip envelopes of the masternode subsystem and their structural checks.

use std::fmt;

use zocd_consensus::constants::{
    MASTERNODE_FUTURE_SIGTIME_SLACK, MIN_MASTERNODE_PAYMENT_PROTO,
};
use zocd_consensus::{hash256_to_hex, ChainParams, Hash256};
use zocd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use zocd_primitives::hash::sha256d;
use zocd_primitives::{NetAddr, OutPoint};

use crate::ports::MessageSigner;
use crate::record::{Masternode, MasternodePing, MasternodeState};

/// Inventory type for masternode announces.
pub const MSG_MASTERNODE_ANNOUNCE: u32 = 14;
/// Inventory type for masternode pings.
pub const MSG_MASTERNODE_PING: u32 = 15;
/// Inventory type for verification broadcasts.
pub const MSG_MASTERNODE_VERIFY: u32 = 19;

/// Sync-status item tag for the masternode list.
pub const MASTERNODE_SYNC_LIST: i32 = 2;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Inventory {
    pub kind: u32,
    pub hash: Hash256,
}

#[derive(Clone, Debug)]
pub enum OverlayMessage {
    Dseg(OutPoint),
    MasternodeAnnounce(MasternodeBroadcast),
    MasternodePing(MasternodePing),
    MasternodeVerify(MasternodeVerification),
    SyncStatusCount { item: i32, count: i32 },
    GetData(Vec<Inventory>),
}

impl OverlayMessage {
    pub fn command(&self) -> &'static str {
        match self {
            OverlayMessage::Dseg(_) => "dseg",
            OverlayMessage::MasternodeAnnounce(_) => "mnb",
            OverlayMessage::MasternodePing(_) => "mnp",
            OverlayMessage::MasternodeVerify(_) => "mnv",
            OverlayMessage::SyncStatusCount { .. } => "ssc",
            OverlayMessage::GetData(_) => "getdata",
        }
    }
}

/// A failed inbound check, carrying the misbehavior score the peer earns.
/// Score zero means "drop silently" (transient or merely unusable).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProtocolError {
    pub dos: i32,
    pub reason: &'static str,
}

impl ProtocolError {
    pub fn dos(dos: i32, reason: &'static str) -> Self {
        Self { dos, reason }
    }

    pub fn transient(reason: &'static str) -> Self {
        Self { dos: 0, reason }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (dos={})", self.reason, self.dos)
    }
}

/// The `Announce` envelope: a full self-description of a masternode signed
/// by its collateral key.
#[derive(Clone, Debug)]
pub struct MasternodeBroadcast {
    pub outpoint: OutPoint,
    pub addr: NetAddr,
    pub pubkey_collateral: Vec<u8>,
    pub pubkey_masternode: Vec<u8>,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub last_ping: Option<MasternodePing>,
    /// Set locally on re-ingested recovery replies; never serialized.
    pub recovery: bool,
}

impl MasternodeBroadcast {
    pub fn from_record(record: &Masternode) -> Self {
        Self {
            outpoint: record.outpoint,
            addr: record.addr,
            pubkey_collateral: record.pubkey_collateral.clone(),
            pubkey_masternode: record.pubkey_masternode.clone(),
            sig: record.sig.clone(),
            sig_time: record.sig_time,
            protocol_version: record.protocol_version,
            last_ping: record.last_ping.clone(),
            recovery: false,
        }
    }

    pub fn into_record(self) -> Masternode {
        Masternode {
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral,
            pubkey_masternode: self.pubkey_masternode,
            last_ping: self.last_ping,
            sig: self.sig,
            sig_time: self.sig_time,
            last_dsq: 0,
            time_last_checked: 0,
            last_paid_block: 0,
            active_state: MasternodeState::PreEnabled,
            protocol_version: self.protocol_version,
            pose_ban_score: 0,
            allow_mixing_tx: false,
            governance_votes: Default::default(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.outpoint.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.pubkey_collateral);
        encoder.write_i64_le(self.sig_time);
        sha256d(&encoder.into_inner())
    }

    pub fn signature_hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.outpoint.consensus_encode(&mut encoder);
        self.addr.consensus_encode(&mut encoder);
        encoder.write_var_bytes(&self.pubkey_collateral);
        encoder.write_var_bytes(&self.pubkey_masternode);
        encoder.write_i64_le(self.sig_time);
        encoder.write_i32_le(self.protocol_version);
        sha256d(&encoder.into_inner())
    }

    pub fn signature_message(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.sig_time,
            short_key_id(&self.pubkey_collateral),
            short_key_id(&self.pubkey_masternode),
            self.protocol_version
        )
    }

    /// Structural and signature checks that need no registry state.
    pub fn simple_check(
        &self,
        params: &ChainParams,
        signer: &dyn MessageSigner,
        new_sigs: bool,
        adjusted_now: i64,
    ) -> Result<(), ProtocolError> {
        if self.sig_time > adjusted_now + MASTERNODE_FUTURE_SIGTIME_SLACK {
            return Err(ProtocolError::dos(1, "announce signed in the future"));
        }
        if let Some(ping) = &self.last_ping {
            if ping.masternode_outpoint != self.outpoint {
                return Err(ProtocolError::dos(33, "embedded ping for another outpoint"));
            }
            if ping.sig_time > adjusted_now + MASTERNODE_FUTURE_SIGTIME_SLACK {
                return Err(ProtocolError::dos(1, "embedded ping signed in the future"));
            }
        }
        if self.protocol_version < MIN_MASTERNODE_PAYMENT_PROTO {
            return Err(ProtocolError::transient("obsolete protocol version"));
        }
        self.check_addr(params)?;
        self.verify_signature(signer, new_sigs)
    }

    pub fn check_addr(&self, params: &ChainParams) -> Result<(), ProtocolError> {
        if !self.addr.is_routable() {
            return Err(ProtocolError::transient("service address not routable"));
        }
        if params.is_mainnet() {
            if self.addr.port() != params.default_port {
                return Err(ProtocolError::transient("wrong port for mainnet"));
            }
        } else if self.addr.port() == 10_000 {
            return Err(ProtocolError::transient("mainnet port off mainnet"));
        }
        Ok(())
    }

    pub fn verify_signature(
        &self,
        signer: &dyn MessageSigner,
        new_sigs: bool,
    ) -> Result<(), ProtocolError> {
        let verified = if new_sigs {
            signer.verify_hash(&self.signature_hash(), &self.pubkey_collateral, &self.sig)
        } else {
            signer.verify_message(
                &self.signature_message(),
                &self.pubkey_collateral,
                &self.sig,
            )
        };
        verified.map_err(|_| ProtocolError::dos(100, "bad announce signature"))
    }
}

impl Encodable for MasternodeBroadcast {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.outpoint.consensus_encode(encoder);
        self.addr.consensus_encode(encoder);
        encoder.write_var_bytes(&self.pubkey_collateral);
        encoder.write_var_bytes(&self.pubkey_masternode);
        encoder.write_var_bytes(&self.sig);
        encoder.write_i64_le(self.sig_time);
        encoder.write_i32_le(self.protocol_version);
        match &self.last_ping {
            Some(ping) => {
                encoder.write_u8(1);
                ping.consensus_encode(encoder);
            }
            None => encoder.write_u8(0),
        }
    }
}

impl Decodable for MasternodeBroadcast {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let outpoint = OutPoint::consensus_decode(decoder)?;
        let addr = NetAddr::consensus_decode(decoder)?;
        let pubkey_collateral = decoder.read_var_bytes()?;
        let pubkey_masternode = decoder.read_var_bytes()?;
        let sig = decoder.read_var_bytes()?;
        let sig_time = decoder.read_i64_le()?;
        let protocol_version = decoder.read_i32_le()?;
        let last_ping = match decoder.read_u8()? {
            0 => None,
            1 => Some(MasternodePing::consensus_decode(decoder)?),
            _ => return Err(DecodeError::InvalidValue("ping presence flag")),
        };
        Ok(Self {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_masternode,
            sig,
            sig_time,
            protocol_version,
            last_ping,
            recovery: false,
        })
    }
}

/// The three-phase verification envelope. Both signatures empty: a
/// challenge. First present: a direct reply. Both present: a witnessed
/// broadcast naming the verified node and the witness.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasternodeVerification {
    pub addr: NetAddr,
    pub nonce: u64,
    pub block_height: i32,
    pub vch_sig1: Vec<u8>,
    pub vch_sig2: Vec<u8>,
    pub masternode_outpoint1: OutPoint,
    pub masternode_outpoint2: OutPoint,
}

impl MasternodeVerification {
    pub fn new(addr: NetAddr, nonce: u64, block_height: i32) -> Self {
        Self {
            addr,
            nonce,
            block_height,
            vch_sig1: Vec::new(),
            vch_sig2: Vec::new(),
            masternode_outpoint1: OutPoint::null(),
            masternode_outpoint2: OutPoint::null(),
        }
    }

    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.addr.consensus_encode(&mut encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_i32_le(self.block_height);
        sha256d(&encoder.into_inner())
    }

    pub fn signature_hash1(&self, block_hash: &Hash256) -> Hash256 {
        let mut encoder = Encoder::new();
        self.addr.consensus_encode(&mut encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_hash(block_hash);
        sha256d(&encoder.into_inner())
    }

    pub fn signature_hash2(&self, block_hash: &Hash256) -> Hash256 {
        let mut encoder = Encoder::new();
        self.addr.consensus_encode(&mut encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_hash(block_hash);
        self.masternode_outpoint1.consensus_encode(&mut encoder);
        self.masternode_outpoint2.consensus_encode(&mut encoder);
        sha256d(&encoder.into_inner())
    }

    pub fn signature_message1(&self, block_hash: &Hash256) -> String {
        format!("{}{}{}", self.addr, self.nonce, hash256_to_hex(block_hash))
    }

    pub fn signature_message2(&self, block_hash: &Hash256) -> String {
        format!(
            "{}{}{}{}{}",
            self.addr,
            self.nonce,
            hash256_to_hex(block_hash),
            self.masternode_outpoint1.to_string_short(),
            self.masternode_outpoint2.to_string_short()
        )
    }

    pub fn is_challenge(&self) -> bool {
        self.vch_sig1.is_empty() && self.vch_sig2.is_empty()
    }

    pub fn is_reply(&self) -> bool {
        !self.vch_sig1.is_empty() && self.vch_sig2.is_empty()
    }
}

impl Encodable for MasternodeVerification {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.addr.consensus_encode(encoder);
        encoder.write_u64_le(self.nonce);
        encoder.write_i32_le(self.block_height);
        encoder.write_var_bytes(&self.vch_sig1);
        encoder.write_var_bytes(&self.vch_sig2);
        self.masternode_outpoint1.consensus_encode(encoder);
        self.masternode_outpoint2.consensus_encode(encoder);
    }
}

impl Decodable for MasternodeVerification {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            addr: NetAddr::consensus_decode(decoder)?,
            nonce: decoder.read_u64_le()?,
            block_height: decoder.read_i32_le()?,
            vch_sig1: decoder.read_var_bytes()?,
            vch_sig2: decoder.read_var_bytes()?,
            masternode_outpoint1: OutPoint::consensus_decode(decoder)?,
            masternode_outpoint2: OutPoint::consensus_decode(decoder)?,
        })
    }
}

/// Legacy key fingerprint used inside string-canonicalized signatures.
fn short_key_id(pubkey: &[u8]) -> String {
    let digest = sha256d(pubkey);
    hash256_to_hex(&digest)[..16].to_string()
}
