//! Masternode records and their liveness state machine.

use std::collections::BTreeSet;

use primitive_types::U256;
use zocd_consensus::constants::{
    MASTERNODE_CHECK_SECONDS, MASTERNODE_EXPIRATION_SECONDS, MASTERNODE_MIN_MNP_SECONDS,
    MASTERNODE_NEW_START_REQUIRED_SECONDS, MASTERNODE_POSE_BAN_MAX_SCORE,
};
use zocd_consensus::Hash256;
use zocd_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use zocd_primitives::hash::sha256d;
use zocd_primitives::{NetAddr, OutPoint};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MasternodeState {
    PreEnabled,
    Enabled,
    Expired,
    SentinelPingExpired,
    NewStartRequired,
    OutpointSpent,
    PoSeBanned,
    UpdateRequired,
}

impl MasternodeState {
    pub fn as_str(self) -> &'static str {
        match self {
            MasternodeState::PreEnabled => "PRE_ENABLED",
            MasternodeState::Enabled => "ENABLED",
            MasternodeState::Expired => "EXPIRED",
            MasternodeState::SentinelPingExpired => "SENTINEL_PING_EXPIRED",
            MasternodeState::NewStartRequired => "NEW_START_REQUIRED",
            MasternodeState::OutpointSpent => "OUTPOINT_SPENT",
            MasternodeState::PoSeBanned => "POSE_BANNED",
            MasternodeState::UpdateRequired => "UPDATE_REQUIRED",
        }
    }

    fn to_wire(self) -> u8 {
        match self {
            MasternodeState::PreEnabled => 0,
            MasternodeState::Enabled => 1,
            MasternodeState::Expired => 2,
            MasternodeState::SentinelPingExpired => 3,
            MasternodeState::NewStartRequired => 4,
            MasternodeState::OutpointSpent => 5,
            MasternodeState::PoSeBanned => 6,
            MasternodeState::UpdateRequired => 7,
        }
    }

    fn from_wire(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => MasternodeState::PreEnabled,
            1 => MasternodeState::Enabled,
            2 => MasternodeState::Expired,
            3 => MasternodeState::SentinelPingExpired,
            4 => MasternodeState::NewStartRequired,
            5 => MasternodeState::OutpointSpent,
            6 => MasternodeState::PoSeBanned,
            7 => MasternodeState::UpdateRequired,
            _ => return Err(DecodeError::InvalidValue("masternode state")),
        })
    }

    /// States a recovered announce may legitimately restart from.
    pub fn valid_for_auto_start(self) -> bool {
        matches!(
            self,
            MasternodeState::Enabled
                | MasternodeState::PreEnabled
                | MasternodeState::Expired
                | MasternodeState::SentinelPingExpired
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MasternodePing {
    pub masternode_outpoint: OutPoint,
    /// A recent block hash, proving the sender follows the active chain.
    pub block_hash: Hash256,
    pub sig_time: i64,
    pub sig: Vec<u8>,
    pub sentinel_is_current: bool,
    pub sentinel_version: u32,
    pub daemon_version: i64,
}

impl MasternodePing {
    pub fn hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.masternode_outpoint.consensus_encode(&mut encoder);
        encoder.write_i64_le(self.sig_time);
        sha256d(&encoder.into_inner())
    }

    /// Digest signed under the "new sigs" scheme.
    pub fn signature_hash(&self) -> Hash256 {
        let mut encoder = Encoder::new();
        self.masternode_outpoint.consensus_encode(&mut encoder);
        encoder.write_hash(&self.block_hash);
        encoder.write_i64_le(self.sig_time);
        encoder.write_bool(self.sentinel_is_current);
        encoder.write_u32_le(self.sentinel_version);
        encoder.write_i64_le(self.daemon_version);
        sha256d(&encoder.into_inner())
    }

    /// String form signed under the legacy scheme.
    pub fn signature_message(&self) -> String {
        format!(
            "{}{}{}",
            self.masternode_outpoint.to_string_short(),
            zocd_consensus::hash256_to_hex(&self.block_hash),
            self.sig_time
        )
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now - self.sig_time > MASTERNODE_NEW_START_REQUIRED_SECONDS
    }
}

impl Encodable for MasternodePing {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.masternode_outpoint.consensus_encode(encoder);
        encoder.write_hash(&self.block_hash);
        encoder.write_i64_le(self.sig_time);
        encoder.write_var_bytes(&self.sig);
        encoder.write_bool(self.sentinel_is_current);
        encoder.write_u32_le(self.sentinel_version);
        encoder.write_i64_le(self.daemon_version);
    }
}

impl Decodable for MasternodePing {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        Ok(Self {
            masternode_outpoint: OutPoint::consensus_decode(decoder)?,
            block_hash: decoder.read_hash()?,
            sig_time: decoder.read_i64_le()?,
            sig: decoder.read_var_bytes()?,
            sentinel_is_current: decoder.read_bool()?,
            sentinel_version: decoder.read_u32_le()?,
            daemon_version: decoder.read_i64_le()?,
        })
    }
}

/// Chain- and clock-derived facts a state re-evaluation needs, gathered
/// before the registry lock is taken.
#[derive(Clone, Debug)]
pub struct CheckContext {
    pub now: i64,
    pub spent: bool,
    pub sentinel_active: bool,
    pub min_payments_proto: i32,
    /// Operator key of the local active masternode, empty when none.
    pub local_pubkey: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Masternode {
    pub outpoint: OutPoint,
    pub addr: NetAddr,
    pub pubkey_collateral: Vec<u8>,
    pub pubkey_masternode: Vec<u8>,
    pub last_ping: Option<MasternodePing>,
    pub sig: Vec<u8>,
    pub sig_time: i64,
    pub last_dsq: i64,
    pub time_last_checked: i64,
    pub last_paid_block: i32,
    pub active_state: MasternodeState,
    pub protocol_version: i32,
    pub pose_ban_score: i32,
    pub allow_mixing_tx: bool,
    pub governance_votes: BTreeSet<Hash256>,
}

impl Masternode {
    pub fn is_enabled(&self) -> bool {
        self.active_state == MasternodeState::Enabled
    }

    pub fn is_pre_enabled(&self) -> bool {
        self.active_state == MasternodeState::PreEnabled
    }

    pub fn is_pose_banned(&self) -> bool {
        self.active_state == MasternodeState::PoSeBanned
    }

    pub fn is_new_start_required(&self) -> bool {
        self.active_state == MasternodeState::NewStartRequired
    }

    pub fn is_update_required(&self) -> bool {
        self.active_state == MasternodeState::UpdateRequired
    }

    pub fn is_outpoint_spent(&self) -> bool {
        self.active_state == MasternodeState::OutpointSpent
    }

    pub fn is_expired(&self) -> bool {
        self.active_state == MasternodeState::Expired
    }

    pub fn is_sentinel_ping_expired(&self) -> bool {
        self.active_state == MasternodeState::SentinelPingExpired
    }

    /// Terminal states are swept out by housekeeping.
    pub fn is_terminal(&self) -> bool {
        self.is_outpoint_spent() || self.is_update_required() || self.is_pose_banned()
    }

    /// A fully verified node sits at the negative score floor.
    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -MASTERNODE_POSE_BAN_MAX_SCORE
    }

    pub fn is_valid_for_payment(&self) -> bool {
        self.is_enabled() || self.is_sentinel_ping_expired()
    }

    pub fn increase_pose_ban_score(&mut self) {
        if self.pose_ban_score < MASTERNODE_POSE_BAN_MAX_SCORE {
            self.pose_ban_score += 1;
        }
    }

    pub fn decrease_pose_ban_score(&mut self) {
        if self.pose_ban_score > -MASTERNODE_POSE_BAN_MAX_SCORE {
            self.pose_ban_score -= 1;
        }
    }

    pub fn pose_ban(&mut self) {
        self.pose_ban_score = MASTERNODE_POSE_BAN_MAX_SCORE;
        self.active_state = MasternodeState::PoSeBanned;
    }

    pub fn is_pinged_within(&self, seconds: i64, at: i64) -> bool {
        match &self.last_ping {
            Some(ping) => at - ping.sig_time < seconds,
            None => false,
        }
    }

    pub fn last_ping_time(&self) -> i64 {
        self.last_ping.as_ref().map(|ping| ping.sig_time).unwrap_or(0)
    }

    pub fn add_governance_vote(&mut self, hash: Hash256) {
        self.governance_votes.insert(hash);
    }

    pub fn remove_governance_object(&mut self, hash: &Hash256) {
        self.governance_votes.remove(hash);
    }

    /// Re-evaluate the liveness state. Internally rate limited; `force`
    /// bypasses the limit after a fresh ping or an explicit request.
    pub fn check(&mut self, ctx: &CheckContext, force: bool) {
        if !force && ctx.now - self.time_last_checked < MASTERNODE_CHECK_SECONDS {
            return;
        }
        self.time_last_checked = ctx.now;

        if self.is_outpoint_spent() {
            return;
        }
        if ctx.spent {
            self.active_state = MasternodeState::OutpointSpent;
            return;
        }

        if self.is_pose_banned() {
            return;
        }
        if self.pose_ban_score >= MASTERNODE_POSE_BAN_MAX_SCORE {
            self.active_state = MasternodeState::PoSeBanned;
            return;
        }

        if self.protocol_version < ctx.min_payments_proto {
            self.active_state = MasternodeState::UpdateRequired;
            return;
        }

        // our own record refreshes itself locally; the ping ladder only
        // applies to everyone else
        let ours = !ctx.local_pubkey.is_empty() && self.pubkey_masternode == ctx.local_pubkey;
        if !ours {
            if !self.is_pinged_within(MASTERNODE_NEW_START_REQUIRED_SECONDS, ctx.now) {
                self.active_state = MasternodeState::NewStartRequired;
                return;
            }
            if !self.is_pinged_within(MASTERNODE_EXPIRATION_SECONDS, ctx.now) {
                self.active_state = MasternodeState::Expired;
                return;
            }
            if !ctx.sentinel_active {
                self.active_state = MasternodeState::SentinelPingExpired;
                return;
            }
            if self.last_ping_time() - self.sig_time < MASTERNODE_MIN_MNP_SECONDS {
                self.active_state = MasternodeState::PreEnabled;
                return;
            }
        }

        self.active_state = MasternodeState::Enabled;
    }

    /// Consensus-anchored 256-bit score of this record against a block hash.
    /// Distinct outpoints collide only with negligible probability; callers
    /// break remaining ties by outpoint order.
    pub fn calculate_score(&self, block_hash: &Hash256) -> U256 {
        score_for(&self.outpoint, block_hash)
    }

    pub fn get_info(&self) -> MasternodeInfo {
        MasternodeInfo {
            outpoint: self.outpoint,
            addr: self.addr,
            pubkey_collateral: self.pubkey_collateral.clone(),
            pubkey_masternode: self.pubkey_masternode.clone(),
            sig_time: self.sig_time,
            protocol_version: self.protocol_version,
            active_state: self.active_state,
            pose_ban_score: self.pose_ban_score,
            last_ping_time: self.last_ping_time(),
            last_paid_block: self.last_paid_block,
        }
    }
}

pub fn score_for(outpoint: &OutPoint, block_hash: &Hash256) -> U256 {
    let mut encoder = Encoder::new();
    outpoint.consensus_encode(&mut encoder);
    encoder.write_hash(block_hash);
    U256::from_big_endian(&sha256d(&encoder.into_inner()))
}

impl Encodable for Masternode {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        self.outpoint.consensus_encode(encoder);
        self.addr.consensus_encode(encoder);
        encoder.write_var_bytes(&self.pubkey_collateral);
        encoder.write_var_bytes(&self.pubkey_masternode);
        match &self.last_ping {
            Some(ping) => {
                encoder.write_u8(1);
                ping.consensus_encode(encoder);
            }
            None => encoder.write_u8(0),
        }
        encoder.write_var_bytes(&self.sig);
        encoder.write_i64_le(self.sig_time);
        encoder.write_i64_le(self.last_dsq);
        encoder.write_i64_le(self.time_last_checked);
        encoder.write_i32_le(self.last_paid_block);
        encoder.write_u8(self.active_state.to_wire());
        encoder.write_i32_le(self.protocol_version);
        encoder.write_i32_le(self.pose_ban_score);
        encoder.write_bool(self.allow_mixing_tx);
        encoder.write_varint(self.governance_votes.len() as u64);
        for hash in &self.governance_votes {
            encoder.write_hash(hash);
        }
    }
}

impl Decodable for Masternode {
    fn consensus_decode(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let outpoint = OutPoint::consensus_decode(decoder)?;
        let addr = NetAddr::consensus_decode(decoder)?;
        let pubkey_collateral = decoder.read_var_bytes()?;
        let pubkey_masternode = decoder.read_var_bytes()?;
        let last_ping = match decoder.read_u8()? {
            0 => None,
            1 => Some(MasternodePing::consensus_decode(decoder)?),
            _ => return Err(DecodeError::InvalidValue("ping presence flag")),
        };
        let sig = decoder.read_var_bytes()?;
        let sig_time = decoder.read_i64_le()?;
        let last_dsq = decoder.read_i64_le()?;
        let time_last_checked = decoder.read_i64_le()?;
        let last_paid_block = decoder.read_i32_le()?;
        let active_state = MasternodeState::from_wire(decoder.read_u8()?)?;
        let protocol_version = decoder.read_i32_le()?;
        let pose_ban_score = decoder.read_i32_le()?;
        let allow_mixing_tx = decoder.read_bool()?;
        let vote_count = decoder.read_varint()?;
        let mut governance_votes = BTreeSet::new();
        for _ in 0..vote_count {
            governance_votes.insert(decoder.read_hash()?);
        }
        Ok(Self {
            outpoint,
            addr,
            pubkey_collateral,
            pubkey_masternode,
            last_ping,
            sig,
            sig_time,
            last_dsq,
            time_last_checked,
            last_paid_block,
            active_state,
            protocol_version,
            pose_ban_score,
            allow_mixing_tx,
            governance_votes,
        })
    }
}

#[derive(Clone, Debug)]
pub struct MasternodeInfo {
    pub outpoint: OutPoint,
    pub addr: NetAddr,
    pub pubkey_collateral: Vec<u8>,
    pub pubkey_masternode: Vec<u8>,
    pub sig_time: i64,
    pub protocol_version: i32,
    pub active_state: MasternodeState,
    pub pose_ban_score: i32,
    pub last_ping_time: i64,
    pub last_paid_block: i32,
}

impl MasternodeInfo {
    pub fn is_enabled(&self) -> bool {
        self.active_state == MasternodeState::Enabled
    }

    pub fn is_pose_verified(&self) -> bool {
        self.pose_ban_score <= -MASTERNODE_POSE_BAN_MAX_SCORE
    }

    pub fn is_pose_banned(&self) -> bool {
        self.active_state == MasternodeState::PoSeBanned
    }

    /// The payee this record is paid to, identified by its collateral key.
    pub fn payee(&self) -> &[u8] {
        &self.pubkey_collateral
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use zocd_consensus::constants::MIN_MASTERNODE_PAYMENT_PROTO;

    fn sample_record(now: i64) -> Masternode {
        let outpoint = OutPoint::new([0x42; 32], 0);
        Masternode {
            outpoint,
            addr: NetAddr::new(IpAddr::V4(Ipv4Addr::new(198, 51, 100, 7)), 10_000),
            pubkey_collateral: vec![0x02; 33],
            pubkey_masternode: vec![0x03; 33],
            last_ping: Some(MasternodePing {
                masternode_outpoint: outpoint,
                block_hash: [0x11; 32],
                sig_time: now - 60,
                sig: Vec::new(),
                sentinel_is_current: true,
                sentinel_version: 1,
                daemon_version: 1,
            }),
            sig: Vec::new(),
            sig_time: now - 2 * MASTERNODE_MIN_MNP_SECONDS,
            last_dsq: 0,
            time_last_checked: 0,
            last_paid_block: 0,
            active_state: MasternodeState::PreEnabled,
            protocol_version: MIN_MASTERNODE_PAYMENT_PROTO,
            pose_ban_score: 0,
            allow_mixing_tx: false,
            governance_votes: BTreeSet::new(),
        }
    }

    fn ctx(now: i64) -> CheckContext {
        CheckContext {
            now,
            spent: false,
            sentinel_active: true,
            min_payments_proto: MIN_MASTERNODE_PAYMENT_PROTO,
            local_pubkey: Vec::new(),
        }
    }

    #[test]
    fn fresh_ping_enables_record() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);
        mn.check(&ctx(now), true);
        assert_eq!(mn.active_state, MasternodeState::Enabled);
    }

    #[test]
    fn stale_ping_walks_down_the_ladder() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);

        let ping = mn.last_ping.as_mut().expect("ping");
        ping.sig_time = now - MASTERNODE_EXPIRATION_SECONDS - 1;
        mn.check(&ctx(now), true);
        assert_eq!(mn.active_state, MasternodeState::Expired);

        let ping = mn.last_ping.as_mut().expect("ping");
        ping.sig_time = now - MASTERNODE_NEW_START_REQUIRED_SECONDS - 1;
        mn.check(&ctx(now), true);
        assert_eq!(mn.active_state, MasternodeState::NewStartRequired);
    }

    #[test]
    fn spent_outpoint_is_terminal() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);
        let mut context = ctx(now);
        context.spent = true;
        mn.check(&context, true);
        assert!(mn.is_outpoint_spent());
        assert!(mn.is_terminal());

        // later checks never resurrect it
        context.spent = false;
        mn.check(&context, true);
        assert!(mn.is_outpoint_spent());
    }

    #[test]
    fn ban_score_is_clamped_and_bans_at_max() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);
        for _ in 0..MASTERNODE_POSE_BAN_MAX_SCORE + 3 {
            mn.increase_pose_ban_score();
        }
        assert_eq!(mn.pose_ban_score, MASTERNODE_POSE_BAN_MAX_SCORE);
        mn.check(&ctx(now), true);
        assert!(mn.is_pose_banned());

        for _ in 0..3 * MASTERNODE_POSE_BAN_MAX_SCORE {
            mn.decrease_pose_ban_score();
        }
        assert_eq!(mn.pose_ban_score, -MASTERNODE_POSE_BAN_MAX_SCORE);
        assert!(mn.is_pose_verified());
    }

    #[test]
    fn check_is_rate_limited() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);
        mn.check(&ctx(now), true);
        assert_eq!(mn.active_state, MasternodeState::Enabled);

        // an immediate non-forced check is a no-op even if facts changed
        let mut context = ctx(now + 1);
        context.spent = true;
        mn.check(&context, false);
        assert_eq!(mn.active_state, MasternodeState::Enabled);

        mn.check(&context, true);
        assert!(mn.is_outpoint_spent());
    }

    #[test]
    fn score_depends_on_block_hash_only() {
        let now = 1_700_000_000;
        let mn = sample_record(now);
        let a = mn.calculate_score(&[0x01; 32]);
        let b = mn.calculate_score(&[0x02; 32]);
        assert_ne!(a, b);
        assert_eq!(a, mn.calculate_score(&[0x01; 32]));
    }

    #[test]
    fn record_round_trips_through_encoding() {
        let now = 1_700_000_000;
        let mut mn = sample_record(now);
        mn.governance_votes.insert([0xaa; 32]);
        mn.governance_votes.insert([0xbb; 32]);
        let decoded = Masternode::decode_all(&mn.encode_to_vec()).expect("decode");
        assert_eq!(decoded.outpoint, mn.outpoint);
        assert_eq!(decoded.addr, mn.addr);
        assert_eq!(decoded.last_ping, mn.last_ping);
        assert_eq!(decoded.governance_votes, mn.governance_votes);
        assert_eq!(decoded.active_state, mn.active_state);
    }
}
