//! Masternode protocol constants shared across gossip, verification and
//! housekeeping.

/// Current network protocol version for P2P messages.
pub const PROTOCOL_VERSION: i32 = 70_208;
/// Oldest protocol version a masternode may advertise and still be paid.
pub const MIN_MASTERNODE_PAYMENT_PROTO: i32 = 70_206;
/// Oldest protocol version eligible for proof-of-service verification.
pub const MIN_POSE_PROTO_VERSION: i32 = 70_206;
/// Numeric daemon version of this build, compared against peer pings for the
/// update warning.
pub const CLIENT_DAEMON_VERSION: i64 = 1_020_000;

/// Window during which a peer must not repeat a full-list request, and during
/// which we will not re-ask a peer for the same entry.
pub const DSEG_UPDATE_SECONDS: i64 = 10 * 60;

/// Per-record state machine re-evaluation is rate limited to this interval.
pub const MASTERNODE_CHECK_SECONDS: i64 = 5;
/// Minimum age of a broadcast before a replacement is accepted.
pub const MASTERNODE_MIN_MNB_SECONDS: i64 = 5 * 60;
/// Expected ping cadence; records pinging faster are left untouched.
pub const MASTERNODE_MIN_MNP_SECONDS: i64 = 10 * 60;
/// A record with no accepted ping for this long becomes Expired.
pub const MASTERNODE_EXPIRATION_SECONDS: i64 = 65 * 60;
/// A record with no accepted ping for this long needs a fresh announce.
pub const MASTERNODE_NEW_START_REQUIRED_SECONDS: i64 = 180 * 60;
/// Maximum age of the last sentinel beacon for the sentinel to count as live.
pub const MASTERNODE_SENTINEL_PING_MAX_SECONDS: i64 = 120 * 60;
/// Accepted ping block hashes must be within this many blocks of the tip.
pub const MASTERNODE_PING_BLOCK_DEPTH: i32 = 24;
/// Announce timestamps may run at most this far ahead of adjusted time.
pub const MASTERNODE_FUTURE_SIGTIME_SLACK: i64 = 60 * 60;

/// Ban score ceiling; reaching it transitions a record to PoSeBanned.
pub const MASTERNODE_POSE_BAN_MAX_SCORE: i32 = 5;
/// Only nodes ranked at or above this may initiate verification.
pub const MAX_POSE_RANK: i32 = 10;
/// Verification messages older than this many blocks are discarded.
pub const MAX_POSE_BLOCKS: i32 = 10;
/// Upper bound on outbound verification challenges per round.
pub const MAX_POSE_CONNECTIONS: usize = 10;
/// Pending announce fetches and verification sends are abandoned after this.
pub const PENDING_REQUEST_TIMEOUT_SECONDS: i64 = 15;

/// Peers asked per announce-recovery round.
pub const MNB_RECOVERY_QUORUM_TOTAL: usize = 10;
/// Matching replies required before a recovered announce is re-ingested.
pub const MNB_RECOVERY_QUORUM_REQUIRED: usize = 6;
/// Recovery rounds started per housekeeping pass.
pub const MNB_RECOVERY_MAX_ASK_ENTRIES: usize = 10;
/// How long replies are collected before a recovery round is settled.
pub const MNB_RECOVERY_WAIT_SECONDS: i64 = 60;
/// Settled recovery requests are forgotten after this, allowing a retry.
pub const MNB_RECOVERY_RETRY_SECONDS: i64 = 3 * 60 * 60;

/// Blocks scanned per last-paid update, before the payments storage cap.
pub const LAST_PAID_SCAN_BLOCKS: i32 = 100;
/// Blocks ahead of the tip the payments module schedules payees for.
pub const PAYMENT_SCHEDULE_LOOKAHEAD: i32 = 8;

/// Misbehavior score for repeating a full-list request inside its window.
pub const MISBEHAVIOR_DSEG_SPAM: i32 = 34;
/// Misbehavior score for verification reply spam or unsolicited replies.
pub const MISBEHAVIOR_VERIFY_SPAM: i32 = 2;
/// Misbehavior score for a nonce or height mismatch in a verification reply.
pub const MISBEHAVIOR_VERIFY_MISMATCH: i32 = 20;
/// Misbehavior score when no record's key verifies a reply signature.
pub const MISBEHAVIOR_VERIFY_FAKE: i32 = 40;
/// Misbehavior score for a self-verifying broadcast (same outpoint twice).
pub const MISBEHAVIOR_VERIFY_SELF: i32 = 100;
/// Misbehavior score for peers that stay unreachable during verification.
pub const MISBEHAVIOR_UNREACHABLE: i32 = 20;
