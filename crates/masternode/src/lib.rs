//! Masternode registry, gossip and proof-of-service verification.
//!
//! The manager keeps the local view of the masternode set, paces gossip
//! requests per peer, runs the three-phase verification challenge, selects
//! payees deterministically and prunes itself on a housekeeping tick. All
//! chain, network, signing and governance capabilities are injected through
//! the traits in [`ports`].

pub mod config;
pub mod manager;
pub mod messages;
pub mod pacing;
pub mod ports;
pub mod record;
pub mod scheduler;
pub mod signer;
pub mod snapshot;
pub mod verification;

pub use config::ManagerConfig;
pub use manager::MasternodeManager;
pub use messages::{Inventory, MasternodeBroadcast, MasternodeVerification, OverlayMessage};
pub use record::{Masternode, MasternodeInfo, MasternodePing, MasternodeState};
