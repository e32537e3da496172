//! Periodic maintenance loops.
//!
//! One task pumps the pending request queues every second, one runs the
//! housekeeping sweep once a minute, and a watch channel carries block-tip
//! advances from the chain listener. All intervals come from the config.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::manager::MasternodeManager;
use crate::ports::ConnectionManager;

pub async fn masternode_maintenance_loop(
    manager: Arc<MasternodeManager>,
    connman: Arc<dyn ConnectionManager>,
    mut tip_rx: watch::Receiver<i32>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), String> {
    let config = manager.config.clone();
    let mut pump = tokio::time::interval(Duration::from_secs(
        config.pending_pump_interval_secs.max(1),
    ));
    let mut housekeeping = tokio::time::interval(Duration::from_secs(
        config.housekeeping_interval_secs.max(1),
    ));
    let mut verification = tokio::time::interval(Duration::from_secs(
        config.verification_interval_secs.max(1),
    ));

    loop {
        tokio::select! {
            _ = pump.tick() => {
                manager.process_pending_mnb_requests(connman.as_ref());
                manager.process_pending_mnv_requests(connman.as_ref());
            }
            _ = housekeeping.tick() => {
                manager.check_and_remove(connman.as_ref());
                manager.warn_masternode_daemon_updates();
                manager.process_masternode_connections(connman.as_ref());
            }
            _ = verification.tick() => {
                manager.do_full_verification_step(connman.as_ref());
                manager.check_missing_masternodes();
            }
            changed = tip_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let height = *tip_rx.borrow_and_update();
                manager.updated_block_tip(height);
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use zocd_consensus::params::{chain_params, Network};
    use zocd_consensus::Hash256;
    use zocd_primitives::{NetAddr, OutPoint};

    use crate::config::ManagerConfig;
    use crate::messages::Inventory;
    use crate::ports::*;
    use crate::record::MasternodeInfo;
    use crate::signer::SignError;

    struct StaticChain;

    impl ChainView for StaticChain {
        fn tip_height(&self) -> i32 {
            100
        }
        fn block_hash(&self, _height: i32) -> Option<Hash256> {
            Some([0x55; 32])
        }
        fn block_height(&self, _hash: &Hash256) -> Option<i32> {
            Some(100)
        }
        fn utxo_confirmations(&self, _outpoint: &OutPoint) -> Option<i32> {
            Some(100)
        }
    }

    struct NotSynced;

    impl SyncTracker for NotSynced {
        fn is_blockchain_synced(&self) -> bool {
            false
        }
        fn is_masternode_list_synced(&self) -> bool {
            false
        }
        fn is_winners_list_synced(&self) -> bool {
            false
        }
        fn is_synced(&self) -> bool {
            false
        }
        fn bump_asset_last_time(&self, _tag: &str) {}
    }

    struct NoPayments;

    impl PaymentSchedule for NoPayments {
        fn min_payments_proto(&self) -> i32 {
            0
        }
        fn is_scheduled(&self, _info: &MasternodeInfo, _height: i32) -> bool {
            false
        }
        fn storage_limit(&self) -> i32 {
            5000
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

    struct NoHealth;

    impl HealthMonitor for NoHealth {
        fn reachability(&self, _addr: &NetAddr) -> Option<ReachabilityClass> {
            None
        }
        fn consume(&self, _addr: &NetAddr) {}
        fn probe(&self, _addr: &NetAddr) -> bool {
            false
        }
    }

    struct NoAlerts;

    impl AlertSink for NoAlerts {
        fn notify(&self, _message: &str) {}
    }

    struct NoMisbehavior;

    impl MisbehaviorSink for NoMisbehavior {
        fn misbehaving(&self, _peer: PeerId, _score: i32) {}
    }

    #[derive(Default)]
    struct IdleConnman {
        pending: Mutex<Vec<NetAddr>>,
    }

    impl ConnectionManager for IdleConnman {
        fn for_each_node(&self, _visit: &mut dyn FnMut(&dyn PeerHandle)) {}
        fn for_node(&self, _addr: &NetAddr, _visit: &mut dyn FnMut(&dyn PeerHandle)) -> bool {
            false
        }
        fn find_node(&self, _addr: &NetAddr) -> Option<PeerId> {
            None
        }
        fn add_pending_masternode(&self, addr: &NetAddr) {
            if let Ok(mut pending) = self.pending.lock() {
                pending.push(*addr);
            }
        }
        fn is_masternode_or_disconnect_requested(&self, _addr: &NetAddr) -> bool {
            false
        }
        fn add_new_address(&self, _addr: &NetAddr, _from: &NetAddr) {}
        fn relay_inv(&self, _inv: Inventory) {}
    }

    struct FixedTime;

    impl TimeSource for FixedTime {
        fn now(&self) -> i64 {
            1_700_000_000
        }
    }

    struct NoopSigner;

    impl MessageSigner for NoopSigner {
        fn sign_hash(&self, _hash: &Hash256, _key: &[u8]) -> Result<Vec<u8>, SignError> {
            Err(SignError::InvalidKey)
        }
        fn verify_hash(
            &self,
            _hash: &Hash256,
            _pubkey: &[u8],
            _sig: &[u8],
        ) -> Result<(), SignError> {
            Err(SignError::VerifyFailed)
        }
        fn sign_message(&self, _message: &str, _key: &[u8]) -> Result<Vec<u8>, SignError> {
            Err(SignError::InvalidKey)
        }
        fn verify_message(
            &self,
            _message: &str,
            _pubkey: &[u8],
            _sig: &[u8],
        ) -> Result<(), SignError> {
            Err(SignError::VerifyFailed)
        }
    }

    fn idle_manager() -> Arc<MasternodeManager> {
        let collab = Collaborators {
            chain: Arc::new(StaticChain),
            sync: Arc::new(NotSynced),
            signer: Arc::new(NoopSigner),
            payments: Arc::new(NoPayments),
            governance: Arc::new(NoGovernance),
            active: Arc::new(NoActiveNode),
            health: Arc::new(NoHealth),
            alerts: Arc::new(NoAlerts),
            misbehavior: Arc::new(NoMisbehavior),
            time: Arc::new(FixedTime),
        };
        Arc::new(MasternodeManager::new(
            Arc::new(chain_params(Network::Regtest)),
            ManagerConfig::default(),
            collab,
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn loop_applies_tip_updates_and_shuts_down() {
        let manager = idle_manager();
        let connman: Arc<dyn ConnectionManager> = Arc::new(IdleConnman::default());
        let (tip_tx, tip_rx) = watch::channel(0i32);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(masternode_maintenance_loop(
            Arc::clone(&manager),
            connman,
            tip_rx,
            shutdown_rx,
        ));

        tip_tx.send(7).expect("tip update");
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(manager.cached_block_height(), 7);

        shutdown_tx.send(true).expect("shutdown");
        let result = handle.await.expect("join");
        assert!(result.is_ok());
    }
}
