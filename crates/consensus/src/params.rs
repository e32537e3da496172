//! Per-network chain parameters consumed by the masternode subsystem.

use std::fmt;

/// One unit of currency in its smallest denomination.
pub const COIN: i64 = 100_000_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Main,
    Test,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Main => "main",
            Network::Test => "test",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    /// The P2P port masternodes must advertise on this network.
    pub default_port: u16,
    /// Whether several masternodes may share one host on distinct ports.
    /// When false, pacing keys squash the port.
    pub allow_multiple_ports: bool,
    /// Collateral confirmations required before an announce is accepted.
    pub masternode_min_confirmations: i32,
    /// Value of the collateral output backing a masternode.
    pub masternode_collateral: i64,
}

impl ChainParams {
    pub fn is_mainnet(&self) -> bool {
        self.network == Network::Main
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Main => ChainParams {
            network,
            default_port: 10_000,
            allow_multiple_ports: false,
            masternode_min_confirmations: 15,
            masternode_collateral: 1_000 * COIN,
        },
        Network::Test => ChainParams {
            network,
            default_port: 10_002,
            allow_multiple_ports: false,
            masternode_min_confirmations: 1,
            masternode_collateral: 1_000 * COIN,
        },
        Network::Regtest => ChainParams {
            network,
            default_port: 10_010,
            allow_multiple_ports: true,
            masternode_min_confirmations: 1,
            masternode_collateral: 1_000 * COIN,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_forbids_shared_hosts() {
        assert!(!chain_params(Network::Main).allow_multiple_ports);
        assert!(chain_params(Network::Regtest).allow_multiple_ports);
    }

    #[test]
    fn ports_are_distinct_per_network() {
        let main = chain_params(Network::Main).default_port;
        let test = chain_params(Network::Test).default_port;
        let reg = chain_params(Network::Regtest).default_port;
        assert!(main != test && test != reg && main != reg);
    }
}
