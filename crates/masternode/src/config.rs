//! Runtime configuration for the manager, loadable from a versioned JSON
//! file alongside the datadir.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Select the digest-based signature scheme instead of the legacy
    /// string-canonicalized one. Must match the network's active flag.
    pub new_sigs: bool,
    /// Whether this node can probe IPv4 service addresses.
    pub probe_ipv4: bool,
    /// Whether this node can probe IPv6 service addresses.
    pub probe_ipv6: bool,
    /// Fixed-peer mode: suppress announce-recovery connections.
    pub connect_only: bool,
    /// Skip re-challenging an address whose request window is still open.
    pub strict_reverify: bool,
    /// Seconds between pending-request pump runs.
    pub pending_pump_interval_secs: u64,
    /// Seconds between housekeeping passes.
    pub housekeeping_interval_secs: u64,
    /// Seconds between outbound verification rounds.
    pub verification_interval_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            new_sigs: true,
            probe_ipv4: true,
            probe_ipv6: false,
            connect_only: false,
            strict_reverify: false,
            pending_pump_interval_secs: 1,
            housekeeping_interval_secs: 60,
            verification_interval_secs: 60,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct ConfigFileV1 {
    version: u32,
    config: ManagerConfig,
}

pub fn load_config(path: &Path) -> Result<ManagerConfig, String> {
    let bytes = fs::read(path).map_err(|err| format!("failed to read config: {err}"))?;
    let value: serde_json::Value =
        serde_json::from_slice(&bytes).map_err(|err| format!("invalid config file: {err}"))?;
    let version = value.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
    match version {
        1 => {
            let file: ConfigFileV1 = serde_json::from_value(value)
                .map_err(|err| format!("invalid v1 config: {err}"))?;
            Ok(file.config)
        }
        other => Err(format!("unsupported config version {other}")),
    }
}

pub fn save_config(path: &Path, config: &ManagerConfig) -> Result<(), String> {
    let file = ConfigFileV1 {
        version: 1,
        config: config.clone(),
    };
    let json = serde_json::to_vec_pretty(&file).map_err(|err| err.to_string())?;
    fs::write(path, json).map_err(|err| format!("failed to write config: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_round_trips() {
        let dir = std::env::temp_dir().join(format!("zocd-config-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("masternode.json");

        let mut config = ManagerConfig::default();
        config.strict_reverify = true;
        config.probe_ipv6 = true;
        save_config(&path, &config).expect("save");

        let loaded = load_config(&path).expect("load");
        assert!(loaded.strict_reverify);
        assert!(loaded.probe_ipv6);
        assert_eq!(
            loaded.housekeeping_interval_secs,
            config.housekeeping_interval_secs
        );

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_version_is_refused() {
        let dir = std::env::temp_dir().join(format!("zocd-config-bad-{}", std::process::id()));
        fs::create_dir_all(&dir).expect("tempdir");
        let path = dir.join("masternode.json");
        fs::write(&path, br#"{"version": 9, "config": {}}"#).expect("write");
        assert!(load_config(&path).is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
