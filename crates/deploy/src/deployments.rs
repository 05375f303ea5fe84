//! Read side of the deployment results written by the contracts package.
//!
//! The deployment task keeps two JSON lists under `<contracts>/deployments`:
//! `rollup_contracts.json` (proxy addresses per `(L1ChainId, L2ChainId)`) and
//! `l2_genesis.json` (the genesis document per pair).

use std::path::PathBuf;

use alloy_core::primitives::Address;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{RollupError, RollupResult};

pub const ROLLUP_CONTRACTS_FILE: &str = "rollup_contracts.json";
pub const L2_GENESIS_FILE: &str = "l2_genesis.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct L1Proxies {
    pub address_manager: Address,
    #[serde(rename = "L1Rollup")]
    pub l1_rollup: Address,
    pub cross_chain_channel: Address,
    #[serde(rename = "L1Escrow")]
    pub l1_escrow: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct L2Proxies {
    pub address_manager: Address,
    #[serde(rename = "L2Rollup")]
    pub l2_rollup: Address,
    pub cross_chain_channel: Address,
    #[serde(rename = "L2Escrow")]
    pub l2_escrow: Address,
}

/// One entry of `rollup_contracts.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupContracts {
    #[serde(rename = "L1ChainId")]
    pub l1_chain_id: u64,
    #[serde(rename = "L2ChainId")]
    pub l2_chain_id: u64,
    #[serde(rename = "Version", default)]
    pub version: u64,
    #[serde(rename = "L1Proxies")]
    pub l1_proxies: L1Proxies,
    #[serde(rename = "L2Proxies", default, skip_serializing_if = "Option::is_none")]
    pub l2_proxies: Option<L2Proxies>,
}

/// One entry of `l2_genesis.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenesisEntry {
    #[serde(rename = "L1ChainId")]
    pub l1_chain_id: u64,
    #[serde(rename = "L2ChainId")]
    pub l2_chain_id: u64,
    #[serde(rename = "Genesis")]
    pub genesis: Value,
}

/// The L1 side of a rollup's contract set, as copied into the rollup record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct L1Addresses {
    pub rollup: Address,
    pub bridge: Address,
    pub escrow: Address,
    pub address_manager: Address,
}

impl From<&L1Proxies> for L1Addresses {
    fn from(proxies: &L1Proxies) -> Self {
        Self {
            rollup: proxies.l1_rollup,
            bridge: proxies.cross_chain_channel,
            escrow: proxies.l1_escrow,
            address_manager: proxies.address_manager,
        }
    }
}

/// Lookup over the deployment results directory.
///
/// Files are re-read on every call since the deployment task rewrites them.
#[derive(Debug, Clone)]
pub struct DeploymentRegistry {
    dir: PathBuf,
}

impl DeploymentRegistry {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read_list<T: serde::de::DeserializeOwned>(&self, file: &str) -> RollupResult<Vec<T>> {
        let path = self.dir.join(file);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&path)
            .context(format!("Failed to read {}", path.display()))?;
        let list = serde_json::from_str(&content)
            .context(format!("Failed to parse {}", path.display()))?;
        Ok(list)
    }

    /// Contract set deployed for `(l1_chain_id, l2_chain_id)`.
    pub fn contracts_for(&self, l1_chain_id: u64, l2_chain_id: u64) -> RollupResult<RollupContracts> {
        self.read_list::<RollupContracts>(ROLLUP_CONTRACTS_FILE)?
            .into_iter()
            .find(|c| c.l1_chain_id == l1_chain_id && c.l2_chain_id == l2_chain_id)
            .ok_or_else(|| {
                RollupError::NotFound(format!(
                    "rollup contracts with l1 chain id {l1_chain_id} and l2 chain id {l2_chain_id}"
                ))
            })
    }

    /// Genesis document generated for `(l1_chain_id, l2_chain_id)`.
    pub fn genesis_for(&self, l1_chain_id: u64, l2_chain_id: u64) -> RollupResult<Value> {
        self.read_list::<GenesisEntry>(L2_GENESIS_FILE)?
            .into_iter()
            .find(|g| g.l1_chain_id == l1_chain_id && g.l2_chain_id == l2_chain_id)
            .map(|g| g.genesis)
            .ok_or_else(|| {
                RollupError::NotFound(format!(
                    "l2 genesis with l1 chain id {l1_chain_id} and l2 chain id {l2_chain_id}"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    const CONTRACTS: &str = r#"[
  {
    "L1ChainId": 23023,
    "L2ChainId": 1000001,
    "Version": 1,
    "L1Proxies": {
      "AddressManager": "0x1111111111111111111111111111111111111111",
      "L1Rollup": "0x2222222222222222222222222222222222222222",
      "CrossChainChannel": "0x3333333333333333333333333333333333333333",
      "L1Escrow": "0x4444444444444444444444444444444444444444"
    },
    "L2Proxies": {
      "AddressManager": "0x4200000000000000000000000000000000000001",
      "L2Rollup": "0x4200000000000000000000000000000000000002",
      "CrossChainChannel": "0x4200000000000000000000000000000000000003",
      "L2Escrow": "0x4200000000000000000000000000000000000004"
    }
  }
]"#;

    fn registry() -> (TempDir, DeploymentRegistry) {
        let temp_dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        std::fs::write(temp_dir.path().join(ROLLUP_CONTRACTS_FILE), CONTRACTS).unwrap();
        std::fs::write(
            temp_dir.path().join(L2_GENESIS_FILE),
            r#"[{"L1ChainId": 23023, "L2ChainId": 1000001, "Genesis": {"config": {"chainId": 1000001}}}]"#,
        )
        .unwrap();
        let registry = DeploymentRegistry::new(temp_dir.path());
        (temp_dir, registry)
    }

    #[test]
    fn test_contracts_lookup() {
        let (_dir, registry) = registry();
        let contracts = registry.contracts_for(23023, 1_000_001).unwrap();
        let l1 = L1Addresses::from(&contracts.l1_proxies);
        assert_eq!(l1.address_manager, Address::repeat_byte(0x11));
        assert_eq!(l1.rollup, Address::repeat_byte(0x22));
        assert_eq!(l1.bridge, Address::repeat_byte(0x33));
        assert_eq!(l1.escrow, Address::repeat_byte(0x44));
    }

    #[test]
    fn test_lookup_misses_are_not_found() {
        let (_dir, registry) = registry();
        assert!(registry.contracts_for(1, 1_000_001).unwrap_err().is_not_found());
        assert!(registry.genesis_for(23023, 1_000_002).unwrap_err().is_not_found());
    }

    #[test]
    fn test_genesis_lookup() {
        let (_dir, registry) = registry();
        let genesis = registry.genesis_for(23023, 1_000_001).unwrap();
        assert_eq!(genesis["config"]["chainId"], 1_000_001);
    }

    #[test]
    fn test_missing_files_read_as_empty() {
        let temp_dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let registry = DeploymentRegistry::new(temp_dir.path().join("deployments"));
        assert!(registry.contracts_for(23023, 1_000_001).unwrap_err().is_not_found());
    }
}
