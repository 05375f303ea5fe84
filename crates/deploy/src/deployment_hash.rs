use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// File name of the deployment marker inside a rollup's build directory.
pub const DEPLOYMENT_VERSION_FILE: &str = ".deployment-version.json";

/// Parameters that, when changed, require redeploying the L1 contracts.
///
/// Keys, image versions and ports are not part of it: they only affect what runs on top of
/// the deployed contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentFingerprint {
    pub l1_chain_id: u64,
    pub l2_chain_id: u64,
    pub l1_rpc_url: String,
    pub rollup_version: u64,
    /// Address deploying the contracts and owning the L2 premint.
    pub deployer_address: String,
    /// Premint map, ordered by address so hashing is stable.
    pub premint: BTreeMap<String, String>,
}

impl DeploymentFingerprint {
    /// SHA-256 of the JSON encoding, hex encoded.
    pub fn compute_hash(&self) -> Result<String> {
        let json =
            serde_json::to_string(self).context("Failed to serialize deployment fingerprint")?;
        Ok(hex::encode(Sha256::digest(json.as_bytes())))
    }
}

/// Marker written next to the build artifacts after a successful contract deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentVersion {
    pub config_hash: String,
    pub deployed_at: DateTime<Utc>,
    /// Version of rollbake that performed the deployment.
    pub rollbake_version: String,
}

impl DeploymentVersion {
    pub fn new(config_hash: String) -> Self {
        Self {
            config_hash,
            deployed_at: Utc::now(),
            rollbake_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize deployment version")?;
        std::fs::write(path, json).context(format!(
            "Failed to write deployment version to {}",
            path.display()
        ))?;
        Ok(())
    }

    /// `Ok(None)` if no marker has been written yet.
    pub fn load_from_file(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(path).context(format!(
            "Failed to read deployment version from {}",
            path.display()
        ))?;
        let version =
            serde_json::from_str(&content).context("Failed to parse deployment version JSON")?;
        Ok(Some(version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn fingerprint() -> DeploymentFingerprint {
        DeploymentFingerprint {
            l1_chain_id: 23023,
            l2_chain_id: 1_000_001,
            l1_rpc_url: "http://127.0.0.1:10545".to_string(),
            rollup_version: 1,
            deployer_address: "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
            premint: BTreeMap::from([(
                "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".to_string(),
                "1000".to_string(),
            )]),
        }
    }

    #[test]
    fn test_hash_determinism() {
        let hash1 = fingerprint().compute_hash().unwrap();
        let hash2 = fingerprint().compute_hash().unwrap();
        assert_eq!(hash1, hash2, "Hash should be deterministic");
        assert_eq!(hash1.len(), 64, "SHA-256 hash should be 64 hex characters");
    }

    #[test]
    fn test_hash_changes_with_chain_id() {
        let mut other = fingerprint();
        other.l2_chain_id = 1_000_002;
        assert_ne!(
            fingerprint().compute_hash().unwrap(),
            other.compute_hash().unwrap()
        );
    }

    #[test]
    fn test_hash_changes_with_premint() {
        let mut other = fingerprint();
        other
            .premint
            .insert("0x0000000000000000000000000000000000000001".to_string(), "5".to_string());
        assert_ne!(
            fingerprint().compute_hash().unwrap(),
            other.compute_hash().unwrap()
        );
    }

    #[test]
    fn test_version_save_and_load() {
        let temp_dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join(DEPLOYMENT_VERSION_FILE);

        let version = DeploymentVersion::new(fingerprint().compute_hash().unwrap());
        version.save_to_file(&path).unwrap();

        let loaded = DeploymentVersion::load_from_file(&path).unwrap();
        assert_eq!(loaded, Some(version));
    }

    #[test]
    fn test_version_missing_and_corrupted() {
        let temp_dir = TempDir::new("rollbake-test").expect("Failed to create temp dir");
        let path = temp_dir.path().join(DEPLOYMENT_VERSION_FILE);
        assert_eq!(DeploymentVersion::load_from_file(&path).unwrap(), None);

        std::fs::write(&path, "{ invalid json }").unwrap();
        assert!(DeploymentVersion::load_from_file(&path).is_err());
    }
}
