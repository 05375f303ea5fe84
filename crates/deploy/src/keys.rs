//! secp256k1 key helpers: deployer addresses and bootnode identities.

use alloy_core::primitives::Address;
use anyhow::Context;
use derive_more::Deref;
use k256::ecdsa::SigningKey;
use serde::{Deserialize, Serialize};

/// Bootnode key shipped for development networks.
pub const DEV_BOOTNODE_KEY: &str = "4a7137c699b2aae3ac810542bd0d66643e9714ea5692853b5eda9056e85647b3";

/// A hex-encoded secp256k1 private key. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize, Deref)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(hex_key: impl Into<String>) -> Self {
        Self(hex_key.into())
    }

    /// The key as `0x`-prefixed hex, the form the chain tooling expects.
    pub fn to_prefixed_hex(&self) -> String {
        format!("0x{}", self.0.trim_start_matches("0x"))
    }

    pub fn signing_key(&self) -> anyhow::Result<SigningKey> {
        let raw = self.0.strip_prefix("0x").unwrap_or(&self.0);
        let bytes: [u8; 32] = hex::decode(raw)
            .context("Private key is not valid hex")?
            .try_into()
            .map_err(|_| anyhow::anyhow!("Private key must be exactly 32 bytes"))?;
        SigningKey::from_bytes(&bytes.into())
            .map_err(|e| anyhow::anyhow!("Invalid secp256k1 private key: {}", e))
    }

    /// Ethereum address controlled by this key.
    pub fn address(&self) -> anyhow::Result<Address> {
        let signing_key = self.signing_key()?;
        let point = signing_key.verifying_key().to_encoded_point(false);
        // Skip the 0x04 uncompressed marker.
        Ok(Address::from_raw_public_key(&point.as_bytes()[1..]))
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

/// Identity of the execution-layer bootnode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeKey {
    /// Private key (32 bytes hex-encoded, without 0x prefix)
    pub private_key: String,
    /// Node ID derived from the public key (64 bytes hex-encoded, without 0x prefix)
    pub node_id: String,
}

impl NodeKey {
    pub fn from_private_key(private_key_hex: &str) -> anyhow::Result<Self> {
        let signing_key = PrivateKey::new(private_key_hex).signing_key()?;
        Ok(Self::from_signing_key(&signing_key))
    }

    fn from_signing_key(signing_key: &SigningKey) -> Self {
        let point = signing_key.verifying_key().to_encoded_point(false);
        Self {
            private_key: hex::encode(signing_key.to_bytes()),
            node_id: hex::encode(&point.as_bytes()[1..]),
        }
    }
}
