//! JSON-RPC access to a rollup's execution client.

use std::time::Duration;

use alloy_core::primitives::B256;
use anyhow::Context;
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

/// Default timeout for RPC requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Something that can tell whether an L2 node serves its genesis block.
pub trait GenesisProbe: Send + Sync {
    /// Hash of block 0 served at `rpc_url`.
    fn genesis_hash(&self, rpc_url: &str) -> impl Future<Output = anyhow::Result<B256>> + Send;
}

#[derive(Debug, Deserialize)]
struct BlockHeader {
    hash: B256,
}

/// Minimal JSON-RPC client for the L2 execution client.
#[derive(Debug, Clone)]
pub struct L2RpcClient {
    client: reqwest::Client,
}

impl L2RpcClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    async fn call<T: DeserializeOwned>(
        &self,
        url: &str,
        method: &str,
        params: Vec<Value>,
    ) -> anyhow::Result<T> {
        let response = self
            .client
            .post(url)
            .json(&serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
                "id": 1
            }))
            .send()
            .await
            .with_context(|| format!("Failed to send {method} request to {url}"))?;

        let result: Value = response
            .json()
            .await
            .with_context(|| format!("Failed to parse {method} response"))?;

        if let Some(error) = result.get("error") {
            anyhow::bail!(
                "RPC error: {}",
                error
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("unknown")
            );
        }

        let value = result.get("result").context("No result in response")?.clone();
        if value.is_null() {
            anyhow::bail!("{method} returned null");
        }
        serde_json::from_value(value).with_context(|| format!("Failed to deserialize {method} result"))
    }
}

impl GenesisProbe for L2RpcClient {
    async fn genesis_hash(&self, rpc_url: &str) -> anyhow::Result<B256> {
        let header: BlockHeader = self
            .call(
                rpc_url,
                "eth_getBlockByNumber",
                vec![Value::from("0x0"), Value::from(false)],
            )
            .await?;
        Ok(header.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header_parsing() {
        let header: BlockHeader = serde_json::from_value(serde_json::json!({
            "number": "0x0",
            "hash": "0x1111111111111111111111111111111111111111111111111111111111111111",
            "parentHash": "0x0000000000000000000000000000000000000000000000000000000000000000"
        }))
        .unwrap();
        assert_eq!(header.hash, B256::repeat_byte(0x11));
    }

    #[tokio::test]
    async fn test_unreachable_node_is_an_error() {
        let client = L2RpcClient::with_timeout(Duration::from_millis(500)).unwrap();
        assert!(client.genesis_hash("http://127.0.0.1:1").await.is_err());
    }
}
