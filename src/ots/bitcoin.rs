//! Bitcoin Merkle-Root Lookup
//!
//! Two ways to resolve the merkle root and timestamp of a block at a given
//! height: a configured Bitcoin Core node (self-sovereign) or the
//! blockchain.info explorer (trust the explorer or check the roots
//! yourself).

use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use crate::config::BtcRpcConfig;
use crate::error::{Result, StreamError};

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Merkle root (display hex, as explorers and nodes print it) and block
/// timestamp for one block.
#[derive(Debug, Clone)]
pub struct BlockAnchor {
    pub merkle_root: String,
    pub time: i64,
}

/// Minimal Bitcoin Core JSON-RPC client.
pub struct BitcoinRpc {
    config: BtcRpcConfig,
    http: reqwest::Client,
}

impl BitcoinRpc {
    pub fn new(config: BtcRpcConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(StreamError::Http)?;
        Ok(Self { config, http })
    }

    async fn call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let url = if self.config.host.starts_with("http") {
            self.config.host.clone()
        } else {
            format!("http://{}", self.config.host)
        };

        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(&json!({
                "jsonrpc": "1.0",
                "id": "es",
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| StreamError::BitcoinRpc(format!("{}: {}", method, e)))?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| StreamError::BitcoinRpc(format!("{}: {}", method, e)))?;

        if let Some(err) = body.get("error").filter(|e| !e.is_null()) {
            return Err(StreamError::BitcoinRpc(format!("{}: {}", method, err)));
        }
        body.get("result")
            .cloned()
            .ok_or_else(|| StreamError::BitcoinRpc(format!("{}: missing result", method)))
    }

    pub async fn block_count(&self) -> Result<u64> {
        let result = self.call("getblockcount", json!([])).await?;
        result
            .as_u64()
            .ok_or_else(|| StreamError::BitcoinRpc("getblockcount: not a number".to_string()))
    }

    pub async fn block_hash(&self, height: u64) -> Result<String> {
        let result = self.call("getblockhash", json!([height])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StreamError::BitcoinRpc("getblockhash: not a string".to_string()))
    }

    /// Merkle root and timestamp of the block at `height`.
    pub async fn anchor_at_height(&self, height: u64) -> Result<BlockAnchor> {
        let tip = self.block_count().await?;
        if height > tip {
            return Err(StreamError::BitcoinRpc(format!(
                "attestation height {} is beyond chain tip {}",
                height, tip
            )));
        }
        let hash = self.block_hash(height).await?;
        let header = self.call("getblockheader", json!([hash])).await?;
        let merkle_root = header
            .get("merkleroot")
            .and_then(|v| v.as_str())
            .ok_or_else(|| StreamError::BitcoinRpc("getblockheader: missing merkleroot".to_string()))?
            .to_string();
        let time = header
            .get("time")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| StreamError::BitcoinRpc("getblockheader: missing time".to_string()))?;
        debug!("block {} at height {} merkle root {}", hash, height, merkle_root);
        Ok(BlockAnchor { merkle_root, time })
    }
}

#[derive(Debug, Deserialize)]
struct ExplorerBlock {
    mrkl_root: String,
    time: i64,
}

#[derive(Debug, Deserialize)]
struct ExplorerBlocks {
    blocks: Vec<ExplorerBlock>,
}

/// Explorer fallback: resolve the first block at `height` via
/// blockchain.info.
pub async fn explorer_anchor_at_height(explorer_url: &str, height: u64) -> Result<BlockAnchor> {
    let url = format!("{}/block-height/{}?format=json", explorer_url, height);
    debug!("querying explorer {}", url);

    let http = reqwest::Client::builder()
        .timeout(HTTP_TIMEOUT)
        .build()
        .map_err(StreamError::Http)?;

    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(StreamError::BitcoinRpc(format!(
            "explorer returned {} for height {}",
            response.status(),
            height
        )));
    }

    let body: ExplorerBlocks = response.json().await?;
    let block = body.blocks.into_iter().next().ok_or_else(|| {
        StreamError::BitcoinRpc(format!("explorer returned no blocks for height {}", height))
    })?;

    Ok(BlockAnchor {
        merkle_root: block.mrkl_root,
        time: block.time,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_explorer_anchor_parses_block_list() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/block-height/800000?format=json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"blocks":[{"mrkl_root":"91f01a00530b8e96f7d09d2d395c9f8a1b8b81bbbb28d41b3a7a2b0f2c5c0d1e","time":1690168629}]}"#,
            )
            .create_async()
            .await;

        let anchor = explorer_anchor_at_height(&server.url(), 800000).await.unwrap();
        assert_eq!(
            anchor.merkle_root,
            "91f01a00530b8e96f7d09d2d395c9f8a1b8b81bbbb28d41b3a7a2b0f2c5c0d1e"
        );
        assert_eq!(anchor.time, 1690168629);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_explorer_empty_block_list_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/block-height/1?format=json")
            .with_status(200)
            .with_body(r#"{"blocks":[]}"#)
            .create_async()
            .await;

        let result = explorer_anchor_at_height(&server.url(), 1).await;
        assert!(matches!(result, Err(StreamError::BitcoinRpc(_))));
    }
}
