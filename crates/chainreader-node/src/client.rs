//! HTTP JSON-RPC client for a full node, backed by `reqwest`.
//!
//! Features:
//! - Basic auth with the node's RPC credentials
//! - Automatic retry with exponential backoff for transient errors
//! - Maps "height out of range" to [`ReaderError::InvalidHeight`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};

use chainreader_core::types::Block;
use chainreader_core::{BlockchainRpc, ReaderConfig, ReaderError};

use crate::error::NodeError;
use crate::request::{NodeRequest, NodeResponse, VerboseBlock, RPC_INVALID_PARAMETER};
use crate::retry::{RetryConfig, RetryPolicy};

/// Configuration for [`NodeRpcClient`].
#[derive(Debug, Clone)]
pub struct NodeClientConfig {
    pub retry: RetryConfig,
    pub request_timeout: Duration,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl Default for NodeClientConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            user: None,
            password: None,
        }
    }
}

/// JSON-RPC client implementing [`BlockchainRpc`] against a node.
pub struct NodeRpcClient {
    url: String,
    http: reqwest::Client,
    retry: RetryPolicy,
    user: Option<String>,
    password: Option<String>,
    next_id: AtomicU64,
}

impl NodeRpcClient {
    /// Create a client for the node at `url`.
    pub fn new(url: impl Into<String>, config: NodeClientConfig) -> Result<Self, NodeError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| NodeError::Http(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            http,
            retry: RetryPolicy::new(config.retry),
            user: config.user,
            password: config.password,
            next_id: AtomicU64::new(1),
        })
    }

    /// Create a client from the RPC section of a reader config.
    pub fn from_reader_config(config: &ReaderConfig) -> Result<Self, NodeError> {
        Self::new(
            config.rpc_url.clone(),
            NodeClientConfig {
                user: config.rpc_user.clone(),
                password: config.rpc_password.clone(),
                ..Default::default()
            },
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn send_once(&self, req: &NodeRequest) -> Result<Value, NodeError> {
        let mut builder = self.http.post(&self.url).json(req);
        if let Some(user) = &self.user {
            builder = builder.basic_auth(user, self.password.as_ref());
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| NodeError::Http(e.to_string()))?;

        // nodes answer RPC errors with a 500 and a JSON body
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| NodeError::Http(e.to_string()))?;
        match serde_json::from_str::<NodeResponse>(&body) {
            Ok(parsed) => parsed.into_result().map_err(NodeError::Rpc),
            Err(_) if !status.is_success() => Err(NodeError::Status {
                status: status.as_u16(),
                body,
            }),
            Err(e) => Err(NodeError::Decode(e.to_string())),
        }
    }

    /// Call `method` with `params`, retrying transient failures.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<Value>,
    ) -> Result<T, NodeError> {
        let req = NodeRequest::new(self.next_id.fetch_add(1, Ordering::Relaxed), method, params);

        let mut attempt = 0u32;
        let value = loop {
            match self.send_once(&req).await {
                Ok(value) => break value,
                Err(e) if e.is_retryable() => {
                    attempt += 1;
                    match self.retry.next_delay(attempt) {
                        Some(delay) => {
                            tracing::warn!(
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                error = %e,
                                method,
                                "retrying node call"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            tracing::error!(attempt, error = %e, method, "max retries exceeded");
                            return Err(e);
                        }
                    }
                }
                Err(e) => return Err(e),
            }
        };

        serde_json::from_value(value).map_err(|e| NodeError::Decode(e.to_string()))
    }
}

#[async_trait]
impl BlockchainRpc for NodeRpcClient {
    async fn get_block_count(&self) -> Result<u64, ReaderError> {
        Ok(self.call("getblockcount", vec![]).await?)
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, ReaderError> {
        match self.call("getblockhash", vec![json!(height)]).await {
            Ok(hash) => Ok(hash),
            Err(NodeError::Rpc(err)) if err.code == RPC_INVALID_PARAMETER => {
                Err(ReaderError::InvalidHeight { height })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_block(&self, hash: &str) -> Result<Block, ReaderError> {
        let block: VerboseBlock = self.call("getblock", vec![json!(hash)]).await?;
        Ok(block.into())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ReaderError> {
        let tx: Value = self
            .call("getrawtransaction", vec![json!(txid), json!(1)])
            .await?;
        serde_json::to_vec(&tx).map_err(|e| ReaderError::Rpc(e.to_string()))
    }
}
