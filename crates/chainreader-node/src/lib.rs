//! chainreader-node — reads blocks and transactions from a full node over
//! HTTP JSON-RPC.
//!
//! ```rust,no_run
//! use chainreader_core::BlockchainRpc;
//! use chainreader_node::{NodeClientConfig, NodeRpcClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = NodeRpcClient::new("http://127.0.0.1:19998", NodeClientConfig::default())?;
//! let tip = client.get_block_count().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod request;
pub mod retry;

pub use client::{NodeClientConfig, NodeRpcClient};
pub use error::NodeError;
pub use retry::{RetryConfig, RetryPolicy};
