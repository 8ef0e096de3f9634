//! Reader configuration and its fluent builder.
//!
//! # Example
//!
//! ```rust
//! use chainreader_core::ReaderConfigBuilder;
//!
//! let config = ReaderConfigBuilder::new()
//!     .id("testnet-reader")
//!     .network("testnet")
//!     .initial_block_height(1_000)
//!     .blocks_limit(20)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.initial_block_height, 1_000);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ReaderError;

/// Configuration for a reader instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Unique name for this reader (used as the snapshot scope).
    pub id: String,
    /// Network the node serves (e.g. `"testnet"`).
    pub network: String,
    /// First block to read.
    pub initial_block_height: u64,
    /// Maximum number of synced blocks retained for sequence validation.
    pub blocks_limit: usize,
    /// How often to save a snapshot (every N blocks).
    pub snapshot_interval: u64,
    /// Node JSON-RPC endpoint.
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    /// Tip polling interval in follow mode (milliseconds).
    pub poll_interval_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            id: "default".into(),
            network: "testnet".into(),
            initial_block_height: 1,
            blocks_limit: 12,
            snapshot_interval: 10,
            rpc_url: "http://127.0.0.1:19998".into(),
            rpc_user: None,
            rpc_password: None,
            poll_interval_ms: 5000,
        }
    }
}

impl ReaderConfig {
    /// Snapshot scope key: `"{network}:{id}"`.
    pub fn scope(&self) -> String {
        format!("{}:{}", self.network, self.id)
    }

    pub fn validate(&self) -> Result<(), ReaderError> {
        if self.blocks_limit == 0 {
            return Err(ReaderError::Config("blocks_limit must be at least 1".into()));
        }
        if self.snapshot_interval == 0 {
            return Err(ReaderError::Config(
                "snapshot_interval must be at least 1".into(),
            ));
        }
        if self.id.is_empty() {
            return Err(ReaderError::Config("id must not be empty".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`ReaderConfig`].
#[derive(Default)]
pub struct ReaderConfigBuilder {
    config: ReaderConfig,
}

impl ReaderConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config (e.g. one loaded from a file).
    pub fn from_config(config: ReaderConfig) -> Self {
        Self { config }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.config.id = id.into();
        self
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.config.network = network.into();
        self
    }

    pub fn initial_block_height(mut self, height: u64) -> Self {
        self.config.initial_block_height = height;
        self
    }

    pub fn blocks_limit(mut self, limit: usize) -> Self {
        self.config.blocks_limit = limit;
        self
    }

    /// Set snapshot save interval (every N blocks).
    pub fn snapshot_interval(mut self, n: u64) -> Self {
        self.config.snapshot_interval = n;
        self
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc_url = url.into();
        self
    }

    /// Basic-auth credentials for the node.
    pub fn rpc_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.rpc_user = Some(user.into());
        self.config.rpc_password = Some(password.into());
        self
    }

    pub fn poll_interval_ms(mut self, ms: u64) -> Self {
        self.config.poll_interval_ms = ms;
        self
    }

    /// Validate and build the config.
    pub fn build(self) -> Result<ReaderConfig, ReaderError> {
        self.config.validate()?;
        Ok(self.config)
    }
}
