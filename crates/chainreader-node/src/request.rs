//! Node JSON-RPC wire types.
//!
//! Core-style nodes speak a loose JSON-RPC dialect: every response carries
//! both `result` and `error`, one of which is `null`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use chainreader_core::types::Block;

/// Error code returned by `getblockhash` for a height above the tip.
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// Error code for an unknown block or transaction.
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// A node JSON-RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    pub params: Vec<Value>,
}

impl NodeRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            jsonrpc: "1.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// The error object of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRpcError {
    pub code: i64,
    pub message: String,
}

impl std::fmt::Display for NodeRpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node error {}: {}", self.code, self.message)
    }
}

/// A node JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<NodeRpcError>,
    #[serde(default)]
    pub id: Option<Value>,
}

impl NodeResponse {
    pub fn into_result(self) -> Result<Value, NodeRpcError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Verbose `getblock` result, reduced to the fields the reader needs.
#[derive(Debug, Clone, Deserialize)]
pub struct VerboseBlock {
    pub hash: String,
    pub height: u64,
    #[serde(rename = "previousblockhash", default)]
    pub previous_block_hash: Option<String>,
    #[serde(rename = "nextblockhash", default)]
    pub next_block_hash: Option<String>,
    #[serde(default)]
    pub tx: Vec<String>,
}

impl From<VerboseBlock> for Block {
    fn from(b: VerboseBlock) -> Self {
        Block {
            height: b.height,
            hash: b.hash,
            previous_block_hash: b.previous_block_hash,
            next_block_hash: b.next_block_hash,
            transaction_ids: b.tx,
        }
    }
}
