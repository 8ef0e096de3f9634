use chainreader_core::ReaderError;
use thiserror::Error;

use crate::request::NodeRpcError;

/// Code a node returns while it is still loading its block index.
const RPC_IN_WARMUP: i64 = -28;

/// Failures talking to a node.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("{0}")]
    Rpc(NodeRpcError),

    #[error("Failed to decode node response: {0}")]
    Decode(String),
}

impl NodeError {
    /// Transport failures, server errors and warm-up are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Status { status, .. } => *status >= 500,
            Self::Rpc(err) => err.code == RPC_IN_WARMUP,
            Self::Decode(_) => false,
        }
    }
}

impl From<NodeError> for ReaderError {
    fn from(e: NodeError) -> Self {
        ReaderError::Rpc(e.to_string())
    }
}
