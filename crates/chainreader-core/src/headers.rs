//! State-transition header extraction.
//!
//! Every block transaction is fetched as raw bytes and parsed as a
//! [`StateTransitionHeader`]. Malformed transactions and transactions of other
//! types are logged and skipped; they never fail the sequence.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, Stream};

use crate::error::ReaderError;
use crate::rpc::BlockchainRpc;
use crate::source::BlockSource;
use crate::types::{Block, StateTransitionHeader};

/// Derives the ordered state transitions of a block. Must not have side effects.
#[async_trait]
pub trait TransitionDeriver: Send + Sync {
    async fn derive(&self, block: &Block) -> Result<Vec<StateTransitionHeader>, ReaderError>;
}

/// Fetch, parse and filter the headers of one block's transactions.
pub async fn fetch_block_headers(
    rpc: &dyn BlockchainRpc,
    block: &Block,
) -> Result<Vec<StateTransitionHeader>, ReaderError> {
    let mut headers = Vec::new();
    for txid in &block.transaction_ids {
        if let Some(header) = fetch_header(rpc, block, txid).await? {
            headers.push(header);
        }
    }
    Ok(headers)
}

async fn fetch_header(
    rpc: &dyn BlockchainRpc,
    block: &Block,
    txid: &str,
) -> Result<Option<StateTransitionHeader>, ReaderError> {
    let raw = rpc.get_raw_transaction(txid).await?;
    match StateTransitionHeader::from_bytes(&raw) {
        Ok(header) => Ok(Some(header)),
        Err(e) => {
            tracing::debug!(
                txid,
                height = block.height,
                error = %e,
                "skipping transaction"
            );
            Ok(None)
        }
    }
}

/// [`TransitionDeriver`] that reads transactions from the node.
pub struct RpcTransitionDeriver {
    rpc: Arc<dyn BlockchainRpc>,
}

impl RpcTransitionDeriver {
    pub fn new(rpc: Arc<dyn BlockchainRpc>) -> Self {
        Self { rpc }
    }
}

#[async_trait]
impl TransitionDeriver for RpcTransitionDeriver {
    async fn derive(&self, block: &Block) -> Result<Vec<StateTransitionHeader>, ReaderError> {
        fetch_block_headers(self.rpc.as_ref(), block).await
    }
}

// ─── HeaderExtractor ─────────────────────────────────────────────────────────

/// Flattens a [`BlockSource`] into one lazy sequence of headers.
pub struct HeaderExtractor<S> {
    source: S,
    rpc: Arc<dyn BlockchainRpc>,
    current_block: Option<Block>,
    tx_index: usize,
}

impl<S: BlockSource> HeaderExtractor<S> {
    pub fn new(source: S, rpc: Arc<dyn BlockchainRpc>) -> Self {
        Self {
            source,
            rpc,
            current_block: None,
            tx_index: 0,
        }
    }

    /// Next header together with the block that carries it.
    pub async fn next(&mut self) -> Result<Option<(StateTransitionHeader, Block)>, ReaderError> {
        loop {
            let block = match &self.current_block {
                Some(block) => block.clone(),
                None => match self.source.next().await? {
                    Some(block) => {
                        self.tx_index = 0;
                        self.current_block = Some(block.clone());
                        block
                    }
                    None => return Ok(None),
                },
            };

            while let Some(txid) = block.transaction_ids.get(self.tx_index) {
                self.tx_index += 1;
                if let Some(header) = fetch_header(self.rpc.as_ref(), &block, txid).await? {
                    return Ok(Some((header, block)));
                }
            }

            self.current_block = None;
        }
    }

    /// Restart from the source's configured start.
    pub fn reset(&mut self) {
        self.source.reset();
        self.current_block = None;
        self.tx_index = 0;
    }

    /// Restart the current block's headers without moving the source.
    pub fn reset_keep_source(&mut self) {
        self.tx_index = 0;
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    /// Consume the extractor as a stream. The stream ends after the first error.
    pub fn into_stream(
        self,
    ) -> impl Stream<Item = Result<(StateTransitionHeader, Block), ReaderError>> {
        stream::unfold(Some(self), |state| async move {
            let mut extractor = state?;
            match extractor.next().await {
                Ok(Some(item)) => Some((Ok(item), Some(extractor))),
                Ok(None) => None,
                Err(e) => Some((Err(e), None)),
            }
        })
    }
}
