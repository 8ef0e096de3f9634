//! The blockchain node contract the reader consumes.

use async_trait::async_trait;

use crate::error::ReaderError;
use crate::types::Block;

/// Trait for fetching chain data from a node.
///
/// Implementations live outside the core (see `chainreader-node`); tests use
/// in-memory fakes.
#[async_trait]
pub trait BlockchainRpc: Send + Sync {
    /// Height of the chain tip.
    async fn get_block_count(&self) -> Result<u64, ReaderError>;

    /// Hash of the block at `height`.
    ///
    /// Must fail with [`ReaderError::InvalidHeight`] when the node has no block
    /// at that height.
    async fn get_block_hash(&self, height: u64) -> Result<String, ReaderError>;

    async fn get_block(&self, hash: &str) -> Result<Block, ReaderError>;

    /// The raw transaction bytes for `txid`.
    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ReaderError>;
}

// ─── In-memory chain (for testing) ────────────────────────────────────────────

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct ChainData {
    blocks: BTreeMap<u64, Block>,
    transactions: HashMap<String, Vec<u8>>,
}

/// In-memory chain for tests and local tooling.
///
/// Blocks are keyed by height and linked through `nextblockhash` every time
/// the chain changes, so [`MemoryChain::fork_from`] simulates a reorg.
#[derive(Default)]
pub struct MemoryChain {
    data: Mutex<ChainData>,
}

impl MemoryChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// A chain of blocks `from..=to` with hashes `"{tag}-{height}"`.
    pub fn linear(from: u64, to: u64, tag: &str) -> Self {
        let chain = Self::new();
        chain.extend(from, to, tag);
        chain
    }

    /// Build the block `"{tag}-{height}"` whose parent is `"{parent_tag}-{height - 1}"`.
    pub fn block(height: u64, tag: &str, parent_tag: &str) -> Block {
        Block {
            height,
            hash: format!("{tag}-{height}"),
            previous_block_hash: height
                .checked_sub(1)
                .map(|parent| format!("{parent_tag}-{parent}")),
            next_block_hash: None,
            transaction_ids: vec![],
        }
    }

    /// Append blocks `from..=to` tagged `tag`, linked to whatever sits below `from`.
    pub fn extend(&self, from: u64, to: u64, tag: &str) {
        let mut data = self.lock();
        for height in from..=to {
            let previous = height
                .checked_sub(1)
                .and_then(|parent| data.blocks.get(&parent))
                .map(|b| b.hash.clone());
            let mut block = Self::block(height, tag, tag);
            if previous.is_some() {
                block.previous_block_hash = previous;
            }
            data.blocks.insert(height, block);
        }
        Self::link(&mut data.blocks);
    }

    /// Replace everything from `height` upward with a fork tagged `tag` ending at `to`.
    pub fn fork_from(&self, height: u64, to: u64, tag: &str) {
        {
            let mut data = self.lock();
            data.blocks.retain(|h, _| *h < height);
        }
        self.extend(height, to, tag);
    }

    /// Drop every block above `height`.
    pub fn truncate(&self, height: u64) {
        let mut data = self.lock();
        data.blocks.retain(|h, _| *h <= height);
        Self::link(&mut data.blocks);
    }

    /// Attach a raw transaction to the block at `height`.
    pub fn add_transaction(&self, height: u64, txid: &str, raw: Vec<u8>) {
        let mut data = self.lock();
        if let Some(block) = data.blocks.get_mut(&height) {
            block.transaction_ids.push(txid.to_string());
        }
        data.transactions.insert(txid.to_string(), raw);
    }

    /// Block at `height`, if present.
    pub fn block_at(&self, height: u64) -> Option<Block> {
        self.lock().blocks.get(&height).cloned()
    }

    /// All blocks in height order.
    pub fn blocks(&self) -> Vec<Block> {
        self.lock().blocks.values().cloned().collect()
    }

    fn link(blocks: &mut BTreeMap<u64, Block>) {
        let hashes: HashMap<u64, String> =
            blocks.iter().map(|(h, b)| (*h, b.hash.clone())).collect();
        for (height, block) in blocks.iter_mut() {
            block.next_block_hash = hashes.get(&(height + 1)).cloned();
        }
    }

    fn lock(&self) -> MutexGuard<'_, ChainData> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl BlockchainRpc for MemoryChain {
    async fn get_block_count(&self) -> Result<u64, ReaderError> {
        Ok(self.lock().blocks.keys().next_back().copied().unwrap_or(0))
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, ReaderError> {
        self.lock()
            .blocks
            .get(&height)
            .map(|b| b.hash.clone())
            .ok_or(ReaderError::InvalidHeight { height })
    }

    async fn get_block(&self, hash: &str) -> Result<Block, ReaderError> {
        self.lock()
            .blocks
            .values()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| ReaderError::Rpc(format!("block {hash} not found")))
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<Vec<u8>, ReaderError> {
        self.lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| ReaderError::Rpc(format!("transaction {txid} not found")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn linear_chain_is_linked() {
        let chain = MemoryChain::linear(1, 3, "a");
        assert_eq!(chain.get_block_count().await.unwrap(), 3);
        let b1 = chain.get_block(&chain.get_block_hash(1).await.unwrap()).await.unwrap();
        assert_eq!(b1.next_block_hash.as_deref(), Some("a-2"));
        let b3 = chain.get_block("a-3").await.unwrap();
        assert_eq!(b3.previous_block_hash.as_deref(), Some("a-2"));
        assert!(b3.next_block_hash.is_none());
    }

    #[tokio::test]
    async fn fork_relinks_blocks() {
        let chain = MemoryChain::linear(1, 3, "a");
        chain.fork_from(3, 4, "b");
        let b3 = chain.block_at(3).unwrap();
        assert_eq!(b3.hash, "b-3");
        assert_eq!(b3.previous_block_hash.as_deref(), Some("a-2"));
        assert_eq!(chain.block_at(2).unwrap().next_block_hash.as_deref(), Some("b-3"));
        assert_eq!(
            chain.get_block_hash(9).await,
            Err(ReaderError::InvalidHeight { height: 9 })
        );
    }
}
