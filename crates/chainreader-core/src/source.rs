//! Ordered block sequences for the reader to walk.
//!
//! - [`ArrayBlockSource`] replays a fixed list (reprocessing a range, tests).
//! - [`RpcBlockSource`] follows the node's hash chain:
//!   `getblockhash(h)` → `getblock` → `nextblockhash` → … until the tip.
//!
//! Both broadcast every yielded block to subscribers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::ReaderError;
use crate::rpc::BlockchainRpc;
use crate::types::Block;

const NOTIFY_CAPACITY: usize = 64;

/// An ordered, seekable sequence of blocks.
#[async_trait]
pub trait BlockSource: Send {
    /// Yield the next block, or `None` once the sequence is exhausted.
    async fn next(&mut self) -> Result<Option<Block>, ReaderError>;

    /// Rewind to the configured start.
    fn reset(&mut self);

    /// Position the source so the next block yielded is at `height`.
    fn set_height(&mut self, height: u64) -> Result<(), ReaderError>;

    /// Height of the current position.
    fn height(&self) -> Result<u64, ReaderError>;

    /// Receive every block this source yields from now on.
    fn subscribe(&self) -> broadcast::Receiver<Block>;
}

#[async_trait]
impl<S: BlockSource + ?Sized> BlockSource for Box<S> {
    async fn next(&mut self) -> Result<Option<Block>, ReaderError> {
        (**self).next().await
    }

    fn reset(&mut self) {
        (**self).reset()
    }

    fn set_height(&mut self, height: u64) -> Result<(), ReaderError> {
        (**self).set_height(height)
    }

    fn height(&self) -> Result<u64, ReaderError> {
        (**self).height()
    }

    fn subscribe(&self) -> broadcast::Receiver<Block> {
        (**self).subscribe()
    }
}

// ─── ArrayBlockSource ────────────────────────────────────────────────────────

/// Block source over a fixed, in-memory list.
pub struct ArrayBlockSource {
    blocks: Vec<Block>,
    /// Height of the first block; `reset` rewinds here.
    start_height: u64,
    /// Index of the next block to yield.
    position: usize,
    /// Index of the last yielded block.
    current: Option<usize>,
    notifier: broadcast::Sender<Block>,
}

impl ArrayBlockSource {
    pub fn new(blocks: Vec<Block>) -> Self {
        let start_height = blocks.first().map(|b| b.height).unwrap_or(0);
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            blocks,
            start_height,
            position: 0,
            current: None,
            notifier,
        }
    }
}

#[async_trait]
impl BlockSource for ArrayBlockSource {
    async fn next(&mut self) -> Result<Option<Block>, ReaderError> {
        let Some(block) = self.blocks.get(self.position).cloned() else {
            return Ok(None);
        };
        self.current = Some(self.position);
        self.position += 1;
        let _ = self.notifier.send(block.clone());
        Ok(Some(block))
    }

    fn reset(&mut self) {
        self.position = 0;
        self.current = None;
    }

    fn set_height(&mut self, height: u64) -> Result<(), ReaderError> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.height == height)
            .ok_or(ReaderError::InvalidHeight { height })?;
        self.position = index;
        self.current = None;
        Ok(())
    }

    fn height(&self) -> Result<u64, ReaderError> {
        self.current
            .or(Some(self.position))
            .and_then(|index| self.blocks.get(index))
            .map(|block| block.height)
            .ok_or(ReaderError::InvalidHeight {
                height: self.start_height,
            })
    }

    fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.notifier.subscribe()
    }
}

// ─── RpcBlockSource ──────────────────────────────────────────────────────────

/// Block source that walks the node's chain forward from a height.
pub struct RpcBlockSource {
    rpc: Arc<dyn BlockchainRpc>,
    from_height: u64,
    /// Height to resolve on the next `next()` call when nothing was yielded yet.
    target_height: u64,
    current: Option<Block>,
    exhausted: bool,
    notifier: broadcast::Sender<Block>,
}

impl RpcBlockSource {
    pub fn new(rpc: Arc<dyn BlockchainRpc>, from_height: u64) -> Self {
        let (notifier, _) = broadcast::channel(NOTIFY_CAPACITY);
        Self {
            rpc,
            from_height,
            target_height: from_height,
            current: None,
            exhausted: false,
            notifier,
        }
    }
}

#[async_trait]
impl BlockSource for RpcBlockSource {
    async fn next(&mut self) -> Result<Option<Block>, ReaderError> {
        if self.exhausted {
            return Ok(None);
        }

        let hash = match &self.current {
            None => self.rpc.get_block_hash(self.target_height).await?,
            Some(current) => match &current.next_block_hash {
                Some(next) => next.clone(),
                None => {
                    self.exhausted = true;
                    return Ok(None);
                }
            },
        };

        let block = self.rpc.get_block(&hash).await?;
        tracing::trace!(height = block.height, hash = %block.hash, "fetched block");
        self.current = Some(block.clone());
        let _ = self.notifier.send(block.clone());
        Ok(Some(block))
    }

    fn reset(&mut self) {
        self.target_height = self.from_height;
        self.current = None;
        self.exhausted = false;
    }

    fn set_height(&mut self, height: u64) -> Result<(), ReaderError> {
        self.target_height = height;
        self.current = None;
        self.exhausted = false;
        Ok(())
    }

    fn height(&self) -> Result<u64, ReaderError> {
        Ok(self
            .current
            .as_ref()
            .map(|b| b.height)
            .unwrap_or(self.target_height))
    }

    fn subscribe(&self) -> broadcast::Receiver<Block> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::MemoryChain;

    async fn drain(source: &mut impl BlockSource) -> Vec<u64> {
        let mut heights = vec![];
        while let Some(block) = source.next().await.unwrap() {
            heights.push(block.height);
        }
        heights
    }

    #[tokio::test]
    async fn array_source_seeks_by_height() {
        let mut source = ArrayBlockSource::new(MemoryChain::linear(3, 6, "a").blocks());
        assert_eq!(source.height().unwrap(), 3);

        source.set_height(5).unwrap();
        assert_eq!(source.height().unwrap(), 5);
        assert_eq!(drain(&mut source).await, vec![5, 6]);
        assert_eq!(source.height().unwrap(), 6);

        assert_eq!(
            source.set_height(9),
            Err(ReaderError::InvalidHeight { height: 9 })
        );

        source.reset();
        assert_eq!(drain(&mut source).await, vec![3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn array_reset_after_seek_returns_to_first_block() {
        let mut source = ArrayBlockSource::new(MemoryChain::linear(3, 6, "a").blocks());
        source.set_height(5).unwrap();
        source.reset();

        assert_eq!(source.height().unwrap(), 3);
        assert_eq!(source.next().await.unwrap().unwrap().height, 3);
        assert_eq!(source.height().unwrap(), 3);
    }

    #[tokio::test]
    async fn empty_array_source_has_no_height() {
        let source = ArrayBlockSource::new(vec![]);
        assert!(source.height().unwrap_err().is_invalid_height());
    }

    #[tokio::test]
    async fn rpc_source_walks_next_block_hash() {
        let chain = Arc::new(MemoryChain::linear(1, 5, "a"));
        let mut source = RpcBlockSource::new(chain, 1);

        source.set_height(3).unwrap();
        assert_eq!(source.height().unwrap(), 3);
        assert_eq!(drain(&mut source).await, vec![3, 4, 5]);
        assert_eq!(source.height().unwrap(), 5);
        assert!(source.next().await.unwrap().is_none());

        source.reset();
        assert_eq!(drain(&mut source).await, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn rpc_source_defers_height_resolution() {
        let chain = Arc::new(MemoryChain::linear(1, 2, "a"));
        let mut source = RpcBlockSource::new(chain, 1);

        // accepted until the first fetch
        source.set_height(10).unwrap();
        assert_eq!(
            source.next().await,
            Err(ReaderError::InvalidHeight { height: 10 })
        );
    }

    #[tokio::test]
    async fn sources_notify_subscribers() {
        let mut source = ArrayBlockSource::new(MemoryChain::linear(1, 2, "a").blocks());
        let mut rx = source.subscribe();
        drain(&mut source).await;
        assert_eq!(rx.recv().await.unwrap().height, 1);
        assert_eq!(rx.recv().await.unwrap().height, 2);
    }
}
