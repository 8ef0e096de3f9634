//! Decides where a read starts and serializes sync attempts.
//!
//! Given the chain tip height `C` and the last synced block `L`:
//! - `initial_block_height > C`: out of bounds, reset if anything was synced
//! - `L.height == C` with a matching hash: fully synced
//! - `L.height > C`: the chain got shorter, read from `C` (or reset and read
//!   from the initial height when `C` is outside the synced window)
//! - otherwise read from `L.height + 1`, or the initial height when nothing
//!   is synced yet
//!
//! Only one sync runs at a time. A request that arrives while one is in
//! flight is dropped; the running sync picks up the new tip on its next pass.
//!
//! [`SyncDriver::stop`] lets a running read finish the current block's
//! fan-out and then return; later syncs do nothing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::error::ReaderError;
use crate::mediator::{ReaderEvent, ReaderMediator};
use crate::reader::BlockchainReader;
use crate::rpc::BlockchainRpc;
use crate::source::BlockSource;

/// Result of one [`SyncDriver::sync`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Another sync was in flight; nothing was done.
    AlreadyInSync,
    /// The initial block height is above the chain tip.
    OutOfBounds { current_block_count: u64 },
    /// The last synced block is the chain tip.
    FullySynced { current_block_count: u64 },
    /// Blocks were read starting at `from`.
    Read { from: u64, last_height_read: u64 },
    /// The driver was stopped before this sync began.
    Stopped,
}

/// Clears the in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Top-level sync policy over a [`BlockchainReader`].
pub struct SyncDriver<S> {
    rpc: Arc<dyn BlockchainRpc>,
    mediator: Arc<ReaderMediator>,
    reader: Mutex<BlockchainReader<S>>,
    in_sync: AtomicBool,
    stop: Arc<AtomicBool>,
}

impl<S: BlockSource> SyncDriver<S> {
    pub fn new(rpc: Arc<dyn BlockchainRpc>, reader: BlockchainReader<S>) -> Self {
        Self {
            rpc,
            mediator: reader.mediator().clone(),
            stop: reader.stop_handle(),
            reader: Mutex::new(reader),
            in_sync: AtomicBool::new(false),
        }
    }

    /// Stop after the block being processed; no further sync reads anything.
    pub fn stop(&self) {
        tracing::info!("stopping sync driver");
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub fn mediator(&self) -> &Arc<ReaderMediator> {
        &self.mediator
    }

    /// Whether a sync is currently running.
    pub fn is_in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Acquire)
    }

    /// Run one sync attempt, or return [`SyncOutcome::AlreadyInSync`].
    pub async fn sync(&self) -> Result<SyncOutcome, ReaderError> {
        let Some(_in_flight) = InFlight::acquire(&self.in_sync) else {
            tracing::debug!("sync already in progress, dropping request");
            return Ok(SyncOutcome::AlreadyInSync);
        };
        self.run().await
    }

    async fn run(&self) -> Result<SyncOutcome, ReaderError> {
        if self.is_stopped() {
            return Ok(SyncOutcome::Stopped);
        }
        let mediator = &self.mediator;
        let initial_block_height = mediator.initial_block_height();
        let current_block_count = self.rpc.get_block_count().await?;
        let last = mediator.state().last_block().cloned();

        if initial_block_height > current_block_count {
            mediator
                .emit(ReaderEvent::OutOfBounds {
                    initial_block_height,
                    current_block_count,
                })
                .await?;
            if last.is_some() {
                mediator.reset().await?;
            }
            return Ok(SyncOutcome::OutOfBounds {
                current_block_count,
            });
        }

        let mut tip_replaced = false;
        let height = match &last {
            Some(last) if last.height == current_block_count => {
                let tip_hash = self.rpc.get_block_hash(current_block_count).await?;
                if tip_hash == last.hash {
                    mediator
                        .emit(ReaderEvent::FullySynced {
                            current_block_count,
                        })
                        .await?;
                    return Ok(SyncOutcome::FullySynced {
                        current_block_count,
                    });
                }
                tracing::warn!(
                    height = last.height,
                    local = %last.hash,
                    remote = %tip_hash,
                    "chain tip replaced"
                );
                tip_replaced = true;
                last.height + 1
            }
            Some(last) if last.height > current_block_count => {
                let first_block_height = mediator.state().first_block_height();
                tracing::warn!(
                    last_synced = last.height,
                    current_block_count,
                    "local chain is ahead of the node"
                );
                if current_block_count <= first_block_height {
                    mediator
                        .emit(ReaderEvent::BlockSequenceValidationImpossible {
                            height: current_block_count,
                            first_synced_block_height: first_block_height,
                        })
                        .await?;
                    mediator.reset().await?;
                    initial_block_height
                } else {
                    current_block_count
                }
            }
            Some(last) => last.height + 1,
            None => initial_block_height,
        };

        tracing::info!(height, current_block_count, "starting sync");
        mediator.emit(ReaderEvent::Begin { height }).await?;

        let mut from = height;
        let mut reader = self.reader.lock().await;
        let last_height_read = match reader.read(height).await {
            // the replaced tip has no successor yet; re-read it so the
            // sequence validator rolls it back
            Err(ReaderError::InvalidHeight { height: missing })
                if tip_replaced && missing == height =>
            {
                from = current_block_count;
                tracing::info!(height = from, "no block above the replaced tip, re-reading it");
                mediator.emit(ReaderEvent::Begin { height: from }).await?;
                reader.read(from).await?
            }
            other => other?,
        };
        drop(reader);

        mediator
            .emit(ReaderEvent::End { last_height_read })
            .await?;
        tracing::info!(from, last_height_read, "sync complete");
        Ok(SyncOutcome::Read {
            from,
            last_height_read,
        })
    }
}

impl<S: BlockSource + Sync + 'static> SyncDriver<S> {
    /// Sync once per tip notification until the channel closes.
    ///
    /// Each notification spawns a sync; ones arriving while a sync runs are
    /// dropped. Failed syncs are logged and the next notification retries.
    /// Returns once the channel is closed and the last sync has finished.
    pub async fn follow(self: Arc<Self>, mut notifications: mpsc::Receiver<String>) {
        let mut running: Option<JoinHandle<()>> = None;
        while let Some(tip) = notifications.recv().await {
            if running.as_ref().is_some_and(|handle| !handle.is_finished()) {
                tracing::debug!(%tip, "sync in progress, dropping tip notification");
                continue;
            }
            tracing::debug!(%tip, "new tip notification");
            let driver = self.clone();
            running = Some(tokio::spawn(async move {
                match driver.sync().await {
                    Ok(SyncOutcome::AlreadyInSync) => {}
                    Ok(outcome) => tracing::debug!(?outcome, "sync finished"),
                    Err(e) => tracing::error!(error = %e, "sync failed"),
                }
            }));
        }
        if let Some(handle) = running {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "sync task failed");
            }
        }
        tracing::info!("tip notifications closed, follow loop stopped");
    }
}
