//! Persists the synced block window so a reader can resume.
//!
//! A snapshot stores the recently synced blocks plus the time of the last
//! save. On startup the reader state is seeded from it so the sync driver can
//! pick up where the previous process stopped.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReaderError, Signal};
use crate::mediator::{EventKind, ReaderEvent, ReaderEventHandler, ReaderMediator};
use crate::state::ReaderState;
use crate::types::Block;

/// Persisted form of a [`ReaderState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReaderStateSnapshot {
    /// Synced blocks, oldest first.
    pub blocks: Vec<Block>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ReaderStateSnapshot {
    pub fn last_block(&self) -> Option<&Block> {
        self.blocks.last()
    }
}

/// Trait for storing and loading reader snapshots.
///
/// `scope` names the indexing scope (one reader per scope).
#[async_trait]
pub trait ReaderStateRepository: Send + Sync {
    async fn load(&self, scope: &str) -> Result<Option<ReaderStateSnapshot>, ReaderError>;

    /// Save (upsert) the snapshot.
    async fn save(&self, scope: &str, snapshot: ReaderStateSnapshot) -> Result<(), ReaderError>;

    /// Delete the snapshot (on reset).
    async fn clear(&self, scope: &str) -> Result<(), ReaderError>;
}

/// Load the persisted state for `scope`, or an empty one.
pub async fn load_state(
    repository: &dyn ReaderStateRepository,
    scope: &str,
    blocks_limit: usize,
) -> Result<ReaderState, ReaderError> {
    match repository.load(scope).await? {
        Some(snapshot) => {
            let state = ReaderState::from_snapshot(&snapshot, blocks_limit)?;
            tracing::info!(
                scope,
                blocks = state.blocks_count(),
                current_height = state.current_height(),
                last_synced_at = ?snapshot.last_synced_at,
                "loaded reader snapshot"
            );
            Ok(state)
        }
        None => Ok(ReaderState::new(blocks_limit)),
    }
}

/// Mediator subscriber that keeps the persisted snapshot current.
///
/// Saves every `save_interval` folded blocks and always at the end of a read;
/// clears the snapshot on reset.
pub struct SnapshotPersister {
    repository: Arc<dyn ReaderStateRepository>,
    scope: String,
    save_interval: u64,
    /// Blocks folded since the last save.
    counter: AtomicU64,
}

impl SnapshotPersister {
    pub fn new(
        repository: Arc<dyn ReaderStateRepository>,
        scope: impl Into<String>,
        save_interval: u64,
    ) -> Self {
        Self {
            repository,
            scope: scope.into(),
            save_interval: save_interval.max(1),
            counter: AtomicU64::new(0),
        }
    }

    /// Subscribe to `BlockEnd`, `End` and `Reset`.
    pub fn attach(self: Arc<Self>, mediator: &mut ReaderMediator) {
        mediator.on_many(
            &[EventKind::BlockEnd, EventKind::End, EventKind::Reset],
            self,
        );
    }

    /// Save the mediator's current state immediately.
    pub async fn force_save(&self, mediator: &ReaderMediator) -> Result<(), ReaderError> {
        let snapshot = mediator.state().snapshot();
        tracing::debug!(
            scope = %self.scope,
            blocks = snapshot.blocks.len(),
            "saving reader snapshot"
        );
        self.repository.save(&self.scope, snapshot).await?;
        self.counter.store(0, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ReaderEventHandler for SnapshotPersister {
    async fn handle(&self, event: &ReaderEvent, mediator: &ReaderMediator) -> Result<(), Signal> {
        match event {
            ReaderEvent::BlockEnd(_) => {
                let folded = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
                if folded >= self.save_interval {
                    self.force_save(mediator).await?;
                }
            }
            ReaderEvent::End { .. } => self.force_save(mediator).await?,
            ReaderEvent::Reset => {
                self.counter.store(0, Ordering::SeqCst);
                self.repository.clear(&self.scope).await?;
            }
            _ => {}
        }
        Ok(())
    }
}

// ─── In-memory repository (for testing) ───────────────────────────────────────

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// In-memory snapshot repository for tests and ephemeral readers.
#[derive(Default)]
pub struct MemoryReaderStateRepository {
    data: Mutex<HashMap<String, ReaderStateSnapshot>>,
}

impl MemoryReaderStateRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReaderStateRepository for MemoryReaderStateRepository {
    async fn load(&self, scope: &str) -> Result<Option<ReaderStateSnapshot>, ReaderError> {
        Ok(self
            .data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned())
    }

    async fn save(&self, scope: &str, snapshot: ReaderStateSnapshot) -> Result<(), ReaderError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope.to_string(), snapshot);
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<(), ReaderError> {
        self.data
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(scope);
        Ok(())
    }
}
