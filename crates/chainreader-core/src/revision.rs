//! Projected contracts and objects that can be rolled back to any earlier
//! revision.
//!
//! Every entity keeps `previous_revisions`, one `{revision, reference}` entry
//! per superseded version. Reverting a state transition re-applies the
//! highest previous revision from its reference, or marks the entity deleted
//! when nothing precedes it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ReaderError;
use crate::query::QueryOptions;
use crate::types::{Block, EntityAction, EntityPayload, Reference, StateTransitionHeader};

/// Which projection an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Contract,
    Object,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Contract => "contract",
            Self::Object => "object",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A superseded version of an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision {
    pub revision: u64,
    pub reference: Reference,
}

/// A projected contract or object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateViewEntity {
    pub kind: EntityKind,
    pub id: String,
    pub owner_id: String,
    pub data: Value,
    pub reference: Reference,
    pub revision: u64,
    pub is_deleted: bool,
    /// Newest first on write; sort before relying on the order.
    pub previous_revisions: Vec<Revision>,
}

impl StateViewEntity {
    /// A fresh entity with no history.
    pub fn new(kind: EntityKind, reference: Reference, payload: &EntityPayload) -> Self {
        Self {
            kind,
            id: payload.id.clone(),
            owner_id: payload.owner_id.clone(),
            data: payload.data.clone(),
            reference,
            revision: payload.revision,
            is_deleted: false,
            previous_revisions: Vec::new(),
        }
    }

    /// `previous_revisions` ordered by revision, highest first.
    pub fn sorted_revisions(&self) -> Vec<Revision> {
        let mut revisions = self.previous_revisions.clone();
        revisions.sort_by(|a, b| b.revision.cmp(&a.revision));
        revisions
    }
}

/// Document-store repository for one [`EntityKind`].
#[async_trait]
pub trait EntityRepository: Send + Sync {
    fn kind(&self) -> EntityKind;

    async fn find(&self, id: &str) -> Result<Option<StateViewEntity>, ReaderError>;

    /// Entities whose current reference points at `state_transition_hash`.
    async fn find_by_state_transition(
        &self,
        state_transition_hash: &str,
    ) -> Result<Vec<StateViewEntity>, ReaderError>;

    /// Query entities. Fails with [`ReaderError::InvalidQuery`] on bad options.
    async fn fetch(&self, query: &QueryOptions) -> Result<Vec<StateViewEntity>, ReaderError>;

    /// Upsert by id.
    async fn store(&self, entity: StateViewEntity) -> Result<(), ReaderError>;

    async fn delete(&self, id: &str) -> Result<(), ReaderError>;

    /// Drop every entity of this kind.
    async fn delete_all(&self) -> Result<(), ReaderError>;
}

/// Applies state transitions to the projections.
#[async_trait]
pub trait StateTransitionApplier: Send + Sync {
    async fn apply(
        &self,
        state_transition: &StateTransitionHeader,
        block: &Block,
    ) -> Result<(), ReaderError>;

    /// Re-fetch the block and transition `reference` points at and re-apply
    /// the referenced entity.
    async fn apply_from_reference(
        &self,
        reference: &Reference,
        is_revert: bool,
    ) -> Result<(), ReaderError>;
}

/// What a revert did to one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RevertOutcome {
    /// No earlier revision existed.
    MarkedDeleted { id: String },
    /// Rolled back; `revision` is the new current revision.
    Reverted { id: String, revision: u64 },
}

/// Apply and revert logic over one repository.
pub struct RevisionChain {
    repository: Arc<dyn EntityRepository>,
}

impl RevisionChain {
    pub fn new(repository: Arc<dyn EntityRepository>) -> Self {
        Self { repository }
    }

    pub fn kind(&self) -> EntityKind {
        self.repository.kind()
    }

    pub fn repository(&self) -> &Arc<dyn EntityRepository> {
        &self.repository
    }

    /// Apply one packet entry.
    ///
    /// With `is_revert`, revisions at or above the re-applied one are dropped
    /// from history instead of the current version being pushed onto it.
    pub async fn apply(
        &self,
        reference: Reference,
        payload: &EntityPayload,
        is_revert: bool,
    ) -> Result<(), ReaderError> {
        let kind = self.kind();
        if payload.action == EntityAction::Create {
            tracing::debug!(%kind, id = %payload.id, revision = payload.revision, "create");
            return self
                .repository
                .store(StateViewEntity::new(kind, reference, payload))
                .await;
        }

        let Some(mut entity) = self.repository.find(&payload.id).await? else {
            tracing::debug!(%kind, id = %payload.id, action = ?payload.action, "entity not found, skipping");
            return Ok(());
        };

        // replay of an already applied entry after a restart
        if !is_revert && entity.revision == payload.revision && entity.reference == reference {
            return Ok(());
        }

        if is_revert {
            entity
                .previous_revisions
                .retain(|r| r.revision < payload.revision);
        } else {
            entity.previous_revisions.insert(
                0,
                Revision {
                    revision: entity.revision,
                    reference: entity.reference.clone(),
                },
            );
        }

        entity.reference = reference;
        entity.revision = payload.revision;
        match payload.action {
            EntityAction::Delete => entity.is_deleted = true,
            _ => {
                entity.data = payload.data.clone();
                entity.owner_id = payload.owner_id.clone();
                entity.is_deleted = false;
            }
        }
        tracing::debug!(%kind, id = %entity.id, revision = entity.revision, action = ?payload.action, is_revert, "applied");
        self.repository.store(entity).await
    }

    /// Roll back every entity last written by `state_transition_hash`.
    pub async fn revert(
        &self,
        state_transition_hash: &str,
        applier: &dyn StateTransitionApplier,
    ) -> Result<Vec<RevertOutcome>, ReaderError> {
        let kind = self.kind();
        let entities = self
            .repository
            .find_by_state_transition(state_transition_hash)
            .await?;

        let mut outcomes = Vec::with_capacity(entities.len());
        for mut entity in entities {
            match entity.sorted_revisions().into_iter().next() {
                None => {
                    entity.is_deleted = true;
                    let id = entity.id.clone();
                    self.repository.store(entity).await?;
                    tracing::info!(%kind, %id, state_transition = state_transition_hash, "marked deleted");
                    outcomes.push(RevertOutcome::MarkedDeleted { id });
                }
                Some(previous) => {
                    applier
                        .apply_from_reference(&previous.reference, true)
                        .await?;
                    tracing::info!(
                        %kind,
                        id = %entity.id,
                        revision = previous.revision,
                        state_transition = state_transition_hash,
                        "reverted"
                    );
                    outcomes.push(RevertOutcome::Reverted {
                        id: entity.id,
                        revision: previous.revision,
                    });
                }
            }
        }
        Ok(outcomes)
    }
}

// ─── In-memory repository (for testing) ───────────────────────────────────────

/// In-memory entity repository for tests and ephemeral readers.
pub struct MemoryEntityRepository {
    kind: EntityKind,
    entities: Mutex<HashMap<String, StateViewEntity>>,
}

impl MemoryEntityRepository {
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entities: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, StateViewEntity>> {
        self.entities.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl EntityRepository for MemoryEntityRepository {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn find(&self, id: &str) -> Result<Option<StateViewEntity>, ReaderError> {
        Ok(self.lock().get(id).cloned())
    }

    async fn find_by_state_transition(
        &self,
        state_transition_hash: &str,
    ) -> Result<Vec<StateViewEntity>, ReaderError> {
        let mut found: Vec<_> = self
            .lock()
            .values()
            .filter(|e| e.reference.state_transition_hash == state_transition_hash)
            .cloned()
            .collect();
        found.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(found)
    }

    async fn fetch(&self, query: &QueryOptions) -> Result<Vec<StateViewEntity>, ReaderError> {
        let all: Vec<_> = self.lock().values().cloned().collect();
        query.apply(all)
    }

    async fn store(&self, entity: StateViewEntity) -> Result<(), ReaderError> {
        if entity.kind != self.kind {
            return Err(ReaderError::Storage(format!(
                "cannot store {} in {} repository",
                entity.kind, self.kind
            )));
        }
        self.lock().insert(entity.id.clone(), entity);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ReaderError> {
        self.lock().remove(id);
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ReaderError> {
        self.lock().clear();
        Ok(())
    }
}
