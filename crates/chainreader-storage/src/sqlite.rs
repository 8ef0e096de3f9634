//! SQLite storage backend for ChainReader.
//!
//! Persists reader snapshots, state-view entities and state-transition
//! packets to a single SQLite file. Uses `sqlx` with WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use chainreader_storage::sqlite::SqliteStorage;
//! use chainreader_core::EntityKind;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStorage::open("./reader.db").await?;
//! let objects = store.entities(EntityKind::Object);
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chainreader_core::error::ReaderError;
use chainreader_core::query::QueryOptions;
use chainreader_core::revision::{EntityKind, EntityRepository, StateViewEntity};
use chainreader_core::snapshot::{ReaderStateRepository, ReaderStateSnapshot};
use chainreader_core::types::StPacket;
use chainreader_core::PacketStore;

fn storage_error(e: impl std::fmt::Display) -> ReaderError {
    ReaderError::Storage(e.to_string())
}

/// SQLite-backed storage for snapshots, entities and packets.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./reader.db"`) or a full
    /// SQLite URL (`"sqlite:./reader.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, ReaderError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_error)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open an in-memory SQLite database.
    ///
    /// All data is lost when the pool is dropped.
    pub async fn in_memory() -> Result<Self, ReaderError> {
        // every connection gets its own in-memory database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_error)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Repository for one entity kind, sharing this database.
    pub fn entities(&self, kind: EntityKind) -> SqliteEntityRepository {
        SqliteEntityRepository {
            pool: self.pool.clone(),
            kind,
        }
    }

    /// Create tables and enable WAL mode.
    async fn init_schema(&self) -> Result<(), ReaderError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS reader_snapshots (
                scope      TEXT NOT NULL PRIMARY KEY,
                snapshot   TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entities (
                kind                  TEXT    NOT NULL,
                id                    TEXT    NOT NULL,
                state_transition_hash TEXT    NOT NULL,
                is_deleted            INTEGER NOT NULL,
                body                  TEXT    NOT NULL,
                PRIMARY KEY (kind, id)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entities_st
             ON entities (kind, state_transition_hash);",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS packets (
                content_id TEXT    NOT NULL PRIMARY KEY,
                body       TEXT    NOT NULL,
                pinned     INTEGER NOT NULL DEFAULT 0
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        Ok(())
    }

    /// Number of pinned packets.
    pub async fn pinned_count(&self) -> Result<u64, ReaderError> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM packets WHERE pinned = 1")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_error)?;
        let cnt: i64 = row.get("cnt");
        Ok(cnt as u64)
    }
}

// ─── ReaderStateRepository impl ──────────────────────────────────────────────

#[async_trait]
impl ReaderStateRepository for SqliteStorage {
    async fn load(&self, scope: &str) -> Result<Option<ReaderStateSnapshot>, ReaderError> {
        let row = sqlx::query("SELECT snapshot FROM reader_snapshots WHERE scope = ?")
            .bind(scope)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.map(|r| {
            let body: String = r.get("snapshot");
            serde_json::from_str(&body).map_err(storage_error)
        })
        .transpose()
    }

    async fn save(&self, scope: &str, snapshot: ReaderStateSnapshot) -> Result<(), ReaderError> {
        let body = serde_json::to_string(&snapshot).map_err(storage_error)?;
        sqlx::query(
            "INSERT OR REPLACE INTO reader_snapshots (scope, snapshot, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(scope)
        .bind(&body)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        debug!(scope, blocks = snapshot.blocks.len(), "snapshot saved");
        Ok(())
    }

    async fn clear(&self, scope: &str) -> Result<(), ReaderError> {
        sqlx::query("DELETE FROM reader_snapshots WHERE scope = ?")
            .bind(scope)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

// ─── PacketStore impl ────────────────────────────────────────────────────────

#[async_trait]
impl PacketStore for SqliteStorage {
    async fn put(&self, packet: &StPacket) -> Result<String, ReaderError> {
        let content_id = packet.content_id();
        let body = serde_json::to_string(packet).map_err(storage_error)?;
        sqlx::query("INSERT OR IGNORE INTO packets (content_id, body) VALUES (?, ?)")
            .bind(&content_id)
            .bind(&body)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(content_id)
    }

    async fn get(&self, content_id: &str) -> Result<Option<StPacket>, ReaderError> {
        let row = sqlx::query("SELECT body FROM packets WHERE content_id = ?")
            .bind(content_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.map(|r| {
            let body: String = r.get("body");
            serde_json::from_str(&body).map_err(storage_error)
        })
        .transpose()
    }

    async fn pin(&self, content_id: &str) -> Result<(), ReaderError> {
        let result = sqlx::query("UPDATE packets SET pinned = 1 WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        if result.rows_affected() == 0 {
            return Err(ReaderError::Packet(format!(
                "cannot pin unknown packet {content_id}"
            )));
        }
        Ok(())
    }

    async fn unpin(&self, content_id: &str) -> Result<(), ReaderError> {
        sqlx::query("UPDATE packets SET pinned = 0 WHERE content_id = ?")
            .bind(content_id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn unpin_all(&self) -> Result<(), ReaderError> {
        sqlx::query("UPDATE packets SET pinned = 0")
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }
}

// ─── EntityRepository ────────────────────────────────────────────────────────

/// SQLite-backed [`EntityRepository`] for one entity kind.
#[derive(Clone)]
pub struct SqliteEntityRepository {
    pool: SqlitePool,
    kind: EntityKind,
}

impl SqliteEntityRepository {
    fn decode(body: &str) -> Result<StateViewEntity, ReaderError> {
        serde_json::from_str(body).map_err(storage_error)
    }
}

#[async_trait]
impl EntityRepository for SqliteEntityRepository {
    fn kind(&self) -> EntityKind {
        self.kind
    }

    async fn find(&self, id: &str) -> Result<Option<StateViewEntity>, ReaderError> {
        let row = sqlx::query("SELECT body FROM entities WHERE kind = ? AND id = ?")
            .bind(self.kind.as_str())
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_error)?;

        row.map(|r| Self::decode(&r.get::<String, _>("body")))
            .transpose()
    }

    async fn find_by_state_transition(
        &self,
        state_transition_hash: &str,
    ) -> Result<Vec<StateViewEntity>, ReaderError> {
        let rows = sqlx::query(
            "SELECT body FROM entities
             WHERE kind = ? AND state_transition_hash = ? ORDER BY id",
        )
        .bind(self.kind.as_str())
        .bind(state_transition_hash)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error)?;

        rows.iter()
            .map(|r| Self::decode(&r.get::<String, _>("body")))
            .collect()
    }

    async fn fetch(&self, query: &QueryOptions) -> Result<Vec<StateViewEntity>, ReaderError> {
        query.validate()?;
        let rows = sqlx::query("SELECT body FROM entities WHERE kind = ?")
            .bind(self.kind.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(storage_error)?;

        let entities = rows
            .iter()
            .map(|r| Self::decode(&r.get::<String, _>("body")))
            .collect::<Result<Vec<_>, _>>()?;
        query.apply(entities)
    }

    async fn store(&self, entity: StateViewEntity) -> Result<(), ReaderError> {
        if entity.kind != self.kind {
            return Err(ReaderError::Storage(format!(
                "cannot store {} in {} repository",
                entity.kind, self.kind
            )));
        }
        let body = serde_json::to_string(&entity).map_err(storage_error)?;
        sqlx::query(
            "INSERT OR REPLACE INTO entities
             (kind, id, state_transition_hash, is_deleted, body)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(self.kind.as_str())
        .bind(&entity.id)
        .bind(&entity.reference.state_transition_hash)
        .bind(entity.is_deleted)
        .bind(&body)
        .execute(&self.pool)
        .await
        .map_err(storage_error)?;

        debug!(kind = %self.kind, id = %entity.id, revision = entity.revision, "entity stored");
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), ReaderError> {
        sqlx::query("DELETE FROM entities WHERE kind = ? AND id = ?")
            .bind(self.kind.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn delete_all(&self) -> Result<(), ReaderError> {
        sqlx::query("DELETE FROM entities WHERE kind = ?")
            .bind(self.kind.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage_error)?;
        debug!(kind = %self.kind, "entities dropped");
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chainreader_core::query::SortOrder;
    use chainreader_core::types::{Block, EntityAction, EntityPayload, Reference};
    use serde_json::json;

    fn block(height: u64) -> Block {
        Block {
            height,
            hash: format!("h{height}"),
            previous_block_hash: Some(format!("h{}", height - 1)),
            next_block_hash: None,
            transaction_ids: vec![format!("tx{height}")],
        }
    }

    fn entity(kind: EntityKind, id: &str, st: &str, age: u64) -> StateViewEntity {
        StateViewEntity::new(
            kind,
            Reference {
                state_transition_hash: st.into(),
                ..Default::default()
            },
            &EntityPayload {
                id: id.into(),
                owner_id: "user".into(),
                action: EntityAction::Create,
                revision: 1,
                data: json!({ "age": age }),
            },
        )
    }

    // ── ReaderStateRepository ─────────────────────────────────────────────────

    #[tokio::test]
    async fn snapshot_roundtrip() {
        let store = SqliteStorage::in_memory().await.unwrap();
        assert!(store.load("testnet:main").await.unwrap().is_none());

        let snapshot = ReaderStateSnapshot {
            blocks: (1..=3).map(block).collect(),
            last_synced_at: Some(Utc::now()),
        };
        store.save("testnet:main", snapshot.clone()).await.unwrap();

        let loaded = store.load("testnet:main").await.unwrap().unwrap();
        assert_eq!(loaded, snapshot);
        assert!(store.load("testnet:other").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn snapshot_upsert_and_clear() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let first = ReaderStateSnapshot {
            blocks: vec![block(1)],
            last_synced_at: None,
        };
        let second = ReaderStateSnapshot {
            blocks: vec![block(1), block(2)],
            last_synced_at: None,
        };

        store.save("main", first).await.unwrap();
        store.save("main", second).await.unwrap();
        assert_eq!(store.load("main").await.unwrap().unwrap().blocks.len(), 2);

        store.clear("main").await.unwrap();
        assert!(store.load("main").await.unwrap().is_none());
    }

    // ── EntityRepository ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn entities_are_scoped_by_kind() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let objects = store.entities(EntityKind::Object);
        let contracts = store.entities(EntityKind::Contract);

        objects.store(entity(EntityKind::Object, "x", "st1", 1)).await.unwrap();
        contracts.store(entity(EntityKind::Contract, "x", "st1", 2)).await.unwrap();

        assert_eq!(objects.find("x").await.unwrap().unwrap().data, json!({"age": 1}));
        assert_eq!(contracts.find("x").await.unwrap().unwrap().data, json!({"age": 2}));
        assert!(objects
            .store(entity(EntityKind::Contract, "y", "st1", 0))
            .await
            .is_err());

        objects.delete_all().await.unwrap();
        assert!(objects.find("x").await.unwrap().is_none());
        assert!(contracts.find("x").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn find_by_state_transition_and_query() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let objects = store.entities(EntityKind::Object);
        for (id, st, age) in [("a", "st1", 30), ("b", "st2", 20), ("c", "st1", 10)] {
            objects.store(entity(EntityKind::Object, id, st, age)).await.unwrap();
        }

        let by_st = objects.find_by_state_transition("st1").await.unwrap();
        let ids: Vec<_> = by_st.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);

        let query = QueryOptions::new().order_by("age", SortOrder::Asc).limit(2);
        let page = objects.fetch(&query).await.unwrap();
        let ids: Vec<_> = page.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b"]);

        let bad = QueryOptions::new().start_at(1).start_after(1);
        assert!(matches!(objects.fetch(&bad).await, Err(ReaderError::InvalidQuery(_))));

        objects.delete("a").await.unwrap();
        assert_eq!(objects.find_by_state_transition("st1").await.unwrap().len(), 1);
    }

    // ── PacketStore ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn packets_pin_and_unpin() {
        let store = SqliteStorage::in_memory().await.unwrap();
        let packet = StPacket::default();
        let id = store.put(&packet).await.unwrap();
        assert_eq!(store.put(&packet).await.unwrap(), id);
        assert_eq!(store.get(&id).await.unwrap(), Some(packet));

        assert!(store.pin("unknown").await.is_err());
        store.pin(&id).await.unwrap();
        assert_eq!(store.pinned_count().await.unwrap(), 1);

        store.unpin_all().await.unwrap();
        assert_eq!(store.pinned_count().await.unwrap(), 0);
    }
}
