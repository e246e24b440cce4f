//! Similarity store: embedding vectors scoped by collection, searched by
//! cosine distance.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::embedding::{cosine_distance, decode_f32, encode_f32};
use crate::schema::VECTOR_SCHEMA_SQL;
use closet_core::{now_millis, Error, Result};

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Neighbor {
    pub id: String,
    /// Cosine distance, smaller is closer.
    pub distance: f32,
}

/// Vector storage used for catalog lookups.
pub trait SimilarityStore: Send + Sync {
    /// Insert or replace the vector stored under `id`.
    fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        metadata: Option<&serde_json::Value>,
    ) -> Result<()>;

    fn contains(&self, collection: &str, id: &str) -> Result<bool>;

    /// Closest `top_k` vectors, nearest first.
    fn query(&self, collection: &str, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>>;
}

/// Brute-force similarity store on SQLite.
pub struct SqliteVectorStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl SqliteVectorStore {
    /// Open or create the store at `db_dir/vectors.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("vectors.db");

        let conn = Connection::open(&db_path).map_err(Error::from)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .map_err(Error::from)?;
        conn.execute_batch(VECTOR_SCHEMA_SQL)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;

        info!("SqliteVectorStore initialized: path={}", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
            db_path,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of vectors in a collection.
    pub fn count(&self, collection: &str) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM vectors WHERE collection = ?1",
                params![collection],
                |row| row.get(0),
            )
            .map_err(Error::from)?;
        Ok(n as usize)
    }
}

impl SimilarityStore for SqliteVectorStore {
    fn upsert(
        &self,
        collection: &str,
        id: &str,
        vector: &[f32],
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::Validation(format!("empty vector for {}", id)));
        }
        let metadata_json = metadata.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO vectors (collection, id, embedding, dim, metadata_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(collection, id) DO UPDATE SET \
             embedding = excluded.embedding, dim = excluded.dim, metadata_json = excluded.metadata_json",
            params![
                collection,
                id,
                encode_f32(vector),
                vector.len() as i64,
                metadata_json,
                now_millis()
            ],
        )
        .map_err(Error::from)?;
        debug!("Upserted vector {} into {}", id, collection);
        Ok(())
    }

    fn contains(&self, collection: &str, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM vectors WHERE collection = ?1 AND id = ?2",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)?;
        Ok(found.is_some())
    }

    fn query(&self, collection: &str, vector: &[f32], top_k: usize) -> Result<Vec<Neighbor>> {
        if top_k == 0 || vector.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT id, embedding FROM vectors WHERE collection = ?1 AND dim = ?2")
            .map_err(Error::from)?;
        let rows = stmt
            .query_map(params![collection, vector.len() as i64], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })
            .map_err(Error::from)?;

        let mut scored = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(Error::from)?;
            match cosine_distance(vector, &decode_f32(&blob)) {
                Some(distance) => scored.push(Neighbor { id, distance }),
                None => warn!("Skipping unusable vector {} in {}", id, collection),
            }
        }

        scored.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        scored.truncate(top_k);
        Ok(scored)
    }
}
