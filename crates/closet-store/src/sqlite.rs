//! SQLite catalog store: products, images and crops, jobs, and job results.
//!
//! Every public write runs in its own transaction. Writes that are unsafe to
//! apply twice (crop sets, product links, result rows) check for the natural
//! key first, so a redelivered stage finds its earlier work instead of
//! duplicating it.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::embedding::{decode_f32, encode_f32};
use crate::schema::{CATALOG_SCHEMA_SQL, JOB_SCHEMA_SQL};
use crate::types::*;
use closet_core::{now_millis, Error, Result};

/// SQLite store for catalog and job records.
pub struct CatalogStore {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl CatalogStore {
    /// Open or create the store. The file will be `db_dir/catalog.db`.
    pub fn open(db_dir: impl AsRef<Path>) -> Result<Self> {
        let db_dir = db_dir.as_ref();
        std::fs::create_dir_all(db_dir).map_err(|e| Error::Storage(e.to_string()))?;
        let db_path = db_dir.join("catalog.db");

        let conn = Self::create_connection(&db_path)?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            db_path,
        };
        info!("CatalogStore initialized: path={}", store.db_path.display());
        Ok(store)
    }

    fn create_connection(db_path: &Path) -> Result<Connection> {
        let conn = Connection::open(db_path).map_err(db_err)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(db_err)?;
        Ok(conn)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        let full_schema = format!("{}\n{}", CATALOG_SCHEMA_SQL, JOB_SCHEMA_SQL);
        conn.execute_batch(&full_schema)
            .map_err(|e| Error::Database(format!("Schema init failed: {}", e)))?;
        Ok(())
    }

    // ---------------------------------------------------------------
    // Products
    // ---------------------------------------------------------------

    /// Insert a product.
    pub fn add_product(&self, new: NewProduct) -> Result<Product> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("product name must not be empty".into()));
        }
        let product = Product {
            id: Uuid::new_v4(),
            sku: new.sku,
            name: new.name,
            description: new.description,
            price_cents: new.price_cents,
            created_at: now_millis(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO products (id, sku, name, description, price_cents, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                product.id.to_string(),
                product.sku,
                product.name,
                product.description,
                product.price_cents,
                product.created_at,
            ],
        )
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint") {
                Error::Validation(format!(
                    "duplicate sku {}",
                    product.sku.clone().unwrap_or_default()
                ))
            } else {
                db_err(e)
            }
        })?;
        Ok(product)
    }

    pub fn get_product(&self, product_id: Uuid) -> Result<Option<Product>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached("SELECT * FROM products WHERE id = ?1")
            .map_err(db_err)?;
        let product = stmt
            .query_row(params![product_id.to_string()], row_to_product)
            .optional()
            .map_err(db_err);
        product
    }

    // ---------------------------------------------------------------
    // Images and crops
    // ---------------------------------------------------------------

    /// Insert an original (uploaded) image.
    pub fn add_image(&self, new: NewImage) -> Result<Image> {
        let now = now_millis();
        let image = Image {
            id: Uuid::new_v4(),
            bucket: new.bucket,
            path: new.path,
            filename: new.filename,
            width: new.width,
            height: new.height,
            format: new.format,
            label: None,
            embedding: None,
            original_id: None,
            crop_index: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock();
        insert_image(&conn, &image)?;
        Ok(image)
    }

    pub fn get_image(&self, image_id: Uuid) -> Result<Option<Image>> {
        let conn = self.conn.lock();
        get_image_in(&conn, image_id)
    }

    /// Crops of an original image, ordered by detection index.
    pub fn get_crops(&self, original_id: Uuid) -> Result<Vec<Image>> {
        let conn = self.conn.lock();
        get_crops_in(&conn, original_id)
    }

    /// Insert the full crop set of an original image in one transaction.
    ///
    /// If the original already has crops they are returned unchanged and
    /// nothing is inserted. The original must itself be a root image.
    pub fn add_crops(&self, original_id: Uuid, crops: Vec<NewImage>) -> Result<Vec<Image>> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;

        let original = get_image_in(&tx, original_id)?
            .ok_or_else(|| Error::NotFound(format!("image {}", original_id)))?;
        if original.is_crop() {
            return Err(Error::Validation(format!(
                "image {} is a crop and cannot own crops",
                original_id
            )));
        }

        let existing = get_crops_in(&tx, original_id)?;
        if !existing.is_empty() {
            debug!(
                "Image {} already has {} crops, skipping insert",
                original_id,
                existing.len()
            );
            return Ok(existing);
        }

        let now = now_millis();
        let mut created = Vec::with_capacity(crops.len());
        for (idx, new) in crops.into_iter().enumerate() {
            let crop = Image {
                id: Uuid::new_v4(),
                bucket: new.bucket,
                path: new.path,
                filename: new.filename,
                width: new.width,
                height: new.height,
                format: new.format,
                label: None,
                embedding: None,
                original_id: Some(original_id),
                crop_index: Some(idx as u32),
                created_at: now,
                updated_at: now,
            };
            insert_image(&tx, &crop)?;
            created.push(crop);
        }
        tx.commit().map_err(db_err)?;
        Ok(created)
    }

    /// Write the label and embedding of a crop. Overwrites earlier values.
    pub fn set_crop_label(
        &self,
        crop_id: Uuid,
        label: &StructuredLabel,
        embedding: &[f32],
    ) -> Result<()> {
        let label_json = serde_json::to_string(label)?;
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE images SET label_json = ?1, embedding = ?2, updated_at = ?3 \
                 WHERE id = ?4 AND original_id IS NOT NULL",
                params![label_json, encode_f32(embedding), now_millis(), crop_id.to_string()],
            )
            .map_err(db_err)?;
        if count == 0 {
            return Err(Error::NotFound(format!("crop {}", crop_id)));
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Product links
    // ---------------------------------------------------------------

    /// Link an image to a product unless the pair is already linked.
    ///
    /// Returns `true` when a new link was created.
    pub fn link_product_image(
        &self,
        product_id: Uuid,
        image_id: Uuid,
        is_primary: bool,
    ) -> Result<bool> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let exists: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM product_images WHERE product_id = ?1 AND image_id = ?2)",
                params![product_id.to_string(), image_id.to_string()],
                |row| row.get(0),
            )
            .map_err(db_err)?;
        if exists {
            return Ok(false);
        }
        tx.execute(
            "INSERT INTO product_images (product_id, image_id, is_primary, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                product_id.to_string(),
                image_id.to_string(),
                is_primary,
                now_millis()
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(true)
    }

    pub fn get_product_images(&self, product_id: Uuid) -> Result<Vec<ProductImage>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT product_id, image_id, is_primary FROM product_images \
                 WHERE product_id = ?1 ORDER BY created_at",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![product_id.to_string()], |row| {
                Ok(ProductImage {
                    product_id: uuid_col(row, "product_id")?,
                    image_id: uuid_col(row, "image_id")?,
                    is_primary: row.get("is_primary")?,
                })
            })
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // ---------------------------------------------------------------
    // Jobs
    // ---------------------------------------------------------------

    /// Create a job in `Queued`.
    ///
    /// Indexing jobs require a product; querying jobs must not carry one.
    pub fn create_job(
        &self,
        job_type: JobType,
        input_image_id: Uuid,
        input_product_id: Option<Uuid>,
    ) -> Result<Job> {
        match (job_type, input_product_id) {
            (JobType::Indexing, None) => {
                return Err(Error::Validation("indexing job requires a product".into()))
            }
            (JobType::Querying, Some(_)) => {
                return Err(Error::Validation("querying job must not carry a product".into()))
            }
            _ => {}
        }
        let now = now_millis();
        let job = Job {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Queued,
            input_image_id,
            input_product_id,
            processing_details: Some("Job queued for processing".to_string()),
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (id, job_type, status, input_image_id, input_product_id, \
             processing_details, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                job.id.to_string(),
                job.job_type.as_str(),
                job.status.as_str(),
                job.input_image_id.to_string(),
                job.input_product_id.map(|p| p.to_string()),
                job.processing_details,
                job.created_at,
                job.updated_at,
            ],
        )
        .map_err(db_err)?;
        Ok(job)
    }

    pub fn get_job(&self, job_id: Uuid) -> Result<Option<Job>> {
        let conn = self.conn.lock();
        get_job_in(&conn, job_id)
    }

    /// List jobs, newest first.
    pub fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT * FROM jobs \
                 WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR job_type = ?2) \
                 ORDER BY created_at DESC, id LIMIT ?3 OFFSET ?4",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    filter.status.map(|s| s.as_str()),
                    filter.job_type.map(|t| t.as_str()),
                    filter.limit as i64,
                    filter.offset as i64,
                ],
                row_to_job,
            )
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// The only write path for job status and progress messages.
    ///
    /// Terminal jobs and backward moves are left untouched and reported as
    /// [`StatusUpdate::Ignored`]. A status outside the job's branch is an error.
    pub fn update_job_status(
        &self,
        job_id: Uuid,
        status: JobStatus,
        message: &str,
    ) -> Result<StatusUpdate> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let job = get_job_in(&tx, job_id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", job_id)))?;

        if !status.allowed_for(job.job_type) {
            return Err(Error::InvalidTransition {
                from: job.status.to_string(),
                to: format!("{} ({} job)", status, job.job_type),
            });
        }
        if !job.status.can_advance_to(status) {
            debug!(
                "Job {}: ignoring status write {} -> {}",
                job_id, job.status, status
            );
            return Ok(StatusUpdate::Ignored);
        }

        tx.execute(
            "UPDATE jobs SET status = ?1, processing_details = ?2, updated_at = ?3 WHERE id = ?4",
            params![status.as_str(), message, now_millis(), job_id.to_string()],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(StatusUpdate::Applied)
    }

    // ---------------------------------------------------------------
    // Indexing results
    // ---------------------------------------------------------------

    /// Record the outcome of an indexing job, or return the existing record.
    pub fn get_or_create_indexing_result(
        &self,
        job_id: Uuid,
        selected_crop_id: Uuid,
        created_crop_ids: &[Uuid],
        model_version: &str,
    ) -> Result<IndexingResult> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        if let Some(existing) = get_indexing_result_in(&tx, job_id)? {
            return Ok(existing);
        }
        let result = IndexingResult {
            id: Uuid::new_v4(),
            job_id,
            selected_crop_id,
            created_crop_ids: created_crop_ids.to_vec(),
            model_version: model_version.to_string(),
            created_at: now_millis(),
        };
        tx.execute(
            "INSERT INTO indexing_results (id, job_id, selected_crop_id, created_crop_ids_json, \
             model_version, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.id.to_string(),
                job_id.to_string(),
                selected_crop_id.to_string(),
                serde_json::to_string(&result.created_crop_ids)?,
                result.model_version,
                result.created_at,
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(result)
    }

    pub fn get_indexing_result(&self, job_id: Uuid) -> Result<Option<IndexingResult>> {
        let conn = self.conn.lock();
        get_indexing_result_in(&conn, job_id)
    }

    // ---------------------------------------------------------------
    // Query results
    // ---------------------------------------------------------------

    /// Parent record for a querying job's matches; created on first call.
    pub fn get_or_create_query_result(&self, job_id: Uuid, model_version: &str) -> Result<QueryResult> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        if let Some(existing) = get_query_result_in(&tx, job_id)? {
            return Ok(existing);
        }
        let result = QueryResult {
            id: Uuid::new_v4(),
            job_id,
            model_version: model_version.to_string(),
            created_at: now_millis(),
        };
        tx.execute(
            "INSERT INTO query_results (id, job_id, model_version, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                result.id.to_string(),
                job_id.to_string(),
                result.model_version,
                result.created_at
            ],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(result)
    }

    pub fn get_query_result(&self, job_id: Uuid) -> Result<Option<QueryResult>> {
        let conn = self.conn.lock();
        get_query_result_in(&conn, job_id)
    }

    /// Record the ranked matches of one queried crop.
    ///
    /// Ranks must be `1..=n` in order. If the crop already has a cloth row
    /// under this query result, its id is returned with `false` and nothing
    /// is written.
    pub fn record_cloth_matches(
        &self,
        query_result_id: Uuid,
        crop_id: Uuid,
        label: Option<&StructuredLabel>,
        matches: &[QueryResultProductImage],
    ) -> Result<(Uuid, bool)> {
        for (i, m) in matches.iter().enumerate() {
            if m.rank != i as u32 + 1 {
                return Err(Error::Validation(format!(
                    "match ranks must be dense from 1, got {} at position {}",
                    m.rank, i
                )));
            }
        }
        let label_json = label.map(serde_json::to_string).transpose()?;

        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM query_result_cloths WHERE query_result_id = ?1 AND crop_id = ?2",
                params![query_result_id.to_string(), crop_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        if let Some(id) = existing {
            let id = Uuid::parse_str(&id).map_err(|e| Error::Database(e.to_string()))?;
            return Ok((id, false));
        }

        let cloth_id = Uuid::new_v4();
        tx.execute(
            "INSERT INTO query_result_cloths (id, query_result_id, crop_id, label_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                cloth_id.to_string(),
                query_result_id.to_string(),
                crop_id.to_string(),
                label_json,
                now_millis()
            ],
        )
        .map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO query_result_product_images (cloth_id, matched_image_id, score, rank) \
                     VALUES (?1, ?2, ?3, ?4)",
                )
                .map_err(db_err)?;
            for m in matches {
                stmt.execute(params![
                    cloth_id.to_string(),
                    m.matched_image_id.to_string(),
                    m.score as f64,
                    m.rank
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok((cloth_id, true))
    }

    /// All cloths of a query result with their matches ordered by rank.
    pub fn get_query_cloths(&self, query_result_id: Uuid) -> Result<Vec<QueryResultCloth>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, query_result_id, crop_id, label_json FROM query_result_cloths \
                 WHERE query_result_id = ?1 ORDER BY created_at, id",
            )
            .map_err(db_err)?;
        let cloths = stmt
            .query_map(params![query_result_id.to_string()], |row| {
                Ok(QueryResultCloth {
                    id: uuid_col(row, "id")?,
                    query_result_id: uuid_col(row, "query_result_id")?,
                    crop_id: uuid_col(row, "crop_id")?,
                    label: json_col(row, "label_json")?,
                    matches: Vec::new(),
                })
            })
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;

        let mut match_stmt = conn
            .prepare_cached(
                "SELECT matched_image_id, score, rank FROM query_result_product_images \
                 WHERE cloth_id = ?1 ORDER BY rank",
            )
            .map_err(db_err)?;
        let mut out = Vec::with_capacity(cloths.len());
        for mut cloth in cloths {
            cloth.matches = match_stmt
                .query_map(params![cloth.id.to_string()], |row| {
                    let score: f64 = row.get("score")?;
                    Ok(QueryResultProductImage {
                        matched_image_id: uuid_col(row, "matched_image_id")?,
                        score: score as f32,
                        rank: row.get("rank")?,
                    })
                })
                .map_err(db_err)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(db_err)?;
            out.push(cloth);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------

fn db_err(e: rusqlite::Error) -> Error {
    Error::from(e)
}

fn insert_image(conn: &Connection, image: &Image) -> Result<()> {
    conn.execute(
        "INSERT INTO images (id, bucket, path, filename, width, height, format, label_json, \
         embedding, original_id, crop_index, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, NULL, ?8, ?9, ?10, ?11)",
        params![
            image.id.to_string(),
            image.bucket,
            image.path,
            image.filename,
            image.width,
            image.height,
            image.format,
            image.original_id.map(|o| o.to_string()),
            image.crop_index,
            image.created_at,
            image.updated_at,
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn get_image_in(conn: &Connection, image_id: Uuid) -> Result<Option<Image>> {
    conn.prepare_cached("SELECT * FROM images WHERE id = ?1")
        .map_err(db_err)?
        .query_row(params![image_id.to_string()], row_to_image)
        .optional()
        .map_err(db_err)
}

fn get_crops_in(conn: &Connection, original_id: Uuid) -> Result<Vec<Image>> {
    let mut stmt = conn
        .prepare_cached("SELECT * FROM images WHERE original_id = ?1 ORDER BY crop_index")
        .map_err(db_err)?;
    let rows = stmt
        .query_map(params![original_id.to_string()], row_to_image)
        .map_err(db_err)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
}

fn get_job_in(conn: &Connection, job_id: Uuid) -> Result<Option<Job>> {
    conn.prepare_cached("SELECT * FROM jobs WHERE id = ?1")
        .map_err(db_err)?
        .query_row(params![job_id.to_string()], row_to_job)
        .optional()
        .map_err(db_err)
}

fn get_indexing_result_in(conn: &Connection, job_id: Uuid) -> Result<Option<IndexingResult>> {
    conn.prepare_cached("SELECT * FROM indexing_results WHERE job_id = ?1")
        .map_err(db_err)?
        .query_row(params![job_id.to_string()], |row| {
            let ids: Vec<Uuid> = json_col(row, "created_crop_ids_json")?.unwrap_or_default();
            Ok(IndexingResult {
                id: uuid_col(row, "id")?,
                job_id: uuid_col(row, "job_id")?,
                selected_crop_id: uuid_col(row, "selected_crop_id")?,
                created_crop_ids: ids,
                model_version: row.get("model_version")?,
                created_at: row.get("created_at")?,
            })
        })
        .optional()
        .map_err(db_err)
}

fn get_query_result_in(conn: &Connection, job_id: Uuid) -> Result<Option<QueryResult>> {
    conn.prepare_cached("SELECT * FROM query_results WHERE job_id = ?1")
        .map_err(db_err)?
        .query_row(params![job_id.to_string()], |row| {
            Ok(QueryResult {
                id: uuid_col(row, "id")?,
                job_id: uuid_col(row, "job_id")?,
                model_version: row.get("model_version")?,
                created_at: row.get("created_at")?,
            })
        })
        .optional()
        .map_err(db_err)
}

// ---------------------------------------------------------------
// Row Mapping Helpers
// ---------------------------------------------------------------

fn conversion_err<E>(e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
}

fn uuid_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(col)?;
    Uuid::parse_str(&raw).map_err(conversion_err)
}

fn opt_uuid_col(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<Uuid>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| Uuid::parse_str(&s).map_err(conversion_err))
        .transpose()
}

fn json_col<T: serde::de::DeserializeOwned>(row: &Row<'_>, col: &str) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(col)?;
    raw.map(|s| serde_json::from_str(&s).map_err(conversion_err))
        .transpose()
}

fn row_to_product(row: &Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: uuid_col(row, "id")?,
        sku: row.get("sku")?,
        name: row.get("name")?,
        description: row.get("description")?,
        price_cents: row.get("price_cents")?,
        created_at: row.get("created_at")?,
    })
}

fn row_to_image(row: &Row<'_>) -> rusqlite::Result<Image> {
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(Image {
        id: uuid_col(row, "id")?,
        bucket: row.get("bucket")?,
        path: row.get("path")?,
        filename: row.get("filename")?,
        width: row.get("width")?,
        height: row.get("height")?,
        format: row.get("format")?,
        label: json_col(row, "label_json")?,
        embedding: embedding.map(|b| decode_f32(&b)),
        original_id: opt_uuid_col(row, "original_id")?,
        crop_index: row.get("crop_index")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
    let job_type: String = row.get("job_type")?;
    let status: String = row.get("status")?;
    Ok(Job {
        id: uuid_col(row, "id")?,
        job_type: job_type.parse().map_err(conversion_err)?,
        status: status.parse().map_err(conversion_err)?,
        input_image_id: uuid_col(row, "input_image_id")?,
        input_product_id: opt_uuid_col(row, "input_product_id")?,
        processing_details: row.get("processing_details")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (CatalogStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = CatalogStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn upload(store: &CatalogStore) -> Image {
        store
            .add_image(NewImage {
                bucket: "images".into(),
                path: "uploads/a.png".into(),
                filename: "a.png".into(),
                ..Default::default()
            })
            .unwrap()
    }

    fn crop_specs(n: usize) -> Vec<NewImage> {
        (0..n)
            .map(|i| NewImage {
                bucket: "images".into(),
                path: format!("crops/x/{}.png", i),
                filename: format!("{}.png", i),
                format: Some("PNG".into()),
                ..Default::default()
            })
            .collect()
    }

    fn label() -> StructuredLabel {
        StructuredLabel {
            category: "jeans".into(),
            color: "blue".into(),
            style: "casual".into(),
            pattern: "plain".into(),
        }
    }

    #[test]
    fn test_get_product() {
        let (store, _dir) = test_store();
        let added = store
            .add_product(NewProduct {
                name: "Blue Jeans".into(),
                sku: Some("BJ-1".into()),
                ..Default::default()
            })
            .unwrap();

        let loaded = store.get_product(added.id).unwrap().unwrap();
        assert_eq!(loaded.name, "Blue Jeans");
        assert_eq!(loaded.sku.as_deref(), Some("BJ-1"));
        assert!(store.get_product(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_add_crops_is_idempotent() {
        let (store, _dir) = test_store();
        let original = upload(&store);

        let first = store.add_crops(original.id, crop_specs(3)).unwrap();
        let second = store.add_crops(original.id, crop_specs(3)).unwrap();

        let first_ids: Vec<_> = first.iter().map(|c| c.id).collect();
        let second_ids: Vec<_> = second.iter().map(|c| c.id).collect();
        assert_eq!(first_ids, second_ids);
        assert_eq!(store.get_crops(original.id).unwrap().len(), 3);
        assert_eq!(first[2].crop_index, Some(2));
    }

    #[test]
    fn test_crop_of_crop_rejected() {
        let (store, _dir) = test_store();
        let original = upload(&store);
        let crops = store.add_crops(original.id, crop_specs(1)).unwrap();

        let result = store.add_crops(crops[0].id, crop_specs(1));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_crops_need_existing_original() {
        let (store, _dir) = test_store();
        let result = store.add_crops(Uuid::new_v4(), crop_specs(1));
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn test_set_crop_label() {
        let (store, _dir) = test_store();
        let original = upload(&store);
        let crop = store.add_crops(original.id, crop_specs(1)).unwrap().remove(0);

        store.set_crop_label(crop.id, &label(), &[0.5, 0.25]).unwrap();
        let crop = store.get_image(crop.id).unwrap().unwrap();
        assert_eq!(crop.label, Some(label()));
        assert_eq!(crop.embedding, Some(vec![0.5, 0.25]));

        // Originals are not labelled through this path
        assert!(store.set_crop_label(original.id, &label(), &[1.0]).is_err());
    }

    #[test]
    fn test_link_product_image_once() {
        let (store, _dir) = test_store();
        let product = store
            .add_product(NewProduct {
                name: "Blue Jeans".into(),
                ..Default::default()
            })
            .unwrap();
        let original = upload(&store);
        let crop = store.add_crops(original.id, crop_specs(1)).unwrap().remove(0);

        assert!(store.link_product_image(product.id, crop.id, true).unwrap());
        assert!(!store.link_product_image(product.id, crop.id, true).unwrap());
        let links = store.get_product_images(product.id).unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].is_primary);
    }

    #[test]
    fn test_job_product_invariant() {
        let (store, _dir) = test_store();
        let image = upload(&store);
        assert!(matches!(
            store.create_job(JobType::Indexing, image.id, None),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            store.create_job(JobType::Querying, image.id, Some(Uuid::new_v4())),
            Err(Error::Validation(_))
        ));
        let job = store.create_job(JobType::Querying, image.id, None).unwrap();
        assert_eq!(job.status, JobStatus::Queued);
    }

    #[test]
    fn test_status_never_leaves_terminal() {
        let (store, _dir) = test_store();
        let image = upload(&store);
        let job = store.create_job(JobType::Querying, image.id, None).unwrap();

        let applied = store
            .update_job_status(job.id, JobStatus::Started, "started")
            .unwrap();
        assert_eq!(applied, StatusUpdate::Applied);
        store
            .update_job_status(job.id, JobStatus::Completed, "done")
            .unwrap();

        let ignored = store
            .update_job_status(job.id, JobStatus::Failed, "late failure")
            .unwrap();
        assert_eq!(ignored, StatusUpdate::Ignored);
        let job = store.get_job(job.id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.processing_details.as_deref(), Some("done"));
    }

    #[test]
    fn test_backward_status_write_ignored() {
        let (store, _dir) = test_store();
        let image = upload(&store);
        let job = store.create_job(JobType::Querying, image.id, None).unwrap();
        store
            .update_job_status(job.id, JobStatus::Querying, "item 1 of 2 queried")
            .unwrap();
        let outcome = store
            .update_job_status(job.id, JobStatus::Labelling, "item 2 of 2 analyzed")
            .unwrap();
        assert_eq!(outcome, StatusUpdate::Ignored);
        assert_eq!(
            store.get_job(job.id).unwrap().unwrap().status,
            JobStatus::Querying
        );
    }

    #[test]
    fn test_status_outside_branch_rejected() {
        let (store, _dir) = test_store();
        let image = upload(&store);
        let job = store.create_job(JobType::Querying, image.id, None).unwrap();
        let result = store.update_job_status(job.id, JobStatus::Storing, "storing");
        assert!(matches!(result, Err(Error::InvalidTransition { .. })));
        assert!(matches!(
            store.update_job_status(Uuid::new_v4(), JobStatus::Started, "x"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_list_jobs_filters() {
        let (store, _dir) = test_store();
        let image = upload(&store);
        let product = store
            .add_product(NewProduct {
                name: "Shirt".into(),
                ..Default::default()
            })
            .unwrap();
        store.create_job(JobType::Querying, image.id, None).unwrap();
        store
            .create_job(JobType::Indexing, image.id, Some(product.id))
            .unwrap();

        let all = store.list_jobs(&JobFilter::default()).unwrap();
        assert_eq!(all.len(), 2);
        let indexing = store
            .list_jobs(&JobFilter {
                job_type: Some(JobType::Indexing),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(indexing.len(), 1);
        assert_eq!(indexing[0].input_product_id, Some(product.id));
    }

    #[test]
    fn test_indexing_result_created_once() {
        let (store, _dir) = test_store();
        let original = upload(&store);
        let product = store
            .add_product(NewProduct {
                name: "Blue Jeans".into(),
                ..Default::default()
            })
            .unwrap();
        let crops = store.add_crops(original.id, crop_specs(2)).unwrap();
        let ids: Vec<_> = crops.iter().map(|c| c.id).collect();
        let job = store
            .create_job(JobType::Indexing, original.id, Some(product.id))
            .unwrap();

        let first = store
            .get_or_create_indexing_result(job.id, ids[0], &ids, "v1")
            .unwrap();
        let second = store
            .get_or_create_indexing_result(job.id, ids[1], &ids, "v2")
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.selected_crop_id, ids[0]);
        assert_eq!(second.created_crop_ids, ids);
    }

    #[test]
    fn test_record_cloth_matches() {
        let (store, _dir) = test_store();
        let original = upload(&store);
        let crop = store.add_crops(original.id, crop_specs(1)).unwrap().remove(0);
        let job = store.create_job(JobType::Querying, original.id, None).unwrap();
        let qr = store.get_or_create_query_result(job.id, "v1").unwrap();
        assert_eq!(store.get_or_create_query_result(job.id, "v1").unwrap().id, qr.id);

        let matches: Vec<_> = (1..=3)
            .map(|rank| QueryResultProductImage {
                matched_image_id: Uuid::new_v4(),
                score: 1.0 - rank as f32 * 0.1,
                rank,
            })
            .collect();
        let (cloth_id, created) = store
            .record_cloth_matches(qr.id, crop.id, Some(&label()), &matches)
            .unwrap();
        assert!(created);
        let (again, created) = store
            .record_cloth_matches(qr.id, crop.id, Some(&label()), &matches)
            .unwrap();
        assert_eq!(again, cloth_id);
        assert!(!created);

        let cloths = store.get_query_cloths(qr.id).unwrap();
        assert_eq!(cloths.len(), 1);
        let ranks: Vec<u32> = cloths[0].matches.iter().map(|m| m.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
        assert_eq!(cloths[0].label, Some(label()));
    }

    #[test]
    fn test_sparse_ranks_rejected() {
        let (store, _dir) = test_store();
        let matches = vec![QueryResultProductImage {
            matched_image_id: Uuid::new_v4(),
            score: 0.9,
            rank: 2,
        }];
        let result = store.record_cloth_matches(Uuid::new_v4(), Uuid::new_v4(), None, &matches);
        assert!(matches!(result, Err(Error::Validation(_))));
    }
}
