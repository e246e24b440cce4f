//! Database schema SQL.

/// Catalog tables: products, images (originals and crops), product links.
pub const CATALOG_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id TEXT PRIMARY KEY,
    sku TEXT UNIQUE,
    name TEXT NOT NULL,
    description TEXT,
    price_cents INTEGER,
    created_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_products_name ON products(name);

CREATE TABLE IF NOT EXISTS images (
    id TEXT PRIMARY KEY,
    bucket TEXT NOT NULL,
    path TEXT NOT NULL,
    filename TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    format TEXT,
    label_json TEXT,
    embedding BLOB,
    original_id TEXT REFERENCES images(id),
    crop_index INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((original_id IS NULL) = (crop_index IS NULL))
);

CREATE INDEX IF NOT EXISTS idx_images_original ON images(original_id);
CREATE UNIQUE INDEX IF NOT EXISTS idx_images_crop_slot ON images(original_id, crop_index)
    WHERE original_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS product_images (
    product_id TEXT NOT NULL REFERENCES products(id),
    image_id TEXT NOT NULL REFERENCES images(id),
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (product_id, image_id)
);
"#;

/// Job records and their result tables.
pub const JOB_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id TEXT PRIMARY KEY,
    job_type TEXT NOT NULL CHECK (job_type IN ('indexing', 'querying')),
    status TEXT NOT NULL CHECK (status IN (
        'queued', 'started', 'detecting', 'labelling',
        'storing', 'querying', 'completed', 'failed'
    )),
    input_image_id TEXT NOT NULL REFERENCES images(id),
    input_product_id TEXT REFERENCES products(id),
    processing_details TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    CHECK ((job_type = 'indexing') = (input_product_id IS NOT NULL))
);

CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_created ON jobs(created_at);

CREATE TABLE IF NOT EXISTS indexing_results (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL UNIQUE REFERENCES jobs(id),
    selected_crop_id TEXT NOT NULL REFERENCES images(id),
    created_crop_ids_json TEXT NOT NULL,
    model_version TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS query_results (
    id TEXT PRIMARY KEY,
    job_id TEXT NOT NULL UNIQUE REFERENCES jobs(id),
    model_version TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS query_result_cloths (
    id TEXT PRIMARY KEY,
    query_result_id TEXT NOT NULL REFERENCES query_results(id) ON DELETE CASCADE,
    crop_id TEXT NOT NULL REFERENCES images(id),
    label_json TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (query_result_id, crop_id)
);

CREATE TABLE IF NOT EXISTS query_result_product_images (
    cloth_id TEXT NOT NULL REFERENCES query_result_cloths(id) ON DELETE CASCADE,
    matched_image_id TEXT NOT NULL,
    score REAL NOT NULL,
    rank INTEGER NOT NULL CHECK (rank >= 1),
    PRIMARY KEY (cloth_id, rank)
);
"#;

/// Similarity-store vectors, scoped by collection.
pub const VECTOR_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vectors (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dim INTEGER NOT NULL,
    metadata_json TEXT,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (collection, id)
);
"#;
