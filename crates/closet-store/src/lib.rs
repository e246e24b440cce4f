//! Closet Store — SQLite catalog and job records, cosine similarity store,
//! filesystem object storage.

pub mod blob;
pub mod embedding;
pub mod schema;
pub mod sqlite;
pub mod types;
pub mod vector;

pub use blob::{FsObjectStore, ObjectStore};
pub use sqlite::CatalogStore;
pub use types::*;
pub use vector::{Neighbor, SimilarityStore, SqliteVectorStore};
