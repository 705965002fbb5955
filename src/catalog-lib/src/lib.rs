mod catalog_db;
mod config;
mod dirent;
mod forest;
mod hash;
mod statements;
mod writable_catalog;

pub use catalog_db::{CatalogDatabase, OpenMode, LATEST_SCHEMA, SCHEMA_EPSILON};
pub use config::{process_env_lookup, CatalogOptions, EnvLookup};
pub use dirent::{
    expand_symlink, hardlink_group_of, linkcount_of, pack_hardlinks, DirectoryEntry, DirentKind,
    FileChunk, FLAG_DIR, FLAG_DIR_NESTED_MOUNTPOINT, FLAG_DIR_NESTED_ROOT, FLAG_FILE, FLAG_LINK,
};
pub use forest::CatalogForest;
pub use hash::{parent_path, ContentHash, PathHash, CONTENT_HASH_LEN};
pub use writable_catalog::WritableCatalog;

use thiserror::Error;

/// Slot index of a catalog in its forest arena.  Parent links and
/// mountpoint->child maps carry these instead of references.
pub type CatalogId = usize;

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("storage open failure: {0}")]
    StorageOpen(String),
    #[error("unsupported schema: {0}")]
    UnsupportedSchema(String),
    #[error("schema creation failure: {0}")]
    SchemaCreation(String),
    #[error("statement prepare failure: {0}")]
    Prepare(String),
    #[error("statement execute failure: {0}")]
    Execute(String),
    #[error("invariant violation: {0}")]
    InvariantViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl CatalogError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CatalogError::NotFound(_))
    }
}

pub type CatalogResult<T> = std::result::Result<T, CatalogError>;


#[cfg(test)]
mod forest_tests;
