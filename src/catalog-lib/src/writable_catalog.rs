use log::{debug, warn};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog_db::{CatalogDatabase, OpenMode};
use crate::config::CatalogOptions;
use crate::dirent::{
    DirectoryEntry, FileChunk, FLAG_DIR, FLAG_DIR_NESTED_MOUNTPOINT, FLAG_DIR_NESTED_ROOT,
    FLAG_FILE, FLAG_LINK,
};
use crate::hash::{ContentHash, PathHash};
use crate::statements;
use crate::{CatalogError, CatalogId, CatalogResult};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// One catalog open for mutation.  Holds the database, the dirty bit and the
/// in-memory links into the forest (parent index and mountpoint->child
/// index map; ownership lives in the forest arena).
pub struct WritableCatalog {
    mountpoint: String,
    db: CatalogDatabase,
    options: CatalogOptions,
    dirty: bool,
    in_transaction: bool,
    pub(crate) parent: Option<CatalogId>,
    pub(crate) children: BTreeMap<String, CatalogId>,
}

impl WritableCatalog {
    /// Opens an existing catalog file read-write.  The mountpoint is the
    /// stored `root_prefix` property ("" for the repository root).
    pub fn open(db_path: &str, options: CatalogOptions) -> CatalogResult<Self> {
        let db = CatalogDatabase::open(db_path, OpenMode::ReadWrite)?;
        let mountpoint = db.property_text("root_prefix")?.unwrap_or_default();
        Ok(Self {
            mountpoint,
            db,
            options,
            dirty: false,
            in_transaction: false,
            parent: None,
            children: BTreeMap::new(),
        })
    }

    pub fn mountpoint(&self) -> &str {
        &self.mountpoint
    }

    pub fn db(&self) -> &CatalogDatabase {
        &self.db
    }

    pub fn db_path(&self) -> &str {
        self.db.db_path()
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn parent_id(&self) -> Option<CatalogId> {
        self.parent
    }

    pub fn child_ids(&self) -> &BTreeMap<String, CatalogId> {
        &self.children
    }

    pub(crate) fn set_dirty(&mut self) {
        self.dirty = true;
    }

    // ---- transactions ----

    pub fn begin_transaction(&mut self) -> CatalogResult<()> {
        self.db
            .conn()
            .execute_batch("BEGIN;")
            .map_err(|e| CatalogError::Execute(e.to_string()))?;
        self.in_transaction = true;
        Ok(())
    }

    /// Commits an open transaction and clears the dirty bit.  Outside a
    /// transaction every mutation is already durable, so only the bit is
    /// cleared.
    pub fn commit(&mut self) -> CatalogResult<()> {
        if self.in_transaction {
            self.db
                .conn()
                .execute_batch("COMMIT;")
                .map_err(|e| CatalogError::Execute(e.to_string()))?;
            self.in_transaction = false;
        }
        self.dirty = false;
        Ok(())
    }

    pub fn rollback(&mut self) -> CatalogResult<()> {
        if self.in_transaction {
            self.db
                .conn()
                .execute_batch("ROLLBACK;")
                .map_err(|e| CatalogError::Execute(e.to_string()))?;
            self.in_transaction = false;
        }
        Ok(())
    }

    /// Runs `f` inside a transaction: commit on success, rollback on error.
    pub fn run_transaction<T, F>(&mut self, f: F) -> CatalogResult<T>
    where
        F: FnOnce(&mut Self) -> CatalogResult<T>,
    {
        self.begin_transaction()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback() {
                    warn!("rollback after failed transaction also failed! {}", rollback_err);
                }
                Err(e)
            }
        }
    }

    // ---- entry mutations ----

    /// Inserts `entry` keyed by the hash of `entry_path`.  Fails if a row
    /// with that path hash already exists.
    pub fn add_entry(
        &mut self,
        entry: &DirectoryEntry,
        entry_path: &str,
        parent_path: &str,
    ) -> CatalogResult<()> {
        self.set_dirty();
        debug!("add entry {}", entry_path);
        let path_hash = PathHash::from_path(entry_path);
        let parent_hash = PathHash::from_path(parent_path);
        statements::insert_dirent(self.db.conn(), &path_hash, &parent_hash, entry)
    }

    /// Updates the mtime of the row at `entry_path` from `entry`.
    pub fn touch_entry(&mut self, entry: &DirectoryEntry, entry_path: &str) -> CatalogResult<()> {
        self.set_dirty();
        let path_hash = PathHash::from_path(entry_path);
        let touched = statements::touch_dirent(self.db.conn(), &path_hash, entry.mtime)?;
        if touched == 0 {
            return Err(CatalogError::NotFound(format!(
                "no entry at '{}' to touch",
                entry_path
            )));
        }
        Ok(())
    }

    /// Replaces every mutable column of the row at `path_hash`.
    pub fn update_entry(
        &mut self,
        entry: &DirectoryEntry,
        path_hash: &PathHash,
    ) -> CatalogResult<()> {
        self.set_dirty();
        let updated = statements::update_dirent(self.db.conn(), path_hash, entry)?;
        if updated == 0 {
            return Err(CatalogError::NotFound(
                "no entry at the given path hash to update".to_string(),
            ));
        }
        Ok(())
    }

    /// Deletes the row at `entry_path`.  Removing a non-empty directory
    /// leaves dangling children; the caller owns that decision.
    pub fn remove_entry(&mut self, entry_path: &str) -> CatalogResult<()> {
        self.set_dirty();
        let path_hash = PathHash::from_path(entry_path);
        let removed = statements::unlink_dirent(self.db.conn(), &path_hash)?;
        if removed == 0 {
            return Err(CatalogError::NotFound(format!(
                "no entry at '{}' to remove",
                entry_path
            )));
        }
        Ok(())
    }

    /// Adjusts the link count of the whole hardlink group owning the row at
    /// `path_within_group`.  A two-member group shrinking by one dissolves
    /// to group id 0.
    pub fn inc_linkcount(&mut self, path_within_group: &str, delta: i64) -> CatalogResult<()> {
        self.set_dirty();
        let path_hash = PathHash::from_path(path_within_group);
        let changed = statements::inc_linkcount(self.db.conn(), &path_hash, delta)?;
        if changed == 0 {
            return Err(CatalogError::NotFound(format!(
                "no hardlink group at '{}'",
                path_within_group
            )));
        }
        Ok(())
    }

    /// Largest hardlink group id present in this catalog, 0 if none.
    pub fn max_link_id(&self) -> CatalogResult<u32> {
        statements::max_hardlink_group(self.db.conn())
    }

    pub(crate) fn renumber_hardlinks(&mut self, offset: i64) -> CatalogResult<usize> {
        self.set_dirty();
        statements::renumber_hardlink_groups(self.db.conn(), offset)
    }

    // ---- lookups ----

    pub fn lookup_path(&self, path: &str) -> CatalogResult<Option<DirectoryEntry>> {
        self.lookup_path_hash(&PathHash::from_path(path))
    }

    pub fn lookup_path_hash(&self, path_hash: &PathHash) -> CatalogResult<Option<DirectoryEntry>> {
        statements::lookup_path_hash(
            self.db.conn(),
            self.db.is_legacy(),
            &self.options,
            path_hash,
        )
    }

    pub fn lookup_row_id(&self, row_id: i64) -> CatalogResult<Option<DirectoryEntry>> {
        statements::lookup_row_id(self.db.conn(), self.db.is_legacy(), &self.options, row_id)
    }

    pub fn listing_path(&self, path: &str) -> CatalogResult<Vec<DirectoryEntry>> {
        let parent_hash = PathHash::from_path(path);
        statements::listing(
            self.db.conn(),
            self.db.is_legacy(),
            &self.options,
            &parent_hash,
        )
    }

    // ---- properties ----

    pub fn update_last_modified(&mut self) -> CatalogResult<()> {
        self.set_dirty();
        self.db
            .set_property_text("last_modified", &unix_timestamp().to_string())
    }

    pub fn increment_revision(&mut self) -> CatalogResult<()> {
        self.set_dirty();
        self.db
            .conn()
            .execute("UPDATE properties SET value = value + 1 WHERE key = 'revision';", [])
            .map_err(|e| CatalogError::Execute(e.to_string()))?;
        Ok(())
    }

    pub fn revision(&self) -> CatalogResult<i64> {
        let raw = self
            .db
            .property_text("revision")?
            .ok_or_else(|| CatalogError::NotFound("revision property missing".to_string()))?;
        raw.parse::<i64>()
            .map_err(|e| CatalogError::Execute(format!("malformed revision '{}': {}", raw, e)))
    }

    pub fn set_previous_revision(&mut self, hash: &ContentHash) -> CatalogResult<()> {
        self.set_dirty();
        self.db.set_property_text("previous_revision", &hash.to_hex())
    }

    // ---- nested catalog references ----

    /// Writes a `nested_catalogs` row.  An unknown content hash is stored as
    /// the empty string.  In-memory attachment is the forest's job.
    pub fn insert_nested_catalog(&mut self, mountpoint: &str, sha1: &str) -> CatalogResult<()> {
        self.set_dirty();
        statements::insert_nested_catalog(self.db.conn(), mountpoint, sha1)
    }

    pub fn remove_nested_catalog(&mut self, mountpoint: &str) -> CatalogResult<()> {
        self.set_dirty();
        let removed = statements::delete_nested_catalog(self.db.conn(), mountpoint)?;
        if removed == 0 {
            return Err(CatalogError::NotFound(format!(
                "no nested catalog reference at '{}'",
                mountpoint
            )));
        }
        Ok(())
    }

    pub fn update_nested_catalog(
        &mut self,
        mountpoint: &str,
        hash: &ContentHash,
    ) -> CatalogResult<()> {
        self.set_dirty();
        let updated =
            statements::update_nested_catalog(self.db.conn(), mountpoint, &hash.to_hex())?;
        if updated == 0 {
            return Err(CatalogError::NotFound(format!(
                "no nested catalog reference at '{}'",
                mountpoint
            )));
        }
        Ok(())
    }

    pub fn nested_catalog_hash(&self, mountpoint: &str) -> CatalogResult<Option<String>> {
        statements::lookup_nested_catalog(self.db.conn(), mountpoint)
    }

    pub fn list_nested_catalogs(&self) -> CatalogResult<Vec<(String, String)>> {
        statements::list_nested_catalogs(self.db.conn())
    }

    // ---- chunks ----

    pub fn add_chunk(&mut self, path_hash: &PathHash, chunk: &FileChunk) -> CatalogResult<()> {
        self.set_dirty();
        statements::insert_chunk(self.db.conn(), path_hash, chunk)
    }

    pub fn chunks_for(&self, path_hash: &PathHash) -> CatalogResult<Vec<FileChunk>> {
        statements::chunks_for(self.db.conn(), path_hash)
    }

    /// Deletes all chunk rows of one entry; entries without chunks are a
    /// no-op, not an error.
    pub fn remove_chunks(&mut self, path_hash: &PathHash) -> CatalogResult<usize> {
        self.set_dirty();
        statements::delete_chunks(self.db.conn(), path_hash)
    }

    // ---- statistics ----

    pub fn counter(&self, counter: &str) -> CatalogResult<i64> {
        statements::get_counter(self.db.conn(), counter)?.ok_or_else(|| {
            CatalogError::NotFound(format!("statistics counter '{}' missing", counter))
        })
    }

    pub fn set_counter(&mut self, counter: &str, value: i64) -> CatalogResult<()> {
        self.set_dirty();
        statements::set_counter(self.db.conn(), counter, value)
    }

    /// Recomputes the four `self_*` counters from the actual rows.  The
    /// structural operations call this on both sides; the sync mediator is
    /// expected to call it before the final commit of a publish.
    pub fn refresh_self_counters(&mut self) -> CatalogResult<()> {
        let conn = self.db.conn();
        let self_dir = statements::count_flagged_entries(conn, FLAG_DIR, FLAG_DIR_NESTED_ROOT)?;
        let self_regular = statements::count_flagged_entries(conn, FLAG_FILE, FLAG_LINK)?;
        let self_symlink = statements::count_flagged_entries(conn, FLAG_LINK, 0)?;
        let self_nested = statements::count_flagged_entries(conn, FLAG_DIR_NESTED_MOUNTPOINT, 0)?;
        self.set_counter("self_dir", self_dir)?;
        self.set_counter("self_regular", self_regular)?;
        self.set_counter("self_symlink", self_symlink)?;
        self.set_counter("self_nested", self_nested)?;
        Ok(())
    }
}
