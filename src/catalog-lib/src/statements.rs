use log::warn;
use rusqlite::types::Type;
use rusqlite::{named_params, Connection, OptionalExtension, Row};

use crate::config::CatalogOptions;
use crate::dirent::{
    hardlink_group_of, linkcount_of, DirectoryEntry, FileChunk, FLAG_DIR_NESTED_MOUNTPOINT,
    FLAG_DIR_NESTED_ROOT,
};
use crate::hash::{ContentHash, PathHash};
use crate::{CatalogError, CatalogResult};

/// Table and index definitions.  The logical schema (names, column order,
/// flag bits, property keys, counter names) is the on-disk compatibility
/// surface and must not change.
pub const SCHEMA_DDL: &[&str] = &[
    "CREATE TABLE catalog \
     (md5path_1 INTEGER, md5path_2 INTEGER, parent_1 INTEGER, parent_2 INTEGER, \
      hardlinks INTEGER, hash BLOB, size INTEGER, mode INTEGER, mtime INTEGER, \
      flags INTEGER, name TEXT, symlink TEXT, uid INTEGER, gid INTEGER, \
      CONSTRAINT pk_catalog PRIMARY KEY (md5path_1, md5path_2));",
    "CREATE INDEX idx_catalog_parent ON catalog (parent_1, parent_2);",
    "CREATE TABLE chunks \
     (md5path_1 INTEGER, md5path_2 INTEGER, offset INTEGER, size INTEGER, hash BLOB, \
      CONSTRAINT pk_chunks PRIMARY KEY (md5path_1, md5path_2, offset, size), \
      FOREIGN KEY (md5path_1, md5path_2) REFERENCES catalog (md5path_1, md5path_2));",
    "CREATE TABLE properties (key TEXT, value TEXT, \
      CONSTRAINT pk_properties PRIMARY KEY (key));",
    "CREATE TABLE nested_catalogs (path TEXT, sha1 TEXT, \
      CONSTRAINT pk_nested_catalogs PRIMARY KEY (path));",
    "CREATE TABLE statistics (counter TEXT, value INTEGER, \
      CONSTRAINT pk_statistics PRIMARY KEY (counter));",
];

pub const SQL_SEED_STATISTICS: &str = "INSERT INTO statistics (counter, value) \
     SELECT 'self_regular', 0 UNION ALL SELECT 'self_symlink', 0 UNION ALL \
     SELECT 'self_dir', 1 UNION ALL SELECT 'self_nested', 0 UNION ALL \
     SELECT 'subtree_regular', 0 UNION ALL SELECT 'subtree_symlink', 0 UNION ALL \
     SELECT 'subtree_dir', 0 UNION ALL SELECT 'subtree_nested', 0;";

// Field tuple of the lookup/listing statements.  Pre-2.1 schemas store no
// uid/gid and carry an inode where hardlinks now lives.
const SQL_LOOKUP_MD5: &str = "SELECT hash, hardlinks, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid, uid, gid \
     FROM catalog WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

const SQL_LOOKUP_MD5_LEGACY: &str =
    "SELECT hash, inode, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid \
     FROM catalog WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

const SQL_LOOKUP_ROWID: &str = "SELECT hash, hardlinks, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid, uid, gid \
     FROM catalog WHERE rowid = :rowid;";

const SQL_LOOKUP_ROWID_LEGACY: &str =
    "SELECT hash, inode, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid \
     FROM catalog WHERE rowid = :rowid;";

const SQL_LISTING: &str = "SELECT hash, hardlinks, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid, uid, gid \
     FROM catalog WHERE (parent_1 = :p_1) AND (parent_2 = :p_2);";

const SQL_LISTING_LEGACY: &str = "SELECT hash, inode, size, mode, mtime, flags, name, symlink, \
     md5path_1, md5path_2, parent_1, parent_2, rowid \
     FROM catalog WHERE (parent_1 = :p_1) AND (parent_2 = :p_2);";

const SQL_DIRENT_INSERT: &str = "INSERT INTO catalog \
     (md5path_1, md5path_2, parent_1, parent_2, hash, hardlinks, size, mode, \
      mtime, flags, name, symlink, uid, gid) \
     VALUES (:md5_1, :md5_2, :p_1, :p_2, :hash, :links, :size, :mode, :mtime, \
      :flags, :name, :symlink, :uid, :gid);";

const SQL_DIRENT_UPDATE: &str = "UPDATE catalog \
     SET hash = :hash, size = :size, mode = :mode, mtime = :mtime, \
      flags = :flags, name = :name, symlink = :symlink, hardlinks = :links, \
      uid = :uid, gid = :gid \
     WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

const SQL_DIRENT_TOUCH: &str = "UPDATE catalog SET mtime = :mtime \
     WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

const SQL_DIRENT_UNLINK: &str = "DELETE FROM catalog \
     WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

const SQL_MAX_HARDLINK_GROUP: &str = "SELECT max(hardlinks) FROM catalog;";

// Adjusts the link count of the whole group owning the addressed row.  A
// two-member group that shrinks dissolves to field 0: a hardlink group of
// one member is meaningless.  Rows with group id 0 are never touched.
const SQL_INC_LINKCOUNT: &str = "UPDATE catalog SET hardlinks = \
     CASE WHEN (hardlinks & 4294967295) = 2 AND :delta < 0 THEN 0 \
          ELSE hardlinks + :delta END \
     WHERE hardlinks > 4294967296 \
       AND hardlinks = (SELECT hardlinks FROM catalog \
                        WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2));";

// Shifts every hardlink group id by the offset packed into the high half;
// rows without a group (plain files, directories) stay untouched.
const SQL_RENUMBER_HARDLINKS: &str =
    "UPDATE catalog SET hardlinks = hardlinks + :offset WHERE hardlinks > 4294967296;";

const SQL_COUNT_FLAGS: &str = "SELECT count(*) FROM catalog \
     WHERE (flags & :inc) = :inc AND (flags & :exc) = 0;";

const SQL_NESTED_LOOKUP: &str = "SELECT sha1 FROM nested_catalogs WHERE path = :path;";
const SQL_NESTED_LIST: &str = "SELECT path, sha1 FROM nested_catalogs;";
const SQL_NESTED_INSERT: &str = "INSERT INTO nested_catalogs (path, sha1) VALUES (:path, :sha1);";
const SQL_NESTED_DELETE: &str = "DELETE FROM nested_catalogs WHERE path = :path;";
const SQL_NESTED_UPDATE: &str = "UPDATE nested_catalogs SET sha1 = :sha1 WHERE path = :path;";

const SQL_GET_COUNTER: &str = "SELECT value FROM statistics WHERE counter = :counter;";
const SQL_SET_COUNTER: &str =
    "INSERT OR REPLACE INTO statistics (counter, value) VALUES (:counter, :val);";

const SQL_CHUNK_INSERT: &str = "INSERT INTO chunks (md5path_1, md5path_2, offset, size, hash) \
     VALUES (:md5_1, :md5_2, :offset, :size, :hash);";
const SQL_CHUNKS_FOR: &str = "SELECT offset, size, hash FROM chunks \
     WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";
const SQL_CHUNKS_DELETE: &str = "DELETE FROM chunks \
     WHERE (md5path_1 = :md5_1) AND (md5path_2 = :md5_2);";

fn prepare_failure(e: rusqlite::Error) -> CatalogError {
    warn!("failed to prepare statement: {}", e);
    CatalogError::Prepare(e.to_string())
}

fn execute_failure(e: rusqlite::Error) -> CatalogError {
    CatalogError::Execute(e.to_string())
}

fn blob_failure(e: CatalogError) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, Type::Blob, Box::new(e))
}

fn dirent_from_row(
    row: &Row<'_>,
    legacy: bool,
    options: &CatalogOptions,
) -> rusqlite::Result<DirectoryEntry> {
    let hash_blob: Option<Vec<u8>> = row.get(0)?;
    let hardlinks_field: i64 = row.get(1)?;
    let size: i64 = row.get(2)?;
    let mode: i64 = row.get(3)?;
    let mtime: i64 = row.get(4)?;
    let flags = row.get::<_, i64>(5)? as u32;
    let name: String = row.get(6)?;
    let raw_symlink: String = row.get(7)?;
    let row_id: i64 = row.get(12)?;

    // Pre-2.1 rows carry an inode in the hardlink slot and no ownership
    // columns; substitute the configured defaults and a lone-file group.
    let (hardlink_group, linkcount, uid, gid) = if legacy {
        (0, 1, options.legacy_uid, options.legacy_gid)
    } else {
        (
            hardlink_group_of(hardlinks_field),
            linkcount_of(hardlinks_field),
            row.get::<_, i64>(13)? as u32,
            row.get::<_, i64>(14)? as u32,
        )
    };

    let checksum = match hash_blob {
        None => ContentHash::null(),
        Some(ref b) if b.is_empty() => ContentHash::null(),
        Some(ref b) => ContentHash::from_slice(b).map_err(blob_failure)?,
    };

    Ok(DirectoryEntry {
        kind: DirectoryEntry::kind_from_flags(flags),
        is_nested_root: flags & FLAG_DIR_NESTED_ROOT != 0,
        is_nested_mountpoint: flags & FLAG_DIR_NESTED_MOUNTPOINT != 0,
        checksum,
        hardlink_group,
        linkcount,
        size: size as u64,
        mode: mode as u32,
        mtime,
        uid,
        gid,
        name,
        symlink: raw_symlink,
        row_id,
    })
}

pub fn lookup_path_hash(
    conn: &Connection,
    legacy: bool,
    options: &CatalogOptions,
    path_hash: &PathHash,
) -> CatalogResult<Option<DirectoryEntry>> {
    let sql = if legacy {
        SQL_LOOKUP_MD5_LEGACY
    } else {
        SQL_LOOKUP_MD5
    };
    let mut stmt = conn.prepare_cached(sql).map_err(prepare_failure)?;
    stmt.query_row(
        named_params! { ":md5_1": path_hash.md5_1, ":md5_2": path_hash.md5_2 },
        |row| dirent_from_row(row, legacy, options),
    )
    .optional()
    .map_err(execute_failure)
}

pub fn lookup_row_id(
    conn: &Connection,
    legacy: bool,
    options: &CatalogOptions,
    row_id: i64,
) -> CatalogResult<Option<DirectoryEntry>> {
    let sql = if legacy {
        SQL_LOOKUP_ROWID_LEGACY
    } else {
        SQL_LOOKUP_ROWID
    };
    let mut stmt = conn.prepare_cached(sql).map_err(prepare_failure)?;
    stmt.query_row(named_params! { ":rowid": row_id }, |row| {
        dirent_from_row(row, legacy, options)
    })
    .optional()
    .map_err(execute_failure)
}

pub fn listing(
    conn: &Connection,
    legacy: bool,
    options: &CatalogOptions,
    parent_hash: &PathHash,
) -> CatalogResult<Vec<DirectoryEntry>> {
    let sql = if legacy { SQL_LISTING_LEGACY } else { SQL_LISTING };
    let mut stmt = conn.prepare_cached(sql).map_err(prepare_failure)?;
    let rows = stmt
        .query_map(
            named_params! { ":p_1": parent_hash.md5_1, ":p_2": parent_hash.md5_2 },
            |row| dirent_from_row(row, legacy, options),
        )
        .map_err(execute_failure)?;
    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.map_err(execute_failure)?);
    }
    Ok(entries)
}

fn dirent_hash_param(entry: &DirectoryEntry) -> Option<&[u8]> {
    if entry.is_regular() && !entry.checksum.is_null() {
        Some(entry.checksum.as_bytes().as_slice())
    } else {
        None
    }
}

pub fn insert_dirent(
    conn: &Connection,
    path_hash: &PathHash,
    parent_hash: &PathHash,
    entry: &DirectoryEntry,
) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached(SQL_DIRENT_INSERT)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
        ":p_1": parent_hash.md5_1,
        ":p_2": parent_hash.md5_2,
        ":hash": dirent_hash_param(entry),
        ":links": entry.hardlinks_field(),
        ":size": entry.size as i64,
        ":mode": entry.mode as i64,
        ":mtime": entry.mtime,
        ":flags": entry.database_flags() as i64,
        ":name": &entry.name,
        ":symlink": &entry.symlink,
        ":uid": entry.uid as i64,
        ":gid": entry.gid as i64,
    })
    .map_err(execute_failure)?;
    Ok(())
}

/// Full-row replace by path hash; returns the number of matched rows.
pub fn update_dirent(
    conn: &Connection,
    path_hash: &PathHash,
    entry: &DirectoryEntry,
) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_DIRENT_UPDATE)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":hash": dirent_hash_param(entry),
        ":size": entry.size as i64,
        ":mode": entry.mode as i64,
        ":mtime": entry.mtime,
        ":flags": entry.database_flags() as i64,
        ":name": &entry.name,
        ":symlink": &entry.symlink,
        ":links": entry.hardlinks_field(),
        ":uid": entry.uid as i64,
        ":gid": entry.gid as i64,
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
    })
    .map_err(execute_failure)
}

pub fn touch_dirent(conn: &Connection, path_hash: &PathHash, mtime: i64) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_DIRENT_TOUCH)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":mtime": mtime,
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
    })
    .map_err(execute_failure)
}

pub fn unlink_dirent(conn: &Connection, path_hash: &PathHash) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_DIRENT_UNLINK)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
    })
    .map_err(execute_failure)
}

/// Largest hardlink group id present, 0 when there is none.
pub fn max_hardlink_group(conn: &Connection) -> CatalogResult<u32> {
    let mut stmt = conn
        .prepare_cached(SQL_MAX_HARDLINK_GROUP)
        .map_err(prepare_failure)?;
    let max: Option<i64> = stmt.query_row([], |row| row.get(0)).map_err(execute_failure)?;
    Ok(max.map(hardlink_group_of).unwrap_or(0))
}

pub fn inc_linkcount(conn: &Connection, path_hash: &PathHash, delta: i64) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_INC_LINKCOUNT)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":delta": delta,
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
    })
    .map_err(execute_failure)
}

pub fn renumber_hardlink_groups(conn: &Connection, offset: i64) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_RENUMBER_HARDLINKS)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":offset": offset })
        .map_err(execute_failure)
}

/// Counts rows whose flag field contains every bit of `include` and none of
/// `exclude`.
pub fn count_flagged_entries(
    conn: &Connection,
    include: u32,
    exclude: u32,
) -> CatalogResult<i64> {
    let mut stmt = conn
        .prepare_cached(SQL_COUNT_FLAGS)
        .map_err(prepare_failure)?;
    stmt.query_row(
        named_params! { ":inc": include as i64, ":exc": exclude as i64 },
        |row| row.get(0),
    )
    .map_err(execute_failure)
}

pub fn lookup_nested_catalog(conn: &Connection, path: &str) -> CatalogResult<Option<String>> {
    let mut stmt = conn
        .prepare_cached(SQL_NESTED_LOOKUP)
        .map_err(prepare_failure)?;
    stmt.query_row(named_params! { ":path": path }, |row| row.get(0))
        .optional()
        .map_err(execute_failure)
}

pub fn list_nested_catalogs(conn: &Connection) -> CatalogResult<Vec<(String, String)>> {
    let mut stmt = conn
        .prepare_cached(SQL_NESTED_LIST)
        .map_err(prepare_failure)?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
        .map_err(execute_failure)?;
    let mut refs = Vec::new();
    for row in rows {
        refs.push(row.map_err(execute_failure)?);
    }
    Ok(refs)
}

pub fn insert_nested_catalog(conn: &Connection, path: &str, sha1: &str) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached(SQL_NESTED_INSERT)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":path": path, ":sha1": sha1 })
        .map_err(execute_failure)?;
    Ok(())
}

pub fn delete_nested_catalog(conn: &Connection, path: &str) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_NESTED_DELETE)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":path": path })
        .map_err(execute_failure)
}

pub fn update_nested_catalog(conn: &Connection, path: &str, sha1: &str) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_NESTED_UPDATE)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":sha1": sha1, ":path": path })
        .map_err(execute_failure)
}

pub fn get_counter(conn: &Connection, counter: &str) -> CatalogResult<Option<i64>> {
    let mut stmt = conn
        .prepare_cached(SQL_GET_COUNTER)
        .map_err(prepare_failure)?;
    stmt.query_row(named_params! { ":counter": counter }, |row| row.get(0))
        .optional()
        .map_err(execute_failure)
}

pub fn set_counter(conn: &Connection, counter: &str, value: i64) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached(SQL_SET_COUNTER)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":counter": counter, ":val": value })
        .map_err(execute_failure)?;
    Ok(())
}

pub fn insert_chunk(conn: &Connection, path_hash: &PathHash, chunk: &FileChunk) -> CatalogResult<()> {
    let mut stmt = conn
        .prepare_cached(SQL_CHUNK_INSERT)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! {
        ":md5_1": path_hash.md5_1,
        ":md5_2": path_hash.md5_2,
        ":offset": chunk.offset as i64,
        ":size": chunk.size as i64,
        ":hash": chunk.hash.as_bytes().as_slice(),
    })
    .map_err(execute_failure)?;
    Ok(())
}

pub fn chunks_for(conn: &Connection, path_hash: &PathHash) -> CatalogResult<Vec<FileChunk>> {
    let mut stmt = conn
        .prepare_cached(SQL_CHUNKS_FOR)
        .map_err(prepare_failure)?;
    let rows = stmt
        .query_map(
            named_params! { ":md5_1": path_hash.md5_1, ":md5_2": path_hash.md5_2 },
            |row| {
                let offset: i64 = row.get(0)?;
                let size: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                let hash = ContentHash::from_slice(&blob).map_err(blob_failure)?;
                Ok(FileChunk {
                    offset: offset as u64,
                    size: size as u64,
                    hash,
                })
            },
        )
        .map_err(execute_failure)?;
    let mut chunks = Vec::new();
    for row in rows {
        chunks.push(row.map_err(execute_failure)?);
    }
    Ok(chunks)
}

pub fn delete_chunks(conn: &Connection, path_hash: &PathHash) -> CatalogResult<usize> {
    let mut stmt = conn
        .prepare_cached(SQL_CHUNKS_DELETE)
        .map_err(prepare_failure)?;
    stmt.execute(named_params! { ":md5_1": path_hash.md5_1, ":md5_2": path_hash.md5_2 })
        .map_err(execute_failure)
}
