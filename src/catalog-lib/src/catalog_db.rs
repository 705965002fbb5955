use log::{debug, warn};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::fs::File;
use std::io::Read;

use crate::dirent::DirectoryEntry;
use crate::hash::{parent_path, PathHash};
use crate::statements;
use crate::{CatalogError, CatalogResult};

/// Schema version written by `create`.  Versions in `[2.0, LATEST_SCHEMA)`
/// are refused on open; everything below 2.0 is treated as the 1.x line
/// (1.0 when the property is absent).
pub const LATEST_SCHEMA: f64 = 2.1;
pub const SCHEMA_EPSILON: f64 = 0.0005;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// One open catalog database file.  Single-writer: the connection is opened
/// without the engine's cross-thread mutex, serialization is the caller's
/// job.
pub struct CatalogDatabase {
    db_path: String,
    conn: Connection,
    schema_version: f64,
    read_write: bool,
}

impl CatalogDatabase {
    pub fn open(db_path: &str, mode: OpenMode) -> CatalogResult<Self> {
        debug!("opening catalog database {}", db_path);

        let read_write = mode == OpenMode::ReadWrite;
        let flags = match mode {
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            OpenMode::ReadWrite => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
            }
        };
        let conn = Connection::open_with_flags(db_path, flags).map_err(|e| {
            warn!("open catalog database {} failed! {}", db_path, e);
            CatalogError::StorageOpen(e.to_string())
        })?;

        let bytes = read_ahead(db_path)?;
        debug!("read-ahead of {}: {} bytes", db_path, bytes);

        let schema_version = read_schema_version(&conn, db_path)?;
        debug!("open db with schema version {}", schema_version);
        if schema_version >= 2.0 - SCHEMA_EPSILON && schema_version < LATEST_SCHEMA - SCHEMA_EPSILON
        {
            warn!(
                "schema version {} not supported ({})",
                schema_version, db_path
            );
            return Err(CatalogError::UnsupportedSchema(format!(
                "schema version {} of {} is in the unsupported band",
                schema_version, db_path
            )));
        }

        if read_write {
            // engines default to off
            conn.execute_batch("PRAGMA foreign_keys = ON;").map_err(|e| {
                warn!("enabling foreign keys on {} failed! {}", db_path, e);
                CatalogError::StorageOpen(e.to_string())
            })?;
        }

        Ok(Self {
            db_path: db_path.to_string(),
            conn,
            schema_version,
            read_write,
        })
    }

    /// Creates a new catalog file: full schema, seeded properties and
    /// statistics, and the root entry at `PH(root_prefix)`.  Any failing
    /// step reports a schema-creation error and the half-built file is left
    /// for the caller to discard; it is never retried in place.
    pub fn create(
        db_path: &str,
        root_entry: &DirectoryEntry,
        root_prefix: &str,
    ) -> CatalogResult<()> {
        debug!("creating new catalog at '{}'", db_path);

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(db_path, flags).map_err(|e| {
            warn!("cannot create catalog database file '{}': {}", db_path, e);
            CatalogError::SchemaCreation(e.to_string())
        })?;

        for ddl in statements::SCHEMA_DDL {
            conn.execute_batch(ddl)
                .map_err(|e| schema_failure(db_path, e))?;
        }

        conn.execute(
            "INSERT INTO properties (key, value) VALUES ('revision', 0);",
            [],
        )
        .map_err(|e| schema_failure(db_path, e))?;
        conn.execute(
            "INSERT INTO properties (key, value) VALUES ('schema', ?1);",
            params![LATEST_SCHEMA],
        )
        .map_err(|e| schema_failure(db_path, e))?;

        conn.execute_batch(statements::SQL_SEED_STATISTICS)
            .map_err(|e| schema_failure(db_path, e))?;

        let path_hash = PathHash::from_path(root_prefix);
        let parent_hash = if root_prefix.is_empty() {
            PathHash::null()
        } else {
            PathHash::from_path(parent_path(root_prefix))
        };
        statements::insert_dirent(&conn, &path_hash, &parent_hash, root_entry)
            .map_err(|e| CatalogError::SchemaCreation(e.to_string()))?;

        if !root_prefix.is_empty() {
            conn.execute(
                "INSERT INTO properties (key, value) VALUES ('root_prefix', ?1);",
                params![root_prefix],
            )
            .map_err(|e| schema_failure(db_path, e))?;
        }

        Ok(())
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    pub fn schema_version(&self) -> f64 {
        self.schema_version
    }

    pub fn read_write(&self) -> bool {
        self.read_write
    }

    /// Pre-2.1 layout: no uid/gid columns, hardlink field carries an inode.
    pub fn is_legacy(&self) -> bool {
        self.schema_version < LATEST_SCHEMA - SCHEMA_EPSILON
    }

    /// Attaches another catalog file under `alias` on this connection.  The
    /// alias is an identifier and is interpolated; the path is bound.
    pub fn attach(&self, other_path: &str, alias: &str) -> CatalogResult<()> {
        let sql = format!("ATTACH DATABASE ?1 AS {};", alias);
        self.conn.execute(&sql, params![other_path]).map_err(|e| {
            warn!(
                "failed to attach catalog '{}' as '{}': {}",
                other_path, alias, e
            );
            CatalogError::Execute(e.to_string())
        })?;
        Ok(())
    }

    pub fn detach(&self, alias: &str) -> CatalogResult<()> {
        let sql = format!("DETACH DATABASE {};", alias);
        self.conn.execute(&sql, []).map_err(|e| {
            warn!("failed to detach '{}': {}", alias, e);
            CatalogError::Execute(e.to_string())
        })?;
        Ok(())
    }

    pub fn property_text(&self, key: &str) -> CatalogResult<Option<String>> {
        self.conn
            .query_row(
                "SELECT CAST(value AS TEXT) FROM properties WHERE key = ?1;",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()
            .map_err(|e| CatalogError::Execute(e.to_string()))
    }

    pub fn set_property_text(&self, key: &str, value: &str) -> CatalogResult<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO properties (key, value) VALUES (?1, ?2);",
                params![key, value],
            )
            .map_err(|e| CatalogError::Execute(e.to_string()))?;
        Ok(())
    }
}

fn schema_failure(db_path: &str, e: rusqlite::Error) -> CatalogError {
    warn!("sql failure while creating '{}': {}", db_path, e);
    CatalogError::SchemaCreation(e.to_string())
}

/// Streams the whole file through a scratch buffer to warm the filesystem
/// cache before the first statement touches it.
fn read_ahead(db_path: &str) -> CatalogResult<u64> {
    let mut file = File::open(db_path).map_err(|e| {
        warn!("failed to open {} for read-ahead: {}", db_path, e);
        CatalogError::StorageOpen(e.to_string())
    })?;
    let mut buf = vec![0u8; 1024 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buf).map_err(|e| {
            warn!("failed to read-ahead {}: {}", db_path, e);
            CatalogError::StorageOpen(e.to_string())
        })?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }
    Ok(total)
}

fn read_schema_version(conn: &Connection, db_path: &str) -> CatalogResult<f64> {
    let text: Option<String> = conn
        .query_row(
            "SELECT CAST(value AS TEXT) FROM properties WHERE key = 'schema';",
            [],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| {
            warn!("cannot read schema property of {}: {}", db_path, e);
            CatalogError::StorageOpen(e.to_string())
        })?;

    match text {
        None => Ok(1.0),
        Some(raw) => raw.parse::<f64>().map_err(|e| {
            CatalogError::StorageOpen(format!(
                "malformed schema property '{}' in {}: {}",
                raw, db_path, e
            ))
        }),
    }
}
