use md5::{Digest as Md5Digest, Md5};
use sha1::{Digest as Sha1Digest, Sha1};

use crate::{CatalogError, CatalogResult};

/// 128-bit MD5 of an absolute path, split into two signed 64-bit halves the
/// way the catalog table stores them.  This is the primary key of every
/// directory entry; the path string itself is not a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PathHash {
    pub md5_1: i64,
    pub md5_2: i64,
}

impl PathHash {
    pub fn from_path(path: &str) -> Self {
        let digest = Md5::digest(path.as_bytes());
        let mut lo = [0u8; 8];
        let mut hi = [0u8; 8];
        lo.copy_from_slice(&digest[0..8]);
        hi.copy_from_slice(&digest[8..16]);
        Self {
            md5_1: i64::from_le_bytes(lo),
            md5_2: i64::from_le_bytes(hi),
        }
    }

    /// The all-zero hash, used as the parent key of the repository root.
    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.md5_1 == 0 && self.md5_2 == 0
    }
}

pub const CONTENT_HASH_LEN: usize = 20;

/// SHA-1 over a content-addressed payload.  The all-zero value means "no
/// content" (directories and symlinks) and is stored as SQL NULL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContentHash([u8; CONTENT_HASH_LEN]);

impl ContentHash {
    pub fn new(bytes: [u8; CONTENT_HASH_LEN]) -> Self {
        Self(bytes)
    }

    pub fn null() -> Self {
        Self::default()
    }

    pub fn is_null(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn digest_of(data: &[u8]) -> Self {
        let mut h = Sha1::new();
        h.update(data);
        let digest = h.finalize();
        let mut out = [0u8; CONTENT_HASH_LEN];
        out.copy_from_slice(&digest[..]);
        Self(out)
    }

    pub fn as_bytes(&self) -> &[u8; CONTENT_HASH_LEN] {
        &self.0
    }

    /// Hex form as stored in the `nested_catalogs` table; the null hash
    /// encodes to the empty string.
    pub fn to_hex(&self) -> String {
        if self.is_null() {
            String::new()
        } else {
            hex::encode(self.0)
        }
    }

    pub fn from_hex(s: &str) -> CatalogResult<Self> {
        if s.is_empty() {
            return Ok(Self::null());
        }
        let raw = hex::decode(s)
            .map_err(|e| CatalogError::Execute(format!("bad content hash '{}': {}", s, e)))?;
        Self::from_slice(&raw)
    }

    pub fn from_slice(raw: &[u8]) -> CatalogResult<Self> {
        if raw.len() != CONTENT_HASH_LEN {
            return Err(CatalogError::Execute(format!(
                "content hash has {} bytes, expected {}",
                raw.len(),
                CONTENT_HASH_LEN
            )));
        }
        let mut out = [0u8; CONTENT_HASH_LEN];
        out.copy_from_slice(raw);
        Ok(Self(out))
    }
}

/// Parent of an absolute path: "/a/b" -> "/a", "/a" -> "", "" -> "".
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
