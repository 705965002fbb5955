use crate::hash::ContentHash;

/// On-disk flag bits.  These numeric assignments are a wire-compatibility
/// contract; older readers decode them.
pub const FLAG_DIR: u32 = 1;
pub const FLAG_DIR_NESTED_ROOT: u32 = 2;
pub const FLAG_DIR_NESTED_MOUNTPOINT: u32 = 4;
pub const FLAG_FILE: u32 = 8;
pub const FLAG_LINK: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirentKind {
    Directory,
    Regular,
    Symlink,
}

/// One row of the `catalog` table, in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryEntry {
    pub kind: DirentKind,
    pub is_nested_root: bool,
    pub is_nested_mountpoint: bool,
    pub checksum: ContentHash,
    pub hardlink_group: u32,
    pub linkcount: u32,
    pub size: u64,
    pub mode: u32,
    pub mtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub name: String,
    pub symlink: String,
    /// Row id of the backing row, set on decode.  Clients derive a stable
    /// inode from it; the engine only carries it through.
    pub row_id: i64,
}

impl DirectoryEntry {
    pub fn new_directory(name: &str, mode: u32, uid: u32, gid: u32, mtime: i64) -> Self {
        Self {
            kind: DirentKind::Directory,
            is_nested_root: false,
            is_nested_mountpoint: false,
            checksum: ContentHash::null(),
            hardlink_group: 0,
            linkcount: 1,
            size: 0,
            mode,
            mtime,
            uid,
            gid,
            name: name.to_string(),
            symlink: String::new(),
            row_id: 0,
        }
    }

    pub fn new_regular(
        name: &str,
        size: u64,
        checksum: ContentHash,
        mode: u32,
        uid: u32,
        gid: u32,
        mtime: i64,
    ) -> Self {
        Self {
            kind: DirentKind::Regular,
            is_nested_root: false,
            is_nested_mountpoint: false,
            checksum,
            hardlink_group: 0,
            linkcount: 1,
            size,
            mode,
            mtime,
            uid,
            gid,
            name: name.to_string(),
            symlink: String::new(),
            row_id: 0,
        }
    }

    pub fn new_symlink(name: &str, target: &str, uid: u32, gid: u32, mtime: i64) -> Self {
        Self {
            kind: DirentKind::Symlink,
            is_nested_root: false,
            is_nested_mountpoint: false,
            checksum: ContentHash::null(),
            hardlink_group: 0,
            linkcount: 1,
            size: target.len() as u64,
            mode: 0o777,
            mtime,
            uid,
            gid,
            name: name.to_string(),
            symlink: target.to_string(),
            row_id: 0,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == DirentKind::Directory
    }

    pub fn is_regular(&self) -> bool {
        self.kind == DirentKind::Regular
    }

    pub fn is_link(&self) -> bool {
        self.kind == DirentKind::Symlink
    }

    /// Packs the kind and the nested-catalog markers into the on-disk flag
    /// field.  IsNestedRoot wins over IsNestedMountpoint; the two are never
    /// legally set together.
    pub fn database_flags(&self) -> u32 {
        let mut flags = 0u32;
        if self.is_nested_root {
            flags |= FLAG_DIR_NESTED_ROOT;
        } else if self.is_nested_mountpoint {
            flags |= FLAG_DIR_NESTED_MOUNTPOINT;
        }
        match self.kind {
            DirentKind::Directory => flags |= FLAG_DIR,
            DirentKind::Symlink => flags |= FLAG_FILE | FLAG_LINK,
            DirentKind::Regular => flags |= FLAG_FILE,
        }
        flags
    }

    pub fn kind_from_flags(flags: u32) -> DirentKind {
        if flags & FLAG_LINK != 0 {
            DirentKind::Symlink
        } else if flags & FLAG_DIR != 0 {
            DirentKind::Directory
        } else {
            DirentKind::Regular
        }
    }

    /// The composite `hardlinks` column: group id in the high half, link
    /// count in the low half.
    pub fn hardlinks_field(&self) -> i64 {
        pack_hardlinks(self.hardlink_group, self.linkcount)
    }

    /// The symlink target with `$(VAR)` placeholders resolved.  The raw
    /// target stays in `symlink` so that writing the entry back preserves
    /// the placeholders; expansion is a read-side service for consumers.
    pub fn expanded_symlink(&self, lookup: &dyn Fn(&str) -> Option<String>) -> String {
        expand_symlink(&self.symlink, lookup)
    }
}

/// One content chunk of a regular file, keyed on disk by the owning entry's
/// path hash plus `(offset, size)`.  Chunks travel with their entry through
/// partition and merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileChunk {
    pub offset: u64,
    pub size: u64,
    pub hash: ContentHash,
}

pub fn pack_hardlinks(group: u32, linkcount: u32) -> i64 {
    (((group as u64) << 32) | linkcount as u64) as i64
}

pub fn hardlink_group_of(field: i64) -> u32 {
    ((field as u64) >> 32) as u32
}

pub fn linkcount_of(field: i64) -> u32 {
    (field as u64 & 0xffff_ffff) as u32
}

/// Expands `$(NAME)` occurrences in a symlink target.  `NAME` is resolved
/// through the supplied lookup; an unset variable and an unmatched `$(` are
/// left literal, so a second pass over an expanded target is a no-op as long
/// as no `$(` remains.
pub fn expand_symlink(raw: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    if !raw.contains('$') {
        return raw.to_string();
    }

    let bytes = raw.as_bytes();
    let mut out = String::with_capacity(raw.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'(' {
            match raw[i + 2..].find(')') {
                Some(rel) => {
                    let name = &raw[i + 2..i + 2 + rel];
                    match lookup(name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            out.push_str("$(");
                            out.push_str(name);
                            out.push(')');
                        }
                    }
                    i += 2 + rel + 1;
                }
                None => {
                    // right parenthesis missing
                    out.push_str("$(");
                    i += 2;
                }
            }
        } else {
            let ch = raw[i..].chars().next().unwrap_or('\0');
            out.push(ch);
            i += ch.len_utf8();
        }
    }
    out
}
