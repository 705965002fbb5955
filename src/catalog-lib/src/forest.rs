use log::{info, warn};

use crate::catalog_db::CatalogDatabase;
use crate::config::CatalogOptions;
use crate::dirent::DirectoryEntry;
use crate::hash::PathHash;
use crate::writable_catalog::WritableCatalog;
use crate::{CatalogError, CatalogId, CatalogResult};

/// The in-memory catalog tree of one repository under publication.  The
/// arena owns every open catalog; parent links and mountpoint->child maps
/// are slot indices, so attaching and detaching a subtree is an index swap.
pub struct CatalogForest {
    slots: Vec<Option<WritableCatalog>>,
    root: Option<CatalogId>,
    options: CatalogOptions,
}

impl CatalogForest {
    pub fn new(options: CatalogOptions) -> Self {
        Self {
            slots: Vec::new(),
            root: None,
            options,
        }
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    pub fn root(&self) -> Option<CatalogId> {
        self.root
    }

    /// Creates a fresh root catalog file and attaches it.
    pub fn create_root(
        &mut self,
        db_path: &str,
        root_entry: &DirectoryEntry,
    ) -> CatalogResult<CatalogId> {
        CatalogDatabase::create(db_path, root_entry, "")?;
        self.attach_root(db_path)
    }

    /// Opens an existing root catalog file read-write and makes it the
    /// forest root.
    pub fn attach_root(&mut self, db_path: &str) -> CatalogResult<CatalogId> {
        if self.root.is_some() {
            return Err(CatalogError::InvariantViolation(
                "forest already has a root catalog".to_string(),
            ));
        }
        let catalog = WritableCatalog::open(db_path, self.options.clone())?;
        let id = self.insert(catalog);
        self.root = Some(id);
        Ok(id)
    }

    pub fn catalog(&self, id: CatalogId) -> CatalogResult<&WritableCatalog> {
        self.slots
            .get(id)
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| CatalogError::NotFound(format!("no catalog in slot {}", id)))
    }

    pub fn catalog_mut(&mut self, id: CatalogId) -> CatalogResult<&mut WritableCatalog> {
        self.slots
            .get_mut(id)
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| CatalogError::NotFound(format!("no catalog in slot {}", id)))
    }

    fn insert(&mut self, catalog: WritableCatalog) -> CatalogId {
        for (id, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(catalog);
                return id;
            }
        }
        self.slots.push(Some(catalog));
        self.slots.len() - 1
    }

    fn take(&mut self, id: CatalogId) -> CatalogResult<WritableCatalog> {
        self.slots
            .get_mut(id)
            .and_then(|slot| slot.take())
            .ok_or_else(|| CatalogError::NotFound(format!("no catalog in slot {}", id)))
    }

    /// The attached catalog whose subtree contains `path`: starts at the
    /// root and descends through matching mountpoints.
    pub fn find_hosting_catalog(&self, path: &str) -> CatalogResult<CatalogId> {
        let mut current = self
            .root
            .ok_or_else(|| CatalogError::NotFound("forest has no root catalog".to_string()))?;
        loop {
            let catalog = self.catalog(current)?;
            let mut next = None;
            for (mountpoint, id) in catalog.child_ids() {
                if path == mountpoint || path.starts_with(&format!("{}/", mountpoint)) {
                    next = Some(*id);
                    break;
                }
            }
            match next {
                Some(id) => current = id,
                None => return Ok(current),
            }
        }
    }

    /// Mediator entry point: extracts the subtree at `mountpoint` out of the
    /// catalog hosting it into a new nested catalog stored at
    /// `child_db_path`.
    pub fn create_nested_catalog(
        &mut self,
        mountpoint: &str,
        child_db_path: &str,
    ) -> CatalogResult<CatalogId> {
        let host = self.find_hosting_catalog(mountpoint)?;
        if self.catalog(host)?.mountpoint() == mountpoint {
            return Err(CatalogError::InvariantViolation(format!(
                "'{}' is already a nested catalog",
                mountpoint
            )));
        }
        self.partition(host, child_db_path, mountpoint)
    }

    /// Mediator entry point: folds the nested catalog mounted at
    /// `mountpoint` back into its parent.  Returns the dangling child's
    /// database path; deleting the file is the caller's job.
    pub fn remove_nested_catalog(&mut self, mountpoint: &str) -> CatalogResult<String> {
        let host = self.find_hosting_catalog(mountpoint)?;
        if self.catalog(host)?.mountpoint() != mountpoint {
            return Err(CatalogError::NotFound(format!(
                "no nested catalog mounted at '{}'",
                mountpoint
            )));
        }
        self.merge(host)
    }

    /// Moves the subtree at `mountpoint` from catalog `parent_id` into a
    /// freshly created nested catalog.  On failure, partial work may be
    /// visible in both databases; the publisher aborts and discards them.
    pub fn partition(
        &mut self,
        parent_id: CatalogId,
        child_db_path: &str,
        mountpoint: &str,
    ) -> CatalogResult<CatalogId> {
        let mut parent = self.take(parent_id)?;
        let result = partition_into(&mut parent, child_db_path, mountpoint, &self.options);
        self.slots[parent_id] = Some(parent);

        let (mut child, grand_children) = result?;
        child.parent = Some(parent_id);

        // Grand-child catalogs below the new mountpoint now belong to the
        // child; swap their indices over.
        let mut moved = Vec::new();
        {
            let parent_ref = self.catalog_mut(parent_id)?;
            for path in &grand_children {
                if let Some(grand_id) = parent_ref.children.remove(path) {
                    moved.push((path.clone(), grand_id));
                }
            }
        }
        for (path, grand_id) in &moved {
            child.children.insert(path.clone(), *grand_id);
        }

        let child_id = self.insert(child);
        for (_, grand_id) in &moved {
            if let Some(grand) = self.slots.get_mut(*grand_id).and_then(|s| s.as_mut()) {
                grand.parent = Some(child_id);
            }
        }
        self.catalog_mut(parent_id)?
            .children
            .insert(mountpoint.to_string(), child_id);

        info!(
            "partitioned '{}' into new nested catalog '{}'",
            mountpoint, child_db_path
        );
        Ok(child_id)
    }

    /// Folds catalog `child_id` back into its parent.  Returns the dangling
    /// child's database path.  A failure after the flush step leaves both
    /// databases potentially inconsistent; the caller must treat it as
    /// publish-fatal.
    pub fn merge(&mut self, child_id: CatalogId) -> CatalogResult<String> {
        let mut child = self.take(child_id)?;
        let parent_id = match child.parent {
            Some(parent_id) => parent_id,
            None => {
                self.slots[child_id] = Some(child);
                return Err(CatalogError::InvariantViolation(
                    "the root catalog cannot be merged".to_string(),
                ));
            }
        };
        let mut parent = match self.take(parent_id) {
            Ok(parent) => parent,
            Err(e) => {
                self.slots[child_id] = Some(child);
                return Err(e);
            }
        };

        let result = merge_into(&mut child, &mut parent);
        self.slots[parent_id] = Some(parent);
        if let Err(e) = result {
            self.slots[child_id] = Some(child);
            return Err(e);
        }

        let mountpoint = child.mountpoint().to_string();
        let db_path = child.db_path().to_string();
        let grand_children: Vec<(String, CatalogId)> = child
            .children
            .iter()
            .map(|(path, id)| (path.clone(), *id))
            .collect();
        drop(child);

        for (path, grand_id) in grand_children {
            if let Some(grand) = self.slots.get_mut(grand_id).and_then(|s| s.as_mut()) {
                grand.parent = Some(parent_id);
            }
            self.catalog_mut(parent_id)?.children.insert(path, grand_id);
        }
        self.catalog_mut(parent_id)?.children.remove(&mountpoint);

        info!("merged nested catalog '{}' into its parent", mountpoint);
        Ok(db_path)
    }

    /// Recomputes the `self_*` counters of the subtree rooted at `id`
    /// bottom-up and rolls `subtree_* = self_* + sum(children.subtree_*)`
    /// upwards.
    pub fn update_statistics(&mut self, id: CatalogId) -> CatalogResult<()> {
        let child_ids: Vec<CatalogId> = self.catalog(id)?.child_ids().values().copied().collect();
        for child_id in &child_ids {
            self.update_statistics(*child_id)?;
        }
        self.catalog_mut(id)?.refresh_self_counters()?;

        let mut sums = [0i64; 4];
        for child_id in &child_ids {
            let child = self.catalog(*child_id)?;
            sums[0] += child.counter("subtree_regular")?;
            sums[1] += child.counter("subtree_symlink")?;
            sums[2] += child.counter("subtree_dir")?;
            sums[3] += child.counter("subtree_nested")?;
        }

        let catalog = self.catalog_mut(id)?;
        let self_regular = catalog.counter("self_regular")?;
        let self_symlink = catalog.counter("self_symlink")?;
        let self_dir = catalog.counter("self_dir")?;
        let self_nested = catalog.counter("self_nested")?;
        catalog.set_counter("subtree_regular", self_regular + sums[0])?;
        catalog.set_counter("subtree_symlink", self_symlink + sums[1])?;
        catalog.set_counter("subtree_dir", self_dir + sums[2])?;
        catalog.set_counter("subtree_nested", self_nested + sums[3])?;
        Ok(())
    }
}

/// Partition steps 1-4.  The transition flag is set before the subtree
/// moves so the transition point itself stays behind; the child root exists
/// before anything becomes listable in the child.
fn partition_into(
    parent: &mut WritableCatalog,
    child_db_path: &str,
    mountpoint: &str,
    options: &CatalogOptions,
) -> CatalogResult<(WritableCatalog, Vec<String>)> {
    let transition = parent.lookup_path(mountpoint)?.ok_or_else(|| {
        warn!(
            "failed to create nested catalog mountpoint '{}' in catalog '{}'",
            mountpoint,
            parent.mountpoint()
        );
        CatalogError::NotFound(format!("transition point '{}' not found", mountpoint))
    })?;
    if !transition.is_directory() {
        return Err(CatalogError::InvariantViolation(format!(
            "transition point '{}' is not a directory",
            mountpoint
        )));
    }
    if transition.is_nested_root {
        return Err(CatalogError::InvariantViolation(format!(
            "transition point '{}' is already a nested catalog root",
            mountpoint
        )));
    }
    if transition.is_nested_mountpoint {
        return Err(CatalogError::InvariantViolation(format!(
            "transition point '{}' is already a nested catalog mountpoint",
            mountpoint
        )));
    }

    // The child root is the same directory entry with the root mark; its
    // attributes stay equal to the parent-side mountpoint entry.
    let mut root_entry = transition.clone();
    root_entry.is_nested_root = true;
    root_entry.is_nested_mountpoint = false;
    root_entry.row_id = 0;
    CatalogDatabase::create(child_db_path, &root_entry, mountpoint)?;
    let mut child = WritableCatalog::open(child_db_path, options.clone())?;

    parent.begin_transaction()?;
    child.begin_transaction()?;

    let mut mount_entry = transition;
    mount_entry.is_nested_mountpoint = true;
    parent.update_entry(&mount_entry, &PathHash::from_path(mountpoint))?;

    let mut grand_children = Vec::new();
    move_subtree(parent, &mut child, mountpoint, &mut grand_children)?;

    // Nested catalogs below the moved subtree are re-referenced from the
    // child; their stored content hashes travel with them.
    for grand in &grand_children {
        let sha1 = parent.nested_catalog_hash(grand)?.unwrap_or_default();
        parent.remove_nested_catalog(grand)?;
        child.insert_nested_catalog(grand, &sha1)?;
    }

    // The child's serialized hash is unknown until it is first published.
    parent.insert_nested_catalog(mountpoint, "")?;

    parent.refresh_self_counters()?;
    child.refresh_self_counters()?;
    child.commit()?;
    parent.commit()?;

    Ok((child, grand_children))
}

/// Depth-first move of everything below `directory` from `parent` into
/// `child`.  Grand-child mountpoints are copied but not descended into:
/// the rows below them belong to an existing nested catalog.
fn move_subtree(
    parent: &mut WritableCatalog,
    child: &mut WritableCatalog,
    directory: &str,
    grand_children: &mut Vec<String>,
) -> CatalogResult<()> {
    let listing = parent.listing_path(directory)?;
    for entry in listing {
        let full_path = format!("{}/{}", directory, entry.name);
        child.add_entry(&entry, &full_path, directory)?;

        let path_hash = PathHash::from_path(&full_path);
        for chunk in parent.chunks_for(&path_hash)? {
            child.add_chunk(&path_hash, &chunk)?;
        }

        if entry.is_nested_mountpoint {
            grand_children.push(full_path.clone());
        } else if entry.is_directory() {
            move_subtree(parent, child, &full_path, grand_children)?;
        }

        parent.remove_chunks(&path_hash)?;
        parent.remove_entry(&full_path)?;
    }
    Ok(())
}

/// Merge steps 1-8.  Entry identity (the path hash) is stable across the
/// boundary; only the root entry's flags change.
fn merge_into(child: &mut WritableCatalog, parent: &mut WritableCatalog) -> CatalogResult<()> {
    let mountpoint = child.mountpoint().to_string();

    // 1. disjoin the child's hardlink group ids from the parent's
    let offset = (parent.max_link_id()? as i64) << 32;
    child.renumber_hardlinks(offset)?;

    // 2. the mount entry is replaced by the child's root entry during copy
    parent.remove_entry(&mountpoint)?;

    // 3. ATTACH cannot see uncommitted data from the attacher
    if child.is_dirty() {
        child.commit()?;
    }
    if parent.is_dirty() {
        parent.commit()?;
    }

    // 4+5. bulk copy of entries and chunks into the attached parent
    child.db().attach(parent.db_path(), "other")?;
    let copied = child
        .db()
        .conn()
        .execute_batch(
            "INSERT INTO other.catalog SELECT * FROM main.catalog; \
             INSERT INTO other.chunks SELECT * FROM main.chunks;",
        )
        .map_err(|e| {
            warn!(
                "failed to copy entries of '{}' into the parent catalog: {}",
                mountpoint, e
            );
            CatalogError::Execute(e.to_string())
        });
    let detached = child.db().detach("other");
    copied?;
    detached?;
    parent.set_dirty();

    // 6. the just-copied child root becomes an ordinary directory
    let old_root = parent.lookup_path(&mountpoint)?.ok_or_else(|| {
        CatalogError::InvariantViolation(format!(
            "root entry of merged catalog '{}' not found in the parent",
            mountpoint
        ))
    })?;
    if !old_root.is_directory() || !old_root.is_nested_root || old_root.is_nested_mountpoint {
        return Err(CatalogError::InvariantViolation(format!(
            "merged root entry '{}' carries inconsistent flags",
            mountpoint
        )));
    }
    let mut plain_root = old_root;
    plain_root.is_nested_root = false;
    parent.update_entry(&plain_root, &PathHash::from_path(&mountpoint))?;

    // 7. nested references of the child move up
    for (path, sha1) in child.list_nested_catalogs()? {
        parent.insert_nested_catalog(&path, &sha1)?;
    }

    // 8. drop the reference; the child is dangling from here on
    parent.remove_nested_catalog(&mountpoint)?;

    parent.refresh_self_counters()?;
    parent.commit()?;
    Ok(())
}
