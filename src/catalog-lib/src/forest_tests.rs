#[cfg(test)]
mod tests {
    use crate::{
        CatalogError, CatalogForest, CatalogId, CatalogOptions, ContentHash, DirectoryEntry,
        FileChunk, PathHash, FLAG_DIR,
    };
    use tempfile::TempDir;

    fn root_entry() -> DirectoryEntry {
        DirectoryEntry::new_directory("", 0o755, 0, 0, 0)
    }

    fn dir_entry(name: &str) -> DirectoryEntry {
        DirectoryEntry::new_directory(name, 0o755, 0, 0, 100)
    }

    fn file_entry(name: &str, size: u64) -> DirectoryEntry {
        DirectoryEntry::new_regular(
            name,
            size,
            ContentHash::digest_of(name.as_bytes()),
            0o644,
            0,
            0,
            100,
        )
    }

    fn hardlink_entry(name: &str, group: u32, linkcount: u32) -> DirectoryEntry {
        let mut entry = file_entry(name, 1);
        entry.hardlink_group = group;
        entry.linkcount = linkcount;
        entry
    }

    fn db_file(tmp: &TempDir, name: &str) -> String {
        tmp.path().join(name).to_str().unwrap().to_string()
    }

    /// Root catalog with /a, /a/b, /a/b/c and the file /a/b/d.
    fn create_test_forest() -> (CatalogForest, CatalogId, TempDir) {
        let tmp = TempDir::new().unwrap();
        let mut forest = CatalogForest::new(CatalogOptions::default());
        let root_id = forest
            .create_root(&db_file(&tmp, "root.db"), &root_entry())
            .unwrap();

        let root = forest.catalog_mut(root_id).unwrap();
        root.add_entry(&dir_entry("a"), "/a", "").unwrap();
        root.add_entry(&dir_entry("b"), "/a/b", "/a").unwrap();
        root.add_entry(&dir_entry("c"), "/a/b/c", "/a/b").unwrap();
        root.add_entry(&file_entry("d", 7), "/a/b/d", "/a/b").unwrap();
        root.commit().unwrap();

        (forest, root_id, tmp)
    }

    // ==================== Partition ====================

    #[test]
    fn test_partition_moves_subtree() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();

        let parent = forest.catalog(root_id).unwrap();
        assert!(parent.lookup_path("/a").unwrap().is_some());
        let mount = parent.lookup_path("/a/b").unwrap().unwrap();
        assert!(mount.is_nested_mountpoint);
        assert!(!mount.is_nested_root);
        assert!(parent.lookup_path("/a/b/c").unwrap().is_none());
        assert!(parent.lookup_path("/a/b/d").unwrap().is_none());
        assert_eq!(
            parent.list_nested_catalogs().unwrap(),
            vec![("/a/b".to_string(), String::new())]
        );

        let child = forest.catalog(child_id).unwrap();
        assert_eq!(child.mountpoint(), "/a/b");
        let root = child.lookup_path("/a/b").unwrap().unwrap();
        assert!(root.is_nested_root);
        assert!(!root.is_nested_mountpoint);
        assert!(child.lookup_path("/a/b/c").unwrap().is_some());
        assert!(child.lookup_path("/a/b/d").unwrap().is_some());
        assert!(child.lookup_path("/a").unwrap().is_none());

        // the transition point is one entry on each side, equal attributes
        assert_eq!(mount.name, root.name);
        assert_eq!(mount.mode, root.mode);
        assert_eq!(mount.mtime, root.mtime);
        assert_eq!(mount.uid, root.uid);
        assert_eq!(mount.gid, root.gid);

        // in-memory wiring
        assert_eq!(child.parent_id(), Some(root_id));
        assert_eq!(
            forest.catalog(root_id).unwrap().child_ids().get("/a/b"),
            Some(&child_id)
        );
    }

    #[test]
    fn test_partition_missing_transition_point() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let result = forest.partition(root_id, &db_file(&tmp, "child.db"), "/nope");
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn test_partition_rejects_file_transition_point() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let result = forest.partition(root_id, &db_file(&tmp, "child.db"), "/a/b/d");
        assert!(matches!(result, Err(CatalogError::InvariantViolation(_))));
    }

    #[test]
    fn test_partition_rejects_existing_mountpoint() {
        let (mut forest, root_id, tmp) = create_test_forest();
        forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();
        let result = forest.create_nested_catalog("/a/b", &db_file(&tmp, "child2.db"));
        assert!(matches!(result, Err(CatalogError::InvariantViolation(_))));
    }

    #[test]
    fn test_partition_moves_chunks() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let path_hash = PathHash::from_path("/a/b/d");
        let chunk = FileChunk {
            offset: 0,
            size: 7,
            hash: ContentHash::digest_of(b"d"),
        };
        forest
            .catalog_mut(root_id)
            .unwrap()
            .add_chunk(&path_hash, &chunk)
            .unwrap();

        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();

        assert!(forest
            .catalog(root_id)
            .unwrap()
            .chunks_for(&path_hash)
            .unwrap()
            .is_empty());
        assert_eq!(
            forest
                .catalog(child_id)
                .unwrap()
                .chunks_for(&path_hash)
                .unwrap(),
            vec![chunk]
        );
    }

    #[test]
    fn test_partition_refreshes_self_counters() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();

        let parent = forest.catalog(root_id).unwrap();
        // root, /a and the mountpoint /a/b
        assert_eq!(parent.counter("self_dir").unwrap(), 3);
        assert_eq!(parent.counter("self_regular").unwrap(), 0);
        assert_eq!(parent.counter("self_nested").unwrap(), 1);

        let child = forest.catalog(child_id).unwrap();
        // /a/b/c only: the nested root is not counted
        assert_eq!(child.counter("self_dir").unwrap(), 1);
        assert_eq!(child.counter("self_regular").unwrap(), 1);
        assert_eq!(child.counter("self_nested").unwrap(), 0);
    }

    // ==================== Merge ====================

    #[test]
    fn test_merge_restores_parent() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let child_path = db_file(&tmp, "child.db");
        let child_id = forest.partition(root_id, &child_path, "/a/b").unwrap();

        let dangling = forest.merge(child_id).unwrap();
        assert_eq!(dangling, child_path);

        let parent = forest.catalog(root_id).unwrap();
        assert!(parent.lookup_path("/a").unwrap().is_some());
        let former_root = parent.lookup_path("/a/b").unwrap().unwrap();
        assert_eq!(former_root.database_flags(), FLAG_DIR);
        assert!(parent.lookup_path("/a/b/c").unwrap().is_some());
        assert!(parent.lookup_path("/a/b/d").unwrap().is_some());
        assert!(parent.list_nested_catalogs().unwrap().is_empty());
        assert!(forest.catalog(root_id).unwrap().child_ids().is_empty());
        assert!(forest.catalog(child_id).is_err());
    }

    #[test]
    fn test_merge_root_is_rejected() {
        let (mut forest, root_id, _tmp) = create_test_forest();
        let result = forest.merge(root_id);
        assert!(matches!(result, Err(CatalogError::InvariantViolation(_))));
        // the root stays attached
        assert!(forest.catalog(root_id).is_ok());
    }

    #[test]
    fn test_merge_moves_chunks_back() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let path_hash = PathHash::from_path("/a/b/d");
        let chunk = FileChunk {
            offset: 0,
            size: 7,
            hash: ContentHash::digest_of(b"d"),
        };
        forest
            .catalog_mut(root_id)
            .unwrap()
            .add_chunk(&path_hash, &chunk)
            .unwrap();

        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();
        forest.merge(child_id).unwrap();

        assert_eq!(
            forest
                .catalog(root_id)
                .unwrap()
                .chunks_for(&path_hash)
                .unwrap(),
            vec![chunk]
        );
    }

    #[test]
    fn test_partition_then_merge_is_identity_modulo_renumbering() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let paths = ["", "/a", "/a/b", "/a/b/c", "/a/b/d"];

        let mut before = Vec::new();
        for path in paths {
            before.push(forest.catalog(root_id).unwrap().lookup_path(path).unwrap().unwrap());
        }

        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();
        forest.merge(child_id).unwrap();

        for (path, old) in paths.iter().zip(before) {
            let mut new = forest
                .catalog(root_id)
                .unwrap()
                .lookup_path(path)
                .unwrap()
                .unwrap();
            new.row_id = old.row_id;
            assert_eq!(new, old, "entry at '{}' changed across the round trip", path);
        }
    }

    // ==================== Hardlink renumbering ====================

    #[test]
    fn test_merge_renumbers_child_hardlink_groups() {
        let (mut forest, root_id, tmp) = create_test_forest();
        {
            let root = forest.catalog_mut(root_id).unwrap();
            root.add_entry(&hardlink_entry("h1", 3, 2), "/h1", "").unwrap();
            root.add_entry(&hardlink_entry("h2", 3, 2), "/h2", "").unwrap();
            root.add_entry(&hardlink_entry("x1", 1, 2), "/a/b/x1", "/a/b")
                .unwrap();
            root.add_entry(&hardlink_entry("x2", 1, 2), "/a/b/x2", "/a/b")
                .unwrap();
            root.commit().unwrap();
        }

        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();
        forest.merge(child_id).unwrap();

        let parent = forest.catalog(root_id).unwrap();
        for path in ["/a/b/x1", "/a/b/x2"] {
            let entry = parent.lookup_path(path).unwrap().unwrap();
            assert_eq!(entry.hardlink_group, 4, "former child group moves past 3");
            assert_eq!(entry.linkcount, 2, "link counts are untouched");
        }
        for path in ["/h1", "/h2"] {
            let entry = parent.lookup_path(path).unwrap().unwrap();
            assert_eq!(entry.hardlink_group, 3, "parent group keeps its id");
        }
    }

    // ==================== Grand-children ====================

    #[test]
    fn test_partition_rehomes_grand_children_with_hash() {
        let tmp = TempDir::new().unwrap();
        let mut forest = CatalogForest::new(CatalogOptions::default());
        let root_id = forest
            .create_root(&db_file(&tmp, "root.db"), &root_entry())
            .unwrap();
        {
            let root = forest.catalog_mut(root_id).unwrap();
            root.add_entry(&dir_entry("a"), "/a", "").unwrap();
            root.add_entry(&dir_entry("b"), "/a/b", "/a").unwrap();
            root.add_entry(&dir_entry("g"), "/a/b/g", "/a/b").unwrap();
            root.add_entry(&file_entry("f", 1), "/a/b/g/f", "/a/b/g")
                .unwrap();
            root.commit().unwrap();
        }

        let grand_id = forest
            .partition(root_id, &db_file(&tmp, "grand.db"), "/a/b/g")
            .unwrap();
        let grand_hash = ContentHash::digest_of(b"serialized grand-child");
        forest
            .catalog_mut(root_id)
            .unwrap()
            .update_nested_catalog("/a/b/g", &grand_hash)
            .unwrap();

        let child_id = forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();

        // the reference moved down one level, hash intact
        let parent = forest.catalog(root_id).unwrap();
        assert_eq!(
            parent.list_nested_catalogs().unwrap(),
            vec![("/a/b".to_string(), String::new())]
        );
        let child = forest.catalog(child_id).unwrap();
        assert_eq!(
            child.nested_catalog_hash("/a/b/g").unwrap(),
            Some(grand_hash.to_hex())
        );

        // the grand-child subtree was not descended into
        assert!(child.lookup_path("/a/b/g").unwrap().is_some());
        assert!(child.lookup_path("/a/b/g/f").unwrap().is_none());
        assert!(forest
            .catalog(grand_id)
            .unwrap()
            .lookup_path("/a/b/g/f")
            .unwrap()
            .is_some());

        // in-memory wiring follows the reference
        assert_eq!(forest.catalog(grand_id).unwrap().parent_id(), Some(child_id));
        assert_eq!(child.child_ids().get("/a/b/g"), Some(&grand_id));

        // merging the middle catalog hands the reference back up
        forest.merge(child_id).unwrap();
        let parent = forest.catalog(root_id).unwrap();
        assert_eq!(
            parent.list_nested_catalogs().unwrap(),
            vec![("/a/b/g".to_string(), grand_hash.to_hex())]
        );
        assert_eq!(forest.catalog(grand_id).unwrap().parent_id(), Some(root_id));
    }

    // ==================== Mediator entry points ====================

    #[test]
    fn test_create_and_remove_nested_catalog_by_path() {
        let (mut forest, root_id, tmp) = create_test_forest();
        let child_id = forest
            .create_nested_catalog("/a/b", &db_file(&tmp, "child.db"))
            .unwrap();
        assert_eq!(forest.catalog(child_id).unwrap().mountpoint(), "/a/b");
        assert_eq!(forest.find_hosting_catalog("/a/b/c").unwrap(), child_id);
        assert_eq!(forest.find_hosting_catalog("/a").unwrap(), root_id);

        let dangling = forest.remove_nested_catalog("/a/b").unwrap();
        assert_eq!(dangling, db_file(&tmp, "child.db"));
        assert!(forest
            .catalog(root_id)
            .unwrap()
            .lookup_path("/a/b/c")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_remove_nested_catalog_requires_mountpoint() {
        let (mut forest, _root_id, _tmp) = create_test_forest();
        let result = forest.remove_nested_catalog("/a/b");
        assert!(matches!(result, Err(CatalogError::NotFound(_))));
    }

    // ==================== Statistics rollup ====================

    #[test]
    fn test_update_statistics_rolls_subtree_counters_up() {
        let (mut forest, root_id, tmp) = create_test_forest();
        forest
            .partition(root_id, &db_file(&tmp, "child.db"), "/a/b")
            .unwrap();

        forest.update_statistics(root_id).unwrap();

        let parent = forest.catalog(root_id).unwrap();
        // parent itself: root, /a, mountpoint /a/b; child adds /a/b/c
        assert_eq!(parent.counter("subtree_dir").unwrap(), 4);
        assert_eq!(parent.counter("subtree_regular").unwrap(), 1);
        assert_eq!(parent.counter("subtree_nested").unwrap(), 1);
    }
}
