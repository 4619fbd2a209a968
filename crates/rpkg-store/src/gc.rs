use crate::cache::UpstreamCache;
use crate::layout::StoreLayout;
use crate::objects::ObjectStore;
use crate::revisions::RevisionStore;
use crate::StoreError;
use rpkg_schema::TreeDigest;
use std::collections::HashSet;

pub struct GarbageCollector {
    layout: StoreLayout,
}

#[derive(Debug, Default)]
pub struct GcReport {
    pub orphaned_cache_entries: Vec<String>,
    pub orphaned_objects: Vec<String>,
    pub removed_cache_entries: usize,
    pub removed_objects: usize,
}

impl GarbageCollector {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn collect(&self, dry_run: bool, prune_cache: bool) -> Result<GcReport, StoreError> {
        self.collect_with_cancel(dry_run, prune_cache, || false)
    }

    /// Remove objects not reachable from any revision record or upstream
    /// cache entry. With `prune_cache`, cache entries whose lock no revision
    /// records are dropped first, so their trees become collectable too.
    pub fn collect_with_cancel(
        &self,
        dry_run: bool,
        prune_cache: bool,
        should_stop: impl Fn() -> bool,
    ) -> Result<GcReport, StoreError> {
        let revisions = RevisionStore::new(self.layout.clone());
        let cache = UpstreamCache::new(self.layout.clone());
        let objects = ObjectStore::new(self.layout.clone());

        let mut report = GcReport::default();

        let all_revisions = revisions.list()?;
        let mut live_trees: HashSet<String> = HashSet::new();
        let mut live_locks: HashSet<String> = HashSet::new();

        for rev in &all_revisions {
            live_trees.insert(rev.tree_digest.to_string());
            if let Some(lock) = rev.upstream_lock() {
                live_locks.insert(lock.cache_key());
            }
            for record in &rev.task_records {
                live_trees.insert(record.tree_digest.to_string());
                if let Some(lock) = &record.lock {
                    live_locks.insert(lock.cache_key());
                }
            }
        }

        let mut pruned = HashSet::new();
        for entry in cache.list()? {
            let key = entry.lock.cache_key();
            if prune_cache && !live_locks.contains(&key) {
                report.orphaned_cache_entries.push(key.clone());
                pruned.insert(key);
                if !dry_run && !should_stop() {
                    cache.remove(&entry.lock)?;
                    report.removed_cache_entries += 1;
                }
            } else {
                live_trees.insert(entry.tree_digest.to_string());
            }
        }

        let mut live_objects: HashSet<String> = HashSet::new();
        for digest in &live_trees {
            match objects.get_manifest(&TreeDigest::new(digest.as_str())) {
                Ok(manifest) => {
                    live_objects.insert(digest.clone());
                    for hash in manifest.entries.values() {
                        live_objects.insert(hash.to_string());
                    }
                }
                Err(e) => {
                    tracing::warn!("tree {digest} is referenced but unreadable: {e}");
                }
            }
        }

        for hash in objects.list()? {
            if !live_objects.contains(&hash) {
                report.orphaned_objects.push(hash);
            }
        }

        if !dry_run {
            for hash in &report.orphaned_objects {
                if should_stop() {
                    break;
                }
                objects.remove(hash)?;
                report.removed_objects += 1;
            }
        }

        tracing::debug!(
            "gc: {} live trees, {} orphaned objects, {} pruned cache entries",
            live_trees.len(),
            report.orphaned_objects.len(),
            pruned.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpkg_schema::{
        revision_name, GitLock, Lifecycle, PackageRevision, PackageRevisionSpec,
        PackageRevisionStatus, PackageTree, UpstreamLock,
    };
    use std::collections::BTreeMap;

    fn setup() -> (tempfile::TempDir, StoreLayout) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (dir, layout)
    }

    fn revision_with_tree(digest: TreeDigest) -> PackageRevision {
        PackageRevision {
            name: revision_name("blueprint", "foo", "v1"),
            spec: PackageRevisionSpec {
                package_name: "foo".to_owned(),
                revision: "v1".to_owned(),
                repository: "blueprint".to_owned(),
                parent: None,
                lifecycle: Lifecycle::Draft,
                tasks: Vec::new(),
            },
            status: PackageRevisionStatus::default(),
            resource_version: 1,
            created_at: String::new(),
            updated_at: String::new(),
            annotations: BTreeMap::new(),
            tree_digest: digest,
            task_records: Vec::new(),
            superseded: Vec::new(),
            checksum: None,
        }
    }

    fn tree(contents: &str) -> PackageTree {
        PackageTree::from_files([("a.yaml", contents)]).unwrap()
    }

    #[test]
    fn gc_keeps_referenced_and_removes_orphans() {
        let (_dir, layout) = setup();
        let objects = ObjectStore::new(layout.clone());
        let live = objects.put_tree(&tree("live")).unwrap();
        objects.put_tree(&tree("dead")).unwrap();
        RevisionStore::new(layout.clone())
            .put(&revision_with_tree(live.clone()))
            .unwrap();

        let report = GarbageCollector::new(layout).collect(false, false).unwrap();
        assert_eq!(report.removed_objects, 2);
        assert_eq!(objects.get_tree(&live).unwrap(), tree("live"));
    }

    #[test]
    fn gc_dry_run_does_not_remove() {
        let (_dir, layout) = setup();
        let objects = ObjectStore::new(layout.clone());
        objects.put_tree(&tree("dead")).unwrap();

        let report = GarbageCollector::new(layout).collect(true, false).unwrap();
        assert_eq!(report.orphaned_objects.len(), 2);
        assert_eq!(report.removed_objects, 0);
        assert_eq!(objects.list().unwrap().len(), 2);
    }

    #[test]
    fn cache_entries_are_roots_unless_pruned() {
        let (_dir, layout) = setup();
        let objects = ObjectStore::new(layout.clone());
        let cached = objects.put_tree(&tree("cached")).unwrap();
        let lock = UpstreamLock::Git(GitLock {
            repo: "https://x/y.git".to_owned(),
            directory: String::new(),
            git_ref: "c1".to_owned(),
            commit: "c1".to_owned(),
        });
        UpstreamCache::new(layout.clone()).put(&lock, &cached).unwrap();

        let gc = GarbageCollector::new(layout.clone());
        let report = gc.collect(false, false).unwrap();
        assert_eq!(report.removed_objects, 0);

        let report = gc.collect(false, true).unwrap();
        assert_eq!(report.removed_cache_entries, 1);
        assert_eq!(report.removed_objects, 2);
        assert!(UpstreamCache::new(layout).get(&lock).unwrap().is_none());
    }

    #[test]
    fn gc_respects_cancel() {
        let (_dir, layout) = setup();
        let objects = ObjectStore::new(layout.clone());
        objects.put_tree(&tree("dead")).unwrap();
        let report = GarbageCollector::new(layout)
            .collect_with_cancel(false, false, || true)
            .unwrap();
        assert_eq!(report.removed_objects, 0);
    }
}
