//! Ingests a live directory into the `ObjectStore` and assembles commits
//! (§4.3): a recursive directory walk that stages each file/symlink as a
//! content object and each subdirectory as a dir-tree/dir-meta pair, then
//! assembles the commit object naming the root. Same-commit duplicate
//! content is deduplicated by digest rather than by a same-commit hardlink
//! entry kind, since this object model's dir-tree only has `files`/`dirs`
//! (no hardlink entries); uid/gid are stored as plain numbers with no
//! inside/outside namespace remapping layer.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Mutex;

use crate::config::{FreeSpacePolicy, RepoMode};
use crate::error::{Error, IoResultExt, Result};
use crate::fs::{read_symlink_target, read_xattrs, EntryStat, FileType};
use crate::objects::kind::loose_path;
use crate::objects::{DirMeta, MetadataDict, MetadataValue, ObjectKind, ObjectOwnership, ObjectStore, Xattr};
use crate::tree_model::MutableTree;
use crate::Digest;

/// per-entry info handed to a `CommitModifier` filter/xattr callback; a
/// narrower view than `EntryStat` since callers outside this module have
/// no business seeing dev/ino.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub size: u64,
    pub is_dir: bool,
    pub is_symlink: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Allow,
    Skip,
}

/// computes the `security.selinux` xattr for a path; SELinux policy lookup
/// itself is out of scope (§1) — this is only the seam.
pub trait SelinuxPolicy: Send + Sync {
    fn label_for(&self, path: &Path) -> Option<Vec<u8>>;
}

type FilterFn = dyn Fn(&Path, &EntryInfo) -> FilterAction + Send + Sync;
type XattrCallbackFn = dyn Fn(&Path, &EntryInfo) -> Vec<Xattr> + Send + Sync;

/// the modifier options table of §4.3.
#[derive(Default)]
pub struct CommitModifier {
    pub skip_xattrs: bool,
    pub canonical_permissions: bool,
    pub error_on_unlabeled: bool,
    pub generate_sizes: bool,
    pub use_devino_cache: bool,
    pub filter: Option<Box<FilterFn>>,
    pub xattr_callback: Option<Box<XattrCallbackFn>>,
    pub sepolicy: Option<Box<dyn SelinuxPolicy>>,
}

impl CommitModifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn effective_xattrs(&self, path: &Path, info: &EntryInfo, from_disk: Vec<Xattr>) -> Result<Vec<Xattr>> {
        if self.skip_xattrs {
            return Ok(Vec::new());
        }
        let mut xattrs = match &self.xattr_callback {
            Some(cb) => cb(path, info),
            None => from_disk,
        };
        if let Some(policy) = &self.sepolicy {
            match policy.label_for(path) {
                Some(label) => {
                    xattrs.retain(|x| x.name != "security.selinux");
                    xattrs.push(Xattr::new("security.selinux", label));
                }
                None if self.error_on_unlabeled => {
                    return Err(Error::PolicyDenied(format!("no SELinux label for {}", path.display())));
                }
                None => {}
            }
        }
        Ok(xattrs)
    }

    fn canonicalize(&self, uid: u32, gid: u32, mode: u32, is_dir: bool) -> (u32, u32, u32) {
        if !self.canonical_permissions {
            return (uid, gid, mode);
        }
        let type_bits = mode & 0o170000;
        let masked = if is_dir { type_bits | 0o755 } else { type_bits | 0o755 };
        (0, 0, masked)
    }
}

/// free-space gate active during a transaction (§4.3's "Free-space
/// policy"). Shared between `Transaction::prepare` (which creates it from
/// `statvfs`) and `CommitEngine`'s per-object decrement.
pub struct SpaceBudget {
    remaining_blocks: Mutex<u64>,
    block_size: u64,
}

impl SpaceBudget {
    /// `statvfs`-based check at transaction start: reject immediately if
    /// available blocks are already at or below the reserved threshold.
    pub fn from_statvfs(path: &Path, policy: FreeSpacePolicy) -> Result<Self> {
        let stat = nix::sys::statvfs::statvfs(path)
            .map_err(|e| Error::Io { path: path.to_path_buf(), source: std::io::Error::new(std::io::ErrorKind::Other, e) })?;
        let block_size = stat.fragment_size().max(1);
        let total_blocks = stat.blocks();
        let available_blocks = stat.blocks_available();

        let reserved_blocks = match policy {
            FreeSpacePolicy::None => 0,
            FreeSpacePolicy::Percent(p) => (total_blocks as u128 * p as u128 / 100) as u64,
            FreeSpacePolicy::Bytes(bytes) => bytes.div_ceil(block_size),
        };

        if available_blocks <= reserved_blocks {
            return Err(Error::PolicyDenied(format!(
                "insufficient free space: {available_blocks} blocks available, {reserved_blocks} reserved"
            )));
        }

        Ok(Self { remaining_blocks: Mutex::new(available_blocks - reserved_blocks), block_size })
    }

    pub fn unlimited() -> Self {
        Self { remaining_blocks: Mutex::new(u64::MAX), block_size: 1 }
    }

    /// reserves the blocks needed for `size` bytes, atomically. Fails with
    /// `PolicyDenied` if the budget would be exceeded.
    pub fn reserve(&self, size: u64) -> Result<()> {
        let blocks = size.div_ceil(self.block_size.max(1));
        let mut remaining = self.remaining_blocks.lock().unwrap();
        if blocks > *remaining {
            return Err(Error::PolicyDenied(format!(
                "free-space budget exhausted: need {blocks} blocks, {remaining} remain"
            )));
        }
        *remaining -= blocks;
        Ok(())
    }
}

/// maximum size of a metadata-kind object (B1: exactly this many bytes is
/// accepted, one more is rejected).
pub const MAX_METADATA_SIZE: u64 = 10 * 1024 * 1024;

/// streams files/dirs from a live filesystem into the `ObjectStore` and
/// assembles commits (§4.3).
pub struct CommitEngine<'a> {
    store: &'a ObjectStore,
    devino_cache: Mutex<HashMap<(u64, u64), Digest>>,
    sizes: Mutex<Vec<(Digest, u64, u64)>>,
}

impl<'a> CommitEngine<'a> {
    pub fn new(store: &'a ObjectStore) -> Self {
        Self { store, devino_cache: Mutex::new(HashMap::new()), sizes: Mutex::new(Vec::new()) }
    }

    /// recursively walks `source`, writing each file/dir object as needed
    /// and populating `tree` (§4.3). Also writes and records `tree`'s own
    /// dir-meta (derived from `source`'s own stat), so the top-level call
    /// on the commit root produces a tree whose metadata digest is ready
    /// for `write_commit`.
    pub fn write_directory_to_tree(
        &self,
        source: &Path,
        tree: &mut MutableTree,
        modifier: &CommitModifier,
        space: Option<&SpaceBudget>,
    ) -> Result<()> {
        let root_stat = EntryStat::from_path(source)?;
        let root_xattrs = if modifier.skip_xattrs { Vec::new() } else { read_xattrs(source)? };
        let info = EntryInfo {
            uid: root_stat.uid,
            gid: root_stat.gid,
            mode: root_stat.mode,
            size: 0,
            is_dir: true,
            is_symlink: false,
        };
        let xattrs = modifier.effective_xattrs(source, &info, root_xattrs)?;
        let (uid, gid, mode) = modifier.canonicalize(root_stat.uid, root_stat.gid, root_stat.mode, true);
        let meta = DirMeta { uid, gid, mode, xattrs };
        self.write_dirmeta(&meta)?;
        tree.set_metadata_checksum(meta.digest());

        let mut entries: Vec<_> =
            fs::read_dir(source).with_path(source)?.collect::<std::io::Result<Vec<_>>>().with_path(source)?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            let stat = EntryStat::from_path(&path)?;

            let entry_info = EntryInfo {
                uid: stat.uid,
                gid: stat.gid,
                mode: stat.mode,
                size: stat.size,
                is_dir: stat.file_type == FileType::Directory,
                is_symlink: stat.file_type == FileType::Symlink,
            };
            if let Some(filter) = &modifier.filter {
                if filter(&path, &entry_info) == FilterAction::Skip {
                    continue;
                }
            }

            match stat.file_type {
                FileType::Directory => {
                    let subtree = tree.ensure_dir(&name)?;
                    self.write_directory_to_tree(&path, subtree, modifier, space)?;
                }
                FileType::Regular => {
                    if modifier.use_devino_cache && stat.could_be_hardlink() {
                        let cached = self.devino_cache.lock().unwrap().get(&(stat.dev, stat.ino)).copied();
                        if let Some(digest) = cached {
                            tree.replace_file(&name, digest)?;
                            continue;
                        }
                    }
                    let digest = self.write_regular_file(&path, &stat, &entry_info, modifier, space)?;
                    if modifier.use_devino_cache && stat.could_be_hardlink() {
                        self.devino_cache.lock().unwrap().insert((stat.dev, stat.ino), digest);
                    }
                    tree.replace_file(&name, digest)?;
                }
                FileType::Symlink => {
                    let digest = self.write_symlink(&path, &stat, &entry_info, modifier)?;
                    tree.replace_file(&name, digest)?;
                }
                FileType::Other => {
                    return Err(Error::InvalidArgument(format!(
                        "unsupported file type at {}: device/fifo/socket nodes are not modeled by this object store",
                        path.display()
                    )));
                }
            }
        }
        Ok(())
    }

    fn write_dirmeta(&self, meta: &DirMeta) -> Result<()> {
        let bytes = meta.to_canonical_bytes();
        if bytes.len() as u64 > MAX_METADATA_SIZE {
            return Err(Error::PolicyDenied(format!(
                "dir-meta object exceeds metadata size limit: {} > {}",
                bytes.len(),
                MAX_METADATA_SIZE
            )));
        }
        self.store.write_metadata(ObjectKind::DirMeta, &meta.digest(), &bytes, true)?;
        Ok(())
    }

    fn write_regular_file(
        &self,
        path: &Path,
        stat: &EntryStat,
        info: &EntryInfo,
        modifier: &CommitModifier,
        space: Option<&SpaceBudget>,
    ) -> Result<Digest> {
        let from_disk = if modifier.skip_xattrs { Vec::new() } else { read_xattrs(path)? };
        let xattrs = modifier.effective_xattrs(path, info, from_disk)?;
        let (uid, gid, mode) = modifier.canonicalize(stat.uid, stat.gid, stat.mode, false);

        let mut file = File::open(path).with_path(path)?;
        let mut staged = self.store.stage_regfile(uid, gid, mode, &xattrs, Some(stat.size))?;

        let mut buf = [0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = file.read(&mut buf).with_path(path)?;
            if n == 0 {
                break;
            }
            staged.write(&buf[..n])?;
            total += n as u64;
        }
        if total != stat.size {
            return Err(Error::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("expected {} bytes, read {total}", stat.size),
                ),
            });
        }

        if let Some(space) = space {
            space.reserve(total)?;
        }

        let outcome = self.store.finalize_regfile(staged, None, true)?;

        if modifier.generate_sizes {
            let archived = self.on_disk_len(&outcome.digest)?;
            self.sizes.lock().unwrap().push((outcome.digest, archived, total));
        }
        Ok(outcome.digest)
    }

    fn write_symlink(
        &self,
        path: &Path,
        stat: &EntryStat,
        info: &EntryInfo,
        modifier: &CommitModifier,
    ) -> Result<Digest> {
        let from_disk = if modifier.skip_xattrs { Vec::new() } else { read_xattrs(path)? };
        let xattrs = modifier.effective_xattrs(path, info, from_disk)?;
        let (uid, gid, _mode) = modifier.canonicalize(stat.uid, stat.gid, stat.mode, false);
        let target = read_symlink_target(path)?;
        let outcome =
            self.store.finalize_symlink(&target, &ObjectOwnership { uid, gid }, &xattrs, None, true)?;
        Ok(outcome.digest)
    }

    fn on_disk_len(&self, digest: &Digest) -> Result<u64> {
        let path = loose_path(self.store_objects_dir(), ObjectKind::FileContent, digest);
        Ok(fs::metadata(&path).with_path(&path)?.len())
    }

    fn store_objects_dir(&self) -> &Path {
        self.store.objects_dir()
    }

    /// serialises and writes `tree`'s dir-tree/dir-meta pair (§4.3's
    /// `write_tree`). Thin wrapper: `MutableTree` already knows how.
    pub fn write_tree(&self, tree: &mut MutableTree) -> Result<(Digest, Digest)> {
        tree.write_tree(self.store, true)
    }

    /// assembles and writes a commit object (§4.3's `write_commit`).
    #[allow(clippy::too_many_arguments)]
    pub fn write_commit(
        &self,
        parent: Option<Digest>,
        subject: &str,
        body: &str,
        mut metadata: MetadataDict,
        root: (Digest, Digest),
        timestamp: i64,
        related_refs: Vec<(String, Digest)>,
        modifier: &CommitModifier,
    ) -> Result<Digest> {
        if let Some(parent_digest) = parent {
            if !self.store.has(ObjectKind::Commit, &parent_digest) {
                return Err(Error::NotFound(format!("parent commit {parent_digest}")));
            }
        }

        if modifier.generate_sizes {
            let mut entries = self.sizes.lock().unwrap().clone();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            metadata.insert("ostree.sizes", MetadataValue::SizeEntries(entries));
        }

        let commit = crate::objects::Commit {
            metadata,
            parent,
            related_refs,
            subject: subject.to_string(),
            body: body.to_string(),
            timestamp,
            root_tree_digest: root.0,
            root_meta_digest: root.1,
        };
        let bytes = commit.to_canonical_bytes();
        if bytes.len() as u64 > MAX_METADATA_SIZE {
            return Err(Error::PolicyDenied(format!(
                "commit object exceeds metadata size limit: {} > {}",
                bytes.len(),
                MAX_METADATA_SIZE
            )));
        }
        let digest = commit.digest();
        self.store.write_metadata(ObjectKind::Commit, &digest, &bytes, true)?;

        let tombstone_path = loose_path(self.store_objects_dir(), ObjectKind::TombstoneCommit, &digest);
        if tombstone_path.exists() {
            self.store.delete(ObjectKind::TombstoneCommit, &digest)?;
        }

        Ok(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine_store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"), dir.path().join("tmp"), RepoMode::Bare, true, 6);
        (dir, store)
    }

    #[test]
    fn commits_single_file() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("hello.txt"), "world").unwrap();

        let engine = CommitEngine::new(&store);
        let modifier = CommitModifier::new();
        let mut tree = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree, &modifier, None).unwrap();
        let root = engine.write_tree(&mut tree).unwrap();

        let commit_digest = engine
            .write_commit(None, "subject", "body", MetadataDict::new(), root, 0, vec![], &modifier)
            .unwrap();
        assert!(store.has(ObjectKind::Commit, &commit_digest));

        let bytes = store.read_metadata(ObjectKind::DirTree, &root.0).unwrap();
        let parsed = crate::objects::DirTree::from_canonical_bytes(&bytes).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert_eq!(parsed.files[0].name, "hello.txt");
    }

    #[test]
    fn nested_directories_recurse() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir_all(source.join("a/b")).unwrap();
        fs::write(source.join("a/b/file.txt"), "deep").unwrap();
        fs::write(source.join("top.txt"), "top").unwrap();

        let engine = CommitEngine::new(&store);
        let modifier = CommitModifier::new();
        let mut tree = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree, &modifier, None).unwrap();
        let (root_digest, _) = engine.write_tree(&mut tree).unwrap();

        let root = crate::objects::DirTree::from_canonical_bytes(&store.read_metadata(ObjectKind::DirTree, &root_digest).unwrap()).unwrap();
        assert_eq!(root.files[0].name, "top.txt");
        assert_eq!(root.dirs[0].name, "a");
    }

    #[test]
    fn commit_idempotent_for_identical_inputs() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), "x").unwrap();

        let engine = CommitEngine::new(&store);
        let modifier = CommitModifier::new();

        let mut tree1 = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree1, &modifier, None).unwrap();
        let root1 = engine.write_tree(&mut tree1).unwrap();
        let c1 = engine.write_commit(None, "s", "b", MetadataDict::new(), root1, 42, vec![], &modifier).unwrap();

        let mut tree2 = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree2, &modifier, None).unwrap();
        let root2 = engine.write_tree(&mut tree2).unwrap();
        let c2 = engine.write_commit(None, "s", "b", MetadataDict::new(), root2, 42, vec![], &modifier).unwrap();

        assert_eq!(c1, c2);
    }

    #[test]
    fn write_commit_rejects_missing_parent() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();

        let engine = CommitEngine::new(&store);
        let modifier = CommitModifier::new();
        let mut tree = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree, &modifier, None).unwrap();
        let root = engine.write_tree(&mut tree).unwrap();

        let fake_parent = Digest::of(b"nonexistent");
        let result = engine.write_commit(Some(fake_parent), "s", "b", MetadataDict::new(), root, 0, vec![], &modifier);
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[test]
    fn devino_cache_skips_rehash_of_hardlinked_file() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("a"), "shared").unwrap();
        fs::hard_link(source.join("a"), source.join("b")).unwrap();

        let engine = CommitEngine::new(&store);
        let mut modifier = CommitModifier::new();
        modifier.use_devino_cache = true;
        let mut tree = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree, &modifier, None).unwrap();

        assert_eq!(engine.devino_cache.lock().unwrap().len(), 1);
    }

    #[test]
    fn canonical_permissions_zero_ownership() {
        let (dir, store) = engine_store();
        let source = dir.path().join("source");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("f"), "x").unwrap();

        let engine = CommitEngine::new(&store);
        let mut modifier = CommitModifier::new();
        modifier.canonical_permissions = true;
        let mut tree = MutableTree::new();
        engine.write_directory_to_tree(&source, &mut tree, &modifier, None).unwrap();
        let root_meta_digest = tree.metadata_digest().unwrap();
        let meta = DirMeta::from_canonical_bytes(&store.read_metadata(ObjectKind::DirMeta, &root_meta_digest).unwrap()).unwrap();
        assert_eq!(meta.uid, 0);
        assert_eq!(meta.gid, 0);
    }

    #[test]
    fn space_budget_rejects_oversized_write() {
        let budget = SpaceBudget { remaining_blocks: Mutex::new(1), block_size: 512 };
        assert!(budget.reserve(2000).is_err());
    }

    #[test]
    fn space_budget_accepts_within_budget() {
        let budget = SpaceBudget { remaining_blocks: Mutex::new(10), block_size: 512 };
        assert!(budget.reserve(100).is_ok());
    }
}
