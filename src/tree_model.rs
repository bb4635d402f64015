use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::objects::{DirEntry, DirTree, FileEntry, ObjectKind, ObjectStore};
use crate::Digest;

/// result of `MutableTree::lookup` (§4.2).
pub enum Lookup<'a> {
    Dir(&'a MutableTree),
    File(Digest),
    NotFound,
}

/// in-memory overlay of a directory being committed (§4.2). Lives only
/// for the duration of one commit; discarded once serialised into
/// dir-tree/dir-meta objects.
#[derive(Debug, Default)]
pub struct MutableTree {
    metadata_digest: Option<Digest>,
    contents_digest: Option<Digest>,
    files: BTreeMap<String, Digest>,
    subdirs: BTreeMap<String, MutableTree>,
}

impl MutableTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata_digest(&self) -> Option<Digest> {
        self.metadata_digest
    }

    pub fn contents_digest(&self) -> Option<Digest> {
        self.contents_digest
    }

    /// records the already-written dir-meta object's digest for this
    /// directory.
    pub fn set_metadata_checksum(&mut self, digest: Digest) {
        self.metadata_digest = Some(digest);
    }

    /// returns the existing subtree named `name`, or inserts a new empty
    /// one. Fails if a file entry by that name already exists.
    pub fn ensure_dir(&mut self, name: &str) -> Result<&mut MutableTree> {
        if self.files.contains_key(name) {
            return Err(Error::AlreadyExists(format!("file entry '{name}' conflicts with directory")));
        }
        if self.contents_digest.is_some() {
            return Err(Error::InvalidArgument("tree already serialised, cannot be mutated".into()));
        }
        Ok(self.subdirs.entry(name.to_string()).or_default())
    }

    /// inserts or overwrites a file entry. Fails if a directory entry by
    /// that name already exists.
    pub fn replace_file(&mut self, name: &str, digest: Digest) -> Result<()> {
        if self.subdirs.contains_key(name) {
            return Err(Error::AlreadyExists(format!("directory entry '{name}' conflicts with file")));
        }
        if self.contents_digest.is_some() {
            return Err(Error::InvalidArgument("tree already serialised, cannot be mutated".into()));
        }
        self.files.insert(name.to_string(), digest);
        Ok(())
    }

    /// resolves a `/`-separated path within this tree.
    pub fn lookup(&self, path: &str) -> Lookup<'_> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Lookup::Dir(self);
        }
        let (head, rest) = match path.split_once('/') {
            Some((h, r)) => (h, Some(r)),
            None => (path, None),
        };
        match rest {
            None => {
                if let Some(digest) = self.files.get(head) {
                    Lookup::File(*digest)
                } else if let Some(sub) = self.subdirs.get(head) {
                    Lookup::Dir(sub)
                } else {
                    Lookup::NotFound
                }
            }
            Some(rest) => match self.subdirs.get(head) {
                Some(sub) => sub.lookup(rest),
                None => Lookup::NotFound,
            },
        }
    }

    /// serialises this tree (recursing into any unserialised children
    /// first) and writes it to `store`, returning `(contents_digest,
    /// metadata_digest)`. Ordering is lexicographic over both `files` and
    /// `subdirs` names via the `BTreeMap` iteration order.
    pub fn write_tree(&mut self, store: &ObjectStore, in_txn: bool) -> Result<(Digest, Digest)> {
        let metadata_digest = self
            .metadata_digest
            .ok_or_else(|| Error::InvalidArgument("tree has no metadata checksum set".into()))?;

        if let Some(contents_digest) = self.contents_digest {
            return Ok((contents_digest, metadata_digest));
        }

        let mut dir_entries = Vec::with_capacity(self.subdirs.len());
        for (name, sub) in self.subdirs.iter_mut() {
            let (tree_digest, meta_digest) = sub.write_tree(store, in_txn)?;
            dir_entries.push(DirEntry { name: name.clone(), tree_digest, meta_digest });
        }

        let file_entries = self
            .files
            .iter()
            .map(|(name, digest)| FileEntry { name: name.clone(), content_digest: *digest })
            .collect();

        let tree = DirTree::new(file_entries, dir_entries)?;
        let bytes = tree.to_canonical_bytes();
        let digest = tree.digest();
        store.write_metadata(ObjectKind::DirTree, &digest, &bytes, in_txn)?;

        self.contents_digest = Some(digest);
        Ok((digest, metadata_digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoMode;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ObjectStore) {
        let dir = tempdir().unwrap();
        let store = ObjectStore::new(dir.path().join("objects"), dir.path().join("tmp"), RepoMode::Bare, true, 6);
        (dir, store)
    }

    #[test]
    fn ensure_dir_conflicts_with_file() {
        let mut tree = MutableTree::new();
        tree.replace_file("a", Digest::of(b"a")).unwrap();
        assert!(tree.ensure_dir("a").is_err());
    }

    #[test]
    fn replace_file_conflicts_with_dir() {
        let mut tree = MutableTree::new();
        tree.ensure_dir("a").unwrap();
        assert!(tree.replace_file("a", Digest::of(b"a")).is_err());
    }

    #[test]
    fn lookup_finds_nested_file() {
        let mut tree = MutableTree::new();
        let sub = tree.ensure_dir("a").unwrap();
        sub.replace_file("b.txt", Digest::of(b"b")).unwrap();

        match tree.lookup("a/b.txt") {
            Lookup::File(d) => assert_eq!(d, Digest::of(b"b")),
            _ => panic!("expected file"),
        }
        assert!(matches!(tree.lookup("a"), Lookup::Dir(_)));
        assert!(matches!(tree.lookup("nope"), Lookup::NotFound));
    }

    #[test]
    fn write_tree_requires_metadata_checksum() {
        let (_dir, store) = store();
        let mut tree = MutableTree::new();
        tree.replace_file("a", Digest::of(b"a")).unwrap();
        assert!(tree.write_tree(&store, false).is_err());
    }

    #[test]
    fn write_tree_recurses_and_is_idempotent() {
        let (_dir, store) = store();
        let mut tree = MutableTree::new();
        tree.set_metadata_checksum(Digest::of(b"root-meta"));
        tree.replace_file("b", Digest::of(b"b-content")).unwrap();
        {
            let sub = tree.ensure_dir("a").unwrap();
            sub.set_metadata_checksum(Digest::of(b"a-meta"));
            sub.replace_file("c", Digest::of(b"c-content")).unwrap();
        }

        let (digest1, meta1) = tree.write_tree(&store, false).unwrap();
        let (digest2, meta2) = tree.write_tree(&store, false).unwrap();
        assert_eq!(digest1, digest2);
        assert_eq!(meta1, meta2);
        assert!(store.has(ObjectKind::DirTree, &digest1));
    }
}
