use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::record::{Reader, Writer};
use crate::Digest;

/// extended attribute (name + value), carried on dir-meta records and on
/// the archive-mode file-content header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

impl Xattr {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// sorts by name (canonical ordering for xattr arrays) and writes.
fn write_xattrs(w: &mut Writer, xattrs: &[Xattr]) {
    let mut sorted: Vec<&Xattr> = xattrs.iter().collect();
    sorted.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
    w.write_u32(sorted.len() as u32);
    for x in sorted {
        w.write_str(&x.name);
        w.write_bytes(&x.value);
    }
}

fn read_xattrs(r: &mut Reader) -> Result<Vec<Xattr>> {
    let n = r.read_u32()?;
    let mut out = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let name = r.read_str()?;
        let value = r.read_bytes()?;
        out.push(Xattr { name, value });
    }
    Ok(out)
}

/// an untyped `string -> value` metadata dict, the Rust analog of the
/// original's `a{sv}` (§9: "keep an untyped dict<string, value> variant
/// only for commit metadata").
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MetadataDict(pub BTreeMap<String, MetadataValue>);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetadataValue {
    Str(String),
    Bytes(Vec<u8>),
    I64(i64),
    U64(u64),
    StringArray(Vec<String>),
    /// an array of opaque byte blobs — how signature metadata keys
    /// (`ostree.sign.ed25519`, `ostree.gpgsigs`) are represented: each
    /// element is one detached signature.
    ByteArrayArray(Vec<Vec<u8>>),
    /// `ostree.sizes`: one (digest, archived_size, unpacked_size) triple
    /// per object referenced by the commit, sorted by digest.
    SizeEntries(Vec<(Digest, u64, u64)>),
}

const TAG_STR: u8 = 0;
const TAG_BYTES: u8 = 1;
const TAG_I64: u8 = 2;
const TAG_U64: u8 = 3;
const TAG_STRING_ARRAY: u8 = 4;
const TAG_BYTE_ARRAY_ARRAY: u8 = 5;
const TAG_SIZE_ENTRIES: u8 = 6;

impl MetadataValue {
    fn write(&self, w: &mut Writer) {
        match self {
            MetadataValue::Str(s) => {
                w.write_u8(TAG_STR);
                w.write_str(s);
            }
            MetadataValue::Bytes(b) => {
                w.write_u8(TAG_BYTES);
                w.write_bytes(b);
            }
            MetadataValue::I64(v) => {
                w.write_u8(TAG_I64);
                w.write_i64(*v);
            }
            MetadataValue::U64(v) => {
                w.write_u8(TAG_U64);
                w.write_u64(*v);
            }
            MetadataValue::StringArray(items) => {
                w.write_u8(TAG_STRING_ARRAY);
                w.write_u32(items.len() as u32);
                for s in items {
                    w.write_str(s);
                }
            }
            MetadataValue::ByteArrayArray(items) => {
                w.write_u8(TAG_BYTE_ARRAY_ARRAY);
                w.write_u32(items.len() as u32);
                for b in items {
                    w.write_bytes(b);
                }
            }
            MetadataValue::SizeEntries(entries) => {
                w.write_u8(TAG_SIZE_ENTRIES);
                w.write_u32(entries.len() as u32);
                for (digest, archived, unpacked) in entries {
                    w.write_digest(digest);
                    w.write_u64(*archived);
                    w.write_u64(*unpacked);
                }
            }
        }
    }

    fn read(r: &mut Reader) -> Result<Self> {
        match r.read_u8()? {
            TAG_STR => Ok(MetadataValue::Str(r.read_str()?)),
            TAG_BYTES => Ok(MetadataValue::Bytes(r.read_bytes()?)),
            TAG_I64 => Ok(MetadataValue::I64(r.read_i64()?)),
            TAG_U64 => Ok(MetadataValue::U64(r.read_u64()?)),
            TAG_STRING_ARRAY => {
                let n = r.read_u32()?;
                let mut out = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    out.push(r.read_str()?);
                }
                Ok(MetadataValue::StringArray(out))
            }
            TAG_BYTE_ARRAY_ARRAY => {
                let n = r.read_u32()?;
                let mut out = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    out.push(r.read_bytes()?);
                }
                Ok(MetadataValue::ByteArrayArray(out))
            }
            TAG_SIZE_ENTRIES => {
                let n = r.read_u32()?;
                let mut out = Vec::with_capacity(n as usize);
                for _ in 0..n {
                    let digest = r.read_digest()?;
                    let archived = r.read_u64()?;
                    let unpacked = r.read_u64()?;
                    out.push((digest, archived, unpacked));
                }
                Ok(MetadataValue::SizeEntries(out))
            }
            other => Err(Error::MalformedObject(format!("unknown metadata value tag {other}"))),
        }
    }
}

impl MetadataDict {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: MetadataValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.0.get(key)
    }

    fn write(&self, w: &mut Writer) {
        // BTreeMap already iterates in key order, satisfying canonical ordering.
        w.write_u32(self.0.len() as u32);
        for (k, v) in &self.0 {
            w.write_str(k);
            v.write(w);
        }
    }

    fn read(r: &mut Reader) -> Result<Self> {
        let n = r.read_u32()?;
        let mut map = BTreeMap::new();
        for _ in 0..n {
            let k = r.read_str()?;
            let v = MetadataValue::read(r)?;
            map.insert(k, v);
        }
        Ok(Self(map))
    }
}

/// `dir-meta` object: ownership/mode/xattrs shared by a directory (and,
/// in archive/bare-user modes, by regular files and symlinks too).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirMeta {
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub xattrs: Vec<Xattr>,
}

impl DirMeta {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.uid).write_u32(self.gid).write_u32(self.mode);
        write_xattrs(&mut w, &self.xattrs);
        w.into_bytes()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let uid = r.read_u32()?;
        let gid = r.read_u32()?;
        let mode = r.read_u32()?;
        let xattrs = read_xattrs(&mut r)?;
        r.expect_end()?;
        Ok(Self { uid, gid, mode, xattrs })
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.to_canonical_bytes())
    }
}

/// one entry in a `dir-tree`'s `files` array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub content_digest: Digest,
}

/// one entry in a `dir-tree`'s `dirs` array.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub tree_digest: Digest,
    pub meta_digest: Digest,
}

/// `dir-tree` object: a directory listing, ordered lexicographically by
/// name within both arrays independently (§3).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct DirTree {
    pub files: Vec<FileEntry>,
    pub dirs: Vec<DirEntry>,
}

impl DirTree {
    /// builds a tree from unordered entries, sorting by name (canonical
    /// ordering is part of the serialisation, not left to the caller).
    pub fn new(mut files: Vec<FileEntry>, mut dirs: Vec<DirEntry>) -> Result<Self> {
        validate_names(files.iter().map(|f| f.name.as_str()))?;
        validate_names(dirs.iter().map(|d| d.name.as_str()))?;
        files.sort_by(|a, b| a.name.cmp(&b.name));
        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { files, dirs })
    }

    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u32(self.files.len() as u32);
        for f in &self.files {
            w.write_str(&f.name);
            w.write_digest(&f.content_digest);
        }
        w.write_u32(self.dirs.len() as u32);
        for d in &self.dirs {
            w.write_str(&d.name);
            w.write_digest(&d.tree_digest);
            w.write_digest(&d.meta_digest);
        }
        w.into_bytes()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let nf = r.read_u32()?;
        let mut files = Vec::with_capacity(nf as usize);
        for _ in 0..nf {
            let name = r.read_str()?;
            let content_digest = r.read_digest()?;
            files.push(FileEntry { name, content_digest });
        }
        let nd = r.read_u32()?;
        let mut dirs = Vec::with_capacity(nd as usize);
        for _ in 0..nd {
            let name = r.read_str()?;
            let tree_digest = r.read_digest()?;
            let meta_digest = r.read_digest()?;
            dirs.push(DirEntry { name, tree_digest, meta_digest });
        }
        r.expect_end()?;
        Ok(Self { files, dirs })
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.to_canonical_bytes())
    }
}

/// names are non-empty, contain neither `/` nor NUL, and are not `.`/`..` (§3).
fn validate_names<'a>(names: impl Iterator<Item = &'a str>) -> Result<()> {
    for name in names {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
            return Err(Error::InvalidArgument(format!("invalid tree entry name: {name:?}")));
        }
    }
    Ok(())
}

/// `commit` object (§3): the root record naming a tree and a parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub metadata: MetadataDict,
    pub parent: Option<Digest>,
    pub related_refs: Vec<(String, Digest)>,
    pub subject: String,
    pub body: String,
    pub timestamp: i64,
    pub root_tree_digest: Digest,
    pub root_meta_digest: Digest,
}

impl Commit {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.metadata.write(&mut w);
        w.write_opt_digest(self.parent.as_ref());
        w.write_u32(self.related_refs.len() as u32);
        for (name, digest) in &self.related_refs {
            w.write_str(name);
            w.write_digest(digest);
        }
        w.write_str(&self.subject);
        w.write_str(&self.body);
        w.write_i64(self.timestamp);
        w.write_digest(&self.root_tree_digest);
        w.write_digest(&self.root_meta_digest);
        w.into_bytes()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let metadata = MetadataDict::read(&mut r)?;
        let parent = r.read_opt_digest()?;
        let n = r.read_u32()?;
        let mut related_refs = Vec::with_capacity(n as usize);
        for _ in 0..n {
            let name = r.read_str()?;
            let digest = r.read_digest()?;
            related_refs.push((name, digest));
        }
        let subject = r.read_str()?;
        let body = r.read_str()?;
        let timestamp = r.read_i64()?;
        let root_tree_digest = r.read_digest()?;
        let root_meta_digest = r.read_digest()?;
        r.expect_end()?;
        Ok(Self {
            metadata,
            parent,
            related_refs,
            subject,
            body,
            timestamp,
            root_tree_digest,
            root_meta_digest,
        })
    }

    pub fn digest(&self) -> Digest {
        Digest::of(&self.to_canonical_bytes())
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

/// `commit-meta` object: detached metadata dict keyed by commit digest
/// (signatures live here, not on the commit object itself).
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct CommitMeta(pub MetadataDict);

impl CommitMeta {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        self.0.write(&mut w);
        w.into_bytes()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let dict = MetadataDict::read(&mut r)?;
        r.expect_end()?;
        Ok(Self(dict))
    }
}

/// `tombstone-commit` object: a minimal record marking a commit digest as
/// deleted (I6: precludes refetching unless removed).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TombstoneCommit {
    pub commit_digest: Digest,
}

impl TombstoneCommit {
    pub fn to_canonical_bytes(&self) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_digest(&self.commit_digest);
        w.into_bytes()
    }

    pub fn from_canonical_bytes(bytes: &[u8]) -> Result<Self> {
        let mut r = Reader::new(bytes);
        let commit_digest = r.read_digest()?;
        r.expect_end()?;
        Ok(Self { commit_digest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirmeta_roundtrip() {
        let m = DirMeta {
            uid: 1000,
            gid: 1000,
            mode: 0o755,
            xattrs: vec![Xattr::new("security.selinux", b"label".to_vec())],
        };
        let bytes = m.to_canonical_bytes();
        assert_eq!(DirMeta::from_canonical_bytes(&bytes).unwrap(), m);
    }

    #[test]
    fn dirmeta_xattr_order_independent() {
        let a = DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o644,
            xattrs: vec![Xattr::new("b", vec![2]), Xattr::new("a", vec![1])],
        };
        let b = DirMeta {
            uid: 0,
            gid: 0,
            mode: 0o644,
            xattrs: vec![Xattr::new("a", vec![1]), Xattr::new("b", vec![2])],
        };
        assert_eq!(a.to_canonical_bytes(), b.to_canonical_bytes());
    }

    #[test]
    fn dirtree_rejects_bad_names() {
        let bad = FileEntry { name: "..".into(), content_digest: Digest::of(b"x") };
        assert!(DirTree::new(vec![bad], vec![]).is_err());
    }

    #[test]
    fn dirtree_sorts_and_roundtrips() {
        let files = vec![
            FileEntry { name: "b".into(), content_digest: Digest::of(b"b") },
            FileEntry { name: "a".into(), content_digest: Digest::of(b"a") },
        ];
        let tree = DirTree::new(files, vec![]).unwrap();
        assert_eq!(tree.files[0].name, "a");
        assert_eq!(tree.files[1].name, "b");

        let bytes = tree.to_canonical_bytes();
        assert_eq!(DirTree::from_canonical_bytes(&bytes).unwrap(), tree);
    }

    #[test]
    fn commit_roundtrip_with_metadata() {
        let mut metadata = MetadataDict::new();
        metadata.insert("ostree.sizes", MetadataValue::SizeEntries(vec![(Digest::of(b"x"), 10, 20)]));
        let commit = Commit {
            metadata,
            parent: Some(Digest::of(b"parent")),
            related_refs: vec![("heads/main".into(), Digest::of(b"main"))],
            subject: "subject".into(),
            body: "body".into(),
            timestamp: 0,
            root_tree_digest: Digest::of(b"tree"),
            root_meta_digest: Digest::of(b"meta"),
        };
        let bytes = commit.to_canonical_bytes();
        assert_eq!(Commit::from_canonical_bytes(&bytes).unwrap(), commit);
    }

    #[test]
    fn root_commit_has_no_parent() {
        let commit = Commit {
            metadata: MetadataDict::new(),
            parent: None,
            related_refs: vec![],
            subject: String::new(),
            body: String::new(),
            timestamp: 0,
            root_tree_digest: Digest::of(b"t"),
            root_meta_digest: Digest::of(b"m"),
        };
        assert!(commit.is_root());
    }

    #[test]
    fn tombstone_roundtrip() {
        let t = TombstoneCommit { commit_digest: Digest::of(b"c") };
        let bytes = t.to_canonical_bytes();
        assert_eq!(TombstoneCommit::from_canonical_bytes(&bytes).unwrap(), t);
    }
}
